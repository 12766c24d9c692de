// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Payload codecs.
//!
//! A [`Decoder`] turns one response body into a lazy, finite sequence of records.
//! The sequence is consumed exactly once, in order, by the poll loop; the first
//! `Err` it yields aborts the rest of the batch.

use crate::errors::{ConfigError, DecodeError};
use crate::record::Record;
use serde::Deserialize;
use serde_json::Value;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;

pub type RecordIter<'a> = Box<dyn Iterator<Item = Result<Record, DecodeError>> + Send + 'a>;

pub trait Decoder: Send + Sync + Debug {
    fn decode<'a>(&'a self, payload: &'a [u8]) -> RecordIter<'a>;
}

/// Codec selection as it appears in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    #[default]
    Json,
    JsonLines,
    Plain,
}

impl Codec {
    #[must_use]
    pub fn decoder(self) -> Arc<dyn Decoder> {
        match self {
            Codec::Json => Arc::new(JsonDecoder),
            Codec::JsonLines => Arc::new(JsonLinesDecoder),
            Codec::Plain => Arc::new(PlainDecoder),
        }
    }
}

impl FromStr for Codec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(Codec::Json),
            "json_lines" | "jsonlines" | "ndjson" => Ok(Codec::JsonLines),
            "plain" | "line" => Ok(Codec::Plain),
            other => Err(ConfigError::Invalid {
                option: "codec",
                reason: format!("unknown codec '{other}', expected json, json_lines or plain"),
            }),
        }
    }
}

/// The whole body is one JSON document: an object, or an array of objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    fn decode<'a>(&'a self, payload: &'a [u8]) -> RecordIter<'a> {
        match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Array(items)) => Box::new(items.into_iter().map(into_record)),
            Ok(value) => Box::new(std::iter::once(into_record(value))),
            Err(err) => Box::new(std::iter::once(Err(DecodeError::Json(err)))),
        }
    }
}

/// One JSON object per line; blank lines are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesDecoder;

impl Decoder for JsonLinesDecoder {
    fn decode<'a>(&'a self, payload: &'a [u8]) -> RecordIter<'a> {
        Box::new(lines(payload).map(|line| {
            serde_json::from_slice::<Value>(line)
                .map_err(DecodeError::Json)
                .and_then(into_record)
        }))
    }
}

/// Each line becomes `{"message": line}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainDecoder;

pub const MESSAGE_FIELD: &str = "message";

impl Decoder for PlainDecoder {
    fn decode<'a>(&'a self, payload: &'a [u8]) -> RecordIter<'a> {
        Box::new(lines(payload).map(|line| -> Result<Record, DecodeError> {
            let text = std::str::from_utf8(line)?;
            let mut record = Record::new();
            record.insert(MESSAGE_FIELD, Value::String(text.to_string()));
            Ok(record)
        }))
    }
}

fn lines(payload: &[u8]) -> impl Iterator<Item = &[u8]> + Send + '_ {
    payload
        .split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
}

fn into_record(value: Value) -> Result<Record, DecodeError> {
    match value {
        Value::Object(fields) => Ok(Record::from(fields)),
        other => Err(DecodeError::NotAnObject(type_name(&other))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collect(decoder: &dyn Decoder, payload: &[u8]) -> Vec<Result<Record, DecodeError>> {
        decoder.decode(payload).collect()
    }

    #[test]
    fn test_json_object_yields_one_record() {
        let records = collect(&JsonDecoder, br#"{"a":1}"#);
        assert_eq!(records.len(), 1);
        let record = records.into_iter().next().unwrap().unwrap();
        assert_eq!(record.get("a"), Some(&json!(1)));
    }

    #[test]
    fn test_json_array_preserves_order() {
        let records: Vec<Record> = JsonDecoder
            .decode(br#"[{"n":1},{"n":2},{"n":3}]"#)
            .collect::<Result<_, _>>()
            .unwrap();
        let ns: Vec<_> = records.iter().map(|r| r.get("n").cloned()).collect();
        assert_eq!(ns, vec![Some(json!(1)), Some(json!(2)), Some(json!(3))]);
    }

    #[test]
    fn test_json_empty_array_yields_nothing() {
        assert!(collect(&JsonDecoder, b"[]").is_empty());
    }

    #[test]
    fn test_json_errors() {
        let malformed = collect(&JsonDecoder, b"{not json");
        assert!(matches!(malformed.as_slice(), [Err(DecodeError::Json(_))]));

        let scalar = collect(&JsonDecoder, b"42");
        assert!(matches!(scalar.as_slice(), [Err(DecodeError::NotAnObject("number"))]));

        let mixed = collect(&JsonDecoder, br#"[{"a":1},"b"]"#);
        assert!(mixed[0].is_ok());
        assert!(matches!(mixed[1], Err(DecodeError::NotAnObject("string"))));
    }

    #[test]
    fn test_json_lines() {
        let payload = b"{\"a\":1}\r\n\n  \n{\"a\":2}\n";
        let records: Vec<Record> = JsonLinesDecoder
            .decode(payload)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].get("a"), Some(&json!(2)));
    }

    #[test]
    fn test_json_lines_is_lazy() {
        let mut iter = JsonLinesDecoder.decode(b"{\"a\":1}\nbroken\n{\"a\":3}");
        assert!(matches!(iter.next(), Some(Ok(_))));
        assert!(matches!(iter.next(), Some(Err(DecodeError::Json(_)))));
        assert!(matches!(iter.next(), Some(Ok(_))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_plain_lines() {
        let records: Vec<Record> = PlainDecoder
            .decode(b"first line\nsecond line\n")
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get(MESSAGE_FIELD), Some(&json!("first line")));

        let invalid = collect(&PlainDecoder, &[0xff, 0xfe]);
        assert!(matches!(invalid.as_slice(), [Err(DecodeError::Utf8(_))]));
    }

    #[test]
    fn test_codec_from_str() {
        assert_eq!("JSON".parse::<Codec>().unwrap(), Codec::Json);
        assert_eq!("ndjson".parse::<Codec>().unwrap(), Codec::JsonLines);
        assert_eq!("line".parse::<Codec>().unwrap(), Codec::Plain);
        assert!("msgpack".parse::<Codec>().is_err());
    }
}
