// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decoded records and the decoration hook applied to every record before it is queued.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Debug;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const TIMESTAMP_FIELD: &str = "@timestamp";
pub const TAGS_FIELD: &str = "tags";
pub const TYPE_FIELD: &str = "type";

/// One decoded unit of data: a mapping of field name to JSON value.
///
/// Records are moved into the queue on push, so nothing can mutate them once queued.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn entry(&mut self, key: impl Into<String>) -> serde_json::map::Entry<'_> {
        self.0.entry(key)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Cross-cutting decoration applied to each record right before it is queued.
///
/// Implementations mutate in place and cannot fail.
pub trait Decorate: Send + Sync + Debug {
    fn decorate(&self, record: &mut Record);
}

/// Leaves records untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDecorator;

impl Decorate for NoopDecorator {
    fn decorate(&self, _record: &mut Record) {}
}

/// Timestamp stamping, tagging, static fields and type, as every ingestion source applies them.
#[derive(Debug, Clone, Default)]
pub struct StandardDecorator {
    pub tags: Vec<String>,
    pub add_field: BTreeMap<String, String>,
    pub event_type: Option<String>,
}

impl StandardDecorator {
    #[must_use]
    pub fn from_config(config: &crate::config::PollerConfig) -> Self {
        Self {
            tags: config.tags.clone(),
            add_field: config.add_field.clone(),
            event_type: config.event_type.clone(),
        }
    }
}

impl Decorate for StandardDecorator {
    fn decorate(&self, record: &mut Record) {
        if !record.contains_key(TIMESTAMP_FIELD) {
            // Formatting a UTC timestamp as RFC 3339 only fails for years outside 0..=9999
            if let Ok(now) = OffsetDateTime::now_utc().format(&Rfc3339) {
                record.insert(TIMESTAMP_FIELD, Value::String(now));
            }
        }

        if let Some(event_type) = &self.event_type {
            record
                .entry(TYPE_FIELD)
                .or_insert_with(|| Value::String(event_type.clone()));
        }

        for (key, value) in &self.add_field {
            record
                .entry(key.as_str())
                .or_insert_with(|| Value::String(value.clone()));
        }

        if !self.tags.is_empty() {
            let tags = record
                .entry(TAGS_FIELD)
                .or_insert_with(|| Value::Array(Vec::new()));
            // A scalar `tags` field is promoted to an array so new tags can be appended
            if !tags.is_array() {
                let existing = tags.take();
                *tags = Value::Array(vec![existing]);
            }
            if let Value::Array(list) = tags {
                for tag in &self.tags {
                    let tag = Value::String(tag.clone());
                    if !list.contains(&tag) {
                        list.push(tag);
                    }
                }
            }
        }
    }
}
