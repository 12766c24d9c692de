// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire protocol shared with the polled server.
//!
//! Requests carry the previous iteration's timings so the server can size its
//! batches, plus an acknowledgement of the last batch whose records were all
//! queued. Responses may ask for an immediate follow-up poll and tag their batch
//! with an id to acknowledge.

use crate::http::{Response, ResponseHeaders};
use crate::timing::round_to;
use serde_json::{Map, Number, Value};
use std::time::Duration;

pub const NUM_EVENTS_HEADER: &str = "X-Logstash-Num-Events";
pub const HTTP_REQUEST_TOTAL_SECS_HEADER: &str = "X-Logstash-Http-Request-Total-Secs";
pub const CODEC_PARSE_TOTAL_SECS_HEADER: &str = "X-Logstash-Codec-Parse-Total-Secs";
pub const QUEUE_TOTAL_SECS_HEADER: &str = "X-Logstash-Queue-Total-Secs";
pub const AVG_QUEUE_SECS_HEADER: &str = "X-Logstash-Avg-Queue-Secs";
pub const SUCCESSFUL_BATCH_IDS_HEADER: &str = "X-Successful-Batch-Ids";

pub const MORE_EVENTS_AVAILABLE_HEADER: &str = "X-More-Events-Available";
pub const MESSAGES_BATCH_ID_HEADER: &str = "X-Messages-Batch-Id";
pub const SERVER_HEADER: &str = "Server";

/// Decimal digits of the rolling queue-wait average sent upstream.
pub const AVG_QUEUE_PRECISION: u32 = 3;

/// Measurements of one completed poll iteration, reported on the next request.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchStats {
    pub records: usize,
    pub http_request_time: Duration,
    pub decode_time: Duration,
    pub queue_time: Duration,
}

/// Headers for the next request.
///
/// Stats headers only go out when the previous batch produced records; the queue
/// average always does; the acknowledgement only when a batch id is pending.
#[must_use]
pub fn request_headers(
    previous: &BatchStats,
    avg_queue_secs: f64,
    pending_ack: Option<&str>,
) -> Vec<(String, String)> {
    let mut headers = Vec::with_capacity(6);
    if previous.records > 0 {
        headers.push((NUM_EVENTS_HEADER.to_string(), previous.records.to_string()));
        headers.push((
            HTTP_REQUEST_TOTAL_SECS_HEADER.to_string(),
            previous.http_request_time.as_secs_f64().to_string(),
        ));
        headers.push((
            CODEC_PARSE_TOTAL_SECS_HEADER.to_string(),
            previous.decode_time.as_secs_f64().to_string(),
        ));
        headers.push((
            QUEUE_TOTAL_SECS_HEADER.to_string(),
            previous.queue_time.as_secs_f64().to_string(),
        ));
    }
    headers.push((
        AVG_QUEUE_SECS_HEADER.to_string(),
        round_to(avg_queue_secs, AVG_QUEUE_PRECISION).to_string(),
    ));
    if let Some(batch_id) = pending_ack {
        headers.push((SUCCESSFUL_BATCH_IDS_HEADER.to_string(), batch_id.to_string()));
    }
    headers
}

/// Hints the server attached to a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHints {
    pub more_events_available: bool,
    pub batch_id: Option<String>,
    pub server: Option<String>,
}

impl ResponseHints {
    #[must_use]
    pub fn from_headers(headers: &ResponseHeaders) -> Self {
        Self {
            more_events_available: headers
                .get(MORE_EVENTS_AVAILABLE_HEADER)
                .is_some_and(|value| value.trim() == "true"),
            batch_id: headers
                .get(MESSAGES_BATCH_ID_HEADER)
                .map(str::to_string)
                .filter(|id| !id.is_empty()),
            server: headers.get(SERVER_HEADER).map(str::to_string),
        }
    }

    /// Sleep before the next poll: none when the server has more events queued.
    #[must_use]
    pub fn pacing(&self, interval: Duration) -> Duration {
        if self.more_events_available {
            Duration::ZERO
        } else {
            interval
        }
    }
}

/// Which parts of the response are copied into each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataOptions {
    pub include_headers: bool,
    pub include_code: bool,
    pub include_request_time: bool,
}

impl MetadataOptions {
    #[must_use]
    pub fn from_config(config: &crate::config::PollerConfig) -> Self {
        Self {
            include_headers: config.include_response_headers,
            include_code: config.include_response_code,
            include_request_time: config.include_http_request_time,
        }
    }
}

/// Metadata object attached to every record of a response.
#[must_use]
pub fn response_metadata(
    options: MetadataOptions,
    response: &Response,
    request_time: Duration,
) -> Value {
    let mut metadata = Map::new();
    if options.include_headers {
        let headers: Map<String, Value> = response
            .headers
            .iter()
            .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
            .collect();
        metadata.insert("headers".to_string(), Value::Object(headers));
    }
    if options.include_code {
        metadata.insert("code".to_string(), Value::from(response.status));
    }
    if options.include_request_time {
        let secs = Number::from_f64(request_time.as_secs_f64()).map_or(Value::Null, Value::Number);
        metadata.insert("elapsed_time".to_string(), secs);
    }
    Value::Object(metadata)
}
