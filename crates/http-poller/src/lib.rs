// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Polling HTTP ingestion.
//!
//! A [`PollLoop`] repeatedly GETs one endpoint over a keep-alive session, decodes
//! each response into records, enriches them with response metadata and hands them
//! to a bounded [`Queue`]. Timings of each batch and the id of the last fully
//! queued batch are reported back to the server on the following request.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod decoder;
pub mod errors;
pub mod http;
pub mod poller;
pub mod protocol;
pub mod queue;
pub mod record;
pub mod timing;
pub mod tls;

pub use config::PollerConfig;
pub use decoder::{Codec, Decoder};
pub use errors::{BackoffPolicy, ConfigError, DecodeError, FailureClass, PollError, QueueClosed};
pub use http::{Connector, Endpoint, HttpConnector, HttpSession, Response, Session};
pub use poller::PollLoop;
pub use queue::{BoundedQueue, Queue, QueueHandle, QueueReceiver};
pub use record::{Decorate, NoopDecorator, Record, StandardDecorator};
pub use timing::TimingTracker;
