// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the polling input.
//!
//! Every failure the poll loop can observe is a [`PollError`]. Each variant maps
//! onto a [`FailureClass`], which is what the loop actually dispatches on when it
//! decides how long to back off and whether the keep-alive connection must be
//! rebuilt.

use std::time::Duration;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while loading or validating a [`crate::config::PollerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required option: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {option}: {reason}")]
    Invalid {
        option: &'static str,
        reason: String,
    },
}

/// A payload could not be turned into records.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed json")]
    Json(#[from] serde_json::Error),

    #[error("expected a json object, got {0}")]
    NotAnObject(&'static str),

    #[error("payload is not valid utf-8")]
    Utf8(#[from] std::str::Utf8Error),
}

/// The downstream consumer hung up; nothing pushed from now on can be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("downstream queue is closed")]
pub struct QueueClosed;

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// Initial connect failed: bad endpoint, DNS, refused, TLS setup.
    #[error("connection error: {0}")]
    Connection(String),

    /// The live connection failed mid-request: reset, timeout, premature EOF.
    #[error("transport error")]
    Transport(#[source] BoxError),

    /// Status was neither 200 nor the configured "no messages" code.
    #[error("unexpected status code {0}")]
    UnexpectedStatus(u16),

    /// Status 200 with nothing in the body.
    #[error("empty response body")]
    EmptyBody,

    #[error("failed to decode response body")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),
}

/// How the poll loop recovers from a [`PollError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Logged, counted as a zero-record iteration, normal pacing continues.
    Recovered,
    /// The connection dropped: short backoff, then rebuild it.
    Disconnected,
    /// Anything else aborting an iteration: long backoff, retry the same step.
    Unexpected,
    /// The instance cannot make progress any more and must stop.
    Fatal,
}

impl PollError {
    pub fn transport(err: impl Into<BoxError>) -> Self {
        PollError::Transport(err.into())
    }

    /// Renders the error followed by its chain of sources.
    #[must_use]
    pub fn chain(&self) -> String {
        let mut rendered = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            rendered.push_str(": ");
            rendered.push_str(&cause.to_string());
            source = cause.source();
        }
        rendered
    }

    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            PollError::UnexpectedStatus(_) | PollError::EmptyBody => FailureClass::Recovered,
            PollError::Transport(_) => FailureClass::Disconnected,
            PollError::Connection(_) | PollError::Decode(_) => FailureClass::Unexpected,
            PollError::QueueClosed(_) => FailureClass::Fatal,
        }
    }
}

/// Fixed sleeps applied before retrying after a failed iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// After the connection dropped cleanly.
    pub reconnect: Duration,
    /// After an unexpected error.
    pub error: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            reconnect: Duration::from_secs(1),
            error: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Returns the delay for a failure class, `None` when no backoff applies.
    #[must_use]
    pub fn delay_for(&self, class: FailureClass) -> Option<Duration> {
        match class {
            FailureClass::Disconnected => Some(self.reconnect),
            FailureClass::Unexpected => Some(self.error),
            FailureClass::Recovered | FailureClass::Fatal => None,
        }
    }
}
