// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The poll loop controller.
//!
//! One [`PollLoop`] drives one endpoint through
//! `CONNECTING -> REQUESTING -> PROCESSING -> PACING -> REQUESTING`, with a
//! backoff sleep on failure that resumes either at `CONNECTING` (the connection is
//! gone) or at `REQUESTING` (it is still usable). Exactly one request is in flight
//! at a time, and every record of a response is queued before the next request is
//! built, so a slow consumer directly slows the polling cadence.

use crate::config::PollerConfig;
use crate::decoder::Decoder;
use crate::errors::{BackoffPolicy, FailureClass, PollError};
use crate::http::{Connector, Response, Session};
use crate::protocol::{
    request_headers, response_metadata, BatchStats, MetadataOptions, ResponseHints,
    AVG_QUEUE_PRECISION,
};
use crate::queue::Queue;
use crate::record::{Decorate, StandardDecorator};
use crate::timing::{TimingTracker, DEFAULT_WINDOW_SIZE};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// State carried from one iteration to the next.
#[derive(Debug, Clone)]
struct PollState {
    timing: TimingTracker,
    previous: BatchStats,
    pending_ack: Option<String>,
}

impl Default for PollState {
    fn default() -> Self {
        Self {
            timing: TimingTracker::new(DEFAULT_WINDOW_SIZE),
            previous: BatchStats::default(),
            pending_ack: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    Connect,
    Request,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Connect,
    Request,
    Pace(Duration),
    Backoff { delay: Duration, then: Resume },
}

impl From<Resume> for Step {
    fn from(resume: Resume) -> Self {
        match resume {
            Resume::Connect => Step::Connect,
            Resume::Request => Step::Request,
        }
    }
}

pub struct PollLoop<C: Connector, Q: Queue> {
    connector: C,
    queue: Q,
    decoder: Arc<dyn Decoder>,
    decorator: Arc<dyn Decorate>,
    interval: Duration,
    no_messages_code: u16,
    response_object_name: String,
    metadata: MetadataOptions,
    backoff: BackoffPolicy,
    state: PollState,
    session: Option<C::Session>,
}

impl<C: Connector, Q: Queue> PollLoop<C, Q> {
    /// Builds a loop using the configured codec and the standard decorator.
    #[must_use]
    pub fn new(config: &PollerConfig, connector: C, queue: Q) -> Self {
        Self {
            connector,
            queue,
            decoder: config.codec.decoder(),
            decorator: Arc::new(StandardDecorator::from_config(config)),
            interval: config.interval,
            no_messages_code: config.no_messages_response_code,
            response_object_name: config.response_object_name.clone(),
            metadata: MetadataOptions::from_config(config),
            backoff: config.backoff(),
            state: PollState::default(),
            session: None,
        }
    }

    #[must_use]
    pub fn with_decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoder = decoder;
        self
    }

    #[must_use]
    pub fn with_decorator(mut self, decorator: Arc<dyn Decorate>) -> Self {
        self.decorator = decorator;
        self
    }

    /// Polls until `cancel` fires.
    ///
    /// Returns `Ok(())` on cancellation. The only error returned is one the loop
    /// cannot recover from, currently a closed downstream queue.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), PollError> {
        let mut step = Step::Connect;
        loop {
            if cancel.is_cancelled() {
                debug!(endpoint = %self.connector.endpoint(), "Poller cancelled, shutting down");
                return Ok(());
            }

            step = match step {
                Step::Connect => {
                    let connected = tokio::select! {
                        biased;
                        () = cancel.cancelled() => continue,
                        connected = self.connector.connect() => connected,
                    };
                    match connected {
                        Ok(session) => {
                            self.session = Some(session);
                            Step::Request
                        }
                        Err(err) => self.on_failure(err)?,
                    }
                }
                Step::Request => {
                    let polled = tokio::select! {
                        biased;
                        () = cancel.cancelled() => continue,
                        polled = self.poll_once() => polled,
                    };
                    match polled {
                        Ok(pacing) if pacing.is_zero() => Step::Request,
                        Ok(pacing) => Step::Pace(pacing),
                        Err(err) => self.on_failure(err)?,
                    }
                }
                Step::Pace(delay) => {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => continue,
                        () = sleep(delay) => Step::Request,
                    }
                }
                Step::Backoff { delay, then } => {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => continue,
                        () = sleep(delay) => then.into(),
                    }
                }
            };
        }
    }

    fn on_failure(&mut self, err: PollError) -> Result<Step, PollError> {
        let class = err.class();
        let endpoint = self.connector.endpoint();
        let then = match class {
            FailureClass::Fatal => {
                error!(%endpoint, error = %err.chain(), "Poller cannot continue");
                return Err(err);
            }
            FailureClass::Disconnected => {
                self.session = None;
                Resume::Connect
            }
            FailureClass::Recovered | FailureClass::Unexpected => {
                if matches!(err, PollError::Connection(_)) {
                    self.session = None;
                }
                if self.session.is_some() {
                    Resume::Request
                } else {
                    Resume::Connect
                }
            }
        };
        let delay = self.backoff.delay_for(class).unwrap_or_default();
        warn!(
            %endpoint,
            error = %err.chain(),
            backoff_secs = delay.as_secs_f64(),
            "Poll failed, retrying after backoff"
        );
        Ok(Step::Backoff { delay, then })
    }

    /// One request/response/enqueue round. Returns how long to pace before the next one.
    async fn poll_once(&mut self) -> Result<Duration, PollError> {
        let path = self.connector.endpoint().path_and_query();
        let headers = request_headers(
            &self.state.previous,
            self.state.timing.average(AVG_QUEUE_PRECISION),
            self.state.pending_ack.as_deref(),
        );
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| PollError::Connection("no live session".to_string()))?;

        let started = Instant::now();
        let response = session.send(&path, &headers).await?;
        let mut stats = BatchStats {
            http_request_time: started.elapsed(),
            ..BatchStats::default()
        };

        // The server has seen our stats and acknowledgement
        self.state.previous = BatchStats::default();
        self.state.pending_ack = None;

        let hints = ResponseHints::from_headers(&response.headers);
        match self.process_response(&response, &mut stats).await {
            Ok(()) => {}
            Err(err) if err.class() == FailureClass::Recovered => {
                warn!(
                    endpoint = %self.connector.endpoint(),
                    status = response.status,
                    "{err}, no records produced"
                );
            }
            Err(err) => return Err(err),
        }

        if stats.records > 0 {
            self.state.pending_ack = hints.batch_id.clone();
        }
        self.state.previous = stats;
        self.log_summary(&stats, &hints, &path);

        Ok(hints.pacing(self.interval))
    }

    async fn process_response(
        &mut self,
        response: &Response,
        stats: &mut BatchStats,
    ) -> Result<(), PollError> {
        if response.status == self.no_messages_code {
            return Ok(());
        }
        if response.status != 200 {
            return Err(PollError::UnexpectedStatus(response.status));
        }
        let body = response.body.as_deref().ok_or(PollError::EmptyBody)?;

        let metadata = response_metadata(self.metadata, response, stats.http_request_time);
        let decoder = Arc::clone(&self.decoder);
        let decode_started = Instant::now();
        let mut records = decoder.decode(body);
        stats.decode_time += decode_started.elapsed();
        loop {
            let decode_started = Instant::now();
            let next = records.next();
            stats.decode_time += decode_started.elapsed();
            let Some(record) = next else {
                break;
            };

            let mut record = record?;
            record.insert(self.response_object_name.as_str(), metadata.clone());
            self.decorator.decorate(&mut record);

            let push_started = Instant::now();
            self.queue.push(record).await?;
            let waited = push_started.elapsed();
            self.state.timing.record(waited);
            stats.queue_time += waited;
            stats.records += 1;
        }
        Ok(())
    }

    fn log_summary(&self, stats: &BatchStats, hints: &ResponseHints, path: &str) {
        let endpoint = self.connector.endpoint();
        let server = hints.server.as_deref().unwrap_or("-");
        if stats.records > 0 {
            debug!(
                records = stats.records,
                http_secs = stats.http_request_time.as_secs_f64(),
                decode_secs = stats.decode_time.as_secs_f64(),
                queue_secs = stats.queue_time.as_secs_f64(),
                queue_size = self.queue.size(),
                queue_capacity = self.queue.capacity(),
                blocked_producers = self.queue.blocked_producers(),
                server,
                host = endpoint.host(),
                uri = path,
                "Processed batch"
            );
        } else {
            trace!(
                records = 0,
                http_secs = stats.http_request_time.as_secs_f64(),
                queue_size = self.queue.size(),
                queue_capacity = self.queue.capacity(),
                blocked_producers = self.queue.blocked_producers(),
                server,
                host = endpoint.host(),
                uri = path,
                "Processed batch"
            );
        }
    }
}
