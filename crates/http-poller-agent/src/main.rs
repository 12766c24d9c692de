// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, process};
use tokio::{io::AsyncWriteExt, task::JoinSet};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use http_poller::{
    tls, BoundedQueue, HttpConnector, PollLoop, PollerConfig, QueueHandle, QueueReceiver,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("HTTP_POLLER_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,reqwest=off,{}", log_level);

    // stdout carries the records, diagnostics go to stderr
    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    if let Err(e) = tls::prepare_client_provider() {
        error!("Error preparing TLS on http poller startup: {e}");
        process::exit(1);
    }

    let configs = match PollerConfig::from_env() {
        Ok(configs) => configs,
        Err(e) => {
            error!("Error reading http poller configuration: {e}");
            process::exit(1);
        }
    };

    let capacity = configs
        .iter()
        .map(|config| config.queue_capacity)
        .max()
        .unwrap_or(http_poller::config::DEFAULT_QUEUE_CAPACITY);
    let (queue, receiver) = BoundedQueue::new(capacity);
    let cancel_token = CancellationToken::new();

    let mut pollers = JoinSet::new();
    for config in &configs {
        if let Err(e) = spawn_poller(&mut pollers, config, queue.clone(), &cancel_token) {
            error!("Error creating poller for {}: {e}", config.url);
            process::exit(1);
        }
    }
    // The consumer ends once every poller has dropped its handle
    drop(queue);

    let consumer = tokio::spawn(write_records(receiver));

    tokio::select! {
        () = shutdown_signal() => info!("Shutdown requested, stopping pollers"),
        () = async { while pollers.join_next().await.is_some() {} } => {
            error!("Every poller stopped, shutting down");
        }
    };

    cancel_token.cancel();
    while let Some(joined) = pollers.join_next().await {
        if let Err(e) = joined {
            error!("Poller task failed: {e}");
        }
    }
    match consumer.await {
        Ok(written) => debug!(records = written, "Downstream consumer drained"),
        Err(e) => error!("Downstream consumer failed: {e}"),
    }
}

fn spawn_poller(
    pollers: &mut JoinSet<()>,
    config: &PollerConfig,
    queue: QueueHandle,
    cancel_token: &CancellationToken,
) -> Result<(), http_poller::PollError> {
    let connector = HttpConnector::from_config(config)?;
    let poller = PollLoop::new(config, connector, queue);
    let cancel_token = cancel_token.clone();
    let url = config.url.clone();

    info!(%url, interval_secs = config.interval.as_secs_f64(), "Starting http poller");
    pollers.spawn(async move {
        match poller.run(cancel_token.clone()).await {
            Ok(()) if cancel_token.is_cancelled() => debug!(%url, "Http poller stopped"),
            Ok(()) => error!(%url, "Http poller exited without being cancelled"),
            Err(e) => error!(%url, "Http poller stopped: {}", e.chain()),
        }
    });
    Ok(())
}

/// Writes each record as one JSON line on stdout. Returns how many were written.
async fn write_records(mut receiver: QueueReceiver) -> u64 {
    let mut stdout = tokio::io::stdout();
    let mut written = 0;
    while let Some(record) = receiver.recv().await {
        let mut line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!("Dropping record that cannot be serialized: {e}");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = stdout.write_all(&line).await {
            error!("Failed to write record to stdout: {e}");
            break;
        }
        written += 1;
    }
    if let Err(e) = stdout.flush().await {
        warn!("Failed to flush stdout: {e}");
    }
    written
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
