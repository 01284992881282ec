//! gelf-send - forward standard input to GELF receivers
//!
//! Every line read from stdin is shipped as an `info` message. On end of
//! input or Ctrl+C the client is closed and the process waits for every
//! in-flight datagram before exiting.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `GELF_DESTINATIONS`: comma-separated `host:port` list (required)
//! - `GELF_HOSTNAME`: host label (default: local host name)
//! - `GELF_FACILITY`: facility label (default: Rust)
//! - `GELF_COMPRESSION`: optimal, always or never (default: optimal)
//! - `GELF_MAX_DATAGRAM_SIZE`: bytes per datagram (default: 1400)
//! - `GELF_IGNORE_ERRORS`: suppress error warnings (default: false)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gelf_udp::{Config, GelfClient};

/// How long to wait for in-flight datagrams on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                destinations = config.destinations.len(),
                hostname = %config.hostname,
                facility = %config.facility,
                compression = %config.compression,
                max_datagram_size = config.max_datagram_size,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let client = match GelfClient::new(config) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to create GELF client");
            std::process::exit(1);
        }
    };

    let lines = forward_stdin(&client);
    tokio::select! {
        forwarded = lines => {
            info!(lines = forwarded, "End of input");
        }
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received, stopping..."),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
        }
    }

    // Graceful shutdown
    info!(in_flight = ?client.in_flight(), "Closing GELF client...");
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, client.close()).await {
        Ok(Ok(())) => {
            let stats = client.stats();
            info!(
                messages_sent = stats.messages_sent,
                datagrams_sent = stats.datagrams_sent,
                messages_failed = stats.messages_failed,
                "GELF client closed"
            );
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Close failed");
        }
        Err(_) => {
            warn!("Shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
        }
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Send every non-empty stdin line. Returns the number of lines forwarded.
async fn forward_stdin(client: &GelfClient) -> u64 {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut forwarded: u64 = 0;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                // Failures are reported on the client's error channel
                drop(client.info(line));
                forwarded += 1;
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read from stdin");
                break;
            }
        }
    }

    forwarded
}
