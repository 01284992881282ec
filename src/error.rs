//! Runtime error taxonomy and the asynchronous error channel.
//!
//! None of these errors are fatal. Each one is returned through the handle of
//! the call that caused it and is also published on the client's error channel
//! so that observers can react without awaiting individual calls.

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

use crate::config::Destination;

/// Capacity of the broadcast channel backing error subscriptions.
const ERROR_CHANNEL_CAPACITY: usize = 256;

/// Errors that can occur while shipping a message.
#[derive(Debug, Clone)]
pub enum GelfError {
    /// Compressing the serialized payload failed
    Compression(Arc<std::io::Error>),

    /// The payload would need more chunks than the protocol allows
    Oversize {
        /// Number of chunks the payload would have needed
        chunks: usize,
        /// Largest payload that fits in the maximum chunk count
        max_bytes: usize,
    },

    /// A datagram could not be handed to the transport
    Send {
        destination: Destination,
        source: Arc<std::io::Error>,
    },

    /// `close` was called after shutdown had already been requested
    DoubleClose,

    /// A send was attempted after the transport was released
    DestroyedTransport,

    /// The canonical record could not be serialized
    Serialization(String),

    /// The task delivering a message ended abnormally
    Task(String),
}

impl GelfError {
    /// Build a `Send` error for the given destination.
    pub fn send(destination: Destination, err: std::io::Error) -> Self {
        GelfError::Send {
            destination,
            source: Arc::new(err),
        }
    }
}

impl fmt::Display for GelfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GelfError::Compression(e) => write!(f, "Failed to compress payload: {}", e),
            GelfError::Oversize { chunks, max_bytes } => write!(
                f,
                "Cannot log messages bigger than {} bytes ({} chunks needed)",
                max_bytes, chunks
            ),
            GelfError::Send {
                destination,
                source,
            } => write!(f, "Failed to send datagram to {}: {}", destination, source),
            GelfError::DoubleClose => write!(f, "Close was already called once"),
            GelfError::DestroyedTransport => write!(f, "Socket was already destroyed"),
            GelfError::Serialization(e) => write!(f, "Failed to serialize message: {}", e),
            GelfError::Task(e) => write!(f, "Delivery task failed: {}", e),
        }
    }
}

impl std::error::Error for GelfError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GelfError::Compression(e) => Some(e.as_ref()),
            GelfError::Send { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GelfError {
    fn from(err: serde_json::Error) -> Self {
        GelfError::Serialization(err.to_string())
    }
}

/// A caller-supplied observer for runtime errors.
///
/// Implemented for any `Fn(&GelfError) + Send + Sync` closure.
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: &GelfError);
}

impl<F> ErrorSink for F
where
    F: Fn(&GelfError) + Send + Sync,
{
    fn report(&self, error: &GelfError) {
        self(error)
    }
}

/// Fan-out point for runtime errors.
///
/// Errors are written to the `tracing` warning output unless `ignore_errors`
/// is set, handed to the optional sink, and broadcast to every subscriber.
pub struct ErrorChannel {
    ignore_errors: bool,
    sink: Option<Arc<dyn ErrorSink>>,
    tx: broadcast::Sender<GelfError>,
}

impl ErrorChannel {
    pub fn new(ignore_errors: bool, sink: Option<Arc<dyn ErrorSink>>) -> Self {
        let (tx, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            ignore_errors,
            sink,
            tx,
        }
    }

    /// Publish an error on every configured output.
    pub fn emit(&self, error: &GelfError) {
        if !self.ignore_errors {
            warn!(error = %error, "GELF transport error");
        }

        if let Some(sink) = &self.sink {
            sink.report(error);
        }

        // No subscribers is not a failure
        let _ = self.tx.send(error.clone());
    }

    /// Subscribe to errors emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<GelfError> {
        self.tx.subscribe()
    }
}

impl fmt::Debug for ErrorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorChannel")
            .field("ignore_errors", &self.ignore_errors)
            .field("has_sink", &self.sink.is_some())
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
