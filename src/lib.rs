//! GELF UDP client library
//!
//! This library ships application log events to GELF receivers over UDP:
//!
//! - **config**: Destinations, labels, compression policy and datagram size
//! - **message**: Normalization of log calls into canonical GELF records
//! - **encoder**: Compression policy (never, always, optimal)
//! - **chunker**: Splitting oversized payloads into headered chunks
//! - **dispatcher**: Socket ownership and round-robin destination selection
//! - **lifecycle**: In-flight accounting and drain-aware shutdown
//! - **client**: The public call surface tying the pipeline together
//!
//! # Example
//!
//! ```no_run
//! use gelf_udp::{Config, Destination, ErrorValue, GelfClient, LogEvent};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment, or build it in code
//!     let config = Config::from_env().unwrap_or_else(|_| {
//!         Config::new(vec![
//!             Destination::new("10.0.0.1", 12201),
//!             Destination::new("10.0.0.2", 12201),
//!         ])
//!     });
//!
//!     let client = GelfClient::new(config).expect("Invalid config");
//!
//!     // Fire and forget
//!     client.info("worker started");
//!
//!     // Short message plus a record of additional fields
//!     client.warning(LogEvent::new("slow query").full_message(json!({"ms": 840})));
//!
//!     // Await an individual delivery
//!     let err = ErrorValue::new("timeout", "Error: timeout\n    at poll (src/net.rs:88:13)");
//!     if let Err(e) = client.error(err).await {
//!         eprintln!("not sent: {}", e);
//!     }
//!
//!     // Wait for everything in flight, then release the socket
//!     client.close().await.ok();
//! }
//! ```

// Module declarations
pub mod chunker;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod encoder;
pub mod error;
pub mod lifecycle;
pub mod message;

// Re-export commonly used types at crate root for convenience
pub use chunker::{ChunkHeader, ChunkPlan, CHUNK_HEADER_LEN, CHUNK_MAGIC, MAX_CHUNKS};
pub use client::{ClientStats, CloseHandle, Delivery, GelfClient, GelfClientBuilder, MessageHandle};
pub use config::{CompressionMode, Config, ConfigError, Destination};
pub use dispatcher::{Connector, Transport, UdpConnector, UdpTransport};
pub use encoder::{Compressor, ZlibCompressor};
pub use error::{ErrorSink, GelfError};
pub use lifecycle::{InFlightCounters, LifecycleState};
pub use message::{CanonicalMessage, ErrorValue, Level, LogEvent, MessageBody};
