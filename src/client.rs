//! GELF client: the public call surface.
//!
//! A [`GelfClient`] is constructed once from a validated [`Config`] and
//! shared by cloning. Each log call spawns a task that builds the record,
//! applies the compression policy, and sends it as one datagram or as a
//! strictly sequential run of chunks to a single destination. Calls return
//! immediately with a [`MessageHandle`]; errors are reported through the
//! handle and through the client's error channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::chunker::ChunkPlan;
use crate::config::{CompressionMode, Config, ConfigError, Destination};
use crate::dispatcher::{Connector, Dispatcher, UdpConnector};
use crate::encoder::{self, Compressor, ZlibCompressor};
use crate::error::{ErrorChannel, ErrorSink, GelfError};
use crate::lifecycle::{InFlightCounters, Lifecycle, LifecycleState};
use crate::message::{Level, LogEvent, PayloadBuilder};

/// Callback invoked when a close request resolves.
pub type CloseCallback = Box<dyn FnOnce(Result<(), GelfError>) + Send + 'static>;

/// Outcome of a successfully shipped message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Receiver every datagram of the message went to
    pub destination: Destination,

    /// Datagrams sent, 1 unless the message was chunked
    pub datagrams: usize,

    /// Whether the payload was compressed
    pub compressed: bool,
}

/// Statistics about client operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Messages fully sent
    pub messages_sent: u64,

    /// Datagrams sent for fully sent messages
    pub datagrams_sent: u64,

    /// Messages that had to be chunked
    pub chunked_messages: u64,

    /// Messages aborted by an error
    pub messages_failed: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    messages_sent: AtomicU64,
    datagrams_sent: AtomicU64,
    chunked_messages: AtomicU64,
    messages_failed: AtomicU64,
}

impl StatsCounters {
    fn record(&self, result: &Result<Delivery, GelfError>) {
        match result {
            Ok(delivery) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.datagrams_sent
                    .fetch_add(delivery.datagrams as u64, Ordering::Relaxed);
                if delivery.datagrams > 1 {
                    self.chunked_messages.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(_) => {
                self.messages_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ClientStats {
        ClientStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            chunked_messages: self.chunked_messages.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
        }
    }
}

/// Resolves when one log call has finished.
///
/// Dropping the handle does not cancel the send.
#[derive(Debug)]
pub struct MessageHandle {
    inner: JoinHandle<Result<Delivery, GelfError>>,
}

impl Future for MessageHandle {
    type Output = Result<Delivery, GelfError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner)
            .poll(cx)
            .map(|joined| joined.unwrap_or_else(|e| Err(GelfError::Task(e.to_string()))))
    }
}

/// Resolves when a close request has been finalized or rejected.
#[derive(Debug)]
pub struct CloseHandle {
    rx: oneshot::Receiver<Result<(), GelfError>>,
}

impl Future for CloseHandle {
    type Output = Result<(), GelfError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(GelfError::Task("close task dropped".to_string())))
        })
    }
}

/// Builder for a [`GelfClient`] with non-default collaborators.
pub struct GelfClientBuilder {
    config: Config,
    compressor: Arc<dyn Compressor>,
    connector: Arc<dyn Connector>,
    error_sink: Option<Arc<dyn ErrorSink>>,
}

impl GelfClientBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            compressor: Arc::new(ZlibCompressor::default()),
            connector: Arc::new(UdpConnector),
            error_sink: None,
        }
    }

    pub fn compressor(mut self, compressor: impl Compressor + 'static) -> Self {
        self.compressor = Arc::new(compressor);
        self
    }

    /// Replace how the datagram socket is opened.
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Observe every runtime error.
    pub fn error_sink(mut self, sink: impl ErrorSink + 'static) -> Self {
        self.error_sink = Some(Arc::new(sink));
        self
    }

    /// Validate the configuration and create the client.
    ///
    /// No socket is opened until the first message is sent.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid.
    pub fn build(self) -> Result<GelfClient, ConfigError> {
        self.config.validate()?;

        let config = self.config;
        let inner = Inner {
            builder: PayloadBuilder::new(&config.hostname, &config.facility),
            compression: config.compression,
            max_datagram_size: config.max_datagram_size,
            compressor: self.compressor,
            dispatcher: Dispatcher::new(config.destinations, self.connector),
            lifecycle: Lifecycle::new(),
            errors: ErrorChannel::new(config.ignore_errors, self.error_sink),
            stats: StatsCounters::default(),
        };

        Ok(GelfClient {
            inner: Arc::new(inner),
        })
    }
}

struct Inner {
    builder: PayloadBuilder,
    compression: CompressionMode,
    max_datagram_size: usize,
    compressor: Arc<dyn Compressor>,
    dispatcher: Dispatcher,
    lifecycle: Lifecycle,
    errors: ErrorChannel,
    stats: StatsCounters,
}

impl Inner {
    /// Run the pipeline for one message.
    async fn deliver(&self, event: LogEvent) -> Result<Delivery, GelfError> {
        let raw = self.builder.to_bytes(event)?;
        let encoded = encoder::encode(
            raw,
            self.compression,
            self.max_datagram_size,
            self.compressor.as_ref(),
        )?;
        let in_flight = self.lifecycle.in_flight();

        if encoded.bytes.len() <= self.max_datagram_size {
            let destination = self.dispatcher.select_destination().clone();
            self.dispatcher
                .send(&encoded.bytes, &destination, in_flight)
                .await?;

            return Ok(Delivery {
                destination,
                datagrams: 1,
                compressed: encoded.compressed,
            });
        }

        // Planned before picking a destination so an oversize message does
        // not consume a round-robin slot
        let plan = ChunkPlan::new(&encoded.bytes, self.max_datagram_size)?;
        let destination = self.dispatcher.select_destination().clone();

        debug!(
            destination = %destination,
            bytes = encoded.bytes.len(),
            chunks = plan.total(),
            message_id = ?plan.message_id(),
            "Sending chunked GELF message"
        );

        // Next chunk only after the previous send completed
        for datagram in plan.datagrams() {
            self.dispatcher
                .send(&datagram, &destination, in_flight)
                .await?;
        }

        Ok(Delivery {
            destination,
            datagrams: plan.total(),
            compressed: encoded.compressed,
        })
    }

    fn emit_error(&self, error: &GelfError) {
        self.errors.emit(error);
    }

    /// Wait for in-flight work to drain, then release the socket.
    async fn finalize(&self) {
        let in_flight = self.lifecycle.in_flight();
        loop {
            in_flight.drained().await;
            if self.dispatcher.destroy_if_drained(in_flight).await {
                break;
            }
        }

        self.lifecycle.mark_closed();
        info!("GELF client closed");
    }
}

/// Client shipping log events as GELF datagrams.
///
/// Cloning is cheap; clones share the socket, the round-robin counter, the
/// in-flight counters and the lifecycle. All methods that start work must
/// be called from within a tokio runtime.
///
/// # Example
///
/// ```no_run
/// use gelf_udp::{Config, Destination, GelfClient, LogEvent};
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::new(vec![Destination::new("127.0.0.1", 12201)]);
///     let client = GelfClient::new(config).expect("invalid config");
///
///     client.info("service started");
///     client.error(LogEvent::new("payment failed").field("order_id", 4711));
///
///     client.close().await.expect("close");
/// }
/// ```
#[derive(Clone)]
pub struct GelfClient {
    inner: Arc<Inner>,
}

impl GelfClient {
    /// Create a client with the default UDP transport and zlib compressor.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        GelfClientBuilder::new(config).build()
    }

    pub fn builder(config: Config) -> GelfClientBuilder {
        GelfClientBuilder::new(config)
    }

    /// Ship an event at its own level.
    pub fn send(&self, event: LogEvent) -> MessageHandle {
        let ticket = self.inner.lifecycle.in_flight().track_message();
        let inner = Arc::clone(&self.inner);

        let handle = tokio::spawn(async move {
            let result = inner.deliver(event).await;
            inner.stats.record(&result);
            if let Err(e) = &result {
                inner.emit_error(e);
            }
            // Released after the error is published
            drop(ticket);
            result
        });

        MessageHandle { inner: handle }
    }

    fn send_at(&self, level: Level, event: impl Into<LogEvent>) -> MessageHandle {
        self.send(event.into().level(level))
    }

    pub fn emergency(&self, event: impl Into<LogEvent>) -> MessageHandle {
        self.send_at(Level::Emergency, event)
    }

    pub fn alert(&self, event: impl Into<LogEvent>) -> MessageHandle {
        self.send_at(Level::Alert, event)
    }

    pub fn critical(&self, event: impl Into<LogEvent>) -> MessageHandle {
        self.send_at(Level::Critical, event)
    }

    pub fn error(&self, event: impl Into<LogEvent>) -> MessageHandle {
        self.send_at(Level::Error, event)
    }

    pub fn warning(&self, event: impl Into<LogEvent>) -> MessageHandle {
        self.send_at(Level::Warning, event)
    }

    pub fn notice(&self, event: impl Into<LogEvent>) -> MessageHandle {
        self.send_at(Level::Notice, event)
    }

    pub fn info(&self, event: impl Into<LogEvent>) -> MessageHandle {
        self.send_at(Level::Info, event)
    }

    pub fn debug(&self, event: impl Into<LogEvent>) -> MessageHandle {
        self.send_at(Level::Debug, event)
    }

    /// Alias for [`GelfClient::info`].
    pub fn log(&self, event: impl Into<LogEvent>) -> MessageHandle {
        self.info(event)
    }

    /// Request shutdown.
    ///
    /// The socket is released once every in-flight message and datagram has
    /// completed; the returned handle resolves at that point. A second close
    /// resolves with `GelfError::DoubleClose`, which is also published on the
    /// error channel, and has no other effect.
    pub fn close(&self) -> CloseHandle {
        self.close_inner(None)
    }

    /// Request shutdown and invoke `callback` with the outcome.
    ///
    /// On a repeated close the callback receives `GelfError::DoubleClose`
    /// instead of the error channel.
    pub fn close_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<(), GelfError>) + Send + 'static,
    {
        // The callback carries the outcome
        let _ = self.close_inner(Some(Box::new(callback)));
    }

    fn close_inner(&self, callback: Option<CloseCallback>) -> CloseHandle {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let request = self.inner.lifecycle.request_close();

        // Always resolved on a separate task, never inside this call
        tokio::spawn(async move {
            let outcome = match request {
                Ok(()) => {
                    debug!(in_flight = ?inner.lifecycle.in_flight().snapshot(), "Close requested");
                    inner.finalize().await;
                    Ok(())
                }
                Err(e) => {
                    if callback.is_none() {
                        inner.emit_error(&e);
                    }
                    Err(e)
                }
            };

            if let Some(callback) = callback {
                callback(outcome.clone());
            }
            let _ = tx.send(outcome);
        });

        CloseHandle { rx }
    }

    /// Subscribe to errors emitted from now on.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<GelfError> {
        self.inner.errors.subscribe()
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    /// Current in-flight counters.
    pub fn in_flight(&self) -> InFlightCounters {
        self.inner.lifecycle.in_flight().snapshot()
    }

    pub fn stats(&self) -> ClientStats {
        self.inner.stats.snapshot()
    }

    pub fn destinations(&self) -> &[Destination] {
        self.inner.dispatcher.destinations()
    }
}

impl std::fmt::Debug for GelfClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GelfClient")
            .field("dispatcher", &self.inner.dispatcher)
            .field("state", &self.inner.lifecycle.state())
            .field("in_flight", &self.inner.lifecycle.in_flight().snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{ChunkHeader, CHUNK_HEADER_LEN};
    use crate::dispatcher::Transport;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio::time::timeout;

    type Sent = Arc<Mutex<Vec<(Destination, Vec<u8>)>>>;

    /// Records datagrams; optionally holds each send until a permit is
    /// released, and optionally fails the n-th send.
    #[derive(Clone, Default)]
    struct RecordingConnector {
        sent: Sent,
        connects: Arc<AtomicUsize>,
        gate: Option<Arc<Semaphore>>,
        fail_on_send: Option<usize>,
    }

    struct RecordingTransport {
        sent: Sent,
        sends: AtomicUsize,
        gate: Option<Arc<Semaphore>>,
        fail_on_send: Option<usize>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_to(&self, datagram: &[u8], destination: &Destination) -> io::Result<usize> {
            if let Some(gate) = &self.gate {
                gate.acquire().await.expect("gate closed").forget();
            }

            let n = self.sends.fetch_add(1, Ordering::SeqCst);
            if self.fail_on_send == Some(n) {
                return Err(io::Error::new(io::ErrorKind::Other, "host unreachable"));
            }

            self.sent
                .lock()
                .unwrap()
                .push((destination.clone(), datagram.to_vec()));
            Ok(datagram.len())
        }
    }

    #[async_trait]
    impl Connector for RecordingConnector {
        async fn connect(&self) -> io::Result<Arc<dyn Transport>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(RecordingTransport {
                sent: self.sent.clone(),
                sends: AtomicUsize::new(0),
                gate: self.gate.clone(),
                fail_on_send: self.fail_on_send,
            }))
        }
    }

    /// Fails the first compression only.
    #[derive(Default)]
    struct FlakyCompressor {
        calls: AtomicUsize,
    }

    impl Compressor for FlakyCompressor {
        fn compress(&self, raw: &[u8]) -> io::Result<Vec<u8>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "forced failure"));
            }
            ZlibCompressor::default().compress(raw)
        }
    }

    fn test_config() -> Config {
        Config::new(vec![
            Destination::new("12.34.56.78", 12),
            Destination::new("12.34.56.71", 12),
        ])
        .with_hostname("test-host")
        .with_ignore_errors(true)
    }

    fn client_with(config: Config, connector: RecordingConnector) -> GelfClient {
        GelfClient::builder(config)
            .connector(connector)
            .build()
            .expect("valid config")
    }

    fn sent(connector: &RecordingConnector) -> Vec<(Destination, Vec<u8>)> {
        connector.sent.lock().unwrap().clone()
    }

    /// Text made of distinct words so it does not compress to nothing.
    fn noisy_text(len: usize) -> String {
        let mut text = String::with_capacity(len + 16);
        let mut i: u64 = 0;
        while text.len() < len {
            i = i.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            text.push_str(&format!("{:x} ", i));
        }
        text
    }

    #[test]
    fn test_invalid_destination_fails_before_socket() {
        let connector = RecordingConnector::default();
        let config = Config::new(vec![Destination::new("12.34,56.78", 12)]);

        let result = GelfClient::builder(config).connector(connector.clone()).build();
        assert!(result.is_err());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_single_datagram() {
        let connector = RecordingConnector::default();
        let client = client_with(test_config(), connector.clone());

        let delivery = client.warning("disk almost full").await.unwrap();
        assert_eq!(delivery.datagrams, 1);
        assert!(!delivery.compressed);

        let sent = sent(&connector);
        assert_eq!(sent.len(), 1);
        let record: Value = serde_json::from_slice(&sent[0].1).unwrap();
        assert_eq!(record["short_message"], "disk almost full");
        assert_eq!(record["host"], "test-host");
        assert_eq!(record["level"], 4);
        assert!(client.in_flight().is_drained());
    }

    #[tokio::test]
    async fn test_level_entry_points() {
        let connector = RecordingConnector::default();
        let client = client_with(test_config(), connector.clone());

        client.emergency("a").await.unwrap();
        client.alert("b").await.unwrap();
        client.critical("c").await.unwrap();
        client.error("d").await.unwrap();
        client.warning("e").await.unwrap();
        client.notice("f").await.unwrap();
        client.info("g").await.unwrap();
        client.debug("h").await.unwrap();
        client.log("i").await.unwrap();

        let levels: Vec<u64> = sent(&connector)
            .iter()
            .map(|(_, bytes)| {
                let record: Value = serde_json::from_slice(bytes).unwrap();
                record["level"].as_u64().unwrap()
            })
            .collect();
        assert_eq!(levels, vec![0, 1, 2, 3, 4, 5, 6, 7, 6]);
    }

    #[tokio::test]
    async fn test_round_robin_across_messages() {
        let connector = RecordingConnector::default();
        let client = client_with(test_config(), connector.clone());

        for i in 0..4 {
            client.info(format!("message {}", i)).await.unwrap();
        }

        let hosts: Vec<String> = sent(&connector).into_iter().map(|(d, _)| d.host).collect();
        assert_eq!(
            hosts,
            vec!["12.34.56.78", "12.34.56.71", "12.34.56.78", "12.34.56.71"]
        );
    }

    #[tokio::test]
    async fn test_chunked_message_reassembles() {
        let connector = RecordingConnector::default();
        let config = test_config()
            .with_compression(CompressionMode::Never)
            .with_max_datagram_size(200);
        let client = client_with(config, connector.clone());

        let body = noisy_text(2000);
        let delivery = client.info(LogEvent::new("big").full_message(body.clone())).await.unwrap();

        let sent = sent(&connector);
        assert_eq!(sent.len(), delivery.datagrams);
        assert!(delivery.datagrams > 1);

        let first = ChunkHeader::parse(&sent[0].1).unwrap();
        let mut payload = Vec::new();
        for (i, (destination, datagram)) in sent.iter().enumerate() {
            assert_eq!(destination, &delivery.destination);
            assert!(datagram.len() <= 200);
            let header = ChunkHeader::parse(datagram).unwrap();
            assert_eq!(header.message_id, first.message_id);
            assert_eq!(header.sequence as usize, i);
            assert_eq!(header.total as usize, sent.len());
            payload.extend_from_slice(&datagram[CHUNK_HEADER_LEN..]);
        }

        assert_eq!(sent.len(), payload.len().div_ceil(200 - CHUNK_HEADER_LEN));
        let record: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(record["full_message"], Value::String(body));
        assert_eq!(client.stats().chunked_messages, 1);
    }

    #[tokio::test]
    async fn test_optimal_compresses_only_large_payloads() {
        let connector = RecordingConnector::default();
        let client = client_with(test_config(), connector.clone());

        let small = client.info("short").await.unwrap();
        assert!(!small.compressed);

        let large = client
            .info(LogEvent::new("repetitive").full_message("x".repeat(10_000)))
            .await
            .unwrap();
        assert!(large.compressed);
        assert_eq!(large.datagrams, 1);
        assert_eq!(sent(&connector)[1].1[0], 0x78);
    }

    #[tokio::test]
    async fn test_oversize_sends_nothing() {
        let connector = RecordingConnector::default();
        let config = test_config()
            .with_compression(CompressionMode::Never)
            .with_max_datagram_size(112);
        let client = client_with(config, connector.clone());
        let mut errors = client.subscribe_errors();

        let result = client
            .info(LogEvent::new("huge").full_message(noisy_text(100 * 130)))
            .await;

        assert!(matches!(result, Err(GelfError::Oversize { .. })));
        assert!(sent(&connector).is_empty());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
        assert!(matches!(errors.try_recv(), Ok(GelfError::Oversize { .. })));
        assert!(client.in_flight().is_drained());

        // The aborted message did not consume a round-robin slot
        let next = client.info("small").await.unwrap();
        assert_eq!(next.destination.host, "12.34.56.78");
    }

    #[tokio::test]
    async fn test_send_failure_aborts_remaining_chunks() {
        let connector = RecordingConnector {
            fail_on_send: Some(1),
            ..RecordingConnector::default()
        };
        let config = test_config()
            .with_compression(CompressionMode::Never)
            .with_max_datagram_size(100);
        let client = client_with(config, connector.clone());

        let result = client
            .info(LogEvent::new("chunked").full_message(noisy_text(1000)))
            .await;

        assert!(matches!(result, Err(GelfError::Send { .. })));
        // First chunk sent, second failed, nothing after it
        assert_eq!(sent(&connector).len(), 1);
        assert!(client.in_flight().is_drained());
        assert_eq!(client.stats().messages_failed, 1);
    }

    #[tokio::test]
    async fn test_compression_failure_is_isolated() {
        let connector = RecordingConnector::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        let client = GelfClient::builder(test_config().with_compression(CompressionMode::Always))
            .connector(connector.clone())
            .compressor(FlakyCompressor::default())
            .error_sink(move |e: &GelfError| {
                assert!(matches!(e, GelfError::Compression(_)));
                seen_clone.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();

        let first = client.info("first").await;
        assert!(matches!(first, Err(GelfError::Compression(_))));

        let second = client.info("second").await.unwrap();
        assert!(second.compressed);

        assert_eq!(sent(&connector).len(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(client.in_flight().is_drained());
    }

    /// Poll `condition` until it holds, failing after one second.
    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(1), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_chunks_sent_one_at_a_time() {
        let gate = Arc::new(Semaphore::new(0));
        let connector = RecordingConnector {
            gate: Some(gate.clone()),
            ..RecordingConnector::default()
        };
        let config = test_config()
            .with_compression(CompressionMode::Never)
            .with_max_datagram_size(200);
        let client = client_with(config, connector.clone());

        let handle = client.info(LogEvent::new("big").full_message(noisy_text(1500)));

        // First chunk is held at the transport
        wait_until(|| client.in_flight().unsent_chunks == 1).await;
        assert!(sent(&connector).is_empty());

        let mut released = 0;
        loop {
            gate.add_permits(1);
            released += 1;

            wait_until(|| sent(&connector).len() == released).await;
            wait_until(|| {
                let counters = client.in_flight();
                counters.unsent_chunks == 1 || counters.unsent_messages == 0
            })
            .await;

            // The next chunk waits for its own permit
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(sent(&connector).len(), released);
            assert!(client.in_flight().unsent_chunks <= 1);

            if client.in_flight().unsent_messages == 0 {
                break;
            }
        }

        let delivery = handle.await.unwrap();
        assert!(delivery.datagrams > 1);
        assert_eq!(delivery.datagrams, released);
        assert!(client.in_flight().is_drained());
    }

    #[tokio::test]
    async fn test_close_waits_for_drain() {
        let gate = Arc::new(Semaphore::new(0));
        let connector = RecordingConnector {
            gate: Some(gate.clone()),
            ..RecordingConnector::default()
        };
        let client = client_with(test_config(), connector.clone());

        let handles: Vec<MessageHandle> = (0..3).map(|i| client.info(format!("m{}", i))).collect();
        let close = client.close();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.state(), LifecycleState::ClosePending);
        assert_eq!(client.in_flight().unsent_messages, 3);

        gate.add_permits(3);

        timeout(Duration::from_secs(1), close)
            .await
            .expect("close should finish after drain")
            .unwrap();

        assert_eq!(client.state(), LifecycleState::Closed);
        assert_eq!(sent(&connector).len(), 3);
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_close_when_idle_is_asynchronous() {
        let connector = RecordingConnector::default();
        let client = client_with(test_config(), connector.clone());

        let close = client.close();
        // Not finalized inside the call
        assert_eq!(client.state(), LifecycleState::ClosePending);

        close.await.unwrap();
        assert_eq!(client.state(), LifecycleState::Closed);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_double_close() {
        let client = client_with(test_config(), RecordingConnector::default());
        let mut errors = client.subscribe_errors();

        let first = client.close();
        let second = client.close();

        assert!(matches!(second.await, Err(GelfError::DoubleClose)));
        first.await.unwrap();
        assert_eq!(client.state(), LifecycleState::Closed);
        assert!(matches!(errors.recv().await, Ok(GelfError::DoubleClose)));

        let (tx, rx) = oneshot::channel();
        client.close_with(move |outcome| {
            let _ = tx.send(outcome);
        });
        assert!(matches!(rx.await.unwrap(), Err(GelfError::DoubleClose)));
        // Callback path does not publish on the channel
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_with_callback_success() {
        let client = client_with(test_config(), RecordingConnector::default());
        let (tx, rx) = oneshot::channel();

        client.close_with(move |outcome| {
            let _ = tx.send(outcome);
        });

        timeout(Duration::from_secs(1), rx)
            .await
            .expect("callback should run")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_after_close_is_rejected() {
        let connector = RecordingConnector::default();
        let client = client_with(test_config(), connector.clone());

        client.info("before").await.unwrap();
        client.close().await.unwrap();

        let result = client.info("after").await;
        assert!(matches!(result, Err(GelfError::DestroyedTransport)));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(sent(&connector).len(), 1);
        assert!(client.in_flight().is_drained());
    }

    #[tokio::test]
    async fn test_real_udp_round_trip() {
        let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let config = Config::new(vec![Destination::new("127.0.0.1", port)])
            .with_hostname("loopback")
            .with_ignore_errors(true);
        let client = GelfClient::new(config).unwrap();

        client
            .notice(LogEvent::new("over the wire").field("id", "abc"))
            .await
            .unwrap();

        let mut buf = vec![0u8; 2048];
        let (len, _) = timeout(Duration::from_secs(1), receiver.recv_from(&mut buf))
            .await
            .expect("datagram should arrive")
            .unwrap();

        let record: Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(record["short_message"], "over the wire");
        assert_eq!(record["__id"], "abc");
        assert_eq!(record["level"], 5);

        client.close().await.unwrap();
    }

    #[test]
    fn test_client_stats_default() {
        let stats = ClientStats::default();
        assert_eq!(stats.messages_sent, 0);
        assert_eq!(stats.datagrams_sent, 0);
        assert_eq!(stats.chunked_messages, 0);
        assert_eq!(stats.messages_failed, 0);
    }
}
