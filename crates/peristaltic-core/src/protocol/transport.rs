//! Transport channel
//!
//! Owns the link to the pump controller. Outgoing requests are serialized by
//! an async mutex that is held from transmitting a request until its reply
//! (value or ack) arrives, so exactly one request is in flight on the line.
//! A dedicated receiver thread reads frames continuously and routes them:
//! replies go to the waiting request through a single-slot channel, per-channel
//! "finished" signals go to the handler registered for that channel.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::commands::{CommandEntry, Incoming};
use super::frame::{read_frame, Frame, PayloadWidth};
use super::stream::CommunicationChannel;
use super::{
    ProtocolError, CHANNEL_COUNT, DEFAULT_CHECKSUM_BACKOFF_FACTOR, DEFAULT_INTER_BYTE_TIMEOUT_MS,
    DEFAULT_TIMEOUT_MS,
};

/// Handler invoked on the receiver thread when a channel reports a finished run
pub type FinishedHandler = Arc<dyn Fn() + Send + Sync>;

/// Transport timing configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Read timeout between bytes of one frame
    pub inter_byte_timeout: Duration,
    /// Maximum wait for a reply or ack; `None` waits forever
    pub response_timeout: Option<Duration>,
    /// After the controller reports a checksum error, the receiver pauses for
    /// this many inter-byte timeouts so the controller drops partial input
    pub checksum_backoff_factor: u32,
    /// Pause after discarding a corrupted or incomplete frame
    pub resync_delay: Duration,
    /// How long the receiver waits for a get caller to consume its value
    pub handoff_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            inter_byte_timeout: Duration::from_millis(DEFAULT_INTER_BYTE_TIMEOUT_MS),
            response_timeout: Some(Duration::from_millis(DEFAULT_TIMEOUT_MS)),
            checksum_backoff_factor: DEFAULT_CHECKSUM_BACKOFF_FACTOR,
            resync_delay: Duration::from_millis(10),
            handoff_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// Snapshot of frame and error counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub tx_frames: u64,
    pub rx_frames: u64,
    /// Corrupted frames received since the last good one
    pub rx_consecutive_errors: u64,
    /// Corrupted or incomplete frames received in total
    pub rx_total_errors: u64,
    /// Command errors reported by the controller
    pub command_errors: u64,
    /// Checksum errors reported by the controller
    pub device_checksum_errors: u64,
    /// Reserved ids nobody handles
    pub unknown_frames: u64,
}

#[derive(Default)]
struct Counters {
    tx_frames: AtomicU64,
    rx_frames: AtomicU64,
    rx_consecutive_errors: AtomicU64,
    rx_total_errors: AtomicU64,
    command_errors: AtomicU64,
    device_checksum_errors: AtomicU64,
    unknown_frames: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> TransportStats {
        TransportStats {
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_consecutive_errors: self.rx_consecutive_errors.load(Ordering::Relaxed),
            rx_total_errors: self.rx_total_errors.load(Ordering::Relaxed),
            command_errors: self.command_errors.load(Ordering::Relaxed),
            device_checksum_errors: self.device_checksum_errors.load(Ordering::Relaxed),
            unknown_frames: self.unknown_frames.load(Ordering::Relaxed),
        }
    }
}

/// What the receiver hands to the request in flight
enum Reply {
    /// Value for a get; `consumed` must be signalled once the frame is read
    Value {
        frame: Frame,
        consumed: std_mpsc::SyncSender<()>,
    },
    Ack,
    CommandError,
    ChecksumError,
}

/// State shared with the receiver thread
struct Shared {
    shutdown: AtomicBool,
    routes: RwLock<[Option<FinishedHandler>; CHANNEL_COUNT]>,
    booted: watch::Sender<bool>,
    counters: Counters,
}

/// Writer half plus the reply slot, guarded together by the send section
struct Link {
    writer: Box<dyn CommunicationChannel>,
    replies: mpsc::Receiver<Reply>,
}

impl Link {
    /// Drop replies left behind by a request that gave up waiting
    fn drain_stale(&mut self) {
        while let Ok(reply) = self.replies.try_recv() {
            match reply {
                Reply::Value { frame, .. } => {
                    warn!("Discarding stale response for command {}", frame.id)
                }
                Reply::Ack => warn!("Discarding stale ack"),
                Reply::CommandError | Reply::ChecksumError => {
                    warn!("Discarding stale error signal")
                }
            }
        }
    }

    fn write(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        let bytes = frame.to_bytes();
        self.writer.write_all(&bytes)?;
        self.writer.flush()?;
        debug!("tx {:02x?}", bytes);
        Ok(())
    }
}

/// Shared transport to one pump controller
pub struct Transport {
    link: tokio::sync::Mutex<Link>,
    shared: Arc<Shared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    config: TransportConfig,
}

impl Transport {
    /// Take ownership of a channel and start the receiver thread
    pub fn start(
        mut channel: Box<dyn CommunicationChannel>,
        config: TransportConfig,
    ) -> Result<Self, ProtocolError> {
        channel.set_timeout(config.inter_byte_timeout)?;
        let reader = channel.try_clone()?;

        let (reply_tx, reply_rx) = mpsc::channel(1);
        let (booted, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            shutdown: AtomicBool::new(false),
            routes: RwLock::new(Default::default()),
            booted,
            counters: Counters::default(),
        });

        let receiver = {
            let shared = shared.clone();
            let config = config.clone();
            thread::Builder::new()
                .name("pump-rx".to_string())
                .spawn(move || receive_loop(reader, reply_tx, shared, config))?
        };

        info!("Transport started");
        Ok(Self {
            link: tokio::sync::Mutex::new(Link {
                writer: channel,
                replies: reply_rx,
            }),
            shared,
            receiver: Mutex::new(Some(receiver)),
            config,
        })
    }

    /// Transport configuration
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Route a channel's finished signal to `handler`, replacing any previous route
    pub fn route_finished(&self, channel: usize, handler: FinishedHandler) {
        let mut routes = self
            .shared
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = routes.get_mut(channel) {
            *slot = Some(handler);
        }
    }

    /// Remove every finished-signal route
    pub fn clear_routes(&self) {
        let mut routes = self
            .shared
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *routes = Default::default();
    }

    /// Whether the controller's boot signal has been seen
    pub fn has_booted(&self) -> bool {
        *self.shared.booted.borrow()
    }

    /// Wait until the controller's boot signal arrives
    pub async fn wait_for_boot(&self, timeout: Duration) -> Result<(), ProtocolError> {
        let mut booted = self.shared.booted.subscribe();
        tokio::time::timeout(timeout, booted.wait_for(|b| *b))
            .await
            .map_err(|_| ProtocolError::Timeout)?
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        Ok(())
    }

    /// Frame and error counters
    pub fn stats(&self) -> TransportStats {
        self.shared.counters.snapshot()
    }

    /// Whether the receiver thread is still running
    pub fn is_running(&self) -> bool {
        !self.shared.shutdown.load(Ordering::Relaxed)
            && self
                .receiver
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .map(|h| !h.is_finished())
                .unwrap_or(false)
    }

    /// Read a register. Blocks the caller until the value reply arrives.
    pub async fn send_get(&self, command_id: u8, width: PayloadWidth) -> Result<u32, ProtocolError> {
        let mut link = self.lock_link().await?;
        link.drain_stale();
        link.write(&Frame::command(command_id))?;
        self.shared.counters.tx_frames.fetch_add(1, Ordering::Relaxed);

        loop {
            match self.next_reply(&mut link.replies).await? {
                Reply::Value { frame, consumed } => {
                    let value = frame.value(width);
                    let _ = consumed.send(());
                    if frame.id != command_id {
                        return Err(ProtocolError::UnexpectedResponse {
                            expected: command_id,
                            actual: frame.id,
                        });
                    }
                    return Ok(value);
                }
                Reply::Ack => warn!("Ignoring ack while waiting for get {}", command_id),
                Reply::CommandError => {
                    return Err(ProtocolError::CommandRejected {
                        command: command_id,
                    })
                }
                Reply::ChecksumError => return Err(ProtocolError::DeviceChecksumError),
            }
        }
    }

    /// Write a register. Returns once the controller acknowledged it.
    pub async fn send_set(
        &self,
        command_id: u8,
        width: PayloadWidth,
        value: u32,
    ) -> Result<(), ProtocolError> {
        let mut link = self.lock_link().await?;
        link.drain_stale();
        link.write(&Frame::with_value(command_id, width, value))?;
        self.shared.counters.tx_frames.fetch_add(1, Ordering::Relaxed);

        loop {
            match self.next_reply(&mut link.replies).await? {
                Reply::Ack => return Ok(()),
                Reply::Value { frame, consumed } => {
                    let _ = consumed.send(());
                    warn!(
                        "Ignoring response {} while waiting for ack of set {}",
                        frame.id, command_id
                    );
                }
                Reply::CommandError => {
                    return Err(ProtocolError::CommandRejected {
                        command: command_id,
                    })
                }
                Reply::ChecksumError => return Err(ProtocolError::DeviceChecksumError),
            }
        }
    }

    async fn lock_link(&self) -> Result<tokio::sync::MutexGuard<'_, Link>, ProtocolError> {
        let link = self.link.lock().await;
        if self.shared.shutdown.load(Ordering::Relaxed) {
            return Err(ProtocolError::ConnectionClosed);
        }
        Ok(link)
    }

    /// Read a register through its command table entry
    pub async fn get(&self, command: CommandEntry) -> Result<u32, ProtocolError> {
        let value = self.send_get(command.id, command.width).await?;
        debug!("{} -> {}", command, value);
        Ok(value)
    }

    /// Write a register through its command table entry
    pub async fn set(&self, command: CommandEntry, value: u32) -> Result<(), ProtocolError> {
        self.send_set(command.id, command.width, value).await?;
        debug!("{} <- {}", command, value);
        Ok(())
    }

    async fn next_reply(&self, replies: &mut mpsc::Receiver<Reply>) -> Result<Reply, ProtocolError> {
        let reply = match self.config.response_timeout {
            Some(timeout) => tokio::time::timeout(timeout, replies.recv())
                .await
                .map_err(|_| ProtocolError::Timeout)?,
            None => replies.recv().await,
        };
        reply.ok_or(ProtocolError::ConnectionClosed)
    }

    /// Stop the receiver thread
    ///
    /// Outside a tokio runtime this blocks until the thread exits, which takes
    /// up to one inter-byte timeout (or the handoff timeout while a reply is
    /// being handed over). Inside a runtime the join moves to the blocking
    /// pool and this returns immediately; use [`close`](Self::close) to wait.
    pub fn shutdown(&self) {
        let Some(handle) = self.stop_receiver() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || join_receiver(handle));
            }
            Err(_) => join_receiver(handle),
        }
    }

    /// Stop the receiver thread and wait for it to exit without blocking the runtime
    pub async fn close(&self) {
        let Some(handle) = self.stop_receiver() else {
            return;
        };
        if tokio::task::spawn_blocking(move || join_receiver(handle))
            .await
            .is_err()
        {
            error!("Could not join the receiver thread");
        }
    }

    fn stop_receiver(&self) -> Option<JoinHandle<()>> {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

fn join_receiver(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        error!("Receiver thread panicked");
    }
    info!("Transport stopped");
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_loop(
    mut reader: Box<dyn CommunicationChannel>,
    replies: mpsc::Sender<Reply>,
    shared: Arc<Shared>,
    config: TransportConfig,
) {
    let counters = &shared.counters;

    while !shared.shutdown.load(Ordering::Relaxed) {
        let bytes = match read_frame(reader.as_mut()) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => continue,
            Err(ProtocolError::ConnectionClosed) => {
                info!("Link closed, receiver exiting");
                break;
            }
            Err(ProtocolError::IncompleteFrame { received, .. }) => {
                counters.rx_total_errors.fetch_add(1, Ordering::Relaxed);
                debug!("Discarding incomplete frame ({} bytes)", received);
                thread::sleep(config.resync_delay);
                continue;
            }
            Err(e) => {
                error!("Receiver read error: {}", e);
                thread::sleep(config.resync_delay);
                continue;
            }
        };

        let frame = match Frame::from_bytes(&bytes) {
            Ok(frame) => {
                counters.rx_consecutive_errors.store(0, Ordering::Relaxed);
                frame
            }
            Err(e) => {
                let consecutive = counters.rx_consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
                let total = counters.rx_total_errors.fetch_add(1, Ordering::Relaxed) + 1;
                error!(
                    "Controller sent a corrupted frame ({}). Consecutive errors: {} | Total errors: {}",
                    e, consecutive, total
                );
                thread::sleep(config.resync_delay);
                continue;
            }
        };
        counters.rx_frames.fetch_add(1, Ordering::Relaxed);
        debug!("rx {:02x?}", bytes);

        match Incoming::classify(frame) {
            Incoming::ChecksumError => {
                counters.device_checksum_errors.fetch_add(1, Ordering::Relaxed);
                error!("Controller received a frame with a wrong checksum");
                offer(&replies, Reply::ChecksumError);
                let backoff = config.inter_byte_timeout * config.checksum_backoff_factor;
                debug!("Waiting {:?} for the controller to reset its buffer", backoff);
                thread::sleep(backoff);
            }
            Incoming::CommandError => {
                counters.command_errors.fetch_add(1, Ordering::Relaxed);
                error!("Controller received a wrong or unsupported command");
                offer(&replies, Reply::CommandError);
            }
            Incoming::Ack => {
                offer(&replies, Reply::Ack);
            }
            Incoming::Booted => {
                info!("Controller boot signal received");
                shared.booted.send_replace(true);
            }
            Incoming::Finished(channel) => {
                let handler = shared
                    .routes
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(channel)
                    .cloned()
                    .flatten();
                match handler {
                    Some(handler) => {
                        debug!("Channel {} finished", channel);
                        handler();
                    }
                    None => {
                        counters.unknown_frames.fetch_add(1, Ordering::Relaxed);
                        warn!("Finished signal for unrouted channel {}", channel);
                    }
                }
            }
            Incoming::Unknown(id) => {
                counters.unknown_frames.fetch_add(1, Ordering::Relaxed);
                warn!("Controller sent an unknown message (id {})", id);
            }
            Incoming::Response(frame) => {
                let (consumed_tx, consumed_rx) = std_mpsc::sync_channel(1);
                if offer(
                    &replies,
                    Reply::Value {
                        frame,
                        consumed: consumed_tx,
                    },
                ) {
                    // Value ready: do not read the next frame until it was consumed
                    match consumed_rx.recv_timeout(config.handoff_timeout) {
                        Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {}
                        Err(std_mpsc::RecvTimeoutError::Timeout) => {
                            warn!("Response {} was not consumed in time", frame.id)
                        }
                    }
                }
            }
        }
    }

    shared.shutdown.store(true, Ordering::Relaxed);
}

/// Put a reply into the single slot; never blocks the receiver
fn offer(replies: &mpsc::Sender<Reply>, reply: Reply) -> bool {
    match replies.try_send(reply) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Reply slot occupied, dropping unsolicited reply");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{self, Read};
    use std::sync::Mutex as StdMutex;

    /// Channel that answers every frame from a canned reply list
    #[derive(Clone)]
    struct ScriptedChannel {
        replies: Arc<StdMutex<VecDeque<u8>>>,
        script: Arc<StdMutex<VecDeque<Vec<Frame>>>>,
        written: Arc<StdMutex<Vec<u8>>>,
        idle_read: Duration,
    }

    impl ScriptedChannel {
        fn new(script: Vec<Vec<Frame>>) -> Self {
            Self {
                replies: Arc::new(StdMutex::new(VecDeque::new())),
                script: Arc::new(StdMutex::new(script.into())),
                written: Arc::new(StdMutex::new(Vec::new())),
                idle_read: Duration::from_millis(2),
            }
        }

        /// How long a read with nothing to deliver blocks
        fn with_idle_read(mut self, idle_read: Duration) -> Self {
            self.idle_read = idle_read;
            self
        }
    }

    impl Read for ScriptedChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                drop(replies);
                thread::sleep(self.idle_read);
                return Err(io::Error::new(io::ErrorKind::TimedOut, "idle"));
            }
            let n = buf.len().min(replies.len());
            for slot in buf.iter_mut().take(n) {
                *slot = replies.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for ScriptedChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            if let Some(frames) = self.script.lock().unwrap().pop_front() {
                let mut replies = self.replies.lock().unwrap();
                for frame in frames {
                    replies.extend(frame.to_bytes());
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CommunicationChannel for ScriptedChannel {
        fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
            Ok(())
        }

        fn clear_input_buffer(&mut self) -> io::Result<()> {
            self.replies.lock().unwrap().clear();
            Ok(())
        }

        fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>> {
            Ok(Box::new(self.clone()))
        }
    }

    fn config() -> TransportConfig {
        TransportConfig {
            response_timeout: Some(Duration::from_millis(200)),
            inter_byte_timeout: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_returns_value() {
        let channel = ScriptedChannel::new(vec![vec![Frame::with_value(
            6,
            PayloadWidth::FourBytes,
            25_000,
        )]]);
        let transport = Transport::start(Box::new(channel.clone()), config()).unwrap();

        let value = transport.send_get(6, PayloadWidth::FourBytes).await.unwrap();
        assert_eq!(value, 25_000);
        assert_eq!(channel.written.lock().unwrap()[0], 6);
        assert_eq!(transport.stats().rx_frames, 1);
    }

    #[tokio::test]
    async fn test_set_waits_for_ack() {
        let channel = ScriptedChannel::new(vec![vec![Frame::command(253)]]);
        let transport = Transport::start(Box::new(channel.clone()), config()).unwrap();

        transport.send_set(1, PayloadWidth::OneByte, 1).await.unwrap();
        let written = channel.written.lock().unwrap().clone();
        assert_eq!(written, Frame::with_value(1, PayloadWidth::OneByte, 1).to_bytes());
    }

    #[tokio::test]
    async fn test_command_error_fails_request() {
        let channel = ScriptedChannel::new(vec![vec![Frame::command(254)]]);
        let transport = Transport::start(Box::new(channel), config()).unwrap();

        let result = transport.send_set(61, PayloadWidth::OneByte, 3).await;
        assert!(matches!(
            result,
            Err(ProtocolError::CommandRejected { command: 61 })
        ));
        assert_eq!(transport.stats().command_errors, 1);
    }

    #[tokio::test]
    async fn test_missing_reply_times_out() {
        let channel = ScriptedChannel::new(vec![vec![]]);
        let transport = Transport::start(Box::new(channel), config()).unwrap();

        let result = transport.send_get(0, PayloadWidth::OneByte).await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn test_finished_signal_routed() {
        let channel = ScriptedChannel::new(vec![vec![
            Frame::command(201),
            Frame::command(253),
        ]]);
        let transport = Transport::start(Box::new(channel), config()).unwrap();

        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        transport.route_finished(
            1,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        transport.send_set(15, PayloadWidth::OneByte, 1).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unrouted_and_unknown_signals_counted() {
        let channel = ScriptedChannel::new(vec![vec![
            Frame::command(203),
            Frame::command(230),
            Frame::command(253),
        ]]);
        let transport = Transport::start(Box::new(channel), config()).unwrap();

        transport.send_set(43, PayloadWidth::OneByte, 0).await.unwrap();
        assert_eq!(transport.stats().unknown_frames, 2);
    }

    #[test]
    fn test_shutdown_joins_receiver() {
        let channel = ScriptedChannel::new(vec![]);
        let transport = Transport::start(Box::new(channel), config()).unwrap();
        assert!(transport.is_running());

        transport.shutdown();
        assert!(!transport.is_running());
        assert!(transport.receiver.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_in_runtime_does_not_block() {
        let channel = ScriptedChannel::new(vec![]).with_idle_read(Duration::from_millis(500));
        let transport = Transport::start(Box::new(channel), config()).unwrap();
        // let the receiver enter a slow read
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        transport.shutdown();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn test_requests_fail_after_shutdown() {
        let channel = ScriptedChannel::new(vec![vec![Frame::command(253)]]);
        let transport = Transport::start(Box::new(channel.clone()), config()).unwrap();

        transport.shutdown();
        assert!(matches!(
            transport.send_set(1, PayloadWidth::OneByte, 1).await,
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(channel.written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_waits_for_receiver() {
        let channel = ScriptedChannel::new(vec![]).with_idle_read(Duration::from_millis(50));
        let transport = Transport::start(Box::new(channel), config()).unwrap();
        let shared = transport.shared.clone();

        transport.close().await;
        assert!(!transport.is_running());
        assert!(transport.receiver.lock().unwrap().is_none());
        // the thread held the only other reference to the shared state
        assert_eq!(Arc::strong_count(&shared), 2);
    }
}
