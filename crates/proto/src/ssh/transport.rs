//! SSH transport core (RFC 4253).
//!
//! [`Transport`] turns a raw bidirectional byte stream into an authenticated,
//! confidential, packet-oriented channel. Connecting performs:
//!
//! 1. **Identification exchange** - send `SSH-2.0-...`, read the server's line
//! 2. **Initial key exchange** - negotiate algorithms, derive and install keys
//! 3. **Steady state** - two pumps run for the life of the connection: a
//!    reader that feeds the streaming decoder and dispatches every decoded
//!    packet, and a writer that drains the bounded outbound queue
//!
//! # Transport states
//!
//! ```text
//! Kex -> KexDone -> ServiceRequest -> Service
//!                (rekey: back to Kex, then KexDone/Service)
//! Error / Stopped are terminal.
//! ```
//!
//! # Concurrency
//!
//! Outbound packets from any task are encoded under the write lock and then
//! enqueued, so wire bytes never interleave. During a rekey the write gate
//! closes: concurrent [`Transport::write_packet`] calls complete either
//! before the peer's KEXINIT is processed or after NEWKEYS, never in
//! between. The reader owns the decoder and inbound algorithm installs;
//! outbound installs happen under the write lock.
//!
//! # Example
//!
//! ```rust,no_run
//! use skiff_proto::ssh::hostkey::AcceptAnyVerifier;
//! use skiff_proto::ssh::transport::{Config, Transport};
//! use tokio::net::TcpStream;
//!
//! # async fn example() -> skiff_platform::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:22").await?;
//! let mut config = Config::default();
//! config.add_host_key_verifier(Box::new(AcceptAnyVerifier));
//!
//! let transport = Transport::connect(stream, "127.0.0.1:22", config).await?;
//! assert!(transport.is_running());
//! assert!(transport.session_id().is_some());
//! # Ok(())
//! # }
//! ```

use crate::ssh::algo::registry::Registry;
use crate::ssh::buffer::Buffer;
use crate::ssh::codec::{Decoder, Encoder};
use crate::ssh::hostkey::HostKeyVerifier;
use crate::ssh::kexer::{DirectionAlgs, KeyExchanger};
use crate::ssh::message::Message;
use crate::ssh::service::Service;
use crate::ssh::sync::Event;
use crate::ssh::version::{IdentReader, Version};
use skiff_platform::{Error, Result, DISCONNECT_BY_APPLICATION};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tracing::{debug, trace, warn};

/// How long a best-effort outbound DISCONNECT may wait for queue space.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Key exchange in progress (initial or rekey).
    Kex,
    /// Key exchange complete; no service active.
    KexDone,
    /// SSH_MSG_SERVICE_REQUEST sent, awaiting SSH_MSG_SERVICE_ACCEPT.
    ServiceRequest,
    /// A service is active and receives non-transport packets.
    Service,
    /// A pump failed; the stored cause is surfaced to every waiter.
    Error,
    /// Shut down by the application.
    Stopped,
}

/// Transport configuration.
pub struct Config {
    /// Software version advertised in the identification line.
    pub software: String,
    /// Timeout applied to every blocking wait (identification, kex, state).
    pub timeout: Duration,
    /// Capacity of the outbound packet queue.
    pub queue_len: usize,
    /// Algorithm factories and preference orders.
    pub registry: Arc<Registry>,
    /// Host key verifier chain, consulted in order.
    pub verifiers: Vec<Box<dyn HostKeyVerifier>>,
}

impl Config {
    /// Appends a host key verifier to the chain.
    pub fn add_host_key_verifier(&mut self, verifier: Box<dyn HostKeyVerifier>) -> &mut Self {
        self.verifiers.push(verifier);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            software: format!("Skiff_{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
            queue_len: 32,
            registry: Arc::new(Registry::default_client()),
            verifiers: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("software", &self.software)
            .field("timeout", &self.timeout)
            .field("queue_len", &self.queue_len)
            .field("verifiers", &self.verifiers.len())
            .finish()
    }
}

/// Poison-tolerant lock: a panicked holder must not wedge the transport.
fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outcome of a gate-respecting send attempt.
pub(crate) enum GateOutcome {
    /// Encoded and enqueued with this sequence number.
    Sent(u32),
    /// The gate closed before the write lock was acquired; the payload is
    /// handed back for a retry.
    Blocked(Buffer),
}

/// The outbound half shared by user writers and the key exchanger: encoder
/// behind the write lock, the bounded queue, and the rekey gate.
pub(crate) struct Outbound {
    encoder: TokioMutex<Encoder>,
    queue: mpsc::Sender<Vec<u8>>,
    gate: watch::Sender<bool>,
}

impl Outbound {
    fn new(encoder: Encoder, queue: mpsc::Sender<Vec<u8>>) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            encoder: TokioMutex::new(encoder),
            queue,
            gate,
        }
    }

    pub(crate) fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub(crate) fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    fn subscribe_gate(&self) -> watch::Receiver<bool> {
        self.gate.subscribe()
    }

    fn enqueue_err() -> Error {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "output pump is gone",
        ))
    }

    /// Encodes and enqueues regardless of the gate. Used for kex packets and
    /// DISCONNECT, which must flow while user traffic is held back.
    pub(crate) async fn send(&self, payload: Buffer) -> Result<u32> {
        let mut encoder = self.encoder.lock().await;
        let (seq, bytes) = encoder.encode(payload)?;
        self.queue.send(bytes).await.map_err(|_| Self::enqueue_err())?;
        Ok(seq)
    }

    /// Sends one packet and atomically installs new outbound algorithms
    /// before releasing the write lock: nothing can be encoded between the
    /// NEWKEYS packet and the algorithm switch.
    pub(crate) async fn send_and_install(&self, payload: Buffer, algs: DirectionAlgs) -> Result<u32> {
        let mut encoder = self.encoder.lock().await;
        let (seq, bytes) = encoder.encode(payload)?;
        self.queue.send(bytes).await.map_err(|_| Self::enqueue_err())?;
        encoder.install(algs.cipher, algs.mac, algs.compression)?;
        Ok(seq)
    }

    /// Encodes and enqueues only if the gate is still open once the write
    /// lock is held; hands the payload back otherwise.
    async fn send_gated(&self, payload: Buffer) -> Result<GateOutcome> {
        let mut encoder = self.encoder.lock().await;
        if !*self.gate.borrow() {
            return Ok(GateOutcome::Blocked(payload));
        }
        let (seq, bytes) = encoder.encode(payload)?;
        self.queue.send(bytes).await.map_err(|_| Self::enqueue_err())?;
        Ok(GateOutcome::Sent(seq))
    }
}

enum Control {
    StartKex,
}

struct Inner {
    software: String,
    timeout: Duration,
    remote_addr: String,
    client_id: String,
    server_id: String,
    outbound: Arc<Outbound>,
    state: watch::Sender<TransportState>,
    error: StdMutex<Option<Error>>,
    session_id: Arc<StdMutex<Option<Vec<u8>>>>,
    authed: Arc<AtomicBool>,
    active_service: StdMutex<Option<Arc<dyn Service>>>,
    pending_service: StdMutex<Option<Arc<dyn Service>>>,
    kex_done: Event,
    stop: watch::Sender<bool>,
    control: mpsc::Sender<Control>,
    closing: AtomicBool,
}

impl Inner {
    fn set_state(&self, next: TransportState) {
        let old = self.state.send_replace(next);
        if old != next {
            debug!("state [ {:?} -> {:?} ]", old, next);
        }
    }

    fn stopping(&self) -> bool {
        *self.stop.borrow()
    }

    fn stored_error(&self) -> Error {
        lock(&self.error)
            .as_ref()
            .map(Error::duplicate)
            .unwrap_or_else(|| Error::Protocol("transport is not running".to_string()))
    }

    fn notify_services(&self, err: &Error) {
        if let Some(service) = lock(&self.active_service).take() {
            service.notify_error(err);
        }
        if let Some(service) = lock(&self.pending_service).take() {
            service.notify_error(err);
        }
    }

    /// Stops both pumps and wakes everything blocked on the transport.
    fn shutdown(&self) {
        self.stop.send_replace(true);
        self.outbound.open_gate();
    }

    /// Error path shared by both pumps and by promoted timeouts: best-effort
    /// DISCONNECT, store the cause, transition to Error, stop pumping.
    async fn fail(&self, err: Error) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("transport error: {}", err);

        if let Some(code) = err.disconnect_reason() {
            let mut packet = Buffer::packet(Message::Disconnect);
            packet.put_u32(code);
            packet.put_string(err.to_string().as_bytes());
            packet.put_string(b"");
            match tokio::time::timeout(DISCONNECT_GRACE, self.outbound.send(packet)).await {
                Ok(Ok(_)) => {}
                _ => debug!("could not send SSH_MSG_DISCONNECT before shutdown"),
            }
        }

        self.notify_services(&err);
        self.kex_done.fail(err.duplicate());
        {
            let mut slot = lock(&self.error);
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.set_state(TransportState::Error);
        self.shutdown();
    }
}

/// A connected client-side SSH transport.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Connects over an established stream: performs the identification
    /// exchange, spawns the pumps, and completes the initial key exchange.
    ///
    /// `remote_addr` is handed to host key verifiers.
    pub async fn connect<S>(
        stream: S,
        remote_addr: impl Into<String>,
        mut config: Config,
    ) -> Result<Transport>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config.registry.validate()?;
        let remote_addr = remote_addr.into();
        let version = Version::new(&config.software);
        let client_id = version.ident_line();

        let (mut source, mut sink) = tokio::io::split(stream);

        debug!("client identity: {}", client_id);
        let (server_id, leftover) =
            tokio::time::timeout(config.timeout, identification_exchange(&version, &mut source, &mut sink))
                .await
                .map_err(|_| Error::Timeout("identification exchange".to_string()))??;
        debug!("server identity: {}", server_id);

        let authed = Arc::new(AtomicBool::new(false));
        let encoder = Encoder::new((config.registry.random)(), authed.clone());
        let mut decoder = Decoder::new(authed.clone());
        decoder.feed(&leftover);

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_len);
        let outbound = Arc::new(Outbound::new(encoder, queue_tx));
        let (state, _) = watch::channel(TransportState::Kex);
        let (stop, _) = watch::channel(false);
        let (control_tx, control_rx) = mpsc::channel(4);
        let session_id = Arc::new(StdMutex::new(None));
        let kex_done = Event::new("kex done");

        let kexer = KeyExchanger::new(
            config.registry.clone(),
            outbound.clone(),
            std::mem::take(&mut config.verifiers),
            remote_addr.clone(),
            client_id.clone(),
            server_id.clone(),
            session_id.clone(),
            kex_done.clone(),
        );

        let inner = Arc::new(Inner {
            software: config.software,
            timeout: config.timeout,
            remote_addr,
            client_id,
            server_id,
            outbound,
            state,
            error: StdMutex::new(None),
            session_id,
            authed,
            active_service: StdMutex::new(None),
            pending_service: StdMutex::new(None),
            kex_done,
            stop,
            control: control_tx,
            closing: AtomicBool::new(false),
        });

        tokio::spawn(writer_pump(inner.clone(), sink, queue_rx));
        tokio::spawn(reader_pump(inner.clone(), source, decoder, kexer, control_rx));

        let transport = Transport { inner: inner.clone() };
        if let Err(err) = inner.kex_done.wait(inner.timeout).await {
            if matches!(err, Error::Timeout(_)) {
                inner.fail(err.duplicate()).await;
            }
            return Err(err);
        }
        Ok(transport)
    }

    /// Encodes one payload under the write lock and enqueues it.
    ///
    /// Blocks while a key exchange is in progress and while the outbound
    /// queue is full. Returns the packet's sequence number.
    pub async fn write_packet(&self, payload: Buffer) -> Result<u32> {
        let deadline = tokio::time::Instant::now() + self.inner.timeout;
        let mut gate = self.inner.outbound.subscribe_gate();
        let mut state = self.inner.state.subscribe();
        let mut payload = payload;

        loop {
            self.ensure_running()?;
            if *gate.borrow_and_update() {
                match self.inner.outbound.send_gated(payload).await? {
                    GateOutcome::Sent(seq) => return Ok(seq),
                    GateOutcome::Blocked(returned) => payload = returned,
                }
                continue;
            }

            tokio::select! {
                _ = gate.changed() => {}
                _ = state.changed() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let err = Error::Timeout("waiting for key exchange to finish".to_string());
                    self.inner.fail(err.duplicate()).await;
                    return Err(err);
                }
            }
        }
    }

    /// Requests a service (RFC 4253 Section 10) and waits until the peer
    /// accepts it. On success the service becomes the destination for all
    /// non-transport packets.
    pub async fn request_service(&self, service: Arc<dyn Service>) -> Result<()> {
        self.ensure_running()?;
        let name = service.name().to_string();
        *lock(&self.inner.pending_service) = Some(service);
        self.inner.set_state(TransportState::ServiceRequest);

        debug!("sending SSH_MSG_SERVICE_REQUEST for {}", name);
        let mut packet = Buffer::packet(Message::ServiceRequest);
        packet.put_string(name.as_bytes());
        self.write_packet(packet).await?;

        self.await_state(TransportState::Service).await
    }

    /// Initiates a rekey. With `wait`, blocks until the exchange completes.
    pub async fn start_kex(&self, wait: bool) -> Result<()> {
        self.ensure_running()?;
        self.inner.kex_done.clear();
        self.inner
            .control
            .send(Control::StartKex)
            .await
            .map_err(|_| Error::Protocol("transport is not running".to_string()))?;
        if wait {
            self.wait_kex_done().await?;
        }
        Ok(())
    }

    /// Sends SSH_MSG_IGNORE with the given payload (keep-alive, padding).
    pub async fn send_ignore(&self, data: &[u8]) -> Result<u32> {
        let mut packet = Buffer::packet(Message::Ignore);
        packet.put_string(data);
        self.write_packet(packet).await
    }

    /// Sends SSH_MSG_DEBUG.
    pub async fn send_debug(&self, always_display: bool, message: &str) -> Result<u32> {
        let mut packet = Buffer::packet(Message::Debug);
        packet.put_bool(always_display);
        packet.put_string(message.as_bytes());
        packet.put_string(b"");
        self.write_packet(packet).await
    }

    /// Sends SSH_MSG_DISCONNECT with the given reason and shuts down.
    /// Idempotent: only the first call has any effect.
    pub async fn disconnect(&self, reason: u32, message: &str) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("sending SSH_MSG_DISCONNECT: reason={}, msg={:?}", reason, message);
        let mut packet = Buffer::packet(Message::Disconnect);
        packet.put_u32(reason);
        packet.put_string(message.as_bytes());
        packet.put_string(b"");
        match tokio::time::timeout(DISCONNECT_GRACE, self.inner.outbound.send(packet)).await {
            Ok(Ok(_)) => {}
            _ => debug!("could not send SSH_MSG_DISCONNECT"),
        }
        let err = Error::Disconnected {
            code: reason,
            message: "disconnected by application".to_string(),
        };
        self.inner.notify_services(&err);
        self.inner.kex_done.fail(err);
        self.inner.set_state(TransportState::Stopped);
        self.inner.shutdown();
    }

    /// [`Transport::disconnect`] with reason "by application".
    pub async fn close(&self) {
        self.disconnect(DISCONNECT_BY_APPLICATION, "").await;
    }

    /// Whether the transport is neither stopped nor in error.
    pub fn is_running(&self) -> bool {
        matches!(
            *self.inner.state.borrow(),
            TransportState::Kex
                | TransportState::KexDone
                | TransportState::ServiceRequest
                | TransportState::Service
        )
    }

    /// The current lifecycle state.
    pub fn state(&self) -> TransportState {
        *self.inner.state.borrow()
    }

    /// The session identifier: the exchange hash of the first key exchange.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        lock(&self.inner.session_id).clone()
    }

    /// Marks user authentication as completed, enabling delayed compression.
    pub fn set_authenticated(&self) {
        debug!("marking transport as authenticated");
        self.inner.authed.store(true, Ordering::Relaxed);
    }

    /// Whether [`Transport::set_authenticated`] has been called.
    pub fn is_authenticated(&self) -> bool {
        self.inner.authed.load(Ordering::Relaxed)
    }

    /// Our identification line.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// The server's identification line.
    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    /// The remote address as given to [`Transport::connect`].
    pub fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    /// The software version string in use.
    pub fn software(&self) -> &str {
        &self.inner.software
    }

    fn ensure_running(&self) -> Result<()> {
        match *self.inner.state.borrow() {
            TransportState::Error => Err(self.inner.stored_error()),
            TransportState::Stopped => {
                Err(Error::Protocol("transport is stopped".to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn wait_kex_done(&self) -> Result<()> {
        match self.inner.kex_done.wait(self.inner.timeout).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if matches!(err, Error::Timeout(_)) {
                    self.inner.fail(err.duplicate()).await;
                }
                Err(err)
            }
        }
    }

    /// Blocks until the transport reaches `want`, a terminal state, or the
    /// configured timeout.
    async fn await_state(&self, want: TransportState) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let waited = async {
            loop {
                let current = *rx.borrow_and_update();
                if current == want {
                    return Ok(());
                }
                match current {
                    TransportState::Error => return Err(self.inner.stored_error()),
                    TransportState::Stopped => {
                        return Err(Error::Protocol("transport is stopped".to_string()))
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(Error::Protocol("transport dropped".to_string()));
                }
            }
        };
        match tokio::time::timeout(self.inner.timeout, waited).await {
            Ok(result) => result,
            Err(_) => {
                let err = Error::Timeout(format!("waiting for state {:?}", want));
                self.inner.fail(err.duplicate()).await;
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

/// Sends our identification line and reads the server's, tolerating banner
/// lines. Returns the server line and any packet bytes read past it.
async fn identification_exchange<S>(
    version: &Version,
    source: &mut ReadHalf<S>,
    sink: &mut WriteHalf<S>,
) -> Result<(String, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite,
{
    sink.write_all(&version.to_wire_format()).await?;

    let mut reader = IdentReader::new();
    let mut chunk = [0u8; 512];
    loop {
        let n = source.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during identification exchange",
            )));
        }
        for (i, &byte) in chunk[..n].iter().enumerate() {
            if let Some(line) = reader.feed(byte)? {
                return Ok((line, chunk[i + 1..n].to_vec()));
            }
        }
    }
}

/// Drains the outbound queue onto the socket.
async fn writer_pump<S>(
    inner: Arc<Inner>,
    mut sink: WriteHalf<S>,
    mut queue: mpsc::Receiver<Vec<u8>>,
) where
    S: AsyncRead + AsyncWrite,
{
    let mut stop = inner.stop.subscribe();
    let result: Result<()> = async {
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        // Flush anything already queued, then hang up.
                        while let Ok(bytes) = queue.try_recv() {
                            let _ = sink.write_all(&bytes).await;
                        }
                        let _ = sink.shutdown().await;
                        return Ok(());
                    }
                }
                item = queue.recv() => match item {
                    Some(bytes) => sink.write_all(&bytes).await.map_err(Error::from)?,
                    None => return Ok(()),
                },
            }
        }
    }
    .await;

    if let Err(err) = result {
        if !inner.stopping() {
            inner.fail(err).await;
        }
    }
    debug!("writer pump stopping");
}

/// Reads the socket, drives the decoder, and dispatches every packet.
async fn reader_pump<S>(
    inner: Arc<Inner>,
    mut source: ReadHalf<S>,
    mut decoder: Decoder,
    mut kexer: KeyExchanger,
    mut control: mpsc::Receiver<Control>,
) where
    S: AsyncRead + AsyncWrite,
{
    let mut stop = inner.stop.subscribe();
    let result: Result<()> = async {
        kexer.start().await?;
        let mut chunk = vec![0u8; 32 * 1024];
        loop {
            while let Some((seq, payload)) = decoder.next_packet()? {
                dispatch(&inner, &mut kexer, &mut decoder, seq, payload).await?;
            }
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return Ok(());
                    }
                }
                ctl = control.recv() => match ctl {
                    Some(Control::StartKex) => {
                        inner.set_state(TransportState::Kex);
                        kexer.start().await?;
                    }
                    None => return Ok(()),
                },
                read = source.read(&mut chunk) => {
                    let n = read.map_err(Error::from)?;
                    if n == 0 {
                        return Err(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection lost",
                        )));
                    }
                    decoder.feed(&chunk[..n]);
                }
            }
        }
    }
    .await;

    match result {
        Ok(()) => {}
        Err(err) => {
            if !inner.stopping() {
                kexer.notify_error(&err);
                inner.fail(err).await;
            }
        }
    }
    debug!("reader pump stopping");
}

/// Central switch over received message types.
async fn dispatch(
    inner: &Arc<Inner>,
    kexer: &mut KeyExchanger,
    decoder: &mut Decoder,
    seq: u32,
    mut payload: Buffer,
) -> Result<()> {
    let raw = payload.compact_data();
    let msg = payload.get_u8()?;
    trace!("received packet #{} message {}", seq, msg);

    // Key exchange traffic goes to the exchanger, including a KEXINIT that
    // starts a peer-initiated rekey.
    if msg == Message::KexInit as u8 || msg == Message::NewKeys as u8 || Message::is_kex_followup(msg)
    {
        if msg == Message::KexInit as u8 && !kexer.ongoing() {
            inner.set_state(TransportState::Kex);
        }
        if kexer.handle(msg, raw, decoder).await? {
            // A rekey must not clobber an active or requested service.
            let next = if lock(&inner.active_service).is_some() {
                TransportState::Service
            } else if lock(&inner.pending_service).is_some() {
                TransportState::ServiceRequest
            } else {
                TransportState::KexDone
            };
            inner.set_state(next);
        }
        return Ok(());
    }

    match Message::from_u8(msg) {
        Some(Message::Disconnect) => {
            let code = payload.get_u32()?;
            let message = payload.get_string_utf8()?;
            debug!("received SSH_MSG_DISCONNECT (code={}, msg={:?})", code, message);
            Err(Error::Disconnected { code, message })
        }

        Some(Message::Ignore) => {
            trace!("received SSH_MSG_IGNORE");
            Ok(())
        }

        Some(Message::Debug) => {
            let always_display = payload.get_bool()?;
            let message = payload.get_string_utf8()?;
            debug!(
                "received SSH_MSG_DEBUG (display={}): {}",
                always_display, message
            );
            Ok(())
        }

        Some(Message::Unimplemented) => {
            let rejected = payload.get_u32()?;
            warn!("peer could not handle our packet #{}", rejected);
            Ok(())
        }

        Some(Message::ServiceAccept) if *inner.state.borrow() == TransportState::ServiceRequest => {
            let accepted = payload.get_string_utf8()?;
            match lock(&inner.pending_service).take() {
                Some(service) if service.name() == accepted => {
                    debug!("setting active service to {}", accepted);
                    *lock(&inner.active_service) = Some(service);
                    inner.set_state(TransportState::Service);
                    Ok(())
                }
                Some(service) => Err(Error::Protocol(format!(
                    "peer accepted service '{}' but '{}' was requested",
                    accepted,
                    service.name()
                ))),
                None => Err(Error::Protocol(
                    "SSH_MSG_SERVICE_ACCEPT with no pending request".to_string(),
                )),
            }
        }

        _ => {
            if kexer.ongoing() {
                return Err(Error::Protocol(format!(
                    "received message {} during key exchange",
                    msg
                )));
            }
            let state = *inner.state.borrow();
            match state {
                TransportState::ServiceRequest => Err(Error::Protocol(format!(
                    "expected SSH_MSG_SERVICE_ACCEPT, got message {}",
                    msg
                ))),
                TransportState::Service => {
                    let service = lock(&inner.active_service).clone();
                    match service {
                        Some(service) => service.handle(msg, payload).await,
                        None => Err(Error::Protocol("no active service".to_string())),
                    }
                }
                _ => {
                    debug!(
                        "no handler for message {} in state {:?}, answering SSH_MSG_UNIMPLEMENTED",
                        msg, state
                    );
                    let mut reply = Buffer::packet(Message::Unimplemented);
                    reply.put_u32(seq);
                    inner.outbound.send(reply).await?;
                    Ok(())
                }
            }
        }
    }
}
