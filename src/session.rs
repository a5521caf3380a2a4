use std::cmp;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use rand::Rng;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::{self, sleep};
use tracing::{debug, info, trace, warn};

use crate::encryption::{PacketEncryption, ENVELOPE_LEN};
use crate::engine::{ArqEngine, MTU_DEFAULT};
use crate::error::Error;
use crate::segment::{seq_diff, HEADER_LEN};

/// Window size applied to sessions, in segments. The outbound datagram
///  queue shares this bound, so a stalled socket backpressures the flush.
const SESSION_WND: u16 = 128;

/// Tick period for driving engine updates.
const TICK_PERIOD: Duration = Duration::from_millis(10);

/// Blocked readers re-check their deadline at least this often.
const READ_RETRY: Duration = Duration::from_secs(1);

const RECV_BUFFER_LEN: usize = 4096;

const DIAL_BASE_PORT: u16 = 20_000;
const DIAL_MAX_PORT: u16 = 65_535;
const DIAL_ATTEMPTS: usize = 64;

/// Latency/throughput profile applied to a session at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Conservative: 40 ms flush interval, congestion window enabled.
    Default,
    /// 20 ms flush interval, congestion window disabled.
    Normal,
    /// Lowest latency: 10 ms interval, fast retransmit after two skipped
    ///  acks, congestion window disabled.
    Fast,
}

impl Mode {
    fn apply(self, engine: &mut ArqEngine) {
        match self {
            Mode::Default => engine.set_nodelay(false, 40, 0, false),
            Mode::Normal => engine.set_nodelay(false, 20, 0, true),
            Mode::Fast => engine.set_nodelay(true, 10, 2, true),
        }
    }
}

/// Engine plus the stream-level state, everything behind the one session
///  mutex.
struct SessionCore {
    engine: ArqEngine,
    /// remainder of a received message that did not fit the caller's buffer
    residual: Bytes,
    read_deadline: Option<Instant>,
    closed: bool,
    /// set when input or writes changed engine state between ticks
    need_update: bool,
}

/// A connection-like session over UDP: a bidirectional, reliable, ordered
///  byte stream with read deadlines.
///
/// Clients obtain one via [`dial`]; servers via
///  [`Listener::accept`](crate::Listener::accept). Cloning is shallow and
///  yields another handle onto the same session.
#[derive(Clone)]
pub struct UdpSession {
    core: Arc<Mutex<SessionCore>>,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    conv: u32,
    encryption: Option<Arc<PacketEncryption>>,
    /// origin of this session's millisecond engine clock
    epoch: Instant,
    read_event: Arc<Notify>,
    die: watch::Sender<bool>,
    /// server sessions get their clock fanned out by the listener
    tick: Option<mpsc::Sender<Instant>>,
}

impl UdpSession {
    /// `deadlink` marks a server-side session: its update task reports the
    ///  remote address there when the session dies, and the listener owns
    ///  ingestion. Client sessions (`None`) run their own ingest task.
    pub(crate) fn new(
        conv: u32,
        mode: Mode,
        socket: Arc<UdpSocket>,
        remote_addr: SocketAddr,
        encryption: Option<Arc<PacketEncryption>>,
        deadlink: Option<mpsc::Sender<SocketAddr>>,
    ) -> UdpSession {
        let local_addr = socket
            .local_addr()
            .expect("UdpSocket should have an initialized local addr");

        let (out_tx, out_rx) = mpsc::channel::<Bytes>(SESSION_WND as usize);
        let mut engine = ArqEngine::new(conv, move |data: &[u8]| {
            if data.len() < HEADER_LEN {
                return;
            }
            if out_tx.try_send(Bytes::copy_from_slice(data)).is_err() {
                // the emitter is behind; the ARQ layer retransmits
                trace!("outbound queue full, dropping datagram");
            }
        });
        engine.set_wnd_size(SESSION_WND, SESSION_WND);
        if encryption.is_some() {
            engine.set_mtu(MTU_DEFAULT - ENVELOPE_LEN);
        }
        mode.apply(&mut engine);

        let is_server = deadlink.is_some();
        let (tick_tx, tick_rx) = if is_server {
            let (tx, rx) = mpsc::channel(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let session = UdpSession {
            core: Arc::new(Mutex::new(SessionCore {
                engine,
                residual: Bytes::new(),
                read_deadline: None,
                closed: false,
                need_update: false,
            })),
            socket,
            local_addr,
            remote_addr,
            conv,
            encryption,
            epoch: Instant::now(),
            read_event: Arc::new(Notify::new()),
            die: watch::channel(false).0,
            tick: tick_tx,
        };

        debug!(conv, remote = %remote_addr, server = is_server, "session created");

        tokio::spawn(session.clone().emit_task(out_rx));
        tokio::spawn(session.clone().update_task(tick_rx, deadlink));
        if !is_server {
            tokio::spawn(session.clone().ingest_task());
        }
        session
    }

    /// Read from the session's byte stream. Returns leftover bytes of a
    ///  previously received message first; otherwise takes the next
    ///  complete message from the engine, returns what fits and keeps the
    ///  remainder. Blocks until data, close, or the read deadline.
    pub async fn read(&self, buffer: &mut [u8]) -> Result<usize, Error> {
        loop {
            {
                let mut core = self.core.lock().await;

                if !core.residual.is_empty() {
                    let n = cmp::min(buffer.len(), core.residual.len());
                    buffer[..n].copy_from_slice(&core.residual[..n]);
                    core.residual.advance(n);
                    return Ok(n);
                }

                if core.closed {
                    return Err(Error::BrokenPipe);
                }

                if let Some(deadline) = core.read_deadline {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                }

                if let Some(message) = core.engine.recv() {
                    let n = cmp::min(buffer.len(), message.len());
                    buffer[..n].copy_from_slice(&message[..n]);
                    core.residual = message.slice(n..);
                    return Ok(n);
                }
            }

            tokio::select! {
                _ = self.read_event.notified() => {}
                _ = sleep(READ_RETRY) => {}
            }
        }
    }

    /// Queue `buffer` for sending, chunked so every piece fits the engine's
    ///  fragment limit. Never blocks on the peer; write deadlines are not
    ///  enforced.
    pub async fn write(&self, buffer: &[u8]) -> Result<usize, Error> {
        let mut core = self.core.lock().await;
        if core.closed {
            return Err(Error::BrokenPipe);
        }

        let chunk_limit = core.engine.mss() * cmp::min(core.engine.snd_wnd(), 255) as usize;
        if buffer.is_empty() {
            core.engine.send(buffer)?;
        } else {
            for chunk in buffer.chunks(chunk_limit) {
                core.engine.send(chunk)?;
            }
        }
        core.need_update = true;
        Ok(buffer.len())
    }

    /// Close the session and stop its tasks. A second close returns
    ///  [`Error::BrokenPipe`].
    pub async fn close(&self) -> Result<(), Error> {
        let mut core = self.core.lock().await;
        if core.closed {
            return Err(Error::BrokenPipe);
        }
        core.closed = true;
        drop(core);

        debug!(conv = self.conv, remote = %self.remote_addr, "session closed");
        self.die.send_replace(true);
        self.read_event.notify_one();
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The conversation id shared with the peer.
    pub fn conv(&self) -> u32 {
        self.conv
    }

    /// Set both deadlines. Only the read deadline has an effect, see
    ///  [`set_write_deadline`](UdpSession::set_write_deadline).
    pub async fn set_deadline(&self, deadline: Option<Instant>) {
        self.core.lock().await.read_deadline = deadline;
    }

    /// A `None` deadline disables the read timeout.
    pub async fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.core.lock().await.read_deadline = deadline;
    }

    /// Accepted for interface symmetry but not enforced: writes only queue
    ///  into the engine and never wait for the peer.
    pub async fn set_write_deadline(&self, _deadline: Option<Instant>) {}

    /// Window limits in segments; zero leaves the respective limit as is.
    pub async fn set_window_size(&self, snd: u16, rcv: u16) {
        self.core.lock().await.engine.set_wnd_size(snd, rcv);
    }

    /// Maximum size of wire datagrams. With obfuscation enabled the engine
    ///  is given correspondingly less so the envelope still fits.
    pub async fn set_mtu(&self, mtu: usize) {
        let effective = if self.encryption.is_some() {
            mtu.saturating_sub(ENVELOPE_LEN)
        } else {
            mtu
        };
        self.core.lock().await.engine.set_mtu(effective);
    }

    /// Per-segment retransmission budget before the session is declared
    ///  dead and closed.
    pub async fn set_retries(&self, retries: u32) {
        self.core.lock().await.engine.set_dead_link(retries);
    }

    /// Offer a clock tick to a server session; dropped when the previous
    ///  tick is still pending, which is fine because updates are idempotent
    ///  against elapsed time.
    pub(crate) fn offer_tick(&self, now: Instant) {
        if let Some(tick) = &self.tick {
            let _ = tick.try_send(now);
        }
    }

    /// Feed an already decrypted buffer of wire segments into the engine,
    ///  waking blocked readers when new in-order data arrived.
    pub(crate) async fn input_plaintext(&self, payload: &[u8]) {
        let mut core = self.core.lock().await;
        let outcome = core.engine.input(payload);
        core.need_update = true;
        drop(core);

        match outcome {
            Ok(true) => self.read_event.notify_one(),
            Ok(false) => {}
            Err(reason) => {
                trace!(remote = %self.remote_addr, ?reason, "dropping invalid buffer");
            }
        }
    }

    /// Drains the engine's outbound queue onto the socket, applying the
    ///  obfuscation envelope last.
    async fn emit_task(self, mut out_rx: mpsc::Receiver<Bytes>) {
        let mut die = self.die.subscribe();
        loop {
            tokio::select! {
                maybe = out_rx.recv() => {
                    let Some(packet) = maybe else { return };
                    let result = match &self.encryption {
                        Some(encryption) => {
                            self.socket.send_to(&encryption.seal(&packet), self.remote_addr).await
                        }
                        None => self.socket.send_to(&packet, self.remote_addr).await,
                    };
                    if let Err(e) = result {
                        // UDP is lossy anyway; the engine retransmits
                        warn!(remote = %self.remote_addr, "socket send error: {e}");
                    }
                }
                _ = die.changed() => return,
            }
        }
    }

    /// Pumps the engine from wall-clock time: clients from a local 10 ms
    ///  timer, server sessions from ticks fanned out by the listener.
    async fn update_task(
        self,
        tick_rx: Option<mpsc::Receiver<Instant>>,
        deadlink: Option<mpsc::Sender<SocketAddr>>,
    ) {
        let mut die = self.die.subscribe();
        let mut next_update: u32 = 0;

        match tick_rx {
            None => {
                let mut ticker = time::interval(TICK_PERIOD);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if self.on_tick(Instant::now(), &mut next_update).await {
                                break;
                            }
                        }
                        _ = die.changed() => break,
                    }
                }
            }
            Some(mut tick_rx) => {
                loop {
                    tokio::select! {
                        maybe = tick_rx.recv() => {
                            let Some(now) = maybe else { break };
                            if self.on_tick(now, &mut next_update).await {
                                break;
                            }
                        }
                        _ = die.changed() => break,
                    }
                }
            }
        }

        if let Some(deadlink) = deadlink {
            let _ = deadlink.send(self.remote_addr).await;
        }
    }

    /// Returns true when the session died on this tick.
    async fn on_tick(&self, now: Instant, next_update: &mut u32) -> bool {
        let current = now.saturating_duration_since(self.epoch).as_millis() as u32;

        let mut core = self.core.lock().await;
        if seq_diff(current, *next_update) >= 0 || core.need_update {
            core.engine.update(current);
            *next_update = core.engine.check(current);
        }
        core.need_update = false;
        let dead = core.engine.is_dead();
        drop(core);

        if dead {
            debug!(conv = self.conv, remote = %self.remote_addr, "dead link, closing session");
            let _ = self.close().await;
            return true;
        }
        false
    }

    /// Client-side ingest: blocking receive loop on the connected socket.
    async fn ingest_task(self) {
        let mut die = self.die.subscribe();
        let mut buffer = vec![0u8; RECV_BUFFER_LEN];
        loop {
            tokio::select! {
                result = self.socket.recv(&mut buffer) => {
                    match result {
                        Ok(n) => self.ingest_datagram(&mut buffer[..n]).await,
                        Err(e) => {
                            debug!(remote = %self.remote_addr, "socket receive error: {e}");
                            return;
                        }
                    }
                }
                _ = die.changed() => return,
            }
        }
    }

    async fn ingest_datagram(&self, datagram: &mut [u8]) {
        match &self.encryption {
            Some(encryption) => {
                if datagram.len() < HEADER_LEN + ENVELOPE_LEN {
                    return;
                }
                match encryption.open(datagram) {
                    Some(payload) => self.input_plaintext(payload).await,
                    None => {
                        debug!(remote = %self.remote_addr, "checksum mismatch, dropping datagram");
                    }
                }
            }
            None => {
                if datagram.len() >= HEADER_LEN {
                    self.input_plaintext(datagram).await;
                }
            }
        }
    }
}

/// Connect to `remote` ("host:port"). The local socket binds a random port
///  in [20000, 65535]; the conversation id is chosen randomly.
pub async fn dial(mode: Mode, remote: &str) -> Result<UdpSession, Error> {
    dial_with(mode, remote, None).await
}

/// Like [`dial`], with per-datagram obfuscation under `key`. Both peers
///  must use the same key or no traffic will get through.
pub async fn dial_encrypted(mode: Mode, remote: &str, key: &[u8]) -> Result<UdpSession, Error> {
    dial_with(mode, remote, Some(Arc::new(PacketEncryption::new(key)))).await
}

async fn dial_with(
    mode: Mode,
    remote: &str,
    encryption: Option<Arc<PacketEncryption>>,
) -> Result<UdpSession, Error> {
    let remote_addr = lookup_host(remote)
        .await
        .map_err(|_| Error::AddressResolution(remote.to_string()))?
        .next()
        .ok_or_else(|| Error::AddressResolution(remote.to_string()))?;

    let socket = bind_random_port(remote_addr.is_ipv4()).await?;
    socket.connect(remote_addr).await.map_err(Error::SocketBind)?;
    info!(remote = %remote_addr, local = ?socket.local_addr(), "dialing");

    let conv = rand::thread_rng().gen::<u32>();
    Ok(UdpSession::new(
        conv,
        mode,
        Arc::new(socket),
        remote_addr,
        encryption,
        None,
    ))
}

async fn bind_random_port(ipv4: bool) -> Result<UdpSocket, Error> {
    let mut last_error = None;
    for _ in 0..DIAL_ATTEMPTS {
        let port = rand::thread_rng().gen_range(DIAL_BASE_PORT..DIAL_MAX_PORT);
        let local: SocketAddr = if ipv4 {
            (Ipv4Addr::UNSPECIFIED, port).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, port).into()
        };
        match UdpSocket::bind(local).await {
            Ok(socket) => return Ok(socket),
            Err(e) => last_error = Some(e),
        }
    }
    Err(Error::SocketBind(
        last_error.expect("at least one bind attempt was made"),
    ))
}
