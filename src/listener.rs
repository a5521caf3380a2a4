use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time;
use tracing::{debug, info};

use crate::encryption::{PacketEncryption, ENVELOPE_LEN};
use crate::error::Error;
use crate::segment::HEADER_LEN;
use crate::session::{Mode, UdpSession};

/// Sessions waiting in `accept`; a full backlog blocks the monitor, which
///  is acceptable backpressure.
const ACCEPT_BACKLOG: usize = 1024;

/// Raw datagrams between the receiver and the monitor.
const PACKET_BACKLOG: usize = 65_535;

const TICK_PERIOD: Duration = Duration::from_millis(10);

const RECV_BUFFER_LEN: usize = 4096;

/// A server listening for sessions on one shared UDP socket.
///
/// Inbound datagrams are demultiplexed by source address; traffic from an
///  unknown address mints a new session whose conversation id is taken from
///  the datagram, and the session is offered on [`accept`](Listener::accept).
pub struct Listener {
    local_addr: SocketAddr,
    accept_rx: Mutex<mpsc::Receiver<UdpSession>>,
    die: watch::Sender<bool>,
}

impl Listener {
    /// Wait for the next inbound session.
    pub async fn accept(&self) -> Result<UdpSession, Error> {
        let mut die = self.die.subscribe();
        if *die.borrow() {
            return Err(Error::ListenerStopped);
        }

        let mut accept_rx = self.accept_rx.lock().await;
        tokio::select! {
            maybe = accept_rx.recv() => maybe.ok_or(Error::ListenerStopped),
            _ = die.changed() => Err(Error::ListenerStopped),
        }
    }

    /// Stop listening. Already accepted sessions keep running; pending ones
    ///  are discarded. A second close returns [`Error::ListenerStopped`].
    pub fn close(&self) -> Result<(), Error> {
        if self.die.send_replace(true) {
            return Err(Error::ListenerStopped);
        }
        debug!(local = %self.local_addr, "listener closed");
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Listen for inbound sessions on `local` ("host:port").
pub async fn listen(mode: Mode, local: &str) -> Result<Listener, Error> {
    listen_with(mode, local, None).await
}

/// Like [`listen`], with per-datagram obfuscation under `key`. Datagrams
///  that fail the checksum, including everything from peers with a
///  different key, are dropped silently.
pub async fn listen_encrypted(mode: Mode, local: &str, key: &[u8]) -> Result<Listener, Error> {
    listen_with(mode, local, Some(Arc::new(PacketEncryption::new(key)))).await
}

async fn listen_with(
    mode: Mode,
    local: &str,
    encryption: Option<Arc<PacketEncryption>>,
) -> Result<Listener, Error> {
    let bind_addr = lookup_host(local)
        .await
        .map_err(|_| Error::AddressResolution(local.to_string()))?
        .next()
        .ok_or_else(|| Error::AddressResolution(local.to_string()))?;

    let socket = UdpSocket::bind(bind_addr).await.map_err(Error::SocketBind)?;
    let local_addr = socket.local_addr().map_err(Error::SocketBind)?;
    info!(local = %local_addr, encrypted = encryption.is_some(), "listening");

    let socket = Arc::new(socket);
    let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
    let (packet_tx, packet_rx) = mpsc::channel(PACKET_BACKLOG);
    let (deadlink_tx, deadlink_rx) = mpsc::channel(ACCEPT_BACKLOG);
    let die = watch::channel(false).0;

    tokio::spawn(receiver_task(socket.clone(), packet_tx, die.subscribe()));

    let monitor = Monitor {
        socket,
        mode,
        encryption,
        sessions: FxHashMap::default(),
        accept_tx,
        deadlink_tx,
    };
    tokio::spawn(monitor.run(packet_rx, deadlink_rx, die.subscribe()));

    Ok(Listener {
        local_addr,
        accept_rx: Mutex::new(accept_rx),
        die,
    })
}

/// Pulls datagrams off the shared socket into the monitor's queue as fast
///  as possible; everything else happens on the monitor.
async fn receiver_task(
    socket: Arc<UdpSocket>,
    packets: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    mut die: watch::Receiver<bool>,
) {
    let mut buffer = vec![0u8; RECV_BUFFER_LEN];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buffer) => {
                match result {
                    Ok((n, from)) if n >= HEADER_LEN => {
                        if packets.send((from, buffer[..n].to_vec())).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {} // runt datagram
                    Err(e) => {
                        debug!("listener socket receive error: {e}");
                        return;
                    }
                }
            }
            _ = die.changed() => return,
        }
    }
}

struct Monitor {
    socket: Arc<UdpSocket>,
    mode: Mode,
    encryption: Option<Arc<PacketEncryption>>,
    sessions: FxHashMap<SocketAddr, UdpSession>,
    accept_tx: mpsc::Sender<UdpSession>,
    deadlink_tx: mpsc::Sender<SocketAddr>,
}

impl Monitor {
    async fn run(
        mut self,
        mut packet_rx: mpsc::Receiver<(SocketAddr, Vec<u8>)>,
        mut deadlink_rx: mpsc::Receiver<SocketAddr>,
        mut die: watch::Receiver<bool>,
    ) {
        let mut ticker = time::interval(TICK_PERIOD);
        loop {
            tokio::select! {
                maybe = packet_rx.recv() => {
                    let Some((from, mut datagram)) = maybe else { return };
                    self.on_datagram(from, &mut datagram).await;
                }
                maybe = deadlink_rx.recv() => {
                    if let Some(addr) = maybe {
                        debug!(remote = %addr, "reaping dead session");
                        self.sessions.remove(&addr);
                    }
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    for session in self.sessions.values() {
                        session.offer_tick(now);
                    }
                }
                _ = die.changed() => return,
            }
        }
    }

    async fn on_datagram(&mut self, from: SocketAddr, datagram: &mut [u8]) {
        let payload: &[u8] = match &self.encryption {
            Some(encryption) => {
                if datagram.len() < HEADER_LEN + ENVELOPE_LEN {
                    return;
                }
                match encryption.open(datagram) {
                    Some(payload) => payload,
                    None => {
                        debug!(remote = %from, "checksum mismatch, dropping datagram");
                        return;
                    }
                }
            }
            // the receiver already enforced the minimum length
            None => datagram,
        };

        if let Some(session) = self.sessions.get(&from) {
            session.input_plaintext(payload).await;
            return;
        }

        // a new peer: adopt the conversation id its first datagram carries
        let conv = u32::from_le_bytes(payload[..4].try_into().expect("payload holds a header"));
        debug!(remote = %from, conv, "new inbound session");

        let session = UdpSession::new(
            conv,
            self.mode,
            self.socket.clone(),
            from,
            self.encryption.clone(),
            Some(self.deadlink_tx.clone()),
        );
        session.input_plaintext(payload).await;
        self.sessions.insert(from, session.clone());

        // a full backlog blocks here, pausing ingestion until accept catches
        //  up; when the accept side is gone, existing sessions keep running
        let _ = self.accept_tx.send(session).await;
    }
}
