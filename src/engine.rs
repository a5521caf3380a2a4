use std::cmp;
use std::collections::VecDeque;
use std::mem;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::Error;
use crate::segment::{seq_diff, Command, Segment, WireHeader, HEADER_LEN};

/// Default MTU assumed for wire datagrams. Sessions with packet obfuscation
///  enabled reduce this by the obfuscation envelope so datagrams still fit.
pub const MTU_DEFAULT: usize = 1400;

const RTO_NODELAY_MIN: u32 = 30;
const RTO_MIN: u32 = 100;
const RTO_DEFAULT: u32 = 200;
const RTO_MAX: u32 = 60_000;

const WND_SND_DEFAULT: u32 = 32;
const WND_RCV_DEFAULT: u32 = 32;
const WND_RMT_DEFAULT: u32 = 128;

const INTERVAL_DEFAULT: u32 = 100;
const DEAD_LINK_DEFAULT: u32 = 10;
const SSTHRESH_INIT: u32 = 2;
const SSTHRESH_MIN: u32 = 2;

const PROBE_INIT_MS: u32 = 7_000;
const PROBE_LIMIT_MS: u32 = 120_000;

const PROBE_ASK_SEND: u32 = 1;
const PROBE_ASK_TELL: u32 = 2;

/// The fragment count must fit the 8-bit `frg` field.
const MAX_FRAGMENTS: usize = 255;

/// Why an inbound buffer was rejected. The whole buffer is dropped either
///  way; callers log and move on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputError {
    /// Shorter than a segment header, or a declared payload length pointing
    ///  past the end of the buffer.
    Truncated,
    /// The buffer's conversation id does not belong to this engine.
    ConvMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Alive,
    Dead,
}

type OutputFn = Box<dyn FnMut(&[u8]) + Send>;

/// The ARQ protocol state machine: pure, non-I/O, single-threaded.
///
/// The engine never touches a socket or a clock. Wall-clock time is injected
///  through [`update`](ArqEngine::update), wire bytes come in through
///  [`input`](ArqEngine::input), and outbound datagrams leave through the
///  output sink supplied at construction. The sink is invoked from within
///  `update`/`input` and must not block.
///
/// Invariants maintained across all operations:
/// * `snd_una <= snd_nxt` (wrap-around order); every segment in `snd_buf`
///   has `snd_una <= sn < snd_nxt`
/// * `rcv_buf` holds no duplicate sn and nothing below `rcv_nxt`
/// * `cwnd >= 1`, `ssthresh >= 2`
/// * the in-flight window never exceeds `min(snd_wnd, rmt_wnd)`, nor `cwnd`
///   unless congestion control is disabled
pub struct ArqEngine {
    conv: u32,
    state: LinkState,

    mtu: usize,
    mss: usize,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    snd_wnd: u32,
    rcv_wnd: u32,
    rmt_wnd: u32,
    cwnd: u32,
    ssthresh: u32,
    /// byte-denominated mirror of `cwnd` used during congestion avoidance
    incr: u32,

    rx_srtt: u32,
    rx_rttval: u32,
    rx_rto: u32,
    rx_minrto: u32,

    current: u32,
    interval: u32,
    ts_flush: u32,
    updated: bool,

    probe: u32,
    ts_probe: u32,
    probe_wait: u32,

    /// total timeout retransmissions over the engine's lifetime
    xmit: u32,
    dead_link: u32,

    nodelay: bool,
    fast_resend: u32,
    nocwnd: bool,

    /// messages waiting for admission into the send window
    snd_queue: VecDeque<Segment>,
    /// segments in flight or awaiting first transmission, ordered by sn
    snd_buf: VecDeque<Segment>,
    /// received segments not yet contiguous, ordered by sn
    rcv_buf: VecDeque<Segment>,
    /// contiguous deliverable segments
    rcv_queue: VecDeque<Segment>,
    /// pending acknowledgments as (sn, ts) pairs
    acklist: Vec<(u32, u32)>,

    output: OutputFn,
    /// staging buffer for flush; emitted whenever the next segment would
    ///  exceed the MTU
    buffer: BytesMut,
}

impl ArqEngine {
    /// Create an engine for conversation `conv`. `output` receives every
    ///  outbound datagram (one or more segments, never exceeding the MTU).
    pub fn new(conv: u32, output: impl FnMut(&[u8]) + Send + 'static) -> ArqEngine {
        ArqEngine {
            conv,
            state: LinkState::Alive,
            mtu: MTU_DEFAULT,
            mss: MTU_DEFAULT - HEADER_LEN,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            snd_wnd: WND_SND_DEFAULT,
            rcv_wnd: WND_RCV_DEFAULT,
            rmt_wnd: WND_RMT_DEFAULT,
            cwnd: 1,
            ssthresh: SSTHRESH_INIT,
            incr: (MTU_DEFAULT - HEADER_LEN) as u32,
            rx_srtt: 0,
            rx_rttval: 0,
            rx_rto: RTO_DEFAULT,
            rx_minrto: RTO_MIN,
            current: 0,
            interval: INTERVAL_DEFAULT,
            ts_flush: 0,
            updated: false,
            probe: 0,
            ts_probe: 0,
            probe_wait: 0,
            xmit: 0,
            dead_link: DEAD_LINK_DEFAULT,
            nodelay: false,
            fast_resend: 0,
            nocwnd: false,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            acklist: Vec::new(),
            output: Box::new(output),
            buffer: BytesMut::with_capacity(MTU_DEFAULT + HEADER_LEN),
        }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn mss(&self) -> usize {
        self.mss
    }

    pub fn snd_wnd(&self) -> u32 {
        self.snd_wnd
    }

    /// True once a single segment has been retransmitted `dead_link` times
    ///  without acknowledgment. The state never reverts.
    pub fn is_dead(&self) -> bool {
        self.state == LinkState::Dead
    }

    // ------------------------------------------------------------------
    // application side
    // ------------------------------------------------------------------

    /// Queue `data` as one message, fragmenting it into at most 255 segments
    ///  of up to `mss` bytes. Empty input queues a single empty segment,
    ///  which travels the wire like any other PUSH.
    pub fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            self.snd_queue
                .push_back(Segment::with_payload(Command::Push, 0, Bytes::new()));
            return Ok(());
        }

        let count = data.len().div_ceil(self.mss);
        if count > MAX_FRAGMENTS {
            return Err(Error::OversizedMessage {
                size: data.len(),
                limit: MAX_FRAGMENTS * self.mss,
            });
        }

        // fragment indices count down so the receiver knows how many follow
        for (i, chunk) in data.chunks(self.mss).enumerate() {
            let frg = (count - 1 - i) as u8;
            self.snd_queue.push_back(Segment::with_payload(
                Command::Push,
                frg,
                Bytes::copy_from_slice(chunk),
            ));
        }
        Ok(())
    }

    /// Exact byte length of the next deliverable message, or `None` if no
    ///  complete message is at the head of the receive queue.
    pub fn peek_size(&self) -> Option<usize> {
        let head = self.rcv_queue.front()?;
        if head.frg == 0 {
            return Some(head.payload.len());
        }
        if self.rcv_queue.len() < head.frg as usize + 1 {
            return None;
        }
        let mut size = 0;
        for seg in &self.rcv_queue {
            size += seg.payload.len();
            if seg.frg == 0 {
                break;
            }
        }
        Some(size)
    }

    /// Remove and return the next complete message. Fragmented messages are
    ///  delivered as one concatenated blob, never partially.
    pub fn recv(&mut self) -> Option<Bytes> {
        let size = self.peek_size()?;
        let recovering = self.rcv_queue.len() >= self.rcv_wnd as usize;

        let mut out = BytesMut::with_capacity(size);
        while let Some(seg) = self.rcv_queue.pop_front() {
            out.extend_from_slice(&seg.payload);
            if seg.frg == 0 {
                break;
            }
        }
        debug_assert_eq!(out.len(), size);

        self.promote_rcv_buf();

        // the receive window just reopened: advertise it without waiting to
        //  be probed
        if self.rcv_queue.len() < self.rcv_wnd as usize && recovering {
            self.probe |= PROBE_ASK_TELL;
        }

        Some(out.freeze())
    }

    // ------------------------------------------------------------------
    // network side
    // ------------------------------------------------------------------

    /// Feed one inbound buffer holding a concatenation of wire segments.
    ///
    /// Returns `Ok(true)` when new in-order data became deliverable, which
    ///  is the driver's cue to wake blocked readers.
    pub fn input(&mut self, mut data: &[u8]) -> Result<bool, InputError> {
        if data.len() < HEADER_LEN {
            return Err(InputError::Truncated);
        }

        let prev_una = self.snd_una;
        let mut new_data = false;

        while data.len() >= HEADER_LEN {
            let header = WireHeader::decode(&mut data).ok_or(InputError::Truncated)?;
            if header.conv != self.conv {
                return Err(InputError::ConvMismatch);
            }
            let len = header.len as usize;
            if data.len() < len {
                return Err(InputError::Truncated);
            }

            self.rmt_wnd = header.wnd as u32;
            self.remove_acked_below(header.una);
            self.shrink_snd_buf();

            match header.cmd {
                Command::Ack => {
                    // a ts from the future means peer clock skew, not a
                    //  round trip; skip the sample
                    if seq_diff(self.current, header.ts) >= 0 {
                        self.update_rtt(seq_diff(self.current, header.ts) as u32);
                    }
                    self.parse_ack(header.sn);
                    self.shrink_snd_buf();
                }
                Command::Push => {
                    if seq_diff(header.sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) < 0 {
                        // ack even below-window duplicates: the peer keeps
                        //  retransmitting until it hears one
                        self.acklist.push((header.sn, header.ts));
                        if seq_diff(header.sn, self.rcv_nxt) >= 0 {
                            let mut seg = Segment::with_payload(
                                Command::Push,
                                header.frg,
                                Bytes::copy_from_slice(&data[..len]),
                            );
                            seg.sn = header.sn;
                            seg.ts = header.ts;
                            new_data |= self.parse_data(seg);
                        }
                    } else {
                        trace!(sn = header.sn, "push beyond receive window, dropped");
                    }
                }
                Command::WindowAsk => {
                    self.probe |= PROBE_ASK_TELL;
                }
                Command::WindowTell => {
                    // the window advertisement was already absorbed above
                }
            }

            data = &data[len..];
        }

        if seq_diff(self.snd_una, prev_una) > 0 && !self.nocwnd && self.cwnd < self.rmt_wnd {
            let mss = self.mss as u32;
            if self.cwnd < self.ssthresh {
                // slow start
                self.cwnd += 1;
                self.incr += mss;
            } else {
                // congestion avoidance on the byte-denominated mirror
                if self.incr < mss {
                    self.incr = mss;
                }
                self.incr += (mss * mss) / self.incr + (mss / 16);
                if (self.cwnd + 1) * mss <= self.incr {
                    self.cwnd += 1;
                }
            }
            if self.cwnd > self.rmt_wnd {
                self.cwnd = self.rmt_wnd;
                self.incr = self.rmt_wnd * mss;
            }
        }

        Ok(new_data)
    }

    /// Drop everything the cumulative ack covers.
    fn remove_acked_below(&mut self, una: u32) {
        while let Some(front) = self.snd_buf.front() {
            if seq_diff(front.sn, una) < 0 {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn shrink_snd_buf(&mut self) {
        self.snd_una = self.snd_buf.front().map(|s| s.sn).unwrap_or(self.snd_nxt);
    }

    fn parse_ack(&mut self, sn: u32) {
        if seq_diff(sn, self.snd_una) < 0 || seq_diff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for i in 0..self.snd_buf.len() {
            match seq_diff(sn, self.snd_buf[i].sn) {
                0 => {
                    self.snd_buf.remove(i);
                    break;
                }
                d if d < 0 => break,
                // an ack skipped over this in-flight segment
                _ => self.snd_buf[i].fast_ack += 1,
            }
        }
    }

    fn update_rtt(&mut self, rtt: u32) {
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttval = rtt / 2;
        } else {
            let delta = rtt.abs_diff(self.rx_srtt);
            self.rx_rttval = (3 * self.rx_rttval + delta) / 4;
            self.rx_srtt = cmp::max((7 * self.rx_srtt + rtt) / 8, 1);
        }
        let rto = self.rx_srtt + cmp::max(self.interval, 4 * self.rx_rttval);
        self.rx_rto = rto.clamp(self.rx_minrto, RTO_MAX);
    }

    /// Insert a PUSH into the out-of-order buffer (sorted by sn, duplicates
    ///  discarded) and promote any newly contiguous prefix into the
    ///  deliverable queue. Returns whether anything became deliverable.
    fn parse_data(&mut self, seg: Segment) -> bool {
        let sn = seg.sn;
        if seq_diff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) >= 0
            || seq_diff(sn, self.rcv_nxt) < 0
        {
            return false;
        }

        // arrivals are typically near-ordered, so scan from the tail
        let mut index = self.rcv_buf.len();
        let mut duplicate = false;
        for i in (0..self.rcv_buf.len()).rev() {
            match seq_diff(sn, self.rcv_buf[i].sn) {
                0 => {
                    duplicate = true;
                    break;
                }
                d if d > 0 => {
                    index = i + 1;
                    break;
                }
                _ => index = i,
            }
        }
        if !duplicate {
            self.rcv_buf.insert(index, seg);
        }

        self.promote_rcv_buf()
    }

    fn promote_rcv_buf(&mut self) -> bool {
        let mut moved = false;
        while let Some(front) = self.rcv_buf.front() {
            if front.sn == self.rcv_nxt && self.rcv_queue.len() < self.rcv_wnd as usize {
                let seg = self.rcv_buf.pop_front().expect("front was just inspected");
                self.rcv_queue.push_back(seg);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                moved = true;
            } else {
                break;
            }
        }
        moved
    }

    // ------------------------------------------------------------------
    // timing
    // ------------------------------------------------------------------

    /// Advance the engine clock and flush when the interval elapsed. A clock
    ///  jump of more than ten seconds in either direction resynchronizes the
    ///  flush schedule instead of replaying every missed interval.
    pub fn update(&mut self, current: u32) {
        self.current = current;
        if !self.updated {
            self.updated = true;
            self.ts_flush = current;
        }

        let mut slap = seq_diff(current, self.ts_flush);
        if !(-10_000..10_000).contains(&slap) {
            self.ts_flush = current;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if seq_diff(current, self.ts_flush) >= 0 {
                self.ts_flush = current.wrapping_add(self.interval);
            }
            self.flush();
        }
    }

    /// Earliest time at which `update` would do meaningful work: the next
    ///  scheduled flush or the earliest pending retransmission, whichever
    ///  comes first. Drivers use this to skip no-op updates.
    pub fn check(&self, current: u32) -> u32 {
        if !self.updated {
            return current;
        }

        let mut ts_flush = self.ts_flush;
        if !(-10_000..10_000).contains(&seq_diff(current, ts_flush)) {
            ts_flush = current;
        }
        if seq_diff(current, ts_flush) >= 0 {
            return current;
        }

        let tm_flush = seq_diff(ts_flush, current);
        let mut tm_packet = i32::MAX;
        for seg in &self.snd_buf {
            let diff = seq_diff(seg.resend_ts, current);
            if diff <= 0 {
                return current;
            }
            tm_packet = cmp::min(tm_packet, diff);
        }

        let minimal = cmp::min(cmp::min(tm_packet, tm_flush) as u32, self.interval);
        current.wrapping_add(minimal)
    }

    fn wnd_unused(&self) -> u16 {
        let queued = self.rcv_queue.len() as u32;
        if queued < self.rcv_wnd {
            cmp::min(self.rcv_wnd - queued, u16::MAX as u32) as u16
        } else {
            0
        }
    }

    /// Build and emit all due outbound segments: pending acks, window
    ///  probes/advertisements, first transmissions, timeout retransmissions
    ///  and fast retransmissions, then apply the congestion response.
    fn flush(&mut self) {
        // flushing before the first clock injection would stamp garbage
        if !self.updated {
            return;
        }

        let current = self.current;
        let wnd = self.wnd_unused();
        let mut buffer = mem::take(&mut self.buffer);

        fn emit(output: &mut OutputFn, buffer: &mut BytesMut) {
            if !buffer.is_empty() {
                output(buffer.as_ref());
                buffer.clear();
            }
        }

        // pending acks
        let acklist = mem::take(&mut self.acklist);
        for (sn, ts) in acklist {
            if buffer.len() + HEADER_LEN > self.mtu {
                emit(&mut self.output, &mut buffer);
            }
            let mut seg = Segment::new(Command::Ack);
            seg.wnd = wnd;
            seg.una = self.rcv_nxt;
            seg.sn = sn;
            seg.ts = ts;
            seg.encode(self.conv, &mut buffer);
        }

        // zero-window probing: back off 1.5x from 7s up to 120s
        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT_MS;
                self.ts_probe = current.wrapping_add(self.probe_wait);
            } else if seq_diff(current, self.ts_probe) >= 0 {
                if self.probe_wait < PROBE_INIT_MS {
                    self.probe_wait = PROBE_INIT_MS;
                }
                self.probe_wait += self.probe_wait / 2;
                self.probe_wait = cmp::min(self.probe_wait, PROBE_LIMIT_MS);
                self.ts_probe = current.wrapping_add(self.probe_wait);
                self.probe |= PROBE_ASK_SEND;
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }

        if self.probe & PROBE_ASK_SEND != 0 {
            if buffer.len() + HEADER_LEN > self.mtu {
                emit(&mut self.output, &mut buffer);
            }
            let mut seg = Segment::new(Command::WindowAsk);
            seg.wnd = wnd;
            seg.una = self.rcv_nxt;
            seg.encode(self.conv, &mut buffer);
        }
        if self.probe & PROBE_ASK_TELL != 0 {
            if buffer.len() + HEADER_LEN > self.mtu {
                emit(&mut self.output, &mut buffer);
            }
            let mut seg = Segment::new(Command::WindowTell);
            seg.wnd = wnd;
            seg.una = self.rcv_nxt;
            seg.encode(self.conv, &mut buffer);
        }
        self.probe = 0;

        // effective transmit window
        let mut cwnd = cmp::min(self.snd_wnd, self.rmt_wnd);
        if !self.nocwnd {
            cwnd = cmp::min(self.cwnd, cwnd);
        }

        // admit queued messages into the send window
        while seq_diff(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) < 0 {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            seg.sn = self.snd_nxt;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            seg.rto = self.rx_rto;
            seg.resend_ts = current;
            seg.fast_ack = 0;
            seg.xmit = 0;
            self.snd_buf.push_back(seg);
        }

        let resent = if self.fast_resend > 0 {
            self.fast_resend
        } else {
            u32::MAX
        };
        let rto_min = if self.nodelay { 0 } else { self.rx_rto >> 3 };

        let mut lost = false;
        let mut change = false;

        for i in 0..self.snd_buf.len() {
            let need_send;
            let payload_len;
            {
                let seg = &mut self.snd_buf[i];
                let mut send = false;
                if seg.xmit == 0 {
                    // first transmission
                    send = true;
                    seg.xmit = 1;
                    seg.rto = self.rx_rto;
                    seg.resend_ts = current.wrapping_add(seg.rto).wrapping_add(rto_min);
                } else if seq_diff(current, seg.resend_ts) >= 0 {
                    // retransmission timeout, with exponential backoff
                    send = true;
                    seg.xmit += 1;
                    self.xmit += 1;
                    let backoff = cmp::max(seg.rto, self.rx_rto);
                    seg.rto += if self.nodelay { backoff / 2 } else { backoff };
                    seg.resend_ts = current.wrapping_add(seg.rto);
                    lost = true;
                } else if seg.fast_ack >= resent {
                    // enough later segments were acked past this one
                    send = true;
                    seg.xmit += 1;
                    seg.fast_ack = 0;
                    seg.resend_ts = current.wrapping_add(seg.rto);
                    change = true;
                }

                if send {
                    seg.ts = current;
                    seg.wnd = wnd;
                    seg.una = self.rcv_nxt;
                }
                need_send = send;
                payload_len = seg.payload.len();
            }

            if need_send {
                if buffer.len() + HEADER_LEN + payload_len > self.mtu {
                    emit(&mut self.output, &mut buffer);
                }
                self.snd_buf[i].encode(self.conv, &mut buffer);

                if self.snd_buf[i].xmit >= self.dead_link && self.state == LinkState::Alive {
                    debug!(
                        sn = self.snd_buf[i].sn,
                        xmit = self.snd_buf[i].xmit,
                        "retransmission budget exhausted, marking link dead"
                    );
                    self.state = LinkState::Dead;
                }
            }
        }

        emit(&mut self.output, &mut buffer);
        self.buffer = buffer;

        // congestion response
        if change {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = cmp::max(inflight / 2, SSTHRESH_MIN);
            self.cwnd = self.ssthresh + resent;
            self.incr = self.cwnd * self.mss as u32;
        }
        if lost {
            self.ssthresh = cmp::max(cwnd / 2, SSTHRESH_MIN);
            self.cwnd = 1;
            self.incr = self.mss as u32;
        }
        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = self.mss as u32;
        }
    }

    // ------------------------------------------------------------------
    // configuration
    // ------------------------------------------------------------------

    /// Tune the latency/throughput trade-off. `interval_ms` is clamped to
    ///  [10, 5000]; `fast_resend == 0` disables fast retransmit; `nocwnd`
    ///  disables the congestion window entirely.
    pub fn set_nodelay(&mut self, nodelay: bool, interval_ms: u32, fast_resend: u32, nocwnd: bool) {
        self.nodelay = nodelay;
        self.rx_minrto = if nodelay { RTO_NODELAY_MIN } else { RTO_MIN };
        self.interval = interval_ms.clamp(10, 5_000);
        self.fast_resend = fast_resend;
        self.nocwnd = nocwnd;
    }

    /// Window limits in segments. Zero leaves the respective limit unchanged.
    pub fn set_wnd_size(&mut self, snd: u16, rcv: u16) {
        if snd > 0 {
            self.snd_wnd = snd as u32;
        }
        if rcv > 0 {
            self.rcv_wnd = rcv as u32;
        }
    }

    /// Set the maximum datagram size. Values below 50 bytes cannot carry a
    ///  meaningful segment and are ignored.
    pub fn set_mtu(&mut self, mtu: usize) {
        if mtu < 50 {
            debug!(mtu, "rejecting unusably small mtu");
            return;
        }
        self.mtu = mtu;
        self.mss = mtu - HEADER_LEN;
    }

    /// Retransmission budget per segment before the link is declared dead.
    pub fn set_dead_link(&mut self, retries: u32) {
        self.dead_link = retries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::{Arc, Mutex};

    type Captured = Arc<Mutex<Vec<Vec<u8>>>>;

    fn capturing_engine(conv: u32) -> (ArqEngine, Captured) {
        let captured: Captured = Default::default();
        let sink = captured.clone();
        let engine = ArqEngine::new(conv, move |data: &[u8]| {
            sink.lock().unwrap().push(data.to_vec());
        });
        (engine, captured)
    }

    /// Parse all segments out of the captured datagrams.
    fn captured_headers(captured: &Captured) -> Vec<WireHeader> {
        let mut headers = Vec::new();
        for datagram in captured.lock().unwrap().iter() {
            let mut buf: &[u8] = datagram;
            while buf.len() >= HEADER_LEN {
                let header = WireHeader::decode(&mut buf).unwrap();
                buf = &buf[header.len as usize..];
                headers.push(header);
            }
        }
        headers
    }

    /// Two engines wired back to back through in-memory queues, driven by a
    ///  deterministic millisecond clock. `keep` decides delivery per
    ///  datagram (both directions share one counter).
    struct Link {
        a: ArqEngine,
        b: ArqEngine,
        a_out: Captured,
        b_out: Captured,
        now: u32,
        datagram_counter: usize,
    }

    impl Link {
        fn new(conv: u32) -> Link {
            let (a, a_out) = capturing_engine(conv);
            let (b, b_out) = capturing_engine(conv);
            Link { a, b, a_out, b_out, now: 0, datagram_counter: 0 }
        }

        fn run(&mut self, ms: u32, keep: &mut dyn FnMut(usize, &[u8]) -> bool) {
            for _ in 0..ms {
                self.now += 1;
                self.a.update(self.now);
                self.b.update(self.now);

                let outbound: Vec<Vec<u8>> = self.a_out.lock().unwrap().drain(..).collect();
                for datagram in outbound {
                    if keep(self.datagram_counter, &datagram) {
                        self.b.input(&datagram).unwrap();
                    }
                    self.datagram_counter += 1;
                }
                let outbound: Vec<Vec<u8>> = self.b_out.lock().unwrap().drain(..).collect();
                for datagram in outbound {
                    if keep(self.datagram_counter, &datagram) {
                        self.a.input(&datagram).unwrap();
                    }
                    self.datagram_counter += 1;
                }
            }
        }

        fn run_lossless(&mut self, ms: u32) {
            self.run(ms, &mut |_, _| true);
        }
    }

    #[rstest]
    #[case::single(100, vec![0])]
    #[case::exactly_mss(1376, vec![0])]
    #[case::two_fragments(1377, vec![1, 0])]
    #[case::three_fragments(3000, vec![2, 1, 0])]
    fn test_send_fragmentation(#[case] len: usize, #[case] expected_frgs: Vec<u8>) {
        let (mut engine, _) = capturing_engine(1);
        assert_eq!(engine.mss(), 1376);

        engine.send(&vec![0xab; len]).unwrap();

        let frgs: Vec<u8> = engine.snd_queue.iter().map(|s| s.frg).collect();
        assert_eq!(frgs, expected_frgs);
        let total: usize = engine.snd_queue.iter().map(|s| s.payload.len()).sum();
        assert_eq!(total, len);
        assert!(engine.snd_queue.iter().all(|s| s.payload.len() <= engine.mss()));
    }

    #[test]
    fn test_send_empty_message_queues_one_segment() {
        let (mut engine, _) = capturing_engine(1);
        engine.send(&[]).unwrap();
        assert_eq!(engine.snd_queue.len(), 1);
        assert!(engine.snd_queue[0].payload.is_empty());
        assert_eq!(engine.snd_queue[0].frg, 0);
    }

    #[test]
    fn test_send_rejects_oversized_message() {
        let (mut engine, _) = capturing_engine(1);
        engine.set_mtu(50);
        let oversized = vec![0u8; engine.mss() * 256];
        assert!(matches!(
            engine.send(&oversized),
            Err(Error::OversizedMessage { .. })
        ));
    }

    #[test]
    fn test_echo_roundtrip() {
        let mut link = Link::new(0x11223344);
        link.a.send(b"hello").unwrap();
        link.run_lossless(300);

        assert_eq!(link.b.recv().unwrap().as_ref(), b"hello");
        link.b.send(b"hello").unwrap();
        link.run_lossless(300);

        assert_eq!(link.a.recv().unwrap().as_ref(), b"hello");
        // everything acknowledged on both sides
        assert_eq!(link.a.snd_una, link.a.snd_nxt);
        assert_eq!(link.b.snd_una, link.b.snd_nxt);
        assert!(link.a.snd_buf.is_empty());
        assert!(link.b.snd_buf.is_empty());
    }

    #[test]
    fn test_fragmented_message_delivered_whole() {
        let mut link = Link::new(7);
        link.a.set_mtu(200);
        link.b.set_mtu(200);
        assert_eq!(link.a.mss(), 176);

        let message: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        link.a.send(&message).unwrap();
        assert_eq!(link.a.snd_queue.len(), 6);
        assert_eq!(
            link.a.snd_queue.iter().map(|s| s.frg).collect::<Vec<_>>(),
            vec![5, 4, 3, 2, 1, 0]
        );

        link.run_lossless(1000);
        let received = link.b.recv().unwrap();
        assert_eq!(received.as_ref(), message.as_slice());
        assert!(link.b.recv().is_none());
    }

    #[test]
    fn test_out_of_order_arrival_is_reordered() {
        let mut link = Link::new(9);
        link.a.set_nodelay(false, 100, 0, true); // both segments in one flush
        link.a.send(b"first").unwrap();
        link.a.send(b"second").unwrap();
        link.a.update(1); // flush both segments

        let datagrams: Vec<Vec<u8>> = link.a_out.lock().unwrap().drain(..).collect();
        // both PUSH segments coalesced into a single datagram: split them
        let mut segments = Vec::new();
        for datagram in &datagrams {
            let mut buf: &[u8] = datagram;
            while buf.len() >= HEADER_LEN {
                let start_len = buf.len();
                let header = WireHeader::decode(&mut buf).unwrap();
                let total = HEADER_LEN + header.len as usize;
                let offset = datagram.len() - start_len;
                segments.push(datagram[offset..offset + total].to_vec());
                buf = &buf[header.len as usize..];
            }
        }
        assert_eq!(segments.len(), 2);

        // deliver in reverse order
        link.b.input(&segments[1]).unwrap();
        assert!(link.b.recv().is_none());
        assert_eq!(link.b.rcv_buf.len(), 1);
        let newly_deliverable = link.b.input(&segments[0]).unwrap();
        assert!(newly_deliverable);

        assert_eq!(link.b.recv().unwrap().as_ref(), b"first");
        assert_eq!(link.b.recv().unwrap().as_ref(), b"second");
    }

    #[test]
    fn test_duplicate_push_buffered_once() {
        let mut link = Link::new(9);
        link.a.send(b"once").unwrap();
        link.a.update(1);

        let datagram: Vec<u8> = link.a_out.lock().unwrap().drain(..).next().unwrap();
        link.b.input(&datagram).unwrap();
        link.b.input(&datagram).unwrap();

        assert_eq!(link.b.recv().unwrap().as_ref(), b"once");
        assert!(link.b.recv().is_none());
        // the duplicate still earned an ack so the sender stops resending
        assert_eq!(link.b.acklist.len(), 2);
    }

    #[test]
    fn test_lossy_transfer_completes_in_order() {
        let mut link = Link::new(0xdead);
        link.a.set_nodelay(true, 10, 2, true);
        link.b.set_nodelay(true, 10, 2, true);
        link.a.set_wnd_size(128, 128);
        link.b.set_wnd_size(128, 128);

        let mut sent = Vec::new();
        for i in 0..50u32 {
            let message: Vec<u8> = (0..1000u32).map(|j| ((i + j) % 251) as u8).collect();
            link.a.send(&message).unwrap();
            sent.extend_from_slice(&message);
        }

        // drop every 7th datagram in either direction, and keep a tally of
        //  how often each data segment crossed the wire
        let mut transmissions: std::collections::HashMap<u32, u32> = Default::default();
        let mut prev_una = 0u32;
        for _ in 0..150 {
            link.run(100, &mut |counter, datagram| {
                let mut buf: &[u8] = datagram;
                while buf.len() >= HEADER_LEN {
                    let header = WireHeader::decode(&mut buf).unwrap();
                    buf = &buf[header.len as usize..];
                    if header.cmd == Command::Push {
                        *transmissions.entry(header.sn).or_default() += 1;
                    }
                }
                counter % 7 != 0
            });
            // snd_una only ever moves forward
            assert!(seq_diff(link.a.snd_una, prev_una) >= 0);
            prev_una = link.a.snd_una;
        }

        let mut received = Vec::new();
        while let Some(message) = link.b.recv() {
            received.extend_from_slice(&message);
        }
        assert_eq!(received, sent);
        assert!(
            transmissions.values().any(|&count| count > 1),
            "loss must have caused retransmissions"
        );
        assert_eq!(link.a.snd_una, link.a.snd_nxt);
    }

    #[test]
    fn test_fast_retransmit_beats_the_rto() {
        let mut link = Link::new(5);
        link.a.set_nodelay(true, 10, 2, true);
        link.b.set_nodelay(true, 10, 2, true);

        // five full-size messages, one datagram each
        for _ in 0..5 {
            link.a.send(&vec![0x55; 1300]).unwrap();
        }

        // lose the first data datagram only; the acks for the later four
        //  push the first segment's skip count past the threshold
        link.run(150, &mut |counter, _| counter != 0);

        let mut received = 0;
        while let Some(message) = link.b.recv() {
            received += message.len();
        }
        // 150ms is well below the 200ms initial RTO, so only a fast
        //  retransmission can have repaired the gap
        assert_eq!(received, 5 * 1300);
        assert_eq!(link.a.xmit, 0, "no timeout retransmission should have fired");
    }

    #[test]
    fn test_conv_mismatch_rejects_buffer() {
        let (mut sender, out) = capturing_engine(1);
        let (mut receiver, _) = capturing_engine(2);

        sender.send(b"mismatch").unwrap();
        sender.update(1);
        let datagram: Vec<u8> = out.lock().unwrap().drain(..).next().unwrap();

        assert_eq!(receiver.input(&datagram), Err(InputError::ConvMismatch));
        assert!(receiver.recv().is_none());
    }

    #[rstest]
    #[case::truncated_header(vec![0u8; HEADER_LEN - 4])]
    #[case::truncated_payload({
        let mut seg = Segment::with_payload(Command::Push, 0, Bytes::from_static(b"abcdef"));
        seg.sn = 0;
        let mut buf = BytesMut::new();
        seg.encode(1, &mut buf);
        buf.truncate(buf.len() - 3);
        buf.to_vec()
    })]
    fn test_malformed_input_rejected(#[case] raw: Vec<u8>) {
        let (mut engine, _) = capturing_engine(1);
        assert_eq!(engine.input(&raw), Err(InputError::Truncated));
    }

    #[rstest]
    #[case::first_sample(vec![100], 100, 50, 300)]
    #[case::converging(vec![100, 100, 100, 100], 100, 20, 200)]
    #[case::floor_at_minrto(vec![1, 1, 1, 1, 1, 1, 1, 1], 1, 0, 101)]
    fn test_rtt_estimator(
        #[case] samples: Vec<u32>,
        #[case] expected_srtt: u32,
        #[case] expected_rttval: u32,
        #[case] expected_rto: u32,
    ) {
        let (mut engine, _) = capturing_engine(1);
        for sample in samples {
            engine.update_rtt(sample);
        }
        assert_eq!(engine.rx_srtt, expected_srtt);
        assert_eq!(engine.rx_rttval, expected_rttval);
        assert_eq!(engine.rx_rto, expected_rto);
    }

    #[test]
    fn test_rto_stays_bounded() {
        let (mut engine, _) = capturing_engine(1);
        for sample in [0, 1, 7, 100_000, 3, 1_000_000, 0] {
            engine.update_rtt(sample);
            assert!(engine.rx_rto >= engine.rx_minrto);
            assert!(engine.rx_rto <= RTO_MAX);
        }
    }

    #[test]
    fn test_transmit_window_respects_remote_window() {
        let (mut engine, out) = capturing_engine(3);
        engine.set_nodelay(false, 10, 0, true); // congestion window out of the picture

        // remote advertises a window of 2
        let mut tell = Segment::new(Command::WindowTell);
        tell.wnd = 2;
        let mut buf = BytesMut::new();
        tell.encode(3, &mut buf);
        engine.input(&buf).unwrap();

        for _ in 0..10 {
            engine.send(b"window test").unwrap();
        }
        engine.update(1);
        engine.update(20);

        assert_eq!(engine.snd_buf.len(), 2);
        assert_eq!(engine.snd_queue.len(), 8);
        let pushes = captured_headers(&out)
            .iter()
            .filter(|h| h.cmd == Command::Push)
            .count();
        assert_eq!(pushes, 2);
    }

    #[test]
    fn test_zero_remote_window_triggers_probe_backoff() {
        let (mut engine, out) = capturing_engine(4);

        // remote advertises a closed window
        let mut tell = Segment::new(Command::WindowTell);
        tell.wnd = 0;
        let mut buf = BytesMut::new();
        tell.encode(4, &mut buf);
        engine.input(&buf).unwrap();
        engine.send(b"waiting for window").unwrap();

        let mut now = 0;
        let mut probe_times = Vec::new();
        while now < 25_000 {
            now += 10;
            engine.update(now);
            for header in captured_headers(&out) {
                if header.cmd == Command::WindowAsk {
                    probe_times.push(now);
                }
            }
            out.lock().unwrap().clear();
            // the closed window also blocks all data
            assert!(engine.snd_buf.is_empty());
        }

        assert_eq!(probe_times.len(), 2);
        // first probe after ~7000ms, second after a further ~10500ms
        assert!((7_000..7_200).contains(&probe_times[0]), "{probe_times:?}");
        let gap = probe_times[1] - probe_times[0];
        assert!((10_500..10_700).contains(&gap), "{probe_times:?}");
    }

    #[test]
    fn test_window_ask_answered_with_window_tell() {
        let (mut engine, out) = capturing_engine(6);

        let ask = Segment::new(Command::WindowAsk);
        let mut buf = BytesMut::new();
        ask.encode(6, &mut buf);
        engine.input(&buf).unwrap();
        engine.update(1);

        let headers = captured_headers(&out);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].cmd, Command::WindowTell);
        assert_eq!(headers[0].wnd, WND_RCV_DEFAULT as u16);
    }

    #[test]
    fn test_draining_full_receive_queue_advertises_window() {
        let mut link = Link::new(8);
        link.a.set_wnd_size(32, 0);
        link.b.set_wnd_size(0, 2); // tiny receive window

        for _ in 0..3 {
            link.a.send(b"fill").unwrap();
        }
        link.run_lossless(2000);

        // the receive queue is pinned at the window limit
        assert_eq!(link.b.rcv_queue.len(), 2);
        assert_eq!(link.b.wnd_unused(), 0);

        while link.b.recv().is_some() {}
        assert!(link.b.probe & PROBE_ASK_TELL != 0);

        link.b_out.lock().unwrap().clear();
        link.b.update(link.now + 100);
        let tells = captured_headers(&link.b_out)
            .iter()
            .filter(|h| h.cmd == Command::WindowTell)
            .count();
        assert_eq!(tells, 1);
    }

    #[test]
    fn test_dead_link_latches() {
        let (mut engine, out) = capturing_engine(2);
        engine.set_dead_link(3);
        engine.send(b"into the void").unwrap();

        let mut now = 0;
        while !engine.is_dead() && now < 60_000 {
            now += 10;
            engine.update(now);
        }

        assert!(engine.is_dead());
        // the state flipped at the exact transmission that hit the budget
        assert!(engine.snd_buf.iter().all(|s| s.xmit <= 3));
        assert!(!out.lock().unwrap().is_empty());

        // dead is latched
        engine.update(now + 1_000);
        assert!(engine.is_dead());
    }

    #[test]
    fn test_check_schedules_next_flush() {
        let (mut engine, _) = capturing_engine(1);
        // before the first update there is no schedule to report
        assert_eq!(engine.check(123), 123);

        engine.update(1_000);
        let next = engine.check(1_000);
        assert!(next > 1_000);
        assert!(next <= 1_000 + engine.interval);

        // a pending retransmission moves the wakeup earlier than the flush
        engine.send(b"pending").unwrap();
        engine.update(engine.check(1_000));
        let resend_ts = engine.snd_buf[0].resend_ts;
        let next = engine.check(resend_ts.wrapping_sub(5));
        assert!(seq_diff(next, resend_ts) <= 0);

        // past the retransmission time, update is due immediately
        assert_eq!(engine.check(resend_ts), resend_ts);
    }

    #[test]
    fn test_cwnd_grows_until_remote_window() {
        let mut link = Link::new(10);
        link.a.set_wnd_size(64, 0);
        link.b.set_wnd_size(0, 64);

        for _ in 0..60 {
            link.a.send(&vec![1u8; 1300]).unwrap();
        }
        assert_eq!(link.a.cwnd, 1);
        link.run_lossless(5_000);

        let mut total = 0;
        while let Some(message) = link.b.recv() {
            total += message.len();
        }
        assert_eq!(total, 60 * 1300);
        assert!(link.a.cwnd > 1);
        assert!(link.a.cwnd <= 64);
    }
}
