//! A reliable, ordered, message-oriented transport built over UDP,
//!  providing connection-like sessions with flow control, congestion
//!  control, selective retransmission and optional per-datagram
//!  obfuscation.
//!
//! ## Design goals
//!
//! * Sessions behave like connections without any handshake: a client
//!   [`dial`]s a remote endpoint, a server [`accept`](Listener::accept)s
//!   sessions minted from inbound traffic on a shared socket. Several
//!   sessions share one server socket, demultiplexed by peer address.
//! * The unit of transfer is a *message* (a defined-length chunk of
//!   bytes); the session surface flattens messages back into a byte
//!   stream. Messages larger than one datagram are fragmented and
//!   reassembled by the protocol, never by IP.
//! * Delivery is reliable and strictly in order within a session. Lost
//!   datagrams are recovered by retransmission, driven by an RTT-adaptive
//!   timeout and optionally by fast retransmit when later segments are
//!   acknowledged past a gap.
//! * Flow control is window based on both ends, with zero-window probing
//!   so a stalled receiver cannot deadlock the sender. Congestion control
//!   (slow start plus congestion avoidance) can be traded away for latency
//!   via the [`Mode`] profiles.
//! * The core protocol state machine ([`engine::ArqEngine`]) performs no
//!   I/O at all: wall-clock time and wire bytes are injected, outbound
//!   datagrams leave through a sink. Everything socket-shaped lives in the
//!   session driver and the listener.
//!
//! ## Wire format
//!
//! A datagram carries one or more segments, each a 24-byte little-endian
//!  header plus payload; segments never span datagrams:
//!
//! ```ascii
//!  0: conv (u32) - conversation id, shared by both peers
//!  4: cmd  (u8)  - 81 PUSH, 82 ACK, 83 window probe, 84 window advert
//!  5: frg  (u8)  - fragments still following in this message, 0 = last
//!  6: wnd  (u16) - sender's free receive-window size, in segments
//!  8: ts   (u32) - send timestamp in ms, echoed by ACKs for RTT sampling
//! 12: sn   (u32) - segment sequence number
//! 16: una  (u32) - smallest sn not yet received in order (cumulative ack)
//! 20: len  (u32) - payload length, PUSH only
//! 24: payload
//! ```
//!
//! All sn/ts comparisons use wrap-around arithmetic, so the 32-bit
//!  counters may roll over freely.
//!
//! ## Obfuscation
//!
//! With a key configured, every datagram is wrapped in a 32-byte envelope
//!  (16-byte random nonce, 16-byte MD5 checksum) and encrypted with
//!  AES-128 in a chained CFB-like mode. This hides traffic from casual
//!  inspection and rejects corrupted or foreign-key datagrams; it is not
//!  authenticated encryption and makes no claim against a real adversary.

mod encryption;
pub mod engine;
mod error;
mod listener;
mod segment;
mod session;

pub use error::Error;
pub use listener::{listen, listen_encrypted, Listener};
pub use session::{dial, dial_encrypted, Mode, UdpSession};

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
