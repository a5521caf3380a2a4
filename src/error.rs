use std::io;

/// Errors surfaced to callers of the session and listener APIs.
///
/// Transient losses on the wire (socket write errors, malformed or
/// out-of-window datagrams, failed checksums) are never surfaced here: the
/// protocol's job is to recover from them, so they are logged and dropped.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operation was attempted on a closed session, or the session was
    ///  torn down because a segment exceeded its retransmission budget.
    #[error("broken pipe")]
    BrokenPipe,

    /// The read deadline elapsed before any data became available.
    #[error("i/o timeout")]
    Timeout,

    /// `accept` was called on a listener that has been closed.
    #[error("listener stopped")]
    ListenerStopped,

    /// The given address did not resolve to any socket address.
    #[error("cannot resolve address {0:?}")]
    AddressResolution(String),

    /// Binding the UDP socket failed (for dials: all port candidates were
    ///  exhausted).
    #[error("cannot bind UDP socket")]
    SocketBind(#[source] io::Error),

    /// A single message offered to the engine would need more than 255
    ///  fragments and cannot be represented on the wire.
    #[error("message of {size} bytes exceeds the fragment limit ({limit} bytes)")]
    OversizedMessage { size: usize, limit: usize },
}
