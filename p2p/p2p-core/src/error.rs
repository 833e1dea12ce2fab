//! Errors.

/// An error queuing a request on a peer's connection task.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerRequestError {
    /// The connection task is not keeping up with our requests.
    #[error("the peer's request channel is full")]
    ChannelFull,
    /// The connection task has exited.
    #[error("the peer's request channel is closed")]
    ChannelClosed,
}
