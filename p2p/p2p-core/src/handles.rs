//! Connection handles.
//!
//! Every connection has one [`ConnectionGuard`], held by the task reading and writing the socket,
//! and any number of [`ConnectionHandle`]s. The sync manager uses its handle to drop peers that
//! misbehave, the guard's owner reads the ban back with [`ConnectionHandle::check_should_ban`] to
//! update the address book.
use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Builds a connected [`ConnectionGuard`] and [`ConnectionHandle`] pair.
#[derive(Default, Debug)]
pub struct HandleBuilder {
    parent: Option<CancellationToken>,
}

impl HandleBuilder {
    pub const fn new() -> Self {
        Self { parent: None }
    }

    /// Closes the connection when `parent` is cancelled, for example on node shutdown.
    #[must_use]
    pub fn with_parent_token(mut self, parent: &CancellationToken) -> Self {
        self.parent = Some(parent.child_token());
        self
    }

    pub fn build(self) -> (ConnectionGuard, ConnectionHandle) {
        let closed = self.parent.unwrap_or_default();

        let handle = ConnectionHandle {
            closed: closed.clone(),
            ban: Arc::new(OnceLock::new()),
        };

        (ConnectionGuard { closed }, handle)
    }
}

/// How long a peer should be banned for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BanPeer(pub Duration);

/// The connection task's side of a connection.
///
/// Dropping the guard marks the connection as closed for every [`ConnectionHandle`].
#[derive(Debug)]
pub struct ConnectionGuard {
    closed: CancellationToken,
}

impl ConnectionGuard {
    /// Resolves once a handle asks for the connection to be closed.
    pub fn should_shutdown(&self) -> WaitForCancellationFutureOwned {
        self.closed.clone().cancelled_owned()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// A cloneable handle to ban or disconnect a peer.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    closed: CancellationToken,
    ban: Arc<OnceLock<BanPeer>>,
}

impl ConnectionHandle {
    /// Records a ban of `duration` and closes the connection.
    ///
    /// A peer can only be banned once, later bans are ignored.
    pub fn ban_peer(&self, duration: Duration) {
        if self.ban.set(BanPeer(duration)).is_err() {
            tracing::trace!("Peer already banned, keeping the first ban.");
        }
        self.closed.cancel();
    }

    /// Closes the connection without banning the peer.
    pub fn send_close_signal(&self) {
        self.closed.cancel();
    }

    /// Returns `true` once the connection is closed, by either side.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Returns the ban recorded with [`Self::ban_peer`], if any.
    pub fn check_should_ban(&self) -> Option<BanPeer> {
        self.ban.get().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ban_closes_connection() {
        let (_guard, handle) = HandleBuilder::new().build();
        assert!(!handle.is_closed());

        handle.ban_peer(Duration::from_secs(60));
        handle.ban_peer(Duration::from_secs(1));

        assert!(handle.is_closed());
        assert_eq!(
            handle.check_should_ban(),
            Some(BanPeer(Duration::from_secs(60)))
        );
    }

    #[test]
    fn dropping_guard_closes_handle() {
        let (guard, handle) = HandleBuilder::new().build();
        drop(guard);

        assert!(handle.is_closed());
        assert_eq!(handle.check_should_ban(), None);
    }

    #[test]
    fn parent_token_closes_connection() {
        let parent = CancellationToken::new();
        let (_guard, handle) = HandleBuilder::new().with_parent_token(&parent).build();

        parent.cancel();
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn guard_sees_close_signal() {
        let (guard, handle) = HandleBuilder::new().build();

        handle.send_close_signal();
        guard.should_shutdown().await;
    }
}
