#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parley_domain::UserId;
use parley_protocol::{ErrorEvent, ServerEvent};
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::debug;

/// Live binding of an identity to a connection.
#[derive(Debug, Clone)]
pub struct SessionHandle {
	pub conn_id: u64,

	/// Outbound event queue of the owning connection.
	pub events: mpsc::Sender<ServerEvent>,

	/// Signalled to force-close the owning connection.
	pub shutdown: Arc<Notify>,
}

/// Maps identities to their single live session.
///
/// Duplicate logins are resolved last-writer-wins: the newer registration
/// displaces the older session, which is told it was superseded and
/// force-closed without waiting for the peer.
#[derive(Clone, Default)]
pub struct SessionRegistry {
	inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
	by_user: HashMap<UserId, SessionHandle>,
	by_conn: HashMap<u64, UserId>,
}

impl SessionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Evict any existing session for `user` and hand its handle back.
	///
	/// The evicted connection is told it was superseded and force-closed
	/// without waiting for the peer. The caller tears down the old
	/// presence/typing/room bindings before calling [`Self::install`].
	pub async fn displace(&self, user: &UserId) -> Option<SessionHandle> {
		let mut inner = self.inner.lock().await;

		let old = inner.by_user.remove(user)?;
		inner.by_conn.remove(&old.conn_id);

		let _ = old.events.try_send(ServerEvent::Error(ErrorEvent::new(
			"SESSION_REPLACED",
			"signed in from another connection",
		)));
		old.shutdown.notify_one();

		debug!(user = %user, old_conn = old.conn_id, "session displaced");
		metrics::counter!("parley_server_sessions_displaced_total").increment(1);

		Some(old)
	}

	/// Bind `user` to `handle`, making the session visible to lookups.
	pub async fn install(&self, user: UserId, handle: SessionHandle) {
		let mut inner = self.inner.lock().await;
		inner.by_conn.insert(handle.conn_id, user.clone());
		inner.by_user.insert(user, handle);
	}

	/// Remove the session only if it still points at this exact connection.
	///
	/// Idempotent; a displaced connection fails the current-check and gets
	/// `None`, so its cleanup cascade mutates nothing.
	pub async fn unregister_if_current(&self, conn_id: u64) -> Option<UserId> {
		let mut inner = self.inner.lock().await;

		let user = inner.by_conn.get(&conn_id)?.clone();
		match inner.by_user.get(&user) {
			Some(handle) if handle.conn_id == conn_id => {
				inner.by_user.remove(&user);
				inner.by_conn.remove(&conn_id);
				Some(user)
			}
			_ => {
				inner.by_conn.remove(&conn_id);
				None
			}
		}
	}

	pub async fn lookup(&self, user: &UserId) -> Option<u64> {
		let inner = self.inner.lock().await;
		inner.by_user.get(user).map(|h| h.conn_id)
	}

	/// Identity bound to a connection, if any.
	pub async fn identity_of(&self, conn_id: u64) -> Option<UserId> {
		let inner = self.inner.lock().await;
		inner.by_conn.get(&conn_id).cloned()
	}

	pub async fn session_count(&self) -> usize {
		self.inner.lock().await.by_user.len()
	}
}
