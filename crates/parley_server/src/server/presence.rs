#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use parley_domain::UserId;
use tokio::sync::Mutex;

/// Set of identities with a live session.
///
/// Mutated only by the registration/disconnect cascade in the chat service.
#[derive(Clone, Default)]
pub struct PresenceTracker {
	online: Arc<Mutex<HashSet<UserId>>>,
}

impl PresenceTracker {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn mark_online(&self, user: UserId) -> bool {
		let mut online = self.online.lock().await;
		let added = online.insert(user);
		if added {
			metrics::gauge!("parley_server_online_users").set(online.len() as f64);
		}
		added
	}

	pub async fn mark_offline(&self, user: &UserId) -> bool {
		let mut online = self.online.lock().await;
		let removed = online.remove(user);
		if removed {
			metrics::gauge!("parley_server_online_users").set(online.len() as f64);
		}
		removed
	}

	pub async fn is_online(&self, user: &UserId) -> bool {
		self.online.lock().await.contains(user)
	}

	pub async fn snapshot(&self) -> HashSet<UserId> {
		self.online.lock().await.clone()
	}
}
