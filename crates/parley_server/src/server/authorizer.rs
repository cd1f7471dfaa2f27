#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parley_domain::{ConversationId, UserId};
use tokio::sync::Mutex;

use crate::server::errors::ChatError;
use crate::server::store::ChatStore;

const MAX_CACHE_ENTRIES: usize = 4096;

/// Gate for every conversation-scoped action.
///
/// Consults the store's participant relation with a short-lived positive
/// cache; denials are never cached, so a fresh grant is visible on the next
/// attempt.
pub struct MembershipAuthorizer {
	store: Arc<dyn ChatStore>,
	ttl: Duration,
	cache: Mutex<HashMap<(ConversationId, UserId), Instant>>,
}

impl MembershipAuthorizer {
	pub fn new(store: Arc<dyn ChatStore>, ttl: Duration) -> Self {
		Self {
			store,
			ttl,
			cache: Mutex::new(HashMap::new()),
		}
	}

	/// Check that `user` participates in `conversation`.
	pub async fn authorize(&self, user: &UserId, conversation: &ConversationId) -> Result<(), ChatError> {
		let key = (conversation.clone(), user.clone());

		if self.ttl > Duration::ZERO {
			let mut cache = self.cache.lock().await;
			if let Some(granted_at) = cache.get(&key) {
				if granted_at.elapsed() < self.ttl {
					metrics::counter!("parley_server_authorize_cache_hits_total").increment(1);
					return Ok(());
				}
				cache.remove(&key);
			}
		}

		let role = self
			.store
			.membership(conversation, user)
			.await
			.map_err(ChatError::Persistence)?;

		if role.is_none() {
			metrics::counter!("parley_server_authorize_denied_total").increment(1);
			return Err(ChatError::AuthorizationDenied(conversation.to_string()));
		}

		if self.ttl > Duration::ZERO {
			let mut cache = self.cache.lock().await;
			if cache.len() >= MAX_CACHE_ENTRIES {
				cache.clear();
			}
			cache.insert(key, Instant::now());
		}

		Ok(())
	}
}
