#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parley_domain::{ConversationId, UserId};
use tokio::sync::Mutex;

/// Ephemeral `conversation -> set<identity>` composing state.
///
/// Entries leave on explicit stop, room leave, or disconnect, whichever comes
/// first. There is no server-side timeout.
#[derive(Clone, Default)]
pub struct TypingState {
	inner: Arc<Mutex<HashMap<ConversationId, HashSet<UserId>>>>,
}

impl TypingState {
	pub fn new() -> Self {
		Self::default()
	}

	/// Apply a start/stop transition. Returns whether state changed; a start
	/// while already typing (or a stop while idle) is a no-op.
	pub async fn set_typing(&self, conversation: &ConversationId, user: &UserId, is_typing: bool) -> bool {
		let mut inner = self.inner.lock().await;

		if is_typing {
			inner.entry(conversation.clone()).or_default().insert(user.clone())
		} else {
			let Some(set) = inner.get_mut(conversation) else {
				return false;
			};
			let removed = set.remove(user);
			if set.is_empty() {
				inner.remove(conversation);
			}
			removed
		}
	}

	/// Remove `user` from one conversation. Returns whether they were typing.
	pub async fn clear_user_in(&self, conversation: &ConversationId, user: &UserId) -> bool {
		self.set_typing(conversation, user, false).await
	}

	/// Remove `user` everywhere; returns the conversations they were typing
	/// in so a stop can be synthesized on their behalf.
	pub async fn clear_user(&self, user: &UserId) -> Vec<ConversationId> {
		let mut inner = self.inner.lock().await;

		let mut cleared = Vec::new();
		inner.retain(|conversation, set| {
			if set.remove(user) {
				cleared.push(conversation.clone());
			}
			!set.is_empty()
		});

		cleared
	}

	pub async fn typists(&self, conversation: &ConversationId) -> HashSet<UserId> {
		let inner = self.inner.lock().await;
		inner.get(conversation).cloned().unwrap_or_default()
	}
}
