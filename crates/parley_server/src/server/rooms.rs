#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parley_domain::ConversationId;
use parley_protocol::ServerEvent;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Per-conversation broadcast router.
///
/// Delivery is bounded and non-blocking: a full or closed subscriber queue
/// drops the event best-effort and closed subscribers are pruned.
#[derive(Clone)]
pub struct RoomRouter {
	inner: Arc<Mutex<Inner>>,
	cfg: RoomRouterConfig,
}

/// Configuration for `RoomRouter`.
#[derive(Debug, Clone)]
pub struct RoomRouterConfig {
	/// Maximum number of queued events per subscriber.
	pub subscriber_queue_capacity: usize,
}

impl Default for RoomRouterConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
		}
	}
}

#[derive(Default)]
struct Inner {
	rooms: HashMap<ConversationId, RoomEntry>,
}

#[derive(Default)]
struct RoomEntry {
	subscribers: Vec<RoomSubscriber>,
}

struct RoomSubscriber {
	conn_id: u64,
	tx: mpsc::Sender<ServerEvent>,
}

impl RoomRouter {
	pub fn new(cfg: RoomRouterConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Queue capacity a subscriber channel should be created with.
	pub fn subscriber_queue_capacity(&self) -> usize {
		self.cfg.subscriber_queue_capacity
	}

	/// Subscribe a connection's outbound queue to a conversation.
	pub async fn join(&self, conversation: ConversationId, conn_id: u64, tx: mpsc::Sender<ServerEvent>) {
		let mut inner = self.inner.lock().await;
		let entry = inner.rooms.entry(conversation.clone()).or_default();

		prune_closed_subscribers(entry);

		if entry.subscribers.iter().any(|s| s.conn_id == conn_id) {
			return;
		}

		entry.subscribers.push(RoomSubscriber { conn_id, tx });
		debug!(conversation = %conversation, subs = entry.subscribers.len(), "room router: joined");
	}

	pub async fn leave(&self, conversation: &ConversationId, conn_id: u64) -> bool {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.rooms.get_mut(conversation) else {
			return false;
		};

		let before = entry.subscribers.len();
		entry.subscribers.retain(|s| s.conn_id != conn_id && !s.tx.is_closed());
		let removed = entry.subscribers.len() < before;

		if entry.subscribers.is_empty() {
			inner.rooms.remove(conversation);
		}

		removed
	}

	/// Remove a connection from every room; returns the conversations left.
	pub async fn leave_all(&self, conn_id: u64) -> Vec<ConversationId> {
		let mut inner = self.inner.lock().await;

		let mut left = Vec::new();
		inner.rooms.retain(|conversation, entry| {
			let before = entry.subscribers.len();
			entry.subscribers.retain(|s| s.conn_id != conn_id && !s.tx.is_closed());
			if entry.subscribers.len() < before {
				left.push(conversation.clone());
			}
			!entry.subscribers.is_empty()
		});

		left
	}

	/// Deliver `event` to every subscriber of `conversation`, except the
	/// excluded connection.
	pub async fn publish(&self, conversation: &ConversationId, event: ServerEvent, excluding: Option<u64>) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.rooms.get_mut(conversation) else {
			return;
		};

		prune_closed_subscribers(entry);

		if entry.subscribers.is_empty() {
			inner.rooms.remove(conversation);
			return;
		}

		let mut dropped_total: u64 = 0;

		for sub in entry.subscribers.iter() {
			if Some(sub.conn_id) == excluding {
				continue;
			}

			match sub.tx.try_send(event.clone()) {
				Ok(()) => {}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;
					metrics::counter!("parley_server_broadcast_dropped_total").increment(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		prune_closed_subscribers(entry);

		if entry.subscribers.is_empty() {
			inner.rooms.remove(conversation);
		}

		if dropped_total > 0 {
			debug!(
				conversation = %conversation,
				dropped = dropped_total,
				"room router: dropped due to full subscriber queues"
			);
		}
	}

	/// Whether a connection is subscribed to a conversation.
	pub async fn is_joined(&self, conversation: &ConversationId, conn_id: u64) -> bool {
		let inner = self.inner.lock().await;
		inner
			.rooms
			.get(conversation)
			.map(|e| e.subscribers.iter().any(|s| s.conn_id == conn_id))
			.unwrap_or(false)
	}

	/// Snapshot of subscriber counts per conversation.
	pub async fn subscriber_counts(&self) -> HashMap<ConversationId, usize> {
		let inner = self.inner.lock().await;
		inner
			.rooms
			.iter()
			.map(|(k, v)| (k.clone(), v.subscribers.iter().filter(|s| !s.tx.is_closed()).count()))
			.collect()
	}
}

fn prune_closed_subscribers(entry: &mut RoomEntry) {
	entry.subscribers.retain(|s| !s.tx.is_closed());
}
