#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parley_domain::{ChatMessage, ConversationId, MessageId, MessageKind, UserId};
use parley_protocol::{MessageDeleted, MessagesRead, ServerEvent};
use tokio::sync::Mutex;

use crate::server::authorizer::MembershipAuthorizer;
use crate::server::errors::ChatError;
use crate::server::rooms::RoomRouter;
use crate::server::store::ChatStore;
use crate::util::time::unix_ms_now;

/// Persist-then-broadcast message operations.
///
/// Sends to one conversation are serialized by a per-conversation lock held
/// across commit and broadcast, so broadcast order equals commit order;
/// different conversations proceed in parallel.
pub struct MessagePipeline {
	store: Arc<dyn ChatStore>,
	rooms: RoomRouter,
	authorizer: Arc<MembershipAuthorizer>,
	send_locks: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl MessagePipeline {
	pub fn new(store: Arc<dyn ChatStore>, rooms: RoomRouter, authorizer: Arc<MembershipAuthorizer>) -> Self {
		Self {
			store,
			rooms,
			authorizer,
			send_locks: Mutex::new(HashMap::new()),
		}
	}

	async fn conversation_lock(&self, conversation: &ConversationId) -> Arc<Mutex<()>> {
		let mut locks = self.send_locks.lock().await;
		// Drop entries nobody else holds before handing out a new one.
		locks.retain(|_, l| Arc::strong_count(l) > 1);
		Arc::clone(locks.entry(conversation.clone()).or_default())
	}

	/// Persist a new message, bump conversation activity, broadcast
	/// `new-message` to the room. Returns the committed record for the
	/// sender's `message-sent` ack.
	pub async fn send(
		&self,
		user: &UserId,
		conversation: ConversationId,
		content: String,
		kind: MessageKind,
	) -> Result<ChatMessage, ChatError> {
		if content.trim().is_empty() {
			return Err(ChatError::Malformed("empty message content".to_string()));
		}

		self.authorizer.authorize(user, &conversation).await?;

		let lock = self.conversation_lock(&conversation).await;
		let _guard = lock.lock().await;

		let msg = ChatMessage::new(conversation.clone(), user.clone(), content, kind, unix_ms_now());

		// Persistence failure aborts before any broadcast.
		self.store.insert_message(&msg).await.map_err(ChatError::Persistence)?;

		if let Err(e) = self.store.touch_conversation(&conversation, msg.created_unix_ms).await {
			tracing::warn!(conversation = %conversation, error = %e, "failed to bump conversation activity");
		}

		metrics::counter!("parley_server_messages_sent_total").increment(1);

		self.rooms
			.publish(&conversation, ServerEvent::NewMessage(msg.clone()), None)
			.await;

		Ok(msg)
	}

	/// Edit a message the acting user sent; broadcasts `message-edited` to
	/// the whole room.
	pub async fn edit(&self, user: &UserId, id: MessageId, new_content: String) -> Result<ChatMessage, ChatError> {
		if new_content.trim().is_empty() {
			return Err(ChatError::Malformed("empty message content".to_string()));
		}

		let mut msg = self.fetch_owned(user, &id).await?;

		let updated = unix_ms_now();
		self.store
			.apply_edit(&id, &new_content, updated)
			.await
			.map_err(ChatError::Persistence)?;

		msg.content = new_content;
		msg.edited = true;
		msg.updated_unix_ms = updated;

		metrics::counter!("parley_server_messages_edited_total").increment(1);

		self.rooms
			.publish(&msg.conversation_id, ServerEvent::MessageEdited(msg.clone()), None)
			.await;

		Ok(msg)
	}

	/// Soft-delete a message the acting user sent; the row keeps its content.
	/// Broadcasts `message-deleted` to the whole room.
	pub async fn soft_delete(&self, user: &UserId, id: MessageId) -> Result<ConversationId, ChatError> {
		let msg = self.fetch_owned(user, &id).await?;

		self.store
			.apply_delete(&id, unix_ms_now())
			.await
			.map_err(ChatError::Persistence)?;

		metrics::counter!("parley_server_messages_deleted_total").increment(1);

		self.rooms
			.publish(
				&msg.conversation_id,
				ServerEvent::MessageDeleted(MessageDeleted {
					message_id: id,
					conversation_id: msg.conversation_id.clone(),
				}),
				None,
			)
			.await;

		Ok(msg.conversation_id)
	}

	/// Broadcast a read receipt to the room, excluding the reader. No
	/// persistence.
	pub async fn mark_read(
		&self,
		user: &UserId,
		conn_id: u64,
		conversation: ConversationId,
		message_ids: Vec<MessageId>,
	) -> Result<(), ChatError> {
		if message_ids.is_empty() {
			return Err(ChatError::Malformed("no message ids".to_string()));
		}

		self.authorizer.authorize(user, &conversation).await?;

		self.rooms
			.publish(
				&conversation,
				ServerEvent::MessagesRead(MessagesRead {
					conversation_id: conversation.clone(),
					user_id: user.clone(),
					message_ids,
				}),
				Some(conn_id),
			)
			.await;

		Ok(())
	}

	/// Fetch a message, authorize against its conversation, and require the
	/// acting user to be the original sender.
	async fn fetch_owned(&self, user: &UserId, id: &MessageId) -> Result<ChatMessage, ChatError> {
		let msg = self
			.store
			.fetch_message(id)
			.await
			.map_err(ChatError::Persistence)?
			.ok_or_else(|| ChatError::NotFound(id.to_string()))?;

		self.authorizer.authorize(user, &msg.conversation_id).await?;

		if msg.sender_id != *user {
			return Err(ChatError::NotOwner(id.to_string()));
		}

		Ok(msg)
	}
}
