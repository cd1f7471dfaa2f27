#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_domain::{ConversationId, UserId};
use parley_protocol::{ServerEvent, UserTyping};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use crate::server::auth::IdentityVerifier;
use crate::server::authorizer::MembershipAuthorizer;
use crate::server::errors::ChatError;
use crate::server::pipeline::MessagePipeline;
use crate::server::presence::PresenceTracker;
use crate::server::registry::{SessionHandle, SessionRegistry};
use crate::server::rooms::{RoomRouter, RoomRouterConfig};
use crate::server::store::ChatStore;
use crate::server::typing::TypingState;

/// Tunables the service needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct ChatServiceConfig {
	pub membership_cache_ttl: Duration,
	pub subscriber_queue_capacity: usize,
}

impl Default for ChatServiceConfig {
	fn default() -> Self {
		Self {
			membership_cache_ttl: Duration::from_secs(30),
			subscriber_queue_capacity: 1024,
		}
	}
}

/// The messaging core, constructed once at process start with injected
/// collaborators. Owns registry, presence, typing, rooms, authorizer and
/// pipeline, plus the registration and disconnect cascades.
pub struct ChatService {
	registry: SessionRegistry,
	presence: PresenceTracker,
	typing: TypingState,
	rooms: RoomRouter,
	authorizer: Arc<MembershipAuthorizer>,
	pipeline: MessagePipeline,
	verifier: IdentityVerifier,
}

impl ChatService {
	pub fn new(store: Arc<dyn ChatStore>, verifier: IdentityVerifier, cfg: ChatServiceConfig) -> Self {
		let rooms = RoomRouter::new(RoomRouterConfig {
			subscriber_queue_capacity: cfg.subscriber_queue_capacity,
		});
		let authorizer = Arc::new(MembershipAuthorizer::new(Arc::clone(&store), cfg.membership_cache_ttl));
		let pipeline = MessagePipeline::new(store, rooms.clone(), Arc::clone(&authorizer));

		Self {
			registry: SessionRegistry::new(),
			presence: PresenceTracker::new(),
			typing: TypingState::new(),
			rooms,
			authorizer,
			pipeline,
			verifier,
		}
	}

	pub fn registry(&self) -> &SessionRegistry {
		&self.registry
	}

	pub fn presence(&self) -> &PresenceTracker {
		&self.presence
	}

	pub fn typing(&self) -> &TypingState {
		&self.typing
	}

	pub fn rooms(&self) -> &RoomRouter {
		&self.rooms
	}

	pub fn pipeline(&self) -> &MessagePipeline {
		&self.pipeline
	}

	/// Verify the credential and install a session for `user`.
	///
	/// A prior session for the same identity is displaced (last-writer-wins):
	/// its connection is told and force-closed, and its room/typing bindings
	/// are torn down before the new session becomes visible. Confirmation is
	/// the caller's `user-id-set` on the new connection only.
	pub async fn register_session(
		&self,
		user: UserId,
		token: &str,
		conn_id: u64,
		events: mpsc::Sender<ServerEvent>,
		shutdown: Arc<Notify>,
	) -> Result<(), ChatError> {
		if let Err(e) = self.verifier.verify(token, &user) {
			warn!(conn_id, user = %user, error = %e, "identity token rejected");
			metrics::counter!("parley_server_register_rejected_total").increment(1);
			return Err(ChatError::AuthenticationRequired);
		}

		// The old session's bindings must be gone before the new one is
		// installed, so no broadcast can reach both connections.
		if let Some(old) = self.registry.displace(&user).await {
			self.rooms.leave_all(old.conn_id).await;
			for conversation in self.typing.clear_user(&user).await {
				self.broadcast_typing_stop(&conversation, &user, old.conn_id).await;
			}
		}

		self.registry
			.install(
				user.clone(),
				SessionHandle {
					conn_id,
					events,
					shutdown,
				},
			)
			.await;

		self.presence.mark_online(user.clone()).await;
		metrics::counter!("parley_server_sessions_registered_total").increment(1);
		debug!(conn_id, user = %user, "session registered");

		Ok(())
	}

	/// Cleanup cascade for a closing connection.
	///
	/// A displaced connection fails the current-check and cascades nothing;
	/// its successor already tore down its bindings.
	pub async fn drop_connection(&self, conn_id: u64) -> Option<UserId> {
		let user = self.registry.unregister_if_current(conn_id).await?;

		for conversation in self.typing.clear_user(&user).await {
			self.broadcast_typing_stop(&conversation, &user, conn_id).await;
		}

		self.rooms.leave_all(conn_id).await;
		self.presence.mark_offline(&user).await;

		debug!(conn_id, user = %user, "session dropped");
		Some(user)
	}

	/// Authorize and subscribe the connection to a conversation's broadcasts.
	pub async fn join_conversation(
		&self,
		user: &UserId,
		conn_id: u64,
		conversation: ConversationId,
		events: mpsc::Sender<ServerEvent>,
	) -> Result<(), ChatError> {
		self.pipeline_authorize(user, &conversation).await?;
		self.rooms.join(conversation, conn_id, events).await;
		Ok(())
	}

	/// Unsubscribe and clear any typing state, synthesizing the stop
	/// broadcast on the user's behalf.
	pub async fn leave_conversation(&self, user: &UserId, conn_id: u64, conversation: &ConversationId) {
		self.rooms.leave(conversation, conn_id).await;
		if self.typing.clear_user_in(conversation, user).await {
			self.broadcast_typing_stop(conversation, user, conn_id).await;
		}
	}

	/// Apply a typing transition and broadcast it to the room, excluding the
	/// acting connection. No-op transitions broadcast nothing.
	pub async fn set_typing(
		&self,
		user: &UserId,
		conn_id: u64,
		conversation: ConversationId,
		is_typing: bool,
	) -> Result<(), ChatError> {
		self.pipeline_authorize(user, &conversation).await?;

		if self.typing.set_typing(&conversation, user, is_typing).await {
			self.rooms
				.publish(
					&conversation,
					ServerEvent::UserTyping(UserTyping {
						conversation_id: conversation.clone(),
						user_id: user.clone(),
						is_typing,
					}),
					Some(conn_id),
				)
				.await;
		}

		Ok(())
	}

	async fn pipeline_authorize(&self, user: &UserId, conversation: &ConversationId) -> Result<(), ChatError> {
		self.authorizer.authorize(user, conversation).await
	}

	async fn broadcast_typing_stop(&self, conversation: &ConversationId, user: &UserId, excluding_conn: u64) {
		self.rooms
			.publish(
				conversation,
				ServerEvent::UserTyping(UserTyping {
					conversation_id: conversation.clone(),
					user_id: user.clone(),
					is_typing: false,
				}),
				Some(excluding_conn),
			)
			.await;
	}
}
