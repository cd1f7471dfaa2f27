#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use parley_domain::{ConversationId, UserId};
use parley_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, encode_frame};
use parley_protocol::{ClientEvent, ConversationRef, ErrorEvent, JoinConversationError, MessageSent, Pong, ServerEvent, UserIdSet};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::server::errors::ChatError;
use crate::server::service::ChatService;
use crate::util::time::unix_ms_now;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,

	pub outbound_queue_capacity: usize,

	pub command_rate_limit_per_conn_burst: u32,
	pub command_rate_limit_per_conn_per_minute: u32,
	pub command_rate_limit_per_conversation_burst: u32,
	pub command_rate_limit_per_conversation_per_minute: u32,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 1024,
			command_rate_limit_per_conn_burst: 0,
			command_rate_limit_per_conn_per_minute: 0,
			command_rate_limit_per_conversation_burst: 0,
			command_rate_limit_per_conversation_per_minute: 0,
		}
	}
}

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

#[derive(Debug)]
struct CommandRateLimiter {
	per_connection: Option<TokenBucket>,
	per_conversation: HashMap<ConversationId, TokenBucket>,
	per_conversation_burst: u32,
	per_conversation_per_minute: u32,
	max_conversations: usize,
}

impl CommandRateLimiter {
	fn new(settings: &ConnectionSettings) -> Self {
		Self {
			per_connection: TokenBucket::new(
				settings.command_rate_limit_per_conn_burst,
				settings.command_rate_limit_per_conn_per_minute,
			),
			per_conversation: HashMap::new(),
			per_conversation_burst: settings.command_rate_limit_per_conversation_burst,
			per_conversation_per_minute: settings.command_rate_limit_per_conversation_per_minute,
			max_conversations: 1024,
		}
	}

	fn allow_connection(&mut self) -> bool {
		match self.per_connection.as_mut() {
			Some(bucket) => bucket.allow(),
			None => true,
		}
	}

	fn allow_conversation(&mut self, conversation: &ConversationId) -> bool {
		let Some(bucket) = TokenBucket::new(self.per_conversation_burst, self.per_conversation_per_minute) else {
			return true;
		};

		if self.per_conversation.len() >= self.max_conversations {
			self.per_conversation.clear();
		}

		let entry = self.per_conversation.entry(conversation.clone()).or_insert(bucket);
		entry.allow()
	}
}

/// Drive one QUIC connection until disconnect, displacement, or error.
pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	service: Arc<ChatService>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("parley_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("parley_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (control_send, mut control_recv) = connection.accept_bi().await.context("accept control bidirectional stream")?;

	let max_frame_bytes = settings.max_frame_bytes;
	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Result<ClientEvent, FramingError>>();
	let reader_task = tokio::spawn(async move {
		let mut buf = BytesMut::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("parley_server_control_bytes_in_total").increment(n as u64);

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match parley_protocol::try_decode_frame_from_buffer::<ClientEvent>(&mut buf, max_frame_bytes) {
					Ok(Some(ev)) => {
						metrics::counter!("parley_server_events_in_total").increment(1);

						if ctrl_tx.send(Ok(ev)).is_err() {
							return Ok(());
						}
					}
					Ok(None) => break,
					// A frame that carried an undecodable payload is already
					// consumed from the buffer, so the stream stays aligned;
					// the peer gets a scoped error and the connection lives on.
					Err(FramingError::Json(e)) => {
						metrics::counter!("parley_server_control_decode_errors_total").increment(1);

						if ctrl_tx.send(Err(FramingError::Json(e))).is_err() {
							return Ok(());
						}
					}
					Err(e) => {
						metrics::counter!("parley_server_control_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				}
			}
		}
	});

	let (events_tx, mut events_rx) = mpsc::channel::<ServerEvent>(settings.outbound_queue_capacity);
	let shutdown = Arc::new(Notify::new());

	let writer_task = tokio::spawn(async move {
		let mut control_send = control_send;
		while let Some(ev) = events_rx.recv().await {
			let frame = encode_frame(&ev, max_frame_bytes).map_err(|e| anyhow!(e).context("encode outbound frame"))?;

			metrics::counter!("parley_server_events_out_total").increment(1);
			metrics::counter!("parley_server_control_bytes_out_total").increment(frame.len() as u64);

			if let Err(e) = control_send.write_all(&frame).await {
				return Err(anyhow!(e).context("control stream write failed"));
			}
		}
		Ok::<(), anyhow::Error>(())
	});

	let mut rate_limiter = CommandRateLimiter::new(&settings);

	let loop_result = connection_loop(
		conn_id,
		&service,
		&mut ctrl_rx,
		&events_tx,
		&shutdown,
		&mut rate_limiter,
	)
	.await;

	// Cleanup cascade. A displaced connection fails the current-check inside
	// and cascades nothing.
	if service.drop_connection(conn_id).await.is_some() {
		debug!(conn_id, "connection cleanup cascade completed");
	}

	// After the cascade the handler holds the last outbound sender; dropping
	// it lets the writer drain queued events (displacement notices included)
	// before the connection closes under it.
	drop(events_tx);
	let _ = tokio::time::timeout(std::time::Duration::from_secs(5), writer_task).await;

	connection.close(0u32.into(), b"closed");
	let _ = reader_task.await;

	loop_result
}

async fn connection_loop(
	conn_id: u64,
	service: &Arc<ChatService>,
	ctrl_rx: &mut mpsc::UnboundedReceiver<Result<ClientEvent, FramingError>>,
	events_tx: &mpsc::Sender<ServerEvent>,
	shutdown: &Arc<Notify>,
	rate_limiter: &mut CommandRateLimiter,
) -> anyhow::Result<()> {
	// Registration gate: only ping and set-user-id are serviced before a
	// verified identity exists.
	let identity = loop {
		let ev = tokio::select! {
			ev = ctrl_rx.recv() => match ev {
				Some(Ok(ev)) => ev,
				Some(Err(e)) => {
					send_event(events_tx, ChatError::Malformed(format!("undecodable event: {e}")).to_event()).await?;
					continue;
				}
				None => return Ok(()),
			},
			_ = shutdown.notified() => return Ok(()),
		};

		match ev {
			ClientEvent::Ping(_) => {
				send_event(
					events_tx,
					ServerEvent::Pong(Pong {
						server_unix_ms: unix_ms_now(),
					}),
				)
				.await?;
			}
			ClientEvent::SetUserId(req) => {
				match service
					.register_session(
						req.user_id.clone(),
						&req.token,
						conn_id,
						events_tx.clone(),
						Arc::clone(shutdown),
					)
					.await
				{
					Ok(()) => {
						info!(conn_id, user = %req.user_id, "registered session");
						send_event(
							events_tx,
							ServerEvent::UserIdSet(UserIdSet {
								user_id: req.user_id.clone(),
								connection_id: conn_id,
							}),
						)
						.await?;
						break req.user_id;
					}
					Err(e) => {
						send_event(events_tx, e.to_event()).await?;
					}
				}
			}
			other => {
				debug!(conn_id, event = ?other, "room action before registration");
				send_event(events_tx, ChatError::AuthenticationRequired.to_event()).await?;
			}
		}
	};

	loop {
		let ev = tokio::select! {
			ev = ctrl_rx.recv() => match ev {
				Some(Ok(ev)) => ev,
				Some(Err(e)) => {
					send_event(events_tx, ChatError::Malformed(format!("undecodable event: {e}")).to_event()).await?;
					continue;
				}
				None => return Ok(()),
			},
			_ = shutdown.notified() => {
				info!(conn_id, user = %identity, "session displaced; closing connection");
				return Ok(());
			}
		};

		if let Err(e) = dispatch_event(conn_id, &identity, service, events_tx, rate_limiter, ev).await {
			return Err(e);
		}
	}
}

async fn dispatch_event(
	conn_id: u64,
	identity: &UserId,
	service: &Arc<ChatService>,
	events_tx: &mpsc::Sender<ServerEvent>,
	rate_limiter: &mut CommandRateLimiter,
	ev: ClientEvent,
) -> anyhow::Result<()> {
	match ev {
		ClientEvent::Ping(_) => {
			send_event(
				events_tx,
				ServerEvent::Pong(Pong {
					server_unix_ms: unix_ms_now(),
				}),
			)
			.await?;
		}

		ClientEvent::SetUserId(_) => {
			debug!(conn_id, "ignoring duplicate set-user-id");
			send_event(
				events_tx,
				ServerEvent::Error(ErrorEvent::new("ALREADY_REGISTERED", "connection already has an identity")),
			)
			.await?;
		}

		ClientEvent::JoinConversation(ConversationRef { conversation_id }) => {
			if !allow_command(rate_limiter, Some(&conversation_id)) {
				send_event(events_tx, rate_limited_event()).await?;
				return Ok(());
			}

			match service
				.join_conversation(identity, conn_id, conversation_id.clone(), events_tx.clone())
				.await
			{
				Ok(()) => {
					metrics::counter!("parley_server_joins_total").increment(1);
					send_event(
						events_tx,
						ServerEvent::ConversationJoined(ConversationRef { conversation_id }),
					)
					.await?;
				}
				Err(e) => {
					warn!(conn_id, user = %identity, conversation = %conversation_id, error = %e, "join refused");
					send_event(
						events_tx,
						ServerEvent::JoinConversationError(JoinConversationError {
							conversation_id,
							message: e.to_string(),
						}),
					)
					.await?;
				}
			}
		}

		ClientEvent::LeaveConversation(ConversationRef { conversation_id }) => {
			service.leave_conversation(identity, conn_id, &conversation_id).await;
		}

		ClientEvent::SendMessage(req) => {
			if !allow_command(rate_limiter, Some(&req.conversation_id)) {
				send_event(events_tx, rate_limited_event()).await?;
				return Ok(());
			}

			match service
				.pipeline()
				.send(identity, req.conversation_id, req.content, req.kind)
				.await
			{
				Ok(msg) => {
					send_event(
						events_tx,
						ServerEvent::MessageSent(MessageSent {
							message_id: msg.id,
							conversation_id: msg.conversation_id,
						}),
					)
					.await?;
				}
				Err(e) => send_event(events_tx, e.to_event()).await?,
			}
		}

		ClientEvent::TypingIndicator(req) => {
			if !allow_command(rate_limiter, Some(&req.conversation_id)) {
				send_event(events_tx, rate_limited_event()).await?;
				return Ok(());
			}

			if let Err(e) = service
				.set_typing(identity, conn_id, req.conversation_id, req.is_typing)
				.await
			{
				send_event(events_tx, e.to_event()).await?;
			}
		}

		ClientEvent::MarkRead(req) => {
			if !allow_command(rate_limiter, Some(&req.conversation_id)) {
				send_event(events_tx, rate_limited_event()).await?;
				return Ok(());
			}

			if let Err(e) = service
				.pipeline()
				.mark_read(identity, conn_id, req.conversation_id, req.message_ids)
				.await
			{
				send_event(events_tx, e.to_event()).await?;
			}
		}

		ClientEvent::EditMessage(req) => {
			if !allow_command(rate_limiter, None) {
				send_event(events_tx, rate_limited_event()).await?;
				return Ok(());
			}

			if let Err(e) = service.pipeline().edit(identity, req.message_id, req.new_content).await {
				send_event(events_tx, e.to_event()).await?;
			}
		}

		ClientEvent::DeleteMessage(req) => {
			if !allow_command(rate_limiter, None) {
				send_event(events_tx, rate_limited_event()).await?;
				return Ok(());
			}

			if let Err(e) = service.pipeline().soft_delete(identity, req.message_id).await {
				send_event(events_tx, e.to_event()).await?;
			}
		}
	}

	Ok(())
}

fn allow_command(rate_limiter: &mut CommandRateLimiter, conversation: Option<&ConversationId>) -> bool {
	if !rate_limiter.allow_connection() {
		metrics::counter!("parley_server_commands_rate_limited_total").increment(1);
		return false;
	}

	if let Some(conversation) = conversation
		&& !rate_limiter.allow_conversation(conversation)
	{
		metrics::counter!("parley_server_commands_rate_limited_total").increment(1);
		return false;
	}

	true
}

fn rate_limited_event() -> ServerEvent {
	ServerEvent::Error(ErrorEvent::new("RATE_LIMITED", "too many commands"))
}

async fn send_event(events_tx: &mpsc::Sender<ServerEvent>, ev: ServerEvent) -> anyhow::Result<()> {
	events_tx.send(ev).await.map_err(|_| anyhow!("outbound queue closed"))
}
