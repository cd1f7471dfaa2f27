#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use parley_domain::{ChatMessage, ConversationId, MessageId, MessageKind, ParticipantRole, UserId};
use sqlx::Row as _;
use tokio::sync::Mutex;

/// Persistence contract required by the messaging core.
///
/// The store is the source of truth for conversation membership and the
/// message record; the pipeline never mutates messages through any other path.
#[async_trait]
pub trait ChatStore: Send + Sync {
	/// Role of `user` within `conversation`, if they are a participant.
	async fn membership(&self, conversation: &ConversationId, user: &UserId) -> anyhow::Result<Option<ParticipantRole>>;

	async fn insert_message(&self, msg: &ChatMessage) -> anyhow::Result<()>;

	async fn fetch_message(&self, id: &MessageId) -> anyhow::Result<Option<ChatMessage>>;

	/// Set new content, the edited flag and the updated timestamp.
	async fn apply_edit(&self, id: &MessageId, content: &str, updated_unix_ms: i64) -> anyhow::Result<()>;

	/// Set the deleted flag and the updated timestamp. Content is retained.
	async fn apply_delete(&self, id: &MessageId, updated_unix_ms: i64) -> anyhow::Result<()>;

	/// Bump the conversation's last-activity timestamp.
	async fn touch_conversation(&self, conversation: &ConversationId, updated_unix_ms: i64) -> anyhow::Result<()>;
}

/// In-memory store used when no `database_url` is configured and by tests.
///
/// Records insert commit order so ordering tests can compare broadcast order
/// against it.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
	participants: HashMap<ConversationId, HashMap<UserId, ParticipantRole>>,
	messages: HashMap<MessageId, ChatMessage>,
	conversation_touched_unix_ms: HashMap<ConversationId, i64>,
	commit_log: Vec<(ConversationId, MessageId)>,
}

impl MemoryStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Seed a participant row.
	pub async fn add_participant(&self, conversation: ConversationId, user: UserId, role: ParticipantRole) {
		let mut inner = self.inner.lock().await;
		inner.participants.entry(conversation).or_default().insert(user, role);
	}

	/// Insert commit order for one conversation, oldest first.
	pub async fn commit_order(&self, conversation: &ConversationId) -> Vec<MessageId> {
		let inner = self.inner.lock().await;
		inner
			.commit_log
			.iter()
			.filter(|(c, _)| c == conversation)
			.map(|(_, id)| *id)
			.collect()
	}

	pub async fn message_count(&self) -> usize {
		self.inner.lock().await.messages.len()
	}

	pub async fn last_touched_unix_ms(&self, conversation: &ConversationId) -> Option<i64> {
		self.inner.lock().await.conversation_touched_unix_ms.get(conversation).copied()
	}
}

#[async_trait]
impl ChatStore for MemoryStore {
	async fn membership(&self, conversation: &ConversationId, user: &UserId) -> anyhow::Result<Option<ParticipantRole>> {
		let inner = self.inner.lock().await;
		Ok(inner.participants.get(conversation).and_then(|m| m.get(user)).copied())
	}

	async fn insert_message(&self, msg: &ChatMessage) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		if inner.messages.contains_key(&msg.id) {
			return Err(anyhow!("duplicate message id: {}", msg.id));
		}
		inner.commit_log.push((msg.conversation_id.clone(), msg.id));
		inner.messages.insert(msg.id, msg.clone());
		Ok(())
	}

	async fn fetch_message(&self, id: &MessageId) -> anyhow::Result<Option<ChatMessage>> {
		let inner = self.inner.lock().await;
		Ok(inner.messages.get(id).cloned())
	}

	async fn apply_edit(&self, id: &MessageId, content: &str, updated_unix_ms: i64) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		let msg = inner.messages.get_mut(id).ok_or_else(|| anyhow!("unknown message id: {id}"))?;
		msg.content = content.to_string();
		msg.edited = true;
		msg.updated_unix_ms = updated_unix_ms;
		Ok(())
	}

	async fn apply_delete(&self, id: &MessageId, updated_unix_ms: i64) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		let msg = inner.messages.get_mut(id).ok_or_else(|| anyhow!("unknown message id: {id}"))?;
		msg.deleted = true;
		msg.updated_unix_ms = updated_unix_ms;
		Ok(())
	}

	async fn touch_conversation(&self, conversation: &ConversationId, updated_unix_ms: i64) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		inner
			.conversation_touched_unix_ms
			.insert(conversation.clone(), updated_unix_ms);
		Ok(())
	}
}

/// SQL-backed store over sqlx. Migrations run at connect.
#[derive(Clone)]
pub struct PersistentChatStore {
	backend: Backend,
}

#[derive(Clone)]
enum Backend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl PersistentChatStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: Backend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: Backend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (expected sqlite: or postgres:)"))
		}
	}
}

fn message_from_columns(
	id: &str,
	conversation_id: &str,
	sender_id: &str,
	content: String,
	kind: &str,
	edited: bool,
	deleted: bool,
	created_unix_ms: i64,
	updated_unix_ms: i64,
) -> anyhow::Result<ChatMessage> {
	Ok(ChatMessage {
		id: id.parse().map_err(|e| anyhow!("bad message id in row: {e}"))?,
		conversation_id: conversation_id
			.parse()
			.map_err(|e| anyhow!("bad conversation id in row: {e}"))?,
		sender_id: sender_id.parse().map_err(|e| anyhow!("bad sender id in row: {e}"))?,
		content,
		kind: kind.parse::<MessageKind>().map_err(|e| anyhow!("bad kind in row: {e}"))?,
		edited,
		deleted,
		created_unix_ms,
		updated_unix_ms,
	})
}

#[async_trait]
impl ChatStore for PersistentChatStore {
	async fn membership(&self, conversation: &ConversationId, user: &UserId) -> anyhow::Result<Option<ParticipantRole>> {
		let role: Option<String> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_scalar("SELECT role FROM conversation_participants WHERE conversation_id = ? AND user_id = ?")
					.bind(conversation.as_str())
					.bind(user.as_str())
					.fetch_optional(pool)
					.await
					.context("select membership (sqlite)")?
			}
			Backend::Postgres(pool) => {
				sqlx::query_scalar("SELECT role FROM conversation_participants WHERE conversation_id = $1 AND user_id = $2")
					.bind(conversation.as_str())
					.bind(user.as_str())
					.fetch_optional(pool)
					.await
					.context("select membership (postgres)")?
			}
		};

		match role {
			Some(r) => Ok(Some(r.parse().map_err(|e| anyhow!("bad role in row: {e}"))?)),
			None => Ok(None),
		}
	}

	async fn insert_message(&self, msg: &ChatMessage) -> anyhow::Result<()> {
		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, conversation_id, sender_id, content, kind, edited, deleted, created_unix_ms, updated_unix_ms) \
					VALUES (?, ?, ?, ?, ?, 0, 0, ?, ?)",
				)
				.bind(msg.id.to_string())
				.bind(msg.conversation_id.as_str())
				.bind(msg.sender_id.as_str())
				.bind(&msg.content)
				.bind(msg.kind.as_str())
				.bind(msg.created_unix_ms)
				.bind(msg.updated_unix_ms)
				.execute(pool)
				.await
				.context("insert message (sqlite)")?;
			}
			Backend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, conversation_id, sender_id, content, kind, edited, deleted, created_unix_ms, updated_unix_ms) \
					VALUES ($1, $2, $3, $4, $5, FALSE, FALSE, $6, $7)",
				)
				.bind(msg.id.to_string())
				.bind(msg.conversation_id.as_str())
				.bind(msg.sender_id.as_str())
				.bind(&msg.content)
				.bind(msg.kind.as_str())
				.bind(msg.created_unix_ms)
				.bind(msg.updated_unix_ms)
				.execute(pool)
				.await
				.context("insert message (postgres)")?;
			}
		}

		Ok(())
	}

	async fn fetch_message(&self, id: &MessageId) -> anyhow::Result<Option<ChatMessage>> {
		match &self.backend {
			Backend::Sqlite(pool) => {
				let row = sqlx::query(
					"SELECT id, conversation_id, sender_id, content, kind, edited, deleted, created_unix_ms, updated_unix_ms \
					FROM messages WHERE id = ?",
				)
				.bind(id.to_string())
				.fetch_optional(pool)
				.await
				.context("select message (sqlite)")?;

				let Some(row) = row else {
					return Ok(None);
				};

				Ok(Some(message_from_columns(
					row.get::<String, _>("id").as_str(),
					row.get::<String, _>("conversation_id").as_str(),
					row.get::<String, _>("sender_id").as_str(),
					row.get("content"),
					row.get::<String, _>("kind").as_str(),
					row.get::<i64, _>("edited") != 0,
					row.get::<i64, _>("deleted") != 0,
					row.get("created_unix_ms"),
					row.get("updated_unix_ms"),
				)?))
			}
			Backend::Postgres(pool) => {
				let row = sqlx::query(
					"SELECT id, conversation_id, sender_id, content, kind, edited, deleted, created_unix_ms, updated_unix_ms \
					FROM messages WHERE id = $1",
				)
				.bind(id.to_string())
				.fetch_optional(pool)
				.await
				.context("select message (postgres)")?;

				let Some(row) = row else {
					return Ok(None);
				};

				Ok(Some(message_from_columns(
					row.get::<String, _>("id").as_str(),
					row.get::<String, _>("conversation_id").as_str(),
					row.get::<String, _>("sender_id").as_str(),
					row.get("content"),
					row.get::<String, _>("kind").as_str(),
					row.get::<bool, _>("edited"),
					row.get::<bool, _>("deleted"),
					row.get("created_unix_ms"),
					row.get("updated_unix_ms"),
				)?))
			}
		}
	}

	async fn apply_edit(&self, id: &MessageId, content: &str, updated_unix_ms: i64) -> anyhow::Result<()> {
		let affected = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("UPDATE messages SET content = ?, edited = 1, updated_unix_ms = ? WHERE id = ?")
					.bind(content)
					.bind(updated_unix_ms)
					.bind(id.to_string())
					.execute(pool)
					.await
					.context("update message content (sqlite)")?
					.rows_affected()
			}
			Backend::Postgres(pool) => {
				sqlx::query("UPDATE messages SET content = $1, edited = TRUE, updated_unix_ms = $2 WHERE id = $3")
					.bind(content)
					.bind(updated_unix_ms)
					.bind(id.to_string())
					.execute(pool)
					.await
					.context("update message content (postgres)")?
					.rows_affected()
			}
		};

		if affected == 0 {
			return Err(anyhow!("unknown message id: {id}"));
		}
		Ok(())
	}

	async fn apply_delete(&self, id: &MessageId, updated_unix_ms: i64) -> anyhow::Result<()> {
		let affected = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("UPDATE messages SET deleted = 1, updated_unix_ms = ? WHERE id = ?")
					.bind(updated_unix_ms)
					.bind(id.to_string())
					.execute(pool)
					.await
					.context("soft-delete message (sqlite)")?
					.rows_affected()
			}
			Backend::Postgres(pool) => {
				sqlx::query("UPDATE messages SET deleted = TRUE, updated_unix_ms = $1 WHERE id = $2")
					.bind(updated_unix_ms)
					.bind(id.to_string())
					.execute(pool)
					.await
					.context("soft-delete message (postgres)")?
					.rows_affected()
			}
		};

		if affected == 0 {
			return Err(anyhow!("unknown message id: {id}"));
		}
		Ok(())
	}

	async fn touch_conversation(&self, conversation: &ConversationId, updated_unix_ms: i64) -> anyhow::Result<()> {
		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO conversations (id, updated_unix_ms) VALUES (?, ?) \
					ON CONFLICT(id) DO UPDATE SET updated_unix_ms = excluded.updated_unix_ms",
				)
				.bind(conversation.as_str())
				.bind(updated_unix_ms)
				.execute(pool)
				.await
				.context("touch conversation (sqlite)")?;
			}
			Backend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO conversations (id, updated_unix_ms) VALUES ($1, $2) \
					ON CONFLICT(id) DO UPDATE SET updated_unix_ms = EXCLUDED.updated_unix_ms",
				)
				.bind(conversation.as_str())
				.bind(updated_unix_ms)
				.execute(pool)
				.await
				.context("touch conversation (postgres)")?;
			}
		}

		Ok(())
	}
}
