#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown message kind: {0}")]
	UnknownKind(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Verified user identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Conversation (room) identifier; the broadcast scope for chat events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
	/// Create a non-empty `ConversationId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ConversationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ConversationId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ConversationId::new(s.to_string())
	}
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat("expected a UUID message id".into()))
	}
}

/// Kinds of message payloads a conversation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
	Text,
	Image,
	File,
	System,
}

impl MessageKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageKind::Text => "text",
			MessageKind::Image => "image",
			MessageKind::File => "file",
			MessageKind::System => "system",
		}
	}
}

impl Default for MessageKind {
	fn default() -> Self {
		MessageKind::Text
	}
}

impl fmt::Display for MessageKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MessageKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"text" => Ok(MessageKind::Text),
			"image" => Ok(MessageKind::Image),
			"file" => Ok(MessageKind::File),
			"system" => Ok(MessageKind::System),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

/// Role of a participant within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
	Member,
	Owner,
}

impl ParticipantRole {
	pub const fn as_str(self) -> &'static str {
		match self {
			ParticipantRole::Member => "member",
			ParticipantRole::Owner => "owner",
		}
	}
}

impl fmt::Display for ParticipantRole {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ParticipantRole {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"member" => Ok(ParticipantRole::Member),
			"owner" => Ok(ParticipantRole::Owner),
			other => Err(ParseIdError::InvalidFormat(format!("unknown role: {other}"))),
		}
	}
}

/// A persisted chat message as seen by the messaging core and on the wire.
///
/// Only the message pipeline transitions `edited` and `deleted`; both require
/// the acting identity to equal `sender_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
	pub id: MessageId,
	pub conversation_id: ConversationId,
	pub sender_id: UserId,
	pub content: String,
	pub kind: MessageKind,
	pub edited: bool,
	pub deleted: bool,
	pub created_unix_ms: i64,
	pub updated_unix_ms: i64,
}

impl ChatMessage {
	/// Build a fresh (unedited, undeleted) message record.
	pub fn new(
		conversation_id: ConversationId,
		sender_id: UserId,
		content: String,
		kind: MessageKind,
		now_unix_ms: i64,
	) -> Self {
		Self {
			id: MessageId::new_v4(),
			conversation_id,
			sender_id,
			content,
			kind,
			edited: false,
			deleted: false,
			created_unix_ms: now_unix_ms,
			updated_unix_ms: now_unix_ms,
		}
	}
}
