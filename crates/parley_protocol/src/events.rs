#![forbid(unsafe_code)]

use parley_domain::{ChatMessage, ConversationId, MessageId, MessageKind, UserId};
use serde::{Deserialize, Serialize};

/// Commands a client sends over the control stream.
///
/// Wire form is `{"event": "<name>", "data": {...}}` with kebab-case event
/// names and camelCase payload fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
	SetUserId(SetUserId),
	JoinConversation(ConversationRef),
	LeaveConversation(ConversationRef),
	SendMessage(SendMessage),
	TypingIndicator(TypingIndicator),
	MarkRead(MarkRead),
	EditMessage(EditMessage),
	DeleteMessage(DeleteMessage),
	Ping(Ping),
}

/// Events the server pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
	UserIdSet(UserIdSet),
	ConversationJoined(ConversationRef),
	JoinConversationError(JoinConversationError),
	NewMessage(ChatMessage),
	MessageSent(MessageSent),
	UserTyping(UserTyping),
	MessagesRead(MessagesRead),
	MessageEdited(ChatMessage),
	MessageDeleted(MessageDeleted),
	Pong(Pong),
	Error(ErrorEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetUserId {
	pub user_id: UserId,
	/// HMAC identity credential (`v1.<payload>.<sig>`).
	pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdSet {
	pub user_id: UserId,
	pub connection_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
	pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinConversationError {
	pub conversation_id: ConversationId,
	pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
	pub conversation_id: ConversationId,
	pub content: String,
	#[serde(default)]
	pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSent {
	pub message_id: MessageId,
	pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
	pub conversation_id: ConversationId,
	pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTyping {
	pub conversation_id: ConversationId,
	pub user_id: UserId,
	pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRead {
	pub conversation_id: ConversationId,
	pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesRead {
	pub conversation_id: ConversationId,
	pub user_id: UserId,
	pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
	pub message_id: MessageId,
	pub new_content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessage {
	pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
	pub message_id: MessageId,
	pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
	pub client_unix_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pong {
	pub server_unix_ms: i64,
}

/// Scoped error delivered to the acting connection only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
	pub code: String,
	pub message: String,
}

impl ErrorEvent {
	pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			code: code.into(),
			message: message.into(),
		}
	}
}

#[cfg(test)]
mod tests {
	use parley_domain::{ConversationId, UserId};
	use serde_json::json;

	use super::*;

	#[test]
	fn client_event_names_are_kebab_case() {
		let ev = ClientEvent::SetUserId(SetUserId {
			user_id: UserId::new("alice").unwrap(),
			token: "v1.x.y".to_string(),
		});
		let v = serde_json::to_value(&ev).unwrap();
		assert_eq!(v["event"], "set-user-id");
		assert_eq!(v["data"]["userId"], "alice");

		let ev = ClientEvent::JoinConversation(ConversationRef {
			conversation_id: ConversationId::new("c1").unwrap(),
		});
		let v = serde_json::to_value(&ev).unwrap();
		assert_eq!(v["event"], "join-conversation");
		assert_eq!(v["data"]["conversationId"], "c1");

		let ev = ClientEvent::TypingIndicator(TypingIndicator {
			conversation_id: ConversationId::new("c1").unwrap(),
			is_typing: true,
		});
		let v = serde_json::to_value(&ev).unwrap();
		assert_eq!(v["event"], "typing-indicator");
		assert_eq!(v["data"]["isTyping"], true);
	}

	#[test]
	fn server_event_names_are_kebab_case() {
		let ev = ServerEvent::MessagesRead(MessagesRead {
			conversation_id: ConversationId::new("c1").unwrap(),
			user_id: UserId::new("bob").unwrap(),
			message_ids: vec![],
		});
		let v = serde_json::to_value(&ev).unwrap();
		assert_eq!(v["event"], "messages-read");

		let ev = ServerEvent::Error(ErrorEvent::new("NOT_PARTICIPANT", "not a participant"));
		let v = serde_json::to_value(&ev).unwrap();
		assert_eq!(v["event"], "error");
		assert_eq!(v["data"]["code"], "NOT_PARTICIPANT");
	}

	#[test]
	fn send_message_kind_defaults_to_text() {
		let v = json!({
			"event": "send-message",
			"data": { "conversationId": "c1", "content": "hi" }
		});
		let ev: ClientEvent = serde_json::from_value(v).unwrap();
		match ev {
			ClientEvent::SendMessage(m) => assert_eq!(m.kind, MessageKind::Text),
			other => panic!("unexpected event: {other:?}"),
		}
	}

	#[test]
	fn unknown_event_name_fails_to_decode() {
		let v = json!({ "event": "shout", "data": {} });
		assert!(serde_json::from_value::<ClientEvent>(v).is_err());
	}
}
