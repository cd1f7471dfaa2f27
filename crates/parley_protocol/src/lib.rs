#![forbid(unsafe_code)]

pub mod events;
pub mod framing;

pub use events::{
	ClientEvent, ConversationRef, DeleteMessage, EditMessage, ErrorEvent, JoinConversationError, MarkRead, MessageDeleted,
	MessageSent, MessagesRead, Ping, Pong, SendMessage, ServerEvent, SetUserId, TypingIndicator, UserIdSet, UserTyping,
};
pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, encode_frame_into,
	frame_len_from_payload_len, try_decode_frame_from_buffer,
};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation useful for logs/metrics.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;

	/// ALPN identifier negotiated on the QUIC handshake.
	pub const ALPN: &[u8] = b"parley-v1";
}
