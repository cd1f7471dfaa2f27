#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use parley_client_core::{ChatSession, ClientCoreError, ClientSessionConfig};
use parley_domain::{ConversationId, MessageKind, ParticipantRole, UserId};
use parley_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame};
use parley_protocol::{ClientEvent, ConversationRef, SendMessage, ServerEvent, TypingIndicator};
use parley_server::quic::config::QuicServerConfig;
use parley_server::server::auth::{AuthClaims, IdentityVerifier, mint_hmac_token};
use parley_server::server::connection::{ConnectionSettings, handle_connection};
use parley_server::server::service::{ChatService, ChatServiceConfig};
use parley_server::server::store::{ChatStore, MemoryStore};
use parley_util::secret::SecretString;

const TEST_SECRET: &str = "smoke-test-secret";

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("PARLEY_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

fn conv(id: &str) -> ConversationId {
	ConversationId::new(id.to_string()).expect("valid ConversationId")
}

fn user(id: &str) -> UserId {
	UserId::new(id.to_string()).expect("valid UserId")
}

fn token_for(user_id: &str) -> String {
	let exp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 3600;
	mint_hmac_token(
		&AuthClaims {
			sub: user_id.to_string(),
			exp,
		},
		TEST_SECRET,
	)
}

/// Boot a real server endpoint on an ephemeral port.
fn boot_server(service: Arc<ChatService>) -> anyhow::Result<SocketAddr> {
	let bind_addr: SocketAddr = "127.0.0.1:0".parse().context("parse bind addr")?;
	let quic_cfg = QuicServerConfig::dev(bind_addr);
	let (endpoint, _cert_der) = quic_cfg.bind_dev_endpoint()?;
	let local_addr = endpoint.local_addr().context("server local_addr")?;

	tokio::spawn(async move {
		let mut next_conn_id: u64 = 1;
		while let Some(connecting) = endpoint.accept().await {
			let conn_id = next_conn_id;
			next_conn_id += 1;

			let service = Arc::clone(&service);
			tokio::spawn(async move {
				if let Ok(connection) = connecting.await
					&& let Err(e) = handle_connection(conn_id, connection, service, ConnectionSettings::default()).await
				{
					tracing::debug!(conn_id, error = %e, "connection handler exited");
				}
			});
		}
	});

	Ok(local_addr)
}

fn service_with_store(store: Arc<MemoryStore>) -> Arc<ChatService> {
	Arc::new(ChatService::new(
		store as Arc<dyn ChatStore>,
		IdentityVerifier::new(SecretString::new(TEST_SECRET)),
		ChatServiceConfig::default(),
	))
}

async fn connect(server_addr: SocketAddr) -> anyhow::Result<ChatSession> {
	let cfg = ClientSessionConfig {
		server_host: "localhost".to_string(),
		server_port: server_addr.port(),
		server_addr: Some(server_addr),
		..ClientSessionConfig::default()
	};
	let session = ChatSession::connect(cfg).await.context("client connect")?;
	Ok(session)
}

async fn expect_event(session: &mut ChatSession) -> anyhow::Result<ServerEvent> {
	tokio::time::timeout(Duration::from_secs(5), session.next_event())
		.await
		.context("timeout waiting for event")?
		.context("next_event")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn register_join_send_edit_and_deny() -> anyhow::Result<()> {
	init_test_logging();
	let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());

	let store = MemoryStore::new();
	store.add_participant(conv("general"), user("alice"), ParticipantRole::Member).await;
	store.add_participant(conv("general"), user("bob"), ParticipantRole::Member).await;

	let service = service_with_store(Arc::clone(&store));
	let server_addr = boot_server(Arc::clone(&service))?;

	let mut alice = connect(server_addr).await?;
	let mut bob = connect(server_addr).await?;

	// A room action before registration gets a scoped auth error.
	alice
		.send(ClientEvent::JoinConversation(ConversationRef {
			conversation_id: conv("general"),
		}))
		.await?;
	match expect_event(&mut alice).await? {
		ServerEvent::Error(e) => assert_eq!(e.code, "AUTH_REQUIRED"),
		other => panic!("expected auth error before registration, got: {other:?}"),
	}

	let confirmed = alice.register(user("alice"), &token_for("alice")).await?;
	assert_eq!(confirmed.user_id, user("alice"));
	bob.register(user("bob"), &token_for("bob")).await?;

	// A bad credential is refused without closing the connection.
	let mut mallory = connect(server_addr).await?;
	match mallory.register(user("mallory"), &token_for("not-mallory")).await {
		Err(ClientCoreError::Server { code, .. }) => assert_eq!(code, "AUTH_REQUIRED"),
		other => panic!("expected auth refusal, got: {other:?}"),
	}

	for session in [&mut alice, &mut bob] {
		session
			.send(ClientEvent::JoinConversation(ConversationRef {
				conversation_id: conv("general"),
			}))
			.await?;
		match expect_event(session).await? {
			ServerEvent::ConversationJoined(j) => assert_eq!(j.conversation_id, conv("general")),
			other => panic!("expected conversation-joined, got: {other:?}"),
		}
	}

	// A non-participant cannot join even with a valid identity.
	let mut eve = connect(server_addr).await?;
	eve.register(user("eve"), &token_for("eve")).await?;
	eve.send(ClientEvent::JoinConversation(ConversationRef {
		conversation_id: conv("general"),
	}))
	.await?;
	match expect_event(&mut eve).await? {
		ServerEvent::JoinConversationError(e) => assert_eq!(e.conversation_id, conv("general")),
		other => panic!("expected join-conversation-error, got: {other:?}"),
	}

	// Typing indicator fans out to the room but not back to the typist.
	alice
		.send(ClientEvent::TypingIndicator(TypingIndicator {
			conversation_id: conv("general"),
			is_typing: true,
		}))
		.await?;
	match expect_event(&mut bob).await? {
		ServerEvent::UserTyping(t) => {
			assert_eq!(t.user_id, user("alice"));
			assert!(t.is_typing);
		}
		other => panic!("expected user-typing, got: {other:?}"),
	}

	alice
		.send(ClientEvent::SendMessage(SendMessage {
			conversation_id: conv("general"),
			content: "hello bob".to_string(),
			kind: MessageKind::Text,
		}))
		.await?;

	// The sender sees the room broadcast and the private ack, in commit order
	// relative to other room traffic.
	let mut message_id = None;
	for _ in 0..2 {
		match expect_event(&mut alice).await? {
			ServerEvent::NewMessage(m) => {
				assert_eq!(m.content, "hello bob");
				message_id = Some(m.id);
			}
			ServerEvent::MessageSent(ack) => assert_eq!(ack.conversation_id, conv("general")),
			other => panic!("expected new-message or message-sent, got: {other:?}"),
		}
	}
	let message_id = message_id.expect("broadcast carried the message");

	match expect_event(&mut bob).await? {
		ServerEvent::NewMessage(m) => {
			assert_eq!(m.id, message_id);
			assert_eq!(m.sender_id, user("alice"));
		}
		other => panic!("expected new-message, got: {other:?}"),
	}

	assert_eq!(store.commit_order(&conv("general")).await, vec![message_id]);

	// Only the original sender may edit.
	bob.send(ClientEvent::EditMessage(parley_protocol::EditMessage {
		message_id,
		new_content: "hijacked".to_string(),
	}))
	.await?;
	match expect_event(&mut bob).await? {
		ServerEvent::Error(e) => assert_eq!(e.code, "NOT_OWNER"),
		other => panic!("expected not-owner error, got: {other:?}"),
	}

	alice
		.send(ClientEvent::EditMessage(parley_protocol::EditMessage {
			message_id,
			new_content: "hello again bob".to_string(),
		}))
		.await?;
	match expect_event(&mut bob).await? {
		ServerEvent::MessageEdited(m) => {
			assert_eq!(m.id, message_id);
			assert_eq!(m.content, "hello again bob");
			assert!(m.edited);
		}
		other => panic!("expected message-edited, got: {other:?}"),
	}

	alice.close(0, "done");
	bob.close(0, "done");
	eve.close(0, "done");

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undecodable_payload_gets_a_scoped_error() -> anyhow::Result<()> {
	init_test_logging();
	let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());

	let store = MemoryStore::new();
	store.add_participant(conv("general"), user("alice"), ParticipantRole::Member).await;

	let service = service_with_store(Arc::clone(&store));
	let server_addr = boot_server(Arc::clone(&service))?;

	let mut alice = connect(server_addr).await?;
	alice.register(user("alice"), &token_for("alice")).await?;
	alice
		.send(ClientEvent::JoinConversation(ConversationRef {
			conversation_id: conv("general"),
		}))
		.await?;
	match expect_event(&mut alice).await? {
		ServerEvent::ConversationJoined(_) => {}
		other => panic!("expected conversation-joined, got: {other:?}"),
	}

	// Valid JSON, valid framing, but no event decodes from it: send-message
	// without its content field.
	let frame = encode_frame(
		&serde_json::json!({"event": "send-message", "data": {"conversationId": "general"}}),
		DEFAULT_MAX_FRAME_SIZE,
	)?;
	alice.send_frame(&frame).await?;

	match expect_event(&mut alice).await? {
		ServerEvent::Error(e) => assert_eq!(e.code, "MALFORMED"),
		other => panic!("expected malformed error, got: {other:?}"),
	}

	// The connection stays up; a well-formed send on the same session lands.
	alice
		.send(ClientEvent::SendMessage(SendMessage {
			conversation_id: conv("general"),
			content: "still alive".to_string(),
			kind: MessageKind::Text,
		}))
		.await?;

	let mut saw_broadcast = false;
	for _ in 0..2 {
		match expect_event(&mut alice).await? {
			ServerEvent::NewMessage(m) => {
				assert_eq!(m.content, "still alive");
				saw_broadcast = true;
			}
			ServerEvent::MessageSent(_) => {}
			other => panic!("expected new-message or message-sent, got: {other:?}"),
		}
	}
	assert!(saw_broadcast, "session keeps working after the bad frame");
	assert_eq!(store.message_count().await, 1);

	alice.close(0, "done");

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_login_displaces_the_older_session() -> anyhow::Result<()> {
	init_test_logging();
	let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());

	let store = MemoryStore::new();
	store.add_participant(conv("general"), user("alice"), ParticipantRole::Member).await;
	store.add_participant(conv("general"), user("bob"), ParticipantRole::Member).await;

	let service = service_with_store(Arc::clone(&store));
	let server_addr = boot_server(Arc::clone(&service))?;

	let mut first = connect(server_addr).await?;
	first.register(user("alice"), &token_for("alice")).await?;
	first
		.send(ClientEvent::JoinConversation(ConversationRef {
			conversation_id: conv("general"),
		}))
		.await?;
	match expect_event(&mut first).await? {
		ServerEvent::ConversationJoined(_) => {}
		other => panic!("expected conversation-joined, got: {other:?}"),
	}

	let mut second = connect(server_addr).await?;
	second.register(user("alice"), &token_for("alice")).await?;

	// The older session is told it was superseded, then force-closed.
	match expect_event(&mut first).await? {
		ServerEvent::Error(e) => assert_eq!(e.code, "SESSION_REPLACED"),
		other => panic!("expected session-replaced, got: {other:?}"),
	}

	// Exactly one live session for the identity, bound to the new connection.
	assert_eq!(service.registry().session_count().await, 1);
	assert!(service.presence().is_online(&user("alice")).await);

	// The displaced connection's room bindings are gone: a message sent via
	// the new session must not reach the old subscription.
	second
		.send(ClientEvent::JoinConversation(ConversationRef {
			conversation_id: conv("general"),
		}))
		.await?;
	match expect_event(&mut second).await? {
		ServerEvent::ConversationJoined(_) => {}
		other => panic!("expected conversation-joined, got: {other:?}"),
	}

	second
		.send(ClientEvent::SendMessage(SendMessage {
			conversation_id: conv("general"),
			content: "still here".to_string(),
			kind: MessageKind::Text,
		}))
		.await?;

	let mut saw_broadcast = false;
	for _ in 0..2 {
		match expect_event(&mut second).await? {
			ServerEvent::NewMessage(m) => {
				assert_eq!(m.content, "still here");
				saw_broadcast = true;
			}
			ServerEvent::MessageSent(_) => {}
			other => panic!("expected new-message or message-sent, got: {other:?}"),
		}
	}
	assert!(saw_broadcast, "new session receives its own room broadcast");

	second.close(0, "done");

	Ok(())
}
