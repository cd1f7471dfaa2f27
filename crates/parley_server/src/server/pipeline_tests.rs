#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_domain::{ConversationId, MessageId, MessageKind, ParticipantRole, UserId};
use parley_protocol::ServerEvent;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::authorizer::MembershipAuthorizer;
use crate::server::errors::ChatError;
use crate::server::pipeline::MessagePipeline;
use crate::server::rooms::{RoomRouter, RoomRouterConfig};
use crate::server::store::{ChatStore, MemoryStore};

fn conv(id: &str) -> ConversationId {
	ConversationId::new(id.to_string()).expect("valid ConversationId")
}

fn user(id: &str) -> UserId {
	UserId::new(id.to_string()).expect("valid UserId")
}

fn pipeline_with_store(store: &Arc<MemoryStore>) -> (Arc<MessagePipeline>, RoomRouter) {
	let rooms = RoomRouter::new(RoomRouterConfig {
		subscriber_queue_capacity: 256,
	});
	let authorizer = Arc::new(MembershipAuthorizer::new(
		Arc::clone(store) as Arc<dyn ChatStore>,
		Duration::from_secs(30),
	));
	let pipeline = Arc::new(MessagePipeline::new(
		Arc::clone(store) as Arc<dyn ChatStore>,
		rooms.clone(),
		authorizer,
	));
	(pipeline, rooms)
}

async fn recv_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
	timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected event within timeout")
		.expect("channel open")
}

#[tokio::test]
async fn unauthorized_send_persists_and_broadcasts_nothing() {
	let store = MemoryStore::new();
	store.add_participant(conv("c"), user("alice"), ParticipantRole::Member).await;
	let (pipeline, rooms) = pipeline_with_store(&store);

	let (tx, mut rx) = mpsc::channel(16);
	rooms.join(conv("c"), 1, tx).await;

	let err = pipeline
		.send(&user("mallory"), conv("c"), "hi".to_string(), MessageKind::Text)
		.await
		.expect_err("non-participant send must be refused");
	assert!(matches!(err, ChatError::AuthorizationDenied(_)), "got: {err:?}");

	assert_eq!(store.message_count().await, 0);
	assert!(
		timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
		"refused send reached the room"
	);
}

#[tokio::test]
async fn send_commits_then_broadcasts_to_the_whole_room() {
	let store = MemoryStore::new();
	store.add_participant(conv("c"), user("alice"), ParticipantRole::Member).await;
	let (pipeline, rooms) = pipeline_with_store(&store);

	let (tx, mut rx) = mpsc::channel(16);
	rooms.join(conv("c"), 1, tx).await;

	let sent = pipeline
		.send(&user("alice"), conv("c"), "hello".to_string(), MessageKind::Text)
		.await
		.expect("participant send succeeds");

	assert_eq!(store.message_count().await, 1);
	assert_eq!(store.last_touched_unix_ms(&conv("c")).await, Some(sent.created_unix_ms));

	// The sender's own subscription gets new-message too; the private ack is
	// a separate connection-level reply.
	match recv_event(&mut rx).await {
		ServerEvent::NewMessage(msg) => {
			assert_eq!(msg.id, sent.id);
			assert_eq!(msg.content, "hello");
			assert!(!msg.edited);
		}
		other => panic!("expected new-message, got: {other:?}"),
	}
}

#[tokio::test]
async fn blank_content_is_malformed() {
	let store = MemoryStore::new();
	store.add_participant(conv("c"), user("alice"), ParticipantRole::Member).await;
	let (pipeline, _rooms) = pipeline_with_store(&store);

	let err = pipeline
		.send(&user("alice"), conv("c"), "   \n".to_string(), MessageKind::Text)
		.await
		.expect_err("blank content must be refused");
	assert!(matches!(err, ChatError::Malformed(_)), "got: {err:?}");
	assert_eq!(store.message_count().await, 0);
}

#[tokio::test]
async fn broadcast_order_matches_commit_order_under_concurrency() {
	let store = MemoryStore::new();
	store.add_participant(conv("c"), user("alice"), ParticipantRole::Member).await;
	let (pipeline, rooms) = pipeline_with_store(&store);

	let (tx, mut rx) = mpsc::channel(256);
	rooms.join(conv("c"), 1, tx).await;

	let mut tasks = Vec::new();
	for i in 0..32 {
		let pipeline = Arc::clone(&pipeline);
		tasks.push(tokio::spawn(async move {
			pipeline
				.send(&user("alice"), conv("c"), format!("m{i}"), MessageKind::Text)
				.await
				.expect("send succeeds")
		}));
	}
	for task in tasks {
		task.await.expect("task join");
	}

	let mut broadcast_order = Vec::new();
	for _ in 0..32 {
		match recv_event(&mut rx).await {
			ServerEvent::NewMessage(msg) => broadcast_order.push(msg.id),
			other => panic!("expected new-message, got: {other:?}"),
		}
	}

	assert_eq!(broadcast_order, store.commit_order(&conv("c")).await);
}

#[tokio::test]
async fn edit_requires_the_original_sender() {
	let store = MemoryStore::new();
	store.add_participant(conv("c"), user("alice"), ParticipantRole::Member).await;
	store.add_participant(conv("c"), user("bob"), ParticipantRole::Member).await;
	let (pipeline, rooms) = pipeline_with_store(&store);

	let sent = pipeline
		.send(&user("alice"), conv("c"), "original".to_string(), MessageKind::Text)
		.await
		.expect("send succeeds");

	let err = pipeline
		.edit(&user("bob"), sent.id, "tampered".to_string())
		.await
		.expect_err("non-sender edit must be refused");
	assert!(matches!(err, ChatError::NotOwner(_)), "got: {err:?}");

	let (tx, mut rx) = mpsc::channel(16);
	rooms.join(conv("c"), 1, tx).await;

	let edited = pipeline
		.edit(&user("alice"), sent.id, "fixed".to_string())
		.await
		.expect("sender edit succeeds");
	assert!(edited.edited);
	assert_eq!(edited.content, "fixed");

	match recv_event(&mut rx).await {
		ServerEvent::MessageEdited(msg) => {
			assert_eq!(msg.id, sent.id);
			assert_eq!(msg.content, "fixed");
			assert!(msg.edited);
		}
		other => panic!("expected message-edited, got: {other:?}"),
	}
}

#[tokio::test]
async fn delete_is_soft_and_broadcast() {
	let store = MemoryStore::new();
	store.add_participant(conv("c"), user("alice"), ParticipantRole::Member).await;
	store.add_participant(conv("c"), user("bob"), ParticipantRole::Member).await;
	let (pipeline, rooms) = pipeline_with_store(&store);

	let sent = pipeline
		.send(&user("alice"), conv("c"), "remove me".to_string(), MessageKind::Text)
		.await
		.expect("send succeeds");

	let err = pipeline
		.soft_delete(&user("bob"), sent.id)
		.await
		.expect_err("non-sender delete must be refused");
	assert!(matches!(err, ChatError::NotOwner(_)), "got: {err:?}");

	let (tx, mut rx) = mpsc::channel(16);
	rooms.join(conv("c"), 1, tx).await;

	pipeline
		.soft_delete(&user("alice"), sent.id)
		.await
		.expect("sender delete succeeds");

	match recv_event(&mut rx).await {
		ServerEvent::MessageDeleted(ev) => {
			assert_eq!(ev.message_id, sent.id);
			assert_eq!(ev.conversation_id, conv("c"));
		}
		other => panic!("expected message-deleted, got: {other:?}"),
	}

	let row = store.fetch_message(&sent.id).await.unwrap().unwrap();
	assert!(row.deleted);
	assert_eq!(row.content, "remove me", "content retained on soft delete");
}

#[tokio::test]
async fn unknown_message_is_not_found() {
	let store = MemoryStore::new();
	store.add_participant(conv("c"), user("alice"), ParticipantRole::Member).await;
	let (pipeline, _rooms) = pipeline_with_store(&store);

	let err = pipeline
		.edit(&user("alice"), MessageId::new_v4(), "x".to_string())
		.await
		.expect_err("unknown id must be refused");
	assert!(matches!(err, ChatError::NotFound(_)), "got: {err:?}");
}

#[tokio::test]
async fn mark_read_broadcasts_to_everyone_but_the_reader() {
	let store = MemoryStore::new();
	store.add_participant(conv("c"), user("alice"), ParticipantRole::Member).await;
	store.add_participant(conv("c"), user("bob"), ParticipantRole::Member).await;
	let (pipeline, rooms) = pipeline_with_store(&store);

	let (tx_reader, mut rx_reader) = mpsc::channel(16);
	let (tx_other, mut rx_other) = mpsc::channel(16);
	rooms.join(conv("c"), 1, tx_reader).await;
	rooms.join(conv("c"), 2, tx_other).await;

	let ids = vec![MessageId::new_v4(), MessageId::new_v4()];
	pipeline
		.mark_read(&user("alice"), 1, conv("c"), ids.clone())
		.await
		.expect("mark read succeeds");

	match recv_event(&mut rx_other).await {
		ServerEvent::MessagesRead(ev) => {
			assert_eq!(ev.user_id, user("alice"));
			assert_eq!(ev.message_ids, ids);
		}
		other => panic!("expected messages-read, got: {other:?}"),
	}

	assert!(
		timeout(Duration::from_millis(50), rx_reader.recv()).await.is_err(),
		"reader received their own receipt"
	);

	let err = pipeline
		.mark_read(&user("alice"), 1, conv("c"), Vec::new())
		.await
		.expect_err("empty id list must be refused");
	assert!(matches!(err, ChatError::Malformed(_)), "got: {err:?}");
}
