#![forbid(unsafe_code)]

use std::time::Duration;

use parley_domain::ConversationId;
use parley_protocol::{ErrorEvent, ServerEvent};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::rooms::{RoomRouter, RoomRouterConfig};

fn conv(id: &str) -> ConversationId {
	ConversationId::new(id.to_string()).expect("valid ConversationId")
}

fn marker(code: &str) -> ServerEvent {
	ServerEvent::Error(ErrorEvent::new(code, "marker"))
}

fn code_of(ev: &ServerEvent) -> &str {
	match ev {
		ServerEvent::Error(e) => e.code.as_str(),
		other => panic!("expected error marker, got: {other:?}"),
	}
}

#[tokio::test]
async fn publish_reaches_only_subscribers_of_that_conversation() {
	let router = RoomRouter::new(RoomRouterConfig {
		subscriber_queue_capacity: 16,
	});

	let (tx_a, mut rx_a) = mpsc::channel(16);
	let (tx_b, mut rx_b) = mpsc::channel(16);

	router.join(conv("a"), 1, tx_a).await;
	router.join(conv("b"), 2, tx_b).await;

	router.publish(&conv("a"), marker("A1"), None).await;

	let got = timeout(Duration::from_millis(250), rx_a.recv())
		.await
		.expect("expected event within timeout")
		.expect("channel open");
	assert_eq!(code_of(&got), "A1");

	let unexpected = timeout(Duration::from_millis(50), rx_b.recv()).await;
	assert!(unexpected.is_err(), "subscriber of conversation b received an event for a");
}

#[tokio::test]
async fn publish_excludes_the_acting_connection() {
	let router = RoomRouter::new(RoomRouterConfig {
		subscriber_queue_capacity: 16,
	});

	let (tx_1, mut rx_1) = mpsc::channel(16);
	let (tx_2, mut rx_2) = mpsc::channel(16);

	router.join(conv("a"), 1, tx_1).await;
	router.join(conv("a"), 2, tx_2).await;

	router.publish(&conv("a"), marker("X"), Some(1)).await;

	let got = timeout(Duration::from_millis(250), rx_2.recv())
		.await
		.expect("expected event within timeout")
		.expect("channel open");
	assert_eq!(code_of(&got), "X");

	let excluded = timeout(Duration::from_millis(50), rx_1.recv()).await;
	assert!(excluded.is_err(), "excluded connection received its own event");
}

#[tokio::test]
async fn join_is_idempotent_per_connection() {
	let router = RoomRouter::new(RoomRouterConfig {
		subscriber_queue_capacity: 16,
	});

	let (tx, mut rx) = mpsc::channel(16);
	router.join(conv("a"), 1, tx.clone()).await;
	router.join(conv("a"), 1, tx).await;

	router.publish(&conv("a"), marker("ONCE"), None).await;

	let first = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected event within timeout")
		.expect("channel open");
	assert_eq!(code_of(&first), "ONCE");

	let duplicate = timeout(Duration::from_millis(50), rx.recv()).await;
	assert!(duplicate.is_err(), "duplicate subscription delivered the event twice");
}

#[tokio::test]
async fn leave_all_returns_the_conversations_left() {
	let router = RoomRouter::new(RoomRouterConfig {
		subscriber_queue_capacity: 16,
	});

	let (tx, _rx) = mpsc::channel(16);
	router.join(conv("a"), 1, tx.clone()).await;
	router.join(conv("b"), 1, tx).await;

	let mut left = router.leave_all(1).await;
	left.sort_by(|a, b| a.as_str().cmp(b.as_str()));
	assert_eq!(left, vec![conv("a"), conv("b")]);

	assert!(!router.is_joined(&conv("a"), 1).await);
	assert!(router.subscriber_counts().await.is_empty());
}

#[tokio::test]
async fn full_subscriber_queue_drops_instead_of_blocking() {
	let router = RoomRouter::new(RoomRouterConfig {
		subscriber_queue_capacity: 1,
	});

	let (tx, mut rx) = mpsc::channel(1);
	router.join(conv("a"), 1, tx).await;

	router.publish(&conv("a"), marker("FIRST"), None).await;
	router.publish(&conv("a"), marker("OVERFLOW"), None).await;

	let first = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected first event within timeout")
		.expect("channel open");
	assert_eq!(code_of(&first), "FIRST");

	let dropped = timeout(Duration::from_millis(50), rx.recv()).await;
	assert!(dropped.is_err(), "overflow event was not dropped");
}

#[tokio::test]
async fn closed_subscribers_are_pruned_on_publish() {
	let router = RoomRouter::new(RoomRouterConfig {
		subscriber_queue_capacity: 16,
	});

	{
		let (tx, _rx) = mpsc::channel(16);
		router.join(conv("a"), 1, tx).await;
	}

	router.publish(&conv("a"), marker("X"), None).await;

	assert!(!router.is_joined(&conv("a"), 1).await);
	assert_eq!(router.subscriber_counts().await.get(&conv("a")), None);
}
