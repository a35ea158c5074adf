#![forbid(unsafe_code)]

use std::time::Duration;

use parley_domain::{PresenceStatus, Role, RoomName, UserId};
use parley_protocol::ServerEvent;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::coordinator::CoordinatorState;
use crate::server::hub;
use crate::server::registry::{Session, SessionRegistry};

fn room(name: &str) -> RoomName {
	RoomName::channel(name).expect("valid channel name")
}

fn session(id: &str, name: &str, room_name: &str, conn_id: u64) -> (Session, mpsc::Receiver<ServerEvent>) {
	let (tx, rx) = mpsc::channel(16);
	(
		Session {
			user: UserId::new(id).expect("valid UserId"),
			name: name.to_string(),
			role: Role::User,
			room: room(room_name),
			status: PresenceStatus::Online,
			conn_id,
			outbox: tx,
		},
		rx,
	)
}

async fn recv(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
	timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected an event within timeout")
		.expect("channel open")
}

#[test]
fn register_displaces_previous_session() {
	let mut registry = SessionRegistry::default();
	let (first, _rx1) = session("alice", "Alice", "#general", 1);
	let (second, _rx2) = session("alice", "Alice", "#general", 2);

	assert!(registry.register(first).is_none());
	let displaced = registry.register(second).expect("old session returned");
	assert_eq!(displaced.conn_id, 1);
	assert_eq!(registry.len(), 1);
	assert_eq!(
		registry.lookup(&UserId::new("alice").unwrap()).map(|s| s.conn_id),
		Some(2)
	);
}

#[test]
fn remove_if_conn_ignores_stale_connections() {
	let mut registry = SessionRegistry::default();
	let user = UserId::new("alice").unwrap();
	let (first, _rx1) = session("alice", "Alice", "#general", 1);
	let (second, _rx2) = session("alice", "Alice", "#general", 2);

	registry.register(first);
	registry.register(second);

	// The replaced connection's teardown must not remove the live session.
	assert!(registry.remove_if_conn(&user, 1).is_none());
	assert_eq!(registry.lookup(&user).map(|s| s.conn_id), Some(2));

	assert!(registry.remove_if_conn(&user, 2).is_some());
	assert!(registry.is_empty());
}

#[test]
fn active_users_sorted_by_name_and_scoped_to_room() {
	let mut registry = SessionRegistry::default();
	let (carol, _rx1) = session("carol", "Carol", "#general", 1);
	let (alice, _rx2) = session("alice", "Alice", "#general", 2);
	let (bob, _rx3) = session("bob", "Bob", "#dev", 3);

	registry.register(carol);
	registry.register(alice);
	registry.register(bob);

	let users = registry.active_users(&room("#general"));
	let names: Vec<&str> = users.iter().map(|u| u.name.as_str()).collect();
	assert_eq!(names, vec!["Alice", "Carol"]);
}

#[tokio::test]
async fn send_to_reports_whether_delivery_happened() {
	let mut registry = SessionRegistry::default();
	let (alice, mut rx_alice) = session("alice", "Alice", "#general", 1);
	registry.register(alice);

	let alice_id = UserId::new("alice").unwrap();
	assert!(hub::send_to(&registry, &alice_id, ServerEvent::Kicked { reason: None }));
	recv(&mut rx_alice).await;

	// No session for the target.
	assert!(!hub::send_to(&registry, &UserId::new("ghost").unwrap(), ServerEvent::Kicked { reason: None }));

	// The session's transport is gone.
	drop(rx_alice);
	assert!(!hub::send_to(&registry, &alice_id, ServerEvent::Kicked { reason: None }));
}

#[tokio::test]
async fn force_remove_notifies_target_and_reconciles_room() {
	let mut state = CoordinatorState::default();
	let (alice, mut rx_alice) = session("alice", "Alice", "#general", 1);
	let (bob, mut rx_bob) = session("bob", "Bob", "#general", 2);
	state.registry.register(alice);
	state.registry.register(bob);

	// Alice was mid-typing when removed; the room must see the set empty out.
	state.typing.set(&room("#general"), "Alice", true);

	let removed = state.force_remove(&UserId::new("alice").unwrap(), ServerEvent::Kicked { reason: None });
	assert!(removed.is_some());
	assert!(state.registry.lookup(&UserId::new("alice").unwrap()).is_none());

	assert_eq!(recv(&mut rx_alice).await, ServerEvent::Kicked { reason: None });

	match recv(&mut rx_bob).await {
		ServerEvent::TypingStatus { room: r, names } => {
			assert_eq!(r, room("#general"));
			assert!(names.is_empty());
		}
		other => panic!("expected TypingStatus, got: {other:?}"),
	}
	match recv(&mut rx_bob).await {
		ServerEvent::UserPresence { room: r, users } => {
			assert_eq!(r, room("#general"));
			assert_eq!(users.len(), 1);
			assert_eq!(users[0].name, "Bob");
		}
		other => panic!("expected UserPresence, got: {other:?}"),
	}
}
