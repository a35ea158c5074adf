#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_domain::{AuditKind, ChannelInfo, Message, MessageId, PresenceStatus, Role, RoomName, UserId};
use parley_protocol::ServerEvent;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::commands::{self, Command};
use crate::server::coordinator::{Coordinator, CoordinatorSettings};
use crate::server::dispatcher::AuthBinding;
use crate::server::error::EventError;
use crate::server::registry::Session;
use crate::server::store::{ChatStore, MemoryStore, UserRecord};
use crate::util::time::unix_ms_now;

fn room(name: &str) -> RoomName {
	RoomName::channel(name).expect("valid channel name")
}

fn uid(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

fn record(id: &str, name: &str, role: Role) -> UserRecord {
	UserRecord {
		id: uid(id),
		name: name.to_string(),
		role,
		banned: false,
		ban_reason: None,
		last_room: None,
		status: PresenceStatus::Online,
	}
}

fn auth(id: &str, name: &str, role: Role) -> AuthBinding {
	AuthBinding {
		user: uid(id),
		name: name.to_string(),
		role,
	}
}

async fn setup() -> (Arc<Coordinator>, Arc<MemoryStore>) {
	let store = Arc::new(MemoryStore::new());
	let coordinator = Coordinator::new(store.clone(), store.clone(), CoordinatorSettings::default());
	coordinator.ensure_default_channel().await;
	(coordinator, store)
}

/// Bind a session directly into the registry, returning its outbox receiver.
async fn connect(
	coordinator: &Coordinator,
	id: &str,
	name: &str,
	role: Role,
	room_name: &str,
	conn_id: u64,
) -> mpsc::Receiver<ServerEvent> {
	let (tx, rx) = mpsc::channel(16);
	let session = Session {
		user: uid(id),
		name: name.to_string(),
		role,
		room: room(room_name),
		status: PresenceStatus::Online,
		conn_id,
		outbox: tx,
	};
	coordinator.with_state(|st| st.registry.register(session)).await;
	rx
}

async fn recv(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
	timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected an event within timeout")
		.expect("channel open")
}

#[test]
fn parse_accepts_known_commands() {
	let id = MessageId::new_v4();
	assert_eq!(commands::parse(&format!("/pin {id}")).unwrap(), Command::Pin(id));
	assert_eq!(commands::parse("/unpin").unwrap(), Command::Unpin);
	assert_eq!(
		commands::parse("/kick Bob").unwrap(),
		Command::Kick { name: "Bob".to_string() }
	);
	assert_eq!(
		commands::parse("/ban Bob spamming the room").unwrap(),
		Command::Ban {
			name: "Bob".to_string(),
			reason: Some("spamming the room".to_string()),
		}
	);
	assert_eq!(
		commands::parse("/ban Bob").unwrap(),
		Command::Ban {
			name: "Bob".to_string(),
			reason: None,
		}
	);
	assert_eq!(commands::parse("/status away").unwrap(), Command::Status(PresenceStatus::Away));
}

#[test]
fn parse_rejects_unknown_and_malformed() {
	assert!(matches!(commands::parse("/frobnicate"), Err(EventError::Validation(_))));
	assert!(matches!(commands::parse("/pin"), Err(EventError::Validation(_))));
	assert!(matches!(commands::parse("/pin not-a-uuid"), Err(EventError::Validation(_))));
	assert!(matches!(commands::parse("/kick"), Err(EventError::Validation(_))));
	assert!(matches!(commands::parse("/status busy"), Err(EventError::Validation(_))));
	assert!(matches!(commands::parse("/"), Err(EventError::Validation(_))));
}

#[tokio::test]
async fn kick_requires_admin_role() {
	let (coordinator, store) = setup().await;
	store.add_user(record("alice", "Alice", Role::User), "tok-a");
	store.add_user(record("bob", "Bob", Role::User), "tok-b");
	let _rx_alice = connect(&coordinator, "alice", "Alice", Role::User, "#general", 1).await;
	let _rx_bob = connect(&coordinator, "bob", "Bob", Role::User, "#general", 2).await;

	let actor = auth("alice", "Alice", Role::User);
	let cmd = commands::parse("/kick Bob").unwrap();
	let err = commands::execute(&coordinator, &actor, &room("#general"), cmd)
		.await
		.unwrap_err();
	assert!(matches!(err, EventError::PermissionDenied(_)));

	// Bob is untouched.
	let still_there = coordinator.with_state(|st| st.registry.lookup(&uid("bob")).is_some()).await;
	assert!(still_there);
}

#[tokio::test]
async fn kick_cannot_target_equal_or_higher_rank() {
	let (coordinator, store) = setup().await;
	store.add_user(record("alice", "Alice", Role::Admin), "tok-a");
	store.add_user(record("root", "Root", Role::Admin), "tok-r");
	let _rx_alice = connect(&coordinator, "alice", "Alice", Role::Admin, "#general", 1).await;
	let _rx_root = connect(&coordinator, "root", "Root", Role::Admin, "#general", 2).await;

	let actor = auth("alice", "Alice", Role::Admin);
	let cmd = commands::parse("/kick Root").unwrap();
	let err = commands::execute(&coordinator, &actor, &room("#general"), cmd)
		.await
		.unwrap_err();
	assert!(matches!(err, EventError::PermissionDenied(_)));
}

#[tokio::test]
async fn ban_disconnects_persists_and_audits() {
	let (coordinator, store) = setup().await;
	store.add_user(record("alice", "Alice", Role::Admin), "tok-a");
	store.add_user(record("bob", "Bob", Role::User), "tok-b");
	let mut rx_alice = connect(&coordinator, "alice", "Alice", Role::Admin, "#general", 1).await;
	let mut rx_bob = connect(&coordinator, "bob", "Bob", Role::User, "#general", 2).await;

	let actor = auth("alice", "Alice", Role::Admin);
	let cmd = commands::parse("/ban Bob evil").unwrap();
	commands::execute(&coordinator, &actor, &room("#general"), cmd)
		.await
		.expect("ban succeeds");

	// Bob sees the notice, then the terminal event.
	match recv(&mut rx_bob).await {
		ServerEvent::Notification { text, .. } => assert!(text.contains("banned"), "got: {text}"),
		other => panic!("expected Notification, got: {other:?}"),
	}
	assert_eq!(
		recv(&mut rx_bob).await,
		ServerEvent::Banned {
			reason: Some("evil".to_string())
		}
	);

	// The room sees the notice and the presence shrink.
	match recv(&mut rx_alice).await {
		ServerEvent::Notification { text, .. } => assert!(text.contains("Bob")),
		other => panic!("expected Notification, got: {other:?}"),
	}
	match recv(&mut rx_alice).await {
		ServerEvent::UserPresence { users, .. } => {
			assert_eq!(users.len(), 1);
			assert_eq!(users[0].name, "Alice");
		}
		other => panic!("expected UserPresence, got: {other:?}"),
	}

	let gone = coordinator.with_state(|st| st.registry.lookup(&uid("bob")).is_none()).await;
	assert!(gone);
	let in_memory = coordinator.with_state(|st| st.banned.contains_key(&uid("bob"))).await;
	assert!(in_memory);

	let rec = store.user(&uid("bob")).await.unwrap().unwrap();
	assert!(rec.banned);
	assert_eq!(rec.ban_reason.as_deref(), Some("evil"));

	let audits = store.audits();
	assert_eq!(audits.len(), 1);
	assert_eq!(audits[0].kind, AuditKind::UserBan);
	assert_eq!(audits[0].actor, uid("alice"));
	assert_eq!(audits[0].target, Some(uid("bob")));
	assert_eq!(audits[0].detail.as_deref(), Some("evil"));
}

#[tokio::test]
async fn ban_works_for_offline_target() {
	let (coordinator, store) = setup().await;
	store.add_user(record("alice", "Alice", Role::Admin), "tok-a");
	store.add_user(record("bob", "Bob", Role::User), "tok-b");
	let _rx_alice = connect(&coordinator, "alice", "Alice", Role::Admin, "#general", 1).await;

	let actor = auth("alice", "Alice", Role::Admin);
	let cmd = commands::parse("/ban Bob").unwrap();
	commands::execute(&coordinator, &actor, &room("#general"), cmd)
		.await
		.expect("offline ban succeeds");

	let rec = store.user(&uid("bob")).await.unwrap().unwrap();
	assert!(rec.banned);
	let in_memory = coordinator.with_state(|st| st.banned.contains_key(&uid("bob"))).await;
	assert!(in_memory);
}

#[tokio::test]
async fn status_command_updates_presence() {
	let (coordinator, store) = setup().await;
	store.add_user(record("alice", "Alice", Role::User), "tok-a");
	let mut rx_alice = connect(&coordinator, "alice", "Alice", Role::User, "#general", 1).await;

	let actor = auth("alice", "Alice", Role::User);
	let cmd = commands::parse("/status dnd").unwrap();
	commands::execute(&coordinator, &actor, &room("#general"), cmd)
		.await
		.expect("status change succeeds");

	match recv(&mut rx_alice).await {
		ServerEvent::UserPresence { users, .. } => {
			assert_eq!(users.len(), 1);
			assert_eq!(users[0].status, PresenceStatus::Dnd);
		}
		other => panic!("expected UserPresence, got: {other:?}"),
	}
	assert_eq!(store.user(&uid("alice")).await.unwrap().unwrap().status, PresenceStatus::Dnd);
}

#[tokio::test]
async fn pin_and_unpin_broadcast_to_the_room() {
	let (coordinator, store) = setup().await;
	store.add_user(record("alice", "Alice", Role::Admin), "tok-a");
	let mut rx_alice = connect(&coordinator, "alice", "Alice", Role::Admin, "#general", 1).await;

	let message = Message::new(
		MessageId::new_v4(),
		room("#general"),
		uid("alice"),
		"Alice",
		"read me",
		unix_ms_now(),
		None,
		None,
	);
	store.create_message(&message).await.unwrap();

	let actor = auth("alice", "Alice", Role::Admin);
	let cmd = commands::parse(&format!("/pin {}", message.id)).unwrap();
	commands::execute(&coordinator, &actor, &room("#general"), cmd)
		.await
		.expect("pin succeeds");

	match recv(&mut rx_alice).await {
		ServerEvent::UpdatePinnedMessage { message: Some(m), .. } => assert_eq!(m.id, message.id),
		other => panic!("expected UpdatePinnedMessage, got: {other:?}"),
	}
	let info = store.channel(&room("#general")).await.unwrap().unwrap();
	assert_eq!(info.pinned, Some(message.id));

	commands::execute(&coordinator, &actor, &room("#general"), Command::Unpin)
		.await
		.expect("unpin succeeds");
	match recv(&mut rx_alice).await {
		ServerEvent::UpdatePinnedMessage { message: None, .. } => {}
		other => panic!("expected cleared pin, got: {other:?}"),
	}
}

#[tokio::test]
async fn pin_rejects_messages_from_other_rooms() {
	let (coordinator, store) = setup().await;
	store.add_user(record("alice", "Alice", Role::Admin), "tok-a");
	store
		.create_channel(ChannelInfo {
			name: room("#dev"),
			owner: uid("alice"),
			private: false,
			invite_code: None,
			pinned: None,
		})
		.await
		.unwrap();
	let _rx_alice = connect(&coordinator, "alice", "Alice", Role::Admin, "#general", 1).await;

	let elsewhere = Message::new(
		MessageId::new_v4(),
		room("#dev"),
		uid("alice"),
		"Alice",
		"wrong room",
		unix_ms_now(),
		None,
		None,
	);
	store.create_message(&elsewhere).await.unwrap();

	let actor = auth("alice", "Alice", Role::Admin);
	let cmd = commands::parse(&format!("/pin {}", elsewhere.id)).unwrap();
	let err = commands::execute(&coordinator, &actor, &room("#general"), cmd)
		.await
		.unwrap_err();
	assert!(matches!(err, EventError::NotFound(_)));
}
