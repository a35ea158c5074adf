#![forbid(unsafe_code)]

use std::collections::HashMap;

use parley_domain::{PresenceStatus, Role, RoomName, UserId};
use parley_protocol::{PresenceEntry, ServerEvent};
use tokio::sync::mpsc;

/// The live, in-memory record binding an authenticated identity to a
/// connection and its current room/role/status.
#[derive(Debug, Clone)]
pub struct Session {
	pub user: UserId,
	pub name: String,
	pub role: Role,
	pub room: RoomName,
	pub status: PresenceStatus,
	pub conn_id: u64,
	pub outbox: mpsc::Sender<ServerEvent>,
}

/// Single source of truth for who is connected, bound to which room.
///
/// Plain struct with no interior locking: the coordinator owns it behind one
/// mutex, so every mutation here is already serialized.
#[derive(Debug, Default)]
pub struct SessionRegistry {
	sessions: HashMap<UserId, Session>,
}

impl SessionRegistry {
	/// Install a session, returning any displaced session for the same
	/// identity. The caller must notify and drop the displaced session before
	/// releasing the coordinator lock so two concurrent logins can never both
	/// succeed.
	pub fn register(&mut self, session: Session) -> Option<Session> {
		self.sessions.insert(session.user.clone(), session)
	}

	pub fn lookup(&self, user: &UserId) -> Option<&Session> {
		self.sessions.get(user)
	}

	pub fn lookup_mut(&mut self, user: &UserId) -> Option<&mut Session> {
		self.sessions.get_mut(user)
	}

	/// Find a connected session by display name.
	pub fn find_by_name(&self, name: &str) -> Option<&Session> {
		self.sessions.values().find(|s| s.name == name)
	}

	pub fn remove(&mut self, user: &UserId) -> Option<Session> {
		self.sessions.remove(user)
	}

	/// Remove only if the session still belongs to the given connection.
	/// Keeps disconnect handling idempotent after a forced replacement: the
	/// old connection's teardown must not tear down the new session.
	pub fn remove_if_conn(&mut self, user: &UserId, conn_id: u64) -> Option<Session> {
		if self.sessions.get(user).is_some_and(|s| s.conn_id == conn_id) {
			self.sessions.remove(user)
		} else {
			None
		}
	}

	/// Sessions currently bound to `room`.
	pub fn in_room<'a>(&'a self, room: &'a RoomName) -> impl Iterator<Item = &'a Session> + 'a {
		self.sessions.values().filter(move |s| &s.room == room)
	}

	/// Presence snapshot for a room, derived live from the sessions.
	pub fn active_users(&self, room: &RoomName) -> Vec<PresenceEntry> {
		let mut users: Vec<PresenceEntry> = self
			.in_room(room)
			.map(|s| PresenceEntry {
				user: s.user.clone(),
				name: s.name.clone(),
				status: s.status,
			})
			.collect();
		users.sort_by(|a, b| a.name.cmp(&b.name));
		users
	}

	pub fn iter(&self) -> impl Iterator<Item = &Session> {
		self.sessions.values()
	}

	pub fn len(&self) -> usize {
		self.sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.is_empty()
	}
}
