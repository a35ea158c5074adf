#![forbid(unsafe_code)]

pub mod sql;

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use parley_domain::{
	AuditEntry, ChannelInfo, Message, MessageId, PresenceStatus, ReactionMap, Role, RoomName, UserId,
};
use thiserror::Error;

/// Persistence collaborator failures. Read-path callers degrade to safe
/// defaults; write-path callers surface one error event and abandon.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
	#[error("record not found")]
	NotFound,

	#[error("conflict: {0}")]
	Conflict(String),

	#[error("storage backend error: {0}")]
	Backend(String),
}

/// Durable user record as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
	pub id: UserId,
	pub name: String,
	pub role: Role,
	pub banned: bool,
	pub ban_reason: Option<String>,
	pub last_room: Option<RoomName>,
	pub status: PresenceStatus,
}

/// Query interface to the external persistence service. All operations are
/// asynchronous and fallible; the coordinator never assumes they reflect
/// in-memory state synchronously.
#[async_trait]
pub trait ChatStore: Send + Sync {
	async fn create_channel(&self, info: ChannelInfo) -> Result<(), StoreError>;
	async fn delete_channel(&self, name: &RoomName) -> Result<(), StoreError>;
	async fn channel(&self, name: &RoomName) -> Result<Option<ChannelInfo>, StoreError>;
	async fn channel_by_code(&self, code: &str) -> Result<Option<ChannelInfo>, StoreError>;
	/// All public channels plus private channels where the user holds
	/// membership (or ownership).
	async fn visible_channels(&self, user: &UserId) -> Result<Vec<ChannelInfo>, StoreError>;
	async fn add_member(&self, channel: &RoomName, user: &UserId) -> Result<(), StoreError>;
	async fn set_pinned(&self, channel: &RoomName, pinned: Option<MessageId>) -> Result<(), StoreError>;

	async fn create_message(&self, message: &Message) -> Result<(), StoreError>;
	async fn message(&self, id: MessageId) -> Result<Option<Message>, StoreError>;
	async fn update_message(&self, id: MessageId, content: &str, edited_at_ms: i64) -> Result<Message, StoreError>;
	/// Remove a message; replies to it stay in place with their parent
	/// reference cleared.
	async fn delete_message(&self, id: MessageId) -> Result<(), StoreError>;
	/// Ordered history for a room, oldest first, with reactions aggregated.
	async fn history(&self, room: &RoomName, limit: usize) -> Result<Vec<Message>, StoreError>;

	/// Idempotent reaction add; returns the aggregated reaction map.
	async fn add_reaction(&self, id: MessageId, user: &UserId, emoji: &str) -> Result<ReactionMap, StoreError>;
	/// Idempotent reaction remove; returns the aggregated reaction map.
	async fn remove_reaction(&self, id: MessageId, user: &UserId, emoji: &str) -> Result<ReactionMap, StoreError>;

	async fn user(&self, id: &UserId) -> Result<Option<UserRecord>, StoreError>;
	async fn user_by_name(&self, name: &str) -> Result<Option<UserRecord>, StoreError>;
	async fn set_status(&self, user: &UserId, status: PresenceStatus) -> Result<(), StoreError>;
	async fn set_last_room(&self, user: &UserId, room: &RoomName) -> Result<(), StoreError>;
	async fn set_banned(&self, user: &UserId, reason: Option<&str>) -> Result<(), StoreError>;

	async fn record_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
	users: HashMap<UserId, UserRecord>,
	tokens: HashMap<String, UserId>,
	channels: HashMap<RoomName, ChannelInfo>,
	members: HashMap<RoomName, BTreeSet<UserId>>,
	messages: HashMap<MessageId, Message>,
	order: Vec<MessageId>,
	audits: Vec<AuditEntry>,
}

/// HashMap-backed store for tests and database-less deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
	inner: Mutex<MemoryInner>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
		// Lock poisoning only happens after a panic in this module; recover
		// with the inner state either way.
		self.inner.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Register a user and the token that resolves to it.
	pub fn add_user(&self, record: UserRecord, token: impl Into<String>) {
		let mut inner = self.lock();
		inner.tokens.insert(token.into(), record.id.clone());
		inner.users.insert(record.id.clone(), record);
	}

	/// Snapshot of recorded audit entries.
	pub fn audits(&self) -> Vec<AuditEntry> {
		self.lock().audits.clone()
	}

	pub(crate) fn resolve_token(&self, token: &str) -> Option<UserRecord> {
		let inner = self.lock();
		let id = inner.tokens.get(token)?;
		inner.users.get(id).cloned()
	}
}

#[async_trait]
impl ChatStore for MemoryStore {
	async fn create_channel(&self, info: ChannelInfo) -> Result<(), StoreError> {
		let mut inner = self.lock();
		if inner.channels.contains_key(&info.name) {
			return Err(StoreError::Conflict(format!("channel {} already exists", info.name)));
		}
		inner.members.entry(info.name.clone()).or_default().insert(info.owner.clone());
		inner.channels.insert(info.name.clone(), info);
		Ok(())
	}

	async fn delete_channel(&self, name: &RoomName) -> Result<(), StoreError> {
		let mut inner = self.lock();
		if inner.channels.remove(name).is_none() {
			return Err(StoreError::NotFound);
		}
		inner.members.remove(name);
		let doomed: Vec<MessageId> = inner
			.messages
			.values()
			.filter(|m| &m.room == name)
			.map(|m| m.id)
			.collect();
		for id in doomed {
			inner.messages.remove(&id);
			inner.order.retain(|o| *o != id);
		}
		Ok(())
	}

	async fn channel(&self, name: &RoomName) -> Result<Option<ChannelInfo>, StoreError> {
		Ok(self.lock().channels.get(name).cloned())
	}

	async fn channel_by_code(&self, code: &str) -> Result<Option<ChannelInfo>, StoreError> {
		Ok(self
			.lock()
			.channels
			.values()
			.find(|c| c.invite_code.as_deref() == Some(code))
			.cloned())
	}

	async fn visible_channels(&self, user: &UserId) -> Result<Vec<ChannelInfo>, StoreError> {
		let inner = self.lock();
		let mut out: Vec<ChannelInfo> = inner
			.channels
			.values()
			.filter(|c| {
				!c.private
					|| c.owner == *user
					|| inner.members.get(&c.name).is_some_and(|m| m.contains(user))
			})
			.cloned()
			.collect();
		out.sort_by(|a, b| a.name.cmp(&b.name));
		Ok(out)
	}

	async fn add_member(&self, channel: &RoomName, user: &UserId) -> Result<(), StoreError> {
		let mut inner = self.lock();
		if !inner.channels.contains_key(channel) {
			return Err(StoreError::NotFound);
		}
		inner.members.entry(channel.clone()).or_default().insert(user.clone());
		Ok(())
	}

	async fn set_pinned(&self, channel: &RoomName, pinned: Option<MessageId>) -> Result<(), StoreError> {
		let mut inner = self.lock();
		let info = inner.channels.get_mut(channel).ok_or(StoreError::NotFound)?;
		info.pinned = pinned;
		Ok(())
	}

	async fn create_message(&self, message: &Message) -> Result<(), StoreError> {
		let mut inner = self.lock();
		if inner.messages.contains_key(&message.id) {
			return Err(StoreError::Conflict(format!("message {} already exists", message.id)));
		}
		inner.order.push(message.id);
		inner.messages.insert(message.id, message.clone());
		Ok(())
	}

	async fn message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
		Ok(self.lock().messages.get(&id).cloned())
	}

	async fn update_message(&self, id: MessageId, content: &str, edited_at_ms: i64) -> Result<Message, StoreError> {
		let mut inner = self.lock();
		let msg = inner.messages.get_mut(&id).ok_or(StoreError::NotFound)?;
		msg.content = content.to_string();
		msg.edited_at_ms = Some(edited_at_ms);
		Ok(msg.clone())
	}

	async fn delete_message(&self, id: MessageId) -> Result<(), StoreError> {
		let mut inner = self.lock();
		if inner.messages.remove(&id).is_none() {
			return Err(StoreError::NotFound);
		}
		inner.order.retain(|o| *o != id);
		for msg in inner.messages.values_mut() {
			if msg.parent == Some(id) {
				msg.orphan();
			}
		}
		Ok(())
	}

	async fn history(&self, room: &RoomName, limit: usize) -> Result<Vec<Message>, StoreError> {
		let inner = self.lock();
		let mut out: Vec<Message> = inner
			.order
			.iter()
			.filter_map(|id| inner.messages.get(id))
			.filter(|m| &m.room == room)
			.cloned()
			.collect();
		if out.len() > limit {
			out.drain(..out.len() - limit);
		}
		Ok(out)
	}

	async fn add_reaction(&self, id: MessageId, user: &UserId, emoji: &str) -> Result<ReactionMap, StoreError> {
		let mut inner = self.lock();
		let msg = inner.messages.get_mut(&id).ok_or(StoreError::NotFound)?;
		msg.reactions.entry(emoji.to_string()).or_default().insert(user.clone());
		Ok(msg.reactions.clone())
	}

	async fn remove_reaction(&self, id: MessageId, user: &UserId, emoji: &str) -> Result<ReactionMap, StoreError> {
		let mut inner = self.lock();
		let msg = inner.messages.get_mut(&id).ok_or(StoreError::NotFound)?;
		if let Some(set) = msg.reactions.get_mut(emoji) {
			set.remove(user);
			if set.is_empty() {
				msg.reactions.remove(emoji);
			}
		}
		Ok(msg.reactions.clone())
	}

	async fn user(&self, id: &UserId) -> Result<Option<UserRecord>, StoreError> {
		Ok(self.lock().users.get(id).cloned())
	}

	async fn user_by_name(&self, name: &str) -> Result<Option<UserRecord>, StoreError> {
		Ok(self.lock().users.values().find(|u| u.name == name).cloned())
	}

	async fn set_status(&self, user: &UserId, status: PresenceStatus) -> Result<(), StoreError> {
		let mut inner = self.lock();
		let rec = inner.users.get_mut(user).ok_or(StoreError::NotFound)?;
		rec.status = status;
		Ok(())
	}

	async fn set_last_room(&self, user: &UserId, room: &RoomName) -> Result<(), StoreError> {
		let mut inner = self.lock();
		let rec = inner.users.get_mut(user).ok_or(StoreError::NotFound)?;
		rec.last_room = Some(room.clone());
		Ok(())
	}

	async fn set_banned(&self, user: &UserId, reason: Option<&str>) -> Result<(), StoreError> {
		let mut inner = self.lock();
		let rec = inner.users.get_mut(user).ok_or(StoreError::NotFound)?;
		rec.banned = true;
		rec.ban_reason = reason.map(str::to_string);
		Ok(())
	}

	async fn record_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
		self.lock().audits.push(entry.clone());
		Ok(())
	}
}
