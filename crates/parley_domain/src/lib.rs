#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers and names from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("value too long (max {0} chars)")]
	TooLong(usize),
	#[error("invalid character in value: {0:?}")]
	InvalidChar(char),
	#[error("unknown role: {0}")]
	UnknownRole(String),
	#[error("unknown presence status: {0}")]
	UnknownStatus(String),
	#[error("channel name collides with the direct-message namespace")]
	ReservedName,
}

/// Identity of a registered user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
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

/// Ordered roles; every permission check is `role >= required`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	Guest,
	User,
	Moderator,
	Admin,
}

impl Role {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::Guest => "guest",
			Role::User => "user",
			Role::Moderator => "moderator",
			Role::Admin => "admin",
		}
	}

	/// Whether this role meets a required minimum.
	pub fn meets(self, required: Role) -> bool {
		self >= required
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Role {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"guest" => Ok(Role::Guest),
			"user" => Ok(Role::User),
			"moderator" | "mod" => Ok(Role::Moderator),
			"admin" => Ok(Role::Admin),
			other => Err(ParseIdError::UnknownRole(other.to_string())),
		}
	}
}

/// Presence status a user advertises to a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
	Online,
	Away,
	Dnd,
}

impl PresenceStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			PresenceStatus::Online => "online",
			PresenceStatus::Away => "away",
			PresenceStatus::Dnd => "dnd",
		}
	}
}

impl fmt::Display for PresenceStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for PresenceStatus {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"online" => Ok(PresenceStatus::Online),
			"away" => Ok(PresenceStatus::Away),
			"dnd" => Ok(PresenceStatus::Dnd),
			other => Err(ParseIdError::UnknownStatus(other.to_string())),
		}
	}
}

/// Prefix reserved for direct-message room names.
const DM_PREFIX: &str = "dm:";

/// Maximum channel name length (without the optional `#`).
const MAX_CHANNEL_NAME_LEN: usize = 64;

/// The unit of broadcast scoping: a named channel or a direct-message pair.
///
/// Direct-message names are derived from the two participant ids in sorted
/// order so both sides compute the same name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomName(String);

impl RoomName {
	/// Validate and create a channel room name. A leading `#` is allowed.
	pub fn channel(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		let bare = name.strip_prefix('#').unwrap_or(&name);
		if bare.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if bare.len() > MAX_CHANNEL_NAME_LEN {
			return Err(ParseIdError::TooLong(MAX_CHANNEL_NAME_LEN));
		}
		if name.starts_with(DM_PREFIX) {
			return Err(ParseIdError::ReservedName);
		}
		if let Some(c) = bare.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '-') {
			return Err(ParseIdError::InvalidChar(c));
		}
		Ok(Self(name))
	}

	/// Deterministic direct-message room name for a pair of users.
	pub fn direct(a: &UserId, b: &UserId) -> Self {
		let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
		Self(format!("{DM_PREFIX}{lo}:{hi}"))
	}

	/// Accept an already-derived room name from the wire without
	/// re-validating the channel charset (history lookups, typing updates).
	pub fn from_wire(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		if name.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(name))
	}

	/// Whether this room is a direct-message pair.
	pub fn is_direct(&self) -> bool {
		self.0.starts_with(DM_PREFIX)
	}

	/// The two participant ids of a direct-message room, if it is one.
	pub fn direct_peers(&self) -> Option<(UserId, UserId)> {
		let rest = self.0.strip_prefix(DM_PREFIX)?;
		let (a, b) = rest.split_once(':')?;
		Some((UserId::new(a).ok()?, UserId::new(b).ok()?))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for RoomName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
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
	type Err = uuid::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(uuid::Uuid::parse_str(s.trim())?))
	}
}

/// Aggregated reactions: emoji symbol to the set of reacting users.
pub type ReactionMap = BTreeMap<String, BTreeSet<UserId>>;

/// A chat message belonging to exactly one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub room: RoomName,
	pub author: UserId,
	pub author_name: String,
	pub content: String,
	pub created_at_ms: i64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub edited_at_ms: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub attachment: Option<String>,
	#[serde(default, skip_serializing_if = "ReactionMap::is_empty")]
	pub reactions: ReactionMap,
	/// Parent message for threaded replies. A message whose parent was
	/// removed stays in place with this cleared.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parent: Option<MessageId>,
	/// True iff the message has no parent.
	pub thread_root: bool,
}

impl Message {
	/// Build a new message; the thread-root flag is derived from `parent`.
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		id: MessageId,
		room: RoomName,
		author: UserId,
		author_name: impl Into<String>,
		content: impl Into<String>,
		created_at_ms: i64,
		attachment: Option<String>,
		parent: Option<MessageId>,
	) -> Self {
		Self {
			id,
			room,
			author,
			author_name: author_name.into(),
			content: content.into(),
			created_at_ms,
			edited_at_ms: None,
			attachment,
			reactions: ReactionMap::new(),
			thread_root: parent.is_none(),
			parent,
		}
	}

	/// Clear the parent reference, keeping the message in place. With no
	/// parent left, the message becomes a thread root of its own.
	pub fn orphan(&mut self) {
		self.parent = None;
		self.thread_root = true;
	}
}

/// Queryable channel record surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
	pub name: RoomName,
	pub owner: UserId,
	pub private: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub invite_code: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pinned: Option<MessageId>,
}

/// Kinds of moderation/administrative actions recorded for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
	UserKick,
	UserBan,
	MessageDelete,
	ChannelCreate,
	ChannelDelete,
}

impl AuditKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			AuditKind::UserKick => "USER_KICK",
			AuditKind::UserBan => "USER_BAN",
			AuditKind::MessageDelete => "MESSAGE_DELETE",
			AuditKind::ChannelCreate => "CHANNEL_CREATE",
			AuditKind::ChannelDelete => "CHANNEL_DELETE",
		}
	}
}

impl fmt::Display for AuditKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Append-only record of a moderation action; written to the persistence
/// collaborator only, never held in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
	pub kind: AuditKind,
	pub actor: UserId,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub target: Option<UserId>,
	pub room: RoomName,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub detail: Option<String>,
	pub at_ms: i64,
}
