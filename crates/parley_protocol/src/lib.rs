#![forbid(unsafe_code)]

//! Decoded event records exchanged between clients and the coordinator.
//!
//! The coordinator core consumes [`ClientEvent`] values and produces
//! [`ServerEvent`] values; how they travel over a transport is an edge
//! concern (see [`codec`] for the newline-delimited JSON codec the shipped
//! binary uses).

pub mod codec;

use parley_domain::{Message, MessageId, PresenceStatus, ReactionMap, Role, RoomName, UserId};
use serde::{Deserialize, Serialize};

/// Client-facing channel listing entry. Invite codes and ownership stay
/// server-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
	pub name: RoomName,
	pub private: bool,
}

/// One user in a room presence snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
	pub user: UserId,
	pub name: String,
	pub status: PresenceStatus,
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
	Login {
		token: String,
	},
	SendMessage {
		content: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		attachment: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		parent: Option<MessageId>,
	},
	SendDm {
		to: UserId,
		content: String,
	},
	CreateChannel {
		name: String,
		#[serde(default)]
		private: bool,
	},
	DeleteChannel {
		name: String,
	},
	JoinChannelByCode {
		code: String,
	},
	TypingUpdate {
		typing: bool,
	},
	EditMessage {
		message_id: MessageId,
		content: String,
	},
	DeleteMessage {
		message_id: MessageId,
	},
	AddReaction {
		message_id: MessageId,
		emoji: String,
	},
	RemoveReaction {
		message_id: MessageId,
		emoji: String,
	},
	JoinChannel {
		name: String,
	},
	StartDm {
		with: UserId,
	},
}

/// Events sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
	LoginSuccess {
		user: UserId,
		name: String,
		role: Role,
		room: RoomName,
	},
	InitialState {
		room: RoomName,
		channels: Vec<ChannelSummary>,
	},
	MessageHistory {
		room: RoomName,
		messages: Vec<Message>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		pinned: Option<Message>,
	},
	ChannelMessage {
		message: Message,
	},
	UserPresence {
		room: RoomName,
		users: Vec<PresenceEntry>,
	},
	TypingStatus {
		room: RoomName,
		names: Vec<String>,
	},
	ChannelListUpdate {
		channels: Vec<ChannelSummary>,
	},
	ChannelChange {
		room: RoomName,
		messages: Vec<Message>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		pinned: Option<Message>,
		channels: Vec<ChannelSummary>,
	},
	UpdatePinnedMessage {
		room: RoomName,
		#[serde(default)]
		message: Option<Message>,
	},
	MessageEdited {
		message: Message,
	},
	MessageDeleted {
		room: RoomName,
		message_id: MessageId,
	},
	MessageReacted {
		room: RoomName,
		message_id: MessageId,
		reactions: ReactionMap,
	},
	Notification {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		room: Option<RoomName>,
		text: String,
	},
	Error {
		code: String,
		message: String,
	},
	Kicked {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		reason: Option<String>,
	},
	Banned {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		reason: Option<String>,
	},
}

/// Error code carried by the terminal event a superseded session receives
/// when the same identity logs in again elsewhere.
pub const SUPERSEDED_CODE: &str = "superseded";

impl ServerEvent {
	/// Whether this event ends the session: the transport writer closes the
	/// connection after delivering it.
	pub fn is_terminal(&self) -> bool {
		match self {
			ServerEvent::Kicked { .. } | ServerEvent::Banned { .. } => true,
			ServerEvent::Error { code, .. } => code == SUPERSEDED_CODE,
			_ => false,
		}
	}
}
