#![forbid(unsafe_code)]

use std::str::FromStr;

use parley_domain::{AuditEntry, AuditKind, MessageId, PresenceStatus, Role, RoomName};
use parley_protocol::ServerEvent;
use tracing::info;

use crate::server::coordinator::Coordinator;
use crate::server::dispatcher::AuthBinding;
use crate::server::error::EventError;
use crate::server::hub;
use crate::server::registry::SessionRegistry;
use crate::util::time::unix_ms_now;

/// Message content starting with this marker is a command, never a chat
/// message.
pub const COMMAND_MARKER: char = '/';

/// Commands embedded in message content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
	Pin(MessageId),
	Unpin,
	Kick { name: String },
	Ban { name: String, reason: Option<String> },
	Status(PresenceStatus),
}

impl Command {
	/// Minimum role required; `None` means self-service.
	pub fn min_role(&self) -> Option<Role> {
		match self {
			Command::Pin(_) | Command::Unpin | Command::Kick { .. } | Command::Ban { .. } => Some(Role::Admin),
			Command::Status(_) => None,
		}
	}
}

pub fn is_command(content: &str) -> bool {
	content.starts_with(COMMAND_MARKER)
}

/// Parse command content (including the marker). Unknown or malformed
/// commands are user-visible validation errors, never fatal.
pub fn parse(content: &str) -> Result<Command, EventError> {
	let body = content
		.strip_prefix(COMMAND_MARKER)
		.ok_or_else(|| EventError::Validation("not a command".to_string()))?;

	let mut parts = body.split_whitespace();
	let verb = parts
		.next()
		.ok_or_else(|| EventError::Validation("empty command".to_string()))?;

	match verb {
		"pin" => {
			let raw = parts
				.next()
				.ok_or_else(|| EventError::Validation("usage: /pin <message-id>".to_string()))?;
			let id = MessageId::from_str(raw).map_err(|_| EventError::Validation(format!("invalid message id: {raw}")))?;
			Ok(Command::Pin(id))
		}
		"unpin" => Ok(Command::Unpin),
		"kick" => {
			let name = parts
				.next()
				.ok_or_else(|| EventError::Validation("usage: /kick <name>".to_string()))?;
			Ok(Command::Kick { name: name.to_string() })
		}
		"ban" => {
			let name = parts
				.next()
				.ok_or_else(|| EventError::Validation("usage: /ban <name> [reason]".to_string()))?
				.to_string();
			let reason = {
				let rest: Vec<&str> = parts.collect();
				if rest.is_empty() { None } else { Some(rest.join(" ")) }
			};
			Ok(Command::Ban { name, reason })
		}
		"status" => {
			let raw = parts
				.next()
				.ok_or_else(|| EventError::Validation("usage: /status <online|away|dnd>".to_string()))?;
			let status =
				PresenceStatus::from_str(raw).map_err(|_| EventError::Validation(format!("unknown status: {raw}")))?;
			Ok(Command::Status(status))
		}
		other => Err(EventError::Validation(format!("unknown command: /{other}"))),
	}
}

/// Execute a parsed command for an authenticated actor bound to `room`.
pub async fn execute(
	coordinator: &Coordinator,
	actor: &AuthBinding,
	room: &RoomName,
	command: Command,
) -> Result<(), EventError> {
	if let Some(required) = command.min_role()
		&& !actor.role.meets(required)
	{
		metrics::counter!("parley_server_commands_denied_total").increment(1);
		return Err(EventError::PermissionDenied(format!(
			"{} requires the {} role",
			command_name(&command),
			required
		)));
	}

	metrics::counter!("parley_server_commands_total").increment(1);

	match command {
		Command::Pin(id) => pin(coordinator, room, id).await,
		Command::Unpin => unpin(coordinator, room).await,
		Command::Kick { name } => kick(coordinator, actor, room, &name).await,
		Command::Ban { name, reason } => ban(coordinator, actor, room, &name, reason).await,
		Command::Status(status) => set_status(coordinator, actor, status).await,
	}
}

fn command_name(command: &Command) -> &'static str {
	match command {
		Command::Pin(_) => "/pin",
		Command::Unpin => "/unpin",
		Command::Kick { .. } => "/kick",
		Command::Ban { .. } => "/ban",
		Command::Status(_) => "/status",
	}
}

async fn pin(coordinator: &Coordinator, room: &RoomName, id: MessageId) -> Result<(), EventError> {
	if room.is_direct() {
		return Err(EventError::Validation("cannot pin in a direct message".to_string()));
	}

	let message = coordinator
		.store
		.message(id)
		.await?
		.filter(|m| &m.room == room)
		.ok_or_else(|| EventError::NotFound(format!("message {id} not found in {room}")))?;

	coordinator.store.set_pinned(room, Some(id)).await?;
	coordinator
		.broadcast(
			room,
			&ServerEvent::UpdatePinnedMessage {
				room: room.clone(),
				message: Some(message),
			},
			None,
		)
		.await;
	Ok(())
}

async fn unpin(coordinator: &Coordinator, room: &RoomName) -> Result<(), EventError> {
	if room.is_direct() {
		return Err(EventError::Validation("cannot pin in a direct message".to_string()));
	}

	coordinator.store.set_pinned(room, None).await?;
	coordinator
		.broadcast(
			room,
			&ServerEvent::UpdatePinnedMessage {
				room: room.clone(),
				message: None,
			},
			None,
		)
		.await;
	Ok(())
}

async fn kick(coordinator: &Coordinator, actor: &AuthBinding, room: &RoomName, name: &str) -> Result<(), EventError> {
	// Lookup, rank check, notice and removal happen under one lock hold.
	let target = coordinator
		.with_state(|st| {
			let target = st
				.registry
				.find_by_name(name)
				.map(|s| (s.user.clone(), s.role))
				.ok_or_else(|| EventError::NotFound(format!("{name} is not connected")))?;

			if target.1.meets(Role::Admin) {
				return Err(EventError::PermissionDenied(format!("cannot kick {name}: equal or higher role")));
			}

			notice(&st.registry, room, format!("{name} was kicked by {}", actor.name));
			st.force_remove(&target.0, ServerEvent::Kicked { reason: None });
			Ok(target.0)
		})
		.await?;

	info!(actor = %actor.user, target = %target, room = %room, "kicked user");
	coordinator
		.audit(AuditEntry {
			kind: AuditKind::UserKick,
			actor: actor.user.clone(),
			target: Some(target),
			room: room.clone(),
			detail: None,
			at_ms: unix_ms_now(),
		})
		.await;
	Ok(())
}

async fn ban(
	coordinator: &Coordinator,
	actor: &AuthBinding,
	room: &RoomName,
	name: &str,
	reason: Option<String>,
) -> Result<(), EventError> {
	// A disconnected user can still be banned; resolve through the store
	// when no live session matches the name.
	let connected = coordinator
		.with_state(|st| st.registry.find_by_name(name).map(|s| (s.user.clone(), s.role)))
		.await;

	let (target, target_role) = match connected {
		Some(t) => t,
		None => {
			let rec = coordinator
				.store
				.user_by_name(name)
				.await?
				.ok_or_else(|| EventError::NotFound(format!("unknown user: {name}")))?;
			(rec.id, rec.role)
		}
	};

	if target_role.meets(Role::Admin) {
		return Err(EventError::PermissionDenied(format!("cannot ban {name}: equal or higher role")));
	}

	coordinator
		.with_state(|st| {
			st.banned.insert(target.clone(), reason.clone());
			if st.registry.lookup(&target).is_some() {
				notice(&st.registry, room, format!("{name} was banned by {}", actor.name));
				st.force_remove(&target, ServerEvent::Banned { reason: reason.clone() });
			}
		})
		.await;

	let persisted = coordinator.store.set_banned(&target, reason.as_deref()).await;

	info!(actor = %actor.user, target = %target, room = %room, "banned user");
	coordinator
		.audit(AuditEntry {
			kind: AuditKind::UserBan,
			actor: actor.user.clone(),
			target: Some(target),
			room: room.clone(),
			detail: reason,
			at_ms: unix_ms_now(),
		})
		.await;

	// The in-memory ban already holds; a failed flag write is surfaced to
	// the actor but not rolled back.
	persisted.map_err(Into::into)
}

async fn set_status(
	coordinator: &Coordinator,
	actor: &AuthBinding,
	status: PresenceStatus,
) -> Result<(), EventError> {
	coordinator
		.with_state(|st| {
			let session = st.registry.lookup_mut(&actor.user)?;
			session.status = status;
			let room = session.room.clone();
			st.broadcast_presence(&room);
			Some(())
		})
		.await
		.ok_or_else(|| EventError::Validation("no active session".to_string()))?;

	coordinator.store.set_status(&actor.user, status).await?;
	Ok(())
}

/// System notice to a room.
fn notice(registry: &SessionRegistry, room: &RoomName, text: String) {
	hub::broadcast(
		registry,
		room,
		&ServerEvent::Notification {
			room: Some(room.clone()),
			text,
		},
		None,
	);
}
