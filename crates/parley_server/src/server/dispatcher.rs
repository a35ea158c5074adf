#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_domain::{
	AuditEntry, AuditKind, ChannelInfo, Message, MessageId, PresenceStatus, Role, RoomName, UserId,
};
use parley_protocol::{ClientEvent, SUPERSEDED_CODE, ServerEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::commands;
use crate::server::coordinator::Coordinator;
use crate::server::error::EventError;
use crate::server::hub;
use crate::server::registry::Session;
use crate::server::store::StoreError;
use crate::util::time::unix_ms_now;

/// The authenticated identity bound to a connection after a successful login.
#[derive(Debug, Clone)]
pub struct AuthBinding {
	pub user: UserId,
	pub name: String,
	pub role: Role,
}

/// What the transport loop should do after an event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
	Continue,
	Close,
}

/// Per-connection event handler. Owns the connection's identity binding and
/// routes decoded client events into the coordinator.
pub struct SessionDriver {
	coordinator: Arc<Coordinator>,
	conn_id: u64,
	outbox: mpsc::Sender<ServerEvent>,
	auth: Option<AuthBinding>,
}

impl SessionDriver {
	pub fn new(coordinator: Arc<Coordinator>, conn_id: u64, outbox: mpsc::Sender<ServerEvent>) -> Self {
		Self {
			coordinator,
			conn_id,
			outbox,
			auth: None,
		}
	}

	/// Handle one decoded event. Failures map to user-visible error events;
	/// only authentication failures close the connection.
	pub async fn handle(&mut self, event: ClientEvent) -> SessionControl {
		metrics::counter!("parley_server_events_total").increment(1);

		let result = match event {
			ClientEvent::Login { token } => self.login(&token).await,
			other => match self.auth.clone() {
				None => Err(EventError::Auth("login required".to_string())),
				Some(auth) => self.handle_authed(&auth, other).await,
			},
		};

		match result {
			Ok(()) => SessionControl::Continue,
			Err(e) => {
				metrics::counter!("parley_server_events_failed_total", "code" => e.code()).increment(1);
				self.send(e.to_event()).await;
				if e.is_fatal() {
					warn!(conn_id = self.conn_id, error = %e, "closing connection");
					SessionControl::Close
				} else {
					debug!(conn_id = self.conn_id, error = %e, "event rejected");
					SessionControl::Continue
				}
			}
		}
	}

	async fn handle_authed(&self, auth: &AuthBinding, event: ClientEvent) -> Result<(), EventError> {
		match event {
			ClientEvent::Login { .. } => unreachable!("login routed before authed dispatch"),
			ClientEvent::SendMessage {
				content,
				attachment,
				parent,
			} => self.send_message(auth, content, attachment, parent).await,
			ClientEvent::SendDm { to, content } => self.send_dm(auth, to, content).await,
			ClientEvent::CreateChannel { name, private } => self.create_channel(auth, &name, private).await,
			ClientEvent::DeleteChannel { name } => self.delete_channel(auth, &name).await,
			ClientEvent::JoinChannelByCode { code } => self.join_channel_by_code(auth, &code).await,
			ClientEvent::TypingUpdate { typing } => self.typing_update(auth, typing).await,
			ClientEvent::EditMessage { message_id, content } => self.edit_message(auth, message_id, content).await,
			ClientEvent::DeleteMessage { message_id } => self.delete_message(auth, message_id).await,
			ClientEvent::AddReaction { message_id, emoji } => self.react(auth, message_id, &emoji, true).await,
			ClientEvent::RemoveReaction { message_id, emoji } => self.react(auth, message_id, &emoji, false).await,
			ClientEvent::JoinChannel { name } => self.join_channel(auth, &name).await,
			ClientEvent::StartDm { with } => self.start_dm(auth, with).await,
		}
	}

	/// Teardown on transport close. Idempotent: after a forced replacement the
	/// stale connection's teardown leaves the new session alone.
	pub async fn close(&mut self) {
		let Some(auth) = self.auth.take() else { return };
		let conn_id = self.conn_id;

		self.coordinator
			.with_state(|st| {
				let Some(session) = st.registry.remove_if_conn(&auth.user, conn_id) else {
					return;
				};
				metrics::gauge!("parley_server_active_sessions").decrement(1.0);

				if let Some(names) = st.typing.clear(&session.room, &session.name) {
					hub::broadcast(
						&st.registry,
						&session.room,
						&ServerEvent::TypingStatus {
							room: session.room.clone(),
							names,
						},
						None,
					);
				}
				if !session.room.is_direct() {
					hub::broadcast(
						&st.registry,
						&session.room,
						&ServerEvent::Notification {
							room: Some(session.room.clone()),
							text: format!("{} left {}", session.name, session.room),
						},
						None,
					);
				}
				st.broadcast_presence(&session.room);
			})
			.await;

		info!(conn_id, user = %auth.user, "session closed");
	}

	async fn send(&self, event: ServerEvent) {
		let _ = self.outbox.send(event).await;
	}

	async fn login(&mut self, token: &str) -> Result<(), EventError> {
		if self.auth.is_some() {
			return Err(EventError::Validation("already authenticated".to_string()));
		}

		let identity = self
			.coordinator
			.identity
			.resolve(token)
			.await?
			.ok_or_else(|| EventError::Auth("unknown or expired token".to_string()))?;

		// Persisted flag and the in-memory ban set are both authoritative.
		let memory_ban = self
			.coordinator
			.with_state(|st| st.banned.get(&identity.user).cloned())
			.await;
		if identity.banned || memory_ban.is_some() {
			let reason = identity.ban_reason.clone().or_else(|| memory_ban.flatten());
			return Err(EventError::Auth(match reason {
				Some(r) => format!("account is banned: {r}"),
				None => "account is banned".to_string(),
			}));
		}

		let room = match identity.last_room {
			Some(last) if self.coordinator.room_accessible(&identity.user, &last).await => last,
			_ => self.coordinator.settings.default_channel.clone(),
		};

		let channels = self.coordinator.channel_summaries(&identity.user).await;
		let (messages, pinned) = self.room_snapshot(&room).await;

		let auth = AuthBinding {
			user: identity.user.clone(),
			name: identity.name.clone(),
			role: identity.role,
		};
		let session = Session {
			user: auth.user.clone(),
			name: auth.name.clone(),
			role: auth.role,
			room: room.clone(),
			status: PresenceStatus::Online,
			conn_id: self.conn_id,
			outbox: self.outbox.clone(),
		};

		// Preempting a duplicate login and installing the replacement is one
		// critical section; no interleaving can see both sessions live.
		self.coordinator
			.with_state(|st| {
				st.force_remove(
					&auth.user,
					ServerEvent::Error {
						code: SUPERSEDED_CODE.to_string(),
						message: "logged in from another connection".to_string(),
					},
				);
				st.registry.register(session);
				metrics::gauge!("parley_server_active_sessions").increment(1.0);

				let _ = self.outbox.try_send(ServerEvent::LoginSuccess {
					user: auth.user.clone(),
					name: auth.name.clone(),
					role: auth.role,
					room: room.clone(),
				});
				let _ = self.outbox.try_send(ServerEvent::InitialState {
					room: room.clone(),
					channels,
				});
				let _ = self.outbox.try_send(ServerEvent::MessageHistory {
					room: room.clone(),
					messages,
					pinned,
				});

				if !room.is_direct() {
					hub::broadcast(
						&st.registry,
						&room,
						&ServerEvent::Notification {
							room: Some(room.clone()),
							text: format!("{} joined {}", auth.name, room),
						},
						Some(&auth.user),
					);
				}
				st.broadcast_presence(&room);
			})
			.await;

		metrics::counter!("parley_server_logins_total").increment(1);
		info!(conn_id = self.conn_id, user = %auth.user, role = %auth.role, room = %room, "login");
		self.auth = Some(auth);
		Ok(())
	}

	async fn send_message(
		&self,
		auth: &AuthBinding,
		content: String,
		attachment: Option<String>,
		parent: Option<MessageId>,
	) -> Result<(), EventError> {
		let room = self.current_room(auth).await?;

		if commands::is_command(&content) {
			let command = commands::parse(&content)?;
			return commands::execute(&self.coordinator, auth, &room, command).await;
		}

		if content.trim().is_empty() && attachment.is_none() {
			return Err(EventError::Validation("empty message".to_string()));
		}

		if let Some(pid) = parent {
			let parent_msg = self
				.coordinator
				.store
				.message(pid)
				.await?
				.ok_or_else(|| EventError::NotFound(format!("parent message {pid} not found")))?;
			if parent_msg.room != room {
				return Err(EventError::Validation("parent message is in another room".to_string()));
			}
		}

		let message = Message::new(
			MessageId::new_v4(),
			room.clone(),
			auth.user.clone(),
			auth.name.clone(),
			content,
			unix_ms_now(),
			attachment,
			parent,
		);

		// Direct-message traffic is transient; only channel messages persist.
		if !room.is_direct() {
			self.coordinator.store.create_message(&message).await?;
		}

		metrics::counter!("parley_server_messages_total").increment(1);
		self.coordinator
			.with_state(|st| {
				if let Some(names) = st.typing.clear(&room, &auth.name) {
					hub::broadcast(
						&st.registry,
						&room,
						&ServerEvent::TypingStatus {
							room: room.clone(),
							names,
						},
						None,
					);
				}
				hub::broadcast(&st.registry, &room, &ServerEvent::ChannelMessage { message }, None);
			})
			.await;
		Ok(())
	}

	async fn send_dm(&self, auth: &AuthBinding, to: UserId, content: String) -> Result<(), EventError> {
		if to == auth.user {
			return Err(EventError::Validation("cannot message yourself".to_string()));
		}
		if content.trim().is_empty() {
			return Err(EventError::Validation("empty message".to_string()));
		}
		self.coordinator
			.store
			.user(&to)
			.await?
			.ok_or_else(|| EventError::NotFound(format!("unknown user: {to}")))?;

		let room = RoomName::direct(&auth.user, &to);
		let message = Message::new(
			MessageId::new_v4(),
			room,
			auth.user.clone(),
			auth.name.clone(),
			content,
			unix_ms_now(),
			None,
			None,
		);

		metrics::counter!("parley_server_messages_total").increment(1);

		// Direct delivery to both participants, wherever they are bound; the
		// client routes by the message's room.
		let delivered = self
			.coordinator
			.with_state(|st| {
				let online = st.registry.lookup(&to).is_some();
				hub::send_to(&st.registry, &to, ServerEvent::ChannelMessage { message: message.clone() });
				hub::send_to(&st.registry, &auth.user, ServerEvent::ChannelMessage { message });
				online
			})
			.await;

		if !delivered {
			self.send(ServerEvent::Notification {
				room: None,
				text: format!("{to} is offline; message not delivered"),
			})
			.await;
		}
		Ok(())
	}

	async fn create_channel(&self, auth: &AuthBinding, name: &str, private: bool) -> Result<(), EventError> {
		if !auth.role.meets(Role::User) {
			return Err(EventError::PermissionDenied("guests cannot create channels".to_string()));
		}
		let room = RoomName::channel(name).map_err(|e| EventError::Validation(e.to_string()))?;

		let invite_code = private.then(|| uuid::Uuid::new_v4().simple().to_string()[..8].to_string());
		let info = ChannelInfo {
			name: room.clone(),
			owner: auth.user.clone(),
			private,
			invite_code: invite_code.clone(),
			pinned: None,
		};
		self.coordinator.store.create_channel(info).await?;

		info!(user = %auth.user, channel = %room, private, "channel created");
		self.coordinator
			.audit(AuditEntry {
				kind: AuditKind::ChannelCreate,
				actor: auth.user.clone(),
				target: None,
				room: room.clone(),
				detail: private.then(|| "private".to_string()),
				at_ms: unix_ms_now(),
			})
			.await;

		self.fanout_channel_lists().await;
		if let Some(code) = invite_code {
			self.send(ServerEvent::Notification {
				room: Some(room.clone()),
				text: format!("invite code for {room}: {code}"),
			})
			.await;
		}
		self.change_room(auth, room).await
	}

	async fn delete_channel(&self, auth: &AuthBinding, name: &str) -> Result<(), EventError> {
		let room = RoomName::channel(name).map_err(|e| EventError::Validation(e.to_string()))?;
		if room == self.coordinator.settings.default_channel {
			return Err(EventError::Validation("the default channel cannot be deleted".to_string()));
		}

		let info = self
			.coordinator
			.store
			.channel(&room)
			.await?
			.ok_or_else(|| EventError::NotFound(format!("unknown channel: {room}")))?;
		if !auth.role.meets(Role::Admin) && info.owner != auth.user {
			return Err(EventError::PermissionDenied(
				"only the owner or an admin can delete a channel".to_string(),
			));
		}

		self.coordinator.store.delete_channel(&room).await?;

		// Evacuate everyone bound to the doomed room into the default channel.
		let fallback = self.coordinator.settings.default_channel.clone();
		let (messages, pinned) = self.room_snapshot(&fallback).await;
		let occupants: Vec<UserId> = self
			.coordinator
			.with_state(|st| st.registry.in_room(&room).map(|s| s.user.clone()).collect())
			.await;

		for user in occupants {
			let channels = self.coordinator.channel_summaries(&user).await;
			self.coordinator
				.with_state(|st| {
					let Some(session) = st.registry.lookup_mut(&user) else { return };
					if session.room != room {
						return;
					}
					session.room = fallback.clone();
					let _ = session.outbox.try_send(ServerEvent::Notification {
						room: None,
						text: format!("{room} was deleted"),
					});
					let _ = session.outbox.try_send(ServerEvent::ChannelChange {
						room: fallback.clone(),
						messages: messages.clone(),
						pinned: pinned.clone(),
						channels,
					});
				})
				.await;
		}
		self.coordinator.presence_update(&fallback).await;

		info!(user = %auth.user, channel = %room, "channel deleted");
		self.coordinator
			.audit(AuditEntry {
				kind: AuditKind::ChannelDelete,
				actor: auth.user.clone(),
				target: None,
				room,
				detail: None,
				at_ms: unix_ms_now(),
			})
			.await;

		self.fanout_channel_lists().await;
		Ok(())
	}

	async fn join_channel(&self, auth: &AuthBinding, name: &str) -> Result<(), EventError> {
		let room = RoomName::channel(name).map_err(|e| EventError::Validation(e.to_string()))?;
		if !self.coordinator.room_accessible(&auth.user, &room).await {
			return Err(EventError::PermissionDenied(format!("{room} is private or does not exist")));
		}
		self.change_room(auth, room).await
	}

	async fn join_channel_by_code(&self, auth: &AuthBinding, code: &str) -> Result<(), EventError> {
		let info = self
			.coordinator
			.store
			.channel_by_code(code)
			.await?
			.ok_or_else(|| EventError::NotFound("invalid invite code".to_string()))?;

		self.coordinator.store.add_member(&info.name, &auth.user).await?;
		self.change_room(auth, info.name).await
	}

	async fn start_dm(&self, auth: &AuthBinding, with: UserId) -> Result<(), EventError> {
		if with == auth.user {
			return Err(EventError::Validation("cannot open a conversation with yourself".to_string()));
		}
		self.coordinator
			.store
			.user(&with)
			.await?
			.ok_or_else(|| EventError::NotFound(format!("unknown user: {with}")))?;

		self.change_room(auth, RoomName::direct(&auth.user, &with)).await
	}

	async fn typing_update(&self, auth: &AuthBinding, typing: bool) -> Result<(), EventError> {
		self.coordinator
			.with_state(|st| {
				let session = st.registry.lookup(&auth.user)?;
				let room = session.room.clone();
				let names = st.typing.set(&room, &auth.name, typing);
				hub::broadcast(
					&st.registry,
					&room,
					&ServerEvent::TypingStatus { room: room.clone(), names },
					None,
				);
				Some(())
			})
			.await
			.ok_or_else(|| EventError::Validation("no active session".to_string()))
	}

	async fn edit_message(&self, auth: &AuthBinding, id: MessageId, content: String) -> Result<(), EventError> {
		if content.trim().is_empty() {
			return Err(EventError::Validation("empty message".to_string()));
		}
		let message = self
			.coordinator
			.store
			.message(id)
			.await?
			.ok_or_else(|| EventError::NotFound(format!("message {id} not found")))?;

		let now = unix_ms_now();
		if message.author == auth.user {
			let window_ms = self.coordinator.settings.edit_window.as_millis() as i64;
			if now.saturating_sub(message.created_at_ms) > window_ms && !auth.role.meets(Role::Moderator) {
				return Err(EventError::PermissionDenied("edit window has elapsed".to_string()));
			}
		} else if !auth.role.meets(Role::Moderator) {
			return Err(EventError::PermissionDenied("cannot edit someone else's message".to_string()));
		}

		let updated = self.coordinator.store.update_message(id, &content, now).await?;
		let room = updated.room.clone();
		self.coordinator
			.broadcast(&room, &ServerEvent::MessageEdited { message: updated }, None)
			.await;
		Ok(())
	}

	async fn delete_message(&self, auth: &AuthBinding, id: MessageId) -> Result<(), EventError> {
		let message = self
			.coordinator
			.store
			.message(id)
			.await?
			.ok_or_else(|| EventError::NotFound(format!("message {id} not found")))?;

		if message.author != auth.user && !auth.role.meets(Role::Moderator) {
			return Err(EventError::PermissionDenied("cannot delete someone else's message".to_string()));
		}

		self.coordinator.store.delete_message(id).await?;

		// A deleted message cannot stay pinned.
		let room = message.room.clone();
		match self.coordinator.store.channel(&room).await {
			Ok(Some(info)) if info.pinned == Some(id) => {
				if let Err(e) = self.coordinator.store.set_pinned(&room, None).await {
					warn!(room = %room, error = %e, "failed to clear pin of deleted message");
				} else {
					self.coordinator
						.broadcast(
							&room,
							&ServerEvent::UpdatePinnedMessage {
								room: room.clone(),
								message: None,
							},
							None,
						)
						.await;
				}
			}
			Ok(_) => {}
			Err(e) => warn!(room = %room, error = %e, "pin check failed after message delete"),
		}

		self.coordinator
			.broadcast(
				&room,
				&ServerEvent::MessageDeleted {
					room: room.clone(),
					message_id: id,
				},
				None,
			)
			.await;

		self.coordinator
			.audit(AuditEntry {
				kind: AuditKind::MessageDelete,
				actor: auth.user.clone(),
				target: Some(message.author),
				room,
				detail: None,
				at_ms: unix_ms_now(),
			})
			.await;
		Ok(())
	}

	async fn react(&self, auth: &AuthBinding, id: MessageId, emoji: &str, add: bool) -> Result<(), EventError> {
		if emoji.trim().is_empty() {
			return Err(EventError::Validation("empty reaction".to_string()));
		}

		let result = if add {
			self.coordinator.store.add_reaction(id, &auth.user, emoji).await
		} else {
			self.coordinator.store.remove_reaction(id, &auth.user, emoji).await
		};
		let reactions = match result {
			Ok(r) => r,
			Err(StoreError::NotFound) => {
				return Err(EventError::NotFound(format!("message {id} not found")));
			}
			Err(e) => return Err(e.into()),
		};

		let message = self
			.coordinator
			.store
			.message(id)
			.await?
			.ok_or_else(|| EventError::NotFound(format!("message {id} not found")))?;

		self.coordinator
			.broadcast(
				&message.room,
				&ServerEvent::MessageReacted {
					room: message.room.clone(),
					message_id: id,
					reactions,
				},
				None,
			)
			.await;
		Ok(())
	}

	/// Rebind this session to `room`: typing cleanup and notices in the old
	/// room, full sync of the new one, presence recomputed for both.
	async fn change_room(&self, auth: &AuthBinding, room: RoomName) -> Result<(), EventError> {
		let (messages, pinned) = self.room_snapshot(&room).await;
		let channels = self.coordinator.channel_summaries(&auth.user).await;

		let old_room = self
			.coordinator
			.with_state(|st| {
				let session = st.registry.lookup_mut(&auth.user)?;
				let old_room = std::mem::replace(&mut session.room, room.clone());
				let _ = session.outbox.try_send(ServerEvent::ChannelChange {
					room: room.clone(),
					messages,
					pinned,
					channels,
				});

				if old_room != room {
					if let Some(names) = st.typing.clear(&old_room, &auth.name) {
						hub::broadcast(
							&st.registry,
							&old_room,
							&ServerEvent::TypingStatus {
								room: old_room.clone(),
								names,
							},
							None,
						);
					}
					if !old_room.is_direct() {
						hub::broadcast(
							&st.registry,
							&old_room,
							&ServerEvent::Notification {
								room: Some(old_room.clone()),
								text: format!("{} left {}", auth.name, old_room),
							},
							None,
						);
					}
					if !room.is_direct() {
						hub::broadcast(
							&st.registry,
							&room,
							&ServerEvent::Notification {
								room: Some(room.clone()),
								text: format!("{} joined {}", auth.name, room),
							},
							Some(&auth.user),
						);
					}
					st.broadcast_presence(&old_room);
					st.broadcast_presence(&room);
				}
				Some(old_room)
			})
			.await
			.ok_or_else(|| EventError::Validation("no active session".to_string()))?;

		if old_room != room
			&& let Err(e) = self.coordinator.store.set_last_room(&auth.user, &room).await
		{
			// Room binding already moved; a stale resume target is tolerable.
			warn!(user = %auth.user, room = %room, error = %e, "failed to persist last room");
		}
		Ok(())
	}

	/// History and pinned message for a room. Direct-message rooms have no
	/// durable history; store read failures degrade to an empty view.
	async fn room_snapshot(&self, room: &RoomName) -> (Vec<Message>, Option<Message>) {
		if room.is_direct() {
			return (Vec::new(), None);
		}

		let limit = self.coordinator.settings.history_limit;
		let messages = match self.coordinator.store.history(room, limit).await {
			Ok(m) => m,
			Err(e) => {
				warn!(room = %room, error = %e, "history read failed; serving empty history");
				Vec::new()
			}
		};
		let pinned_id = match self.coordinator.store.channel(room).await {
			Ok(info) => info.and_then(|i| i.pinned),
			Err(e) => {
				warn!(room = %room, error = %e, "channel read failed; no pinned message");
				None
			}
		};
		let pinned = match pinned_id {
			None => None,
			Some(id) => match messages.iter().find(|m| m.id == id) {
				Some(m) => Some(m.clone()),
				None => match self.coordinator.store.message(id).await {
					Ok(m) => m,
					Err(e) => {
						warn!(room = %room, error = %e, "pinned message read failed");
						None
					}
				},
			},
		};
		(messages, pinned)
	}

	/// Push a fresh visible-channel listing to every connected session. One
	/// task per session; the caller does not wait for them.
	async fn fanout_channel_lists(&self) {
		let targets: Vec<UserId> = self
			.coordinator
			.with_state(|st| st.registry.iter().map(|s| s.user.clone()).collect())
			.await;

		for user in targets {
			let coordinator = Arc::clone(&self.coordinator);
			tokio::spawn(async move {
				let channels = coordinator.channel_summaries(&user).await;
				if !coordinator.send_to(&user, ServerEvent::ChannelListUpdate { channels }).await {
					debug!(user = %user, "channel list update not delivered");
				}
			});
		}
	}

	async fn current_room(&self, auth: &AuthBinding) -> Result<RoomName, EventError> {
		self.coordinator
			.with_state(|st| st.registry.lookup(&auth.user).map(|s| s.room.clone()))
			.await
			.ok_or_else(|| EventError::Validation("no active session".to_string()))
	}
}
