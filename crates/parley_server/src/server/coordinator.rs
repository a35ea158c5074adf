#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parley_domain::{AuditEntry, RoomName, UserId};
use parley_protocol::{ChannelSummary, ServerEvent};
use tokio::sync::Mutex;
use tracing::warn;

use crate::server::hub;
use crate::server::identity::IdentityProvider;
use crate::server::presence::TypingTracker;
use crate::server::registry::{Session, SessionRegistry};
use crate::server::store::ChatStore;

/// Tunables injected into the coordinator at construction.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
	pub default_channel: RoomName,
	/// Window within which an author may edit their own message.
	pub edit_window: Duration,
	pub history_limit: usize,
	pub outbox_capacity: usize,
}

impl Default for CoordinatorSettings {
	fn default() -> Self {
		Self {
			default_channel: RoomName::channel("#general").expect("static channel name"),
			edit_window: Duration::from_secs(24 * 60 * 60),
			history_limit: 100,
			outbox_capacity: 256,
		}
	}
}

/// All mutable coordinator state, owned by a single lock. Mutations never
/// suspend while the lock is held; collaborator calls happen outside it.
#[derive(Default)]
pub struct CoordinatorState {
	pub registry: SessionRegistry,
	pub typing: TypingTracker,
	/// In-memory ban set consulted at login alongside the persisted flag.
	pub banned: HashMap<UserId, Option<String>>,
}

impl CoordinatorState {
	/// Remove a session and notify it with a terminal event, then reconcile
	/// typing and presence for the room it left. Runs entirely under the
	/// coordinator lock so a concurrent login cannot observe a half-removed
	/// session.
	pub fn force_remove(&mut self, user: &UserId, event: ServerEvent) -> Option<Session> {
		let session = self.registry.remove(user)?;
		let _ = session.outbox.try_send(event);
		metrics::gauge!("parley_server_active_sessions").decrement(1.0);

		if let Some(names) = self.typing.clear(&session.room, &session.name) {
			hub::broadcast(
				&self.registry,
				&session.room,
				&ServerEvent::TypingStatus {
					room: session.room.clone(),
					names,
				},
				None,
			);
		}
		self.broadcast_presence(&session.room);
		Some(session)
	}

	/// Broadcast the live presence snapshot for a room.
	pub fn broadcast_presence(&self, room: &RoomName) {
		let users = self.registry.active_users(room);
		hub::broadcast(
			&self.registry,
			room,
			&ServerEvent::UserPresence {
				room: room.clone(),
				users,
			},
			None,
		);
	}
}

/// The room-based messaging coordinator: owns the session registry, typing
/// sets and ban set, and talks to the persistence/identity collaborators.
pub struct Coordinator {
	state: Mutex<CoordinatorState>,
	pub store: Arc<dyn ChatStore>,
	pub identity: Arc<dyn IdentityProvider>,
	pub settings: CoordinatorSettings,
}

impl Coordinator {
	pub fn new(
		store: Arc<dyn ChatStore>,
		identity: Arc<dyn IdentityProvider>,
		settings: CoordinatorSettings,
	) -> Arc<Self> {
		Arc::new(Self {
			state: Mutex::new(CoordinatorState::default()),
			store,
			identity,
			settings,
		})
	}

	/// Run a closure against the locked state. The closure is synchronous by
	/// construction, so no suspension can interleave with the mutation.
	pub async fn with_state<R>(&self, f: impl FnOnce(&mut CoordinatorState) -> R) -> R {
		let mut state = self.state.lock().await;
		f(&mut state)
	}

	/// Make sure the default channel exists so first logins have somewhere
	/// to land.
	pub async fn ensure_default_channel(&self) {
		let info = parley_domain::ChannelInfo {
			name: self.settings.default_channel.clone(),
			owner: UserId::new("system").expect("static id"),
			private: false,
			invite_code: None,
			pinned: None,
		};
		match self.store.create_channel(info).await {
			Ok(()) | Err(crate::server::store::StoreError::Conflict(_)) => {}
			Err(e) => warn!(error = %e, "failed to ensure default channel"),
		}
	}

	/// Channels visible to a user; degrades to the default channel when the
	/// store read fails.
	pub async fn channel_summaries(&self, user: &UserId) -> Vec<ChannelSummary> {
		match self.store.visible_channels(user).await {
			Ok(channels) => channels
				.into_iter()
				.map(|c| ChannelSummary {
					name: c.name,
					private: c.private,
				})
				.collect(),
			Err(e) => {
				warn!(user = %user, error = %e, "channel list read failed; falling back to default channel");
				vec![ChannelSummary {
					name: self.settings.default_channel.clone(),
					private: false,
				}]
			}
		}
	}

	/// Whether a room is accessible to a user. Direct-message rooms are
	/// accessible to their two participants only; channels follow the
	/// visible-channel listing. Store failures degrade to the default
	/// channel being the only accessible room.
	pub async fn room_accessible(&self, user: &UserId, room: &RoomName) -> bool {
		if room.is_direct() {
			return room.direct_peers().is_some_and(|(a, b)| &a == user || &b == user);
		}
		if room == &self.settings.default_channel {
			return true;
		}
		match self.store.visible_channels(user).await {
			Ok(channels) => channels.iter().any(|c| &c.name == room),
			Err(e) => {
				warn!(user = %user, room = %room, error = %e, "access check degraded by store failure");
				false
			}
		}
	}

	/// Best-effort audit write: failures are logged and counted, never
	/// propagated — a lost audit entry must not block or reverse the action
	/// it records.
	pub async fn audit(&self, entry: AuditEntry) {
		metrics::counter!("parley_server_audit_entries_total").increment(1);
		if let Err(e) = self.store.record_audit(&entry).await {
			metrics::counter!("parley_server_audit_failures_total").increment(1);
			warn!(kind = %entry.kind, actor = %entry.actor, error = %e, "failed to record audit entry");
		}
	}

	pub async fn broadcast(&self, room: &RoomName, event: &ServerEvent, exclude: Option<&UserId>) {
		let state = self.state.lock().await;
		hub::broadcast(&state.registry, room, event, exclude);
	}

	pub async fn send_to(&self, user: &UserId, event: ServerEvent) -> bool {
		let state = self.state.lock().await;
		hub::send_to(&state.registry, user, event)
	}

	pub async fn presence_update(&self, room: &RoomName) {
		let state = self.state.lock().await;
		state.broadcast_presence(room);
	}
}
