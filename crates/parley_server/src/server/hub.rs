#![forbid(unsafe_code)]

use parley_domain::{RoomName, UserId};
use parley_protocol::ServerEvent;
use tokio::sync::mpsc;
use tracing::debug;

use crate::server::registry::SessionRegistry;

/// Deliver an event to every session currently bound to `room`, except
/// `exclude` if given.
///
/// Delivery is fire-and-forget: a full or closed outbox is dropped silently.
/// A missed delivery is recovered by the recipient's next full room sync, not
/// by the router.
pub fn broadcast(registry: &SessionRegistry, room: &RoomName, event: &ServerEvent, exclude: Option<&UserId>) {
	let mut dropped: u64 = 0;

	for session in registry.in_room(room) {
		if exclude.is_some_and(|u| u == &session.user) {
			continue;
		}

		match session.outbox.try_send(event.clone()) {
			Ok(()) => {}
			Err(mpsc::error::TrySendError::Full(_)) => dropped += 1,
			Err(mpsc::error::TrySendError::Closed(_)) => {}
		}
	}

	if dropped > 0 {
		metrics::counter!("parley_server_broadcast_dropped_total").increment(dropped);
		debug!(room = %room, dropped, "broadcast dropped due to full outboxes");
	}
}

/// Direct delivery to one identity. Returns whether the event was handed to
/// a live outbox; a missing session or unwritable transport is reported, not
/// retried. The disconnect path reconciles state.
pub fn send_to(registry: &SessionRegistry, user: &UserId, event: ServerEvent) -> bool {
	match registry.lookup(user) {
		Some(session) => session.outbox.try_send(event).is_ok(),
		None => false,
	}
}
