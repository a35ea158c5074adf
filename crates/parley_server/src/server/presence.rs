#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};

use parley_domain::RoomName;

/// Ephemeral per-room sets of display names currently signaling typing
/// activity. Presence itself carries no state here; it derives live from the
/// session registry.
#[derive(Debug, Default)]
pub struct TypingTracker {
	by_room: HashMap<RoomName, BTreeSet<String>>,
}

impl TypingTracker {
	/// Add or remove a name and return the resulting set for broadcast.
	pub fn set(&mut self, room: &RoomName, name: &str, typing: bool) -> Vec<String> {
		let entry = self.by_room.entry(room.clone()).or_default();
		if typing {
			entry.insert(name.to_string());
		} else {
			entry.remove(name);
		}

		let snapshot: Vec<String> = entry.iter().cloned().collect();
		if entry.is_empty() {
			self.by_room.remove(room);
		}
		snapshot
	}

	/// Remove a name on disconnect or room departure, even when the client
	/// never signaled "stopped". Returns the resulting set only if the name
	/// was actually present, so callers broadcast a delta exactly once.
	pub fn clear(&mut self, room: &RoomName, name: &str) -> Option<Vec<String>> {
		let entry = self.by_room.get_mut(room)?;
		if !entry.remove(name) {
			return None;
		}

		let snapshot: Vec<String> = entry.iter().cloned().collect();
		if entry.is_empty() {
			self.by_room.remove(room);
		}
		Some(snapshot)
	}
}
