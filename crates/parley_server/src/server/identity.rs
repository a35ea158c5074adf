#![forbid(unsafe_code)]

use async_trait::async_trait;
use parley_domain::{Role, RoomName, UserId};

use crate::server::store::{MemoryStore, StoreError, UserRecord, sql::SqliteStore};

/// A verified identity handed to the coordinator by the authentication
/// collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
	pub user: UserId,
	pub name: String,
	pub role: Role,
	pub banned: bool,
	pub ban_reason: Option<String>,
	pub last_room: Option<RoomName>,
}

impl From<UserRecord> for IdentityRecord {
	fn from(rec: UserRecord) -> Self {
		Self {
			user: rec.id,
			name: rec.name,
			role: rec.role,
			banned: rec.banned,
			ban_reason: rec.ban_reason,
			last_room: rec.last_room,
		}
	}
}

/// Identity/authentication collaborator: resolves a claimed token into a
/// verified identity, or `None` for an unknown identity.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
	async fn resolve(&self, token: &str) -> Result<Option<IdentityRecord>, StoreError>;
}

#[async_trait]
impl IdentityProvider for MemoryStore {
	async fn resolve(&self, token: &str) -> Result<Option<IdentityRecord>, StoreError> {
		Ok(self.resolve_token(token).map(IdentityRecord::from))
	}
}

#[async_trait]
impl IdentityProvider for SqliteStore {
	async fn resolve(&self, token: &str) -> Result<Option<IdentityRecord>, StoreError> {
		Ok(self.resolve_token(token).await?.map(IdentityRecord::from))
	}
}
