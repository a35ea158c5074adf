#![forbid(unsafe_code)]

use std::str::FromStr;

use async_trait::async_trait;
use parley_domain::{
	AuditEntry, ChannelInfo, Message, MessageId, PresenceStatus, ReactionMap, Role, RoomName, UserId,
};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::server::store::{ChatStore, StoreError, UserRecord};

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS users (\
	id TEXT PRIMARY KEY,\
	token TEXT UNIQUE,\
	name TEXT NOT NULL,\
	role TEXT NOT NULL,\
	banned INTEGER NOT NULL DEFAULT 0,\
	ban_reason TEXT,\
	last_room TEXT,\
	status TEXT NOT NULL DEFAULT 'online'\
);\
CREATE TABLE IF NOT EXISTS channels (\
	name TEXT PRIMARY KEY,\
	owner TEXT NOT NULL,\
	private INTEGER NOT NULL DEFAULT 0,\
	invite_code TEXT,\
	pinned TEXT\
);\
CREATE TABLE IF NOT EXISTS channel_members (\
	channel TEXT NOT NULL,\
	user_id TEXT NOT NULL,\
	PRIMARY KEY (channel, user_id)\
);\
CREATE TABLE IF NOT EXISTS messages (\
	id TEXT PRIMARY KEY,\
	room TEXT NOT NULL,\
	author TEXT NOT NULL,\
	author_name TEXT NOT NULL,\
	content TEXT NOT NULL,\
	created_at_ms INTEGER NOT NULL,\
	edited_at_ms INTEGER,\
	attachment TEXT,\
	parent TEXT,\
	thread_root INTEGER NOT NULL\
);\
CREATE TABLE IF NOT EXISTS reactions (\
	message_id TEXT NOT NULL,\
	user_id TEXT NOT NULL,\
	emoji TEXT NOT NULL,\
	PRIMARY KEY (message_id, user_id, emoji)\
);\
CREATE TABLE IF NOT EXISTS audit_log (\
	kind TEXT NOT NULL,\
	actor TEXT NOT NULL,\
	target TEXT,\
	room TEXT NOT NULL,\
	detail TEXT,\
	at_ms INTEGER NOT NULL\
);";

/// SQLite-backed persistence binding.
pub struct SqliteStore {
	pool: sqlx::SqlitePool,
}

impl SqliteStore {
	/// Connect and bootstrap the schema.
	pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
		let pool = sqlx::SqlitePool::connect(database_url).await.map_err(backend)?;
		sqlx::raw_sql(SCHEMA).execute(&pool).await.map_err(backend)?;
		Ok(Self { pool })
	}

	pub(crate) async fn resolve_token(&self, token: &str) -> Result<Option<UserRecord>, StoreError> {
		let row = sqlx::query("SELECT id, name, role, banned, ban_reason, last_room, status FROM users WHERE token = ?")
			.bind(token)
			.fetch_optional(&self.pool)
			.await
			.map_err(backend)?;
		row.map(|r| row_to_user(&r)).transpose()
	}

	async fn reactions_for(&self, id: MessageId) -> Result<ReactionMap, StoreError> {
		let rows = sqlx::query("SELECT user_id, emoji FROM reactions WHERE message_id = ?")
			.bind(id.to_string())
			.fetch_all(&self.pool)
			.await
			.map_err(backend)?;

		let mut map = ReactionMap::new();
		for row in rows {
			let emoji: String = row.get("emoji");
			let user = UserId::new(row.get::<String, _>("user_id")).map_err(|e| StoreError::Backend(e.to_string()))?;
			map.entry(emoji).or_default().insert(user);
		}
		Ok(map)
	}
}

fn backend(e: sqlx::Error) -> StoreError {
	StoreError::Backend(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
	e.as_database_error().is_some_and(|d| d.is_unique_violation())
}

fn row_to_user(row: &SqliteRow) -> Result<UserRecord, StoreError> {
	let id = UserId::new(row.get::<String, _>("id")).map_err(|e| StoreError::Backend(e.to_string()))?;
	let role = Role::from_str(&row.get::<String, _>("role")).map_err(|e| StoreError::Backend(e.to_string()))?;
	let status =
		PresenceStatus::from_str(&row.get::<String, _>("status")).map_err(|e| StoreError::Backend(e.to_string()))?;
	let last_room = row
		.get::<Option<String>, _>("last_room")
		.map(RoomName::from_wire)
		.transpose()
		.map_err(|e| StoreError::Backend(e.to_string()))?;

	Ok(UserRecord {
		id,
		name: row.get("name"),
		role,
		banned: row.get::<i64, _>("banned") != 0,
		ban_reason: row.get("ban_reason"),
		last_room,
		status,
	})
}

fn row_to_channel(row: &SqliteRow) -> Result<ChannelInfo, StoreError> {
	let name = RoomName::from_wire(row.get::<String, _>("name")).map_err(|e| StoreError::Backend(e.to_string()))?;
	let owner = UserId::new(row.get::<String, _>("owner")).map_err(|e| StoreError::Backend(e.to_string()))?;
	let pinned = row
		.get::<Option<String>, _>("pinned")
		.map(|s| MessageId::from_str(&s))
		.transpose()
		.map_err(|e| StoreError::Backend(e.to_string()))?;

	Ok(ChannelInfo {
		name,
		owner,
		private: row.get::<i64, _>("private") != 0,
		invite_code: row.get("invite_code"),
		pinned,
	})
}

fn row_to_message(row: &SqliteRow) -> Result<Message, StoreError> {
	let id = MessageId::from_str(&row.get::<String, _>("id")).map_err(|e| StoreError::Backend(e.to_string()))?;
	let room = RoomName::from_wire(row.get::<String, _>("room")).map_err(|e| StoreError::Backend(e.to_string()))?;
	let author = UserId::new(row.get::<String, _>("author")).map_err(|e| StoreError::Backend(e.to_string()))?;
	let parent = row
		.get::<Option<String>, _>("parent")
		.map(|s| MessageId::from_str(&s))
		.transpose()
		.map_err(|e| StoreError::Backend(e.to_string()))?;

	Ok(Message {
		id,
		room,
		author,
		author_name: row.get("author_name"),
		content: row.get("content"),
		created_at_ms: row.get("created_at_ms"),
		edited_at_ms: row.get("edited_at_ms"),
		attachment: row.get("attachment"),
		reactions: ReactionMap::new(),
		parent,
		thread_root: row.get::<i64, _>("thread_root") != 0,
	})
}

#[async_trait]
impl ChatStore for SqliteStore {
	async fn create_channel(&self, info: ChannelInfo) -> Result<(), StoreError> {
		let res = sqlx::query("INSERT INTO channels (name, owner, private, invite_code, pinned) VALUES (?, ?, ?, ?, NULL)")
			.bind(info.name.as_str())
			.bind(info.owner.as_str())
			.bind(info.private as i64)
			.bind(info.invite_code.as_deref())
			.execute(&self.pool)
			.await;

		match res {
			Ok(_) => {
				sqlx::query("INSERT OR IGNORE INTO channel_members (channel, user_id) VALUES (?, ?)")
					.bind(info.name.as_str())
					.bind(info.owner.as_str())
					.execute(&self.pool)
					.await
					.map_err(backend)?;
				Ok(())
			}
			Err(e) if is_unique_violation(&e) => {
				Err(StoreError::Conflict(format!("channel {} already exists", info.name)))
			}
			Err(e) => Err(backend(e)),
		}
	}

	async fn delete_channel(&self, name: &RoomName) -> Result<(), StoreError> {
		let res = sqlx::query("DELETE FROM channels WHERE name = ?")
			.bind(name.as_str())
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		if res.rows_affected() == 0 {
			return Err(StoreError::NotFound);
		}

		sqlx::query("DELETE FROM channel_members WHERE channel = ?")
			.bind(name.as_str())
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		sqlx::query("DELETE FROM messages WHERE room = ?")
			.bind(name.as_str())
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		Ok(())
	}

	async fn channel(&self, name: &RoomName) -> Result<Option<ChannelInfo>, StoreError> {
		let row = sqlx::query("SELECT name, owner, private, invite_code, pinned FROM channels WHERE name = ?")
			.bind(name.as_str())
			.fetch_optional(&self.pool)
			.await
			.map_err(backend)?;
		row.map(|r| row_to_channel(&r)).transpose()
	}

	async fn channel_by_code(&self, code: &str) -> Result<Option<ChannelInfo>, StoreError> {
		let row = sqlx::query("SELECT name, owner, private, invite_code, pinned FROM channels WHERE invite_code = ?")
			.bind(code)
			.fetch_optional(&self.pool)
			.await
			.map_err(backend)?;
		row.map(|r| row_to_channel(&r)).transpose()
	}

	async fn visible_channels(&self, user: &UserId) -> Result<Vec<ChannelInfo>, StoreError> {
		let rows = sqlx::query(
			"SELECT c.name, c.owner, c.private, c.invite_code, c.pinned FROM channels c \
			WHERE c.private = 0 OR c.owner = ? \
			OR EXISTS (SELECT 1 FROM channel_members m WHERE m.channel = c.name AND m.user_id = ?) \
			ORDER BY c.name",
		)
		.bind(user.as_str())
		.bind(user.as_str())
		.fetch_all(&self.pool)
		.await
		.map_err(backend)?;

		rows.iter().map(row_to_channel).collect()
	}

	async fn add_member(&self, channel: &RoomName, user: &UserId) -> Result<(), StoreError> {
		sqlx::query("INSERT OR IGNORE INTO channel_members (channel, user_id) VALUES (?, ?)")
			.bind(channel.as_str())
			.bind(user.as_str())
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		Ok(())
	}

	async fn set_pinned(&self, channel: &RoomName, pinned: Option<MessageId>) -> Result<(), StoreError> {
		let res = sqlx::query("UPDATE channels SET pinned = ? WHERE name = ?")
			.bind(pinned.map(|p| p.to_string()))
			.bind(channel.as_str())
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		if res.rows_affected() == 0 {
			return Err(StoreError::NotFound);
		}
		Ok(())
	}

	async fn create_message(&self, message: &Message) -> Result<(), StoreError> {
		let res = sqlx::query(
			"INSERT INTO messages \
			(id, room, author, author_name, content, created_at_ms, edited_at_ms, attachment, parent, thread_root) \
			VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
		)
		.bind(message.id.to_string())
		.bind(message.room.as_str())
		.bind(message.author.as_str())
		.bind(&message.author_name)
		.bind(&message.content)
		.bind(message.created_at_ms)
		.bind(message.edited_at_ms)
		.bind(message.attachment.as_deref())
		.bind(message.parent.map(|p| p.to_string()))
		.bind(message.thread_root as i64)
		.execute(&self.pool)
		.await;

		match res {
			Ok(_) => Ok(()),
			Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!("message {} already exists", message.id))),
			Err(e) => Err(backend(e)),
		}
	}

	async fn message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
		let row = sqlx::query(
			"SELECT id, room, author, author_name, content, created_at_ms, edited_at_ms, attachment, parent, thread_root \
			FROM messages WHERE id = ?",
		)
		.bind(id.to_string())
		.fetch_optional(&self.pool)
		.await
		.map_err(backend)?;

		let Some(row) = row else { return Ok(None) };
		let mut msg = row_to_message(&row)?;
		msg.reactions = self.reactions_for(msg.id).await?;
		Ok(Some(msg))
	}

	async fn update_message(&self, id: MessageId, content: &str, edited_at_ms: i64) -> Result<Message, StoreError> {
		let res = sqlx::query("UPDATE messages SET content = ?, edited_at_ms = ? WHERE id = ?")
			.bind(content)
			.bind(edited_at_ms)
			.bind(id.to_string())
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		if res.rows_affected() == 0 {
			return Err(StoreError::NotFound);
		}
		self.message(id).await?.ok_or(StoreError::NotFound)
	}

	async fn delete_message(&self, id: MessageId) -> Result<(), StoreError> {
		let res = sqlx::query("DELETE FROM messages WHERE id = ?")
			.bind(id.to_string())
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		if res.rows_affected() == 0 {
			return Err(StoreError::NotFound);
		}

		// Orphaned replies keep their place; with no parent left they become
		// thread roots of their own.
		sqlx::query("UPDATE messages SET parent = NULL, thread_root = 1 WHERE parent = ?")
			.bind(id.to_string())
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		sqlx::query("DELETE FROM reactions WHERE message_id = ?")
			.bind(id.to_string())
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		Ok(())
	}

	async fn history(&self, room: &RoomName, limit: usize) -> Result<Vec<Message>, StoreError> {
		let rows = sqlx::query(
			"SELECT id, room, author, author_name, content, created_at_ms, edited_at_ms, attachment, parent, thread_root \
			FROM messages WHERE room = ? ORDER BY created_at_ms DESC, id DESC LIMIT ?",
		)
		.bind(room.as_str())
		.bind(limit as i64)
		.fetch_all(&self.pool)
		.await
		.map_err(backend)?;

		let mut out = Vec::with_capacity(rows.len());
		for row in rows.iter().rev() {
			let mut msg = row_to_message(row)?;
			msg.reactions = self.reactions_for(msg.id).await?;
			out.push(msg);
		}
		Ok(out)
	}

	async fn add_reaction(&self, id: MessageId, user: &UserId, emoji: &str) -> Result<ReactionMap, StoreError> {
		let exists = sqlx::query("SELECT 1 FROM messages WHERE id = ?")
			.bind(id.to_string())
			.fetch_optional(&self.pool)
			.await
			.map_err(backend)?;
		if exists.is_none() {
			return Err(StoreError::NotFound);
		}

		sqlx::query("INSERT OR IGNORE INTO reactions (message_id, user_id, emoji) VALUES (?, ?, ?)")
			.bind(id.to_string())
			.bind(user.as_str())
			.bind(emoji)
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		self.reactions_for(id).await
	}

	async fn remove_reaction(&self, id: MessageId, user: &UserId, emoji: &str) -> Result<ReactionMap, StoreError> {
		sqlx::query("DELETE FROM reactions WHERE message_id = ? AND user_id = ? AND emoji = ?")
			.bind(id.to_string())
			.bind(user.as_str())
			.bind(emoji)
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		self.reactions_for(id).await
	}

	async fn user(&self, id: &UserId) -> Result<Option<UserRecord>, StoreError> {
		let row = sqlx::query("SELECT id, name, role, banned, ban_reason, last_room, status FROM users WHERE id = ?")
			.bind(id.as_str())
			.fetch_optional(&self.pool)
			.await
			.map_err(backend)?;
		row.map(|r| row_to_user(&r)).transpose()
	}

	async fn user_by_name(&self, name: &str) -> Result<Option<UserRecord>, StoreError> {
		let row = sqlx::query("SELECT id, name, role, banned, ban_reason, last_room, status FROM users WHERE name = ?")
			.bind(name)
			.fetch_optional(&self.pool)
			.await
			.map_err(backend)?;
		row.map(|r| row_to_user(&r)).transpose()
	}

	async fn set_status(&self, user: &UserId, status: PresenceStatus) -> Result<(), StoreError> {
		let res = sqlx::query("UPDATE users SET status = ? WHERE id = ?")
			.bind(status.as_str())
			.bind(user.as_str())
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		if res.rows_affected() == 0 {
			return Err(StoreError::NotFound);
		}
		Ok(())
	}

	async fn set_last_room(&self, user: &UserId, room: &RoomName) -> Result<(), StoreError> {
		let res = sqlx::query("UPDATE users SET last_room = ? WHERE id = ?")
			.bind(room.as_str())
			.bind(user.as_str())
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		if res.rows_affected() == 0 {
			return Err(StoreError::NotFound);
		}
		Ok(())
	}

	async fn set_banned(&self, user: &UserId, reason: Option<&str>) -> Result<(), StoreError> {
		let res = sqlx::query("UPDATE users SET banned = 1, ban_reason = ? WHERE id = ?")
			.bind(reason)
			.bind(user.as_str())
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		if res.rows_affected() == 0 {
			return Err(StoreError::NotFound);
		}
		Ok(())
	}

	async fn record_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
		sqlx::query("INSERT INTO audit_log (kind, actor, target, room, detail, at_ms) VALUES (?, ?, ?, ?, ?, ?)")
			.bind(entry.kind.as_str())
			.bind(entry.actor.as_str())
			.bind(entry.target.as_ref().map(|t| t.as_str().to_string()))
			.bind(entry.room.as_str())
			.bind(entry.detail.as_deref())
			.bind(entry.at_ms)
			.execute(&self.pool)
			.await
			.map_err(backend)?;
		Ok(())
	}
}
