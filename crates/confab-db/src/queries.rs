use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};

use confab_types::models::RECALLED_PLACEHOLDER;

use crate::Database;
use crate::models::{FriendRow, FriendshipRow, MessageRow, SessionRow, UserRow};

/// Result of the friend-request insert. The existence check and the insert
/// run inside one `with_conn` closure, so concurrent requests for the same
/// unordered pair cannot both create a row; the partial unique index on the
/// pair backs this up at the storage level.
pub enum RequestOutcome {
    Created(FriendshipRow),
    AlreadyFriends,
    AlreadyPending,
}

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: &str,
        username: &str,
        email: &str,
        password_hash: &str,
        now: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, email, password, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, username, email, password_hash, now],
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn user_exists(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row("SELECT 1 FROM users WHERE id = ?1", [id], |row| row.get(0))
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Stamp last_login_at / last_active_at on successful login.
    pub fn touch_login(&self, id: &str, now: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET last_login_at = ?2, last_active_at = ?2, updated_at = ?2
                 WHERE id = ?1",
                params![id, now],
            )?;
            Ok(())
        })
    }

    /// Prefix search on username or email, excluding the searching user.
    /// Returns the page plus the total match count.
    pub fn search_users(
        &self,
        query: &str,
        exclude_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<UserRow>, u32)> {
        let pattern = format!("{query}%");
        self.with_conn(|conn| {
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM users
                 WHERE id != ?1 AND (username LIKE ?2 OR email LIKE ?2)",
                params![exclude_id, pattern],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(
                "SELECT id, username, email, password, avatar,
                        created_at, updated_at, last_login_at, last_active_at
                 FROM users
                 WHERE id != ?1 AND (username LIKE ?2 OR email LIKE ?2)
                 ORDER BY username
                 LIMIT ?3 OFFSET ?4",
            )?;
            let rows = stmt
                .query_map(params![exclude_id, pattern, limit, offset], map_user_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok((rows, total as u32))
        })
    }

    // -- Friendships --

    /// Insert a pending friend request unless a live row already exists for
    /// the unordered pair, in either direction.
    pub fn create_friend_request(
        &self,
        id: &str,
        user_id: &str,
        friend_id: &str,
        remark: Option<&str>,
        group_name: Option<&str>,
        now: &str,
    ) -> Result<RequestOutcome> {
        self.with_conn(|conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT status FROM friendships
                     WHERE ((user_id = ?1 AND friend_id = ?2)
                         OR (user_id = ?2 AND friend_id = ?1))
                       AND status IN ('pending', 'accepted')",
                    params![user_id, friend_id],
                    |row| row.get(0),
                )
                .optional()?;

            match existing.as_deref() {
                Some("accepted") => return Ok(RequestOutcome::AlreadyFriends),
                Some(_) => return Ok(RequestOutcome::AlreadyPending),
                None => {}
            }

            let inserted = conn.execute(
                "INSERT INTO friendships
                     (id, user_id, friend_id, status, remark, group_name, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?6)",
                params![id, user_id, friend_id, remark, group_name, now],
            );
            if let Err(rusqlite::Error::SqliteFailure(e, _)) = &inserted {
                // Lost the pair index race; someone else's row landed first.
                if e.code == rusqlite::ErrorCode::ConstraintViolation {
                    return Ok(RequestOutcome::AlreadyPending);
                }
            }
            inserted?;

            let row = query_friendship(conn, id)?
                .ok_or_else(|| anyhow::anyhow!("friendship vanished after insert"))?;
            Ok(RequestOutcome::Created(row))
        })
    }

    pub fn get_friendship(&self, id: &str) -> Result<Option<FriendshipRow>> {
        self.with_conn(|conn| query_friendship(conn, id))
    }

    /// Accept or reject a pending request. The status predicate makes the
    /// transition a compare-and-swap: of two concurrent responders exactly
    /// one sees a changed row.
    pub fn respond_to_request(
        &self,
        id: &str,
        responder_id: &str,
        new_status: &str,
        now: &str,
    ) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE friendships SET status = ?3, updated_at = ?4
                 WHERE id = ?1 AND friend_id = ?2 AND status = 'pending'",
                params![id, responder_id, new_status, now],
            )?;
            Ok(changed)
        })
    }

    /// Partial metadata update on an accepted friendship involving the
    /// caller. Absent fields keep their stored value.
    #[allow(clippy::too_many_arguments)]
    pub fn update_friendship_metadata(
        &self,
        id: &str,
        user_id: &str,
        remark: Option<&str>,
        group_name: Option<&str>,
        is_pinned: Option<bool>,
        is_muted: Option<bool>,
        now: &str,
    ) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE friendships SET
                     remark     = COALESCE(?3, remark),
                     group_name = COALESCE(?4, group_name),
                     is_pinned  = COALESCE(?5, is_pinned),
                     is_muted   = COALESCE(?6, is_muted),
                     updated_at = ?7
                 WHERE id = ?1 AND status = 'accepted'
                   AND (user_id = ?2 OR friend_id = ?2)",
                params![id, user_id, remark, group_name, is_pinned, is_muted, now],
            )?;
            Ok(changed)
        })
    }

    /// Hard delete, accepted rows only, either party may remove.
    pub fn delete_friendship(&self, id: &str, user_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM friendships
                 WHERE id = ?1 AND status = 'accepted'
                   AND (user_id = ?2 OR friend_id = ?2)",
                params![id, user_id],
            )?;
            Ok(changed)
        })
    }

    pub fn list_friends(&self, user_id: &str) -> Result<Vec<FriendRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT f.id, f.user_id, f.friend_id, f.status, f.remark, f.group_name,
                        f.is_pinned, f.is_muted, f.created_at, f.updated_at,
                        u.id, u.username, u.avatar
                 FROM friendships f
                 JOIN users u ON u.id = CASE WHEN f.user_id = ?1 THEN f.friend_id ELSE f.user_id END
                 WHERE (f.user_id = ?1 OR f.friend_id = ?1) AND f.status = 'accepted'
                 ORDER BY f.is_pinned DESC, u.username",
            )?;
            let rows = stmt
                .query_map([user_id], map_friend_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Requests still waiting on this user to respond, newest first.
    pub fn list_pending_requests(&self, user_id: &str) -> Result<Vec<FriendRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT f.id, f.user_id, f.friend_id, f.status, f.remark, f.group_name,
                        f.is_pinned, f.is_muted, f.created_at, f.updated_at,
                        u.id, u.username, u.avatar
                 FROM friendships f
                 JOIN users u ON u.id = f.user_id
                 WHERE f.friend_id = ?1 AND f.status = 'pending'
                 ORDER BY f.created_at DESC",
            )?;
            let rows = stmt
                .query_map([user_id], map_friend_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        id: &str,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
        metadata: Option<&str>,
        now: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages
                     (id, sender_id, receiver_id, content, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![id, sender_id, receiver_id, content, metadata, now],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// Receiver-only read receipt. Already-read rows are untouched, so the
    /// read timestamp is stable from the first call onward.
    pub fn mark_read(&self, id: &str, reader_id: &str, now: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET is_read = 1, read_at = ?3, updated_at = ?3
                 WHERE id = ?1 AND receiver_id = ?2 AND is_read = 0",
                params![id, reader_id, now],
            )?;
            Ok(changed)
        })
    }

    /// Sender-only edit within the window. `cutoff` is now minus the edit
    /// window; stored RFC 3339 timestamps compare chronologically.
    pub fn edit_message(
        &self,
        id: &str,
        editor_id: &str,
        content: &str,
        now: &str,
        cutoff: &str,
    ) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET content = ?3, updated_at = ?4
                 WHERE id = ?1 AND sender_id = ?2 AND is_recalled = 0 AND created_at > ?5",
                params![id, editor_id, content, now, cutoff],
            )?;
            Ok(changed)
        })
    }

    /// Sender-only recall within the window. The predicate on is_recalled
    /// makes this a compare-and-swap: a concurrent second recall (or an edit
    /// racing the recall) sees zero changed rows.
    pub fn recall_message(
        &self,
        id: &str,
        requester_id: &str,
        now: &str,
        cutoff: &str,
    ) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET is_recalled = 1, content = ?3, updated_at = ?4
                 WHERE id = ?1 AND sender_id = ?2 AND is_recalled = 0 AND created_at > ?5",
                params![id, requester_id, RECALLED_PLACEHOLDER, now, cutoff],
            )?;
            Ok(changed)
        })
    }

    /// Conversation between two users, oldest first, offset-paginated.
    pub fn history(&self, a: &str, b: &str, limit: u32, offset: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, receiver_id, content, metadata,
                        is_read, read_at, is_recalled, created_at, updated_at
                 FROM messages
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)
                 ORDER BY created_at ASC
                 LIMIT ?3 OFFSET ?4",
            )?;
            let rows = stmt
                .query_map(params![a, b, limit, offset], map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// All messages touching this user, newest first, each joined with the
    /// counterpart's summary. The chat-session projection folds these.
    pub fn messages_with_peers(&self, user_id: &str) -> Result<Vec<SessionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.sender_id, m.receiver_id, m.content, m.metadata,
                        m.is_read, m.read_at, m.is_recalled, m.created_at, m.updated_at,
                        u.id, u.username, u.avatar
                 FROM messages m
                 JOIN users u ON u.id = CASE WHEN m.sender_id = ?1 THEN m.receiver_id ELSE m.sender_id END
                 WHERE m.sender_id = ?1 OR m.receiver_id = ?1
                 ORDER BY m.created_at DESC",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(SessionRow {
                        message: map_message_row(row)?,
                        peer_id: row.get(10)?,
                        peer_username: row.get(11)?,
                        peer_avatar: row.get(12)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn unread_count(&self, user_id: &str) -> Result<u32> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE receiver_id = ?1 AND is_read = 0",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(count as u32)
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!(
        "SELECT id, username, email, password, avatar,
                created_at, updated_at, last_login_at, last_active_at
         FROM users WHERE {column} = ?1"
    );
    let row = conn.query_row(&sql, [value], map_user_row).optional()?;
    Ok(row)
}

fn query_friendship(conn: &Connection, id: &str) -> Result<Option<FriendshipRow>> {
    let row = conn
        .query_row(
            "SELECT id, user_id, friend_id, status, remark, group_name,
                    is_pinned, is_muted, created_at, updated_at
             FROM friendships WHERE id = ?1",
            [id],
            map_friendship_row,
        )
        .optional()?;
    Ok(row)
}

fn query_message(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    let row = conn
        .query_row(
            "SELECT id, sender_id, receiver_id, content, metadata,
                    is_read, read_at, is_recalled, created_at, updated_at
             FROM messages WHERE id = ?1",
            [id],
            map_message_row,
        )
        .optional()?;
    Ok(row)
}

fn map_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password: row.get(3)?,
        avatar: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        last_login_at: row.get(7)?,
        last_active_at: row.get(8)?,
    })
}

fn map_friendship_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FriendshipRow> {
    Ok(FriendshipRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        friend_id: row.get(2)?,
        status: row.get(3)?,
        remark: row.get(4)?,
        group_name: row.get(5)?,
        is_pinned: row.get(6)?,
        is_muted: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn map_friend_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FriendRow> {
    Ok(FriendRow {
        friendship: map_friendship_row(row)?,
        peer_id: row.get(10)?,
        peer_username: row.get(11)?,
        peer_avatar: row.get(12)?,
    })
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        content: row.get(3)?,
        metadata: row.get(4)?,
        is_read: row.get(5)?,
        read_at: row.get(6)?,
        is_recalled: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::encode_ts;
    use chrono::Utc;
    use uuid::Uuid;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn add_user(db: &Database, name: &str) -> String {
        let id = Uuid::new_v4().to_string();
        db.create_user(&id, name, &format!("{name}@example.com"), "hash", &now())
            .unwrap();
        id
    }

    fn now() -> String {
        encode_ts(Utc::now())
    }

    #[test]
    fn pair_index_blocks_reverse_duplicate() {
        let db = db();
        let a = add_user(&db, "alice");
        let b = add_user(&db, "bob");

        let first = db
            .create_friend_request(&Uuid::new_v4().to_string(), &a, &b, None, None, &now())
            .unwrap();
        assert!(matches!(first, RequestOutcome::Created(_)));

        // Same unordered pair from the other direction
        let second = db
            .create_friend_request(&Uuid::new_v4().to_string(), &b, &a, None, None, &now())
            .unwrap();
        assert!(matches!(second, RequestOutcome::AlreadyPending));
    }

    #[test]
    fn respond_is_single_shot() {
        let db = db();
        let a = add_user(&db, "alice");
        let b = add_user(&db, "bob");
        let fid = Uuid::new_v4().to_string();
        db.create_friend_request(&fid, &a, &b, None, None, &now())
            .unwrap();

        assert_eq!(db.respond_to_request(&fid, &b, "accepted", &now()).unwrap(), 1);
        assert_eq!(db.respond_to_request(&fid, &b, "accepted", &now()).unwrap(), 0);
        assert_eq!(db.respond_to_request(&fid, &b, "rejected", &now()).unwrap(), 0);

        let row = db.get_friendship(&fid).unwrap().unwrap();
        assert_eq!(row.status, "accepted");
    }

    #[test]
    fn only_invitee_may_respond() {
        let db = db();
        let a = add_user(&db, "alice");
        let b = add_user(&db, "bob");
        let fid = Uuid::new_v4().to_string();
        db.create_friend_request(&fid, &a, &b, None, None, &now())
            .unwrap();

        // The requester trying to accept their own request changes nothing
        assert_eq!(db.respond_to_request(&fid, &a, "accepted", &now()).unwrap(), 0);
    }

    #[test]
    fn recall_cas_blocks_second_recall_and_edit() {
        let db = db();
        let a = add_user(&db, "alice");
        let b = add_user(&db, "bob");
        let mid = Uuid::new_v4().to_string();
        let created = now();
        db.insert_message(&mid, &a, &b, "hi", None, &created).unwrap();

        let cutoff = encode_ts(Utc::now() - chrono::Duration::minutes(5));
        assert_eq!(db.recall_message(&mid, &a, &now(), &cutoff).unwrap(), 1);
        assert_eq!(db.recall_message(&mid, &a, &now(), &cutoff).unwrap(), 0);
        assert_eq!(db.edit_message(&mid, &a, "edited", &now(), &cutoff).unwrap(), 0);

        let row = db.get_message(&mid).unwrap().unwrap();
        assert_eq!(row.content, RECALLED_PLACEHOLDER);
        assert!(row.is_recalled);
    }

    #[test]
    fn edit_outside_window_changes_nothing() {
        let db = db();
        let a = add_user(&db, "alice");
        let b = add_user(&db, "bob");
        let mid = Uuid::new_v4().to_string();
        // Sent ten minutes ago
        let created = encode_ts(Utc::now() - chrono::Duration::minutes(10));
        db.insert_message(&mid, &a, &b, "hi", None, &created).unwrap();

        let cutoff = encode_ts(Utc::now() - chrono::Duration::minutes(5));
        assert_eq!(db.edit_message(&mid, &a, "late", &now(), &cutoff).unwrap(), 0);
    }

    #[test]
    fn history_is_ordered_and_paginated() {
        let db = db();
        let a = add_user(&db, "alice");
        let b = add_user(&db, "bob");

        let base = Utc::now();
        for i in 0..5 {
            let created = encode_ts(base + chrono::Duration::seconds(i));
            let (s, r) = if i % 2 == 0 { (&a, &b) } else { (&b, &a) };
            db.insert_message(
                &Uuid::new_v4().to_string(),
                s,
                r,
                &format!("msg {i}"),
                None,
                &created,
            )
            .unwrap();
        }

        let page1 = db.history(&a, &b, 3, 0).unwrap();
        assert_eq!(page1.len(), 3);
        assert_eq!(page1[0].content, "msg 0");
        let page2 = db.history(&a, &b, 3, 3).unwrap();
        assert_eq!(page2.len(), 2);
        assert_eq!(page2[1].content, "msg 4");
    }
}
