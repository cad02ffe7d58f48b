use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY,
            username        TEXT NOT NULL UNIQUE,
            email           TEXT NOT NULL,
            password        TEXT NOT NULL,
            avatar          TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL,
            last_login_at   TEXT,
            last_active_at  TEXT
        );

        CREATE TABLE IF NOT EXISTS friendships (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id),
            friend_id   TEXT NOT NULL REFERENCES users(id),
            status      TEXT NOT NULL,
            remark      TEXT,
            group_name  TEXT,
            is_pinned   INTEGER NOT NULL DEFAULT 0,
            is_muted    INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        -- At most one live (pending or accepted) row per unordered pair.
        -- The insert path checks both directions first; this index backs the
        -- invariant at the storage level.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_friendships_live_pair
            ON friendships(min(user_id, friend_id), max(user_id, friend_id))
            WHERE status IN ('pending', 'accepted');

        CREATE INDEX IF NOT EXISTS idx_friendships_invitee
            ON friendships(friend_id, status);

        CREATE TABLE IF NOT EXISTS messages (
            id           TEXT PRIMARY KEY,
            sender_id    TEXT NOT NULL REFERENCES users(id),
            receiver_id  TEXT NOT NULL REFERENCES users(id),
            content      TEXT NOT NULL,
            metadata     TEXT,
            is_read      INTEGER NOT NULL DEFAULT 0,
            read_at      TEXT,
            is_recalled  INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_pair
            ON messages(sender_id, receiver_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_messages_unread
            ON messages(receiver_id, is_read);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
