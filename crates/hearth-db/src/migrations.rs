use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (users, conversations, messages)");
        conn.execute_batch(
            "
            BEGIN;

            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                email       TEXT NOT NULL UNIQUE,
                full_name   TEXT NOT NULL,
                photos      TEXT NOT NULL DEFAULT '[]',
                password    TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            -- pair_key is the two participant ids, ordered and joined, so the
            -- store itself refuses a second thread for the same pair.
            CREATE TABLE conversations (
                id          TEXT PRIMARY KEY,
                pair_key    TEXT NOT NULL UNIQUE,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE TABLE conversation_participants (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                UNIQUE(conversation_id, user_id)
            );

            CREATE INDEX idx_participants_user
                ON conversation_participants(user_id);

            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                sender_id       TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                content         TEXT NOT NULL
                                CHECK (length(trim(content)) > 0 AND length(content) <= 1000),
                created_at      TEXT NOT NULL,
                read_at         TEXT
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, created_at);

            CREATE TRIGGER participants_at_most_two
            BEFORE INSERT ON conversation_participants
            WHEN (SELECT COUNT(*) FROM conversation_participants
                  WHERE conversation_id = NEW.conversation_id) >= 2
            BEGIN
                SELECT RAISE(ABORT, 'conversation already has two participants');
            END;

            CREATE TRIGGER messages_touch_conversation
            AFTER INSERT ON messages
            BEGIN
                UPDATE conversations SET updated_at = NEW.created_at
                WHERE id = NEW.conversation_id AND updated_at < NEW.created_at;
            END;

            CREATE TRIGGER messages_read_at_write_once
            BEFORE UPDATE OF read_at ON messages
            WHEN OLD.read_at IS NOT NULL
                 AND (NEW.read_at IS NULL OR NEW.read_at <> OLD.read_at)
            BEGIN
                SELECT RAISE(ABORT, 'read_at can only be set once');
            END;

            CREATE TRIGGER messages_append_only
            BEFORE UPDATE OF id, conversation_id, sender_id, content, created_at ON messages
            BEGIN
                SELECT RAISE(ABORT, 'messages are append-only');
            END;

            INSERT INTO schema_version (version) VALUES (1);

            COMMIT;
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
