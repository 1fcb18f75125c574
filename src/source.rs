use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rusqlite::{params, Connection, OpenFlags, Row};

use crate::app_error::{AppError, AppResult};
use crate::models::{
    LegacyAttachment, LegacyCategory, LegacyMessage, LegacyPrivateMessage, LegacyUser,
};

/// Read-only view of the Phorum tables in a SQLite snapshot of the legacy
/// database.
pub struct PhorumSource {
    conn: Connection,
    prefix: String,
    custom_field_column: Option<String>,
}

impl PhorumSource {
    pub fn open(path: &Path, prefix: &str, custom_field_column: Option<&str>) -> AppResult<Self> {
        if !path.exists() {
            return Err(AppError::Config(format!(
                "source database not found: {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(from_source_db)?;
        Self::with_connection(conn, prefix, custom_field_column)
    }

    pub fn with_connection(
        conn: Connection,
        prefix: &str,
        custom_field_column: Option<&str>,
    ) -> AppResult<Self> {
        validate_identifier(prefix, "table prefix")?;
        if let Some(column) = custom_field_column {
            if column.is_empty() {
                return Err(AppError::Validation("custom field column is empty".to_string()));
            }
            validate_identifier(column, "custom field column")?;
        }

        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            custom_field_column: custom_field_column.map(str::to_string),
        })
    }

    fn table(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn count(&self, sql: &str) -> AppResult<i64> {
        self.conn
            .query_row(sql, [], |row| row.get::<_, i64>(0))
            .map_err(from_source_db)
    }

    pub fn count_users(&self) -> AppResult<i64> {
        self.count(&format!(
            "SELECT COUNT(*) FROM {} WHERE active = 1",
            self.table("users")
        ))
    }

    pub fn fetch_users(&self, limit: i64, offset: i64) -> AppResult<Vec<LegacyUser>> {
        let custom = match &self.custom_field_column {
            Some(column) => format!("CAST({column} AS TEXT)"),
            None => "NULL".to_string(),
        };
        let sql = format!(
            "SELECT user_id, COALESCE(username, ''), COALESCE(TRIM(email), ''),
                    COALESCE(date_added, 0), COALESCE(date_last_active, 0),
                    COALESCE(admin, 0), {custom}
             FROM {}
             WHERE active = 1
             ORDER BY user_id ASC
             LIMIT ?1 OFFSET ?2",
            self.table("users")
        );
        self.collect(&sql, limit, offset, |row| {
            Ok(LegacyUser {
                id: row.get(0)?,
                username: row.get(1)?,
                email: row.get(2)?,
                date_added: row.get(3)?,
                date_last_active: row.get(4)?,
                admin: row.get::<_, i64>(5)? == 1,
                custom_field: row.get(6)?,
            })
        })
    }

    pub fn fetch_categories(&self) -> AppResult<Vec<LegacyCategory>> {
        let sql = format!(
            "SELECT forum_id, COALESCE(name, ''), COALESCE(description, ''), COALESCE(active, 1)
             FROM {}
             ORDER BY forum_id ASC",
            self.table("forums")
        );
        let mut stmt = self.conn.prepare(&sql).map_err(from_source_db)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(LegacyCategory {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    active: row.get::<_, i64>(3)? != 0,
                })
            })
            .map_err(from_source_db)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(from_source_db)?);
        }
        Ok(out)
    }

    pub fn count_messages(&self) -> AppResult<i64> {
        self.count(&format!("SELECT COUNT(*) FROM {}", self.table("messages")))
    }

    pub fn fetch_messages(&self, limit: i64, offset: i64) -> AppResult<Vec<LegacyMessage>> {
        let sql = format!(
            "SELECT message_id, COALESCE(parent_id, 0), COALESCE(forum_id, 0),
                    COALESCE(subject, ''), COALESCE(user_id, 0), COALESCE(body, ''),
                    COALESCE(closed, 0), COALESCE(datestamp, 0)
             FROM {}
             ORDER BY datestamp ASC, message_id ASC
             LIMIT ?1 OFFSET ?2",
            self.table("messages")
        );
        self.collect(&sql, limit, offset, |row| {
            Ok(LegacyMessage {
                id: row.get(0)?,
                parent_id: row.get(1)?,
                category_id: row.get(2)?,
                title: row.get(3)?,
                user_id: row.get(4)?,
                raw: row.get(5)?,
                closed: row.get::<_, i64>(6)? != 0,
                created_at: row.get(7)?,
            })
        })
    }

    pub fn count_private_messages(&self) -> AppResult<i64> {
        self.count(&format!("SELECT COUNT(*) FROM {}", self.table("pm_messages")))
    }

    pub fn fetch_private_messages(
        &self,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<LegacyPrivateMessage>> {
        let sql = format!(
            "SELECT pm_message_id, COALESCE(subject, ''), COALESCE(message, ''),
                    COALESCE(from_user_id, 0), COALESCE(meta, ''), COALESCE(datestamp, 0)
             FROM {}
             ORDER BY datestamp ASC, pm_message_id ASC
             LIMIT ?1 OFFSET ?2",
            self.table("pm_messages")
        );
        self.collect(&sql, limit, offset, |row| {
            Ok(LegacyPrivateMessage {
                id: row.get(0)?,
                title: row.get(1)?,
                message: row.get(2)?,
                user_id: row.get(3)?,
                meta: row.get(4)?,
                created_at: row.get(5)?,
            })
        })
    }

    pub fn count_attachments(&self) -> AppResult<i64> {
        self.count(&format!(
            "SELECT COUNT(*) FROM {} WHERE message_id > 0",
            self.table("files")
        ))
    }

    /// Streams attachments in file id order. Each payload is decoded on its
    /// own so one corrupt row does not stop the others.
    pub fn for_each_attachment(
        &self,
        mut f: impl FnMut(AppResult<LegacyAttachment>) -> AppResult<()>,
    ) -> AppResult<()> {
        let sql = format!(
            "SELECT file_id, message_id, COALESCE(filename, ''), COALESCE(file_data, '')
             FROM {}
             WHERE message_id > 0
             ORDER BY file_id ASC",
            self.table("files")
        );
        let mut stmt = self.conn.prepare(&sql).map_err(from_source_db)?;
        let mut rows = stmt.query([]).map_err(from_source_db)?;
        while let Some(row) = rows.next().map_err(from_source_db)? {
            let file_id: i64 = row.get(0).map_err(from_source_db)?;
            let message_id: i64 = row.get(1).map_err(from_source_db)?;
            let filename: String = row.get(2).map_err(from_source_db)?;
            let encoded: String = row.get(3).map_err(from_source_db)?;

            let attachment = decode_payload(&encoded).map(|data| LegacyAttachment {
                file_id,
                message_id,
                filename,
                data,
            });
            f(attachment)?;
        }
        Ok(())
    }

    fn collect<T>(
        &self,
        sql: &str,
        limit: i64,
        offset: i64,
        map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> AppResult<Vec<T>> {
        let mut stmt = self.conn.prepare(sql).map_err(from_source_db)?;
        let rows = stmt
            .query_map(params![limit, offset], map)
            .map_err(from_source_db)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(from_source_db)?);
        }
        Ok(out)
    }
}

// MySQL's TO_BASE64 wraps output every 76 characters.
fn decode_payload(encoded: &str) -> AppResult<Vec<u8>> {
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(STANDARD.decode(compact)?)
}

fn from_source_db(value: rusqlite::Error) -> AppError {
    AppError::Source(value.to_string())
}

/// Accepts only `[A-Za-z0-9_]` so the value can be spliced into SQL.
pub fn validate_identifier(value: &str, what: &str) -> AppResult<()> {
    if value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "{what} may only contain letters, digits and underscores: {value:?}"
        )))
    }
}

#[cfg(test)]
pub mod fixtures {
    use rusqlite::{params, Connection};

    /// An in-memory Phorum snapshot with the `phorum_` prefix.
    pub fn connection() -> Connection {
        let conn = Connection::open_in_memory().expect("open memory db");
        conn.execute_batch(
            "
            CREATE TABLE phorum_users (
                user_id INTEGER PRIMARY KEY, username TEXT, email TEXT,
                date_added INTEGER, date_last_active INTEGER,
                admin INTEGER, active INTEGER, uid TEXT
            );
            CREATE TABLE phorum_forums (
                forum_id INTEGER PRIMARY KEY, name TEXT, description TEXT, active INTEGER
            );
            CREATE TABLE phorum_messages (
                message_id INTEGER PRIMARY KEY, parent_id INTEGER, forum_id INTEGER,
                subject TEXT, user_id INTEGER, body TEXT, closed INTEGER, datestamp INTEGER
            );
            CREATE TABLE phorum_pm_messages (
                pm_message_id INTEGER PRIMARY KEY, subject TEXT, message TEXT,
                from_user_id INTEGER, meta TEXT, datestamp INTEGER
            );
            CREATE TABLE phorum_files (
                file_id INTEGER PRIMARY KEY, message_id INTEGER, filename TEXT, file_data TEXT
            );
            ",
        )
        .expect("phorum schema");
        conn
    }

    pub fn user(conn: &Connection, id: i64, username: &str, active: bool) {
        conn.execute(
            "INSERT INTO phorum_users VALUES(?1, ?2, ?3, 1262304000, 1293840000, 0, ?4, ?5)",
            params![
                id,
                username,
                format!(" {username}@example.com "),
                active as i64,
                format!("GC{id}")
            ],
        )
        .expect("insert user");
    }

    pub fn forum(conn: &Connection, id: i64, name: &str, active: bool) {
        conn.execute(
            "INSERT INTO phorum_forums VALUES(?1, ?2, 'desc', ?3)",
            params![id, name, active as i64],
        )
        .expect("insert forum");
    }

    #[allow(clippy::too_many_arguments)]
    pub fn message(
        conn: &Connection,
        id: i64,
        parent_id: i64,
        forum_id: i64,
        subject: &str,
        user_id: i64,
        body: &str,
        datestamp: i64,
    ) {
        conn.execute(
            "INSERT INTO phorum_messages VALUES(?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![id, parent_id, forum_id, subject, user_id, body, datestamp],
        )
        .expect("insert message");
    }

    pub fn pm(
        conn: &Connection,
        id: i64,
        subject: &str,
        from_user_id: i64,
        meta: &str,
        datestamp: i64,
    ) {
        conn.execute(
            "INSERT INTO phorum_pm_messages VALUES(?1, ?2, 'pm body', ?3, ?4, ?5)",
            params![id, subject, from_user_id, meta, datestamp],
        )
        .expect("insert pm");
    }

    pub fn file(conn: &Connection, id: i64, message_id: i64, filename: &str, file_data: &str) {
        conn.execute(
            "INSERT INTO phorum_files VALUES(?1, ?2, ?3, ?4)",
            params![id, message_id, filename, file_data],
        )
        .expect("insert file");
    }

    /// Serialized `meta` column naming the given recipients.
    pub fn recipients_meta(ids: &[i64]) -> String {
        let entries: String = ids
            .iter()
            .map(|id| format!("i:{id};a:1:{{s:7:\"user_id\";i:{id};}}"))
            .collect();
        format!("a:1:{{s:10:\"recipients\";a:{}:{{{entries}}}}}", ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures;
    use super::{validate_identifier, PhorumSource};

    #[test]
    fn pages_active_users() {
        let conn = fixtures::connection();
        fixtures::user(&conn, 1, "alice", true);
        fixtures::user(&conn, 2, "ghost", false);
        fixtures::user(&conn, 3, "carol", true);
        let source = PhorumSource::with_connection(conn, "phorum_", Some("uid")).expect("source");

        assert_eq!(source.count_users().expect("count"), 2);
        let first = source.fetch_users(1, 0).expect("page 1");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].username, "alice");
        assert_eq!(first[0].email, "alice@example.com");
        assert_eq!(first[0].custom_field.as_deref(), Some("GC1"));
        let second = source.fetch_users(1, 1).expect("page 2");
        assert_eq!(second[0].username, "carol");
        assert!(source.fetch_users(1, 2).expect("page 3").is_empty());
    }

    #[test]
    fn decodes_wrapped_base64_payloads() {
        let conn = fixtures::connection();
        fixtures::file(&conn, 1, 10, "a.txt", "aGVs\nbG8=");
        fixtures::file(&conn, 2, 10, "b.txt", "%%%");
        fixtures::file(&conn, 3, 0, "orphan.txt", "aGVsbG8=");
        let source = PhorumSource::with_connection(conn, "phorum_", None).expect("source");

        assert_eq!(source.count_attachments().expect("count"), 2);
        let mut seen = Vec::new();
        source
            .for_each_attachment(|item| {
                seen.push(item.map(|a| (a.file_id, a.data)).map_err(|e| e.to_string()));
                Ok(())
            })
            .expect("iterate");
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], Ok((1, b"hello".to_vec())));
        assert!(seen[1].is_err());
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        assert!(validate_identifier("phorum_", "prefix").is_ok());
        assert!(validate_identifier("x; DROP TABLE y", "prefix").is_err());
        let conn = fixtures::connection();
        assert!(PhorumSource::with_connection(conn, "phorum_", Some("uid--")).is_err());
    }
}
