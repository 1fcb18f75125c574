use std::fs;
use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::app_error::{AppError, AppResult};
use crate::models::{
    ImportedUser, NewCategory, NewPost, NewUser, PermalinkTarget, PostRecord, PostTarget,
    TopicLookup, Upload, UserFieldSpec, ARCHETYPE_PRIVATE_MESSAGE, ARCHETYPE_REGULAR,
};

pub const SETTING_UNICODE_USERNAMES: &str = "unicode_usernames";

const KIND_USER: &str = "user";
const KIND_CATEGORY: &str = "category";
const KIND_POST: &str = "post";

const MAX_USERNAME_CHARS: usize = 60;

/// Destination record store.
pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> AppResult<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS app_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS import_ids (
                kind TEXT NOT NULL,
                import_id TEXT NOT NULL,
                new_id INTEGER NOT NULL,
                PRIMARY KEY (kind, import_id)
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL COLLATE NOCASE UNIQUE,
                name TEXT,
                email TEXT,
                admin INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_seen_at TEXT
            );

            INSERT OR IGNORE INTO users(id, username, name, email, admin, created_at)
            VALUES(-1, 'system', 'system', 'no_email', 1, '1970-01-01T00:00:00+00:00');

            CREATE TABLE IF NOT EXISTS user_custom_fields (
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (user_id, name)
            );

            CREATE TABLE IF NOT EXISTS user_fields (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL,
                field_type TEXT NOT NULL,
                editable INTEGER NOT NULL,
                required INTEGER NOT NULL,
                show_on_profile INTEGER NOT NULL,
                show_on_user_card INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT
            );

            CREATE TABLE IF NOT EXISTS topics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                archetype TEXT NOT NULL,
                category_id INTEGER,
                user_id INTEGER NOT NULL,
                closed INTEGER NOT NULL DEFAULT 0,
                target_usernames TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS posts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic_id INTEGER NOT NULL REFERENCES topics(id),
                user_id INTEGER NOT NULL,
                post_number INTEGER NOT NULL,
                raw TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (topic_id, post_number)
            );

            CREATE TABLE IF NOT EXISTS uploads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                original_filename TEXT NOT NULL,
                filesize INTEGER NOT NULL,
                sha256 TEXT NOT NULL UNIQUE,
                url TEXT NOT NULL,
                data BLOB NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS upload_references (
                upload_id INTEGER NOT NULL,
                post_id INTEGER NOT NULL,
                PRIMARY KEY (upload_id, post_id)
            );

            CREATE TABLE IF NOT EXISTS permalinks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE,
                category_id INTEGER,
                topic_id INTEGER,
                external_url TEXT
            );
            ",
        )?;
        Ok(())
    }

    pub fn save_site_setting(&self, key: &str, value: &str) -> AppResult<()> {
        self.conn.execute(
            "INSERT INTO app_settings(key, value) VALUES(?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn load_site_setting(&self, key: &str) -> AppResult<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM app_settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn site_setting_enabled(&self, key: &str) -> AppResult<bool> {
        let value = self.load_site_setting(key)?;
        Ok(matches!(value.as_deref(), Some("1" | "true" | "yes")))
    }

    pub fn find_or_create_user_field(&self, spec: &UserFieldSpec) -> AppResult<i64> {
        let existing = self
            .conn
            .query_row(
                "SELECT id FROM user_fields WHERE name = ?1",
                params![spec.name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }

        self.conn.execute(
            "INSERT INTO user_fields(name, description, field_type, editable, required,
                                     show_on_profile, show_on_user_card)
             VALUES(?1, ?2, 'text', 0, 0, 1, 1)",
            params![spec.name, spec.description],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn lookup_import_id(&self, kind: &str, import_id: &str) -> AppResult<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "SELECT new_id FROM import_ids WHERE kind = ?1 AND import_id = ?2",
                params![kind, import_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(id)
    }

    fn record_import_id(
        conn: &Connection,
        kind: &str,
        import_id: &str,
        new_id: i64,
    ) -> AppResult<()> {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO import_ids(kind, import_id, new_id) VALUES(?1, ?2, ?3)",
            params![kind, import_id, new_id],
        )?;
        if inserted == 0 {
            return Err(AppError::Validation(format!(
                "{kind} {import_id} is already mapped"
            )));
        }
        Ok(())
    }

    pub fn user_id_from_imported_user_id(&self, import_id: i64) -> AppResult<Option<i64>> {
        self.lookup_import_id(KIND_USER, &import_id.to_string())
    }

    pub fn category_id_from_imported_category_id(&self, import_id: i64) -> AppResult<Option<i64>> {
        self.lookup_import_id(KIND_CATEGORY, &import_id.to_string())
    }

    pub fn post_id_from_imported_post_id(&self, import_id: &str) -> AppResult<Option<i64>> {
        self.lookup_import_id(KIND_POST, import_id)
    }

    pub fn post_already_imported(&self, import_id: &str) -> AppResult<bool> {
        Ok(self.post_id_from_imported_post_id(import_id)?.is_some())
    }

    pub fn topic_lookup_from_imported_post_id(
        &self,
        import_id: &str,
    ) -> AppResult<Option<TopicLookup>> {
        let lookup = self
            .conn
            .query_row(
                "SELECT p.id, p.topic_id, p.post_number
                 FROM import_ids i JOIN posts p ON p.id = i.new_id
                 WHERE i.kind = ?1 AND i.import_id = ?2",
                params![KIND_POST, import_id],
                |row| {
                    Ok(TopicLookup {
                        post_id: row.get(0)?,
                        topic_id: row.get(1)?,
                        post_number: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(lookup)
    }

    pub fn username_for_user(&self, user_id: i64) -> AppResult<Option<String>> {
        let name = self
            .conn
            .query_row(
                "SELECT username FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(name)
    }

    pub fn create_user(&self, user: &NewUser) -> AppResult<i64> {
        let allow_unicode = self.site_setting_enabled(SETTING_UNICODE_USERNAMES)?;
        let username = self.unique_username(&sanitize_username(&user.username, allow_unicode))?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO users(username, name, email, admin, created_at, last_seen_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                username,
                user.name,
                user.email,
                user.admin,
                user.created_at,
                user.last_seen_at
            ],
        )?;
        let user_id = tx.last_insert_rowid();

        let import_id = user.import_id.to_string();
        let builtin = [
            ("import_id", import_id.as_str()),
            ("import_username", user.username.as_str()),
        ];
        let extra = user.custom_fields.iter().map(|(k, v)| (k.as_str(), v.as_str()));
        for (name, value) in builtin.into_iter().chain(extra) {
            tx.execute(
                "INSERT INTO user_custom_fields(user_id, name, value) VALUES(?1, ?2, ?3)
                 ON CONFLICT(user_id, name) DO UPDATE SET value = excluded.value",
                params![user_id, name, value],
            )?;
        }

        Self::record_import_id(&tx, KIND_USER, &import_id, user_id)?;
        tx.commit()?;
        Ok(user_id)
    }

    fn unique_username(&self, base: &str) -> AppResult<String> {
        let mut stmt = self
            .conn
            .prepare("SELECT 1 FROM users WHERE username = ?1")?;
        if !stmt.exists(params![base])? {
            return Ok(base.to_string());
        }
        for i in 1.. {
            let candidate = format!("{base}_{i}");
            if !stmt.exists(params![candidate])? {
                return Ok(candidate);
            }
        }
        unreachable!("username suffixes are unbounded")
    }

    pub fn create_category(&self, category: &NewCategory) -> AppResult<i64> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO categories(name, description) VALUES(?1, ?2)",
            params![category.name, category.description],
        )?;
        let id = tx.last_insert_rowid();
        Self::record_import_id(&tx, KIND_CATEGORY, &category.import_id.to_string(), id)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn create_post(&self, post: &NewPost) -> AppResult<PostRecord> {
        let tx = self.conn.unchecked_transaction()?;

        let (topic_id, post_number) = match &post.target {
            PostTarget::Reply { topic_id } => {
                let next = tx
                    .query_row(
                        "SELECT t.id, COALESCE(MAX(p.post_number), 0) + 1
                         FROM topics t LEFT JOIN posts p ON p.topic_id = t.id
                         WHERE t.id = ?1 GROUP BY t.id",
                        params![topic_id],
                        |row| row.get::<_, i64>(1),
                    )
                    .optional()?
                    .ok_or_else(|| AppError::NotFound(format!("topic {topic_id}")))?;
                (*topic_id, next)
            }
            PostTarget::Topic {
                title,
                category_id,
                closed,
            } => {
                tx.execute(
                    "INSERT INTO topics(title, archetype, category_id, user_id, closed, created_at)
                     VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        title,
                        ARCHETYPE_REGULAR,
                        category_id,
                        post.user_id,
                        closed,
                        post.created_at
                    ],
                )?;
                (tx.last_insert_rowid(), 1)
            }
            PostTarget::PrivateMessage {
                title,
                target_usernames,
            } => {
                tx.execute(
                    "INSERT INTO topics(title, archetype, user_id, target_usernames, created_at)
                     VALUES(?1, ?2, ?3, ?4, ?5)",
                    params![
                        title,
                        ARCHETYPE_PRIVATE_MESSAGE,
                        post.user_id,
                        target_usernames,
                        post.created_at
                    ],
                )?;
                (tx.last_insert_rowid(), 1)
            }
        };

        tx.execute(
            "INSERT INTO posts(topic_id, user_id, post_number, raw, created_at)
             VALUES(?1, ?2, ?3, ?4, ?5)",
            params![topic_id, post.user_id, post_number, post.raw, post.created_at],
        )?;
        let id = tx.last_insert_rowid();
        Self::record_import_id(&tx, KIND_POST, &post.import_id, id)?;
        tx.commit()?;

        Ok(PostRecord {
            id,
            topic_id,
            user_id: post.user_id,
            post_number,
            raw: post.raw.clone(),
        })
    }

    pub fn post(&self, post_id: i64) -> AppResult<Option<PostRecord>> {
        let post = self
            .conn
            .query_row(
                "SELECT id, topic_id, user_id, post_number, raw FROM posts WHERE id = ?1",
                params![post_id],
                |row| {
                    Ok(PostRecord {
                        id: row.get(0)?,
                        topic_id: row.get(1)?,
                        user_id: row.get(2)?,
                        post_number: row.get(3)?,
                        raw: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(post)
    }

    pub fn update_post_raw(&self, post_id: i64, raw: &str) -> AppResult<()> {
        let changed = self
            .conn
            .execute("UPDATE posts SET raw = ?1 WHERE id = ?2", params![raw, post_id])?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("post {post_id}")));
        }
        Ok(())
    }

    /// Stores the file at `path` as an upload owned by `user_id`.
    ///
    /// Identical content is stored once; a second upload of the same bytes
    /// returns the existing record.
    pub fn create_upload(
        &self,
        user_id: i64,
        path: &Path,
        original_filename: &str,
    ) -> AppResult<Upload> {
        let data = fs::read(path)?;
        if data.is_empty() {
            return Err(AppError::Upload(format!("{original_filename} is empty")));
        }
        let sha256 = hex::encode(Sha256::digest(&data));

        let existing = self
            .conn
            .query_row(
                "SELECT id, filesize, url FROM uploads WHERE sha256 = ?1",
                params![sha256],
                |row| {
                    Ok(Upload {
                        id: row.get(0)?,
                        filesize: row.get(1)?,
                        url: row.get(2)?,
                    })
                },
            )
            .optional()?;
        if let Some(upload) = existing {
            return Ok(upload);
        }

        let extension = Path::new(original_filename)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        let url = format!("/uploads/original/{sha256}{extension}");
        let filesize = i64::try_from(data.len())
            .map_err(|_| AppError::Upload(format!("{original_filename} is too large")))?;

        self.conn.execute(
            "INSERT INTO uploads(user_id, original_filename, filesize, sha256, url, data,
                                 created_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user_id,
                original_filename,
                filesize,
                sha256,
                url,
                data,
                Utc::now().to_rfc3339()
            ],
        )?;

        Ok(Upload {
            id: self.conn.last_insert_rowid(),
            filesize,
            url,
        })
    }

    pub fn upload_reference_exists(&self, upload_id: i64, post_id: i64) -> AppResult<bool> {
        let mut stmt = self
            .conn
            .prepare("SELECT 1 FROM upload_references WHERE upload_id = ?1 AND post_id = ?2")?;
        Ok(stmt.exists(params![upload_id, post_id])?)
    }

    pub fn ensure_upload_reference(&self, upload_id: i64, post_id: i64) -> AppResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO upload_references(upload_id, post_id) VALUES(?1, ?2)",
            params![upload_id, post_id],
        )?;
        Ok(())
    }

    /// Returns `true` when a new redirect was stored.
    pub fn find_or_create_permalink(&self, url: &str, target: &PermalinkTarget) -> AppResult<bool> {
        let (category_id, topic_id, external_url) = match target {
            PermalinkTarget::Category(id) => (Some(*id), None, None),
            PermalinkTarget::Topic(id) => (None, Some(*id), None),
            PermalinkTarget::External(url) => (None, None, Some(url.as_str())),
        };
        let inserted = self.conn.execute(
            "INSERT INTO permalinks(url, category_id, topic_id, external_url)
             VALUES(?1, ?2, ?3, ?4)
             ON CONFLICT(url) DO NOTHING",
            params![url, category_id, topic_id, external_url],
        )?;
        Ok(inserted > 0)
    }

    pub fn imported_users(&self) -> AppResult<Vec<ImportedUser>> {
        let mut stmt = self.conn.prepare(
            "SELECT u.username, id_field.value, name_field.value
             FROM users u
             JOIN user_custom_fields id_field
               ON id_field.user_id = u.id AND id_field.name = 'import_id'
             JOIN user_custom_fields name_field
               ON name_field.user_id = u.id AND name_field.name = 'import_username'
             ORDER BY u.id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ImportedUser {
                username: row.get(0)?,
                import_id: row.get(1)?,
                import_username: row.get(2)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> AppResult<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.init_schema()?;
        Ok(db)
    }

    #[cfg(test)]
    pub fn count_rows(&self, table: &str) -> i64 {
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .expect("count rows")
    }

    #[cfg(test)]
    pub fn topic_field(&self, topic_id: i64, column: &str) -> Option<String> {
        self.conn
            .query_row(
                &format!("SELECT CAST({column} AS TEXT) FROM topics WHERE id = ?1"),
                params![topic_id],
                |row| row.get(0),
            )
            .expect("topic field")
    }

    #[cfg(test)]
    pub fn permalink_target(&self, url: &str) -> Option<PermalinkTarget> {
        self.conn
            .query_row(
                "SELECT category_id, topic_id, external_url FROM permalinks WHERE url = ?1",
                params![url],
                |row| {
                    let category: Option<i64> = row.get(0)?;
                    let topic: Option<i64> = row.get(1)?;
                    let external: Option<String> = row.get(2)?;
                    Ok(match (category, topic, external) {
                        (Some(id), _, _) => PermalinkTarget::Category(id),
                        (_, Some(id), _) => PermalinkTarget::Topic(id),
                        (_, _, Some(url)) => PermalinkTarget::External(url),
                        _ => PermalinkTarget::External(String::new()),
                    })
                },
            )
            .optional()
            .expect("permalink lookup")
    }
}

/// Replaces characters the forum does not accept in usernames.
pub fn sanitize_username(raw: &str, allow_unicode: bool) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            let ok = if allow_unicode {
                c.is_alphanumeric()
            } else {
                c.is_ascii_alphanumeric()
            };
            if ok || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_USERNAME_CHARS)
        .collect();

    let trimmed = cleaned.trim_matches(|c| matches!(c, '_' | '.' | '-'));
    if trimmed.is_empty() {
        "user".to_string()
    } else {
        trimmed.to_string()
    }
}
