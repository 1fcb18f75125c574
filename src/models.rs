/// Destination user id of the built-in system account.
pub const SYSTEM_USER_ID: i64 = -1;
pub const SYSTEM_USERNAME: &str = "system";

pub const ARCHETYPE_REGULAR: &str = "regular";
pub const ARCHETYPE_PRIVATE_MESSAGE: &str = "private_message";

// Rows read from the Phorum tables.

#[derive(Debug, Clone)]
pub struct LegacyUser {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub date_added: i64,
    pub date_last_active: i64,
    pub admin: bool,
    pub custom_field: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LegacyCategory {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct LegacyMessage {
    pub id: i64,
    pub parent_id: i64,
    pub category_id: i64,
    pub title: String,
    pub user_id: i64,
    pub raw: String,
    pub closed: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct LegacyPrivateMessage {
    pub id: i64,
    pub title: String,
    pub message: String,
    pub user_id: i64,
    pub meta: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct LegacyAttachment {
    pub file_id: i64,
    pub message_id: i64,
    pub filename: String,
    pub data: Vec<u8>,
}

// Records handed to the destination store.

#[derive(Debug, Clone)]
pub struct NewUser {
    pub import_id: i64,
    pub username: String,
    pub name: String,
    pub email: String,
    pub admin: bool,
    pub created_at: String,
    pub last_seen_at: String,
    pub custom_fields: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct NewCategory {
    pub import_id: i64,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub enum PostTarget {
    Reply {
        topic_id: i64,
    },
    Topic {
        title: String,
        category_id: Option<i64>,
        closed: bool,
    },
    PrivateMessage {
        title: String,
        target_usernames: String,
    },
}

#[derive(Debug, Clone)]
pub struct NewPost {
    pub import_id: String,
    pub user_id: i64,
    pub raw: String,
    pub created_at: String,
    pub target: PostTarget,
}

#[derive(Debug, Clone)]
pub struct PostRecord {
    pub id: i64,
    pub topic_id: i64,
    pub user_id: i64,
    pub post_number: i64,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLookup {
    pub post_id: i64,
    pub topic_id: i64,
    pub post_number: i64,
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub id: i64,
    pub filesize: i64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermalinkTarget {
    Category(i64),
    Topic(i64),
    External(String),
}

#[derive(Debug, Clone)]
pub struct ImportedUser {
    pub username: String,
    pub import_id: String,
    pub import_username: String,
}

#[derive(Debug, Clone)]
pub struct UserFieldSpec {
    pub name: String,
    pub description: String,
}

/// Per-step counters reported at the end of each import step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ImportStats {
    pub fn absorb(&mut self, other: ImportStats) {
        self.created += other.created;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}
