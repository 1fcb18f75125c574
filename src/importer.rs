use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::ValueEnum;

use crate::app_error::{AppError, AppResult};
use crate::attachments::{safe_filename, stage_payload, upload_markup};
use crate::db::{Db, SETTING_UNICODE_USERNAMES};
use crate::markdown::phorum_to_markdown;
use crate::models::{
    ImportStats, LegacyAttachment, LegacyMessage, LegacyPrivateMessage, NewCategory, NewPost,
    NewUser, PermalinkTarget, PostTarget, UserFieldSpec, SYSTEM_USERNAME, SYSTEM_USER_ID,
};
use crate::php_serialize::{self, PhpValue};
use crate::source::PhorumSource;

const MAX_TITLE_CHARS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Step {
    Categories,
    Users,
    PrivateMessages,
    Posts,
    Attachments,
    Permalinks,
}

impl Step {
    /// Steps in the order they depend on each other.
    pub const ALL: [Step; 6] = [
        Step::Categories,
        Step::Users,
        Step::PrivateMessages,
        Step::Posts,
        Step::Attachments,
        Step::Permalinks,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::Categories => "categories",
            Step::Users => "users",
            Step::PrivateMessages => "private messages",
            Step::Posts => "posts",
            Step::Attachments => "attachments",
            Step::Permalinks => "permalinks",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub base: String,
    pub batch_size: i64,
    pub tmp_dir: PathBuf,
    pub custom_user_field: Option<UserFieldSpec>,
}

enum Outcome {
    Created,
    Skipped,
}

pub struct Importer<'a> {
    source: &'a PhorumSource,
    db: &'a Db,
    options: ImportOptions,
    custom_field_id: Option<i64>,
}

impl<'a> Importer<'a> {
    pub fn new(source: &'a PhorumSource, db: &'a Db, options: ImportOptions) -> Self {
        Self {
            source,
            db,
            options,
            custom_field_id: None,
        }
    }

    /// Runs the selected steps in dependency order.
    pub fn perform(&mut self, steps: &[Step]) -> AppResult<ImportStats> {
        self.tune_site_settings()?;
        self.ensure_custom_user_field()?;

        let mut total = ImportStats::default();
        for step in Step::ALL.into_iter().filter(|s| steps.contains(s)) {
            log::info!("importing {}...", step.name());
            let stats = match step {
                Step::Categories => self.import_categories()?,
                Step::Users => self.import_users()?,
                Step::PrivateMessages => self.import_private_messages()?,
                Step::Posts => self.import_posts()?,
                Step::Attachments => self.import_attachments()?,
                Step::Permalinks => self.create_user_permalinks()?,
            };
            log::info!(
                "{}: {} created, {} skipped, {} failed",
                step.name(),
                stats.created,
                stats.skipped,
                stats.failed
            );
            total.absorb(stats);
        }
        Ok(total)
    }

    fn tune_site_settings(&self) -> AppResult<()> {
        self.db.save_site_setting(SETTING_UNICODE_USERNAMES, "true")
    }

    fn ensure_custom_user_field(&mut self) -> AppResult<()> {
        if let Some(spec) = &self.options.custom_user_field {
            let id = self.db.find_or_create_user_field(spec)?;
            log::debug!("custom user field {:?} has id {id}", spec.name);
            self.custom_field_id = Some(id);
        }
        Ok(())
    }

    fn import_categories(&self) -> AppResult<ImportStats> {
        let categories = self.source.fetch_categories()?;
        let mut stats = ImportStats::default();

        for category in &categories {
            if !category.active
                || self
                    .db
                    .category_id_from_imported_category_id(category.id)?
                    .is_some()
            {
                stats.skipped += 1;
                continue;
            }
            self.db.create_category(&NewCategory {
                import_id: category.id,
                name: category.name.trim().to_string(),
                description: category.description.clone(),
            })?;
            stats.created += 1;
        }

        for category in &categories {
            if let Some(id) = self.db.category_id_from_imported_category_id(category.id)? {
                let url = format!("{}list.php?{}", self.options.base, category.id);
                self.db
                    .find_or_create_permalink(&url, &PermalinkTarget::Category(id))?;
            }
        }
        Ok(stats)
    }

    fn import_users(&self) -> AppResult<ImportStats> {
        let total = self.source.count_users()?;
        let batch_size = self.options.batch_size;
        let mut stats = ImportStats::default();
        let mut current = 0;

        batches(batch_size, |offset| {
            let users = self.source.fetch_users(batch_size, offset)?;
            for user in &users {
                if user.username.trim().is_empty()
                    || self.db.user_id_from_imported_user_id(user.id)?.is_some()
                {
                    stats.skipped += 1;
                    continue;
                }

                let mut custom_fields = Vec::new();
                if let (Some(field_id), Some(value)) = (self.custom_field_id, &user.custom_field) {
                    custom_fields.push((format!("user_field_{field_id}"), value.clone()));
                }
                let new_user = NewUser {
                    import_id: user.id,
                    username: user.username.clone(),
                    name: user.username.clone(),
                    email: user.email.clone(),
                    admin: user.admin,
                    created_at: unix_to_rfc3339(user.date_added),
                    last_seen_at: unix_to_rfc3339(user.date_last_active),
                    custom_fields,
                };
                let result = self.db.create_user(&new_user).map(|_| Outcome::Created);
                tally(&mut stats, &format!("user {}", user.id), result)?;
            }
            current += users.len();
            print_status(current, total);
            Ok(users.len())
        })?;
        Ok(stats)
    }

    fn import_private_messages(&self) -> AppResult<ImportStats> {
        let total = self.source.count_private_messages()?;
        let batch_size = self.options.batch_size;
        let mut stats = ImportStats::default();
        let mut threads = PmThreads::default();
        let mut current = 0;

        batches(batch_size, |offset| {
            let messages = self.source.fetch_private_messages(batch_size, offset)?;
            for pm in &messages {
                let result = self.import_private_message(pm, &mut threads);
                tally(&mut stats, &format!("pm-{}", pm.id), result)?;
            }
            current += messages.len();
            print_status(current, total);
            Ok(messages.len())
        })?;
        Ok(stats)
    }

    fn import_private_message(
        &self,
        pm: &LegacyPrivateMessage,
        threads: &mut PmThreads,
    ) -> AppResult<Outcome> {
        let import_id = format!("pm-{}", pm.id);
        let already_imported = self.db.post_already_imported(&import_id)?;

        let title = decode_title(&pm.title);
        let sender_id = self
            .db
            .user_id_from_imported_user_id(pm.user_id)?
            .unwrap_or(SYSTEM_USER_ID);

        let recipients = match recipient_ids(&pm.meta) {
            Ok(ids) => ids,
            Err(e) if already_imported => {
                log::debug!("{import_id} already imported, unreadable meta: {e}");
                return Ok(Outcome::Skipped);
            }
            Err(e) => {
                log::warn!("{import_id} has unreadable recipients ({e}): {}", pm.meta);
                return Err(e);
            }
        };

        let mut participants = Vec::with_capacity(recipients.len() + 1);
        let mut target_usernames = Vec::new();
        for legacy_id in recipients {
            let user_id = self.db.user_id_from_imported_user_id(legacy_id)?;
            if let Some(id) = user_id {
                if let Some(username) = self.db.username_for_user(id)? {
                    target_usernames.push(username);
                }
            }
            participants.push(user_id.unwrap_or(SYSTEM_USER_ID));
        }
        participants.push(sender_id);
        participants.sort_unstable();

        let parent_pm = if is_reply(&title) {
            threads.reply_parent(&title, &participants)
        } else {
            threads.remember(&title, &participants, pm.id);
            None
        };

        if already_imported {
            return Ok(Outcome::Skipped);
        }

        let mut topic_id = None;
        if let Some(parent) = parent_pm {
            topic_id = self
                .db
                .topic_lookup_from_imported_post_id(&format!("pm-{parent}"))?
                .map(|t| t.topic_id);
        }

        let target = match topic_id {
            Some(topic_id) => PostTarget::Reply { topic_id },
            None => {
                let mut usernames = target_usernames.join(",");
                if usernames.is_empty() {
                    log::info!("{import_id} has no recipients, addressing it to {SYSTEM_USERNAME}");
                    usernames = SYSTEM_USERNAME.to_string();
                }
                PostTarget::PrivateMessage {
                    title,
                    target_usernames: usernames,
                }
            }
        };

        let post = self.db.create_post(&NewPost {
            raw: phorum_to_markdown(&pm.message, &import_id),
            import_id,
            user_id: sender_id,
            created_at: unix_to_rfc3339(pm.created_at),
            target,
        })?;
        log::debug!("pm-{} -> topic {} #{}", pm.id, post.topic_id, post.post_number);
        Ok(Outcome::Created)
    }

    fn import_posts(&self) -> AppResult<ImportStats> {
        let total = self.source.count_messages()?;
        let batch_size = self.options.batch_size;
        let mut stats = ImportStats::default();
        let mut current = 0;

        batches(batch_size, |offset| {
            let messages = self.source.fetch_messages(batch_size, offset)?;
            for message in &messages {
                let result = self.import_message(message);
                tally(&mut stats, &format!("post {}", message.id), result)?;
            }

            for message in messages.iter().filter(|m| m.parent_id == 0) {
                if let Some(topic) = self
                    .db
                    .topic_lookup_from_imported_post_id(&message.id.to_string())?
                {
                    let url = format!(
                        "{}read.php?{},{}",
                        self.options.base, message.category_id, message.id
                    );
                    self.db
                        .find_or_create_permalink(&url, &PermalinkTarget::Topic(topic.topic_id))?;
                }
            }

            current += messages.len();
            print_status(current, total);
            Ok(messages.len())
        })?;
        Ok(stats)
    }

    fn import_message(&self, message: &LegacyMessage) -> AppResult<Outcome> {
        let import_id = message.id.to_string();
        if self.db.post_already_imported(&import_id)? {
            return Ok(Outcome::Skipped);
        }

        let user_id = self
            .db
            .user_id_from_imported_user_id(message.user_id)?
            .unwrap_or(SYSTEM_USER_ID);

        let (target, raw) = if message.parent_id == 0 {
            let category_id = self
                .db
                .category_id_from_imported_category_id(message.category_id)?;
            if category_id.is_none() {
                log::warn!(
                    "forum {} of topic {} was not imported, leaving it uncategorized",
                    message.category_id,
                    message.id
                );
            }
            let mut title = decode_title(&message.title);
            if title.is_empty() {
                title = "Untitled".to_string();
            }
            let target = PostTarget::Topic {
                title,
                category_id,
                closed: message.closed,
            };
            (target, message.raw.clone())
        } else {
            let Some(parent) = self
                .db
                .topic_lookup_from_imported_post_id(&message.parent_id.to_string())?
            else {
                let preview: String = message.title.chars().take(41).collect();
                log::warn!(
                    "Parent post {} doesn't exist. Skipping {}: {preview}",
                    message.parent_id,
                    message.id
                );
                return Ok(Outcome::Skipped);
            };
            let raw = if !message.title.is_empty() && !is_reply(&message.title) {
                format!("**{}**\n\n{}", message.title, message.raw)
            } else {
                message.raw.clone()
            };
            (PostTarget::Reply { topic_id: parent.topic_id }, raw)
        };

        let post = self.db.create_post(&NewPost {
            raw: phorum_to_markdown(&raw, &import_id),
            import_id,
            user_id,
            created_at: unix_to_rfc3339(message.created_at),
            target,
        })?;
        log::debug!("post {} -> topic {} #{}", message.id, post.topic_id, post.post_number);
        Ok(Outcome::Created)
    }

    fn import_attachments(&self) -> AppResult<ImportStats> {
        let total = self.source.count_attachments()?;
        let mut stats = ImportStats::default();
        let mut current = 0;

        self.source.for_each_attachment(|item| {
            let result = item.and_then(|attachment| self.import_attachment(&attachment));
            match result {
                Err(AppError::Source(e)) => {
                    log::warn!("skipping unreadable attachment: {e}");
                    stats.failed += 1;
                }
                other => tally(&mut stats, "attachment", other)?,
            }
            current += 1;
            print_status(current, total);
            Ok(())
        })?;
        Ok(stats)
    }

    fn import_attachment(&self, attachment: &LegacyAttachment) -> AppResult<Outcome> {
        let Some(post_id) = self
            .db
            .post_id_from_imported_post_id(&attachment.message_id.to_string())?
        else {
            log::warn!(
                "Post {} for attachment {} not found",
                attachment.message_id,
                attachment.file_id
            );
            return Ok(Outcome::Skipped);
        };
        let post = self
            .db
            .post(post_id)?
            .ok_or_else(|| AppError::NotFound(format!("post {post_id}")))?;

        let filename = safe_filename(attachment.file_id, &attachment.filename);
        let staged = stage_payload(&self.options.tmp_dir, attachment.file_id, &attachment.data)?;
        let upload = self
            .db
            .create_upload(post.user_id, staged.path(), &filename)
            .map_err(|e| {
                log::error!("Failed to upload attachment {}: {e}", attachment.file_id);
                let reason = match e {
                    AppError::Upload(reason) => reason,
                    other => other.to_string(),
                };
                AppError::Upload(format!("attachment {}: {reason}", attachment.file_id))
            })?;

        let markup = upload_markup(&upload, &filename);
        if post.raw.contains(&markup) {
            log::info!("Skipping attachment {}", attachment.file_id);
            return Ok(Outcome::Skipped);
        }

        self.db
            .update_post_raw(post.id, &format!("{}\n\n{markup}\n\n", post.raw))?;
        if self.db.upload_reference_exists(upload.id, post.id)? {
            log::info!(
                "upload reference for file {} already exists",
                attachment.file_id
            );
        } else {
            self.db.ensure_upload_reference(upload.id, post.id)?;
        }
        Ok(Outcome::Created)
    }

    fn create_user_permalinks(&self) -> AppResult<ImportStats> {
        let mut stats = ImportStats::default();
        for user in self.db.imported_users()? {
            let url = format!("{}profile.php?1,{}", self.options.base, user.import_id);
            let target = format!("/u/{}", urlencoding::encode(&user.username));
            log::debug!("{url} -> {target} (was {})", user.import_username);
            if self
                .db
                .find_or_create_permalink(&url, &PermalinkTarget::External(target))?
            {
                stats.created += 1;
            } else {
                stats.skipped += 1;
            }
        }
        Ok(stats)
    }
}

/// First message of each private conversation, keyed by title and the sorted
/// participant ids.
#[derive(Debug, Default)]
pub struct PmThreads {
    first_by_title: HashMap<(String, Vec<i64>), i64>,
}

impl PmThreads {
    pub fn remember(&mut self, title: &str, participants: &[i64], pm_id: i64) {
        self.first_by_title
            .entry((title.to_string(), participants.to_vec()))
            .or_insert(pm_id);
    }

    /// Finds the conversation a `Re:` title answers. The prefix is cut at
    /// 3 to 8 characters to cover "Re:X", "Re: X" and stacked variants.
    pub fn reply_parent(&self, title: &str, participants: &[i64]) -> Option<i64> {
        if !is_reply(title) {
            return None;
        }
        (3..=8).find_map(|cut| {
            let stripped: String = title.chars().skip(cut).collect();
            self.first_by_title
                .get(&(stripped, participants.to_vec()))
                .copied()
        })
    }
}

fn is_reply(title: &str) -> bool {
    title.starts_with("Re:")
}

fn decode_title(raw: &str) -> String {
    html_escape::decode_html_entities(raw)
        .trim()
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect()
}

/// Legacy user ids named as keys of `meta["recipients"]`.
fn recipient_ids(meta: &str) -> AppResult<Vec<i64>> {
    let value = php_serialize::unserialize(meta)?;
    let entries = value
        .get("recipients")
        .and_then(PhpValue::entries)
        .ok_or_else(|| AppError::Validation("meta has no recipients array".to_string()))?;

    entries
        .iter()
        .map(|(key, _)| {
            key.as_int().ok_or_else(|| {
                AppError::Validation(format!("recipient key {key:?} is not a user id"))
            })
        })
        .collect()
}

fn unix_to_rfc3339(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .unwrap_or_default()
        .to_rfc3339()
}

/// Calls `f` with increasing offsets until it reports an empty batch.
fn batches(batch_size: i64, mut f: impl FnMut(i64) -> AppResult<usize>) -> AppResult<()> {
    let mut offset = 0;
    loop {
        if f(offset)? == 0 {
            return Ok(());
        }
        offset += batch_size;
    }
}

fn tally(stats: &mut ImportStats, what: &str, result: AppResult<Outcome>) -> AppResult<()> {
    match result {
        Ok(Outcome::Created) => stats.created += 1,
        Ok(Outcome::Skipped) => stats.skipped += 1,
        Err(e) if e.is_record_level() => {
            log::warn!("skipping {what}: {e}");
            stats.failed += 1;
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

fn print_status(current: usize, total: i64) {
    let pct = if total > 0 {
        current as f64 * 100.0 / total as f64
    } else {
        100.0
    };
    log::info!("{current} / {total} ({pct:.1}%)");
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::{recipient_ids, ImportOptions, Importer, PmThreads, Step};
    use crate::db::Db;
    use crate::models::{PermalinkTarget, UserFieldSpec};
    use crate::source::{fixtures, PhorumSource};

    struct Harness {
        source: PhorumSource,
        db: Db,
        tmp: TempDir,
    }

    impl Harness {
        fn new(seed: impl FnOnce(&rusqlite::Connection)) -> Self {
            let conn = fixtures::connection();
            seed(&conn);
            let source =
                PhorumSource::with_connection(conn, "phorum_", Some("uid")).expect("source");
            Self {
                source,
                db: Db::open_in_memory().expect("db"),
                tmp: tempfile::tempdir().expect("tmp dir"),
            }
        }

        fn run(&self, steps: &[Step]) -> crate::app_error::AppResult<crate::models::ImportStats> {
            let options = ImportOptions {
                base: "phorum/".to_string(),
                batch_size: 2,
                tmp_dir: self.tmp.path().to_path_buf(),
                custom_user_field: Some(UserFieldSpec {
                    name: "Geocaching ID".to_string(),
                    description: "ID in Geocaching".to_string(),
                }),
            };
            Importer::new(&self.source, &self.db, options).perform(steps)
        }

        fn topic_of(&self, import_id: &str) -> i64 {
            self.db
                .topic_lookup_from_imported_post_id(import_id)
                .expect("lookup")
                .unwrap_or_else(|| panic!("{import_id} not imported"))
                .topic_id
        }
    }

    fn seed_forum(conn: &rusqlite::Connection) {
        fixtures::user(conn, 1, "alice", true);
        fixtures::user(conn, 2, "bob", true);
        fixtures::user(conn, 3, "carol", true);
        fixtures::forum(conn, 5, "General", true);
        fixtures::forum(conn, 6, "Archive", false);
        fixtures::message(conn, 10, 0, 5, "Welcome &amp; hi", 1, "[b]hello[/b]", 100);
        fixtures::message(conn, 11, 10, 5, "Re: Welcome", 2, "thanks", 200);
        fixtures::message(conn, 12, 10, 5, "Side note", 3, "by the way", 300);
        fixtures::message(conn, 13, 999, 5, "Lost reply", 2, "orphan", 400);
    }

    #[test]
    fn imports_topics_and_replies() {
        let h = Harness::new(seed_forum);
        h.run(&Step::ALL).expect("import");

        let topic = h.topic_of("10");
        assert_eq!(h.topic_of("11"), topic);
        assert_eq!(h.topic_of("12"), topic);
        assert_eq!(h.db.topic_field(topic, "title").as_deref(), Some("Welcome & hi"));

        let side_note = h
            .db
            .post(h.db.post_id_from_imported_post_id("12").expect("lookup").expect("mapped"))
            .expect("post")
            .expect("exists");
        assert_eq!(side_note.raw, "**Side note**\n\nby the way");
        assert_eq!(side_note.post_number, 3);
    }

    #[test]
    fn reply_with_unknown_parent_is_skipped() {
        let h = Harness::new(seed_forum);
        let stats = h.run(&Step::ALL).expect("import");
        assert!(!h.db.post_already_imported("13").expect("lookup"));
        assert_eq!(h.db.count_rows("posts"), 3);
        assert!(stats.skipped >= 1);
    }

    #[test]
    fn rerun_creates_no_duplicates() {
        let h = Harness::new(|conn| {
            seed_forum(conn);
            fixtures::pm(conn, 1, "Hi", 1, &fixtures::recipients_meta(&[2]), 50);
            fixtures::file(conn, 1, 10, "notes.txt", "aGVsbG8=");
            fixtures::file(conn, 2, 11, ".hidden.txt", "d29ybGQ=");
        });
        h.run(&Step::ALL).expect("first run");
        let tables = [
            "users",
            "categories",
            "topics",
            "posts",
            "uploads",
            "upload_references",
            "permalinks",
        ];
        let before: Vec<i64> = tables.iter().map(|t| h.db.count_rows(t)).collect();

        let second = h.run(&Step::ALL).expect("second run");
        let after: Vec<i64> = tables.iter().map(|t| h.db.count_rows(t)).collect();
        assert_eq!(before, after);
        assert_eq!(second.created, 0);

        let reply_id = h
            .db
            .post_id_from_imported_post_id("11")
            .expect("lookup")
            .expect("mapped");
        let raw = h.db.post(reply_id).expect("post").expect("exists").raw;
        assert_eq!(raw.matches("hidden.txt|attachment]").count(), 1);
    }

    #[test]
    fn users_keep_custom_field_and_get_redirects() {
        let h = Harness::new(seed_forum);
        h.run(&[Step::Users, Step::Permalinks]).expect("import");

        // system + three active users
        assert_eq!(h.db.count_rows("users"), 4);
        assert_eq!(h.db.count_rows("user_fields"), 1);
        assert_eq!(
            h.db.permalink_target("phorum/profile.php?1,2"),
            Some(PermalinkTarget::External("/u/bob".to_string()))
        );
    }

    #[test]
    fn categories_and_topics_get_redirects() {
        let h = Harness::new(seed_forum);
        h.run(&[Step::Categories, Step::Users, Step::Posts]).expect("import");

        assert_eq!(h.db.count_rows("categories"), 1);
        let category = h
            .db
            .category_id_from_imported_category_id(5)
            .expect("lookup")
            .expect("mapped");
        assert_eq!(
            h.db.permalink_target("phorum/list.php?5"),
            Some(PermalinkTarget::Category(category))
        );
        assert_eq!(h.db.permalink_target("phorum/list.php?6"), None);
        assert_eq!(
            h.db.permalink_target("phorum/read.php?5,10"),
            Some(PermalinkTarget::Topic(h.topic_of("10")))
        );
    }

    #[test]
    fn pm_reply_joins_original_conversation() {
        let h = Harness::new(|conn| {
            seed_forum(conn);
            fixtures::pm(conn, 1, "Plans", 1, &fixtures::recipients_meta(&[2]), 10);
            fixtures::pm(conn, 2, "Other", 3, &fixtures::recipients_meta(&[1]), 20);
            // lands in the second batch
            fixtures::pm(conn, 3, "Re: Plans", 2, &fixtures::recipients_meta(&[1]), 30);
            fixtures::pm(conn, 4, "Re: Plans", 1, &fixtures::recipients_meta(&[2, 3]), 40);
        });
        h.run(&[Step::Users, Step::PrivateMessages]).expect("import");

        let original = h.topic_of("pm-1");
        assert_eq!(h.topic_of("pm-3"), original);
        assert_ne!(h.topic_of("pm-4"), original);
        assert_eq!(h.db.topic_field(original, "archetype").as_deref(), Some("private_message"));
        assert_eq!(h.db.topic_field(original, "target_usernames").as_deref(), Some("bob"));
        assert_eq!(
            h.db.topic_field(h.topic_of("pm-4"), "target_usernames").as_deref(),
            Some("bob,carol")
        );
    }

    #[test]
    fn corrupt_pm_meta_skips_only_that_message() {
        let h = Harness::new(|conn| {
            seed_forum(conn);
            fixtures::pm(conn, 1, "Broken", 1, "a:1:{s:10:\"recipients\";", 10);
            fixtures::pm(conn, 2, "Fine", 1, &fixtures::recipients_meta(&[2]), 20);
            let nested = format!("a:1:{{s:10:\"recipients\";{}", "a:1:{i:0;".repeat(10_000));
            fixtures::pm(conn, 3, "Nested", 1, &nested, 30);
        });
        let stats = h.run(&[Step::Users, Step::PrivateMessages]).expect("import");

        assert!(!h.db.post_already_imported("pm-1").expect("lookup"));
        assert!(h.db.post_already_imported("pm-2").expect("lookup"));
        assert!(!h.db.post_already_imported("pm-3").expect("lookup"));
        assert_eq!(stats.failed, 2);
    }

    #[test]
    fn pm_without_known_recipients_goes_to_system() {
        let h = Harness::new(|conn| {
            seed_forum(conn);
            fixtures::pm(conn, 1, "Note to self", 1, &fixtures::recipients_meta(&[]), 10);
        });
        h.run(&[Step::Users, Step::PrivateMessages]).expect("import");
        assert_eq!(
            h.db.topic_field(h.topic_of("pm-1"), "target_usernames").as_deref(),
            Some("system")
        );
    }

    #[test]
    fn attachments_are_appended_once() {
        let h = Harness::new(|conn| {
            seed_forum(conn);
            fixtures::file(conn, 1, 10, "photo.png", "iVBORw0KGgo=");
            fixtures::file(conn, 2, 999, "lost.txt", "aGVsbG8=");
            fixtures::file(conn, 3, 11, "broken.bin", "%%%");
        });
        let stats = h.run(&Step::ALL).expect("import");
        assert_eq!(stats.failed, 1);

        let post_id = h.db.post_id_from_imported_post_id("10").expect("lookup").expect("mapped");
        let raw = h.db.post(post_id).expect("post").expect("exists").raw;
        assert_eq!(raw.matches("![photo.png](/uploads/original/").count(), 1);
        assert_eq!(h.db.count_rows("upload_references"), 1);

        h.run(&[Step::Attachments]).expect("rerun");
        let raw = h.db.post(post_id).expect("post").expect("exists").raw;
        assert_eq!(raw.matches("![photo.png]").count(), 1);
    }

    #[test]
    fn failed_upload_halts_the_import() {
        let h = Harness::new(|conn| {
            seed_forum(conn);
            fixtures::file(conn, 1, 10, "empty.txt", "");
            fixtures::file(conn, 2, 10, "after.txt", "aGVsbG8=");
        });
        let err = h.run(&Step::ALL).expect_err("upload failure");
        assert!(err.to_string().contains("attachment 1"));
        assert_eq!(h.db.count_rows("uploads"), 0);
    }

    #[test]
    fn thread_lookup_strips_reply_prefixes() {
        let mut threads = PmThreads::default();
        threads.remember("Plans", &[1, 2], 7);
        assert_eq!(threads.reply_parent("Re: Plans", &[1, 2]), Some(7));
        assert_eq!(threads.reply_parent("Re:Plans", &[1, 2]), Some(7));
        assert_eq!(threads.reply_parent("Re: Plans", &[1, 3]), None);
        assert_eq!(threads.reply_parent("Plans", &[1, 2]), None);

        threads.remember("Plans", &[1, 2], 9);
        assert_eq!(threads.reply_parent("Re: Plans", &[1, 2]), Some(7));
    }

    #[test]
    fn recipients_from_meta() {
        assert_eq!(recipient_ids(&fixtures::recipients_meta(&[4, 9])).expect("ids"), vec![4, 9]);
        assert!(recipient_ids("a:0:{}").is_err());
        assert!(recipient_ids("garbage").is_err());

        let mut deep = "a:1:{s:10:\"recipients\";".to_string();
        deep.push_str(&"a:1:{i:0;".repeat(200_000));
        assert!(recipient_ids(&deep).is_err());
    }
}
