use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use crate::object::SourceAnnotation;
use crate::runtime::ResolvedPaths;
use crate::schema::open_connection;

pub const USERS: &str = "users";
pub const USERMETA: &str = "usermeta";
pub const POSTS: &str = "posts";
pub const POSTMETA: &str = "postmeta";
pub const MIGRATION_MARKERS: &str = "migration_markers";

const UNIT_SAVEPOINT: &str = "object_unit";
const PASS_SAVEPOINT: &str = "dry_run_pass";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: i64,
    pub user_login: String,
    pub user_email: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewUser {
    pub user_login: String,
    pub user_nicename: String,
    pub user_email: String,
    pub user_url: String,
    pub user_registered: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRecord {
    pub id: i64,
    pub post_author: i64,
    pub post_title: String,
    pub post_content: String,
    pub post_status: String,
    pub post_name: String,
    pub post_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewPost {
    pub post_author: i64,
    pub post_date: String,
    pub post_content: String,
    pub post_title: String,
    pub post_excerpt: String,
    pub post_status: String,
    pub post_name: String,
    pub post_type: String,
}

/// Data access for the content database the transforms mutate.
///
/// A unit brackets one migration object: everything written between
/// `begin_unit` and `commit_unit` lands together or, after `rollback_unit`,
/// not at all. A pass wraps several units; `rollback_pass` discards all of
/// them at once, including the ones already committed inside it.
pub trait ContentRepository {
    fn begin_unit(&self) -> Result<()>;
    fn commit_unit(&self) -> Result<()>;
    fn rollback_unit(&self) -> Result<()>;

    fn begin_pass(&self) -> Result<()>;
    fn rollback_pass(&self) -> Result<()>;

    /// Records the processed marker for one object. Written inside the object's
    /// unit so the marker commits or rolls back together with its side effects.
    fn record_marker(
        &self,
        run_key: &str,
        source_key: &str,
        object_id: &str,
        sources: &[SourceAnnotation],
    ) -> Result<()>;

    /// Markers committed for `run_key` over `source_key`, keyed by object id.
    fn committed_markers(
        &self,
        run_key: &str,
        source_key: &str,
    ) -> Result<HashMap<String, Vec<SourceAnnotation>>>;

    /// Removes one marker, or all of them when `object_id` is `None`.
    fn clear_markers(&self, run_key: &str, source_key: &str, object_id: Option<&str>)
    -> Result<usize>;

    /// Prefixed table name for `base` (`users` -> `wp_users`).
    fn table(&self, base: &str) -> String;

    fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>>;
    fn find_user_by_login(&self, login: &str) -> Result<Option<UserRecord>>;
    fn insert_user(&self, user: &NewUser) -> Result<i64>;
    fn set_user_meta(&self, user_id: i64, key: &str, value: &str) -> Result<i64>;

    fn find_post(&self, post_id: i64) -> Result<Option<PostRecord>>;
    fn insert_post(&self, post: &NewPost) -> Result<i64>;
    fn update_post_author(&self, post_id: i64, author_id: i64) -> Result<()>;
    fn update_post_type(&self, post_id: i64, post_type: &str) -> Result<()>;
    fn update_post_content(&self, post_id: i64, content: &str) -> Result<()>;
    fn add_post_meta(&self, post_id: i64, key: &str, value: &str) -> Result<i64>;
}

pub struct SqliteRepository {
    connection: Connection,
    table_prefix: String,
}

impl SqliteRepository {
    pub fn open(paths: &ResolvedPaths, table_prefix: &str) -> Result<Self> {
        if !paths.db_path.exists() {
            bail!(
                "site database does not exist at {} (run `wpmigrate db migrate`)",
                paths.db_path.display()
            );
        }
        let connection = open_connection(&paths.db_path)?;
        Ok(Self {
            connection,
            table_prefix: table_prefix.to_string(),
        })
    }

    pub fn table_prefix(&self) -> &str {
        &self.table_prefix
    }

    fn find_user_where(&self, column: &str, value: &str) -> Result<Option<UserRecord>> {
        let sql = format!(
            "SELECT ID, user_login, user_email, display_name FROM {} WHERE {column} = ?1 COLLATE NOCASE ORDER BY ID LIMIT 1",
            self.table(USERS)
        );
        self.connection
            .query_row(&sql, [value], user_from_row)
            .optional()
            .with_context(|| format!("failed to look up user by {column} `{value}`"))
    }

    fn update_post_column(&self, post_id: i64, column: &str, value: &dyn rusqlite::ToSql) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET {column} = ?1, post_modified = ?2 WHERE ID = ?3",
            self.table(POSTS)
        );
        let updated = self
            .connection
            .execute(&sql, params![value, wordpress_now(), post_id])
            .with_context(|| format!("failed to update {column} of post {post_id}"))?;
        if updated == 0 {
            bail!("post {post_id} does not exist");
        }
        Ok(())
    }
}

impl ContentRepository for SqliteRepository {
    fn begin_unit(&self) -> Result<()> {
        self.connection
            .execute_batch(&format!("SAVEPOINT {UNIT_SAVEPOINT}"))
            .context("failed to open object savepoint")
    }

    fn commit_unit(&self) -> Result<()> {
        self.connection
            .execute_batch(&format!("RELEASE SAVEPOINT {UNIT_SAVEPOINT}"))
            .context("failed to release object savepoint")
    }

    fn rollback_unit(&self) -> Result<()> {
        self.connection
            .execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT {UNIT_SAVEPOINT}; RELEASE SAVEPOINT {UNIT_SAVEPOINT};"
            ))
            .context("failed to roll back object savepoint")
    }

    fn begin_pass(&self) -> Result<()> {
        self.connection
            .execute_batch(&format!("SAVEPOINT {PASS_SAVEPOINT}"))
            .context("failed to open dry-run savepoint")
    }

    fn rollback_pass(&self) -> Result<()> {
        self.connection
            .execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT {PASS_SAVEPOINT}; RELEASE SAVEPOINT {PASS_SAVEPOINT};"
            ))
            .context("failed to roll back dry-run savepoint")
    }

    fn record_marker(
        &self,
        run_key: &str,
        source_key: &str,
        object_id: &str,
        sources: &[SourceAnnotation],
    ) -> Result<()> {
        let sources_json =
            serde_json::to_string(sources).context("failed to serialize marker provenance")?;
        let sql = format!(
            "INSERT INTO {} (run_key, source_key, object_id, sources_json, processed_at_unix)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            self.table(MIGRATION_MARKERS)
        );
        self.connection
            .execute(
                &sql,
                params![run_key, source_key, object_id, sources_json, unix_now()?],
            )
            .with_context(|| {
                format!("failed to record marker for object {object_id} of run `{run_key}`")
            })?;
        Ok(())
    }

    fn committed_markers(
        &self,
        run_key: &str,
        source_key: &str,
    ) -> Result<HashMap<String, Vec<SourceAnnotation>>> {
        let sql = format!(
            "SELECT object_id, sources_json FROM {} WHERE run_key = ?1 AND source_key = ?2",
            self.table(MIGRATION_MARKERS)
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare marker lookup")?;
        let rows = statement
            .query_map(params![run_key, source_key], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .with_context(|| format!("failed to read markers of run `{run_key}`"))?;

        let mut markers = HashMap::new();
        for row in rows {
            let (object_id, sources_json) = row.context("failed to read marker row")?;
            let sources: Vec<SourceAnnotation> = serde_json::from_str(&sources_json)
                .with_context(|| format!("invalid provenance stored for object {object_id}"))?;
            markers.insert(object_id, sources);
        }
        Ok(markers)
    }

    fn clear_markers(
        &self,
        run_key: &str,
        source_key: &str,
        object_id: Option<&str>,
    ) -> Result<usize> {
        let table = self.table(MIGRATION_MARKERS);
        let removed = match object_id {
            Some(object_id) => self.connection.execute(
                &format!(
                    "DELETE FROM {table} WHERE run_key = ?1 AND source_key = ?2 AND object_id = ?3"
                ),
                params![run_key, source_key, object_id],
            ),
            None => self.connection.execute(
                &format!("DELETE FROM {table} WHERE run_key = ?1 AND source_key = ?2"),
                params![run_key, source_key],
            ),
        }
        .with_context(|| format!("failed to clear markers of run `{run_key}`"))?;
        Ok(removed)
    }

    fn table(&self, base: &str) -> String {
        format!("{}{base}", self.table_prefix)
    }

    fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        self.find_user_where("user_email", email)
    }

    fn find_user_by_login(&self, login: &str) -> Result<Option<UserRecord>> {
        self.find_user_where("user_login", login)
    }

    fn insert_user(&self, user: &NewUser) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {} (user_login, user_nicename, user_email, user_url, user_registered, display_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            self.table(USERS)
        );
        self.connection
            .execute(
                &sql,
                params![
                    user.user_login,
                    user.user_nicename,
                    user.user_email,
                    user.user_url,
                    user.user_registered,
                    user.display_name,
                ],
            )
            .with_context(|| format!("failed to insert user `{}`", user.user_login))?;
        Ok(self.connection.last_insert_rowid())
    }

    fn set_user_meta(&self, user_id: i64, key: &str, value: &str) -> Result<i64> {
        let table = self.table(USERMETA);
        let existing: Option<i64> = self
            .connection
            .query_row(
                &format!("SELECT umeta_id FROM {table} WHERE user_id = ?1 AND meta_key = ?2 ORDER BY umeta_id LIMIT 1"),
                params![user_id, key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read user meta `{key}` for user {user_id}"))?;

        match existing {
            Some(umeta_id) => {
                self.connection
                    .execute(
                        &format!("UPDATE {table} SET meta_value = ?1 WHERE umeta_id = ?2"),
                        params![value, umeta_id],
                    )
                    .with_context(|| format!("failed to update user meta `{key}` for user {user_id}"))?;
                Ok(umeta_id)
            }
            None => {
                self.connection
                    .execute(
                        &format!("INSERT INTO {table} (user_id, meta_key, meta_value) VALUES (?1, ?2, ?3)"),
                        params![user_id, key, value],
                    )
                    .with_context(|| format!("failed to insert user meta `{key}` for user {user_id}"))?;
                Ok(self.connection.last_insert_rowid())
            }
        }
    }

    fn find_post(&self, post_id: i64) -> Result<Option<PostRecord>> {
        let sql = format!(
            "SELECT ID, post_author, post_title, post_content, post_status, post_name, post_type
             FROM {} WHERE ID = ?1",
            self.table(POSTS)
        );
        self.connection
            .query_row(&sql, [post_id], |row| {
                Ok(PostRecord {
                    id: row.get(0)?,
                    post_author: row.get(1)?,
                    post_title: row.get(2)?,
                    post_content: row.get(3)?,
                    post_status: row.get(4)?,
                    post_name: row.get(5)?,
                    post_type: row.get(6)?,
                })
            })
            .optional()
            .with_context(|| format!("failed to load post {post_id}"))
    }

    fn insert_post(&self, post: &NewPost) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {} (post_author, post_date, post_content, post_title, post_excerpt, post_status, post_name, post_modified, post_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?2, ?8)",
            self.table(POSTS)
        );
        self.connection
            .execute(
                &sql,
                params![
                    post.post_author,
                    post.post_date,
                    post.post_content,
                    post.post_title,
                    post.post_excerpt,
                    post.post_status,
                    post.post_name,
                    post.post_type,
                ],
            )
            .with_context(|| format!("failed to insert post `{}`", post.post_title))?;
        Ok(self.connection.last_insert_rowid())
    }

    fn update_post_author(&self, post_id: i64, author_id: i64) -> Result<()> {
        self.update_post_column(post_id, "post_author", &author_id)
    }

    fn update_post_type(&self, post_id: i64, post_type: &str) -> Result<()> {
        self.update_post_column(post_id, "post_type", &post_type)
    }

    fn update_post_content(&self, post_id: i64, content: &str) -> Result<()> {
        self.update_post_column(post_id, "post_content", &content)
    }

    fn add_post_meta(&self, post_id: i64, key: &str, value: &str) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {} (post_id, meta_key, meta_value) VALUES (?1, ?2, ?3)",
            self.table(POSTMETA)
        );
        self.connection
            .execute(&sql, params![post_id, key, value])
            .with_context(|| format!("failed to insert post meta `{key}` for post {post_id}"))?;
        Ok(self.connection.last_insert_rowid())
    }
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        user_login: row.get(1)?,
        user_email: row.get(2)?,
        display_name: row.get(3)?,
    })
}

fn unix_now() -> Result<i64> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")?
        .as_secs();
    i64::try_from(seconds).context("timestamp does not fit into i64")
}

/// WordPress stores datetimes as `YYYY-MM-DD HH:MM:SS` text.
pub fn wordpress_now() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct RepositoryStats {
    pub table_prefix: String,
    pub users: usize,
    pub usermeta: usize,
    pub posts: usize,
    pub postmeta: usize,
    pub posts_by_type: BTreeMap<String, usize>,
}

/// Row counts for the content tables, or `None` when the database or tables are absent.
pub fn load_repository_stats(
    paths: &ResolvedPaths,
    table_prefix: &str,
) -> Result<Option<RepositoryStats>> {
    if !paths.db_path.exists() {
        return Ok(None);
    }
    let connection = open_connection(&paths.db_path)?;
    let posts_table = format!("{table_prefix}{POSTS}");
    if !table_exists(&connection, &posts_table)? {
        return Ok(None);
    }

    let mut posts_by_type = BTreeMap::new();
    let mut statement = connection
        .prepare(&format!(
            "SELECT post_type, COUNT(*) FROM {posts_table} GROUP BY post_type ORDER BY post_type"
        ))
        .context("failed to prepare post type counts")?;
    let rows = statement
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .context("failed to query post type counts")?;
    for row in rows {
        let (post_type, count) = row.context("failed to read post type count")?;
        posts_by_type.insert(post_type, usize::try_from(count).unwrap_or(0));
    }

    Ok(Some(RepositoryStats {
        table_prefix: table_prefix.to_string(),
        users: count_rows(&connection, &format!("{table_prefix}{USERS}"))?,
        usermeta: count_rows(&connection, &format!("{table_prefix}{USERMETA}"))?,
        posts: count_rows(&connection, &posts_table)?,
        postmeta: count_rows(&connection, &format!("{table_prefix}{POSTMETA}"))?,
        posts_by_type,
    }))
}

fn count_rows(connection: &Connection, table: &str) -> Result<usize> {
    let count: i64 = connection
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .with_context(|| format!("failed to count rows in {table}"))?;
    usize::try_from(count).context("row count does not fit into usize")
}

fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to inspect sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

#[cfg(test)]
pub(crate) fn test_repository(root: &std::path::Path) -> (ResolvedPaths, SqliteRepository) {
    let paths = crate::runtime::test_paths(root);
    crate::schema::run_migrations(&paths, "wp_").expect("run migrations");
    let repository = SqliteRepository::open(&paths, "wp_").expect("open repository");
    (paths, repository)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn sample_user(login: &str, email: &str) -> NewUser {
        NewUser {
            user_login: login.to_string(),
            user_nicename: login.to_string(),
            user_email: email.to_string(),
            display_name: login.to_string(),
            user_registered: wordpress_now(),
            ..NewUser::default()
        }
    }

    fn sample_post(title: &str) -> NewPost {
        NewPost {
            post_title: title.to_string(),
            post_content: "body".to_string(),
            post_status: "publish".to_string(),
            post_type: "post".to_string(),
            post_date: wordpress_now(),
            ..NewPost::default()
        }
    }

    #[test]
    fn open_requires_existing_database() {
        let temp = tempdir().expect("tempdir");
        let paths = crate::runtime::test_paths(temp.path());
        let err = SqliteRepository::open(&paths, "wp_")
            .err()
            .expect("must fail");
        assert!(err.to_string().contains("wpmigrate db migrate"));
    }

    #[test]
    fn users_are_found_case_insensitively() {
        let temp = tempdir().expect("tempdir");
        let (_paths, repository) = test_repository(temp.path());
        let id = repository
            .insert_user(&sample_user("alice", "Alice@Example.com"))
            .expect("insert");

        let by_email = repository
            .find_user_by_email("alice@example.com")
            .expect("lookup")
            .expect("found");
        assert_eq!(by_email.id, id);
        assert!(repository.find_user_by_login("ALICE").expect("lookup").is_some());
        assert!(repository.find_user_by_login("bob").expect("lookup").is_none());
    }

    #[test]
    fn set_user_meta_updates_existing_key() {
        let temp = tempdir().expect("tempdir");
        let (_paths, repository) = test_repository(temp.path());
        let user_id = repository
            .insert_user(&sample_user("alice", "a@example.com"))
            .expect("insert");
        let first = repository
            .set_user_meta(user_id, "first_name", "Al")
            .expect("insert meta");
        let second = repository
            .set_user_meta(user_id, "first_name", "Alice")
            .expect("update meta");
        assert_eq!(first, second);
    }

    #[test]
    fn rollback_discards_unit_writes() {
        let temp = tempdir().expect("tempdir");
        let (paths, repository) = test_repository(temp.path());

        repository.begin_unit().expect("begin");
        repository
            .insert_user(&sample_user("ghost", "ghost@example.com"))
            .expect("insert");
        repository.rollback_unit().expect("rollback");

        repository.begin_unit().expect("begin");
        repository.insert_post(&sample_post("Kept")).expect("insert post");
        repository.commit_unit().expect("commit");

        let stats = load_repository_stats(&paths, "wp_")
            .expect("stats")
            .expect("tables exist");
        assert_eq!(stats.users, 0);
        assert_eq!(stats.posts, 1);
        assert_eq!(stats.posts_by_type.get("post"), Some(&1));
    }

    #[test]
    fn post_updates_fail_for_missing_post() {
        let temp = tempdir().expect("tempdir");
        let (_paths, repository) = test_repository(temp.path());
        let post_id = repository.insert_post(&sample_post("Alpha")).expect("insert");

        repository.update_post_type(post_id, "page").expect("update type");
        repository
            .update_post_content(post_id, "new body")
            .expect("update content");
        repository.update_post_author(post_id, 4).expect("update author");
        let post = repository.find_post(post_id).expect("load").expect("exists");
        assert_eq!(post.post_type, "page");
        assert_eq!(post.post_content, "new body");
        assert_eq!(post.post_author, 4);

        let err = repository
            .update_post_type(post_id + 100, "post")
            .expect_err("must fail");
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn stats_are_none_without_database() {
        let temp = tempdir().expect("tempdir");
        let paths = crate::runtime::test_paths(temp.path());
        assert!(load_repository_stats(&paths, "wp_").expect("stats").is_none());
    }

    #[test]
    fn markers_roll_back_with_their_unit() {
        let temp = tempdir().expect("tempdir");
        let (_paths, repository) = test_repository(temp.path());
        let sources = vec![SourceAnnotation {
            table: "wp_posts".to_string(),
            column: "ID".to_string(),
            id: 7,
            source_field: "title".to_string(),
        }];

        repository.begin_unit().expect("begin");
        repository
            .record_marker("titles", "/in.json", "1", &sources)
            .expect("record");
        repository.rollback_unit().expect("rollback");
        assert!(repository
            .committed_markers("titles", "/in.json")
            .expect("markers")
            .is_empty());

        repository.begin_unit().expect("begin");
        repository
            .record_marker("titles", "/in.json", "1", &sources)
            .expect("record");
        repository.commit_unit().expect("commit");
        let markers = repository
            .committed_markers("titles", "/in.json")
            .expect("markers");
        assert_eq!(markers.get("1"), Some(&sources));
        assert!(repository
            .committed_markers("titles", "/other.json")
            .expect("markers")
            .is_empty());

        assert!(repository
            .record_marker("titles", "/in.json", "1", &sources)
            .is_err());
        assert_eq!(
            repository
                .clear_markers("titles", "/in.json", Some("1"))
                .expect("clear"),
            1
        );
        assert_eq!(
            repository.clear_markers("titles", "/in.json", None).expect("clear"),
            0
        );
    }

    #[test]
    fn rollback_pass_discards_committed_units() {
        let temp = tempdir().expect("tempdir");
        let (paths, repository) = test_repository(temp.path());

        repository.begin_pass().expect("begin pass");
        for title in ["One", "Two"] {
            repository.begin_unit().expect("begin");
            repository.insert_post(&sample_post(title)).expect("insert post");
            repository.commit_unit().expect("commit");
        }
        assert!(repository.find_post(2).expect("load").is_some());
        repository.rollback_pass().expect("rollback pass");

        repository.begin_unit().expect("begin");
        repository.insert_post(&sample_post("Three")).expect("insert post");
        repository.commit_unit().expect("commit");
        let stats = load_repository_stats(&paths, "wp_")
            .expect("stats")
            .expect("tables exist");
        assert_eq!(stats.posts, 1);
    }
}
