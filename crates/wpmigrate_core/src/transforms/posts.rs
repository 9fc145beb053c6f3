use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;

use crate::object::MigrationObject;
use crate::repository::{ContentRepository, NewPost, POSTMETA, POSTS, wordpress_now};
use crate::run::{Transform, TransformOutcome};

const WORDPRESS_DATETIME: &str = "%Y-%m-%d %H:%M:%S";
pub(crate) const SOURCE_ID_META_KEY: &str = "_migration_source_id";

/// Creates one post per exported record, keeping the export id in postmeta.
pub struct PostImport<'r, R: ContentRepository + ?Sized> {
    repository: &'r R,
}

impl<'r, R: ContentRepository + ?Sized> PostImport<'r, R> {
    pub fn new(repository: &'r R) -> Self {
        Self { repository }
    }

    fn resolve_author(&self, object: &MigrationObject) -> Result<i64> {
        let Some(email) = object.get_str("author_email") else {
            return Ok(0);
        };
        let user = self
            .repository
            .find_user_by_email(email)?
            .ok_or_else(|| anyhow!("object {}: no user with email {email}", object.id()))?;
        Ok(user.id)
    }
}

impl<R: ContentRepository + ?Sized> Transform for PostImport<'_, R> {
    fn name(&self) -> &str {
        "post-import"
    }

    fn transform(&mut self, object: &mut MigrationObject) -> Result<TransformOutcome> {
        let title = object.require_str("post_title")?.to_string();
        let post_author = self.resolve_author(object)?;
        let post_date = match object.get_str("post_date") {
            Some(value) => normalize_post_date(value)
                .with_context(|| format!("object {} has an invalid post_date", object.id()))?,
            None => wordpress_now(),
        };
        let post_name = match object.get_str("post_name") {
            Some(slug) => slugify(slug),
            None => slugify(&title),
        };
        let meta = collect_meta(object)?;

        let post = NewPost {
            post_author,
            post_date,
            post_content: raw_text(object, "post_content"),
            post_title: title.clone(),
            post_excerpt: raw_text(object, "post_excerpt"),
            post_status: object
                .get_str("post_status")
                .unwrap_or("publish")
                .to_string(),
            post_name,
            post_type: object.get_str("post_type").unwrap_or("post").to_string(),
        };
        let post_id = self.repository.insert_post(&post)?;

        let posts_table = self.repository.table(POSTS);
        let postmeta_table = self.repository.table(POSTMETA);
        object.record_source(&posts_table, "ID", post_id, "post_title");
        let mut outcome = TransformOutcome::new()
            .produced(&posts_table, post_id)
            .with_detail(format!("{} {post_id} `{title}`", post.post_type));

        let source_id = object.id().to_string();
        let meta_id = self
            .repository
            .add_post_meta(post_id, SOURCE_ID_META_KEY, &source_id)?;
        object.record_source(&postmeta_table, "meta_id", meta_id, "object_id");
        outcome = outcome.produced(&postmeta_table, meta_id);

        for (key, value) in meta {
            let meta_id = self.repository.add_post_meta(post_id, &key, &value)?;
            object.record_source(&postmeta_table, "meta_id", meta_id, format!("meta.{key}"));
            outcome = outcome.produced(&postmeta_table, meta_id);
        }

        Ok(outcome)
    }
}

// Content keeps its whitespace, unlike the trimmed accessors.
fn raw_text(object: &MigrationObject, field: &str) -> String {
    object
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn collect_meta(object: &MigrationObject) -> Result<Vec<(String, String)>> {
    let Some(value) = object.get("meta") else {
        return Ok(Vec::new());
    };
    let Value::Object(entries) = value else {
        bail!("object {}: `meta` must be a JSON object", object.id());
    };
    let mut out = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        if key.trim().is_empty() {
            bail!("object {}: `meta` contains an empty key", object.id());
        }
        let rendered = match value {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        out.push((key.trim().to_string(), rendered));
    }
    Ok(out)
}

/// Accepts WordPress `YYYY-MM-DD HH:MM:SS` or RFC 3339 (wall-clock time is kept).
fn normalize_post_date(value: &str) -> Result<String> {
    if let Ok(parsed) = NaiveDateTime::parse_from_str(value, WORDPRESS_DATETIME) {
        return Ok(parsed.format(WORDPRESS_DATETIME).to_string());
    }
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("`{value}` is neither `YYYY-MM-DD HH:MM:SS` nor RFC 3339"))?;
    Ok(parsed.naive_local().format(WORDPRESS_DATETIME).to_string())
}

/// Lowercase ASCII slug with single dashes between words.
pub(crate) fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_dash = false;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else if ch == '_' || ch == '-' || ch.is_whitespace() || ch.is_ascii_punctuation() {
            pending_dash = true;
        }
    }
    slug
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::repository::{NewUser, test_repository};
    use crate::run::verify_provenance;

    fn object(id: &str, value: Value) -> MigrationObject {
        let Value::Object(fields) = value else {
            panic!("fixture must be an object");
        };
        MigrationObject::new(id, 1, fields)
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Hello, World!"), "hello-world");
        assert_eq!(slugify("  Über  cool -- post_2 "), "ber-cool-post-2");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn post_dates_are_normalized() {
        assert_eq!(
            normalize_post_date("2019-04-01 08:30:00").expect("wp format"),
            "2019-04-01 08:30:00"
        );
        assert_eq!(
            normalize_post_date("2019-04-01T08:30:00+02:00").expect("rfc3339"),
            "2019-04-01 08:30:00"
        );
        assert!(normalize_post_date("April 1st").is_err());
    }

    #[test]
    fn import_inserts_post_with_meta_and_author() {
        let temp = tempdir().expect("tempdir");
        let (_paths, repository) = test_repository(temp.path());
        let author_id = repository
            .insert_user(&NewUser {
                user_login: "ed".to_string(),
                user_email: "ed@example.com".to_string(),
                ..NewUser::default()
            })
            .expect("insert user");

        let mut transform = PostImport::new(&repository);
        let mut item = object(
            "legacy-17",
            json!({
                "post_title": "Budget vote delayed",
                "post_content": "<p>Council met.</p>\n",
                "author_email": "ED@example.com",
                "post_date": "2020-02-03 10:00:00",
                "meta": {"legacy_section": "city", "legacy_rank": 3}
            }),
        );

        let outcome = transform.transform(&mut item).expect("transform");
        verify_provenance(&item, &outcome).expect("provenance");
        let post_id = outcome.produced[0].id;
        let post = repository.find_post(post_id).expect("load").expect("exists");
        assert_eq!(post.post_author, author_id);
        assert_eq!(post.post_name, "budget-vote-delayed");
        assert_eq!(post.post_content, "<p>Council met.</p>\n");
        assert_eq!(post.post_type, "post");
        assert_eq!(post.post_status, "publish");
        // source id + two meta entries
        assert_eq!(outcome.produced.len(), 4);
        assert!(item
            .sources()
            .iter()
            .any(|source| source.source_field == "meta.legacy_rank"));
    }

    #[test]
    fn unknown_author_is_an_error() {
        let temp = tempdir().expect("tempdir");
        let (_paths, repository) = test_repository(temp.path());
        let mut transform = PostImport::new(&repository);
        let mut item = object(
            "1",
            json!({"post_title": "Orphan", "author_email": "nobody@example.com"}),
        );
        let err = transform.transform(&mut item).expect_err("must fail");
        assert!(err.to_string().contains("no user with email"));
    }

    #[test]
    fn meta_must_be_an_object() {
        let temp = tempdir().expect("tempdir");
        let (_paths, repository) = test_repository(temp.path());
        let mut transform = PostImport::new(&repository);
        let mut item = object("1", json!({"post_title": "Bad meta", "meta": ["x"]}));
        let err = transform.transform(&mut item).expect_err("must fail");
        assert!(err.to_string().contains("`meta` must be a JSON object"));
    }
}
