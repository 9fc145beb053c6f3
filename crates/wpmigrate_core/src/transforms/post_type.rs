use anyhow::{Result, anyhow, bail};

use crate::object::MigrationObject;
use crate::repository::{ContentRepository, POSTMETA, POSTS};
use crate::run::{Transform, TransformOutcome};

const PREVIOUS_TYPE_META_KEY: &str = "_migrated_from_post_type";

pub struct PostTypeConversion<'r, R: ContentRepository + ?Sized> {
    repository: &'r R,
    to: String,
    from: Option<String>,
}

impl<'r, R: ContentRepository + ?Sized> PostTypeConversion<'r, R> {
    /// `from`, when set, guards against converting posts of an unexpected type.
    pub fn new(repository: &'r R, to: &str, from: Option<&str>) -> Result<Self> {
        let to = to.trim();
        if to.is_empty() {
            bail!("target post type must not be empty");
        }
        Ok(Self {
            repository,
            to: to.to_string(),
            from: from
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
        })
    }
}

impl<R: ContentRepository + ?Sized> Transform for PostTypeConversion<'_, R> {
    fn name(&self) -> &str {
        "post-type-conversion"
    }

    fn transform(&mut self, object: &mut MigrationObject) -> Result<TransformOutcome> {
        let post_id = object.require_i64("post_id")?;
        let post = self
            .repository
            .find_post(post_id)?
            .ok_or_else(|| anyhow!("object {}: post {post_id} does not exist", object.id()))?;

        if post.post_type == self.to {
            return Ok(TransformOutcome::unchanged(format!(
                "post {post_id} is already `{}`",
                self.to
            )));
        }
        if let Some(from) = &self.from {
            if &post.post_type != from {
                bail!(
                    "post {post_id} has type `{}`, expected `{from}`",
                    post.post_type
                );
            }
        }

        self.repository.update_post_type(post_id, &self.to)?;
        let meta_id =
            self.repository
                .add_post_meta(post_id, PREVIOUS_TYPE_META_KEY, &post.post_type)?;

        let posts_table = self.repository.table(POSTS);
        let postmeta_table = self.repository.table(POSTMETA);
        object.record_source(&posts_table, "post_type", post_id, "post_id");
        object.record_source(&postmeta_table, "meta_id", meta_id, "post_id");

        Ok(TransformOutcome::new()
            .produced(posts_table, post_id)
            .produced(postmeta_table, meta_id)
            .with_detail(format!(
                "post {post_id}: `{}` -> `{}`",
                post.post_type, self.to
            )))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use tempfile::tempdir;

    use super::*;
    use crate::repository::{NewPost, test_repository};
    use crate::run::verify_provenance;

    fn object(value: Value) -> MigrationObject {
        let Value::Object(fields) = value else {
            panic!("fixture must be an object");
        };
        MigrationObject::new("1", 1, fields)
    }

    fn seed(repository: &impl ContentRepository, post_type: &str) -> i64 {
        repository
            .insert_post(&NewPost {
                post_title: "Item".to_string(),
                post_status: "publish".to_string(),
                post_type: post_type.to_string(),
                ..NewPost::default()
            })
            .expect("insert post")
    }

    #[test]
    fn empty_target_type_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let (_paths, repository) = test_repository(temp.path());
        assert!(PostTypeConversion::new(&repository, "  ", None).is_err());
    }

    #[test]
    fn converts_and_remembers_previous_type() {
        let temp = tempdir().expect("tempdir");
        let (_paths, repository) = test_repository(temp.path());
        let post_id = seed(&repository, "post");

        let mut transform =
            PostTypeConversion::new(&repository, "event", Some("post")).expect("transform");
        let mut item = object(json!({"post_id": post_id}));
        let outcome = transform.transform(&mut item).expect("convert");
        verify_provenance(&item, &outcome).expect("provenance");

        let post = repository.find_post(post_id).expect("load").expect("exists");
        assert_eq!(post.post_type, "event");

        let again = transform.transform(&mut object(json!({"post_id": post_id}))).expect("no-op");
        assert!(again.produced.is_empty());
    }

    #[test]
    fn unexpected_source_type_fails() {
        let temp = tempdir().expect("tempdir");
        let (_paths, repository) = test_repository(temp.path());
        let post_id = seed(&repository, "page");

        let mut transform =
            PostTypeConversion::new(&repository, "event", Some("post")).expect("transform");
        let err = transform
            .transform(&mut object(json!({"post_id": post_id})))
            .expect_err("must fail");
        assert!(err.to_string().contains("expected `post`"));
    }
}
