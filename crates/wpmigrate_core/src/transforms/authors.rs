use anyhow::{Result, anyhow, bail};

use crate::object::MigrationObject;
use crate::repository::{ContentRepository, POSTMETA, POSTS, UserRecord};
use crate::run::{Transform, TransformOutcome};

const PREVIOUS_AUTHOR_META_KEY: &str = "_migration_previous_author";

/// Points existing posts at a different author, found by email or login.
pub struct AuthorReassignment<'r, R: ContentRepository + ?Sized> {
    repository: &'r R,
}

impl<'r, R: ContentRepository + ?Sized> AuthorReassignment<'r, R> {
    pub fn new(repository: &'r R) -> Self {
        Self { repository }
    }

    fn resolve_author(&self, object: &MigrationObject) -> Result<(UserRecord, &'static str)> {
        if let Some(email) = object.get_str("author_email") {
            let user = self
                .repository
                .find_user_by_email(email)?
                .ok_or_else(|| anyhow!("object {}: no user with email {email}", object.id()))?;
            return Ok((user, "author_email"));
        }
        if let Some(login) = object.get_str("author_login") {
            let user = self
                .repository
                .find_user_by_login(login)?
                .ok_or_else(|| anyhow!("object {}: no user with login {login}", object.id()))?;
            return Ok((user, "author_login"));
        }
        bail!(
            "object {} names no author (`author_email` or `author_login`)",
            object.id()
        )
    }
}

impl<R: ContentRepository + ?Sized> Transform for AuthorReassignment<'_, R> {
    fn name(&self) -> &str {
        "author-reassignment"
    }

    fn transform(&mut self, object: &mut MigrationObject) -> Result<TransformOutcome> {
        let post_id = object.require_i64("post_id")?;
        let post = self
            .repository
            .find_post(post_id)?
            .ok_or_else(|| anyhow!("object {}: post {post_id} does not exist", object.id()))?;
        let (author, author_field) = self.resolve_author(object)?;

        if post.post_author == author.id {
            return Ok(TransformOutcome::unchanged(format!(
                "post {post_id} already belongs to {}",
                author.user_login
            )));
        }

        self.repository.update_post_author(post_id, author.id)?;
        let meta_id = self.repository.add_post_meta(
            post_id,
            PREVIOUS_AUTHOR_META_KEY,
            &post.post_author.to_string(),
        )?;

        let posts_table = self.repository.table(POSTS);
        let postmeta_table = self.repository.table(POSTMETA);
        object.record_source(&posts_table, "post_author", post_id, author_field);
        object.record_source(&postmeta_table, "meta_id", meta_id, "post_id");

        Ok(TransformOutcome::new()
            .produced(posts_table, post_id)
            .produced(postmeta_table, meta_id)
            .with_detail(format!(
                "post {post_id}: author {} -> {} ({})",
                post.post_author, author.id, author.user_login
            )))
    }
}
