use std::collections::HashMap;

use anyhow::{Context, Result, anyhow};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use similar::TextDiff;

use crate::object::MigrationObject;
use crate::repository::{ContentRepository, POSTS};
use crate::run::{Transform, TransformOutcome};

const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Unified diff of one rewritten post body.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ContentPreview {
    pub object_id: String,
    pub post_id: i64,
    pub replacements: usize,
    pub diff: String,
}

/// Search-and-replace over `post_content`. Each object names a post, a `find`
/// pattern and its `replace` text; `regex: true` switches to regex syntax with
/// `$1`-style captures.
pub struct ContentRewrite<'r, R: ContentRepository + ?Sized> {
    repository: &'r R,
    compiled: HashMap<(String, bool), Regex>,
    previews: Vec<ContentPreview>,
}

impl<'r, R: ContentRepository + ?Sized> ContentRewrite<'r, R> {
    pub fn new(repository: &'r R) -> Self {
        Self {
            repository,
            compiled: HashMap::new(),
            previews: Vec::new(),
        }
    }

    pub fn previews(&self) -> &[ContentPreview] {
        &self.previews
    }

    fn regex_for(&mut self, pattern: &str, case_insensitive: bool) -> Result<&Regex> {
        let key = (pattern.to_string(), case_insensitive);
        if !self.compiled.contains_key(&key) {
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(case_insensitive)
                .size_limit(REGEX_SIZE_LIMIT)
                .build()
                .with_context(|| format!("invalid regex `{pattern}`"))?;
            self.compiled.insert(key.clone(), regex);
        }
        self.compiled
            .get(&key)
            .ok_or_else(|| anyhow!("regex cache lost `{pattern}`"))
    }
}

impl<R: ContentRepository + ?Sized> Transform for ContentRewrite<'_, R> {
    fn name(&self) -> &str {
        "content-rewrite"
    }

    fn transform(&mut self, object: &mut MigrationObject) -> Result<TransformOutcome> {
        let post_id = object.require_i64("post_id")?;
        // `find` is matched verbatim; only absence or emptiness is an error.
        let find = object
            .get("find")
            .and_then(|value| value.as_str())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("object {} is missing required field `find`", object.id()))?
            .to_string();
        // An explicit empty `replace` deletes matches; a missing one is an error.
        let replace = object
            .get("replace")
            .and_then(|value| value.as_str())
            .ok_or_else(|| {
                anyhow!(
                    "object {} is missing required string field `replace`",
                    object.id()
                )
            })?
            .to_string();
        let use_regex = object.get_bool("regex")?.unwrap_or(false);
        let case_insensitive = object.get_bool("case_insensitive")?.unwrap_or(false);

        let post = self
            .repository
            .find_post(post_id)?
            .ok_or_else(|| anyhow!("object {}: post {post_id} does not exist", object.id()))?;

        let (rewritten, replacements) = if use_regex {
            let matcher = self.regex_for(&find, case_insensitive)?;
            let count = matcher.find_iter(&post.post_content).count();
            let rewritten = matcher
                .replace_all(&post.post_content, replace.as_str())
                .into_owned();
            (rewritten, count)
        } else if case_insensitive {
            let matcher = self.regex_for(&regex::escape(&find), true)?;
            let count = matcher.find_iter(&post.post_content).count();
            let rewritten = matcher
                .replace_all(&post.post_content, regex::NoExpand(&replace))
                .into_owned();
            (rewritten, count)
        } else {
            let count = post.post_content.matches(find.as_str()).count();
            (post.post_content.replace(find.as_str(), &replace), count)
        };

        if replacements == 0 || rewritten == post.post_content {
            return Ok(TransformOutcome::unchanged(format!(
                "post {post_id}: no match for `{find}`"
            )));
        }

        self.repository.update_post_content(post_id, &rewritten)?;
        let posts_table = self.repository.table(POSTS);
        object.record_source(&posts_table, "post_content", post_id, "find");

        let old_header = format!("post {post_id}");
        let new_header = format!("post {post_id} (rewritten)");
        let diff = TextDiff::from_lines(&post.post_content, &rewritten)
            .unified_diff()
            .context_radius(2)
            .header(&old_header, &new_header)
            .to_string();
        self.previews.push(ContentPreview {
            object_id: object.id().to_string(),
            post_id,
            replacements,
            diff,
        });

        Ok(TransformOutcome::new()
            .produced(posts_table, post_id)
            .with_detail(format!("post {post_id}: {replacements} replacement(s)")))
    }
}
