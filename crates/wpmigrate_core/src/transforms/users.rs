use anyhow::{Result, bail};

use crate::object::MigrationObject;
use crate::repository::{ContentRepository, NewUser, USERMETA, USERS, wordpress_now};
use crate::run::{Transform, TransformOutcome};

const MAX_LOGIN_SUFFIX: usize = 1000;

/// Creates one user per record. The login is derived from the email's local part.
pub struct UserImport<'r, R: ContentRepository + ?Sized> {
    repository: &'r R,
    default_role: String,
}

impl<'r, R: ContentRepository + ?Sized> UserImport<'r, R> {
    pub fn new(repository: &'r R, default_role: impl Into<String>) -> Self {
        Self {
            repository,
            default_role: default_role.into(),
        }
    }

    fn unique_login(&self, base: &str) -> Result<String> {
        if self.repository.find_user_by_login(base)?.is_none() {
            return Ok(base.to_string());
        }
        for suffix in 2..=MAX_LOGIN_SUFFIX {
            let candidate = format!("{base}{suffix}");
            if self.repository.find_user_by_login(&candidate)?.is_none() {
                return Ok(candidate);
            }
        }
        bail!("no free login left for `{base}`")
    }
}

impl<R: ContentRepository + ?Sized> Transform for UserImport<'_, R> {
    fn name(&self) -> &str {
        "user-import"
    }

    fn transform(&mut self, object: &mut MigrationObject) -> Result<TransformOutcome> {
        let (email, email_field) = resolve_email(object)?;
        let email = email.to_string();

        if let Some(existing) = self.repository.find_user_by_email(&email)? {
            bail!(
                "duplicate email {email}: already used by user {} ({})",
                existing.id,
                existing.user_login
            );
        }

        let login = self.unique_login(&login_from_email(&email)?)?;
        let first_name = object.get_str("first_name").map(str::to_string);
        let last_name = object.get_str("last_name").map(str::to_string);
        let display_name = object
            .get_str("display_name")
            .map(str::to_string)
            .or_else(|| {
                let joined = [first_name.as_deref(), last_name.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" ");
                (!joined.is_empty()).then_some(joined)
            })
            .unwrap_or_else(|| login.clone());
        let role = object
            .get_str("role")
            .unwrap_or(self.default_role.as_str())
            .to_string();

        let user_id = self.repository.insert_user(&NewUser {
            user_nicename: login.replace('.', "-"),
            user_login: login.clone(),
            user_email: email.clone(),
            user_url: object.get_str("user_url").unwrap_or_default().to_string(),
            user_registered: object
                .get_str("user_registered")
                .map(str::to_string)
                .unwrap_or_else(wordpress_now),
            display_name,
        })?;

        let users_table = self.repository.table(USERS);
        let usermeta_table = self.repository.table(USERMETA);
        object.record_source(&users_table, "ID", user_id, email_field);
        let mut outcome = TransformOutcome::new()
            .produced(&users_table, user_id)
            .with_detail(format!("user {login} (ID {user_id})"));

        let mut meta: Vec<(String, String, &str)> = vec![
            ("nickname".to_string(), login.clone(), email_field),
            (
                self.repository.table("capabilities"),
                serialize_role(&role),
                "role",
            ),
        ];
        if let Some(first_name) = first_name {
            meta.push(("first_name".to_string(), first_name, "first_name"));
        }
        if let Some(last_name) = last_name {
            meta.push(("last_name".to_string(), last_name, "last_name"));
        }

        for (key, value, source_field) in meta {
            let umeta_id = self.repository.set_user_meta(user_id, &key, &value)?;
            object.record_source(&usermeta_table, "umeta_id", umeta_id, source_field);
            outcome = outcome.produced(&usermeta_table, umeta_id);
        }

        Ok(outcome)
    }
}

/// `user_email` wins; otherwise `user_login` is used when it holds an email.
fn resolve_email(object: &MigrationObject) -> Result<(&str, &'static str)> {
    if let Some(email) = object.get_str("user_email") {
        if is_plausible_email(email) {
            return Ok((email, "user_email"));
        }
        bail!("object {} has malformed user_email `{email}`", object.id());
    }
    if let Some(login) = object.get_str("user_login") {
        if is_plausible_email(login) {
            return Ok((login, "user_login"));
        }
    }
    bail!(
        "object {} has no usable email in `user_email` or `user_login`",
        object.id()
    )
}

fn is_plausible_email(value: &str) -> bool {
    let mut parts = value.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !value.chars().any(char::is_whitespace)
        }
        _ => false,
    }
}

/// Lowercased local part of `email`, restricted to `[a-z0-9._-]`.
pub fn login_from_email(email: &str) -> Result<String> {
    let local = email.split('@').next().unwrap_or_default();
    let login: String = local
        .to_ascii_lowercase()
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(*ch, '.' | '_' | '-'))
        .collect();
    let login = login.trim_matches(|ch| matches!(ch, '.' | '-')).to_string();
    if login.is_empty() {
        bail!("cannot derive a login from `{email}`");
    }
    Ok(login)
}

// PHP-serialized capability map, as WordPress stores it in usermeta.
fn serialize_role(role: &str) -> String {
    format!("a:1:{{s:{}:\"{role}\";b:1;}}", role.len())
}
