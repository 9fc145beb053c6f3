//! Named migration strategies. Each borrows the repository it writes through
//! and is driven object by object by [`crate::run::MigrationRun`].

mod authors;
mod content;
mod post_type;
mod posts;
mod users;

pub use authors::AuthorReassignment;
pub use content::{ContentPreview, ContentRewrite};
pub use post_type::PostTypeConversion;
pub use posts::PostImport;
pub use users::{UserImport, login_from_email};
