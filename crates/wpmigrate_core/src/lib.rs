pub mod config;
pub mod ledger;
pub mod object;
pub mod repository;
pub mod run;
pub mod runtime;
pub mod schema;
pub mod source;
pub mod transforms;
