pub mod anchor;
pub mod config;
pub mod detect;
pub mod genealogy;
pub mod history;
pub mod index;
pub mod pipeline;
pub mod query;
pub mod vcs;
