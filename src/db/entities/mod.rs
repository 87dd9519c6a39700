//! SeaORM entity definitions.

pub mod cache_job;
pub mod file_progress;
pub mod file_record;
pub mod hub_token;
pub mod organization;
pub mod repository;
pub mod repository_tag;
pub mod speed_node;
pub mod tag;
