pub mod cli;
pub mod config;
pub mod flock;
pub mod git;
pub mod import;
pub mod manifest;
pub mod provenance;
pub mod repair;
pub mod repository;
pub mod resource;
pub mod source;
pub mod update;
pub mod workspace;

mod api;

pub use api::{Airepo, AirepoBuilder, PruneMode};
