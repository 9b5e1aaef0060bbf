pub mod apply_pipeline;
pub mod backend;
pub mod build_info;
pub mod cli;
pub mod commands;
pub mod config;
pub mod db;
pub mod destinations;
pub mod diff_engine;
pub mod error;
pub mod logging;
pub mod query_builder;
pub mod repository;
pub mod scheduler;
pub mod schema_introspector;
pub mod server;
pub mod state;
pub mod sync_service;
pub mod sync_state;
pub mod types;
pub mod validator;

#[cfg(test)]
pub(crate) mod test_support;
