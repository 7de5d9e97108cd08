pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod orgs;
pub mod rate_limit;
pub mod reaper;
pub mod repo;
pub mod routes;
pub mod schema;
pub mod state;
pub mod storage;
pub mod tasks;
pub mod uploads;
pub mod utils;
