pub mod config;
pub mod limits;
pub mod redis;
pub mod types;
