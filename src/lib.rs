pub mod config;
pub mod migrate;
pub mod sql;
pub mod stats;
