pub mod batch;
pub mod catalog;
pub mod config;
pub mod create;
pub mod executors;
pub mod plan;
pub mod progress;
pub mod scheduler;
pub mod tiles;
