// AlephAuto - automation pipeline job server
//
// This crate provides the core of the AlephAuto automation server: a durable
// job queue with bounded-concurrency workers, retry with circuit breaking,
// cron scheduling, and a REST + WebSocket monitoring surface.
//
// IMPORTANT: kernel/ is infrastructure only. Pipeline handlers live in
// pipelines/ and the HTTP surface in server/.

pub mod common;
pub mod config;
pub mod kernel;
pub mod pipelines;
pub mod server;

pub use config::Config;
