//! Shadow build orchestration for app preview pipelines.
//!
//! Classifies incoming change sets into urgency tiers, schedules them
//! across a pool of warm build runners, and publishes content-addressed
//! artifacts so unchanged code is never compiled twice.

pub mod api;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod persist;
pub mod pool;
pub mod publisher;
pub mod scheduler;
pub mod shutdown;
pub mod sla;
