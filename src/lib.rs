//! LaForge: a long-running coding-agent harness.
//!
//! The harness repeatedly invokes an external LLM-driven coding tool
//! inside an isolated, ephemeral workspace, captures its effects on a
//! source repository and a task database, commits accepted changes, and
//! exposes progress and pending human-review requests through a live API.
//!
//! Core pieces:
//! - [`step`]: the single-step execution engine and history rollback
//! - [`store`]: the per-project task and step stores with their invariants
//! - [`repo`] / [`container`]: narrow adapters over git and Docker
//! - [`agent`]: named invocation profiles and token-usage extraction
//! - [`api`] / [`events`]: the projection service and live-update fan-out
//! - [`plan`]: plan-document ingestion behind the review gate

pub mod agent;
pub mod api;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod logging;
pub mod plan;
pub mod project;
pub mod repo;
pub mod step;
pub mod store;
