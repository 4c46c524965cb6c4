//! # Experience Engine - State Manager and Command Execution for Dynamic Experiences
//!
//! Experience Engine hosts "dynamic experiences": text adventures whose commands are
//! written as markdown and interpreted by a language model against a durable
//! world/player state.
//!
//! ## Features
//!
//! - **Two State Models**: `isolated` experiences clone the world template per player; `shared` experiences keep one world record plus small per-player overlays.
//! - **Markdown Commands**: `game-logic/*.md` files with YAML frontmatter define verbs and aliases; the markdown body instructs the interpreter.
//! - **Deterministic Admin Commands**: `@`-prefixed commands bypass the interpreter and run compiled handlers, with an audit trail.
//! - **Validated Writes**: every proposed mutation is checked before it is applied; invalid operations are dropped, never half-applied.
//! - **Embedded Storage**: sled-backed records with conditional create and transactional commits.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use experience_engine::config::Config;
//! use experience_engine::engine::{DisabledInterpreter, ExperienceEngine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let engine = ExperienceEngine::from_config(&config, Arc::new(DisabledInterpreter))?;
//!
//!     let reply = engine
//!         .handle_message("alice", None, "play wylding woods", false)
//!         .await;
//!     println!("{}", reply.narrative);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`engine`] - bootstrap, registry, intent resolution, execution, merge/apply and storage
//! - [`config`] - configuration loading and validation
//! - [`validation`] - identifier and path validation
//! - [`logutil`] - single-line log helpers
//! - [`metrics`] - dispatch counters
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ Intent Resolver │ ← classify: select / admin / player / unrecognized
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Execution     │ ← interpreter call or compiled admin handler
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  Merge / Apply  │ ← validate, order and commit mutations
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  State Store    │ ← sled: worlds, player views, audit
//! └─────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod logutil;
pub mod metrics;
pub mod validation;
