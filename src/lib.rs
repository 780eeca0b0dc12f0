//! # clp
//!
//! A local, multi-tenant reverse proxy core for AI chat/completion APIs.
//! Three independent HTTP services — Claude (Anthropic Messages), Codex
//! (OpenAI Responses), and Legacy (OpenAI Chat Completions) — front a pool
//! of upstream credentials each, sharing one request pipeline:
//!
//! 1. Select an upstream (active-first or weighted, with failure-based exclusion)
//! 2. Transform the request (model rewriting, family-specific body backfill, redaction)
//! 3. Admit it through a per-upstream rate limiter
//! 4. Forward and stream the response back, synthesizing SSE when the
//!    upstream can't stream what the client asked for
//! 5. Record the request and its usage to a per-family log
//!
//! ## Architecture
//!
//! Each family binary (`clp-claude`, `clp-codex`, `clp-legacy`) loads the
//! same [`config::ConfigStore`] from `~/.clp/`, builds a [`pipeline::Pipeline`]
//! wired to its own [`families::FamilyAdapter`], and serves it behind
//! [`app::build_router`]. `clp-admin` is an operator CLI for out-of-band
//! maintenance (clearing a failure exclusion, wiping a log) that talks to
//! the same config documents.

pub mod app;
pub mod config;
pub mod error;
pub mod families;
pub mod filter;
pub mod log;
pub mod pipeline;
pub mod rate_limit;
pub mod sse;
pub mod streaming;
pub mod upstream;
pub mod usage;

pub use config::{ConfigStore, SharedConfigStore};
pub use error::{PipelineError, PipelineResult};
