//! Core types and trait definitions for brandspark.
//!
//! This crate is deliberately free of HTTP and database dependencies.
//! The storage backend, the analysis engine, the orchestrator and the API all
//! meet at the two traits defined here: [`gateway::Gateway`] and
//! [`engine::AnalysisEngine`].

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod engine;
pub mod error;
pub mod gateway;
pub mod job;
pub mod session;

pub use error::{Error, Result};
