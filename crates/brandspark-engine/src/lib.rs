//! The brandspark analysis engine.
//!
//! A prompt flows through a [`StageGraph`] of named stages. Each stage
//! renders its instruction against the named result slots produced so far,
//! asks a [`TextGenerator`] for text, and stores the answer in its own slot.
//! The final event carries the graph's designated output slots.
//!
//! [`PipelineEngine`] implements [`brandspark_core::engine::AnalysisEngine`],
//! so the job orchestrator never sees stages, templates or models.

pub mod context;
pub mod generator;
pub mod pipeline;
pub mod stage;

pub use context::ContextStore;
pub use generator::{GeminiConfig, GeminiGenerator, RetryPolicy, TextGenerator};
pub use pipeline::PipelineEngine;
pub use stage::{GraphError, Stage, StageGraph};
