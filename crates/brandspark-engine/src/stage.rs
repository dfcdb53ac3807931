//! Stages and the directed acyclic graph they form.
//!
//! A stage consumes named slots (the user `prompt`, the user's archived
//! `memory`, or another stage's output) and produces exactly one named slot.
//! Adding a step to the pipeline means adding a [`Stage`], not rewriting the
//! others.

use std::collections::{BTreeMap, HashMap, HashSet};

use minijinja::{Environment, UndefinedBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Slot holding the user's request text.
pub const PROMPT_SLOT: &str = "prompt";
/// Slot holding a digest of the user's archived conversations.
pub const MEMORY_SLOT: &str = "memory";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
  #[error("pipeline has no stages")]
  Empty,

  #[error("slot {0:?} is produced by more than one stage")]
  DuplicateOutput(String),

  #[error("slot {0:?} is reserved")]
  ReservedOutput(String),

  #[error("stage {stage:?} reads unknown slot {slot:?}")]
  UnknownInput { stage: String, slot: String },

  #[error("stage {stage:?} template references {slot:?}, which is not one of its inputs")]
  UndeclaredInput { stage: String, slot: String },

  #[error("stage {stage:?} has an invalid template: {message}")]
  Template { stage: String, message: String },

  #[error("final slot {0:?} is not produced by any stage")]
  UnknownFinal(String),

  #[error("stages form a cycle: {0:?}")]
  Cycle(Vec<String>),
}

/// One named step of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stage {
  pub name:        String,
  /// Slot this stage writes.
  pub output_key:  String,
  /// Slots this stage reads.
  pub inputs:      Vec<String>,
  /// `minijinja` template rendered against the input slots.
  pub instruction: String,
}

impl Stage {
  pub fn new(
    name: impl Into<String>,
    output_key: impl Into<String>,
    inputs: &[&str],
    instruction: impl Into<String>,
  ) -> Self {
    Self {
      name:        name.into(),
      output_key:  output_key.into(),
      inputs:      inputs.iter().map(|s| (*s).to_owned()).collect(),
      instruction: instruction.into(),
    }
  }
}

/// A validated set of stages with precomputed execution batches.
///
/// Stages within one batch do not depend on each other and may run
/// concurrently; batch `n` only reads slots written by batches `< n`.
#[derive(Debug, Clone)]
pub struct StageGraph {
  stages:      Vec<Stage>,
  batches:     Vec<Vec<usize>>,
  final_slots: Vec<String>,
}

impl StageGraph {
  /// Validate `stages` and order them. `final_slots` lists, in order, the
  /// slots whose text makes up the final answer.
  pub fn new(stages: Vec<Stage>, final_slots: Vec<String>) -> Result<Self, GraphError> {
    if stages.is_empty() {
      return Err(GraphError::Empty);
    }

    let mut producer: HashMap<&str, usize> = HashMap::new();
    for (index, stage) in stages.iter().enumerate() {
      let key = stage.output_key.as_str();
      if key == PROMPT_SLOT || key == MEMORY_SLOT {
        return Err(GraphError::ReservedOutput(key.to_owned()));
      }
      if producer.insert(key, index).is_some() {
        return Err(GraphError::DuplicateOutput(key.to_owned()));
      }
    }

    for stage in &stages {
      for slot in &stage.inputs {
        let known = slot == PROMPT_SLOT
          || slot == MEMORY_SLOT
          || producer.contains_key(slot.as_str());
        if !known {
          return Err(GraphError::UnknownInput {
            stage: stage.name.clone(),
            slot:  slot.clone(),
          });
        }
      }
      check_template(stage)?;
    }

    for slot in &final_slots {
      if !producer.contains_key(slot.as_str()) {
        return Err(GraphError::UnknownFinal(slot.clone()));
      }
    }

    let batches = batches(&stages, &producer)?;
    Ok(Self { stages, batches, final_slots })
  }

  pub fn stages(&self) -> &[Stage] { &self.stages }

  pub fn batches(&self) -> &[Vec<usize>] { &self.batches }

  pub fn final_slots(&self) -> &[String] { &self.final_slots }

  pub fn stage(&self, index: usize) -> &Stage { &self.stages[index] }

  /// research → SWOT → executive summary → synthesized report.
  pub fn analysis() -> Result<Self, GraphError> {
    Self::new(analysis_stages(), vec!["strategic_report".into()])
  }

  /// [`StageGraph::analysis`] plus a simulated stakeholder conversation
  /// appended after the report.
  pub fn analysis_with_simulation() -> Result<Self, GraphError> {
    let mut stages = analysis_stages();
    stages.push(simulation_stage());
    Self::new(
      stages,
      vec!["strategic_report".into(), "simulated_conversation".into()],
    )
  }
}

/// Render `stage`'s instruction against `slots`. Missing slots are an error.
pub fn render(
  env: &Environment<'_>,
  stage: &Stage,
  slots: &BTreeMap<String, String>,
) -> Result<String, minijinja::Error> {
  let context: BTreeMap<&str, &str> = stage
    .inputs
    .iter()
    .filter_map(|k| slots.get(k).map(|v| (k.as_str(), v.as_str())))
    .collect();
  env.render_str(&stage.instruction, context)
}

/// A template environment that refuses to render undefined slots.
pub fn strict_environment() -> Environment<'static> {
  let mut env = Environment::new();
  env.set_undefined_behavior(UndefinedBehavior::Strict);
  env
}

fn check_template(stage: &Stage) -> Result<(), GraphError> {
  let env = strict_environment();
  let template = env
    .template_from_str(&stage.instruction)
    .map_err(|e| GraphError::Template {
      stage:   stage.name.clone(),
      message: e.to_string(),
    })?;

  let declared: HashSet<&str> = stage.inputs.iter().map(String::as_str).collect();
  let mut referenced: Vec<String> = template.undeclared_variables(false).into_iter().collect();
  referenced.sort();
  for slot in referenced {
    if !declared.contains(slot.as_str()) {
      return Err(GraphError::UndeclaredInput { stage: stage.name.clone(), slot });
    }
  }
  Ok(())
}

/// Topological sort (Kahn's algorithm) into dependency batches.
fn batches(
  stages: &[Stage],
  producer: &HashMap<&str, usize>,
) -> Result<Vec<Vec<usize>>, GraphError> {
  let mut in_degree = vec![0usize; stages.len()];
  let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];

  for (index, stage) in stages.iter().enumerate() {
    let upstream: HashSet<usize> = stage
      .inputs
      .iter()
      .filter_map(|slot| producer.get(slot.as_str()).copied())
      .collect();
    for dep in upstream {
      in_degree[index] += 1;
      dependents[dep].push(index);
    }
  }

  let mut remaining: Vec<usize> = (0..stages.len()).collect();
  let mut batches = Vec::new();

  while !remaining.is_empty() {
    let ready: Vec<usize> = remaining
      .iter()
      .copied()
      .filter(|&i| in_degree[i] == 0)
      .collect();

    if ready.is_empty() {
      let names = remaining.iter().map(|&i| stages[i].name.clone()).collect();
      return Err(GraphError::Cycle(names));
    }

    remaining.retain(|i| !ready.contains(i));
    for &i in &ready {
      for &dependent in &dependents[i] {
        in_degree[dependent] -= 1;
      }
    }
    batches.push(ready);
  }

  Ok(batches)
}

fn analysis_stages() -> Vec<Stage> {
  vec![
    Stage::new(
      "research",
      "research_findings",
      &[PROMPT_SLOT, MEMORY_SLOT],
      "You are a market research specialist. Gather the facts needed to answer \
       the request below: company background, products, market position, \
       competitors and recent developments. Report findings as structured \
       notes.\n\nRequest: {{ prompt }}\n\nEarlier analyses for this user:\n{{ memory }}",
    ),
    Stage::new(
      "swot",
      "swot_analysis",
      &["research_findings"],
      "You are a strategy analyst. Turn the research below into a SWOT \
       analysis with one section each for Strengths, Weaknesses, \
       Opportunities and Threats.\n\nResearch:\n{{ research_findings }}",
    ),
    Stage::new(
      "summarize",
      "executive_summary",
      &["research_findings", "swot_analysis"],
      "You are an executive briefer. Condense the material below into a short \
       executive summary that keeps every key insight.\n\nResearch:\n\
       {{ research_findings }}\n\nSWOT:\n{{ swot_analysis }}",
    ),
    Stage::new(
      "report",
      "strategic_report",
      &[PROMPT_SLOT, "research_findings", "swot_analysis", "executive_summary"],
      "You are a strategic report architect. Write the final markdown report \
       answering the request, with the headings `## Executive Summary`, \
       `## Research Findings`, `## SWOT Analysis` and `## Recommendations`. Use \
       only the material provided.\n\nRequest: {{ prompt }}\n\nSummary:\n\
       {{ executive_summary }}\n\nResearch:\n{{ research_findings }}\n\nSWOT:\n\
       {{ swot_analysis }}",
    ),
  ]
}

fn simulation_stage() -> Stage {
  Stage::new(
    "simulate",
    "simulated_conversation",
    &["strategic_report"],
    "You are a conversation simulator. Write a short dialogue between a \
     company executive and a skeptical analyst discussing the report below, \
     under the heading `## Simulated Discussion`.\n\nReport:\n{{ strategic_report }}",
  )
}
