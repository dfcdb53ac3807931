//! [`PipelineEngine`]: runs a [`StageGraph`] batch by batch and streams the
//! results.

use std::collections::{BTreeMap, VecDeque};

use brandspark_core::engine::{AnalysisEngine, EngineError, EngineEvent, EngineRequest};
use futures::{
  StreamExt as _,
  future::try_join_all,
  stream::{self, BoxStream},
};
use minijinja::Environment;
use uuid::Uuid;

use crate::{
  context::{ContextStore, USER_AUTHOR},
  generator::TextGenerator,
  stage::{MEMORY_SLOT, PROMPT_SLOT, StageGraph, render, strict_environment},
};

/// Author of the final event and of the answer turn kept in the context.
pub const ENGINE_AUTHOR: &str = "brandspark";

/// Separator placed before every final fragment after the first.
const PART_SEPARATOR: &str = "\n\n";

pub struct PipelineEngine<G> {
  generator: G,
  graph:     StageGraph,
  contexts:  ContextStore,
  env:       Environment<'static>,
}

/// Progress of one `run` call, threaded through `stream::unfold`.
struct RunState<'a, G> {
  engine:     &'a PipelineEngine<G>,
  request:    EngineRequest,
  slots:      BTreeMap<String, String>,
  next_batch: usize,
  queued:     VecDeque<EngineEvent>,
  done:       bool,
}

impl<G: TextGenerator> PipelineEngine<G> {
  pub fn new(generator: G, graph: StageGraph) -> Self {
    Self {
      generator,
      graph,
      contexts: ContextStore::new(),
      env: strict_environment(),
    }
  }

  pub fn graph(&self) -> &StageGraph { &self.graph }

  pub fn contexts(&self) -> &ContextStore { &self.contexts }

  /// Run every stage of batch `index`, concurrently, and record the outputs.
  async fn run_batch(
    &self,
    index: usize,
    request: &EngineRequest,
    slots: &mut BTreeMap<String, String>,
  ) -> Result<Vec<EngineEvent>, EngineError> {
    let batch = &self.graph.batches()[index];

    let rendered = batch
      .iter()
      .map(|&i| {
        let stage = self.graph.stage(i);
        render(&self.env, stage, slots)
          .map(|instruction| (i, instruction))
          .map_err(|e| EngineError::Template(format!("stage `{}`: {e}", stage.name)))
      })
      .collect::<Result<Vec<_>, _>>()?;

    let outputs = try_join_all(
      rendered
        .iter()
        .map(|(_, instruction)| self.generator.generate(instruction, &request.prompt)),
    )
    .await?;

    let mut events = Vec::with_capacity(outputs.len());
    for ((i, _), text) in rendered.iter().zip(outputs) {
      let stage = self.graph.stage(*i);
      tracing::debug!(
        stage = %stage.name,
        session_id = %request.session_id,
        chars = text.len(),
        "stage completed"
      );
      self
        .contexts
        .append(request.user_id, request.session_id, &stage.name, &text)?;
      slots.insert(stage.output_key.clone(), text.clone());
      events.push(EngineEvent {
        author:   stage.name.clone(),
        parts:    vec![text],
        is_final: false,
      });
    }
    Ok(events)
  }

  /// The final event: every non-empty final slot, in order.
  fn final_event(
    &self,
    request: &EngineRequest,
    slots: &BTreeMap<String, String>,
  ) -> Result<EngineEvent, EngineError> {
    let mut parts = Vec::new();
    for slot in self.graph.final_slots() {
      let Some(text) = slots.get(slot) else { continue };
      if text.trim().is_empty() {
        continue;
      }
      if parts.is_empty() {
        parts.push(text.clone());
      } else {
        parts.push(format!("{PART_SEPARATOR}{text}"));
      }
    }

    if !parts.is_empty() {
      self.contexts.append(
        request.user_id,
        request.session_id,
        ENGINE_AUTHOR,
        &parts.concat(),
      )?;
    }
    Ok(EngineEvent { author: ENGINE_AUTHOR.to_owned(), parts, is_final: true })
  }
}

impl<G: TextGenerator> AnalysisEngine for PipelineEngine<G> {
  async fn create_context(&self, user_id: Uuid, session_id: Uuid) -> Result<(), EngineError> {
    self.contexts.create(user_id, session_id)
  }

  fn run(
    &self,
    request: EngineRequest,
  ) -> BoxStream<'_, Result<EngineEvent, EngineError>> {
    if let Err(e) =
      self
        .contexts
        .append(request.user_id, request.session_id, USER_AUTHOR, &request.prompt)
    {
      return stream::once(async move { Err(e) }).boxed();
    }

    let mut slots = BTreeMap::new();
    slots.insert(PROMPT_SLOT.to_owned(), request.prompt.clone());
    slots.insert(MEMORY_SLOT.to_owned(), self.contexts.memory_digest(request.user_id));

    let state = RunState {
      engine: self,
      request,
      slots,
      next_batch: 0,
      queued: VecDeque::new(),
      done: false,
    };

    stream::unfold(state, |mut st| async move {
      loop {
        if let Some(event) = st.queued.pop_front() {
          return Some((Ok(event), st));
        }
        if st.done {
          return None;
        }

        if st.next_batch == st.engine.graph.batches().len() {
          st.done = true;
          let event = st.engine.final_event(&st.request, &st.slots);
          return Some((event, st));
        }

        let index = st.next_batch;
        match st.engine.run_batch(index, &st.request, &mut st.slots).await {
          Ok(events) => {
            st.queued.extend(events);
            st.next_batch += 1;
          }
          Err(e) => {
            st.done = true;
            return Some((Err(e), st));
          }
        }
      }
    })
    .boxed()
  }

  async fn archive_context(&self, user_id: Uuid, session_id: Uuid) -> Result<(), EngineError> {
    self.contexts.archive(user_id, session_id)
  }
}

#[cfg(test)]
mod tests {
  use futures::StreamExt as _;

  use super::*;
  use crate::stage::Stage;

  /// Wraps each instruction in brackets so outputs reveal what fed them.
  struct Echo;

  impl TextGenerator for Echo {
    async fn generate<'a>(
      &'a self,
      instruction: &'a str,
      _input: &'a str,
    ) -> Result<String, EngineError> {
      Ok(format!("[{instruction}]"))
    }
  }

  /// Fails on any instruction starting with `prefix`.
  struct FailOn(&'static str);

  impl TextGenerator for FailOn {
    async fn generate<'a>(
      &'a self,
      instruction: &'a str,
      _input: &'a str,
    ) -> Result<String, EngineError> {
      if instruction.starts_with(self.0) {
        return Err(EngineError::Generation("upstream down".into()));
      }
      Ok(instruction.to_owned())
    }
  }

  struct Silent;

  impl TextGenerator for Silent {
    async fn generate<'a>(
      &'a self,
      _instruction: &'a str,
      _input: &'a str,
    ) -> Result<String, EngineError> {
      Ok("   ".to_owned())
    }
  }

  fn diamond() -> StageGraph {
    StageGraph::new(
      vec![
        Stage::new("a", "a", &["prompt"], "A {{ prompt }}"),
        Stage::new("b", "b", &["a"], "B {{ a }}"),
        Stage::new("c", "c", &["a"], "C {{ a }}"),
        Stage::new("d", "d", &["b", "c"], "D {{ b }} {{ c }}"),
      ],
      vec!["d".into(), "b".into()],
    )
    .unwrap()
  }

  fn request(user_id: Uuid, session_id: Uuid, prompt: &str) -> EngineRequest {
    EngineRequest { user_id, session_id, prompt: prompt.into() }
  }

  #[tokio::test]
  async fn streams_stage_events_then_final() {
    let engine = PipelineEngine::new(Echo, diamond());
    let (user, session) = (Uuid::new_v4(), Uuid::new_v4());
    engine.create_context(user, session).await.unwrap();

    let events: Vec<EngineEvent> = engine
      .run(request(user, session, "hi"))
      .map(Result::unwrap)
      .collect()
      .await;

    let authors: Vec<&str> = events.iter().map(|e| e.author.as_str()).collect();
    assert_eq!(authors, ["a", "b", "c", "d", ENGINE_AUTHOR]);
    assert!(events[..4].iter().all(|e| !e.is_final));

    let last = events.last().unwrap();
    assert!(last.is_final);
    assert_eq!(last.parts.len(), 2);
    assert_eq!(last.parts[0], "[D [B [A hi]] [C [A hi]]]");
    assert_eq!(last.parts[1], "\n\n[B [A hi]]");
    assert_eq!(last.text(), "[D [B [A hi]] [C [A hi]]]\n\n[B [A hi]]");

    let turns = engine.contexts().turns(user, session).unwrap();
    assert_eq!(turns.first().unwrap().author, USER_AUTHOR);
    assert_eq!(turns.last().unwrap().text, last.text());
  }

  #[tokio::test]
  async fn run_without_context_fails_fast() {
    let engine = PipelineEngine::new(Echo, diamond());
    let events: Vec<_> = engine
      .run(request(Uuid::new_v4(), Uuid::new_v4(), "hi"))
      .collect()
      .await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], Err(EngineError::NoSuchContext(_))));
  }

  #[tokio::test]
  async fn generator_failure_ends_the_stream() {
    let engine = PipelineEngine::new(FailOn("C"), diamond());
    let (user, session) = (Uuid::new_v4(), Uuid::new_v4());
    engine.create_context(user, session).await.unwrap();

    let events: Vec<_> = engine.run(request(user, session, "hi")).collect().await;
    // `a` succeeds; batch {b, c} fails as a unit.
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].as_ref().unwrap().author, "a");
    assert!(matches!(events[1], Err(EngineError::Generation(_))));
  }

  #[tokio::test]
  async fn blank_outputs_give_an_empty_final_event() {
    let engine = PipelineEngine::new(Silent, diamond());
    let (user, session) = (Uuid::new_v4(), Uuid::new_v4());
    engine.create_context(user, session).await.unwrap();

    let events: Vec<_> = engine.run(request(user, session, "hi")).collect().await;
    let last = events.last().unwrap().as_ref().unwrap();
    assert!(last.is_final);
    assert!(last.parts.is_empty());
    assert_eq!(last.text(), "");
  }

  #[tokio::test]
  async fn default_graph_produces_a_sectioned_report() {
    let engine = PipelineEngine::new(Echo, StageGraph::analysis().unwrap());
    let (user, session) = (Uuid::new_v4(), Uuid::new_v4());
    engine.create_context(user, session).await.unwrap();

    let events: Vec<_> = engine
      .run(request(user, session, "Analyze Acme Corp vs Globex"))
      .collect()
      .await;
    let last = events.last().unwrap().as_ref().unwrap();
    let report = last.text();
    for heading in ["## Executive Summary", "## Research Findings", "## SWOT Analysis", "## Recommendations"] {
      assert!(report.contains(heading), "missing {heading}");
    }
    assert!(report.contains("Analyze Acme Corp vs Globex"));
  }

  #[tokio::test]
  async fn archived_answers_feed_later_runs() {
    let engine = PipelineEngine::new(Echo, StageGraph::analysis().unwrap());
    let user = Uuid::new_v4();
    let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

    engine.create_context(user, first).await.unwrap();
    let _: Vec<_> = engine.run(request(user, first, "Acme")).collect().await;
    engine.archive_context(user, first).await.unwrap();

    engine.create_context(user, second).await.unwrap();
    let events: Vec<_> = engine.run(request(user, second, "Globex")).collect().await;
    let research = events[0].as_ref().unwrap();
    assert_eq!(research.author, "research");
    assert!(!research.text().contains("No prior analyses."));
    assert!(research.text().contains("Request: Acme"));
  }
}
