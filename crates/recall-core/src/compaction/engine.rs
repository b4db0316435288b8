//! # Compaction Engine
//!
//! Three-level escalation over one `(agent_id, conversation_id)` at a time. The
//! engine holds no conversation state; every call reads a fresh snapshot from the
//! backend.
//!
//! ```text
//! active tokens > soft ──► L1 chunked ──► ≤ hard? ──► done
//!                               │ no
//!                               ▼
//!                          L2 summary-of-summaries ──► ≤ hard? ──► done
//!                               │ no
//!                               ▼
//!                          L3 deterministic digest (bounded) ──► done
//! ```
//!
//! Each level runs every summarizer call first and then commits through
//! [`StorageBackend::apply_compaction`], so a failing summarizer or a conflicting
//! writer leaves the stored state untouched.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use super::policy::{CompactionConfig, CompactionLevel};
use super::summarizer::{
    build_digest, digest_entries, ExtractiveSummarizer, Summarizer, MAX_DIGEST_ENTRY_CHARS,
};
use crate::error::{MemoryError, Result};
use crate::storage::StorageBackend;
use crate::tokenizer::Tokenizer;
use crate::types::{Message, NewCompactionLog, NewSummary, Summary};

/// Outcome of one `compact()` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionReport {
    /// Highest level that wrote summaries; `None` when nothing changed
    pub level_reached: Option<CompactionLevel>,
    /// Messages in the conversation when compaction started
    pub messages_before: i64,
    /// Active tokens before compaction
    pub tokens_before: i64,
    /// Active tokens after compaction
    pub tokens_after: i64,
    /// Summaries written
    pub summaries_created: i64,
    /// Strategy label of `level_reached`, `"none"` for a no-op
    pub strategy: String,
    /// Wall time of the run
    pub duration_ms: i64,
}

impl CompactionReport {
    /// Whether the call changed stored state
    pub fn did_work(&self) -> bool {
        self.summaries_created > 0
    }
}

/// Summaries to insert and ids to supersede, committed as one unit
#[derive(Debug, Default)]
struct LevelPlan {
    new_summaries: Vec<NewSummary>,
    supersede: Vec<i64>,
}

/// Messages and active summaries of one conversation at one point in time
struct Snapshot {
    messages: Vec<Message>,
    active: Vec<Summary>,
    /// Index into `messages` where the recent window starts
    recent_start: usize,
}

impl Snapshot {
    fn is_covered(&self, sequence: i64) -> bool {
        self.active.iter().any(|s| s.covers(sequence))
    }

    /// Σ active summaries + Σ uncovered messages, recent window always raw
    fn active_tokens(&self) -> i64 {
        let summaries: i64 = self.active.iter().map(|s| s.token_count).sum();
        let raw: i64 = self
            .messages
            .iter()
            .enumerate()
            .filter(|(idx, m)| *idx >= self.recent_start || !self.is_covered(m.sequence))
            .map(|(_, m)| m.token_count)
            .sum();
        summaries + raw
    }
}

/// Keeps a conversation's active context under its token budget
pub struct CompactionEngine {
    backend: Arc<dyn StorageBackend>,
    tokenizer: Arc<dyn Tokenizer>,
    summarizer: Arc<dyn Summarizer>,
    config: CompactionConfig,
}

impl fmt::Debug for CompactionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompactionEngine")
            .field("backend", &self.backend.name())
            .field("tokenizer", &self.tokenizer.name())
            .field("config", &self.config)
            .finish()
    }
}

impl CompactionEngine {
    /// Create an engine using the extractive summarizer
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        tokenizer: Arc<dyn Tokenizer>,
        config: CompactionConfig,
    ) -> Self {
        Self {
            backend,
            tokenizer,
            summarizer: Arc::new(ExtractiveSummarizer),
            config,
        }
    }

    /// Replace the summarizer used by levels 1 and 2
    pub fn with_summarizer(mut self, summarizer: impl Summarizer + 'static) -> Self {
        self.summarizer = Arc::new(summarizer);
        self
    }

    /// Replace the summarizer with a shared one
    pub fn with_shared_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    fn snapshot(&self, agent_id: &str, conversation_id: &str) -> Result<Snapshot> {
        let messages = self
            .backend
            .get_messages(agent_id, Some(conversation_id), None, None)?;
        let active = self.backend.get_active_summaries(agent_id, conversation_id)?;
        let recent_start = messages.len().saturating_sub(self.config.recent_window_size);
        Ok(Snapshot {
            messages,
            active,
            recent_start,
        })
    }

    /// Tokens currently fed to the model for this conversation
    pub fn active_token_count(&self, agent_id: &str, conversation_id: &str) -> Result<i64> {
        Ok(self.snapshot(agent_id, conversation_id)?.active_tokens())
    }

    /// Whether the active total exceeds the hard threshold
    pub fn needs_compaction(&self, agent_id: &str, conversation_id: &str) -> Result<bool> {
        Ok(self.active_token_count(agent_id, conversation_id)? > self.config.hard_threshold())
    }

    /// Escalate through levels 1 to 3 until the active total is at or below the
    /// hard threshold.
    ///
    /// A no-op when the total is already at or below the soft threshold. Writes one
    /// compaction log row when any summaries were created.
    pub fn compact(&self, agent_id: &str, conversation_id: &str) -> Result<CompactionReport> {
        let started = Instant::now();
        let initial = self.snapshot(agent_id, conversation_id)?;
        let tokens_before = initial.active_tokens();
        let messages_before = initial.messages.len() as i64;
        drop(initial);

        let mut report = CompactionReport {
            level_reached: None,
            messages_before,
            tokens_before,
            tokens_after: tokens_before,
            summaries_created: 0,
            strategy: "none".to_string(),
            duration_ms: 0,
        };

        if tokens_before <= self.config.soft_threshold() {
            tracing::debug!(
                agent_id,
                conversation_id,
                tokens = tokens_before,
                soft = self.config.soft_threshold(),
                "Below soft threshold, nothing to compact"
            );
            report.duration_ms = started.elapsed().as_millis() as i64;
            return Ok(report);
        }

        let hard = self.config.hard_threshold();
        for level in [
            CompactionLevel::Chunked,
            CompactionLevel::SummaryOfSummaries,
            CompactionLevel::Truncation,
        ] {
            let snapshot = self.snapshot(agent_id, conversation_id)?;
            let plan = match level {
                CompactionLevel::Chunked => self.plan_chunked(agent_id, conversation_id, &snapshot)?,
                CompactionLevel::SummaryOfSummaries => {
                    self.plan_summary_of_summaries(agent_id, conversation_id, &snapshot)?
                }
                CompactionLevel::Truncation => {
                    self.plan_truncation(agent_id, conversation_id, &snapshot)?
                }
            };

            if !plan.new_summaries.is_empty() {
                let ids = self
                    .backend
                    .apply_compaction(&plan.new_summaries, &plan.supersede)?;
                tracing::debug!(
                    agent_id,
                    conversation_id,
                    level = level.as_u8(),
                    created = ids.len(),
                    superseded = plan.supersede.len(),
                    "Committed compaction level"
                );
                report.summaries_created += ids.len() as i64;
                report.level_reached = Some(level);
            }

            report.tokens_after = self.active_token_count(agent_id, conversation_id)?;
            if report.tokens_after <= hard {
                break;
            }
        }

        report.duration_ms = started.elapsed().as_millis() as i64;
        if let Some(level) = report.level_reached {
            report.strategy = level.strategy().to_string();
            self.backend.insert_compaction_log(&NewCompactionLog {
                agent_id: agent_id.to_string(),
                conversation_id: conversation_id.to_string(),
                level: level.as_u8(),
                messages_before: report.messages_before,
                tokens_before: report.tokens_before,
                tokens_after: report.tokens_after,
                summaries_created: report.summaries_created,
                strategy: report.strategy.clone(),
                duration_ms: report.duration_ms,
            })?;
            tracing::info!(
                agent_id,
                conversation_id,
                level = level.as_u8(),
                tokens_before = report.tokens_before,
                tokens_after = report.tokens_after,
                summaries_created = report.summaries_created,
                "Compacted conversation"
            );
        }
        if report.tokens_after > hard {
            tracing::warn!(
                agent_id,
                conversation_id,
                tokens = report.tokens_after,
                hard,
                "Active context still above hard threshold after compaction"
            );
        }
        Ok(report)
    }

    fn summarize(&self, texts: &[String]) -> Result<(String, i64)> {
        let content = self
            .summarizer
            .summarize(texts)
            .map_err(|e| MemoryError::Summarizer(format!("{e:#}")))?;
        let tokens = self.tokenizer.count(&content)? as i64;
        Ok((content, tokens))
    }

    /// Level 1: chunk uncovered messages older than the recent window
    fn plan_chunked(
        &self,
        agent_id: &str,
        conversation_id: &str,
        snapshot: &Snapshot,
    ) -> Result<LevelPlan> {
        // Contiguous runs of uncovered messages; a summary span between two
        // messages ends the run so new spans never overlap existing ones
        let mut runs: Vec<Vec<&Message>> = Vec::new();
        let mut previous: Option<i64> = None;
        for message in &snapshot.messages[..snapshot.recent_start] {
            if snapshot.is_covered(message.sequence) {
                previous = None;
                continue;
            }
            let continues = previous.map_or(false, |prev| {
                !snapshot
                    .active
                    .iter()
                    .any(|s| s.overlaps(prev, message.sequence))
            });
            match runs.last_mut() {
                Some(run) if continues => run.push(message),
                _ => runs.push(vec![message]),
            }
            previous = Some(message.sequence);
        }

        let mut plan = LevelPlan::default();
        for chunk in runs.iter().flat_map(|run| run.chunks(self.config.chunk_size.max(1))) {
            let (Some(first), Some(last)) = (chunk.first(), chunk.last()) else {
                continue;
            };
            let texts: Vec<String> = chunk.iter().map(|m| m.content.clone()).collect();
            let (content, token_count) = self.summarize(&texts)?;
            plan.new_summaries.push(NewSummary {
                agent_id: agent_id.to_string(),
                conversation_id: conversation_id.to_string(),
                level: CompactionLevel::Chunked.as_u8(),
                content,
                token_count,
                span_start_seq: first.sequence,
                span_end_seq: last.sequence,
                child_ids: None,
            });
        }
        Ok(plan)
    }

    /// Level 2: fold runs of active level-1 summaries
    fn plan_summary_of_summaries(
        &self,
        agent_id: &str,
        conversation_id: &str,
        snapshot: &Snapshot,
    ) -> Result<LevelPlan> {
        let level1 = CompactionLevel::Chunked.as_u8();
        let candidates: Vec<&Summary> = snapshot
            .active
            .iter()
            .filter(|s| s.level == level1)
            .collect();

        let mut plan = LevelPlan::default();
        if candidates.len() < 2 {
            return Ok(plan);
        }

        // Segments never cross an active summary of another level
        let mut segments: Vec<Vec<&Summary>> = Vec::new();
        let mut previous: Option<&Summary> = None;
        for summary in candidates {
            let continues = previous.map_or(false, |prev| {
                !snapshot.active.iter().any(|other| {
                    other.level != level1
                        && other.span_start_seq > prev.span_end_seq
                        && other.span_end_seq < summary.span_start_seq
                })
            });
            match segments.last_mut() {
                Some(segment) if continues => segment.push(summary),
                _ => segments.push(vec![summary]),
            }
            previous = Some(summary);
        }

        for chunk in segments
            .iter()
            .flat_map(|segment| segment.chunks(self.config.chunk_size.max(1)))
            .filter(|chunk| chunk.len() >= 2)
        {
            let texts: Vec<String> = chunk.iter().map(|s| s.content.clone()).collect();
            let child_ids: Vec<i64> = chunk.iter().map(|s| s.summary_id).collect();
            let (content, token_count) = self.summarize(&texts)?;
            plan.new_summaries.push(NewSummary {
                agent_id: agent_id.to_string(),
                conversation_id: conversation_id.to_string(),
                level: CompactionLevel::SummaryOfSummaries.as_u8(),
                content,
                token_count,
                span_start_seq: chunk.iter().map(|s| s.span_start_seq).min().unwrap_or_default(),
                span_end_seq: chunk.iter().map(|s| s.span_end_seq).max().unwrap_or_default(),
                child_ids: Some(child_ids.clone()),
            });
            plan.supersede.extend(child_ids);
        }
        Ok(plan)
    }

    /// Level 3: replace every active summary with one bounded digest.
    ///
    /// Entries shrink from [`MAX_DIGEST_ENTRY_CHARS`] towards their first sentence
    /// until the digest fits what the hard threshold leaves after raw messages. If
    /// none fits, the sentence-only digest is used. Nothing is written unless the
    /// digest is strictly smaller than its inputs, and a lone digest is left alone.
    fn plan_truncation(
        &self,
        agent_id: &str,
        conversation_id: &str,
        snapshot: &Snapshot,
    ) -> Result<LevelPlan> {
        let mut plan = LevelPlan::default();
        let truncation = CompactionLevel::Truncation.as_u8();
        if let [only] = snapshot.active.as_slice() {
            if only.level == truncation {
                return Ok(plan);
            }
        }
        let (Some(start), Some(end)) = (
            snapshot.active.iter().map(|s| s.span_start_seq).min(),
            snapshot.active.iter().map(|s| s.span_end_seq).max(),
        ) else {
            return Ok(plan);
        };

        let input_tokens: i64 = snapshot.active.iter().map(|s| s.token_count).sum();
        let budget = self.config.hard_threshold() - (snapshot.active_tokens() - input_tokens);
        let contents: Vec<String> = snapshot
            .active
            .iter()
            .flat_map(|s| {
                if s.level == truncation {
                    digest_entries(&s.content).map(str::to_string).collect()
                } else {
                    vec![s.content.clone()]
                }
            })
            .collect();

        let mut chosen: Option<(String, i64)> = None;
        let entry_caps = std::iter::successors(Some(MAX_DIGEST_ENTRY_CHARS), |cap| {
            (*cap > 0).then(|| cap / 2)
        });
        for cap in entry_caps {
            let digest = build_digest(&contents, cap);
            let token_count = self.tokenizer.count(&digest)? as i64;
            if token_count >= input_tokens {
                continue;
            }
            chosen = Some((digest, token_count));
            if token_count <= budget {
                break;
            }
        }

        if let Some((content, token_count)) = chosen {
            let child_ids: Vec<i64> = snapshot.active.iter().map(|s| s.summary_id).collect();
            plan.supersede = child_ids.clone();
            plan.new_summaries.push(NewSummary {
                agent_id: agent_id.to_string(),
                conversation_id: conversation_id.to_string(),
                level: truncation,
                content,
                token_count,
                span_start_seq: start,
                span_end_seq: end,
                child_ids: Some(child_ids),
            });
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteBackend;
    use crate::tokenizer::WordEstimateTokenizer;
    use crate::compaction::summarizer::MAX_DIGEST_CHARS;
    use crate::types::{NewMessage, SummaryState};

    const AGENT: &str = "agent-1";
    const CONV: &str = "conv-1";

    fn setup() -> (Arc<dyn StorageBackend>, Arc<dyn Tokenizer>) {
        let backend: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::open_in_memory().unwrap());
        backend.register_agent(AGENT, "Agent", "test").unwrap();
        (backend, Arc::new(WordEstimateTokenizer::default()))
    }

    /// "Step {i} done." plus 20 filler words: 23 words, 30 tokens
    fn store_steps(backend: &dyn StorageBackend, tokenizer: &dyn Tokenizer, count: usize) {
        let filler = vec!["filler"; 20].join(" ");
        for i in 1..=count {
            let content = format!("Step {i} done. {filler}");
            backend
                .insert_message(&NewMessage {
                    agent_id: AGENT,
                    conversation_id: CONV,
                    role: "user",
                    content: &content,
                    token_count: tokenizer.count(&content).unwrap() as i64,
                    metadata: None,
                    sequence: None,
                })
                .unwrap();
        }
    }

    fn config(soft: f64, hard: f64, chunk: usize) -> CompactionConfig {
        CompactionConfig::default()
            .with_context_window(1000)
            .with_thresholds(soft, hard)
            .with_recent_window(2)
            .with_chunk_size(chunk)
    }

    #[test]
    fn test_recent_window_counts_raw_even_when_covered() {
        let (backend, tokenizer) = setup();
        store_steps(backend.as_ref(), tokenizer.as_ref(), 5);
        backend
            .insert_summary(&NewSummary {
                agent_id: AGENT.into(),
                conversation_id: CONV.into(),
                level: 1,
                content: "everything".into(),
                token_count: 7,
                span_start_seq: 1,
                span_end_seq: 5,
                child_ids: None,
            })
            .unwrap();

        let engine = CompactionEngine::new(backend, tokenizer, config(0.5, 0.9, 3));
        // Summary (7) plus the two recent messages (30 each), although covered
        assert_eq!(engine.active_token_count(AGENT, CONV).unwrap(), 67);
    }

    #[test]
    fn test_noop_below_soft_threshold() {
        let (backend, tokenizer) = setup();
        store_steps(backend.as_ref(), tokenizer.as_ref(), 3);
        let engine = CompactionEngine::new(backend.clone(), tokenizer, CompactionConfig::default());

        let report = engine.compact(AGENT, CONV).unwrap();
        assert!(!report.did_work());
        assert_eq!(report.level_reached, None);
        assert_eq!(report.strategy, "none");
        assert!(backend.get_compaction_log(AGENT, CONV, 10).unwrap().is_empty());
    }

    #[test]
    fn test_level_one_chunks_outside_recent_window() {
        let (backend, tokenizer) = setup();
        store_steps(backend.as_ref(), tokenizer.as_ref(), 10);
        let engine = CompactionEngine::new(backend.clone(), tokenizer, config(0.05, 0.9, 4));

        let report = engine.compact(AGENT, CONV).unwrap();
        assert_eq!(report.level_reached, Some(CompactionLevel::Chunked));
        assert_eq!(report.summaries_created, 2);
        assert_eq!(report.strategy, "chunked_summary");

        let active = backend.get_active_summaries(AGENT, CONV).unwrap();
        let spans: Vec<_> = active
            .iter()
            .map(|s| (s.span_start_seq, s.span_end_seq))
            .collect();
        assert_eq!(spans, vec![(1, 4), (5, 8)]);
        assert!(active[0].content.starts_with("Step 1 done. Step 2 done."));

        let log = backend.get_compaction_log(AGENT, CONV, 10).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].level, 1);
        assert_eq!(log[0].tokens_before, 300);
    }

    #[test]
    fn test_escalates_to_level_two() {
        let (backend, tokenizer) = setup();
        store_steps(backend.as_ref(), tokenizer.as_ref(), 12);
        let engine = CompactionEngine::new(backend.clone(), tokenizer, config(0.05, 0.09, 2));

        let report = engine.compact(AGENT, CONV).unwrap();
        assert_eq!(report.level_reached, Some(CompactionLevel::SummaryOfSummaries));
        // Five level-1 summaries, then two level-2 summaries
        assert_eq!(report.summaries_created, 7);
        assert!(report.tokens_after <= 90);

        let level2 = backend
            .get_summaries(AGENT, CONV, Some(2), Some(SummaryState::Active))
            .unwrap();
        assert_eq!(level2.len(), 2);
        for parent in &level2 {
            let children = parent.child_ids.clone().unwrap();
            assert_eq!(children.len(), 2);
            for child in children {
                let child = backend.get_summary_by_id(child).unwrap().unwrap();
                assert_eq!(child.state, SummaryState::Superseded);
                assert!(parent.covers(child.span_start_seq) && parent.covers(child.span_end_seq));
            }
        }
    }

    #[test]
    fn test_growing_summarizer_reaches_truncation() {
        let (backend, tokenizer) = setup();
        store_steps(backend.as_ref(), tokenizer.as_ref(), 12);
        let padding = vec!["padding"; 50].join(" ");
        let engine = CompactionEngine::new(backend.clone(), tokenizer, config(0.05, 0.1, 3))
            .with_summarizer(move |texts: &[String]| -> anyhow::Result<String> {
                Ok(format!("{} {padding}", texts.join(" ")))
            });

        let report = engine.compact(AGENT, CONV).unwrap();
        assert_eq!(report.level_reached, Some(CompactionLevel::Truncation));
        assert!(report.tokens_after < report.tokens_before);
        assert!(report.tokens_after <= 100);

        let active = backend.get_active_summaries(AGENT, CONV).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].level, 3);
        assert_eq!((active[0].span_start_seq, active[0].span_end_seq), (1, 10));
        assert!(active[0].content.chars().count() <= MAX_DIGEST_CHARS);
    }

    #[test]
    fn test_digest_is_a_fixed_point_when_recent_window_exceeds_budget() {
        let (backend, tokenizer) = setup();
        store_steps(backend.as_ref(), tokenizer.as_ref(), 10);
        // Five recent messages (150 tokens) alone exceed the hard threshold of 100
        let engine = CompactionEngine::new(
            backend.clone(),
            tokenizer,
            config(0.05, 0.1, 3).with_recent_window(5),
        );

        let first = engine.compact(AGENT, CONV).unwrap();
        assert_eq!(first.level_reached, Some(CompactionLevel::Truncation));
        assert!(first.tokens_after > 100);
        let digest = backend.get_active_summaries(AGENT, CONV).unwrap();
        assert_eq!(digest.len(), 1);
        assert_eq!(digest[0].level, 3);
        assert_eq!(digest[0].content, "Step 1 done.");

        for _ in 0..5 {
            let again = engine.compact(AGENT, CONV).unwrap();
            assert!(!again.did_work());
            assert_eq!(again.tokens_after, first.tokens_after);
        }
        let active = backend.get_active_summaries(AGENT, CONV).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].summary_id, digest[0].summary_id);
        assert_eq!(backend.get_compaction_log(AGENT, CONV, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_new_messages_fold_into_existing_digest_without_erasing_it() {
        let (backend, tokenizer) = setup();
        store_steps(backend.as_ref(), tokenizer.as_ref(), 10);
        let engine = CompactionEngine::new(
            backend.clone(),
            tokenizer.clone(),
            config(0.05, 0.1, 3).with_recent_window(5),
        );
        engine.compact(AGENT, CONV).unwrap();

        store_steps(backend.as_ref(), tokenizer.as_ref(), 6);
        engine.compact(AGENT, CONV).unwrap();

        let active = backend.get_active_summaries(AGENT, CONV).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].level, 3);
        assert_eq!((active[0].span_start_seq, active[0].span_end_seq), (1, 11));
        assert!(active[0].content.starts_with("Step 1 done."));
        assert!(active[0].content.contains(" | "));
    }

    #[test]
    fn test_summarizer_failure_writes_nothing() {
        let (backend, tokenizer) = setup();
        store_steps(backend.as_ref(), tokenizer.as_ref(), 10);
        let engine = CompactionEngine::new(backend.clone(), tokenizer, config(0.05, 0.09, 3))
            .with_summarizer(|_: &[String]| -> anyhow::Result<String> {
                anyhow::bail!("model offline")
            });

        let err = engine.compact(AGENT, CONV).unwrap_err();
        assert!(matches!(err, MemoryError::Summarizer(ref msg) if msg.contains("model offline")));
        assert!(backend.get_summaries(AGENT, CONV, None, None).unwrap().is_empty());
        assert!(backend.get_compaction_log(AGENT, CONV, 10).unwrap().is_empty());
    }

    #[test]
    fn test_needs_compaction() {
        let (backend, tokenizer) = setup();
        store_steps(backend.as_ref(), tokenizer.as_ref(), 4);
        let engine = CompactionEngine::new(backend, tokenizer, config(0.05, 0.1, 3));
        // 120 tokens against a hard threshold of 100
        assert!(engine.needs_compaction(AGENT, CONV).unwrap());
    }
}
