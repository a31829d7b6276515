use anyhow::{Result, anyhow};
use chrono::Utc;
use serde::Serialize;
use sessions_core::{
    ChunkManifest, EngineError, EventKind, IsolationFlag, RawTurn, Role, SessionsConfig,
    TranscriptChunk, TranscriptRecord,
};
use sessions_store::StateStore;
use std::path::Path;
use tokenizers::Tokenizer;

/// Deterministic token counting for chunk budgeting. Loads a `tokenizer.json`
/// vocabulary when one is configured; otherwise counts approximately at four
/// characters per token, the same everywhere so packing stays reproducible.
pub enum TokenCounter {
    Exact(Box<Tokenizer>),
    Approximate,
}

impl TokenCounter {
    pub fn from_file(path: &Path) -> std::result::Result<Self, EngineError> {
        Tokenizer::from_file(path)
            .map(|t| TokenCounter::Exact(Box::new(t)))
            .map_err(|e| EngineError::TokenizerUnavailable(format!("{}: {e}", path.display())))
    }

    pub fn is_approximate(&self) -> bool {
        matches!(self, TokenCounter::Approximate)
    }

    pub fn count(&self, text: &str) -> usize {
        match self {
            TokenCounter::Exact(tokenizer) => tokenizer
                .encode(text, false)
                .map(|encoding| encoding.get_ids().len())
                .unwrap_or_else(|_| approx_token_count(text)),
            TokenCounter::Approximate => approx_token_count(text),
        }
    }
}

fn approx_token_count(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[derive(Debug, Clone, Serialize)]
pub struct DelegationReport {
    pub agent_kind: String,
    pub chunks: u32,
    pub total_tokens: u64,
    pub token_budget: usize,
    pub approximate: bool,
}

/// Prepares a sub-agent handoff: filter the transcript to the delegation
/// window, normalize every record, pack into token-bounded chunks, persist
/// the set, then raise the isolation flag.
pub struct HandoffEngine {
    counter: TokenCounter,
    config: SessionsConfig,
    degraded: Option<String>,
}

impl HandoffEngine {
    pub fn new(cfg: &SessionsConfig) -> Self {
        let (counter, degraded) = match &cfg.tokenizer_file {
            Some(path) => match TokenCounter::from_file(path) {
                Ok(counter) => (counter, None),
                Err(err) => (TokenCounter::Approximate, Some(err.to_string())),
            },
            None => (TokenCounter::Approximate, None),
        };
        Self {
            counter,
            config: cfg.clone(),
            degraded,
        }
    }

    /// Tokenizer degradation note, present when a configured vocabulary could
    /// not be loaded and approximate counting is in effect.
    pub fn degraded(&self) -> Option<&str> {
        self.degraded.as_deref()
    }

    pub fn delegate(
        &self,
        store: &StateStore,
        agent_kind: &str,
        raw_transcript: &[RawTurn],
    ) -> Result<DelegationReport> {
        if agent_kind.trim().is_empty() {
            return Err(anyhow!("delegation requires an agent kind"));
        }
        let agent_kind = agent_kind.trim();

        let window = self.delegation_window(raw_transcript);
        let records = normalize(window);
        let (chunks, total_tokens) = self.pack(agent_kind, records)?;

        let manifest = ChunkManifest {
            agent_kind: agent_kind.to_string(),
            chunk_count: chunks.len() as u32,
            token_budget: self.config.token_budget,
            total_tokens,
            approximate: self.counter.is_approximate(),
            written_at: Utc::now(),
        };
        store.replace_chunks(agent_kind, &chunks, &manifest)?;

        let flag = IsolationFlag::delegating(agent_kind);
        store.save_isolation(&flag)?;
        let _ = store.append_event(EventKind::DelegationStartedV1 {
            agent_kind: agent_kind.to_string(),
            chunks: manifest.chunk_count,
            total_tokens,
            approximate: manifest.approximate,
        });

        Ok(DelegationReport {
            agent_kind: agent_kind.to_string(),
            chunks: manifest.chunk_count,
            total_tokens,
            token_budget: self.config.token_budget,
            approximate: manifest.approximate,
        })
    }

    /// Records from the first file-modifying tool invocation onward; earlier
    /// records are pre-work context from before the delegation was requested.
    /// Without such a record (or with the marker disabled) nothing is dropped.
    fn delegation_window<'a>(&self, turns: &'a [RawTurn]) -> &'a [RawTurn] {
        if !self.config.chunk_start_marker.enabled {
            return turns;
        }
        let start = turns.iter().position(|turn| {
            turn.tool_name
                .as_deref()
                .is_some_and(|tool| self.config.is_file_modifying(tool))
        });
        match start {
            Some(index) => &turns[index..],
            None => turns,
        }
    }

    /// Greedy packing in transcript order. A record that alone exceeds the
    /// budget becomes a chunk of its own, intact; content is never truncated
    /// or split mid-record.
    fn pack(
        &self,
        agent_kind: &str,
        records: Vec<TranscriptRecord>,
    ) -> Result<(Vec<TranscriptChunk>, u64)> {
        let mut chunks: Vec<TranscriptChunk> = Vec::new();
        let mut current: Vec<TranscriptRecord> = Vec::new();
        let mut current_tokens = 0usize;
        let mut total_tokens = 0u64;

        let flush = |current: &mut Vec<TranscriptRecord>, chunks: &mut Vec<TranscriptChunk>| {
            if current.is_empty() {
                return;
            }
            chunks.push(TranscriptChunk {
                sequence_number: chunks.len() as u32 + 1,
                agent_kind: agent_kind.to_string(),
                records: std::mem::take(current),
            });
        };

        for record in records {
            let record_tokens = self.counter.count(&serde_json::to_string(&record)?);
            total_tokens += record_tokens as u64;

            if record_tokens > self.config.token_budget {
                flush(&mut current, &mut chunks);
                current_tokens = 0;
                chunks.push(TranscriptChunk {
                    sequence_number: chunks.len() as u32 + 1,
                    agent_kind: agent_kind.to_string(),
                    records: vec![record],
                });
                continue;
            }
            if current_tokens + record_tokens > self.config.token_budget && !current.is_empty() {
                flush(&mut current, &mut chunks);
                current_tokens = 0;
            }
            current.push(record);
            current_tokens += record_tokens;
        }
        flush(&mut current, &mut chunks);
        Ok((chunks, total_tokens))
    }
}

/// Releases the isolation flag after the delegated run reports back. A flag
/// that already aged past the delegation horizon belongs to the watchdog: it
/// is reclaimed and journaled here, and the completion reports
/// `EngineError::StaleIsolation` instead of a clean release.
pub fn complete_delegation(
    store: &StateStore,
    cfg: &SessionsConfig,
    agent_kind: &str,
) -> Result<()> {
    let flag = store.load_isolation(agent_kind)?;
    if let IsolationFlag::Delegating { started_at, .. } = &flag {
        if flag.is_expired(cfg.max_delegation_minutes, Utc::now()) {
            let started_at = *started_at;
            store.clear_isolation(agent_kind)?;
            let _ = store.append_event(EventKind::StaleIsolationReclaimedV1 {
                agent_kind: agent_kind.to_string(),
                started_at,
            });
            return Err(EngineError::StaleIsolation {
                agent_kind: agent_kind.to_string(),
                started_at,
            }
            .into());
        }
    }
    store.clear_isolation(agent_kind)?;
    let _ = store.append_event(EventKind::DelegationCompletedV1 {
        agent_kind: agent_kind.to_string(),
    });
    Ok(())
}

/// Reduces raw turns to uniform {role, content} records. Tool invocations are
/// flattened to a one-line summary on the assistant side; turns with an
/// unrecognized role carry no conversational content and are dropped.
pub fn normalize(turns: &[RawTurn]) -> Vec<TranscriptRecord> {
    let mut records = Vec::with_capacity(turns.len());
    for turn in turns {
        if let Some(tool) = &turn.tool_name {
            records.push(TranscriptRecord {
                role: Role::Assistant,
                content: summarize_tool(tool, turn),
            });
            continue;
        }
        let role = match turn.role.to_ascii_lowercase().as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => continue,
        };
        records.push(TranscriptRecord {
            role,
            content: turn.content.clone().unwrap_or_default(),
        });
    }
    records
}

fn summarize_tool(tool: &str, turn: &RawTurn) -> String {
    let detail = match (&turn.content, &turn.tool_input) {
        (Some(content), _) if !content.is_empty() => content.clone(),
        (_, Some(input)) => serde_json::to_string(input).unwrap_or_default(),
        _ => String::new(),
    };
    if detail.is_empty() {
        format!("[tool:{tool}]")
    } else {
        format!("[tool:{tool}] {detail}")
    }
}
