use anyhow::{Result, anyhow};
use serde_json::json;
use sessions_core::{DelegationRequest, EngineError, RawTurn, SessionsConfig};
use sessions_handoff::{HandoffEngine, complete_delegation};
use sessions_store::StateStore;
use std::path::Path;

use crate::output::print_json;
use crate::util::{observer, read_stdin};

pub(crate) fn run_delegate(workspace: &Path, agent: &str, verbose: bool) -> Result<()> {
    let turns = parse_transcript(&read_stdin()?, agent)?;
    let cfg = SessionsConfig::load(workspace)?;
    let store = StateStore::open(workspace)?;
    let obs = observer(workspace, verbose)?;

    let engine = HandoffEngine::new(&cfg);
    if let Some(note) = engine.degraded() {
        obs.warn_log(note);
    }
    let report = engine.delegate(&store, agent, &turns)?;
    obs.verbose_log(&format!(
        "handoff for {} packed into {} chunks ({} tokens)",
        report.agent_kind, report.chunks, report.total_tokens
    ));
    print_json(&report)
}

/// A completion that arrives after the delegation horizon still clears the
/// flag; it is reported as stale, never as a command failure.
pub(crate) fn run_complete(workspace: &Path, agent: &str, verbose: bool) -> Result<()> {
    let cfg = SessionsConfig::load(workspace)?;
    let store = StateStore::open(workspace)?;
    let obs = observer(workspace, verbose)?;
    match complete_delegation(&store, &cfg, agent) {
        Ok(()) => {
            obs.verbose_log(&format!("delegation for {agent} completed"));
            print_json(&json!({"agent_kind": agent, "completed": true}))
        }
        Err(err) => match err.downcast_ref::<EngineError>() {
            Some(EngineError::StaleIsolation { .. }) => {
                obs.warn_log(&format!("delegation for {agent} went stale, flag reclaimed"));
                print_json(&json!({"agent_kind": agent, "completed": true, "stale": true}))
            }
            _ => Err(err),
        },
    }
}

/// Stdin carries either the full delegation request envelope or a bare array
/// of raw turns; the `--agent` flag names the recipient either way.
fn parse_transcript(raw: &str, agent: &str) -> Result<Vec<RawTurn>> {
    if let Ok(request) = serde_json::from_str::<DelegationRequest>(raw) {
        if !request.agent_kind.is_empty() && request.agent_kind != agent {
            return Err(anyhow!(
                "transcript addressed to {:?} but --agent is {agent:?}",
                request.agent_kind
            ));
        }
        return Ok(request.raw_transcript);
    }
    Ok(serde_json::from_str(raw)?)
}
