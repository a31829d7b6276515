use anyhow::Result;
use serde::Deserialize;
use serde_json::json;
use sessions_core::{
    BlockReason, Decision, EventEnvelope, EventKind, GateRequest, IsolationFlag, SessionsConfig,
    TaskBinding,
};
use sessions_observe::Observer;
use sessions_policy::{ModeMachine, ToolGate};
use sessions_store::StateStore;
use std::path::Path;

use crate::output::print_json;
use crate::util::{observer, read_stdin};

#[derive(Deserialize)]
struct PromptInput {
    #[serde(default)]
    prompt: String,
}

/// Gate hook. The host pipes a gate request on stdin and treats exit code 2
/// as a block; a decision JSON is emitted on every path, including internal
/// failures, which resolve to `state-unavailable` blocks.
pub(crate) fn run_pre_tool_use(workspace: &Path, verbose: bool) -> Result<()> {
    let decision = match gate_from_stdin(workspace, verbose) {
        Ok(decision) => decision,
        Err(err) => {
            eprintln!("[sessions WARN] gate evaluation failed: {err:#}");
            Decision::block(BlockReason::StateUnavailable)
        }
    };
    print_json(&decision.response())?;
    if !decision.is_allow() {
        std::process::exit(2);
    }
    Ok(())
}

fn gate_from_stdin(workspace: &Path, verbose: bool) -> Result<Decision> {
    let request: GateRequest = serde_json::from_str(&read_stdin()?)?;
    let cfg = SessionsConfig::load(workspace)?;
    let store = StateStore::open(workspace)?;
    let obs = observer(workspace, verbose)?;
    let gate = ToolGate::new(workspace, &cfg);

    sweep_stale(&gate, &store, &obs);
    if store.load_mode().is_err() {
        obs.warn_log("mode document unreadable, treating as discussion");
    }
    if store.load_binding().is_err() {
        obs.warn_log("task document unreadable, treating as unbound");
    }

    let decision = gate.evaluate(&store, &request);
    if let Decision::Block { reason } = &decision {
        let kind = EventKind::GateDecisionV1 {
            tool_name: request.tool_name.clone(),
            reason: reason.as_str().to_string(),
        };
        let _ = obs.record_event(&EventEnvelope::new(kind.clone()));
        let _ = store.append_event(kind);
        obs.verbose_log(&format!("blocked {}: {reason}", request.tool_name));
    }
    Ok(decision)
}

pub(crate) fn run_user_prompt(workspace: &Path, verbose: bool) -> Result<()> {
    let input: PromptInput = serde_json::from_str(&read_stdin()?)?;
    let cfg = SessionsConfig::load(workspace)?;
    let store = StateStore::open(workspace)?;
    let obs = observer(workspace, verbose)?;
    let machine = ModeMachine::new(&cfg);

    let shift = machine.observe_user_text(&store, &input.prompt)?;
    if let Some(shift) = &shift {
        obs.verbose_log(&format!(
            "mode {} -> {} (trigger: {})",
            shift.from,
            shift.to,
            shift.trigger.as_deref().unwrap_or("-")
        ));
    }
    print_json(&json!({
        "mode": machine.current(&store).as_str(),
        "changed": shift.is_some(),
        "matched_phrase": shift.and_then(|s| s.trigger),
    }))
}

/// Startup context for prompt injection: current mode, the active task when
/// task detection is on, and any in-flight delegations. Also the second place
/// the stale-flag watchdog runs, so flags orphaned by a crashed sub-agent are
/// reclaimed no later than the next session.
pub(crate) fn run_session_start(workspace: &Path, verbose: bool) -> Result<()> {
    let cfg = SessionsConfig::load(workspace)?;
    let store = StateStore::open(workspace)?;
    let obs = observer(workspace, verbose)?;
    let gate = ToolGate::new(workspace, &cfg);

    sweep_stale(&gate, &store, &obs);

    let mode = gate.mode_machine().current(&store);
    let binding = match store.load_binding() {
        Ok(binding) => binding,
        Err(_) => {
            obs.warn_log("task document unreadable, treating as unbound");
            TaskBinding::none()
        }
    };
    let task = if cfg.task_detection.enabled && binding.is_active() {
        json!({
            "task_id": binding.task_id,
            "branch": binding.branch,
            "modules": binding.modules,
        })
    } else {
        serde_json::Value::Null
    };
    let delegations: Vec<serde_json::Value> = store
        .scan_isolation()?
        .into_iter()
        .filter_map(|entry| match entry.flag {
            Some(IsolationFlag::Delegating {
                agent_kind,
                started_at,
            }) => Some(json!({
                "agent_kind": agent_kind,
                "started_at": started_at,
            })),
            _ => None,
        })
        .collect();

    print_json(&json!({
        "mode": mode.as_str(),
        "task": task,
        "delegations": delegations,
    }))
}

fn sweep_stale(gate: &ToolGate, store: &StateStore, obs: &Observer) {
    match gate.reclaim_stale(store) {
        Ok(reclaimed) => {
            for entry in &reclaimed {
                obs.warn_log(&format!(
                    "reclaimed stale delegation flag for {}",
                    entry.agent_kind
                ));
            }
        }
        Err(err) => obs.warn_log(&format!("stale delegation sweep failed: {err:#}")),
    }
}
