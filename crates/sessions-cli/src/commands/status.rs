use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use sessions_core::{IsolationFlag, SessionsConfig};
use sessions_policy::ModeMachine;
use sessions_store::StateStore;
use std::path::Path;

use crate::output::print_json;

pub(crate) fn run_status(workspace: &Path) -> Result<()> {
    let cfg = SessionsConfig::load(workspace)?;
    let store = StateStore::open(workspace)?;
    let machine = ModeMachine::new(&cfg);

    let mode = machine.current(&store);
    let binding = store.load_binding().unwrap_or_default();
    let now = Utc::now();

    let mut delegations = Vec::new();
    for entry in store.scan_isolation()? {
        let Some(flag) = entry.flag else {
            delegations.push(json!({
                "agent_kind": entry.agent_kind,
                "started_at": null,
                "live": false,
            }));
            continue;
        };
        if let IsolationFlag::Delegating {
            agent_kind,
            started_at,
        } = &flag
        {
            delegations.push(json!({
                "agent_kind": agent_kind,
                "started_at": started_at,
                "live": flag.is_live(cfg.max_delegation_minutes, now),
            }));
        }
    }

    let summary = match &binding.task_id {
        Some(task_id) => format!(
            "[{mode}] task={task_id} branch={}",
            binding.branch.as_deref().unwrap_or("-")
        ),
        None => format!("[{mode}] no active task"),
    };
    let task = if binding.is_active() {
        json!({
            "task_id": binding.task_id,
            "branch": binding.branch,
            "modules": binding.modules,
        })
    } else {
        serde_json::Value::Null
    };

    print_json(&json!({
        "mode": mode.as_str(),
        "task": task,
        "delegations": delegations,
        "summary": summary,
    }))
}
