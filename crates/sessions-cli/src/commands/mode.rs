use anyhow::{Result, anyhow};
use serde_json::json;
use sessions_core::{SessionMode, SessionsConfig};
use sessions_policy::ModeMachine;
use sessions_store::StateStore;
use std::path::Path;

use crate::output::print_json;
use crate::util::observer;

pub(crate) fn run_mode_show(workspace: &Path) -> Result<()> {
    let cfg = SessionsConfig::load(workspace)?;
    let store = StateStore::open(workspace)?;
    let machine = ModeMachine::new(&cfg);
    print_json(&json!({"mode": machine.current(&store).as_str()}))
}

pub(crate) fn run_mode_set(workspace: &Path, raw: &str, verbose: bool) -> Result<()> {
    let target = SessionMode::parse(raw)
        .ok_or_else(|| anyhow!("unknown mode {raw:?}; expected discussion or implementation"))?;
    let cfg = SessionsConfig::load(workspace)?;
    let store = StateStore::open(workspace)?;
    let obs = observer(workspace, verbose)?;
    let machine = ModeMachine::new(&cfg);

    let shift = machine.set_mode(&store, target)?;
    if shift.from != shift.to {
        obs.verbose_log(&format!("mode {} -> {}", shift.from, shift.to));
    }
    print_json(&json!({
        "mode": shift.to.as_str(),
        "changed": shift.from != shift.to,
    }))
}
