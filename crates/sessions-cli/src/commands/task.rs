use anyhow::Result;
use serde_json::json;
use sessions_core::SessionsConfig;
use sessions_policy::TaskBinder;
use sessions_store::StateStore;
use std::collections::BTreeSet;
use std::path::Path;

use crate::TaskBindArgs;
use crate::output::print_json;
use crate::util::observer;

pub(crate) fn run_task_bind(workspace: &Path, args: TaskBindArgs, verbose: bool) -> Result<()> {
    let cfg = SessionsConfig::load(workspace)?;
    let store = StateStore::open(workspace)?;
    let obs = observer(workspace, verbose)?;
    let binder = TaskBinder::new(&cfg);

    let modules: BTreeSet<String> = args.modules.into_iter().collect();
    let binding = binder.bind(&store, &args.task, &args.branch, modules)?;
    obs.verbose_log(&format!(
        "bound task {} to branch {}",
        args.task, args.branch
    ));
    print_json(&json!({
        "task_id": binding.task_id,
        "branch": binding.branch,
        "modules": binding.modules,
    }))
}

pub(crate) fn run_task_unbind(workspace: &Path, verbose: bool) -> Result<()> {
    let cfg = SessionsConfig::load(workspace)?;
    let store = StateStore::open(workspace)?;
    let obs = observer(workspace, verbose)?;
    let binder = TaskBinder::new(&cfg);

    binder.unbind(&store)?;
    obs.verbose_log("task binding cleared");
    print_json(&json!({"unbound": true}))
}

pub(crate) fn run_task_show(workspace: &Path) -> Result<()> {
    let store = StateStore::open(workspace)?;
    let binding = store.load_binding()?;
    print_json(&json!({
        "task_id": binding.task_id,
        "branch": binding.branch,
        "modules": binding.modules,
        "updated_at": binding.updated_at,
    }))
}
