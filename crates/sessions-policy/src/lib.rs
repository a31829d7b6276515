use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sessions_core::{
    BlockReason, Decision, EngineError, EventKind, GateRequest, IsolationFlag, SessionMode,
    SessionsConfig, TaskBinding,
};
use sessions_store::StateStore;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

// ── Mode state machine ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ModeShift {
    pub from: SessionMode,
    pub to: SessionMode,
    /// Trigger phrase that fired, or `None` for an explicit command.
    pub trigger: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModeMachine {
    phrases: Vec<String>,
}

impl ModeMachine {
    pub fn new(cfg: &SessionsConfig) -> Self {
        Self {
            phrases: cfg.trigger_phrases.clone(),
        }
    }

    /// Current mode with the fail-safe applied: a missing or unreadable mode
    /// document reads as Discussion, the restrictive default.
    pub fn current(&self, store: &StateStore) -> SessionMode {
        match store.load_mode() {
            Ok(Some(doc)) => doc.mode,
            Ok(None) | Err(_) => SessionMode::Discussion,
        }
    }

    /// Scans user-authored text for trigger phrases. In Discussion mode the
    /// first configured phrase found as a case-insensitive substring moves the
    /// session to Implementation; the new mode is durable before this returns.
    pub fn observe_user_text(&self, store: &StateStore, text: &str) -> Result<Option<ModeShift>> {
        if self.current(store) != SessionMode::Discussion {
            return Ok(None);
        }
        let lowered = text.to_lowercase();
        let Some(matched) = self
            .phrases
            .iter()
            .find(|phrase| !phrase.is_empty() && lowered.contains(&phrase.to_lowercase()))
        else {
            return Ok(None);
        };
        store.save_mode(SessionMode::Implementation)?;
        let shift = ModeShift {
            from: SessionMode::Discussion,
            to: SessionMode::Implementation,
            trigger: Some(matched.clone()),
        };
        let _ = store.append_event(EventKind::ModeChangedV1 {
            from: shift.from,
            to: shift.to,
            trigger: shift.trigger.clone(),
        });
        Ok(Some(shift))
    }

    /// Explicit operator command, the only path back to Discussion.
    pub fn set_mode(&self, store: &StateStore, target: SessionMode) -> Result<ModeShift> {
        let from = self.current(store);
        store.save_mode(target)?;
        if from != target {
            let _ = store.append_event(EventKind::ModeChangedV1 {
                from,
                to: target,
                trigger: None,
            });
        }
        Ok(ModeShift {
            from,
            to: target,
            trigger: None,
        })
    }
}

// ── Module table ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ModuleTable {
    /// Prefix/module pairs, longest prefix first.
    roots: Vec<(String, String)>,
}

impl ModuleTable {
    pub fn from_config(cfg: &SessionsConfig) -> Self {
        let mut roots: Vec<(String, String)> = cfg
            .module_roots
            .iter()
            .map(|(prefix, module)| (normalize_path(prefix), module.clone()))
            .filter(|(prefix, _)| !prefix.is_empty())
            .collect();
        roots.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.0.cmp(&b.0)));
        Self { roots }
    }

    /// Longest-prefix lookup; with no table entry the first path component
    /// names the module, so top-level directories work unconfigured.
    /// Root-level files resolve to no module.
    pub fn module_for(&self, file_path: &str) -> Option<String> {
        let path = normalize_path(file_path);
        if path.is_empty() {
            return None;
        }
        for (prefix, module) in &self.roots {
            if path == *prefix || path.starts_with(&format!("{prefix}/")) {
                return Some(module.clone());
            }
        }
        let (first, rest) = path.split_once('/')?;
        if rest.is_empty() {
            return None;
        }
        Some(first.to_string())
    }
}

fn normalize_path(raw: &str) -> String {
    let mut path = raw.trim().replace('\\', "/");
    while let Some(stripped) = path.strip_prefix("./") {
        path = stripped.to_string();
    }
    path.trim_matches('/').to_string()
}

// ── Task binder ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TaskBinder {
    table: ModuleTable,
    branch_enforcement: bool,
}

impl TaskBinder {
    pub fn new(cfg: &SessionsConfig) -> Self {
        Self {
            table: ModuleTable::from_config(cfg),
            branch_enforcement: cfg.branch_enforcement.enabled,
        }
    }

    /// Replaces the binding wholesale. A rejected bind leaves the prior
    /// binding untouched on disk.
    pub fn bind(
        &self,
        store: &StateStore,
        task_id: &str,
        branch: &str,
        modules: BTreeSet<String>,
    ) -> Result<TaskBinding> {
        if task_id.trim().is_empty() {
            return Err(EngineError::InvalidBinding("task_id must not be empty".to_string()).into());
        }
        if branch.trim().is_empty() {
            return Err(EngineError::InvalidBinding(format!(
                "task {task_id} requires a branch"
            ))
            .into());
        }
        let binding = TaskBinding::bound(task_id.trim(), branch.trim(), modules);
        store.save_binding(&binding)?;
        let _ = store.append_event(EventKind::TaskBoundV1 {
            task_id: task_id.trim().to_string(),
            branch: branch.trim().to_string(),
            modules: binding.modules.iter().cloned().collect(),
        });
        Ok(binding)
    }

    pub fn unbind(&self, store: &StateStore) -> Result<TaskBinding> {
        let prior = store.load_binding().unwrap_or_default();
        let cleared = TaskBinding::none();
        store.save_binding(&cleared)?;
        let _ = store.append_event(EventKind::TaskUnboundV1 {
            task_id: prior.task_id,
        });
        Ok(cleared)
    }

    /// Membership test for the active task: no binding means unrestricted;
    /// with a binding, a file is owned only when its module is bound.
    pub fn owns(&self, binding: &TaskBinding, file_path: &str) -> bool {
        if !binding.is_active() {
            return true;
        }
        match self.table.module_for(file_path) {
            Some(module) => binding.modules.contains(&module),
            None => false,
        }
    }

    pub fn branch_matches(&self, binding: &TaskBinding, current_branch: &str) -> bool {
        if !binding.is_active() || !self.branch_enforcement {
            return true;
        }
        binding.branch.as_deref() == Some(current_branch)
    }

    /// Branch of the innermost repository containing `file_path`, walking up
    /// to the workspace root. Nested roots diverge independently, so the
    /// closest `.git` governs. `None` when no repository is found.
    pub fn resolve_branch(&self, workspace: &Path, file_path: &str) -> Option<String> {
        let file = {
            let p = Path::new(file_path);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                workspace.join(p)
            }
        };
        let mut dir = file.parent()?.to_path_buf();
        loop {
            if let Some(branch) = read_head(&dir.join(".git")) {
                return Some(branch);
            }
            if dir == *workspace || !dir.starts_with(workspace) {
                return None;
            }
            dir = dir.parent()?.to_path_buf();
        }
    }
}

/// Reads the current branch from a `.git` entry: either a repository
/// directory or a submodule/worktree gitfile pointing at one. A detached
/// HEAD yields the raw commit id.
fn read_head(git_entry: &Path) -> Option<String> {
    let head_path = if git_entry.is_dir() {
        git_entry.join("HEAD")
    } else if git_entry.is_file() {
        let raw = fs::read_to_string(git_entry).ok()?;
        let target = raw.trim().strip_prefix("gitdir:")?.trim();
        let git_dir = if Path::new(target).is_absolute() {
            PathBuf::from(target)
        } else {
            git_entry.parent()?.join(target)
        };
        git_dir.join("HEAD")
    } else {
        return None;
    };
    let head = fs::read_to_string(head_path).ok()?;
    let head = head.trim();
    match head.strip_prefix("ref:") {
        Some(reference) => Some(
            reference
                .trim()
                .strip_prefix("refs/heads/")
                .unwrap_or(reference.trim())
                .to_string(),
        ),
        None if head.is_empty() => None,
        None => Some(head.to_string()),
    }
}

// ── Tool gate ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ReclaimedDelegation {
    pub agent_kind: String,
    pub started_at: Option<DateTime<Utc>>,
}

pub struct ToolGate {
    workspace: PathBuf,
    blocked_tools: Vec<String>,
    max_delegation_minutes: i64,
    mode: ModeMachine,
    binder: TaskBinder,
}

impl ToolGate {
    pub fn new(workspace: &Path, cfg: &SessionsConfig) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            blocked_tools: cfg.blocked_tools.clone(),
            max_delegation_minutes: cfg.max_delegation_minutes,
            mode: ModeMachine::new(cfg),
            binder: TaskBinder::new(cfg),
        }
    }

    pub fn binder(&self) -> &TaskBinder {
        &self.binder
    }

    pub fn mode_machine(&self) -> &ModeMachine {
        &self.mode
    }

    /// The enforcement decision, in order: isolation exemption, then
    /// discussion-mode tool blocking, then branch and module scope. Pure over
    /// current state; store contents are never mutated here. Every internal
    /// failure resolves to a block rather than escaping.
    pub fn evaluate(&self, store: &StateStore, request: &GateRequest) -> Decision {
        self.evaluate_inner(store, request)
            .unwrap_or(Decision::Block {
                reason: BlockReason::StateUnavailable,
            })
    }

    fn evaluate_inner(&self, store: &StateStore, request: &GateRequest) -> Result<Decision> {
        let now = Utc::now();
        let delegating = store
            .scan_isolation()
            .map_err(|e| EngineError::StateUnavailable(e.to_string()))?
            .into_iter()
            .any(|entry| {
                entry
                    .flag
                    .is_some_and(|flag| flag.is_live(self.max_delegation_minutes, now))
            });
        if delegating {
            return Ok(Decision::Allow);
        }

        let mode = self.mode.current(store);
        if mode == SessionMode::Discussion
            && self
                .blocked_tools
                .iter()
                .any(|tool| tool == &request.tool_name)
        {
            return Ok(Decision::block(BlockReason::DiscussionMode));
        }

        // Unreadable binding degrades to the null binding per the state
        // taxonomy; a missing document already reads as null.
        let binding = store.load_binding().unwrap_or_default();
        if !binding.is_active() {
            return Ok(Decision::Allow);
        }

        for file in &request.target_files {
            let effective = self
                .binder
                .resolve_branch(&self.workspace, file)
                .unwrap_or_else(|| request.current_branch.clone());
            if !self.binder.branch_matches(&binding, &effective) {
                return Ok(Decision::block(BlockReason::BranchMismatch));
            }
        }
        if request.target_files.is_empty()
            && !self.binder.branch_matches(&binding, &request.current_branch)
        {
            return Ok(Decision::block(BlockReason::BranchMismatch));
        }

        if request
            .target_files
            .iter()
            .any(|file| !self.binder.owns(&binding, file))
        {
            return Ok(Decision::block(BlockReason::OutOfScopeFile));
        }

        Ok(Decision::Allow)
    }

    /// Watchdog pass run at each hook invocation: expired or unreadable
    /// isolation flags are cleared so policy cannot stay bypassed after a
    /// delegation dies without reporting completion.
    pub fn reclaim_stale(&self, store: &StateStore) -> Result<Vec<ReclaimedDelegation>> {
        let now = Utc::now();
        let mut reclaimed = Vec::new();
        for entry in store.scan_isolation()? {
            match entry.flag {
                Some(flag) if flag.is_live(self.max_delegation_minutes, now) => {}
                Some(IsolationFlag::Delegating {
                    agent_kind,
                    started_at,
                }) => {
                    store.clear_isolation(&agent_kind)?;
                    let _ = store.append_event(EventKind::StaleIsolationReclaimedV1 {
                        agent_kind: agent_kind.clone(),
                        started_at,
                    });
                    reclaimed.push(ReclaimedDelegation {
                        agent_kind,
                        started_at: Some(started_at),
                    });
                }
                Some(IsolationFlag::NotDelegating) | None => {
                    store.clear_isolation(&entry.agent_kind)?;
                    reclaimed.push(ReclaimedDelegation {
                        agent_kind: entry.agent_kind,
                        started_at: None,
                    });
                }
            }
        }
        Ok(reclaimed)
    }
}
