use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = anyhow::Result<T>;

pub const DEFAULT_TOKEN_BUDGET: usize = 18_000;
pub const DEFAULT_MAX_DELEGATION_MINUTES: i64 = 30;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".sessions")
}

pub fn state_dir(workspace: &Path) -> PathBuf {
    runtime_dir(workspace).join("state")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    #[default]
    Discussion,
    Implementation,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Discussion => "discussion",
            SessionMode::Implementation => "implementation",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "discussion" | "d" => Some(SessionMode::Discussion),
            "implementation" | "i" | "impl" => Some(SessionMode::Implementation),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeDocument {
    pub mode: SessionMode,
    pub updated_at: DateTime<Utc>,
}

impl ModeDocument {
    pub fn new(mode: SessionMode) -> Self {
        Self {
            mode,
            updated_at: Utc::now(),
        }
    }
}

/// The active task/branch/module association. `task_id == None` is the single
/// null state: branch and modules must be empty alongside it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBinding {
    pub task_id: Option<String>,
    pub branch: Option<String>,
    #[serde(default)]
    pub modules: BTreeSet<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskBinding {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn bound(task_id: &str, branch: &str, modules: BTreeSet<String>) -> Self {
        Self {
            task_id: Some(task_id.to_string()),
            branch: Some(branch.to_string()),
            modules,
            updated_at: Some(Utc::now()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.task_id.is_some()
    }

    pub fn is_consistent(&self) -> bool {
        match self.task_id {
            Some(_) => self.branch.as_ref().is_some_and(|b| !b.is_empty()),
            None => self.branch.is_none() && self.modules.is_empty(),
        }
    }
}

/// Delegation marker, one document per agent kind. Absence on disk decodes as
/// `NotDelegating`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IsolationFlag {
    NotDelegating,
    Delegating {
        agent_kind: String,
        started_at: DateTime<Utc>,
    },
}

impl IsolationFlag {
    pub fn delegating(agent_kind: &str) -> Self {
        IsolationFlag::Delegating {
            agent_kind: agent_kind.to_string(),
            started_at: Utc::now(),
        }
    }

    pub fn is_live(&self, max_minutes: i64, now: DateTime<Utc>) -> bool {
        match self {
            IsolationFlag::NotDelegating => false,
            IsolationFlag::Delegating { started_at, .. } => {
                now.signed_duration_since(*started_at) <= Duration::minutes(max_minutes)
            }
        }
    }

    pub fn is_expired(&self, max_minutes: i64, now: DateTime<Utc>) -> bool {
        matches!(self, IsolationFlag::Delegating { .. }) && !self.is_live(max_minutes, now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub role: Role,
    pub content: String,
}

/// One raw turn as supplied by the host in a delegation request. Tool
/// invocations carry `tool_name`; plain turns carry text only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTurn {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationRequest {
    #[serde(default)]
    pub agent_kind: String,
    #[serde(default)]
    pub raw_transcript: Vec<RawTurn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptChunk {
    pub sequence_number: u32,
    pub agent_kind: String,
    pub records: Vec<TranscriptRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub agent_kind: String,
    pub chunk_count: u32,
    pub token_budget: usize,
    pub total_tokens: u64,
    pub approximate: bool,
    pub written_at: DateTime<Utc>,
}

// ── Host gate contract ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRequest {
    pub tool_name: String,
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub current_branch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockReason {
    DiscussionMode,
    BranchMismatch,
    OutOfScopeFile,
    StateUnavailable,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::DiscussionMode => "discussion-mode",
            BlockReason::BranchMismatch => "branch-mismatch",
            BlockReason::OutOfScopeFile => "out-of-scope-file",
            BlockReason::StateUnavailable => "state-unavailable",
        }
    }
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block { reason: BlockReason },
}

impl Decision {
    pub fn block(reason: BlockReason) -> Self {
        Decision::Block { reason }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn response(&self) -> GateResponse {
        match self {
            Decision::Allow => GateResponse {
                decision: "allow".to_string(),
                reason: None,
            },
            Decision::Block { reason } => GateResponse {
                decision: "block".to_string(),
                reason: Some(reason.as_str().to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResponse {
    pub decision: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

// ── Error taxonomy ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("state unavailable: {0}")]
    StateUnavailable(String),
    #[error("invalid binding: {0}")]
    InvalidBinding(String),
    #[error("tokenizer unavailable: {0}")]
    TokenizerUnavailable(String),
    #[error("stale isolation flag for {agent_kind} started {started_at}")]
    StaleIsolation {
        agent_kind: String,
        started_at: DateTime<Utc>,
    },
}

// ── Journal events ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

impl EventEnvelope {
    pub fn new(kind: EventKind) -> Self {
        Self {
            at: Utc::now(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    ModeChangedV1 {
        from: SessionMode,
        to: SessionMode,
        trigger: Option<String>,
    },
    TaskBoundV1 {
        task_id: String,
        branch: String,
        modules: Vec<String>,
    },
    TaskUnboundV1 {
        task_id: Option<String>,
    },
    GateDecisionV1 {
        tool_name: String,
        reason: String,
    },
    DelegationStartedV1 {
        agent_kind: String,
        chunks: u32,
        total_tokens: u64,
        approximate: bool,
    },
    DelegationCompletedV1 {
        agent_kind: String,
    },
    StaleIsolationReclaimedV1 {
        agent_kind: String,
        started_at: DateTime<Utc>,
    },
}

// ── Configuration ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub trigger_phrases: Vec<String>,
    pub blocked_tools: Vec<String>,
    pub branch_enforcement: BranchEnforcement,
    pub task_detection: TaskDetection,
    pub module_roots: BTreeMap<String, String>,
    pub token_budget: usize,
    pub max_delegation_minutes: i64,
    pub tokenizer_file: Option<PathBuf>,
    pub chunk_start_marker: ChunkStartMarker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchEnforcement {
    pub enabled: bool,
}

impl Default for BranchEnforcement {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDetection {
    pub enabled: bool,
}

impl Default for TaskDetection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkStartMarker {
    pub enabled: bool,
}

impl Default for ChunkStartMarker {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_trigger_phrases() -> Vec<String> {
    ["make it so", "run that", "go ahead", "yert"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_blocked_tools() -> Vec<String> {
    ["Edit", "Write", "MultiEdit", "NotebookEdit"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            trigger_phrases: default_trigger_phrases(),
            blocked_tools: default_blocked_tools(),
            branch_enforcement: BranchEnforcement::default(),
            task_detection: TaskDetection::default(),
            module_roots: BTreeMap::new(),
            token_budget: DEFAULT_TOKEN_BUDGET,
            max_delegation_minutes: DEFAULT_MAX_DELEGATION_MINUTES,
            tokenizer_file: None,
            chunk_start_marker: ChunkStartMarker::default(),
        }
    }
}

impl SessionsConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".sessions/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    /// Layered load: built-in defaults, then user, project, and project-local
    /// settings files, later layers winning key by key.
    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;
        let layers = [
            Self::user_settings_path(),
            Some(Self::project_settings_path(workspace)),
            Some(Self::project_local_settings_path(workspace)),
        ];
        for path in layers.into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let overlay: serde_json::Value = serde_json::from_str(&fs::read_to_string(path)?)?;
            merge_layer(&mut merged, &overlay);
        }
        Ok(serde_json::from_value(merged)?)
    }

    pub fn is_tool_blocked(&self, tool_name: &str) -> bool {
        self.blocked_tools.iter().any(|t| t == tool_name)
    }

    /// File-modifying tools double as the delegation start boundary: records
    /// before the first such invocation are pre-work context.
    pub fn is_file_modifying(&self, tool_name: &str) -> bool {
        self.is_tool_blocked(tool_name)
    }
}

/// Deep-merge for settings layers. Objects merge key by key; scalars and
/// arrays from the overlay replace the base value wholesale.
fn merge_layer(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    if let (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) =
        (&mut *base, overlay)
    {
        for (key, value) in overlay_map {
            match base_map.get_mut(key) {
                Some(slot) => merge_layer(slot, value),
                None => {
                    base_map.insert(key.clone(), value.clone());
                }
            }
        }
        return;
    }
    *base = overlay.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use uuid::Uuid;

    fn temp_workspace(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sessions-core-{label}-{}", Uuid::now_v7()));
        fs::create_dir_all(&dir).expect("create temp workspace");
        dir
    }

    #[test]
    fn default_mode_is_discussion() {
        assert_eq!(SessionMode::default(), SessionMode::Discussion);
        let doc: ModeDocument =
            serde_json::from_str(r#"{"mode":"discussion","updated_at":"2026-01-01T00:00:00Z"}"#)
                .expect("mode doc");
        assert_eq!(doc.mode, SessionMode::Discussion);
    }

    #[test]
    fn mode_parse_accepts_short_forms() {
        assert_eq!(SessionMode::parse("I"), Some(SessionMode::Implementation));
        assert_eq!(SessionMode::parse(" discussion "), Some(SessionMode::Discussion));
        assert_eq!(SessionMode::parse("nope"), None);
    }

    #[test]
    fn null_binding_is_consistent_and_inactive() {
        let binding = TaskBinding::none();
        assert!(!binding.is_active());
        assert!(binding.is_consistent());
    }

    #[test]
    fn bound_binding_requires_branch() {
        let binding = TaskBinding {
            task_id: Some("auth".to_string()),
            branch: None,
            modules: BTreeSet::new(),
            updated_at: None,
        };
        assert!(!binding.is_consistent());
    }

    #[test]
    fn isolation_flag_expiry_uses_started_at() {
        let started = Utc::now() - Duration::minutes(45);
        let flag = IsolationFlag::Delegating {
            agent_kind: "context-refinement".to_string(),
            started_at: started,
        };
        assert!(flag.is_expired(30, Utc::now()));
        assert!(!flag.is_live(30, Utc::now()));
        let fresh = IsolationFlag::delegating("logging");
        assert!(fresh.is_live(30, Utc::now()));
        assert!(!IsolationFlag::NotDelegating.is_live(30, Utc::now()));
    }

    #[test]
    fn isolation_flag_serde_is_tagged() {
        let flag = IsolationFlag::delegating("context-refinement");
        let value = serde_json::to_value(&flag).expect("serialize flag");
        assert_eq!(value["state"], "delegating");
        assert_eq!(value["agent_kind"], "context-refinement");
    }

    #[test]
    fn block_reasons_render_kebab_case() {
        assert_eq!(BlockReason::DiscussionMode.as_str(), "discussion-mode");
        assert_eq!(BlockReason::OutOfScopeFile.as_str(), "out-of-scope-file");
        let response = Decision::block(BlockReason::BranchMismatch).response();
        assert_eq!(response.decision, "block");
        assert_eq!(response.reason.as_deref(), Some("branch-mismatch"));
        let allow = Decision::Allow.response();
        assert_eq!(allow.decision, "allow");
        assert!(allow.reason.is_none());
    }

    #[test]
    fn gate_request_defaults_optional_fields() {
        let req: GateRequest =
            serde_json::from_str(r#"{"tool_name":"Write"}"#).expect("gate request");
        assert!(req.target_files.is_empty());
        assert!(req.current_branch.is_empty());
    }

    #[test]
    fn event_kind_serializes_with_type_and_payload() {
        let envelope = EventEnvelope::new(EventKind::GateDecisionV1 {
            tool_name: "Edit".to_string(),
            reason: "discussion-mode".to_string(),
        });
        let value = serde_json::to_value(&envelope).expect("serialize envelope");
        assert_eq!(value["kind"]["type"], "GateDecisionV1");
        assert_eq!(value["kind"]["payload"]["tool_name"], "Edit");
    }

    #[test]
    fn config_defaults_match_installation_defaults() {
        let cfg = SessionsConfig::default();
        assert!(cfg.trigger_phrases.iter().any(|p| p == "go ahead"));
        assert!(cfg.is_tool_blocked("Edit"));
        assert!(!cfg.is_tool_blocked("Read"));
        assert_eq!(cfg.token_budget, 18_000);
        assert!(cfg.branch_enforcement.enabled);
    }

    #[test]
    fn config_load_layers_project_over_defaults() {
        let workspace = temp_workspace("config");
        let home = temp_workspace("config-home");
        fs::create_dir_all(runtime_dir(&workspace)).expect("runtime dir");
        fs::write(
            SessionsConfig::project_settings_path(&workspace),
            r#"{"token_budget": 9000, "branch_enforcement": {"enabled": false}}"#,
        )
        .expect("project settings");
        fs::write(
            SessionsConfig::project_local_settings_path(&workspace),
            r#"{"trigger_phrases": ["ship it"]}"#,
        )
        .expect("local settings");

        let previous_home = std::env::var("HOME").ok();
        // SAFETY: test-only environment mutation.
        unsafe {
            std::env::set_var("HOME", &home);
        }

        let cfg = SessionsConfig::load(&workspace).expect("load config");

        match previous_home {
            Some(value) => {
                // SAFETY: test-only environment mutation.
                unsafe {
                    std::env::set_var("HOME", value);
                }
            }
            None => {
                // SAFETY: test-only environment mutation.
                unsafe {
                    std::env::remove_var("HOME");
                }
            }
        }

        assert_eq!(cfg.token_budget, 9000);
        assert!(!cfg.branch_enforcement.enabled);
        assert_eq!(cfg.trigger_phrases, vec!["ship it".to_string()]);
        assert!(cfg.is_tool_blocked("Write"));

        fs::remove_dir_all(&workspace).ok();
        fs::remove_dir_all(&home).ok();
    }

    proptest! {
        #[test]
        fn overlay_wins_and_relayering_is_stable(
            base in prop::collection::btree_map("[a-d]{1,5}", "[a-z]{0,6}", 0..10),
            overlay in prop::collection::btree_map("[a-d]{1,5}", "[a-z]{0,6}", 0..10),
        ) {
            let mut layered = json!(base);
            let overlay_value = json!(overlay.clone());
            merge_layer(&mut layered, &overlay_value);
            for (key, value) in &overlay {
                prop_assert_eq!(
                    layered.get(key).and_then(|v| v.as_str()),
                    Some(value.as_str())
                );
            }
            let once = layered.clone();
            merge_layer(&mut layered, &overlay_value);
            prop_assert_eq!(layered, once);
        }

        #[test]
        fn bound_bindings_round_trip_consistently(
            task in "[a-z]{1,12}",
            branch in "[a-z/-]{1,16}",
            modules in prop::collection::btree_set("[a-z]{1,8}", 0..5),
        ) {
            prop_assume!(!branch.is_empty());
            let binding = TaskBinding::bound(&task, &branch, modules);
            prop_assert!(binding.is_consistent());
            let raw = serde_json::to_string(&binding).expect("serialize binding");
            let back: TaskBinding = serde_json::from_str(&raw).expect("deserialize binding");
            prop_assert_eq!(binding, back);
        }
    }
}
