use assert_cmd::Command;
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

#[test]
fn fresh_workspace_blocks_file_modifying_tools() {
    let workspace = TempDir::new().expect("workspace");
    let (decision, code) = gate(
        workspace.path(),
        json!({
            "tool_name": "Edit",
            "target_files": ["src/main.rs"],
            "current_branch": "main",
        }),
    );
    assert_eq!(decision["decision"], "block");
    assert_eq!(decision["reason"], "discussion-mode");
    assert_eq!(code, 2);

    let (decision, code) = gate(
        workspace.path(),
        json!({
            "tool_name": "Read",
            "target_files": ["src/main.rs"],
            "current_branch": "main",
        }),
    );
    assert_eq!(decision["decision"], "allow");
    assert!(decision.get("reason").is_none());
    assert_eq!(code, 0);
}

#[test]
fn trigger_phrase_moves_session_into_implementation() {
    let workspace = TempDir::new().expect("workspace");
    let out = run_json_stdin(
        workspace.path(),
        &["hook", "user-prompt"],
        &json!({"prompt": "Looks right. Go ahead and apply it."}).to_string(),
    );
    assert_eq!(out["changed"], true);
    assert_eq!(out["mode"], "implementation");
    assert_eq!(out["matched_phrase"], "go ahead");

    let (decision, code) = gate(
        workspace.path(),
        json!({
            "tool_name": "Edit",
            "target_files": ["src/main.rs"],
            "current_branch": "main",
        }),
    );
    assert_eq!(decision["decision"], "allow");
    assert_eq!(code, 0);

    // No phrase moves the session back; only the explicit command does.
    let out = run_json_stdin(
        workspace.path(),
        &["hook", "user-prompt"],
        &json!({"prompt": "stop, let's discuss this first"}).to_string(),
    );
    assert_eq!(out["changed"], false);
    assert_eq!(out["mode"], "implementation");
}

#[test]
fn mode_set_is_the_explicit_route_back_to_discussion() {
    let workspace = TempDir::new().expect("workspace");
    let set = run_json(workspace.path(), &["mode", "set", "implementation"]);
    assert_eq!(set["mode"], "implementation");
    assert_eq!(set["changed"], true);

    let shown = run_json(workspace.path(), &["mode", "show"]);
    assert_eq!(shown["mode"], "implementation");

    let set = run_json(workspace.path(), &["mode", "set", "discussion"]);
    assert_eq!(set["changed"], true);

    let (decision, code) = gate(
        workspace.path(),
        json!({
            "tool_name": "Write",
            "target_files": ["notes.md"],
            "current_branch": "main",
        }),
    );
    assert_eq!(decision["reason"], "discussion-mode");
    assert_eq!(code, 2);
}

#[test]
fn mode_set_rejects_unknown_modes() {
    let workspace = TempDir::new().expect("workspace");
    Command::new(assert_cmd::cargo::cargo_bin!("sessions"))
        .current_dir(workspace.path())
        .args(["mode", "set", "autopilot"])
        .assert()
        .failure();
}

#[test]
fn bound_task_scopes_files_and_branch() {
    let workspace = TempDir::new().expect("workspace");
    let _ = run_json(workspace.path(), &["mode", "set", "implementation"]);
    let bound = run_json(
        workspace.path(),
        &[
            "task",
            "bind",
            "--task",
            "auth",
            "--branch",
            "feature/auth",
            "--module",
            "api",
        ],
    );
    assert_eq!(bound["task_id"], "auth");
    assert_eq!(bound["branch"], "feature/auth");

    let (decision, code) = gate(
        workspace.path(),
        json!({
            "tool_name": "Edit",
            "target_files": ["api/login.go"],
            "current_branch": "feature/auth",
        }),
    );
    assert_eq!(decision["decision"], "allow");
    assert_eq!(code, 0);

    let (decision, code) = gate(
        workspace.path(),
        json!({
            "tool_name": "Edit",
            "target_files": ["web/ui.go"],
            "current_branch": "feature/auth",
        }),
    );
    assert_eq!(decision["reason"], "out-of-scope-file");
    assert_eq!(code, 2);

    let (decision, code) = gate(
        workspace.path(),
        json!({
            "tool_name": "Edit",
            "target_files": ["api/login.go"],
            "current_branch": "main",
        }),
    );
    assert_eq!(decision["reason"], "branch-mismatch");
    assert_eq!(code, 2);

    let unbound = run_json(workspace.path(), &["task", "unbind"]);
    assert_eq!(unbound["unbound"], true);

    let (decision, _) = gate(
        workspace.path(),
        json!({
            "tool_name": "Edit",
            "target_files": ["web/ui.go"],
            "current_branch": "main",
        }),
    );
    assert_eq!(decision["decision"], "allow");
}

#[test]
fn malformed_gate_input_fails_closed() {
    let workspace = TempDir::new().expect("workspace");
    let output = Command::new(assert_cmd::cargo::cargo_bin!("sessions"))
        .current_dir(workspace.path())
        .args(["hook", "pre-tool-use"])
        .write_stdin("not json at all")
        .assert()
        .code(2)
        .get_output()
        .stdout
        .clone();
    let decision: Value = serde_json::from_slice(&output).expect("decision json");
    assert_eq!(decision["decision"], "block");
    assert_eq!(decision["reason"], "state-unavailable");
}

#[test]
fn delegation_round_trip_raises_and_releases_the_flag() {
    let workspace = TempDir::new().expect("workspace");
    let transcript = json!({
        "raw_transcript": [
            {"role": "user", "content": "please fix the token refresh"},
            {"role": "assistant", "tool_name": "Edit",
             "tool_input": {"file_path": "api/token.go"}},
            {"role": "assistant", "content": "refresh handler rewritten"},
        ]
    });
    let report = run_json_stdin(
        workspace.path(),
        &["delegate", "--agent", "context-refinement"],
        &transcript.to_string(),
    );
    assert_eq!(report["agent_kind"], "context-refinement");
    assert!(report["chunks"].as_u64().is_some_and(|c| c >= 1));
    assert_eq!(report["approximate"], true);
    assert!(
        workspace
            .path()
            .join(".sessions/state/chunks/context-refinement/manifest.json")
            .exists()
    );

    // A live delegation bypasses the gate entirely, discussion mode included.
    let (decision, code) = gate(
        workspace.path(),
        json!({
            "tool_name": "Edit",
            "target_files": ["api/token.go"],
            "current_branch": "main",
        }),
    );
    assert_eq!(decision["decision"], "allow");
    assert_eq!(code, 0);

    let status = run_json(workspace.path(), &["status"]);
    let delegations = status["delegations"].as_array().expect("delegations");
    assert_eq!(delegations.len(), 1);
    assert_eq!(delegations[0]["agent_kind"], "context-refinement");
    assert_eq!(delegations[0]["live"], true);

    let completed = run_json(
        workspace.path(),
        &["complete", "--agent", "context-refinement"],
    );
    assert_eq!(completed["completed"], true);

    let (decision, code) = gate(
        workspace.path(),
        json!({
            "tool_name": "Edit",
            "target_files": ["api/token.go"],
            "current_branch": "main",
        }),
    );
    assert_eq!(decision["reason"], "discussion-mode");
    assert_eq!(code, 2);
}

#[test]
fn stale_delegation_is_reclaimed_by_the_next_hook() {
    let workspace = TempDir::new().expect("workspace");
    let isolation_dir = workspace.path().join(".sessions/state/isolation");
    fs::create_dir_all(&isolation_dir).expect("isolation dir");
    fs::write(
        isolation_dir.join("code-review.json"),
        r#"{"state":"delegating","agent_kind":"code-review","started_at":"2020-01-01T00:00:00Z"}"#,
    )
    .expect("stale flag");

    // An expired flag grants no bypass.
    let (decision, code) = gate(
        workspace.path(),
        json!({
            "tool_name": "Edit",
            "target_files": ["src/main.rs"],
            "current_branch": "main",
        }),
    );
    assert_eq!(decision["reason"], "discussion-mode");
    assert_eq!(code, 2);

    // And the sweep reclaimed it on the way through.
    let status = run_json(workspace.path(), &["status"]);
    assert!(
        status["delegations"]
            .as_array()
            .is_some_and(|d| d.is_empty())
    );
    let journal = fs::read_to_string(workspace.path().join(".sessions/state/events.jsonl"))
        .expect("journal");
    assert!(journal.contains("StaleIsolationReclaimedV1"));
}

#[test]
fn late_completion_reports_stale_but_succeeds() {
    let workspace = TempDir::new().expect("workspace");
    let isolation_dir = workspace.path().join(".sessions/state/isolation");
    fs::create_dir_all(&isolation_dir).expect("isolation dir");
    fs::write(
        isolation_dir.join("code-review.json"),
        r#"{"state":"delegating","agent_kind":"code-review","started_at":"2020-01-01T00:00:00Z"}"#,
    )
    .expect("expired flag");

    let completed = run_json(workspace.path(), &["complete", "--agent", "code-review"]);
    assert_eq!(completed["completed"], true);
    assert_eq!(completed["stale"], true);

    let status = run_json(workspace.path(), &["status"]);
    assert!(
        status["delegations"]
            .as_array()
            .is_some_and(|d| d.is_empty())
    );
}

#[test]
fn session_start_reports_mode_task_and_delegations() {
    let workspace = TempDir::new().expect("workspace");
    let _ = run_json(
        workspace.path(),
        &[
            "task",
            "bind",
            "--task",
            "auth",
            "--branch",
            "feature/auth",
            "--module",
            "api",
        ],
    );

    let context = run_json(workspace.path(), &["hook", "session-start"]);
    assert_eq!(context["mode"], "discussion");
    assert_eq!(context["task"]["task_id"], "auth");
    assert_eq!(context["task"]["branch"], "feature/auth");
    assert!(
        context["delegations"]
            .as_array()
            .is_some_and(|d| d.is_empty())
    );
}

#[test]
fn status_summary_names_mode_and_task() {
    let workspace = TempDir::new().expect("workspace");
    let status = run_json(workspace.path(), &["status"]);
    assert_eq!(status["mode"], "discussion");
    assert!(status["task"].is_null());
    assert!(
        status["summary"]
            .as_str()
            .is_some_and(|s| s.contains("discussion") && s.contains("no active task"))
    );

    let _ = run_json(
        workspace.path(),
        &[
            "task", "bind", "--task", "auth", "--branch", "feature/auth",
        ],
    );
    let status = run_json(workspace.path(), &["status"]);
    assert!(
        status["summary"]
            .as_str()
            .is_some_and(|s| s.contains("task=auth") && s.contains("branch=feature/auth"))
    );
}

fn run_json(workspace: &Path, args: &[&str]) -> Value {
    let output = Command::new(assert_cmd::cargo::cargo_bin!("sessions"))
        .current_dir(workspace)
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("json output")
}

fn run_json_stdin(workspace: &Path, args: &[&str], stdin: &str) -> Value {
    let output = Command::new(assert_cmd::cargo::cargo_bin!("sessions"))
        .current_dir(workspace)
        .args(args)
        .write_stdin(stdin.to_string())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("json output")
}

fn gate(workspace: &Path, request: Value) -> (Value, i32) {
    let output = Command::new(assert_cmd::cargo::cargo_bin!("sessions"))
        .current_dir(workspace)
        .args(["hook", "pre-tool-use"])
        .write_stdin(request.to_string())
        .assert()
        .get_output()
        .clone();
    let code = output.status.code().expect("exit code");
    let decision = serde_json::from_slice(&output.stdout).expect("decision json");
    (decision, code)
}
