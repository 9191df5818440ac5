use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::{json, Value};
use ulid::Ulid;

struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("orgrecon-cli-{}", Ulid::new()));
        fs::create_dir_all(&dir)
            .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn write_json(&self, name: &str, value: &Value) -> PathBuf {
        let path = self.path(name);
        fs::write(&path, value.to_string())
            .unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
        path
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "--db".to_string(),
            path_str(&self.path("orgrecon.sqlite3")).to_string(),
            "--snapshots-dir".to_string(),
            path_str(&self.path("snapshots")).to_string(),
        ]
    }

    fn run<I, S>(&self, args: I) -> Output
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(env!("CARGO_BIN_EXE_orgrecon"))
            .args(self.base_args())
            .args(args)
            .output()
            .unwrap_or_else(|err| panic!("failed to execute orgrecon binary: {err}"))
    }

    fn run_json<I, S>(&self, args: I) -> Value
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run(args);
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            panic!(
                "orgrecon command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
                output.status, stdout, stderr
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        serde_json::from_str(&stdout)
            .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn org_chart(sales_description: &str) -> Value {
    json!({
        "structures": [
            {"code": "ROOT", "description": "Company", "parent_code": null},
            {"code": "S1", "description": sales_description, "parent_code": "ROOT"}
        ],
        "persons": [
            {
                "tax_id": "RSSMRA80A01H501Z",
                "display_name": "Mario Rossi",
                "code": "1001",
                "org_unit": "S1",
                "cost_center": "CC10",
                "site": "Rome",
                "level": "B2"
            }
        ]
    })
}

#[test]
fn db_commands_report_schema_and_integrity() {
    let ws = Workspace::new();
    let before = ws.run_json(["db", "schema-version"]);
    assert_eq!(before["contract_version"], "cli.v1");
    assert_eq!(as_i64(&before, "current_version"), 0);

    let migrated = ws.run_json(["db", "migrate"]);
    assert_eq!(migrated["up_to_date"], true);

    let integrity = ws.run_json(["db", "integrity-check"]);
    assert_eq!(integrity["quick_check_ok"], true);
}

#[test]
fn validate_reports_cycle_as_error() {
    let ws = Workspace::new();
    let input = ws.write_json(
        "loop.json",
        &json!({"structures": [
            {"code": "A", "description": "Unit A", "parent_code": "B"},
            {"code": "B", "description": "Unit B", "parent_code": "A"}
        ]}),
    );
    let result = ws.run_json(["validate", "--in", path_str(&input)]);
    assert_eq!(result["valid"], false);
    let errors = result["errors"].as_array().cloned().unwrap_or_default();
    assert!(errors.iter().any(|issue| issue["message"]
        .as_str()
        .is_some_and(|message| message.contains("parent cycle detected"))));
}

#[test]
fn import_preview_and_snapshot_restore_flow() {
    let ws = Workspace::new();
    let v1 = ws.write_json("org_v1.json", &org_chart("Sales"));
    let v2 = ws.write_json("org_v2.json", &org_chart("Sales EU"));

    let first = ws.run_json(["import", "--in", path_str(&v1)]);
    assert_eq!(first["imported"], true);

    let preview = ws.run_json(["preview-import", "--in", path_str(&v2)]);
    assert_eq!(preview["severity"]["high"], 1);
    assert_eq!(preview["diff"]["structures"]["counts"]["modified"], 1);

    let second = ws.run_json(["import", "--in", path_str(&v2), "--note", "rename"]);
    assert_eq!(second["imported"], true);
    let snapshot_id = second["snapshot"]["id"]
        .as_u64()
        .unwrap_or_else(|| panic!("import should snapshot prior data: {second}"));

    let listed = ws.run_json(["snapshot", "list"]);
    assert_eq!(as_i64(&listed, "count"), 1);

    let restored = ws.run_json(["snapshot", "restore", "--id", &snapshot_id.to_string()]);
    assert_eq!(restored["safety_backup"]["source"], "AUTO_BACKUP");

    let after = ws.run_json(["preview-import", "--in", path_str(&v1)]);
    assert_eq!(after["report"].as_array().map(Vec::len), Some(0));

    let history = ws.run_json(["history", "imports"]);
    assert_eq!(history["payload"].as_array().map(Vec::len), Some(3));
    assert_eq!(history["payload"][0]["source_filename"], "RESTORE_org_v2.json");
    assert_eq!(history["payload"][0]["id"], restored["import_version_id"]);
}

#[test]
fn merge_apply_with_resolution_updates_store() {
    let ws = Workspace::new();
    let v1 = ws.write_json("org_v1.json", &org_chart("Sales"));
    ws.run_json(["import", "--in", path_str(&v1)]);

    let source = ws.write_json(
        "update.json",
        &json!({"structures": [{"code": "S1", "description": "Sales EU", "parent_code": "ROOT"}]}),
    );
    let plan = ws.run_json(["merge", "preview", "--in", path_str(&source), "--kind", "structure"]);
    assert_eq!(plan["preview"]["unresolved_conflicts"], 1);

    let resolutions = ws.write_json(
        "resolutions.json",
        &json!([{"record_id": "S1", "field": "description", "value": "Sales EU"}]),
    );
    let report = ws.run_json([
        "merge",
        "apply",
        "--in",
        path_str(&source),
        "--kind",
        "structure",
        "--resolutions",
        path_str(&resolutions),
    ]);
    assert_eq!(report["result"]["applied"], 1);
    assert_eq!(report["result"]["success"], true);

    let merges = ws.run_json(["history", "merges"]);
    assert_eq!(merges["payload"][0]["applied"], 1);
}

#[test]
fn change_plan_round_trips_through_apply() {
    let ws = Workspace::new();
    let v1 = ws.write_json("org_v1.json", &org_chart("Sales"));
    ws.run_json(["import", "--in", path_str(&v1)]);

    let command = ws.path("command.txt");
    fs::write(
        &command,
        "```json\n{\"operation\": \"update_record\", \"record_type\": \"structure\", \
         \"filters\": {\"code\": \"S1\"}, \"values\": {\"site\": \"Milan\"}, \
         \"message\": \"move sales\"}\n```",
    )
    .unwrap_or_else(|err| panic!("failed to write command file: {err}"));
    let plan = ws.run_json(["changes", "plan", "--command", path_str(&command)]);
    assert_eq!(as_i64(&plan, "matched"), 1);

    let plan_path = ws.write_json("plan.json", &plan);
    let applied = ws.run_json(["changes", "apply", "--plan", path_str(&plan_path)]);
    assert_eq!(applied["applied"].as_array().map(Vec::len), Some(1));
    assert_eq!(applied["diff"]["counts"]["modified"], 1);
}

#[test]
fn unknown_snapshot_fails_with_nonzero_status() {
    let ws = Workspace::new();
    let output = ws.run(["snapshot", "delete", "--id", "42"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("snapshot 42 not found"));
}
