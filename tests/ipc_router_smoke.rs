use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_timetabled");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn timetabled");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

#[test]
fn health_unknown_method_and_workspace_guard() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health.get("ok").and_then(|v| v.as_bool()), Some(true));
    assert!(health["result"]["version"].is_string());
    assert!(health["result"]["workspacePath"].is_null());

    let unknown = request(&mut stdin, &mut reader, "2", "nope.nothing", json!({}));
    assert_eq!(unknown.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        unknown["error"]["code"].as_str(),
        Some("not_implemented")
    );

    // Domain methods refuse to run before a workspace is selected.
    let guarded = request(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.list",
        json!({ "tenantId": "t1" }),
    );
    assert_eq!(guarded.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(guarded["error"]["code"].as_str(), Some("no_workspace"));

    let workspace = temp_dir("timetabled-smoke");
    let selected = request(
        &mut stdin,
        &mut reader,
        "4",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(selected.get("ok").and_then(|v| v.as_bool()), Some(true));

    let listed = request(
        &mut stdin,
        &mut reader,
        "5",
        "teachers.list",
        json!({ "tenantId": "t1" }),
    );
    assert_eq!(listed.get("ok").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(listed["result"]["teachers"].as_array().map(|a| a.len()), Some(0));

    let _ = child.kill();
}

#[test]
fn validate_is_usable_without_workspace() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "timetable.validate",
        json!({ "entries": [
            { "day": "Mon", "periodKey": "P1", "subjectId": "s1", "teacherId": "t1" },
            { "day": "Mon", "periodKey": "P1", "subjectId": "s2", "teacherId": "t1" },
        ]}),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(true));
    let conflicts = resp["result"]["conflicts"].as_array().expect("conflicts");
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].as_str(), Some("Teacher overlap at Mon_P1"));

    let _ = child.kill();
}
