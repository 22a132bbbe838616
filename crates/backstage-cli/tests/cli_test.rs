//! End-to-end tests of the `backstage` binary.

use backstage_core::ipc::{InvocationPayload, WorkerRequest, WorkerResponse};
use serde_json::{Value, json};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

const BIN: &str = env!("CARGO_BIN_EXE_backstage");

struct Workspace {
    dir: TempDir,
    config: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        Self::with_config("")
    }

    fn with_config(toml: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("config.toml");
        std::fs::write(&config, toml).unwrap();
        Self { dir, config }
    }

    fn file(&self, relative: &str, source: &str) -> PathBuf {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, source).unwrap();
        path
    }

    fn backstage(&self, args: &[&str]) -> Output {
        Command::new(BIN)
            .arg("--config")
            .arg(&self.config)
            .args(args)
            .env_remove("RUST_LOG")
            .output()
            .unwrap()
    }
}

fn stdout_json(output: &Output) -> Value {
    let text = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(text.trim()).unwrap_or_else(|err| panic!("bad output {text:?}: {err}"))
}

fn path_arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_run_prints_outcome() {
    let ws = Workspace::new();
    let file = ws.file("double.js", "function main() { return Backstage.env.RESULT * 2; }");

    let output = ws.backstage(&["--format", "text", "run", path_arg(&file), "--env", "RESULT=5"]);

    assert!(output.status.success(), "{output:?}");
    assert_eq!(
        stdout_json(&output),
        json!({"status": 200, "body": 10, "headers": {}})
    );
}

#[test]
fn test_run_uses_config_file() {
    let ws = Workspace::with_config(
        "[env]\nRESULT = 7\n\n[runtime]\nglobal_modules = [\"path\"]\n",
    );
    let file = ws.file(
        "cfg.js",
        "function main() { return require('path').join('a', String(Backstage.env.RESULT)); }",
    );

    let output = ws.backstage(&["--format", "json", "run", path_arg(&file)]);

    assert!(output.status.success(), "{output:?}");
    assert_eq!(stdout_json(&output)["body"], "a/7");
}

#[test]
fn test_run_with_request_file_and_captured_logs() {
    let ws = Workspace::new();
    let file = ws.file(
        "echo.js",
        "function main(req, res) { console.log('method', req.method); res.status(201).send(req.body); }",
    );
    let request = ws.file("req.json", r#"{"method": "POST", "body": {"x": 1}}"#);

    let output = ws.backstage(&[
        "--format",
        "json",
        "run",
        path_arg(&file),
        "--request",
        path_arg(&request),
        "--capture-logs",
    ]);

    assert!(output.status.success(), "{output:?}");
    let report = stdout_json(&output);
    assert_eq!(report["status"], 201);
    assert_eq!(report["body"], json!({"x": 1}));
    assert!(report["logs"].as_str().unwrap().contains("method POST"));
}

#[test]
fn test_run_failure_exit_code() {
    let ws = Workspace::new();
    let file = ws.file("throw.js", "function main() { throw new Error('An error'); }");

    let output = ws.backstage(&["--format", "json", "run", path_arg(&file)]);

    assert_eq!(output.status.code(), Some(1));
    let report = stdout_json(&output);
    assert_eq!(report["error"], "An error");
    assert_eq!(report["kind"], "user");
}

#[test]
fn test_run_timeout_exit_code() {
    let ws = Workspace::new();
    let file = ws.file("silent.js", "function main(req, res) {}");

    let output = ws.backstage(&[
        "--format",
        "json",
        "run",
        path_arg(&file),
        "--async-timeout",
        "200",
    ]);

    assert_eq!(output.status.code(), Some(4));
    let report = stdout_json(&output);
    assert_eq!(report["error"], "Function timeout");
    assert_eq!(report["statusCode"], 408);
}

#[test]
fn test_run_isolated_matches_in_process() {
    let ws = Workspace::new();
    let file = ws.file(
        "acme/hello.js",
        "async function main(req) { return { hello: Backstage.env.NAME }; }",
    );

    let output = ws.backstage(&[
        "--format",
        "text",
        "run",
        path_arg(&file),
        "--env",
        "NAME=world",
        "--isolated",
    ]);

    assert!(output.status.success(), "{output:?}");
    assert_eq!(stdout_json(&output)["body"], json!({"hello": "world"}));
}

#[test]
fn test_run_isolated_relays_failure() {
    let ws = Workspace::new();
    let file = ws.file(
        "acme/fail.js",
        "function main() { throw new NotFound('missing'); }",
    );

    let output = ws.backstage(&["--format", "json", "run", path_arg(&file), "--isolated"]);

    assert!(output.status.success(), "{output:?}");
    let report = stdout_json(&output);
    assert_eq!(report["status"], 404);
    assert_eq!(report["body"], json!({"error": "missing"}));
}

#[test]
fn test_check_reports_syntax_error() {
    let ws = Workspace::new();
    let file = ws.file("broken.js", "var a = [};");

    let output = ws.backstage(&["--format", "json", "check", path_arg(&file)]);

    assert_eq!(output.status.code(), Some(3));
    let report = stdout_json(&output);
    assert!(report["error"].as_str().unwrap().starts_with("SyntaxError"));
}

#[test]
fn test_check_ok() {
    let ws = Workspace::new();
    let file = ws.file("fine.js", "function main() { return 1; }");

    let output = ws.backstage(&["check", path_arg(&file)]);

    assert!(output.status.success(), "{output:?}");
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "ok");
}

#[test]
fn test_run_from_source_syntax_error_exit_code() {
    let ws = Workspace::new();
    let file = ws.file("broken.js", "function main() { return [}; }");

    let output = ws.backstage(&["--format", "json", "run", path_arg(&file)]);

    assert_eq!(output.status.code(), Some(3));
    assert_eq!(stdout_json(&output)["kind"], "syntax");
}

fn worker(request: &str) -> Output {
    let mut child = Command::new(BIN)
        .arg("worker")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(request.as_bytes())
        .unwrap();
    child.wait_with_output().unwrap()
}

#[test]
fn test_worker_serves_one_invocation() {
    let mut payload = InvocationPayload::new(
        "ns",
        "fn",
        "function main(req, res) { res.set('x-a', 'b').send(Backstage.env.RESULT * 2); }",
    );
    payload.env.insert("RESULT".to_string(), json!(21));
    let request = WorkerRequest {
        id: "w-1".to_string(),
        data: payload,
    };
    let line = format!("{}\n", serde_json::to_string(&request).unwrap());

    let output = worker(&line);

    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(stdout.lines().count(), 1);
    let response: WorkerResponse = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(response.id, "w-1");
    let outcome = response.into_result(5000).unwrap();
    assert_eq!(outcome.body, 42);
    assert_eq!(outcome.headers.get("x-a"), Some(&json!("b")));
}

#[test]
fn test_worker_failure_exits_one() {
    let request = json!({
        "id": "w-2",
        "data": {
            "namespace": "ns",
            "functionName": "fn",
            "preCode": {"code": "function main() { throw new Error('An error'); }"}
        }
    });

    let output = worker(&format!("{request}\n"));

    assert_eq!(output.status.code(), Some(1));
    let line: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(line["id"], "w-2");
    assert_eq!(line["data"]["error"], "An error");
}

#[test]
fn test_completions() {
    let output = Command::new(BIN).args(["completions", "bash"]).output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("backstage"));
}
