//! CLI integration tests
//!
//! Drive the built `keel` binary: argument validation for `call`, a worker
//! started the way the supervisor starts it, and calls made through
//! `keel call` against that worker.

use std::io::Write;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

fn keel_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_keel"))
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn wait_for_port(port: u16) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while Instant::now() < deadline {
        if std::net::TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("worker never listened on {}", port);
}

struct Worker {
    child: Child,
}

impl Worker {
    fn start(root: &Path, port: u16) -> Self {
        let methods = root.join("methods");
        std::fs::create_dir_all(&methods).unwrap();
        std::fs::write(
            methods.join("echo.js"),
            "({ access: 'public', method: (args) => args })",
        )
        .unwrap();

        let config = serde_json::json!({
            "host": "127.0.0.1",
            "ports": [port],
            "balancer": null,
            "socketOffset": 1,
            "sandboxPool": 1,
            "methods": methods,
            "static": root.join("static"),
        });
        let child = Command::new(keel_bin())
            .args(["worker", "--slot", "0", "--role", "server", "--port", &port.to_string()])
            .env("KEEL_WORKER_CONFIG", config.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        wait_for_port(port);
        Self { child }
    }

    fn stop(mut self) -> std::process::ExitStatus {
        let mut stdin = self.child.stdin.take().unwrap();
        stdin.write_all(b"{\"name\":\"stop\"}\n").unwrap();
        drop(stdin);
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            assert!(Instant::now() < deadline, "worker ignored stop");
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

#[test]
fn test_help_flag() {
    let output = Command::new(keel_bin()).arg("--help").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("serve"));
    assert!(stdout.contains("call"));
}

#[test]
fn test_call_missing_http_prefix() {
    let output = Command::new(keel_bin())
        .args(["call", "127.0.0.1:3331", "status"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("http://"));
}

#[test]
fn test_call_with_invalid_json_args() {
    let output = Command::new(keel_bin())
        .args(["call", "http://127.0.0.1:1", "echo", "--args", "{not json"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid JSON"));
}

#[test]
fn test_worker_without_config_fails() {
    let output = Command::new(keel_bin())
        .args(["worker", "--slot", "0", "--role", "background"])
        .env_remove("KEEL_WORKER_CONFIG")
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("KEEL_WORKER_CONFIG"));
}

#[test]
fn test_worker_serves_calls() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let worker = Worker::start(dir.path(), port);
    let url = format!("http://127.0.0.1:{}", port);

    let output = Command::new(keel_bin())
        .args(["call", &url, "echo", "-a", r#"{"n":1}"#])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), r#"{"n":1}"#);

    let output = Command::new(keel_bin())
        .args(["call", &url, "status"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Forbidden"));

    let status = worker.stop();
    assert!(status.success());
}
