//! Integration tests for segmetad endpoints, safe startup checks, and graceful shutdown.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const HTTP_PORT: u16 = 19599;
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

fn run_segmetad(args: &[&str]) -> (bool, String, String) {
    let exe = env!("CARGO_BIN_EXE_segmetad");
    let out = Command::new(exe).args(args).output().expect("run segmetad");
    (
        out.status.success(),
        String::from_utf8_lossy(&out.stdout).into_owned(),
        String::from_utf8_lossy(&out.stderr).into_owned(),
    )
}

/// Start segmetad in the background; the caller must stop it.
fn start_segmetad(data_dir: &Path, port: u16) -> Child {
    let exe = env!("CARGO_BIN_EXE_segmetad");
    Command::new(exe)
        .args([
            "--no-config",
            "--data-dir",
            data_dir.to_str().unwrap(),
            "--http-bind",
            &format!("127.0.0.1:{}", port),
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn segmetad")
}

/// GET /path on localhost, return (status_line, body).
fn http_get(port: u16, path: &str) -> Option<(String, String)> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).ok()?;
    stream.set_read_timeout(Some(Duration::from_secs(2))).ok()?;
    stream
        .write_all(format!("GET {} HTTP/1.0\r\nHost: localhost\r\n\r\n", path).as_bytes())
        .ok()?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).ok()?;
    let s = String::from_utf8_lossy(&buf).into_owned();
    let status = s.lines().next()?.to_string();
    let body = s.split("\r\n\r\n").nth(1).unwrap_or_default().to_string();
    Some((status, body))
}

/// Polls /healthz until the daemon answers or the timeout passes.
fn wait_until_serving(port: u16) -> bool {
    let deadline = Instant::now() + STARTUP_TIMEOUT;
    while Instant::now() < deadline {
        if http_get(port, "/healthz").is_some() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

fn stop(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[test]
fn data_dir_as_file_fails_startup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file_as_data_dir = dir.path().join("file_not_dir");
    std::fs::write(&file_as_data_dir, b"x").expect("write file");
    let (ok, _stdout, stderr) = run_segmetad(&[
        "--no-config",
        "--data-dir",
        file_as_data_dir.to_str().unwrap(),
        "--http-bind",
        &format!("127.0.0.1:{}", HTTP_PORT + 9),
    ]);
    assert!(!ok, "data_dir as file should fail");
    assert!(
        stderr.contains("data_dir") && (stderr.contains("cannot be created") || stderr.contains("not writable")),
        "stderr: {}",
        stderr
    );
}

#[test]
fn health_ready_and_unknown_paths() {
    let dir = tempfile::tempdir().expect("tempdir");
    let child = start_segmetad(dir.path(), HTTP_PORT);
    let serving = wait_until_serving(HTTP_PORT);
    let healthz = http_get(HTTP_PORT, "/healthz");
    let readyz = http_get(HTTP_PORT, "/readyz");
    let missing = http_get(HTTP_PORT, "/nonexistent");
    stop(child);

    assert!(serving, "daemon never answered on /healthz");
    assert!(healthz.unwrap().0.contains("200"));
    assert!(readyz.unwrap().0.contains("200"));
    assert!(missing.unwrap().0.contains("404"));
}

#[test]
fn status_reports_registered_segment_lists() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("segmeta.json"),
        concat!(
            r#"{"segmentKey":"s1","virtualTableName":"web","latestEpochMs":10,"numBlocks":1}"#,
            "\n",
            "garbage line\n",
            r#"{"segmentKey":"s2","virtualTableName":"api","latestEpochMs":20,"numBlocks":1}"#,
            "\n",
        ),
    )
    .expect("write segmeta");
    std::fs::write(
        dir.path().join("metricsmeta.json"),
        r#"{"mSegmentDir":"m1","numBlocks":1,"latestEpochSec":5,"TTreeDir":"t"}"#,
    )
    .expect("write metrics meta");

    let child = start_segmetad(dir.path(), HTTP_PORT + 1);
    let serving = wait_until_serving(HTTP_PORT + 1);
    let status = http_get(HTTP_PORT + 1, "/status");
    stop(child);

    assert!(serving);
    let (line, body) = status.expect("status reachable");
    assert!(line.contains("200"), "status line: {}", line);
    let v: serde_json::Value = serde_json::from_str(body.trim()).expect("status json");
    assert_eq!(v["segments"], 2);
    assert_eq!(v["tables"], 2);
    assert_eq!(v["metrics_segments"], 1);
}

#[cfg(feature = "prometheus")]
#[test]
fn metrics_endpoint_renders_prometheus_text() {
    let dir = tempfile::tempdir().expect("tempdir");
    let child = start_segmetad(dir.path(), HTTP_PORT + 2);
    let serving = wait_until_serving(HTTP_PORT + 2);
    let metrics = http_get(HTTP_PORT + 2, "/metrics");
    stop(child);

    assert!(serving);
    let (line, body) = metrics.expect("metrics reachable");
    assert!(line.contains("200"), "status line: {}", line);
    assert!(body.contains("segmeta_"), "body: {}", body);
}

#[cfg(unix)]
#[test]
fn sigterm_shuts_down_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut child = start_segmetad(dir.path(), HTTP_PORT + 3);
    assert!(wait_until_serving(HTTP_PORT + 3));

    let pid = child.id();
    let _ = Command::new("kill").args(["-TERM", &pid.to_string()]).status();

    let stderr_handle = child.stderr.take();
    let (tx, rx) = std::sync::mpsc::channel();
    thread::spawn(move || {
        let code = child.wait().ok().and_then(|s| s.code());
        let mut s = String::new();
        if let Some(mut h) = stderr_handle {
            let _ = h.read_to_string(&mut s);
        }
        let _ = tx.send((code, s));
    });
    let (code, stderr) = rx.recv_timeout(SHUTDOWN_WAIT).unwrap_or_else(|_| {
        let _ = Command::new("kill").args(["-9", &pid.to_string()]).status();
        rx.recv().unwrap_or((None, String::new()))
    });
    assert!(stderr.contains("shutdown complete"), "stderr: {}", stderr);
    assert_eq!(code, Some(0), "stderr: {}", stderr);
}
