use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::Context as _;
use surge_testserver::TestServer;

fn status_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn write_plan(dir: &Path, yaml: &str) -> anyhow::Result<PathBuf> {
    let path = dir.join("plan.yaml");
    std::fs::write(&path, yaml).context("write plan")?;
    Ok(path)
}

async fn run_surge(args: Vec<String>) -> anyhow::Result<Output> {
    let exe = env!("CARGO_BIN_EXE_surge");
    tokio::task::spawn_blocking(move || Command::new(exe).args(&args).output())
        .await
        .context("spawn_blocking join")?
        .context("run surge binary")
}

fn ensure_code(out: &Output, expected: i32) -> anyhow::Result<()> {
    anyhow::ensure!(
        status_code(out.status) == expected,
        "expected exit code {expected}, got {}\nstdout:\n{}\nstderr:\n{}",
        status_code(out.status),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
    Ok(())
}

fn short_plan(url: &str, thresholds: &str) -> String {
    format!(
        r#"
target:
  url: {url}
stages:
  - {{ duration: 600ms, target: 2 }}
  - {{ duration: 300ms, target: 0 }}
tick: 100ms
thinkTime: 20ms
thresholdInterval: 100ms
gracefulStop: 2s
thresholds:
{thresholds}
"#
    )
}

#[test]
fn invalid_flags_exit_30() -> anyhow::Result<()> {
    let out = Command::new(env!("CARGO_BIN_EXE_surge"))
        .arg("run")
        .arg("./does-not-matter.yaml")
        .arg("--think-time")
        .arg("10x")
        .output()
        .context("run surge binary")?;

    ensure_code(&out, 30)
}

#[tokio::test]
async fn invalid_plan_exit_30() -> anyhow::Result<()> {
    let dir = tempfile::tempdir().context("tempdir")?;
    let plan = write_plan(
        dir.path(),
        "target:\n  url: http://127.0.0.1:9/\nstages: []\n",
    )?;

    let out = run_surge(vec!["validate".into(), plan.display().to_string()]).await?;
    ensure_code(&out, 30)?;
    anyhow::ensure!(
        String::from_utf8_lossy(&out.stderr).contains("stages"),
        "stderr should name the problem:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );

    let out = run_surge(vec!["run".into(), plan.display().to_string()]).await?;
    ensure_code(&out, 30)
}

#[tokio::test]
async fn missing_url_exit_30() -> anyhow::Result<()> {
    let dir = tempfile::tempdir().context("tempdir")?;
    let plan = write_plan(dir.path(), "stages: [{ duration: 1s, target: 1 }]\n")?;

    let out = run_surge(vec!["validate".into(), plan.display().to_string()]).await?;
    ensure_code(&out, 0)?;

    let out = run_surge(vec!["run".into(), plan.display().to_string()]).await?;
    ensure_code(&out, 30)
}

#[tokio::test]
async fn passing_run_exit_0_and_writes_summary() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    let dir = tempfile::tempdir().context("tempdir")?;
    let plan = write_plan(
        dir.path(),
        &short_plan(
            "http://127.0.0.1:9/unused",
            "  http_req_failed: ['rate<0.01']\n  http_req_duration: ['p(95)<2000']",
        ),
    )?;
    let summary_path = dir.path().join("out").join("summary.json");

    let out = run_surge(vec![
        "run".into(),
        plan.display().to_string(),
        "--url".into(),
        server.urls().hello.clone(),
        "--output".into(),
        "json".into(),
        "--summary-out".into(),
        summary_path.display().to_string(),
    ])
    .await?;
    server.shutdown().await;
    ensure_code(&out, 0)?;

    let text = std::fs::read_to_string(&summary_path).context("read summary")?;
    let v: serde_json::Value = serde_json::from_str(&text).context("parse summary")?;
    anyhow::ensure!(
        v.get("overall_pass").and_then(serde_json::Value::as_bool) == Some(true),
        "summary: {text}"
    );
    anyhow::ensure!(
        v.pointer("/metrics/http_reqs/count")
            .and_then(serde_json::Value::as_u64)
            .is_some_and(|n| n > 0),
        "summary: {text}"
    );

    let stdout = String::from_utf8_lossy(&out.stdout);
    anyhow::ensure!(
        stdout.lines().any(|l| l.contains(r#""kind":"summary""#)),
        "stdout should end with a summary line:\n{stdout}"
    );

    Ok(())
}

#[tokio::test]
async fn thresholds_failed_exit_11() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    let dir = tempfile::tempdir().context("tempdir")?;
    let plan = write_plan(
        dir.path(),
        &short_plan(&server.urls().flaky, "  http_req_failed: ['rate<0.01']"),
    )?;

    let out = run_surge(vec![
        "run".into(),
        plan.display().to_string(),
        "--output".into(),
        "json".into(),
    ])
    .await?;
    server.shutdown().await;

    ensure_code(&out, 11)
}

#[tokio::test]
async fn abort_on_fail_exit_12() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    let dir = tempfile::tempdir().context("tempdir")?;
    let yaml = format!(
        r#"
target:
  url: {}
stages:
  - {{ duration: 30s, target: 2 }}
tick: 100ms
thinkTime: 20ms
thresholdInterval: 100ms
gracefulStop: 2s
thresholds:
  http_req_failed:
    - threshold: 'rate<0.01'
      abortOnFail: true
"#,
        server.urls().status(500)
    );
    let plan = write_plan(dir.path(), &yaml)?;
    let summary_path = dir.path().join("summary.json");

    let started = std::time::Instant::now();
    let out = run_surge(vec![
        "run".into(),
        plan.display().to_string(),
        "--summary-out".into(),
        summary_path.display().to_string(),
    ])
    .await?;
    server.shutdown().await;

    ensure_code(&out, 12)?;
    anyhow::ensure!(
        started.elapsed() < std::time::Duration::from_secs(20),
        "abort should end the run early, took {:?}",
        started.elapsed()
    );

    let text = std::fs::read_to_string(&summary_path).context("read summary")?;
    let v: serde_json::Value = serde_json::from_str(&text).context("parse summary")?;
    anyhow::ensure!(
        v.get("state").and_then(serde_json::Value::as_str) == Some("aborted"),
        "summary: {text}"
    );
    anyhow::ensure!(
        v.get("abort_reason")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|r| r.contains("http_req_failed")),
        "summary: {text}"
    );

    Ok(())
}
