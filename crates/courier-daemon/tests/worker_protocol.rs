//! End-to-end tests against the real worker binary.

use std::process::Command;
use std::time::Duration;

use courier_core::message::DaemonArgs;
use courier_core::spawn::WorkerCommand;
use courier_core::transport::{DaemonTransport, Termination};
use serde_json::json;

const WORKER: &str = env!("CARGO_BIN_EXE_courier-daemon");
const WAIT: Duration = Duration::from_secs(10);

fn spawn_worker(strategy: Option<&str>) -> DaemonTransport {
    let mut daemon = DaemonArgs::new("worker");
    if let Some(strategy) = strategy {
        daemon = daemon.kwarg("strategy", strategy);
    }
    WorkerCommand::daemon(WORKER, &daemon)
        .spawn("e2e")
        .expect("worker binary should spawn")
}

async fn ping_pong(strategy: Option<&str>) {
    let mut transport = spawn_worker(strategy);
    transport.put(&json!({"cmd": "ping"})).await.unwrap();
    let reply = tokio::time::timeout(WAIT, transport.get())
        .await
        .expect("worker never answered")
        .unwrap();
    assert_eq!(reply, json!({"cmd": "pong"}));
    transport.shutdown(WAIT).await;
}

#[tokio::test]
async fn ping_pong_default_strategy() {
    ping_pong(None).await;
}

#[tokio::test]
async fn ping_pong_threaded() {
    ping_pong(Some("threaded")).await;
}

#[cfg(unix)]
#[tokio::test]
async fn ping_pong_readiness() {
    ping_pong(Some("readiness")).await;
}

#[tokio::test]
async fn unknown_messages_are_echoed_in_order() {
    let mut transport = spawn_worker(None);
    for n in 0..5 {
        transport.put(&json!({"n": n})).await.unwrap();
    }
    for n in 0..5 {
        let reply = tokio::time::timeout(WAIT, transport.get())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, json!({"cmd": "echo", "data": {"n": n}}));
    }
    transport.shutdown(WAIT).await;
}

#[tokio::test]
async fn exit_command_ends_worker_cleanly() {
    let mut transport = spawn_worker(None);
    transport.put(&json!({"cmd": "exit"})).await.unwrap();
    let err = tokio::time::timeout(WAIT, transport.get())
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_terminal());
    let exit = transport.shutdown(WAIT).await.expect("exit status");
    assert_eq!(exit.code, Some(0));
}

#[cfg(unix)]
#[tokio::test]
async fn externally_killed_worker_is_terminal() {
    let mut transport = spawn_worker(None);
    transport.put(&json!({"cmd": "ping"})).await.unwrap();
    tokio::time::timeout(WAIT, transport.get())
        .await
        .unwrap()
        .unwrap();

    let pid = transport.pid().expect("running worker has a pid");
    let status = Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    let err = tokio::time::timeout(WAIT, transport.get())
        .await
        .expect("get hung after the worker was killed")
        .unwrap_err();
    assert!(matches!(
        err.termination(),
        Some(Termination::ProcessExited | Termination::EndOfStream)
    ));
    assert!(transport.put(&json!({"cmd": "ping"})).await.unwrap_err().is_terminal());
}

#[test]
fn worker_rejects_malformed_arguments() {
    let output = Command::new(WORKER)
        .args(["worker", "[", "{}"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn ping_command_round_trips() {
    let config = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    let output = Command::new(WORKER)
        .args(["ping", "--count", "3", "--log-dir"])
        .arg(logs.path())
        .env("COURIER_CONFIG_DIR", config.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let replies: Vec<serde_json::Value> = String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(replies.len(), 3);
    for (seq, reply) in replies.iter().enumerate() {
        assert_eq!(reply["seq"], seq);
        assert_eq!(reply["reply"], json!({"cmd": "pong"}));
    }

    let transcript = std::fs::read_to_string(logs.path().join("ping.log")).unwrap();
    assert_eq!(transcript.matches("STDIN: {\"cmd\":\"ping\"}").count(), 3);
}
