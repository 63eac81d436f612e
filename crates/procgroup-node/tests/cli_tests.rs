//! Integration tests for the procgroup-node binary.
//!
//! These tests launch real node processes, read the control port they
//! announce on stdout and drive them through the control channel.

use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;

use procgroup_core::IpcClient;
use serde_json::{json, Value};
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, Command};

const BINARY: &str = env!("CARGO_BIN_EXE_procgroup-node");

fn node(args: &[&str]) -> Child {
    Command::new(BINARY)
        .arg("node")
        .args(args)
        .env_remove("PROCGROUP_RANK")
        .env_remove("PROCGROUP_PEERS")
        .env_remove("PROCGROUP_INTERACTIVE")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("failed to spawn procgroup-node")
}

/// Read stdout until the controller announces its control port.
async fn control_port(child: &mut Child) -> u16 {
    let stdout = child.stdout.take().expect("stdout not captured");
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Some(value) = line.strip_prefix("CONTROL_PORT=") {
                    return value.trim().parse().expect("invalid CONTROL_PORT value");
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => panic!("failed to read procgroup-node stdout: {err}"),
            Err(_) => continue,
        }
    }
    panic!("CONTROL_PORT line not emitted by procgroup-node");
}

async fn call(port: u16, method: &str, extra: &[&str]) -> (bool, Value) {
    let output = Command::new(BINARY)
        .arg("call")
        .arg("--port")
        .arg(port.to_string())
        .arg(method)
        .args(extra)
        .output()
        .await
        .expect("failed to run procgroup-node call");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let value = serde_json::from_str(&stdout).unwrap_or(Value::Null);
    (output.status.success(), value)
}

async fn wait_exit(child: &mut Child) -> i32 {
    let status = tokio::time::timeout(Duration::from_secs(20), child.wait())
        .await
        .expect("node did not exit")
        .expect("failed to wait for node");
    status.code().unwrap_or(-1)
}

fn free_addrs(count: usize) -> Vec<SocketAddr> {
    let listeners: Vec<_> = (0..count)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners.iter().map(|l| l.local_addr().unwrap()).collect()
}

#[tokio::test]
async fn test_single_process_session() {
    let mut controller = node(&["--extension", "Filters"]);
    let port = control_port(&mut controller).await;

    let (ok, status) = call(port, "status", &[]).await;
    assert!(ok);
    assert_eq!(status["partition_count"], 1);

    let params = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(
        params.path(),
        json!({
            "destination": "client",
            "commands": [{"op": "new", "class": "PointCloud", "id": 1}]
        })
        .to_string(),
    )
    .unwrap();
    let params_path = params.path().to_string_lossy().to_string();
    let (ok, dispatched) = call(port, "dispatch", &["--params-file", &params_path]).await;
    assert!(ok);
    assert_eq!(dispatched["executed"], 1);

    let (ok, loaded) = call(port, "load_module", &[r#"{"name": "Filters"}"#]).await;
    assert!(ok);
    assert_eq!(loaded["loaded"], true);

    let (ok, _) = call(port, "render", &[]).await;
    assert!(!ok);

    let (ok, _) = call(port, "exit", &[]).await;
    assert!(ok);
    assert_eq!(wait_exit(&mut controller).await, 0);
}

#[tokio::test]
async fn test_two_process_group() {
    let addrs = free_addrs(2);
    let peers = format!("{},{}", addrs[0], addrs[1]);

    let mut worker = node(&["--rank", "1", "--peers", &peers]);
    let mut controller = node(&["--rank", "0", "--peers", &peers]);
    let port = control_port(&mut controller).await;

    let client = IpcClient::connect(SocketAddr::from(([127, 0, 0, 1], port)))
        .await
        .unwrap();

    let status = client.call("status", json!({})).await.unwrap();
    assert_eq!(status["partition_count"], 2);

    client
        .call(
            "dispatch",
            json!({
                "destination": "server",
                "commands": [
                    {"op": "new", "class": "PointCloud", "id": 3},
                    {"op": "invoke", "id": 3, "method": "SetNumberOfCells", "args": [
                        {"type": "int", "value": 5}
                    ]}
                ]
            }),
        )
        .await
        .unwrap();

    let gathered = client
        .call("gather", json!({"kind": "DataInformation", "object": 3}))
        .await
        .unwrap();
    assert_eq!(gathered["number_of_cells"], 10);
    assert_eq!(gathered["number_of_partitions"], 2);

    client.call("exit", json!({})).await.unwrap();
    assert_eq!(wait_exit(&mut controller).await, 0);
    assert_eq!(wait_exit(&mut worker).await, 0);
}

#[tokio::test]
async fn test_non_interactive_group_finishes() {
    let addrs = free_addrs(2);
    let peers = format!("{},{}", addrs[0], addrs[1]);

    let mut worker = node(&["--rank", "1", "--peers", &peers]);
    let mut controller = node(&["--rank", "0", "--peers", &peers, "--no-interactive"]);

    assert_eq!(wait_exit(&mut controller).await, 0);
    assert_eq!(wait_exit(&mut worker).await, 0);
}
