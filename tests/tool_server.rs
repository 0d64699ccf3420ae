//! 工具进程生命周期测试：用 sh 脚本充当 stdio MCP 服务端
#![cfg(unix)]

use std::time::Duration;

use taskpilot::core::{AgentError, ToolFailureKind};
use taskpilot::tools::{ServerParams, ToolChannel, ToolServerManager};

const FAKE_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}\n' "$id" ;;
    *'"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"add","description":"Add two integers","inputSchema":{"type":"object","properties":{"a":{"type":"integer"},"b":{"type":"integer"}},"required":["a","b"]}}]}}\n' "$id" ;;
    *'"name":"add"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"5"}],"isError":false}}\n' "$id" ;;
    *'"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"unknown tool"}],"isError":true}}\n' "$id" ;;
  esac
done
"#;

/// 只完成握手就退出的服务端
const ONE_SHOT_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}\n' "$id" ;;
    *'"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[]}}\n' "$id"
      exit 0 ;;
  esac
done
"#;

fn sh(script: &str) -> ServerParams {
    let mut params = ServerParams::new("sh", vec!["-c".to_string(), script.to_string()]);
    params.startup_timeout = Duration::from_secs(5);
    params.grace_period = Duration::from_secs(2);
    params
}

/// 进程是否仍存在（kill -0）
fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_missing_command_is_unavailable() {
    let manager = ToolServerManager::new(ServerParams::new(
        "/nonexistent/taskpilot-tool-server",
        vec![],
    ));
    let err = manager.connect_lease().await.err().unwrap();
    assert!(matches!(err, AgentError::ChannelUnavailable(_)), "{:?}", err);
    assert_eq!(manager.spawn_count(), 0);
    assert!(!manager.is_running().await);
}

#[tokio::test]
async fn test_immediate_exit_is_unavailable() {
    let manager = ToolServerManager::new(sh("exit 1"));
    let err = manager.connect_lease().await.err().unwrap();
    match err {
        AgentError::ChannelUnavailable(msg) => assert!(msg.contains("exited immediately"), "{}", msg),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!manager.is_running().await);
}

#[tokio::test]
async fn test_invoke_and_capabilities() {
    let manager = ToolServerManager::new(sh(FAKE_SERVER));
    let lease = manager.connect_lease().await.unwrap();

    let caps = lease.list_capabilities().await.unwrap();
    assert_eq!(caps.len(), 1);
    assert_eq!(caps[0].name, "add");

    let result = lease.invoke("add", "2, 3").await.unwrap();
    assert_eq!(result.text(), "5");

    let err = lease.invoke("subtract", "2, 3").await.err().unwrap();
    assert!(matches!(
        err,
        AgentError::ToolExecution {
            kind: ToolFailureKind::Reported,
            ..
        }
    ));

    lease.close().await;
    let err = lease.invoke("add", "1, 1").await.err().unwrap();
    assert!(matches!(
        err,
        AgentError::ToolExecution {
            kind: ToolFailureKind::Disconnected,
            ..
        }
    ));
}

#[tokio::test]
async fn test_concurrent_leases_share_one_process() {
    let manager = ToolServerManager::new(sh(FAKE_SERVER));
    let (a, b) = tokio::join!(manager.connect_lease(), manager.connect_lease());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(manager.spawn_count(), 1);
    assert_eq!(manager.active_leases().await, 2);
    let pid = manager.pid().await.unwrap();

    a.close().await;
    // 还有一个租约，进程保留
    assert!(manager.is_running().await);
    assert_eq!(b.invoke("add", "2, 3").await.unwrap().text(), "5");

    b.close().await;
    b.close().await;
    assert_eq!(manager.active_leases().await, 0);
    assert!(!manager.is_running().await);
    assert!(manager.pid().await.is_none());
    assert!(!process_alive(pid));

    // 之后的连接重新拉起进程
    let c = manager.connect_lease().await.unwrap();
    assert_eq!(manager.spawn_count(), 2);
    c.close().await;
}

#[tokio::test]
async fn test_keep_alive_survives_last_release() {
    let mut params = sh(FAKE_SERVER);
    params.keep_alive = true;
    let manager = ToolServerManager::new(params);

    let lease = manager.connect_lease().await.unwrap();
    lease.close().await;
    assert!(manager.is_running().await);

    let again = manager.connect_lease().await.unwrap();
    assert_eq!(manager.spawn_count(), 1);
    again.close().await;

    manager.terminate().await;
    manager.terminate().await;
    assert!(!manager.is_running().await);
}

async fn wait_exited(manager: &ToolServerManager) {
    for _ in 0..100 {
        if !manager.is_running().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("tool server did not exit");
}

#[tokio::test]
async fn test_dead_server_is_respawned_on_connect() {
    let mut params = sh(ONE_SHOT_SERVER);
    params.keep_alive = true;
    let manager = ToolServerManager::new(params);

    let lease = manager.connect_lease().await.unwrap();
    let first_pid = manager.pid().await.unwrap();
    lease.close().await;
    wait_exited(&manager).await;
    assert!(!process_alive(first_pid));

    let lease = manager.connect_lease().await.unwrap();
    assert_eq!(manager.spawn_count(), 2);
    assert_ne!(manager.pid().await, Some(first_pid));
    lease.close().await;

    // 进程已自行退出后 terminate 仍然安全
    wait_exited(&manager).await;
    manager.terminate().await;
    manager.terminate().await;
    assert!(!manager.is_running().await);
    assert!(manager.pid().await.is_none());
}

#[tokio::test]
async fn test_unresponsive_server_is_killed_after_grace() {
    // 处理完握手后忽略 stdin EOF，继续占用进程
    let script = format!("{}\nexec sleep 30", FAKE_SERVER);
    let mut params = sh(&script);
    params.grace_period = Duration::from_millis(200);
    let manager = ToolServerManager::new(params);

    let lease = manager.connect_lease().await.unwrap();
    let pid = manager.pid().await.unwrap();

    let started = std::time::Instant::now();
    lease.close().await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!manager.is_running().await);
    assert!(!process_alive(pid));
}

#[tokio::test]
async fn test_dropped_lease_releases() {
    let manager = ToolServerManager::new(sh(FAKE_SERVER));
    let lease = manager.connect_lease().await.unwrap();
    drop(lease);
    for _ in 0..100 {
        if manager.active_leases().await == 0 && !manager.is_running().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("dropped lease was not released");
}
