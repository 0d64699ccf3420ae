//! MCP 客户端：换行分隔的 JSON-RPC 2.0，跑在任意双工字节流上
//!
//! 连接时完成 initialize 握手、发送 notifications/initialized、拉取 tools/list 并缓存；
//! 后台任务读取响应并按 id 派发到等待中的调用。读端 EOF 视为通道断开，所有等待中的调用立即失败。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::core::{AgentError, ToolFailureKind};
use crate::tools::args::bind_arguments;
use crate::tools::channel::timeout_error;
use crate::tools::{ToolCapability, ToolResult};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── JSON-RPC types ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct McpTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    input_schema: Option<Value>,
}

/// 单次 RPC 失败原因
#[derive(Debug, Clone)]
enum CallError {
    /// 对端返回 error 对象
    Rpc(String),
    /// 写失败或读端关闭
    Disconnected(String),
}

type Reply = Result<Value, String>;
type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Reply>>>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// 调用结束（含被超时取消）时移除等待项
struct PendingGuard {
    pending: PendingMap,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.pending.lock() {
            map.remove(&self.id);
        }
    }
}

// ─── MCP Client ───────────────────────────────────────────────────────────────

pub struct McpClient {
    server_name: String,
    writer: Mutex<Option<Writer>>,
    next_id: AtomicU64,
    pending: PendingMap,
    tools: StdMutex<Vec<ToolCapability>>,
    /// 同一通道不允许并发调用
    call_lock: Mutex<()>,
    disconnected: Arc<AtomicBool>,
}

impl McpClient {
    /// 在给定读写端上建立会话：握手 + 缓存工具列表；任何一步超时或格式错误返回 ChannelProtocol
    pub async fn connect<R, W>(
        server_name: &str,
        reader: R,
        writer: W,
        handshake_timeout: Duration,
    ) -> Result<Self, AgentError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let disconnected = Arc::new(AtomicBool::new(false));

        tokio::spawn(Self::reader_task(
            BufReader::new(reader),
            Arc::clone(&pending),
            Arc::clone(&disconnected),
            server_name.to_string(),
        ));

        let client = Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Some(Box::new(writer))),
            next_id: AtomicU64::new(1),
            pending,
            tools: StdMutex::new(Vec::new()),
            call_lock: Mutex::new(()),
            disconnected,
        };

        let handshake = async {
            client.initialize().await?;
            client.refresh_tools().await
        };
        let outcome = tokio::time::timeout(handshake_timeout, handshake).await;
        match outcome {
            Ok(Ok(())) => Ok(client),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AgentError::ChannelProtocol(format!(
                "MCP[{}]: handshake timed out after {:?}",
                server_name, handshake_timeout
            ))),
        }
    }

    async fn reader_task<R: AsyncRead + Unpin>(
        reader: BufReader<R>,
        pending: PendingMap,
        disconnected: Arc<AtomicBool>,
        server_name: String,
    ) {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let resp: JsonRpcResponse = match serde_json::from_str(line) {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(server = %server_name, error = %e, "MCP ← unparseable line skipped");
                            continue;
                        }
                    };
                    // 没有 id 的是服务端通知
                    let Some(id) = resp.id else { continue };
                    let reply = match resp.error {
                        Some(err) => Err(format!("[{}] {}", err.code, err.message)),
                        None => Ok(resp.result.unwrap_or(Value::Null)),
                    };
                    let tx = pending.lock().ok().and_then(|mut map| map.remove(&id));
                    match tx {
                        Some(tx) => {
                            let _ = tx.send(reply);
                        }
                        None => debug!(server = %server_name, id, "MCP ← response for unknown id"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(server = %server_name, error = %e, "MCP ← read error");
                    break;
                }
            }
        }
        disconnected.store(true, Ordering::SeqCst);
        // 丢弃所有 sender，等待方收到 RecvError 即视为断开
        if let Ok(mut map) = pending.lock() {
            map.clear();
        }
        debug!(server = %server_name, "MCP reader finished");
    }

    async fn write_line(&self, line: &str) -> Result<(), CallError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| CallError::Disconnected("channel closed".to_string()))?;
        let io = |e: std::io::Error| CallError::Disconnected(format!("write error: {}", e));
        writer.write_all(line.as_bytes()).await.map_err(io)?;
        writer.write_all(b"\n").await.map_err(io)?;
        writer.flush().await.map_err(io)
    }

    /// 发送请求并等待同 id 的响应
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, CallError> {
        if self.is_disconnected() {
            return Err(CallError::Disconnected("server closed".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let line = serde_json::to_string(&req)
            .map_err(|e| CallError::Rpc(format!("serialize error: {}", e)))?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| CallError::Disconnected("pending map poisoned".to_string()))?
            .insert(id, tx);
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id,
        };
        // 读端可能恰好在插入前结束并清空了等待表
        if self.is_disconnected() {
            return Err(CallError::Disconnected("server closed".to_string()));
        }

        debug!(server = %self.server_name, id, method, "MCP → request");
        self.write_line(&line).await?;

        match rx.await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(CallError::Rpc(e)),
            Err(_) => Err(CallError::Disconnected("server closed".to_string())),
        }
    }

    fn protocol_error(&self, what: &str, e: CallError) -> AgentError {
        let detail = match e {
            CallError::Rpc(m) | CallError::Disconnected(m) => m,
        };
        AgentError::ChannelProtocol(format!("MCP[{}]: {}: {}", self.server_name, what, detail))
    }

    /// MCP initialize + initialized notification
    async fn initialize(&self) -> Result<(), AgentError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        let result = self
            .call("initialize", Some(params))
            .await
            .map_err(|e| self.protocol_error("initialize", e))?;
        if !result.is_object() {
            return Err(AgentError::ChannelProtocol(format!(
                "MCP[{}]: initialize returned {}",
                self.server_name, result
            )));
        }
        debug!(server = %self.server_name, ?result, "MCP initialized");

        let notif = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        });
        self.write_line(&notif.to_string())
            .await
            .map_err(|e| self.protocol_error("initialized notification", e))
    }

    /// 拉取 tools/list 并缓存
    pub async fn refresh_tools(&self) -> Result<(), AgentError> {
        let result = self
            .call("tools/list", None)
            .await
            .map_err(|e| self.protocol_error("tools/list", e))?;
        let raw = result.get("tools").cloned().ok_or_else(|| {
            AgentError::ChannelProtocol(format!(
                "MCP[{}]: tools/list response without 'tools'",
                self.server_name
            ))
        })?;
        let tools: Vec<McpTool> = serde_json::from_value(raw).map_err(|e| {
            AgentError::ChannelProtocol(format!("MCP[{}]: parse tools: {}", self.server_name, e))
        })?;
        let caps: Vec<ToolCapability> = tools
            .into_iter()
            .map(|t| ToolCapability {
                name: t.name,
                description: t.description.unwrap_or_default(),
                input_schema: t
                    .input_schema
                    .unwrap_or_else(|| serde_json::json!({ "type": "object" })),
            })
            .collect();
        debug!(server = %self.server_name, count = caps.len(), "MCP tools loaded");
        if let Ok(mut cached) = self.tools.lock() {
            *cached = caps;
        }
        Ok(())
    }

    /// 缓存的工具列表
    pub fn tools(&self) -> Vec<ToolCapability> {
        self.tools.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// tools/call：参数表达式按 schema 绑定为 arguments；isError 或 RPC 错误转为 ToolExecution
    pub async fn invoke(&self, tool: &str, args: &str) -> Result<ToolResult, AgentError> {
        let _serial = self.call_lock.lock().await;
        self.call_tool(tool, args).await
    }

    /// 限时的 tools/call；排队等待 call_lock 的时间不计入 limit
    pub async fn invoke_within(
        &self,
        tool: &str,
        args: &str,
        limit: Duration,
    ) -> Result<ToolResult, AgentError> {
        let _serial = self.call_lock.lock().await;
        match tokio::time::timeout(limit, self.call_tool(tool, args)).await {
            Ok(r) => r,
            Err(_) => {
                warn!(server = %self.server_name, tool, ?limit, "MCP tool call timed out");
                Err(timeout_error(tool, args, limit))
            }
        }
    }

    async fn call_tool(&self, tool: &str, args: &str) -> Result<ToolResult, AgentError> {
        let schema = self
            .tools()
            .into_iter()
            .find(|t| t.name == tool)
            .map(|t| t.input_schema)
            .unwrap_or(Value::Null);
        let params = serde_json::json!({
            "name": tool,
            "arguments": bind_arguments(args, &schema),
        });

        let result = self.call("tools/call", Some(params)).await.map_err(|e| match e {
            CallError::Rpc(m) => AgentError::tool(tool, args, ToolFailureKind::Reported, m),
            CallError::Disconnected(m) => {
                AgentError::tool(tool, args, ToolFailureKind::Disconnected, m)
            }
        })?;

        let raw = decode_call_result(&result);
        if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
            let reason = match &raw {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Err(AgentError::tool(tool, args, ToolFailureKind::Reported, reason));
        }
        Ok(ToolResult::new(tool, args, raw))
    }

    /// 关闭写端（对 stdio 服务端即 stdin EOF，是它的正常退出信号）；幂等
    pub async fn shutdown(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut w) = writer {
            let _ = w.shutdown().await;
            debug!(server = %self.server_name, "MCP writer closed");
        }
    }
}

/// 将 tools/call 的 result 解成原始值：
/// structuredContent 优先；单个 text 内容尝试按 JSON 解析；多个内容组成列表
fn decode_call_result(result: &Value) -> Value {
    if let Some(structured) = result.get("structuredContent") {
        if !structured.is_null() {
            return structured.clone();
        }
    }
    let Some(content) = result.get("content").and_then(Value::as_array) else {
        return result.clone();
    };
    let mut items: Vec<Value> = content
        .iter()
        .map(|item| match item.get("text").and_then(Value::as_str) {
            Some(text) => serde_json::from_str::<Value>(text)
                .ok()
                .filter(|v| v.is_object() || v.is_array())
                .unwrap_or_else(|| Value::String(text.to_string())),
            None => item.clone(),
        })
        .collect();
    match items.len() {
        0 => Value::String(String::new()),
        1 => items.remove(0),
        _ => Value::Array(items),
    }
}
