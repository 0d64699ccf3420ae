//! 工具层：通道抽象、MCP 客户端、外部进程管理与带超时/审计的执行器

pub mod args;
pub mod channel;
pub mod executor;
pub mod mcp;
pub mod process;

pub use args::bind_arguments;
pub use channel::{ToolCapability, ToolChannel, ToolConnector, ToolResult};
pub use executor::ToolExecutor;
pub use mcp::McpClient;
pub use process::{ChannelLease, ServerParams, ToolServerManager};
