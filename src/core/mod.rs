//! 核心编排层：错误与恢复、会话状态与注册表、会话监管、准入调度、编排器、优雅关闭

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod registry;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;
pub mod task_scheduler;

pub use builder::{create_agent_builder, AgentBuilder, AgentComponents};
pub use error::{AgentError, RecoveryAction, ToolFailureKind};
pub use orchestrator::{Orchestrator, OrchestratorParts, SessionTask};
pub use recovery::RecoveryEngine;
pub use registry::{SessionHandle, SessionRegistry};
pub use session_supervisor::SessionSupervisor;
pub use shutdown::{
    SessionCancelCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
    ToolServerCleanup,
};
pub use state::{
    Session, SessionId, SessionStatus, SessionView, StepRecord, StepStatus, PENDING_RESULT,
    STEP_LIMIT_ANSWER,
};
pub use task_scheduler::TaskScheduler;
