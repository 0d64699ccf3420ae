//! 认知层：感知、规划、关键结果累积与单会话主循环

pub mod events;
pub mod facts;
pub mod loop_;
pub mod perception;
pub mod planner;

pub use events::{SessionEvent, SessionEventEnvelope};
pub use facts::KeyResults;
pub use loop_::{LoopSettings, StepLoop};
pub use perception::{KeywordPerception, LlmPerception, Perception, PerceptionResult};
pub use planner::{parse_plan, LlmPlanner, PlanRequest, Planner, ToolInvocationPlan};
