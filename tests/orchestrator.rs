//! 编排器端到端测试：脚本化规划器 + 进程内工具通道

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use taskpilot::core::{
    AgentError, Orchestrator, OrchestratorParts, RecoveryEngine, Session, SessionRegistry,
    SessionStatus, SessionSupervisor, StepStatus, ToolFailureKind, PENDING_RESULT,
    STEP_LIMIT_ANSWER,
};
use taskpilot::memory::{InMemoryFactStore, MemoryStore};
use taskpilot::react::{
    KeywordPerception, LoopSettings, PlanRequest, Planner, SessionEvent, ToolInvocationPlan,
};
use taskpilot::tools::{ToolCapability, ToolChannel, ToolConnector, ToolResult};

/// 按脚本给出计划；脚本耗尽后重复 fallback（None 时 panic，用于测试边界捕获）
struct ScriptedPlanner {
    script: Mutex<VecDeque<ToolInvocationPlan>>,
    fallback: Option<ToolInvocationPlan>,
    contexts: Mutex<Vec<String>>,
}

impl ScriptedPlanner {
    fn new(script: Vec<ToolInvocationPlan>, fallback: Option<ToolInvocationPlan>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            contexts: Mutex::new(Vec::new()),
        }
    }

    fn always(plan: ToolInvocationPlan) -> Self {
        Self::new(Vec::new(), Some(plan))
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, request: PlanRequest<'_>) -> Result<ToolInvocationPlan, AgentError> {
        self.contexts.lock().unwrap().push(request.context.to_string());
        let next = self.script.lock().unwrap().pop_front();
        match next.or_else(|| self.fallback.clone()) {
            Some(plan) => Ok(plan),
            None => panic!("planner script exhausted"),
        }
    }
}

/// 进程内算术工具；fail_on 指定第几次调用（从 0 起）失败
#[derive(Default)]
struct FakeTools {
    calls: AtomicUsize,
    closes: AtomicUsize,
    connects: AtomicUsize,
    fail_on: Option<usize>,
    fail_once: bool,
    unavailable: bool,
    slow: bool,
    crash: bool,
}

#[async_trait]
impl ToolChannel for FakeTools {
    async fn list_capabilities(&self) -> Result<Vec<ToolCapability>, AgentError> {
        Ok(vec![ToolCapability::new("add", "Add two integers").with_schema(json!({
            "type": "object",
            "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
            "required": ["a", "b"]
        }))])
    }

    async fn invoke(&self, tool: &str, args: &str) -> Result<ToolResult, AgentError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.slow {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.crash {
            panic!("tool crashed");
        }
        let fail = match self.fail_on {
            Some(i) if self.fail_once => n == i,
            Some(i) => n >= i,
            None => false,
        };
        if fail {
            return Err(AgentError::tool(tool, args, ToolFailureKind::Reported, "boom"));
        }
        let sum: i64 = args
            .split(',')
            .filter_map(|s| s.trim().parse::<i64>().ok())
            .sum();
        Ok(ToolResult::new(tool, args, json!(sum.to_string())))
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeConnector(Arc<FakeTools>);

#[async_trait]
impl ToolConnector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn ToolChannel>, AgentError> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        if self.0.unavailable {
            return Err(AgentError::ChannelUnavailable(
                "failed to spawn 'python mcp-server.py': No such file or directory".into(),
            ));
        }
        Ok(self.0.clone())
    }
}

struct Harness {
    orchestrator: Orchestrator,
    tools: Arc<FakeTools>,
    planner: Arc<ScriptedPlanner>,
    memory: Arc<InMemoryFactStore>,
}

fn harness(tools: FakeTools, planner: ScriptedPlanner, settings: LoopSettings, retries: u32) -> Harness {
    let tools = Arc::new(tools);
    let planner = Arc::new(planner);
    let memory = Arc::new(InMemoryFactStore::default());
    let orchestrator = Orchestrator::new(OrchestratorParts {
        registry: Arc::new(SessionRegistry::new()),
        connector: Arc::new(FakeConnector(tools.clone())),
        perception: Arc::new(KeywordPerception),
        planner: planner.clone(),
        memory: memory.clone(),
        recovery: RecoveryEngine::new(retries),
        settings,
        call_timeout: Duration::from_secs(5),
        supervisor: Arc::new(SessionSupervisor::new()),
        max_concurrent_sessions: 4,
    });
    Harness {
        orchestrator,
        tools,
        planner,
        memory,
    }
}

fn fast(max_steps: usize) -> LoopSettings {
    LoopSettings {
        max_steps,
        memory_top_k: 5,
        step_delay: Duration::ZERO,
    }
}

fn assert_contiguous(session: &Session) {
    let keys: Vec<usize> = session.steps.keys().copied().collect();
    assert_eq!(keys, (0..session.steps.len()).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_add_then_final_answer() {
    let h = harness(
        FakeTools::default(),
        ScriptedPlanner::new(
            vec![
                ToolInvocationPlan::call("add(2, 2)"),
                ToolInvocationPlan::final_answer("4"),
            ],
            None,
        ),
        fast(30),
        0,
    );

    let s = h.orchestrator.run("what is 2+2").await.unwrap();
    assert_eq!(s.status, SessionStatus::Completed);
    assert_eq!(s.final_answer.as_deref(), Some("4"));
    assert!(s.error.is_none());
    assert_eq!(s.steps.len(), 1);
    let step = &s.steps[&0];
    assert_eq!(step.tool, "add");
    assert_eq!(step.args, "2, 2");
    assert_eq!(step.result, "4");
    assert_eq!(step.status, StepStatus::Finished);
    assert_eq!(h.tools.closes.load(Ordering::SeqCst), 1);

    // 第二步的上下文携带了上一步结果
    let contexts = h.planner.contexts.lock().unwrap().clone();
    assert_eq!(contexts[0], "what is 2+2");
    assert!(contexts[1].contains("Previous results: step_0_add: 4"));

    // 工具调用被写入记忆，且只能按本会话检索到
    assert_eq!(h.memory.len(), 1);
    let facts = h.memory.retrieve("add", 5, Some(&s.id)).unwrap();
    assert_eq!(facts[0].text, "Tool call: add(2, 2), result: 4");
    assert!(h.memory.retrieve("add", 5, Some("other")).unwrap().is_empty());
}

#[tokio::test]
async fn test_failure_on_step_three_is_fatal() {
    let h = harness(
        FakeTools {
            fail_on: Some(3),
            ..Default::default()
        },
        ScriptedPlanner::always(ToolInvocationPlan::call("add(1, 1)")),
        fast(30),
        0,
    );

    let s = h.orchestrator.run("keep adding").await.unwrap();
    assert_eq!(s.status, SessionStatus::Error);
    assert_eq!(s.steps.len(), 4);
    assert_contiguous(&s);
    for i in 0..3 {
        assert_eq!(s.steps[&i].status, StepStatus::Finished);
    }
    assert_eq!(s.steps[&3].status, StepStatus::Error);
    assert!(s.steps[&3].result.contains("boom"));
    let err = s.error.clone().unwrap();
    assert!(err.contains("add(1, 1)"), "{}", err);
    assert_eq!(h.tools.closes.load(Ordering::SeqCst), 1);

    // 终态不再变化
    let again = h.orchestrator.registry().view(&s.id).unwrap();
    assert_eq!(again, s.view());
}

#[tokio::test]
async fn test_step_budget_exhaustion_completes() {
    let h = harness(
        FakeTools::default(),
        ScriptedPlanner::always(ToolInvocationPlan::call("add(1, 2)")),
        fast(5),
        0,
    );

    let s = h.orchestrator.run("loop forever").await.unwrap();
    assert_eq!(s.status, SessionStatus::Completed);
    assert_eq!(s.final_answer.as_deref(), Some(STEP_LIMIT_ANSWER));
    assert!(s.error.is_none());
    assert_eq!(s.steps.len(), 5);
    assert_contiguous(&s);
    assert!(s.steps.values().all(|r| r.status == StepStatus::Finished));
    assert_eq!(h.tools.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_channel_unavailable_fails_before_loop() {
    let h = harness(
        FakeTools {
            unavailable: true,
            ..Default::default()
        },
        ScriptedPlanner::always(ToolInvocationPlan::final_answer("never")),
        fast(30),
        0,
    );

    let s = h.orchestrator.run("anything").await.unwrap();
    assert_eq!(s.status, SessionStatus::Error);
    assert!(s.steps.is_empty());
    assert!(s.error.unwrap().starts_with("Tool channel unavailable"));
    assert!(h.planner.contexts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_bare_tool_name_without_parens() {
    let h = harness(
        FakeTools::default(),
        ScriptedPlanner::new(
            vec![
                ToolInvocationPlan::call("add"),
                ToolInvocationPlan::final_answer("0"),
            ],
            None,
        ),
        fast(30),
        0,
    );
    let s = h.orchestrator.run("sum nothing").await.unwrap();
    assert_eq!(s.steps[&0].tool, "add");
    assert_eq!(s.steps[&0].args, "");
    assert_eq!(s.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_placeholder_visible_before_invoke() {
    let h = harness(
        FakeTools::default(),
        ScriptedPlanner::new(
            vec![
                ToolInvocationPlan::call("add(2, 3)"),
                ToolInvocationPlan::final_answer("5"),
            ],
            None,
        ),
        LoopSettings {
            max_steps: 30,
            memory_top_k: 5,
            step_delay: Duration::from_millis(300),
        },
        0,
    );

    let task = h.orchestrator.start("what is 2+3");
    let mut saw_placeholder = false;
    for _ in 0..100 {
        if let Some(v) = h.orchestrator.registry().view(&task.id) {
            if let Some(step) = v.steps.get(&0) {
                if step.status == StepStatus::Running {
                    assert_eq!(step.result, PENDING_RESULT);
                    assert_eq!(v.status, SessionStatus::Running);
                    // 延迟期间工具尚未被调用
                    assert_eq!(h.tools.calls.load(Ordering::SeqCst), 0);
                    saw_placeholder = true;
                    break;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(saw_placeholder);
    task.join.await.unwrap();
    let s = h.orchestrator.registry().get(&task.id).unwrap();
    assert_eq!(s.steps[&0].status, StepStatus::Finished);
    assert_eq!(s.final_answer.as_deref(), Some("5"));
}

#[tokio::test]
async fn test_cancel_mid_invoke() {
    let h = harness(
        FakeTools {
            slow: true,
            ..Default::default()
        },
        ScriptedPlanner::always(ToolInvocationPlan::call("add(1, 1)")),
        fast(30),
        0,
    );

    let task = h.orchestrator.start("slow work");
    for _ in 0..200 {
        if h.tools.calls.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(h.orchestrator.cancel(&task.id));
    tokio::time::timeout(Duration::from_secs(5), task.join)
        .await
        .expect("session should stop promptly")
        .unwrap();

    let s = h.orchestrator.registry().get(&task.id).unwrap();
    assert_eq!(s.status, SessionStatus::Error);
    assert_eq!(s.error.as_deref(), Some("cancelled"));
    assert_eq!(s.steps[&0].status, StepStatus::Error);
    assert_eq!(h.tools.closes.load(Ordering::SeqCst), 1);
    assert!(!h.orchestrator.cancel("missing"));
}

#[tokio::test]
async fn test_bounded_retry_recovers() {
    let h = harness(
        FakeTools {
            fail_on: Some(0),
            fail_once: true,
            ..Default::default()
        },
        ScriptedPlanner::new(
            vec![
                ToolInvocationPlan::call("add(2, 2)"),
                ToolInvocationPlan::final_answer("4"),
            ],
            None,
        ),
        fast(30),
        1,
    );

    let s = h.orchestrator.run("what is 2+2").await.unwrap();
    assert_eq!(s.status, SessionStatus::Completed);
    assert_eq!(s.steps.len(), 1);
    assert_eq!(s.steps[&0].status, StepStatus::Finished);
    assert_eq!(h.tools.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_panic_in_loop_becomes_error() {
    let h = harness(
        FakeTools::default(),
        ScriptedPlanner::new(vec![ToolInvocationPlan::call("add(1, 1)")], None),
        fast(30),
        0,
    );

    let s = h.orchestrator.run("explode").await.unwrap();
    assert_eq!(s.status, SessionStatus::Error);
    assert!(s.error.unwrap().contains("planner script exhausted"));
    assert_eq!(s.steps[&0].status, StepStatus::Finished);
    assert_eq!(h.tools.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_panic_during_step_settles_the_step() {
    let h = harness(
        FakeTools {
            crash: true,
            ..Default::default()
        },
        ScriptedPlanner::always(ToolInvocationPlan::call("add(1, 1)")),
        fast(30),
        0,
    );

    let s = h.orchestrator.run("crash").await.unwrap();
    assert_eq!(s.status, SessionStatus::Error);
    assert_eq!(s.steps.len(), 1);
    assert_eq!(s.steps[&0].status, StepStatus::Error);
    assert!(s.steps[&0].result.contains("tool crashed"));
    assert!(s.steps.values().all(|r| r.status != StepStatus::Running));
    assert_eq!(h.tools.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let h = harness(
        FakeTools::default(),
        ScriptedPlanner::always(ToolInvocationPlan::final_answer("done")),
        fast(30),
        0,
    );

    let tasks: Vec<_> = (0..6).map(|i| h.orchestrator.start(&format!("q{}", i))).collect();
    let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
    for t in tasks {
        t.join.await.unwrap();
    }
    for id in &ids {
        let v = h.orchestrator.registry().view(id).unwrap();
        assert_eq!(v.status, SessionStatus::Completed);
    }
    assert_eq!(h.tools.connects.load(Ordering::SeqCst), 6);
    assert_eq!(h.tools.closes.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_events_follow_lifecycle() {
    let h = harness(
        FakeTools::default(),
        ScriptedPlanner::new(
            vec![
                ToolInvocationPlan::call("add(2, 2)"),
                ToolInvocationPlan::final_answer("4"),
            ],
            None,
        ),
        fast(30),
        0,
    );

    let mut rx = h.orchestrator.registry().subscribe();
    let s = h.orchestrator.run("what is 2+2").await.unwrap();

    let mut events = Vec::new();
    while let Ok(env) = rx.try_recv() {
        if env.session_id == s.id {
            events.push(env.event);
        }
    }
    assert_eq!(
        events.first(),
        Some(&SessionEvent::StatusChanged {
            status: SessionStatus::Running
        })
    );
    assert!(events.contains(&SessionEvent::ToolCall {
        step: 0,
        tool: "add".into(),
        args: "2, 2".into()
    }));
    assert!(events.contains(&SessionEvent::FinalAnswer { text: "4".into() }));
    assert_eq!(
        events.last(),
        Some(&SessionEvent::StatusChanged {
            status: SessionStatus::Completed
        })
    );
}
