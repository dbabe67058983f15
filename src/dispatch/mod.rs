//! 并行调度器
//!
//! 反复计算就绪集（pending 且依赖全部 succeeded），整批并发启动，每个任务独立超时；
//! 依赖失败的任务标记 skipped 而非调度：skip 不是错误，只是降级该槽位的合成输入。
//! 任务级 max_attempts 限制瞬时错误（超时 / 工具错误 / 非法输出）的自动重试，
//! 与质量门使用的计划级 retry_budget 互不相干。
//! 每次任务状态转移先写入会话存储，再把内存结果交给下一阶段（崩溃可恢复）。

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::budget::{ContextBudgeter, TokenEstimator};
use crate::core::error::TaskError;
use crate::plan::{Plan, PlanError, Task, TaskId, TaskResult, TaskStatus};
use crate::registry::{CapabilityHandler, CapabilityRegistry, ConcurrencyClass};
use crate::store::{task_key, SessionStore, StoreError};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),
}

/// 调度阶段汇总：任务终态计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// 并行调度器
pub struct ParallelDispatcher {
    registry: Arc<CapabilityRegistry>,
    store: Arc<dyn SessionStore>,
    /// Exclusive 类能力串行执行
    exclusive: Arc<Semaphore>,
    /// Limited 类能力共享许可池
    limited: Arc<Semaphore>,
    /// 任务输入载荷进入能力前的 token 预算
    input_budget: usize,
    /// 统一覆盖单次尝试超时，不经描述符钳位（演练与测试用）
    attempt_timeout: Option<Duration>,
}

impl ParallelDispatcher {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        store: Arc<dyn SessionStore>,
        limited_permits: usize,
        input_budget: usize,
    ) -> Self {
        Self {
            registry,
            store,
            exclusive: Arc::new(Semaphore::new(1)),
            limited: Arc::new(Semaphore::new(limited_permits.max(1))),
            input_budget,
            attempt_timeout: None,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// 执行计划的调度阶段：直到没有任务处于 pending / running。
    /// 任务完成顺序不确定；下游合成只按计划声明顺序消费。
    pub async fn dispatch(&self, plan: &mut Plan, cancel: &CancellationToken) -> Result<DispatchReport, DispatchError> {
        loop {
            // 依赖已失败 / 跳过的任务永远无法就绪，标记 skipped
            for task_id in plan.blocked_set() {
                let task = plan.task_mut(&task_id)?;
                task.advance(TaskStatus::Skipped)?;
                tracing::info!(task_id = %task_id, capability = %task.capability, "Task skipped: dependency failed");
                self.persist_task(&plan.id.clone(), plan.task(&task_id)?).await?;
            }

            // 计划级截止已触发：剩余 pending 全部跳过，强制部分合成
            if cancel.is_cancelled() {
                let pending: Vec<TaskId> = plan
                    .tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Pending)
                    .map(|t| t.id.clone())
                    .collect();
                for task_id in pending {
                    plan.task_mut(&task_id)?.advance(TaskStatus::Skipped)?;
                    self.persist_task(&plan.id.clone(), plan.task(&task_id)?).await?;
                }
                tracing::warn!(plan_id = %plan.id, "Plan deadline reached, remaining tasks skipped");
                break;
            }

            let ready = plan.ready_set();
            if ready.is_empty() {
                break;
            }

            // 就绪集整批并发启动：先持久化 running 转移，再派发
            let mut handles = Vec::new();
            for task_id in &ready {
                plan.task_mut(task_id)?.advance(TaskStatus::Running)?;
                self.persist_task(&plan.id.clone(), plan.task(task_id)?).await?;

                let task = plan.task(task_id)?;
                handles.push(self.launch(task, cancel.clone()));
            }
            let outcomes = futures_util::future::join_all(handles).await;

            // join_all 保持启动顺序，JoinError 才能回溯到具体任务
            for (ready_id, handle_result) in ready.iter().zip(outcomes) {
                let (task_id, attempts, outcome) = match handle_result {
                    Ok(v) => v,
                    Err(join_err) => {
                        tracing::error!(task_id = %ready_id, error = %join_err, "Capability panicked");
                        let err = TaskError::ToolFailure(format!("capability panicked: {join_err}"));
                        (ready_id.clone(), 0, Err(err))
                    }
                };
                let plan_id = plan.id.clone();
                let task = plan.task_mut(&task_id)?;
                task.attempt_count += attempts;
                match outcome {
                    Ok(result) => {
                        tracing::info!(task_id = %task_id, capability = %task.capability, attempts, "Task succeeded");
                        task.result = Some(result);
                        task.advance(TaskStatus::Succeeded)?;
                    }
                    Err(err) => {
                        tracing::warn!(task_id = %task_id, capability = %task.capability, attempts, error = %err, "Task failed");
                        task.error = Some(err.to_string());
                        task.advance(TaskStatus::Failed)?;
                    }
                }
                self.persist_task(&plan_id, plan.task(&task_id)?).await?;
            }
        }

        let mut report = DispatchReport::default();
        for task in &plan.tasks {
            match task.status {
                TaskStatus::Succeeded => report.succeeded += 1,
                TaskStatus::Failed => report.failed += 1,
                TaskStatus::Skipped => report.skipped += 1,
                _ => {}
            }
        }
        Ok(report)
    }

    /// 启动单个任务：并发许可 + 独立超时 + max_attempts 重试
    fn launch(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<(TaskId, u32, Result<TaskResult, TaskError>)> {
        let task_id = task.id.clone();
        let capability = task.capability.clone();

        let (descriptor, handler) = match (
            self.registry.descriptor(&capability).cloned(),
            self.registry.handler(&capability),
        ) {
            (Some(d), Some(h)) => (d, h),
            _ => {
                return tokio::spawn(async move {
                    let err = TaskError::ToolFailure(format!("unknown capability: {capability}"));
                    (task_id, 0, Err(err))
                });
            }
        };

        // 输入载荷同样过预算器：key_fields 面向输出，这里只做列表与文本压缩
        let compressed = ContextBudgeter::compress(&task.input_payload, self.input_budget, &[]);
        if compressed.truncated {
            tracing::debug!(task_id = %task_id, capability = %capability, "Input payload hard-truncated to fit budget");
        }
        let payload = compressed.value;

        let attempt_timeout = self
            .attempt_timeout
            .unwrap_or_else(|| Duration::from_secs(descriptor.timeout_secs.clamp(5, 600)));

        let permit_source = match descriptor.concurrency {
            ConcurrencyClass::Exclusive => Some(Arc::clone(&self.exclusive)),
            ConcurrencyClass::Limited => Some(Arc::clone(&self.limited)),
            ConcurrencyClass::Unbounded => None,
        };

        tokio::spawn(async move {
            let _permit = match permit_source {
                Some(semaphore) => match semaphore.acquire_owned().await {
                    Ok(p) => Some(p),
                    Err(_) => {
                        return (task_id, 0, Err(TaskError::ToolFailure("scheduler closed".into())));
                    }
                },
                None => None,
            };
            let (attempts, outcome) =
                run_attempts(&descriptor.name, handler, &descriptor, &payload, attempt_timeout, &cancel).await;
            (task_id, attempts, outcome)
        })
    }

    async fn persist_task(&self, plan_id: &str, task: &Task) -> Result<(), StoreError> {
        let record = serde_json::to_value(task).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store.put(&task_key(plan_id, &task.id), record, None).await
    }
}

/// 在 max_attempts 内重试能力调用；每次调用受 timeout 与计划级取消约束
async fn run_attempts(
    capability: &str,
    handler: Arc<dyn CapabilityHandler>,
    descriptor: &crate::registry::CapabilityDescriptor,
    payload: &serde_json::Value,
    attempt_timeout: Duration,
    cancel: &CancellationToken,
) -> (u32, Result<TaskResult, TaskError>) {
    let timeout_secs = attempt_timeout.as_secs();
    let max_attempts = descriptor.max_attempts.max(1);
    let mut attempts = 0;
    let mut last_err = TaskError::ToolFailure("not attempted".into());

    while attempts < max_attempts {
        attempts += 1;
        let call = handler.invoke(payload);
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(TaskError::Timeout(timeout_secs)),
            r = tokio::time::timeout(attempt_timeout, call) => {
                match r {
                    Ok(inner) => inner,
                    Err(_) => Err(TaskError::Timeout(timeout_secs)),
                }
            }
        };

        match result {
            Ok(output) => match CapabilityRegistry::validate_output(descriptor, &output) {
                Ok(()) => {
                    let confidence = output
                        .get("confidence")
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.5)
                        .clamp(0.0, 1.0);
                    let result = TaskResult {
                        capability: capability.to_string(),
                        token_estimate: TokenEstimator::estimate_value(&output),
                        output,
                        confidence,
                        created_at: chrono::Utc::now(),
                    };
                    return (attempts, Ok(result));
                }
                Err(err) => {
                    tracing::warn!(capability, attempt = attempts, error = %err, "Invalid capability output");
                    last_err = err;
                }
            },
            Err(err) => {
                tracing::warn!(capability, attempt = attempts, error = %err, "Capability attempt failed");
                last_err = err;
            }
        }

        // 计划级取消时不再重试
        if cancel.is_cancelled() {
            break;
        }
    }

    (attempts, Err(last_err))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::budget::relevance_of;
    use crate::registry::CapabilityDescriptor;
    use crate::store::MemorySessionStore;

    struct OkHandler {
        delay_ms: u64,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CapabilityHandler for OkHandler {
        async fn invoke(&self, _payload: &Value) -> Result<Value, TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            Ok(json!({"summary": "done", "confidence": 0.8}))
        }
    }

    struct FlakyHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CapabilityHandler for FlakyHandler {
        async fn invoke(&self, _payload: &Value) -> Result<Value, TaskError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(TaskError::ToolFailure("transient".into()))
            } else {
                Ok(json!({"summary": "recovered"}))
            }
        }
    }

    struct AlwaysFailHandler;

    #[async_trait]
    impl CapabilityHandler for AlwaysFailHandler {
        async fn invoke(&self, _payload: &Value) -> Result<Value, TaskError> {
            Err(TaskError::ToolFailure("broken tool".into()))
        }
    }

    struct PanickyHandler;

    #[async_trait]
    impl CapabilityHandler for PanickyHandler {
        async fn invoke(&self, _payload: &Value) -> Result<Value, TaskError> {
            panic!("handler blew up");
        }
    }

    struct RecordingHandler {
        seen: std::sync::Mutex<Option<Value>>,
    }

    #[async_trait]
    impl CapabilityHandler for RecordingHandler {
        async fn invoke(&self, payload: &Value) -> Result<Value, TaskError> {
            *self.seen.lock().unwrap() = Some(payload.clone());
            Ok(json!({"summary": "ok", "confidence": 0.8}))
        }
    }

    fn plan_with(tasks: Vec<Task>) -> Plan {
        let id = uuid::Uuid::new_v4().to_string();
        Plan {
            root_plan_id: id.clone(),
            id,
            parent_plan_id: None,
            created_at: chrono::Utc::now(),
            status: crate::plan::PlanStatus::Active,
            topic: "t".into(),
            tasks,
            synthesis_strategy: Default::default(),
            success_criteria: Default::default(),
            quality_threshold: 70.0,
            retry_budget: 2,
            deadline_secs: None,
            rubric: Default::default(),
            failure_reason: None,
        }
    }

    fn dispatcher(registry: CapabilityRegistry) -> ParallelDispatcher {
        ParallelDispatcher::new(Arc::new(registry), Arc::new(MemorySessionStore::new()), 3, 2000)
    }

    #[tokio::test]
    async fn test_independent_tasks_run_concurrently() {
        let mut registry = CapabilityRegistry::new();
        registry.register(
            CapabilityDescriptor::new("slow", ""),
            Arc::new(OkHandler { delay_ms: 100, calls: AtomicUsize::new(0) }),
        );

        let mut plan = plan_with(vec![
            Task::new("slow", json!({})),
            Task::new("slow", json!({})),
            Task::new("slow", json!({})),
        ]);

        let start = std::time::Instant::now();
        let report = dispatcher(registry)
            .dispatch(&mut plan, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.succeeded, 3);
        // 三个独立任务整批并发，不是串行 300ms
        assert!(start.elapsed() < Duration::from_millis(280), "tasks ran sequentially");
    }

    #[tokio::test]
    async fn test_transient_failure_retried_within_max_attempts() {
        let mut registry = CapabilityRegistry::new();
        registry.register(
            CapabilityDescriptor::new("flaky", ""),
            Arc::new(FlakyHandler { calls: AtomicUsize::new(0) }),
        );

        let mut plan = plan_with(vec![Task::new("flaky", json!({}))]);
        let report = dispatcher(registry)
            .dispatch(&mut plan, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(plan.tasks[0].attempt_count, 2);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_mark_failed() {
        let mut registry = CapabilityRegistry::new();
        registry.register(CapabilityDescriptor::new("broken", ""), Arc::new(AlwaysFailHandler));

        let mut plan = plan_with(vec![Task::new("broken", json!({}))]);
        let report = dispatcher(registry)
            .dispatch(&mut plan, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(plan.tasks[0].status, TaskStatus::Failed);
        assert_eq!(plan.tasks[0].attempt_count, 2);
        assert!(plan.tasks[0].error.as_deref().unwrap_or("").contains("broken tool"));
    }

    #[tokio::test]
    async fn test_skip_propagation_on_failed_dependency() {
        let mut registry = CapabilityRegistry::new();
        registry.register(CapabilityDescriptor::new("broken", ""), Arc::new(AlwaysFailHandler));
        registry.register(
            CapabilityDescriptor::new("ok", ""),
            Arc::new(OkHandler { delay_ms: 0, calls: AtomicUsize::new(0) }),
        );

        let upstream = Task::new("broken", json!({}));
        let mut downstream = Task::new("ok", json!({}));
        downstream.dependency_set.insert(upstream.id.clone());
        let mut plan = plan_with(vec![upstream, downstream]);

        let report = dispatcher(registry)
            .dispatch(&mut plan, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
        // 依赖失败的任务从未进入 running
        assert_eq!(plan.tasks[1].status, TaskStatus::Skipped);
        assert_eq!(plan.tasks[1].attempt_count, 0);
    }

    #[tokio::test]
    async fn test_dependency_chain_runs_in_order() {
        let mut registry = CapabilityRegistry::new();
        registry.register(
            CapabilityDescriptor::new("ok", ""),
            Arc::new(OkHandler { delay_ms: 0, calls: AtomicUsize::new(0) }),
        );

        let first = Task::new("ok", json!({}));
        let mut second = Task::new("ok", json!({}));
        second.dependency_set.insert(first.id.clone());
        let mut plan = plan_with(vec![first, second]);

        let report = dispatcher(registry)
            .dispatch(&mut plan, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.succeeded, 2);
    }

    #[tokio::test]
    async fn test_cancellation_skips_pending_tasks() {
        let mut registry = CapabilityRegistry::new();
        registry.register(
            CapabilityDescriptor::new("ok", ""),
            Arc::new(OkHandler { delay_ms: 0, calls: AtomicUsize::new(0) }),
        );

        let mut plan = plan_with(vec![Task::new("ok", json!({}))]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = dispatcher(registry).dispatch(&mut plan, &cancel).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.succeeded, 0);
    }

    #[tokio::test]
    async fn test_unknown_capability_fails_task() {
        let registry = CapabilityRegistry::new();
        let mut plan = plan_with(vec![Task::new("ghost", json!({}))]);
        let report = dispatcher(registry)
            .dispatch(&mut plan, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert!(plan.tasks[0].error.as_deref().unwrap_or("").contains("unknown capability"));
    }

    #[tokio::test]
    async fn test_panicking_capability_marked_failed() {
        let mut registry = CapabilityRegistry::new();
        registry.register(CapabilityDescriptor::new("panicky", ""), Arc::new(PanickyHandler));

        let store = Arc::new(MemorySessionStore::new());
        let dispatcher = ParallelDispatcher::new(Arc::new(registry), store.clone(), 3, 2000);
        let mut plan = plan_with(vec![Task::new("panicky", json!({}))]);
        let report = dispatcher.dispatch(&mut plan, &CancellationToken::new()).await.unwrap();

        // panic 降级为任务失败，而不是把槽位留在 running
        assert_eq!(report.failed, 1);
        assert_eq!(plan.tasks[0].status, TaskStatus::Failed);
        assert!(plan.tasks[0].error.as_deref().unwrap_or("").contains("panicked"));
        assert!(plan.dispatch_done());

        let stored = store.get(&task_key(&plan.id, &plan.tasks[0].id)).await.unwrap();
        assert_eq!(stored["status"], "failed");
    }

    #[tokio::test]
    async fn test_slow_capability_times_out_and_degrades_to_gap() {
        let slow = Arc::new(OkHandler { delay_ms: 200, calls: AtomicUsize::new(0) });
        let mut registry = CapabilityRegistry::new();
        registry.register(CapabilityDescriptor::new("slow", ""), slow.clone());
        registry.register(
            CapabilityDescriptor::new("ok", ""),
            Arc::new(OkHandler { delay_ms: 0, calls: AtomicUsize::new(0) }),
        );

        let mut plan = plan_with(vec![Task::new("slow", json!({})), Task::new("ok", json!({}))]);
        let dispatcher =
            ParallelDispatcher::new(Arc::new(registry), Arc::new(MemorySessionStore::new()), 3, 2000)
                .with_attempt_timeout(Duration::from_millis(50));
        let report = dispatcher.dispatch(&mut plan, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(plan.tasks[0].status, TaskStatus::Failed);
        assert_eq!(plan.tasks[0].attempt_count, 2);
        assert_eq!(slow.calls.load(Ordering::SeqCst), 2);
        assert!(plan.tasks[0].error.as_deref().unwrap_or("").contains("timeout"));

        // 超时槽位在合成时降级为 gap
        let mut inputs = std::collections::BTreeMap::new();
        inputs.insert(
            plan.tasks[1].id.clone(),
            plan.tasks[1].result.as_ref().unwrap().output.clone(),
        );
        let candidate = crate::synthesis::Synthesizer::new()
            .synthesize(&plan, &inputs, 0, None, &[])
            .unwrap();
        assert_eq!(candidate.gaps.len(), 1);
        assert!(candidate.gaps[0].reason.contains("timeout"));
    }

    #[tokio::test]
    async fn test_input_payload_compressed_before_invoke() {
        let handler = Arc::new(RecordingHandler { seen: std::sync::Mutex::new(None) });
        let mut registry = CapabilityRegistry::new();
        registry.register(CapabilityDescriptor::new("reader", ""), handler.clone());

        let resources: Vec<Value> = (0..200)
            .map(|i| {
                json!({
                    "name": format!("doc-{i}"),
                    "summary": "lecture notes ".repeat(10),
                    "relevance": i as f64 / 200.0,
                })
            })
            .collect();
        let mut plan = plan_with(vec![Task::new(
            "reader",
            json!({"topic": "rust", "resources": resources}),
        )]);

        let dispatcher =
            ParallelDispatcher::new(Arc::new(registry), Arc::new(MemorySessionStore::new()), 3, 200);
        dispatcher.dispatch(&mut plan, &CancellationToken::new()).await.unwrap();

        let seen = handler.seen.lock().unwrap().clone().expect("handler invoked");
        assert!(
            TokenEstimator::estimate_value(&seen) <= 200 || seen.get("truncated").is_some(),
            "input exceeded budget without marker"
        );
        let kept = seen["resources"].as_array().unwrap();
        assert!(!kept.is_empty());
        assert!(kept.len() < 200);
        // 高 relevance 项优先保留
        assert!(relevance_of(&kept[0]) > relevance_of(kept.last().unwrap()));
    }

    #[tokio::test]
    async fn test_transitions_persisted_to_store() {
        let mut registry = CapabilityRegistry::new();
        registry.register(
            CapabilityDescriptor::new("ok", ""),
            Arc::new(OkHandler { delay_ms: 0, calls: AtomicUsize::new(0) }),
        );

        let store = Arc::new(MemorySessionStore::new());
        let dispatcher = ParallelDispatcher::new(Arc::new(registry), store.clone(), 3, 2000);
        let mut plan = plan_with(vec![Task::new("ok", json!({}))]);
        dispatcher.dispatch(&mut plan, &CancellationToken::new()).await.unwrap();

        let stored = store.get(&task_key(&plan.id, &plan.tasks[0].id)).await.unwrap();
        assert_eq!(stored["status"], "succeeded");
        assert_eq!(stored["attempt_count"], 1);
    }
}
