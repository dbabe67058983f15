//! 编排器：run 级主控状态机
//!
//! 驱动 plan → dispatch → 压缩 → synthesize → gate 的完整周期，
//! 按质量门判定决定 pass（完成）/ retry（修订计划重入）/ fail（预算耗尽终止）。
//! 每次计划 / Candidate / Verdict 状态转移先写入会话存储再推进，
//! 因此中断后可通过 resume(plan_id) 从最后持久化的周期继续。
//! Candidate / Verdict 以修订链根 ID 为键累积，跨计划版本保持审计轨迹连续。

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::budget::ContextBudgeter;
use crate::config::AppConfig;
use crate::core::error::OrchestratorError;
use crate::dispatch::ParallelDispatcher;
use crate::gate::QualityGate;
use crate::llm::LlmClient;
use crate::plan::{Candidate, Decision, FeedbackDirective, Plan, PlanStatus, Verdict};
use crate::planner::{PlannerDefaults, StrategicPlanner};
use crate::profile::{ResourceSummary, UserPersona};
use crate::registry::CapabilityRegistry;
use crate::store::{candidate_key, plan_key, verdict_key, SessionStore};
use crate::synthesis::Synthesizer;

/// 一次 run 的终局：终态计划 + 最终 Candidate 与 Verdict。
/// 质量门 fail 也是正常终局（调用方拿到 fail 判定与诊断），不是错误。
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub plan: Plan,
    pub candidate: Candidate,
    pub verdict: Verdict,
}

/// 编排器：组合规划器、调度器、合成器与质量门
pub struct Orchestrator {
    planner: StrategicPlanner,
    dispatcher: ParallelDispatcher,
    synthesizer: Synthesizer,
    gate: QualityGate,
    store: Arc<dyn SessionStore>,
    registry: Arc<CapabilityRegistry>,
    /// 单个任务结果进入合成前的 token 预算
    result_budget: usize,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        registry: Arc<CapabilityRegistry>,
        store: Arc<dyn SessionStore>,
        cfg: &AppConfig,
    ) -> Self {
        let defaults = PlannerDefaults {
            quality_threshold: cfg.orchestrator.quality_threshold,
            retry_budget: cfg.orchestrator.retry_budget,
            deadline_secs: cfg.orchestrator.plan_deadline_secs,
        };
        Self {
            planner: StrategicPlanner::new(llm, store.clone(), defaults),
            dispatcher: ParallelDispatcher::new(
                registry.clone(),
                store.clone(),
                cfg.orchestrator.limited_concurrency,
                cfg.budget.input_tokens,
            ),
            synthesizer: Synthesizer::new(),
            gate: QualityGate::new(),
            store,
            registry,
            result_budget: cfg.budget.result_tokens,
        }
    }

    /// 从画像 + 话题 + 资源摘要跑完整个 run
    pub async fn run(
        &self,
        persona: &UserPersona,
        topic: &str,
        resources: &[ResourceSummary],
    ) -> Result<RunOutcome, OrchestratorError> {
        let plan = self.planner.plan(persona, topic, resources, &self.registry).await?;
        self.drive(plan, 0, None, Vec::new()).await
    }

    /// 恢复一个中断的 run：从存储加载计划，回放已持久化的周期后继续驱动。
    /// 最后一个周期若已有终局判定（pass / fail），直接返回该终局。
    pub async fn resume(&self, plan_id: &str) -> Result<RunOutcome, OrchestratorError> {
        let raw = self
            .store
            .get(&plan_key(plan_id))
            .await
            .ok_or_else(|| OrchestratorError::PlanNotFound(plan_id.to_string()))?;
        let plan: Plan =
            serde_json::from_value(raw).map_err(|e| OrchestratorError::Store(e.to_string()))?;

        let mut cycle: u32 = 0;
        let mut prior: Option<Candidate> = None;
        let mut feedback: Vec<FeedbackDirective> = Vec::new();
        loop {
            let Some(raw) = self.store.get(&candidate_key(&plan.root_plan_id, cycle)).await else {
                break;
            };
            let candidate: Candidate = serde_json::from_value(raw)
                .map_err(|e| OrchestratorError::Store(e.to_string()))?;
            let Some(raw) = self.store.get(&verdict_key(&plan.root_plan_id, cycle)).await else {
                // Candidate 已落盘但判定尚未发生：从本周期的判定重新开始
                prior = Some(candidate);
                break;
            };
            let verdict: Verdict = serde_json::from_value(raw)
                .map_err(|e| OrchestratorError::Store(e.to_string()))?;
            match verdict.decision {
                Decision::Pass | Decision::Fail => {
                    tracing::info!(plan_id = %plan.id, cycle, "Resume found terminal verdict");
                    return Ok(RunOutcome { plan, candidate, verdict });
                }
                Decision::Retry => {
                    feedback = verdict.feedback.clone();
                    prior = Some(candidate);
                    cycle += 1;
                }
            }
        }

        tracing::info!(plan_id = %plan.id, cycle, "Resuming run");
        self.drive(plan, cycle, prior, feedback).await
    }

    /// 主循环：每个周期 = 调度 + 压缩 + 合成 + 质量门判定
    async fn drive(
        &self,
        mut plan: Plan,
        mut cycle: u32,
        mut prior: Option<Candidate>,
        mut feedback: Vec<FeedbackDirective>,
    ) -> Result<RunOutcome, OrchestratorError> {
        loop {
            // 计划级截止：看门狗到点后取消令牌，在途任务按超时失败、剩余 pending 跳过
            let cancel = CancellationToken::new();
            let watchdog = plan.deadline_secs.map(|secs| {
                let token = cancel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    token.cancel();
                })
            });

            let report = self
                .dispatcher
                .dispatch(&mut plan, &cancel)
                .await
                .map_err(|e| OrchestratorError::Store(e.to_string()))?;
            if let Some(handle) = watchdog {
                handle.abort();
            }
            self.persist_plan(&plan).await?;
            tracing::info!(
                plan_id = %plan.id,
                cycle,
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                "Dispatch phase finished"
            );

            // 每个成功结果先过预算器，合成只见压缩后的载荷
            let mut inputs = BTreeMap::new();
            for task in &plan.tasks {
                let Some(result) = &task.result else { continue };
                let key_fields = self
                    .registry
                    .descriptor(&task.capability)
                    .map(|d| d.key_fields.clone())
                    .unwrap_or_default();
                let compressed =
                    ContextBudgeter::compress(&result.output, self.result_budget, &key_fields);
                if compressed.truncated {
                    tracing::debug!(
                        task_id = %task.id,
                        capability = %task.capability,
                        tokens = compressed.token_estimate,
                        "Result hard-truncated to fit budget"
                    );
                }
                inputs.insert(task.id.clone(), compressed.value);
            }

            let candidate = match self.synthesizer.synthesize(
                &plan,
                &inputs,
                cycle,
                prior.as_ref(),
                &feedback,
            ) {
                Ok(candidate) => candidate,
                Err(e) => {
                    plan.status = PlanStatus::Failed;
                    plan.failure_reason = Some(e.to_string());
                    self.persist_plan(&plan).await?;
                    tracing::error!(plan_id = %plan.id, cycle, error = %e, "Synthesis failed, run aborted");
                    return Err(e.into());
                }
            };
            self.persist(&candidate_key(&plan.root_plan_id, cycle), &candidate).await?;

            let verdict = self.gate.evaluate(&candidate, &plan);
            self.persist(&verdict_key(&plan.root_plan_id, cycle), &verdict).await?;
            tracing::info!(
                plan_id = %plan.id,
                cycle,
                score = verdict.overall_score,
                decision = ?verdict.decision,
                "Quality gate verdict"
            );

            match verdict.decision {
                Decision::Pass => {
                    plan.status = PlanStatus::Completed;
                    self.persist_plan(&plan).await?;
                    return Ok(RunOutcome { plan, candidate, verdict });
                }
                Decision::Fail => {
                    plan.status = PlanStatus::Failed;
                    plan.failure_reason = Some(match &verdict.diagnostic {
                        Some(diag) => diag.clone(),
                        None => format!(
                            "quality gate fail at cycle {} (score {:.1})",
                            cycle, verdict.overall_score
                        ),
                    });
                    self.persist_plan(&plan).await?;
                    return Ok(RunOutcome { plan, candidate, verdict });
                }
                Decision::Retry => {
                    let flagged: HashSet<String> = verdict
                        .feedback
                        .iter()
                        .flat_map(|f| f.redispatch.iter().cloned())
                        .collect();
                    feedback = verdict.feedback.clone();
                    prior = Some(candidate);
                    cycle += 1;
                    if flagged.is_empty() {
                        // 纯补丁反馈：无任务可重跑，直接带指令重新合成
                        tracing::info!(plan_id = %plan.id, cycle, "Retry with patch-only feedback");
                    } else {
                        plan = plan.revise(&flagged);
                        self.persist_plan(&plan).await?;
                        tracing::info!(
                            plan_id = %plan.id,
                            parent = ?plan.parent_plan_id,
                            cycle,
                            redispatch = flagged.len(),
                            "Plan revised for retry cycle"
                        );
                    }
                }
            }
        }
    }

    async fn persist_plan(&self, plan: &Plan) -> Result<(), OrchestratorError> {
        self.persist(&plan_key(&plan.id), plan).await?;
        // 根键始终指向修订链的最新版本，resume 只需根 ID
        if plan.id != plan.root_plan_id {
            self.persist(&plan_key(&plan.root_plan_id), plan).await?;
        }
        Ok(())
    }

    async fn persist<T: serde::Serialize>(
        &self,
        key: &str,
        record: &T,
    ) -> Result<(), OrchestratorError> {
        let value =
            serde_json::to_value(record).map_err(|e| OrchestratorError::Store(e.to_string()))?;
        self.store
            .put(key, value, None)
            .await
            .map_err(|e| OrchestratorError::Store(e.to_string()))
    }
}
