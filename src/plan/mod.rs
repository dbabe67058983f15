//! 计划与产物数据模型
//!
//! 定义 Plan / Task / TaskResult / Candidate / Verdict 等核心数据类型。
//! 关键不变量：
//! - Plan 一旦离开 draft 即不可变，修订通过 parent_plan_id 产生新版本；
//! - Task 状态只能沿 pending → running → {succeeded, failed} 前进，skipped 仅可由 pending 到达；
//! - TaskResult / Candidate / Verdict 创建后不再修改，新一轮尝试产生新记录。

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type PlanId = String;
pub type TaskId = String;

/// 计划状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Active,
    Completed,
    Failed,
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// 依赖失败，未曾调度
    Skipped,
}

impl TaskStatus {
    /// 是否终态（succeeded / failed / skipped 不再回退）
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped)
    }

    /// 单调前进检查：只允许 pending→running、pending→skipped、running→{succeeded, failed}
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Skipped)
                | (TaskStatus::Running, TaskStatus::Succeeded)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }
}

/// 计划数据模型错误
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid task transition: {from:?} -> {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}

/// 合并角色：Synthesizer 可解释的封闭词表（不做自由文本解析）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeRole {
    /// 奠基：建立课程骨架章节
    Foundation,
    /// 覆盖：并入已有章节或追加新章节
    #[default]
    Overlay,
    /// 补充：只为已有章节增加内容，不新建章节
    Enrichment,
}

/// 合成策略：按能力名指定合并角色；directive 为规划器产出的说明文本，仅留作审计
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SynthesisStrategy {
    pub directive: String,
    pub roles: BTreeMap<String, MergeRole>,
}

impl SynthesisStrategy {
    pub fn role_for(&self, capability: &str) -> MergeRole {
        self.roles.get(capability).copied().unwrap_or_default()
    }
}

/// 成功指标：指标名 → 阈值（0-100），可选权重（缺省等权）
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SuccessCriteria {
    pub thresholds: BTreeMap<String, f64>,
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
}

impl SuccessCriteria {
    pub fn weight_for(&self, criterion: &str) -> f64 {
        self.weights.get(criterion).copied().unwrap_or(1.0)
    }
}

/// 评分参数：由规划器从画像与分析推导，使 Quality Gate 只依赖 (candidate, plan)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RubricParams {
    /// 期望章节数（completeness 的分母）
    pub expected_sections: usize,
    /// 个性化关键词（小写）
    pub personalization_terms: Vec<String>,
    /// 可投入学时预算
    pub timeline_hours: f64,
}

/// 任务执行结果：创建后不可变，新一轮尝试产生新记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub capability: String,
    pub output: serde_json::Value,
    pub token_estimate: usize,
    /// 能力侧给出的置信度，缺省 0.5
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

/// 计划中的任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// 必须存在于 Capability Registry
    pub capability: String,
    pub input_payload: serde_json::Value,
    /// 依赖任务集合；空集 ⇒ 可立即并行调度
    #[serde(default)]
    pub dependency_set: HashSet<TaskId>,
    pub status: TaskStatus,
    /// 仅在 succeeded 时存在
    pub result: Option<TaskResult>,
    /// 仅在 failed 时存在
    pub error: Option<String>,
    pub attempt_count: u32,
}

impl Task {
    pub fn new(capability: impl Into<String>, input_payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            capability: capability.into(),
            input_payload,
            dependency_set: HashSet::new(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            attempt_count: 0,
        }
    }

    /// 单调前进，非法转移直接报错
    pub fn advance(&mut self, next: TaskStatus) -> Result<(), PlanError> {
        if !self.status.can_advance_to(next) {
            return Err(PlanError::InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        Ok(())
    }
}

/// 执行计划：规划器产出，状态只由编排状态机推进
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    /// 修订链：新版本引用上一版本，从不原地修改
    pub parent_plan_id: Option<PlanId>,
    /// 修订链根：Candidate / Verdict 以根 ID 为键跨版本累积，供审计与恢复
    pub root_plan_id: PlanId,
    pub created_at: DateTime<Utc>,
    pub status: PlanStatus,
    pub topic: String,
    /// 有序任务集：声明顺序即 Synthesizer 的消费顺序
    pub tasks: Vec<Task>,
    pub synthesis_strategy: SynthesisStrategy,
    pub success_criteria: SuccessCriteria,
    /// 0-100
    pub quality_threshold: f64,
    /// Quality Gate 的重试预算（≥ 0）
    pub retry_budget: u32,
    /// 可选的计划级截止时间（秒），超时则取消所有在途任务
    pub deadline_secs: Option<u64>,
    pub rubric: RubricParams,
    /// 终态为 failed 时记录致因
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl Plan {
    pub fn task(&self, task_id: &str) -> Result<&Task, PlanError> {
        self.tasks
            .iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| PlanError::TaskNotFound(task_id.to_string()))
    }

    pub fn task_mut(&mut self, task_id: &str) -> Result<&mut Task, PlanError> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| PlanError::TaskNotFound(task_id.to_string()))
    }

    /// 就绪集：pending 且所有依赖均 succeeded
    pub fn ready_set(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.dependency_set.iter().all(|dep| {
                    self.task(dep).map(|d| d.status == TaskStatus::Succeeded).unwrap_or(false)
                })
            })
            .map(|t| t.id.clone())
            .collect()
    }

    /// 依赖已失败或跳过、永远无法就绪的 pending 任务
    pub fn blocked_set(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.dependency_set.iter().any(|dep| {
                    self.task(dep)
                        .map(|d| matches!(d.status, TaskStatus::Failed | TaskStatus::Skipped))
                        .unwrap_or(true)
                })
            })
            .map(|t| t.id.clone())
            .collect()
    }

    /// 调度阶段是否结束：没有 pending / running 任务
    pub fn dispatch_done(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// 产生修订版本：引用本版本为 parent，重置被反馈点名的任务（按能力名），
    /// 其余任务连同结果原样保留，重试周期只为被点名的槽位付出成本
    pub fn revise(&self, redispatch_capabilities: &HashSet<String>) -> Plan {
        let mut next = self.clone();
        next.parent_plan_id = Some(self.id.clone());
        next.id = uuid::Uuid::new_v4().to_string();
        next.created_at = Utc::now();
        next.status = PlanStatus::Active;
        for task in &mut next.tasks {
            if redispatch_capabilities.contains(&task.capability) {
                task.status = TaskStatus::Pending;
                task.result = None;
                task.error = None;
                // attempt_count 跨版本保留，审计可见总尝试次数
            }
        }
        next
    }
}

/// 课程章节：slug 由标题确定性派生，是反馈定位的最小单位
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub slug: String,
    pub title: String,
    pub points: Vec<String>,
    /// 难度层级 1-3
    pub level: u8,
    pub est_hours: f64,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl Section {
    pub fn slug_of(title: &str) -> String {
        let mut slug = String::new();
        for c in title.to_lowercase().chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c);
            } else if !slug.ends_with('-') && !slug.is_empty() {
                slug.push('-');
            }
        }
        slug.trim_matches('-').to_string()
    }
}

/// 课程产物（结构化目录）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Curriculum {
    pub title: String,
    pub sections: Vec<Section>,
}

/// Candidate 元数据中记录的缺口（失败 / 跳过的任务槽位）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub task_id: TaskId,
    pub capability: String,
    pub reason: String,
}

/// 一个周期的合成产物，等待质量门判定；留存所有周期的 Candidate 供审计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// 确定性 ID：{plan_id}-c{cycle}，同输入两次合成产生同一 ID
    pub id: String,
    pub plan_id: PlanId,
    /// 从 0 开始，每次 RETRY 递增
    pub cycle_number: u32,
    pub curriculum: Curriculum,
    /// 构建所用的 TaskResult 所属任务
    pub contributing: Vec<TaskId>,
    pub gaps: Vec<Gap>,
    pub synthesis_confidence: f64,
    /// 本周期应用过的反馈指令（审计用）
    pub applied_feedback: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Candidate {
    /// 结构等同：除创建时间外逐字段相等（合成确定性检验用）
    pub fn structurally_eq(&self, other: &Candidate) -> bool {
        self.id == other.id
            && self.plan_id == other.plan_id
            && self.cycle_number == other.cycle_number
            && self.curriculum == other.curriculum
            && self.contributing == other.contributing
            && self.gaps == other.gaps
            && self.synthesis_confidence == other.synthesis_confidence
            && self.applied_feedback == other.applied_feedback
    }
}

/// 质量门判定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pass,
    Retry,
    Fail,
}

/// 改进指令：点名指标、可寻址章节与需要重跑的能力
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackDirective {
    pub criterion: String,
    /// 指向的章节 slug，None 表示整体性指令
    pub section: Option<String>,
    pub directive: String,
    /// 需要重新调度的能力名；空表示纯补丁（只重新合成）
    #[serde(default)]
    pub redispatch: Vec<String>,
}

/// 质量门对一个 Candidate 的评分结论
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub candidate_id: String,
    /// 0-100，等权（或 Plan 声明权重）加权平均
    pub overall_score: f64,
    pub scores: BTreeMap<String, f64>,
    pub decision: Decision,
    /// decision ≠ pass 时存在
    #[serde(default)]
    pub feedback: Vec<FeedbackDirective>,
    /// 评分规则失败时的诊断信息
    pub diagnostic: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_monotonic() {
        let mut task = Task::new("knowledge-synthesis", serde_json::json!({}));
        assert!(task.advance(TaskStatus::Running).is_ok());
        assert!(task.advance(TaskStatus::Succeeded).is_ok());
        // 终态不可回退
        assert!(task.advance(TaskStatus::Pending).is_err());
        assert!(task.advance(TaskStatus::Running).is_err());
    }

    #[test]
    fn test_skipped_only_from_pending() {
        let mut task = Task::new("web-research", serde_json::json!({}));
        assert!(task.status.can_advance_to(TaskStatus::Skipped));
        task.advance(TaskStatus::Running).unwrap();
        assert!(!task.status.can_advance_to(TaskStatus::Skipped));
    }

    #[test]
    fn test_ready_set_respects_dependencies() {
        let a = Task::new("a", serde_json::json!({}));
        let mut b = Task::new("b", serde_json::json!({}));
        b.dependency_set.insert(a.id.clone());
        let a_id = a.id.clone();
        let b_id = b.id.clone();

        let mut plan = sample_plan(vec![a, b]);
        assert_eq!(plan.ready_set(), vec![a_id.clone()]);

        plan.task_mut(&a_id).unwrap().advance(TaskStatus::Running).unwrap();
        plan.task_mut(&a_id).unwrap().advance(TaskStatus::Succeeded).unwrap();
        assert_eq!(plan.ready_set(), vec![b_id]);
    }

    #[test]
    fn test_blocked_set_on_failed_dependency() {
        let mut a = Task::new("a", serde_json::json!({}));
        a.status = TaskStatus::Failed;
        let mut b = Task::new("b", serde_json::json!({}));
        b.dependency_set.insert(a.id.clone());
        let b_id = b.id.clone();

        let plan = sample_plan(vec![a, b]);
        assert!(plan.ready_set().is_empty());
        assert_eq!(plan.blocked_set(), vec![b_id]);
    }

    #[test]
    fn test_revise_resets_only_flagged_capabilities() {
        let mut a = Task::new("keep", serde_json::json!({}));
        a.status = TaskStatus::Succeeded;
        a.result = Some(TaskResult {
            capability: "keep".into(),
            output: serde_json::json!({"summary": "x"}),
            token_estimate: 3,
            confidence: 0.9,
            created_at: Utc::now(),
        });
        let mut b = Task::new("redo", serde_json::json!({}));
        b.status = TaskStatus::Succeeded;
        b.attempt_count = 1;

        let plan = sample_plan(vec![a, b]);
        let flagged: HashSet<String> = ["redo".to_string()].into_iter().collect();
        let revised = plan.revise(&flagged);

        assert_eq!(revised.parent_plan_id.as_deref(), Some(plan.id.as_str()));
        assert_ne!(revised.id, plan.id);
        assert_eq!(revised.tasks[0].status, TaskStatus::Succeeded);
        assert!(revised.tasks[0].result.is_some());
        assert_eq!(revised.tasks[1].status, TaskStatus::Pending);
        assert!(revised.tasks[1].result.is_none());
        assert_eq!(revised.tasks[1].attempt_count, 1);
    }

    #[test]
    fn test_section_slug_derivation() {
        assert_eq!(Section::slug_of("AI/ML Fundamentals"), "ai-ml-fundamentals");
        assert_eq!(Section::slug_of("  Prompt  Engineering "), "prompt-engineering");
    }

    fn sample_plan(tasks: Vec<Task>) -> Plan {
        let id = uuid::Uuid::new_v4().to_string();
        Plan {
            root_plan_id: id.clone(),
            id,
            parent_plan_id: None,
            created_at: Utc::now(),
            status: PlanStatus::Active,
            topic: "test".into(),
            tasks,
            synthesis_strategy: SynthesisStrategy::default(),
            success_criteria: SuccessCriteria::default(),
            quality_threshold: 70.0,
            retry_budget: 2,
            deadline_secs: None,
            rubric: RubricParams::default(),
            failure_reason: None,
        }
    }
}
