//! 编排错误类型分层
//!
//! PlanningError / SynthesisError 是致命错误（终止整个 run）；TaskError 是任务级可恢复错误，
//! 在 max_attempts 内由 Dispatcher 重试，超出后任务记为 failed 并降级为 Candidate 的 gap。

use thiserror::Error;

/// 规划阶段错误：发生在任何 Task 创建之前，直接终止 run
#[derive(Error, Debug)]
pub enum PlanningError {
    #[error("Empty topic")]
    EmptyTopic,

    #[error("Analysis reasoning failed: {0}")]
    Analysis(String),

    #[error("Analysis parse error: {0}")]
    AnalysisParse(String),

    /// 注册表中没有任何 required 能力被选中（knowledge-synthesis 必须始终可用）
    #[error("No required capability selected")]
    NoRequiredCapability,

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Plan persistence failed: {0}")]
    Persist(String),
}

/// 任务级错误：区分超时 / 工具失败 / 输出不合法，均可在 max_attempts 内重试
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("Capability timeout after {0}s")]
    Timeout(u64),

    #[error("Tool failure: {0}")]
    ToolFailure(String),

    #[error("Invalid output: {0}")]
    InvalidOutput(String),
}

/// 合成阶段错误：所有任务都失败或被跳过时无法产出 Candidate
#[derive(Error, Debug)]
pub enum SynthesisError {
    #[error("No input: zero tasks succeeded")]
    NoInput,
}

/// 质量门评分错误：评分规则本身失败（未知指标等），上层转为 fail 判定并附带诊断，绝不默认 pass
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Unknown criterion: {0}")]
    UnknownCriterion(String),
}

/// 对外暴露的统一错误：调用方要么拿到 Candidate + Verdict，要么拿到结构化错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("Synthesis error: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Store error: {0}")]
    Store(String),
}
