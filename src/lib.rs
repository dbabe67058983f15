//! Sage - 学习课程编排引擎
//!
//! 模块划分：
//! - **budget**: 上下文预算器（token 估算与三级压缩）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分层与编排主控状态机
//! - **dispatch**: 并行调度器（就绪集波次、超时、重试、并发类）
//! - **gate**: 质量门（确定性评分规则与改进指令）
//! - **llm**: LLM 客户端抽象（规划阶段唯一的推理调用）
//! - **plan**: Plan / Task / Candidate / Verdict 数据模型
//! - **planner**: 战略规划器（画像 + 话题 → 执行计划）
//! - **profile**: 用户画像与资源摘要
//! - **registry**: 能力注册表（描述符 + handler）
//! - **store**: 会话存储抽象与内存实现
//! - **synthesis**: 合成器（任务输出 → Candidate，确定性折叠）

pub mod budget;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod gate;
pub mod llm;
pub mod observability;
pub mod plan;
pub mod planner;
pub mod profile;
pub mod registry;
pub mod store;
pub mod synthesis;

pub use crate::core::{Orchestrator, OrchestratorError, RunOutcome};
