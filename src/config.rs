//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SAGE__*` 覆盖
//! （双下划线表示嵌套，如 `SAGE__ORCHESTRATOR__RETRY_BUDGET=3`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub budget: BudgetSection,
    #[serde(default)]
    pub capabilities: CapabilitiesSection,
    #[serde(default)]
    pub llm: LlmSection,
}

/// [orchestrator] 段：质量门阈值、重试预算、计划截止与并发
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 质量门总分阈值（0-100）
    pub quality_threshold: f64,
    /// 质量门重试预算（retry 周期数上限）
    pub retry_budget: u32,
    /// 可选的计划级截止时间（秒）；未设置则不限时
    pub plan_deadline_secs: Option<u64>,
    /// Limited 并发类能力共享的许可数
    pub limited_concurrency: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            quality_threshold: 70.0,
            retry_budget: 2,
            plan_deadline_secs: None,
            limited_concurrency: 3,
        }
    }
}

/// [budget] 段：上下文预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    /// 单个任务结果进入合成前的 token 预算
    pub result_tokens: usize,
    /// 任务输入载荷进入能力前的 token 预算
    pub input_tokens: usize,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self { result_tokens: 2000, input_tokens: 2000 }
    }
}

/// [capabilities] 段：能力描述符的缺省参数（注册时可逐项覆盖）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CapabilitiesSection {
    pub default_timeout_secs: u64,
    pub default_max_attempts: u32,
}

impl Default for CapabilitiesSection {
    fn default() -> Self {
        Self { default_timeout_secs: 60, default_max_attempts: 2 }
    }
}

/// [llm] 段：规划阶段推理调用的后端选择
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：mock / openai 等；当前内置 mock，其余留给集成方
    pub provider: String,
    pub model: String,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self { provider: "mock".to_string(), model: "mock-planner".to_string() }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorSection::default(),
            budget: BudgetSection::default(),
            capabilities: CapabilitiesSection::default(),
            llm: LlmSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 SAGE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SAGE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SAGE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.orchestrator.quality_threshold, 70.0);
        assert_eq!(cfg.orchestrator.retry_budget, 2);
        assert_eq!(cfg.orchestrator.limited_concurrency, 3);
        assert_eq!(cfg.budget.result_tokens, 2000);
        assert_eq!(cfg.budget.input_tokens, 2000);
        assert_eq!(cfg.llm.provider, "mock");
    }

    #[test]
    fn test_toml_overlay() {
        let toml = r#"
            [orchestrator]
            retry_budget = 5
            plan_deadline_secs = 120

            [budget]
            result_tokens = 512
        "#;
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.orchestrator.retry_budget, 5);
        assert_eq!(cfg.orchestrator.plan_deadline_secs, Some(120));
        assert_eq!(cfg.budget.result_tokens, 512);
        // 未覆盖的键保持缺省
        assert_eq!(cfg.orchestrator.quality_threshold, 70.0);
    }

    #[test]
    fn test_load_config_reads_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("override.toml");
        std::fs::write(
            &path,
            "[orchestrator]\nretry_budget = 7\n\n[budget]\ninput_tokens = 300\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.orchestrator.retry_budget, 7);
        assert_eq!(cfg.budget.input_tokens, 300);
        // 其余键来自缺省源
        assert_eq!(cfg.orchestrator.quality_threshold, 70.0);
    }
}
