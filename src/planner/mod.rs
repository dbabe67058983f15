//! 战略规划器
//!
//! plan(persona, topic, resources, registry) → Plan：
//! 1. 一次推理调用产出结构化分析记录（背景 / 约束 / 缺口），核心不再细分；
//! 2. 按适用性谓词选择激活的能力，required 能力无条件激活；
//! 3. 每个被选能力生成一个 Task，独立任务依赖集为空以最大化并行；
//! 4. 附上合成策略、成功指标、质量阈值与重试预算；
//! 5. 返回前以 status=active 持久化，规划失败时不会留下 active 的半成品 Plan。

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::core::error::PlanningError;
use crate::llm::{LlmClient, Message};
use crate::plan::{
    Plan, PlanStatus, RubricParams, SuccessCriteria, SynthesisStrategy, Task,
};
use crate::profile::{ResourceSummary, UserPersona};
use crate::registry::{Applicability, CapabilityRegistry};
use crate::store::{plan_key, task_key, SessionStore};

/// 分析提示词模板：要求只返回 JSON
const ANALYSIS_PROMPT: &str = r#"Analyze this learning request and return ONLY a JSON object:
{"background": "...", "constraints": ["..."], "gaps": ["..."], "complexity": "beginner|intermediate|advanced", "needs_freshness": true|false}

Topic: {topic}
Goal: {goal}
Timeline: {timeline}
Known expertise: {expertise}
Declared knowledge gaps: {gaps}
Uploaded resources: {resources}"#;

/// 结构化分析记录：单次推理调用的产出
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AnalysisRecord {
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub gaps: Vec<String>,
    #[serde(default)]
    pub complexity: String,
    /// 话题是否需要时效性调研（驱动 RequiresFreshness 谓词）
    #[serde(default)]
    pub needs_freshness: bool,
}

/// 规划默认参数（来自配置）
#[derive(Debug, Clone)]
pub struct PlannerDefaults {
    pub quality_threshold: f64,
    pub retry_budget: u32,
    pub deadline_secs: Option<u64>,
}

impl Default for PlannerDefaults {
    fn default() -> Self {
        Self { quality_threshold: 70.0, retry_budget: 2, deadline_secs: None }
    }
}

/// 从 LLM 输出中提取 JSON 块（```json ... ``` 或首尾大括号之间）
fn extract_json(output: &str) -> &str {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return rest.find("```").map(|end| rest[..end].trim()).unwrap_or_else(|| rest.trim());
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return &trimmed[start..=end];
        }
    }
    trimmed
}

/// 战略规划器：持有 LLM 与存储，从画像 + 话题 + 资源摘要产出执行计划
pub struct StrategicPlanner {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn SessionStore>,
    defaults: PlannerDefaults,
}

impl StrategicPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<dyn SessionStore>, defaults: PlannerDefaults) -> Self {
        Self { llm, store, defaults }
    }

    pub async fn plan(
        &self,
        persona: &UserPersona,
        topic: &str,
        resources: &[ResourceSummary],
        registry: &CapabilityRegistry,
    ) -> Result<Plan, PlanningError> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(PlanningError::EmptyTopic);
        }
        if !registry.has_required() {
            return Err(PlanningError::NoRequiredCapability);
        }

        let analysis = self.analyze(persona, topic, resources).await?;
        tracing::info!(
            complexity = %analysis.complexity,
            gaps = analysis.gaps.len(),
            needs_freshness = analysis.needs_freshness,
            "Analysis record derived"
        );

        let has_resources = !resources.is_empty();
        let mut tasks = Vec::new();
        let mut roles = std::collections::BTreeMap::new();
        for descriptor in registry.descriptors() {
            let selected = descriptor.required
                || descriptor.applicability.applies(has_resources, analysis.needs_freshness);
            if !selected {
                tracing::debug!(capability = %descriptor.name, "Capability not activated");
                continue;
            }
            let payload = task_payload(descriptor.applicability, persona, topic, resources, &analysis);
            tasks.push(Task::new(descriptor.name.clone(), payload));
            roles.insert(descriptor.name.clone(), descriptor.merge_role);
        }

        let mut thresholds = std::collections::BTreeMap::new();
        for criterion in ["completeness", "personalization", "progression", "feasibility"] {
            thresholds.insert(criterion.to_string(), self.defaults.quality_threshold);
        }

        let mut terms = persona.personalization_terms();
        terms.push(topic.to_lowercase());

        let plan_id = uuid::Uuid::new_v4().to_string();
        let plan = Plan {
            root_plan_id: plan_id.clone(),
            id: plan_id,
            parent_plan_id: None,
            created_at: Utc::now(),
            status: PlanStatus::Active,
            topic: topic.to_string(),
            tasks,
            synthesis_strategy: SynthesisStrategy {
                directive: format!(
                    "Build a {} curriculum around gaps: {}",
                    if analysis.complexity.is_empty() { "balanced" } else { analysis.complexity.as_str() },
                    analysis.gaps.join(", ")
                ),
                roles,
            },
            success_criteria: SuccessCriteria { thresholds, weights: Default::default() },
            quality_threshold: self.defaults.quality_threshold,
            retry_budget: self.defaults.retry_budget,
            deadline_secs: self.defaults.deadline_secs,
            rubric: RubricParams {
                expected_sections: analysis.gaps.len().max(4),
                personalization_terms: terms,
                timeline_hours: persona.timeline_hours(),
            },
            failure_reason: None,
        };

        self.persist(&plan).await?;
        tracing::info!(plan_id = %plan.id, tasks = plan.tasks.len(), "Plan persisted as active");
        Ok(plan)
    }

    async fn analyze(
        &self,
        persona: &UserPersona,
        topic: &str,
        resources: &[ResourceSummary],
    ) -> Result<AnalysisRecord, PlanningError> {
        let expertise = persona
            .expertise
            .iter()
            .map(|s| format!("{} ({})", s.domain, s.level))
            .collect::<Vec<_>>()
            .join(", ");
        let resource_names = resources.iter().map(|r| r.name.as_str()).collect::<Vec<_>>().join(", ");

        let prompt = ANALYSIS_PROMPT
            .replace("{topic}", topic)
            .replace("{goal}", persona.goal_or_default())
            .replace("{timeline}", persona.timeline_or_default())
            .replace("{expertise}", if expertise.is_empty() { "none" } else { expertise.as_str() })
            .replace("{gaps}", &persona.knowledge_gaps.join(", "))
            .replace("{resources}", if resource_names.is_empty() { "none" } else { resource_names.as_str() });

        let messages = vec![
            Message::system("You are a strategic curriculum planner. Respond with JSON only."),
            Message::user(prompt),
        ];
        let output = self.llm.complete(&messages).await.map_err(PlanningError::Analysis)?;
        serde_json::from_str(extract_json(&output))
            .map_err(|e| PlanningError::AnalysisParse(format!("{}: {}", e, output)))
    }

    async fn persist(&self, plan: &Plan) -> Result<(), PlanningError> {
        let record = serde_json::to_value(plan).map_err(|e| PlanningError::Persist(e.to_string()))?;
        self.store
            .put(&plan_key(&plan.id), record, None)
            .await
            .map_err(|e| PlanningError::Persist(e.to_string()))?;
        for task in &plan.tasks {
            let record = serde_json::to_value(task).map_err(|e| PlanningError::Persist(e.to_string()))?;
            self.store
                .put(&task_key(&plan.id, &task.id), record, None)
                .await
                .map_err(|e| PlanningError::Persist(e.to_string()))?;
        }
        Ok(())
    }
}

/// 能力专属载荷：通用字段 + 按谓词追加的定制字段
fn task_payload(
    applicability: Applicability,
    persona: &UserPersona,
    topic: &str,
    resources: &[ResourceSummary],
    analysis: &AnalysisRecord,
) -> serde_json::Value {
    let mut payload = json!({
        "topic": topic,
        "goal": persona.goal_or_default(),
        "timeline": persona.timeline_or_default(),
        "background": analysis.background,
        "focus": analysis.gaps,
        "constraints": analysis.constraints,
    });
    let obj = payload.as_object_mut().expect("payload is an object");
    match applicability {
        Applicability::RequiresResources => {
            obj.insert("resources".into(), serde_json::to_value(resources).unwrap_or_default());
        }
        Applicability::RequiresFreshness => {
            obj.insert("time_range".into(), json!("post_2023"));
        }
        Applicability::Always => {}
    }
    payload
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::llm::MockLlmClient;
    use crate::plan::MergeRole;
    use crate::registry::{CapabilityDescriptor, CapabilityHandler};
    use crate::store::MemorySessionStore;

    struct NoopHandler;

    #[async_trait::async_trait]
    impl CapabilityHandler for NoopHandler {
        async fn invoke(&self, _payload: &serde_json::Value) -> Result<serde_json::Value, crate::core::error::TaskError> {
            Ok(json!({}))
        }
    }

    fn test_registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        let mut synth = CapabilityDescriptor::new("knowledge-synthesis", "库内知识合成");
        synth.required = true;
        synth.merge_role = MergeRole::Foundation;
        registry.register(synth, Arc::new(NoopHandler));

        let mut research = CapabilityDescriptor::new("intelligence-gathering", "时效性网络调研");
        research.applicability = Applicability::RequiresFreshness;
        registry.register(research, Arc::new(NoopHandler));

        let mut integrate = CapabilityDescriptor::new("resource-integration", "用户资料整合");
        integrate.applicability = Applicability::RequiresResources;
        integrate.merge_role = MergeRole::Enrichment;
        registry.register(integrate, Arc::new(NoopHandler));
        registry
    }

    fn planner(llm: MockLlmClient) -> StrategicPlanner {
        StrategicPlanner::new(
            Arc::new(llm),
            Arc::new(MemorySessionStore::new()),
            PlannerDefaults::default(),
        )
    }

    #[tokio::test]
    async fn test_empty_topic_rejected() {
        let p = planner(MockLlmClient::new());
        let err = p
            .plan(&UserPersona::default(), "  ", &[], &test_registry())
            .await
            .unwrap_err();
        assert!(matches!(err, PlanningError::EmptyTopic));
    }

    #[tokio::test]
    async fn test_no_required_capability_is_hard_error() {
        let mut registry = CapabilityRegistry::new();
        registry.register(CapabilityDescriptor::new("optional", ""), Arc::new(NoopHandler));
        let p = planner(MockLlmClient::new());
        let err = p.plan(&UserPersona::default(), "rust", &[], &registry).await.unwrap_err();
        assert!(matches!(err, PlanningError::NoRequiredCapability));
    }

    #[tokio::test]
    async fn test_selection_follows_predicates() {
        // Mock 默认分析 needs_freshness=true，无上传资源
        let p = planner(MockLlmClient::new());
        let plan = p.plan(&UserPersona::default(), "AI product management", &[], &test_registry()).await.unwrap();

        let capabilities: Vec<_> = plan.tasks.iter().map(|t| t.capability.as_str()).collect();
        assert!(capabilities.contains(&"knowledge-synthesis"));
        assert!(capabilities.contains(&"intelligence-gathering"));
        assert!(!capabilities.contains(&"resource-integration"));
        // 独立任务依赖集为空
        assert!(plan.tasks.iter().all(|t| t.dependency_set.is_empty()));
    }

    #[tokio::test]
    async fn test_resources_activate_integration() {
        let p = planner(MockLlmClient::new());
        let resources = vec![ResourceSummary {
            name: "uploaded-notes.pdf".into(),
            summary: "lecture notes".into(),
            relevance: 0.8,
        }];
        let plan = p.plan(&UserPersona::default(), "rust", &resources, &test_registry()).await.unwrap();
        let integration = plan.tasks.iter().find(|t| t.capability == "resource-integration").unwrap();
        assert!(integration.input_payload.get("resources").is_some());
    }

    #[tokio::test]
    async fn test_analysis_parse_failure_aborts() {
        let p = planner(MockLlmClient::with_response("not json at all"));
        let err = p.plan(&UserPersona::default(), "rust", &[], &test_registry()).await.unwrap_err();
        assert!(matches!(err, PlanningError::AnalysisParse(_)));
    }

    #[tokio::test]
    async fn test_plan_persisted_active() {
        let store = Arc::new(MemorySessionStore::new());
        let p = StrategicPlanner::new(
            Arc::new(MockLlmClient::new()),
            store.clone(),
            PlannerDefaults::default(),
        );
        let plan = p.plan(&UserPersona::default(), "rust", &[], &test_registry()).await.unwrap();

        let stored = store.get(&plan_key(&plan.id)).await.unwrap();
        assert_eq!(stored["status"], "active");
        assert_eq!(plan.quality_threshold, 70.0);
        assert_eq!(plan.retry_budget, 2);
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json("prefix {\"a\":1} suffix"), "{\"a\":1}");
    }
}
