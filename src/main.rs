//! 演示入口：内置三个模拟能力，从示例画像跑一次完整 run 并打印课程目录

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use sage::config::{load_config, AppConfig, CapabilitiesSection};
use sage::core::TaskError;
use sage::llm::MockLlmClient;
use sage::plan::{Decision, MergeRole};
use sage::profile::{ResourceSummary, SkillLevel, UserPersona};
use sage::registry::{
    Applicability, CapabilityDescriptor, CapabilityHandler, CapabilityRegistry, ConcurrencyClass,
};
use sage::store::MemorySessionStore;
use sage::{observability, Orchestrator};

/// 知识合成：奠基能力，给出课程骨架章节
struct KnowledgeSynthesis;

#[async_trait]
impl CapabilityHandler for KnowledgeSynthesis {
    async fn invoke(&self, payload: &Value) -> Result<Value, TaskError> {
        let topic = payload.get("topic").and_then(|v| v.as_str()).unwrap_or("the topic");
        Ok(json!({
            "summary": format!("Core concepts of {}", topic),
            "confidence": 0.85,
            "sections": [
                {
                    "title": format!("{} fundamentals", topic),
                    "points": ["Key definitions and terminology", "Mental model of the field"],
                    "level": 1,
                    "est_hours": 4.0
                },
                {
                    "title": format!("Applying {}", topic),
                    "points": ["Worked examples", "Common pitfalls"],
                    "level": 2,
                    "est_hours": 6.0
                },
                {
                    "title": "Evaluation methods and practice",
                    "points": ["Self-assessment exercises", "Capstone project outline"],
                    "level": 3,
                    "est_hours": 6.0
                }
            ]
        }))
    }
}

/// 情报收集：时效性素材，覆盖到已有章节或追加新章节
struct IntelligenceGathering;

#[async_trait]
impl CapabilityHandler for IntelligenceGathering {
    async fn invoke(&self, payload: &Value) -> Result<Value, TaskError> {
        let topic = payload.get("topic").and_then(|v| v.as_str()).unwrap_or("the topic");
        Ok(json!({
            "summary": format!("Recent developments in {}", topic),
            "confidence": 0.7,
            "sections": [
                {
                    "title": format!("{} fundamentals", topic),
                    "points": ["Recent survey papers and terminology shifts"],
                    "level": 1,
                    "est_hours": 1.0,
                    "sources": ["arxiv.org"]
                },
                {
                    "title": "Current landscape",
                    "points": ["Notable releases since 2023", "Active research directions"],
                    "level": 2,
                    "est_hours": 3.0,
                    "sources": ["news.ycombinator.com"]
                }
            ]
        }))
    }
}

/// 资源整合：只充实已有章节，从不新建
struct ResourceIntegration;

#[async_trait]
impl CapabilityHandler for ResourceIntegration {
    async fn invoke(&self, payload: &Value) -> Result<Value, TaskError> {
        let topic = payload.get("topic").and_then(|v| v.as_str()).unwrap_or("the topic");
        let resources = payload
            .get("resources")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|r| r.get("name").and_then(|n| n.as_str()).map(str::to_string))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(json!({
            "summary": format!("User-provided materials mapped onto {}", topic),
            "confidence": 0.9,
            "sections": [
                {
                    "title": format!("{} fundamentals", topic),
                    "points": ["Cross-references into provided materials"],
                    "level": 1,
                    "est_hours": 0.0,
                    "sources": resources
                }
            ]
        }))
    }
}

/// 注册内置能力三件套，超时 / 重试缺省取自配置
fn build_registry(caps: &CapabilitiesSection) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();

    let mut knowledge = CapabilityDescriptor::new(
        "knowledge-synthesis",
        "Derive the curriculum skeleton from established knowledge",
    );
    knowledge.required = true;
    knowledge.merge_role = MergeRole::Foundation;
    knowledge.timeout_secs = caps.default_timeout_secs;
    knowledge.max_attempts = caps.default_max_attempts;
    registry.register(knowledge, Arc::new(KnowledgeSynthesis));

    let mut intelligence = CapabilityDescriptor::new(
        "intelligence-gathering",
        "Collect recent developments when the topic needs freshness",
    );
    intelligence.applicability = Applicability::RequiresFreshness;
    intelligence.merge_role = MergeRole::Overlay;
    intelligence.concurrency = ConcurrencyClass::Limited;
    intelligence.timeout_secs = caps.default_timeout_secs;
    intelligence.max_attempts = caps.default_max_attempts;
    registry.register(intelligence, Arc::new(IntelligenceGathering));

    let mut integration = CapabilityDescriptor::new(
        "resource-integration",
        "Weave user-provided materials into existing sections",
    );
    integration.applicability = Applicability::RequiresResources;
    integration.merge_role = MergeRole::Enrichment;
    integration.input_schema = serde_json::to_value(schemars::schema_for!(ResourceSummary))
        .unwrap_or_else(|_| json!({ "type": "object" }));
    integration.timeout_secs = caps.default_timeout_secs;
    integration.max_attempts = caps.default_max_attempts;
    registry.register(integration, Arc::new(ResourceIntegration));

    registry
}

fn sample_persona() -> UserPersona {
    UserPersona {
        user_id: "demo-user".to_string(),
        goal: Some("Become productive with large language models at work".to_string()),
        timeline: Some("1 month".to_string()),
        learning_preferences: vec!["hands-on".to_string(), "project-based".to_string()],
        expertise: vec![
            SkillLevel { domain: "python".to_string(), level: "intermediate".to_string(), confidence: 8 },
            SkillLevel { domain: "machine learning".to_string(), level: "beginner".to_string(), confidence: 4 },
        ],
        knowledge_gaps: vec!["transformers".to_string(), "prompt engineering".to_string()],
        study_summary: String::new(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let registry = Arc::new(build_registry(&cfg.capabilities));
    let store = Arc::new(MemorySessionStore::new());
    let llm = Arc::new(MockLlmClient::new());
    let orchestrator = Orchestrator::new(llm, registry, store, &cfg);

    let persona = sample_persona();
    let resources = vec![ResourceSummary {
        name: "Attention Is All You Need".to_string(),
        summary: "The original transformer architecture paper".to_string(),
        relevance: 0.9,
    }];

    let outcome = orchestrator
        .run(&persona, "large language models", &resources)
        .await?;

    println!("plan {} -> {:?}", outcome.plan.id, outcome.plan.status);
    println!(
        "verdict: {:?} (score {:.1}) after cycle {}",
        outcome.verdict.decision, outcome.verdict.overall_score, outcome.candidate.cycle_number
    );
    if outcome.verdict.decision != Decision::Pass {
        for directive in &outcome.verdict.feedback {
            println!("  feedback [{}]: {}", directive.criterion, directive.directive);
        }
    }
    println!("\n{}", outcome.candidate.curriculum.title);
    for section in &outcome.candidate.curriculum.sections {
        println!(
            "  [L{}] {} ({:.1}h)",
            section.level, section.title, section.est_hours
        );
        for point in &section.points {
            println!("      - {}", point);
        }
    }
    for gap in &outcome.candidate.gaps {
        println!("  gap: {} ({})", gap.capability, gap.reason);
    }

    Ok(())
}
