//! 能力注册表
//!
//! 能力 = 有名字、有输入/输出 schema 的工作单元（知识合成、网络调研等）。
//! 描述符在加载期一次性注册（静态配置），规划器据此做激活决策，
//! 调度器按名查找 CapabilityHandler 并施加超时，对核心而言每个能力的内部推理完全不透明。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::TaskError;
use crate::plan::MergeRole;

/// 并发类别：调度器据此限制同类能力的并行外部调用数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyClass {
    /// 串行（同类同时最多 1 个在途调用）
    Exclusive,
    /// 受限并行（共享一个许可池）
    Limited,
    /// 不限
    #[default]
    Unbounded,
}

/// 适用性谓词：对分析记录求值，决定能力是否激活（required 能力无条件激活）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Applicability {
    #[default]
    Always,
    /// 仅当用户上传了资源
    RequiresResources,
    /// 仅当分析判断话题需要时效性信息
    RequiresFreshness,
}

impl Applicability {
    pub fn applies(&self, has_resources: bool, needs_freshness: bool) -> bool {
        match self {
            Applicability::Always => true,
            Applicability::RequiresResources => has_resources,
            Applicability::RequiresFreshness => needs_freshness,
        }
    }
}

/// 能力描述符：名称、schema、激活谓词、重试与超时参数、合并角色
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: String,
    /// 输入/输出 JSON Schema（schemars 生成或手写），核心只校验输出为对象
    pub input_schema: Value,
    pub output_schema: Value,
    #[serde(default)]
    pub applicability: Applicability,
    /// required 能力始终被选中；一个注册表至少应有一个（知识合成）
    #[serde(default)]
    pub required: bool,
    pub max_attempts: u32,
    pub timeout_secs: u64,
    #[serde(default)]
    pub concurrency: ConcurrencyClass,
    /// 压缩时保留的关键洞察字段
    #[serde(default)]
    pub key_fields: Vec<String>,
    #[serde(default)]
    pub merge_role: MergeRole,
}

impl CapabilityDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({ "type": "object" }),
            output_schema: serde_json::json!({ "type": "object" }),
            applicability: Applicability::Always,
            required: false,
            max_attempts: 2,
            timeout_secs: 60,
            concurrency: ConcurrencyClass::Unbounded,
            key_fields: vec!["summary".to_string(), "sections".to_string()],
            merge_role: MergeRole::Overlay,
        }
    }
}

/// 能力调用边界：invoke(payload) → 输出 JSON 或 TaskError
/// 超时由调度器统一施加，实现方只需区分 ToolFailure / InvalidOutput
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn invoke(&self, payload: &Value) -> Result<Value, TaskError>;
}

/// 注册表：按名存储描述符与 handler，加载期注册一次，之后只读
#[derive(Default)]
pub struct CapabilityRegistry {
    /// 保持注册顺序，规划器按此顺序生成任务
    descriptors: Vec<CapabilityDescriptor>,
    handlers: HashMap<String, Arc<dyn CapabilityHandler>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: CapabilityDescriptor, handler: Arc<dyn CapabilityHandler>) {
        self.handlers.insert(descriptor.name.clone(), handler);
        self.descriptors.retain(|d| d.name != descriptor.name);
        self.descriptors.push(descriptor);
    }

    pub fn descriptor(&self, name: &str) -> Option<&CapabilityDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn CapabilityHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn descriptors(&self) -> &[CapabilityDescriptor] {
        &self.descriptors
    }

    pub fn has_required(&self) -> bool {
        self.descriptors.iter().any(|d| d.required)
    }

    /// 校验输出符合声明的调用契约：必须是 JSON 对象
    pub fn validate_output(descriptor: &CapabilityDescriptor, output: &Value) -> Result<(), TaskError> {
        if !output.is_object() {
            return Err(TaskError::InvalidOutput(format!(
                "{}: expected JSON object, got {}",
                descriptor.name,
                type_name(output)
            )));
        }
        Ok(())
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl CapabilityHandler for NoopHandler {
        async fn invoke(&self, _payload: &Value) -> Result<Value, TaskError> {
            Ok(serde_json::json!({}))
        }
    }

    #[test]
    fn test_applicability_predicates() {
        assert!(Applicability::Always.applies(false, false));
        assert!(Applicability::RequiresResources.applies(true, false));
        assert!(!Applicability::RequiresResources.applies(false, true));
        assert!(Applicability::RequiresFreshness.applies(false, true));
        assert!(!Applicability::RequiresFreshness.applies(true, false));
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = CapabilityRegistry::new();
        let mut desc = CapabilityDescriptor::new("knowledge-synthesis", "库内知识合成");
        desc.required = true;
        registry.register(desc, Arc::new(NoopHandler));

        assert!(registry.has_required());
        assert!(registry.descriptor("knowledge-synthesis").is_some());
        assert!(registry.handler("knowledge-synthesis").is_some());
        assert!(registry.descriptor("unknown").is_none());
    }

    #[test]
    fn test_validate_output_rejects_non_object() {
        let desc = CapabilityDescriptor::new("x", "");
        assert!(CapabilityRegistry::validate_output(&desc, &serde_json::json!({"a": 1})).is_ok());
        let err = CapabilityRegistry::validate_output(&desc, &serde_json::json!("text")).unwrap_err();
        assert!(matches!(err, TaskError::InvalidOutput(_)));
    }
}
