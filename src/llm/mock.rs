//! Mock LLM 客户端（用于测试与无 API 的演示）
//!
//! 默认返回一份合法的分析记录 JSON，让规划器在本地可以跑通；
//! with_response 可注入任意固定回复用于错误路径测试。

use async_trait::async_trait;

use crate::llm::{LlmClient, Message};

/// Mock 客户端：固定回复
#[derive(Debug, Default)]
pub struct MockLlmClient {
    response: Option<String>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注入固定回复（测试解析失败等路径）
    pub fn with_response(response: impl Into<String>) -> Self {
        Self { response: Some(response.into()) }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
        if let Some(response) = &self.response {
            return Ok(response.clone());
        }
        Ok(r#"```json
{
  "background": "Learner with adjacent expertise entering a new domain.",
  "constraints": ["limited weekly study time"],
  "gaps": ["fundamentals", "terminology", "evaluation methods"],
  "complexity": "intermediate",
  "needs_freshness": true
}
```"#
            .to_string())
    }
}
