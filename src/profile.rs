//! 用户画像与上传资源摘要
//!
//! UserPersona 提供规划输入：目标、时间线、已有专长、知识缺口、学习偏好。
//! 缺失的 goal / timeline 以 "unspecified" 兜底而不是报错。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// 单项技能水平
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SkillLevel {
    /// 领域，如 "UX Research"
    pub domain: String,
    /// beginner / intermediate / advanced
    pub level: String,
    /// 自评信心（1-10）
    pub confidence: u8,
}

/// 用户画像
#[derive(Debug, Clone, Serialize, Deserialize, Default, JsonSchema)]
pub struct UserPersona {
    pub user_id: String,
    /// 学习目标（SMART 目标的 specific 部分）
    #[serde(default)]
    pub goal: Option<String>,
    /// 时间线，如 "6 months" / "3 weeks"
    #[serde(default)]
    pub timeline: Option<String>,
    #[serde(default)]
    pub learning_preferences: Vec<String>,
    #[serde(default)]
    pub expertise: Vec<SkillLevel>,
    /// 当前状态与目标之间的知识缺口
    #[serde(default)]
    pub knowledge_gaps: Vec<String>,
    /// 用户通过平台已学内容的概述（供个性化评分）
    #[serde(default)]
    pub study_summary: String,
}

impl UserPersona {
    /// 目标，缺失时返回 "unspecified"
    pub fn goal_or_default(&self) -> &str {
        self.goal.as_deref().filter(|s| !s.trim().is_empty()).unwrap_or("unspecified")
    }

    /// 时间线，缺失时返回 "unspecified"
    pub fn timeline_or_default(&self) -> &str {
        self.timeline.as_deref().filter(|s| !s.trim().is_empty()).unwrap_or("unspecified")
    }

    /// 个性化评分用的关键词：知识缺口 + 专长领域 + 目标，全部小写
    pub fn personalization_terms(&self) -> Vec<String> {
        let mut terms: Vec<String> = Vec::new();
        for gap in &self.knowledge_gaps {
            terms.push(gap.to_lowercase());
        }
        for skill in &self.expertise {
            terms.push(skill.domain.to_lowercase());
        }
        if let Some(goal) = &self.goal {
            terms.push(goal.to_lowercase());
        }
        terms.retain(|t| !t.trim().is_empty());
        terms
    }

    /// 从时间线文本推导可投入学时预算（月 ≈ 20h，周 ≈ 5h，天 ≈ 1h）
    /// 解析失败时回退到 24h，保证 feasibility 评分始终可计算
    pub fn timeline_hours(&self) -> f64 {
        let text = self.timeline_or_default().to_lowercase();
        let number = text
            .split_whitespace()
            .find_map(|w| w.trim_matches(|c: char| !c.is_ascii_digit()).parse::<f64>().ok());
        match number {
            Some(n) if text.contains("month") => n * 20.0,
            Some(n) if text.contains("week") => n * 5.0,
            Some(n) if text.contains("day") => n,
            Some(n) if text.contains("hour") => n,
            _ => 24.0,
        }
    }
}

/// 用户上传资源的摘要（PDF 解析等在核心之外完成，这里只消费结果）
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResourceSummary {
    pub name: String,
    pub summary: String,
    /// 能力侧给出的相关性分（0.0-1.0）
    #[serde(default)]
    pub relevance: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_default_to_unspecified() {
        let persona = UserPersona::default();
        assert_eq!(persona.goal_or_default(), "unspecified");
        assert_eq!(persona.timeline_or_default(), "unspecified");
    }

    #[test]
    fn test_timeline_hours_parsing() {
        let mut persona = UserPersona::default();
        persona.timeline = Some("6 months".to_string());
        assert_eq!(persona.timeline_hours(), 120.0);

        persona.timeline = Some("3 weeks".to_string());
        assert_eq!(persona.timeline_hours(), 15.0);

        persona.timeline = Some("whenever".to_string());
        assert_eq!(persona.timeline_hours(), 24.0);
    }
}
