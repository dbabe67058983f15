//! 质量门
//!
//! 对 Candidate 按计划声明的成功指标逐项评分（每个指标名对应一条固定评分规则），
//! overall 为等权（或计划声明权重）加权平均。判定规则：
//! - overall ≥ quality_threshold → pass；
//! - 否则 cycle_number < retry_budget → retry，反馈列出低于阈值的指标及可寻址的改进指令；
//! - 否则 → fail（尽力而为的 Candidate 仍被留存并返回）。
//! 评分规则自身失败（未知指标）→ fail 判定 + 诊断信息，绝不默默当作 pass。

use std::collections::BTreeMap;

use crate::core::error::GateError;
use crate::plan::{Candidate, Decision, FeedbackDirective, MergeRole, Plan, Verdict};

/// 质量门（无状态，评分规则为纯函数）
pub struct QualityGate;

impl QualityGate {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, candidate: &Candidate, plan: &Plan) -> Verdict {
        let mut scores = BTreeMap::new();
        for criterion in plan.success_criteria.thresholds.keys() {
            match score_criterion(criterion, candidate, plan) {
                Ok(score) => {
                    scores.insert(criterion.clone(), score);
                }
                Err(err) => {
                    // 规则失败：fail + 诊断，绝不默认通过
                    tracing::error!(criterion = %criterion, error = %err, "Scoring rubric failed");
                    return Verdict {
                        candidate_id: candidate.id.clone(),
                        overall_score: 0.0,
                        scores,
                        decision: Decision::Fail,
                        feedback: Vec::new(),
                        diagnostic: Some(err.to_string()),
                        created_at: chrono::Utc::now(),
                    };
                }
            }
        }

        let weight_sum: f64 = scores.keys().map(|c| plan.success_criteria.weight_for(c)).sum();
        let overall_score = if weight_sum > 0.0 {
            scores
                .iter()
                .map(|(c, s)| s * plan.success_criteria.weight_for(c))
                .sum::<f64>()
                / weight_sum
        } else {
            0.0
        };

        let decision = if overall_score >= plan.quality_threshold {
            Decision::Pass
        } else if candidate.cycle_number < plan.retry_budget {
            Decision::Retry
        } else {
            Decision::Fail
        };

        let feedback = if decision == Decision::Pass {
            Vec::new()
        } else {
            build_feedback(&scores, candidate, plan)
        };

        tracing::info!(
            candidate_id = %candidate.id,
            cycle = candidate.cycle_number,
            overall = format!("{overall_score:.1}"),
            ?decision,
            "Verdict issued"
        );

        Verdict {
            candidate_id: candidate.id.clone(),
            overall_score,
            scores,
            decision,
            feedback,
            diagnostic: None,
            created_at: chrono::Utc::now(),
        }
    }
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::new()
    }
}

/// 单项指标评分（0-100），规则按指标名固定声明
pub fn score_criterion(criterion: &str, candidate: &Candidate, plan: &Plan) -> Result<f64, GateError> {
    let sections = &candidate.curriculum.sections;
    let score = match criterion {
        // 完整性：已填充章节数 / 期望章节数
        "completeness" => {
            let populated = sections.iter().filter(|s| !s.points.is_empty()).count();
            let expected = plan.rubric.expected_sections.max(1);
            (populated as f64 / expected as f64 * 100.0).min(100.0)
        }
        // 个性化：画像关键词被章节覆盖的比例
        "personalization" => {
            let terms = &plan.rubric.personalization_terms;
            if terms.is_empty() {
                100.0
            } else {
                let haystack = sections
                    .iter()
                    .flat_map(|s| std::iter::once(s.title.as_str()).chain(s.points.iter().map(String::as_str)))
                    .collect::<Vec<_>>()
                    .join(" ")
                    .to_lowercase();
                let matched = terms.iter().filter(|t| term_matches(t, &haystack)).count();
                matched as f64 / terms.len() as f64 * 100.0
            }
        }
        // 进阶性：相邻章节难度不下降的比例
        "progression" => {
            if sections.len() <= 1 {
                100.0
            } else {
                let pairs = sections.len() - 1;
                let ordered = sections.windows(2).filter(|w| w[0].level <= w[1].level).count();
                ordered as f64 / pairs as f64 * 100.0
            }
        }
        // 可行性：总学时相对时间线预算
        "feasibility" => {
            let total: f64 = sections.iter().map(|s| s.est_hours).sum();
            let budget = plan.rubric.timeline_hours.max(1.0);
            if total <= budget {
                100.0
            } else {
                (budget / total * 100.0).max(0.0)
            }
        }
        other => return Err(GateError::UnknownCriterion(other.to_string())),
    };
    Ok(score)
}

/// 关键词匹配：词组中任一显著词（≥ 4 字符）出现即算覆盖
fn term_matches(term: &str, haystack: &str) -> bool {
    term.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 4)
        .any(|w| haystack.contains(&w.to_lowercase()))
        || haystack.contains(term)
}

/// 为低于阈值的指标生成可寻址的改进指令；全部达标但 overall 不足时点名最低分指标
fn build_feedback(scores: &BTreeMap<String, f64>, candidate: &Candidate, plan: &Plan) -> Vec<FeedbackDirective> {
    let mut below: Vec<&String> = scores
        .iter()
        .filter(|(c, s)| {
            let threshold = plan.success_criteria.thresholds.get(*c).copied().unwrap_or(plan.quality_threshold);
            **s < threshold
        })
        .map(|(c, _)| c)
        .collect();

    if below.is_empty() {
        if let Some((lowest, _)) = scores
            .iter()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        {
            below.push(lowest);
        }
    }

    // 需要重跑的能力：合并角色为 foundation 的内容生产者
    let foundation_caps: Vec<String> = plan
        .synthesis_strategy
        .roles
        .iter()
        .filter(|(_, role)| **role == MergeRole::Foundation)
        .map(|(cap, _)| cap.clone())
        .collect();

    below
        .into_iter()
        .map(|criterion| match criterion.as_str() {
            "completeness" => {
                let empty_section = candidate
                    .curriculum
                    .sections
                    .iter()
                    .find(|s| s.points.is_empty())
                    .map(|s| s.slug.clone());
                FeedbackDirective {
                    criterion: criterion.clone(),
                    section: empty_section,
                    directive: "Populate empty sections and cover all declared knowledge gaps".into(),
                    redispatch: foundation_caps.clone(),
                }
            }
            "personalization" => FeedbackDirective {
                criterion: criterion.clone(),
                section: None,
                directive: "Tie section content to the learner's stated gaps and expertise".into(),
                redispatch: foundation_caps.clone(),
            },
            "progression" => FeedbackDirective {
                criterion: criterion.clone(),
                section: None,
                directive: "Reorder sections from basic to advanced difficulty".into(),
                redispatch: Vec::new(),
            },
            "feasibility" => FeedbackDirective {
                criterion: criterion.clone(),
                section: None,
                directive: "Trim estimated hours to fit the learner's timeline".into(),
                redispatch: Vec::new(),
            },
            _ => FeedbackDirective {
                criterion: criterion.clone(),
                section: None,
                directive: "Improve this criterion".into(),
                redispatch: foundation_caps.clone(),
            },
        })
        .collect()
}
