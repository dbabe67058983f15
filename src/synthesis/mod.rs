//! 合成器
//!
//! 将异构任务输出按计划声明顺序确定性地折叠为一个 Candidate。
//! 合并角色（封闭词表）：foundation 建立章节骨架，overlay 并入或追加章节，
//! enrichment 只充实已有章节。失败 / 跳过的任务不贡献内容，记入 Candidate 的 gaps。
//! 重试周期不从零重建：先按反馈指令对点名章节打补丁，再并入重跑任务的新输出。
//! 合并本身是纯函数：同样的 (plan, inputs, cycle, feedback) 两次合成产生结构相同的 Candidate。

use std::collections::BTreeMap;

use serde_json::Value;

use crate::core::error::SynthesisError;
use crate::plan::{
    Candidate, Curriculum, FeedbackDirective, Gap, MergeRole, Plan, Section, TaskId, TaskStatus,
};

/// 合成器（无状态，合并逻辑为纯函数）
pub struct Synthesizer;

impl Synthesizer {
    pub fn new() -> Self {
        Self
    }

    /// 合成一个周期的 Candidate。
    /// inputs：按任务 ID 的压缩后输出；prior：上一周期 Candidate（cycle > 0 时必需的补丁基底）。
    pub fn synthesize(
        &self,
        plan: &Plan,
        inputs: &BTreeMap<TaskId, Value>,
        cycle: u32,
        prior: Option<&Candidate>,
        feedback: &[FeedbackDirective],
    ) -> Result<Candidate, SynthesisError> {
        let succeeded = plan.tasks.iter().filter(|t| t.status == TaskStatus::Succeeded).count();
        if succeeded == 0 {
            return Err(SynthesisError::NoInput);
        }

        // 基底：首周期从空白开始；重试周期从上一 Candidate 出发打补丁
        let mut curriculum = match (cycle, prior) {
            (c, Some(p)) if c > 0 => p.curriculum.clone(),
            _ => Curriculum { title: plan.topic.clone(), sections: Vec::new() },
        };

        let mut applied_feedback = Vec::new();
        if cycle > 0 {
            for directive in feedback {
                apply_directive(&mut curriculum, plan, directive);
                applied_feedback.push(format!("{}: {}", directive.criterion, directive.directive));
            }
        }

        // 按计划声明顺序折叠（完成顺序不确定，消费顺序必须确定）
        let mut contributing = Vec::new();
        let mut gaps = Vec::new();
        let mut confidence_sum = 0.0;
        for task in &plan.tasks {
            match task.status {
                TaskStatus::Succeeded => {
                    let Some(input) = inputs.get(&task.id) else {
                        continue;
                    };
                    let role = plan.synthesis_strategy.role_for(&task.capability);
                    fold(&mut curriculum, input, role);
                    confidence_sum += task.result.as_ref().map(|r| r.confidence).unwrap_or(0.5);
                    contributing.push(task.id.clone());
                }
                TaskStatus::Failed => gaps.push(Gap {
                    task_id: task.id.clone(),
                    capability: task.capability.clone(),
                    reason: task.error.clone().unwrap_or_else(|| "failed".to_string()),
                }),
                TaskStatus::Skipped => gaps.push(Gap {
                    task_id: task.id.clone(),
                    capability: task.capability.clone(),
                    reason: "skipped: dependency failed or deadline reached".to_string(),
                }),
                TaskStatus::Pending | TaskStatus::Running => {}
            }
        }

        let synthesis_confidence = if contributing.is_empty() {
            0.0
        } else {
            confidence_sum / contributing.len() as f64
        };

        tracing::info!(
            plan_id = %plan.id,
            cycle,
            sections = curriculum.sections.len(),
            gaps = gaps.len(),
            "Candidate synthesized"
        );

        Ok(Candidate {
            // 确定性 ID：同一 plan + cycle 的两次合成完全一致
            id: format!("{}-c{}", plan.id, cycle),
            plan_id: plan.id.clone(),
            cycle_number: cycle,
            curriculum,
            contributing,
            gaps,
            synthesis_confidence,
            applied_feedback,
            created_at: chrono::Utc::now(),
        })
    }
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::new()
    }
}

/// 按反馈指令对基底课程做定向补丁（不重新生成）
fn apply_directive(curriculum: &mut Curriculum, plan: &Plan, directive: &FeedbackDirective) {
    match directive.criterion.as_str() {
        // 进阶性：按难度层级稳定排序
        "progression" => {
            curriculum.sections.sort_by_key(|s| s.level);
        }
        // 可行性：总学时超预算时按比例压缩
        "feasibility" => {
            let total: f64 = curriculum.sections.iter().map(|s| s.est_hours).sum();
            let budget = plan.rubric.timeline_hours;
            if total > budget && total > 0.0 {
                let factor = budget / total;
                for section in &mut curriculum.sections {
                    section.est_hours = (section.est_hours * factor * 10.0).round() / 10.0;
                }
            }
        }
        // 定向重建：清空点名章节的内容，等待重跑任务的新输出回填
        _ => {
            if let Some(slug) = &directive.section {
                if let Some(section) = curriculum.sections.iter_mut().find(|s| &s.slug == slug) {
                    section.points.clear();
                    section.sources.clear();
                }
            }
        }
    }
}

/// 将单个任务输出按角色折叠进课程
fn fold(curriculum: &mut Curriculum, input: &Value, role: MergeRole) {
    let sections = parse_sections(input);
    for incoming in sections {
        let existing = curriculum.sections.iter_mut().find(|s| s.slug == incoming.slug);
        match (existing, role) {
            (Some(section), _) => merge_section(section, &incoming),
            (None, MergeRole::Foundation) | (None, MergeRole::Overlay) => {
                curriculum.sections.push(incoming);
            }
            (None, MergeRole::Enrichment) => {
                // enrichment 从不新建章节
                tracing::debug!(slug = %incoming.slug, "Enrichment section without base, dropped");
            }
        }
    }
}

/// 并入已有章节：只追加缺失的 points / sources，保持既有难度与学时（幂等）
fn merge_section(section: &mut Section, incoming: &Section) {
    for point in &incoming.points {
        if !section.points.contains(point) {
            section.points.push(point.clone());
        }
    }
    for source in &incoming.sources {
        if !section.sources.contains(source) {
            section.sources.push(source.clone());
        }
    }
}

/// 从能力输出解析章节列表；字段缺失按保守默认值处理
fn parse_sections(input: &Value) -> Vec<Section> {
    let Some(list) = input.get("sections").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|item| {
            let title = item.get("title").and_then(|v| v.as_str())?.trim();
            if title.is_empty() {
                return None;
            }
            let points = item
                .get("points")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|p| p.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            let sources = item
                .get("sources")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            Some(Section {
                slug: Section::slug_of(title),
                title: title.to_string(),
                points,
                level: item.get("level").and_then(|v| v.as_u64()).unwrap_or(1).clamp(1, 3) as u8,
                est_hours: item.get("est_hours").and_then(|v| v.as_f64()).unwrap_or(1.0),
                sources,
            })
        })
        .collect()
}
