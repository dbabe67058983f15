//! 上下文预算控制
//!
//! 对跨越 agent 边界的任何载荷强制 token 上限。压缩按序应用：
//! 1. 结构压缩：只保留声明的关键洞察字段，丢弃原始正文；
//! 2. 列表截断：按能力给出的 relevance 降序保留能放进预算的最大 N 条；
//! 3. 单字段仍超限时硬截断，并打上 truncated=true 标记让下游感知信息损失。
//! 注意：最终送审的 Candidate 不经过这里，判定产物必须完整。

use serde_json::Value;

/// Token 估算器（字符计数近似：英文约 4 字符/token，非 ASCII 约 1.5 字符/token）
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;
        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }
        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 估算 JSON 值整体的 token 数（按序列化文本）
    pub fn estimate_value(value: &Value) -> usize {
        match value {
            Value::String(s) => Self::estimate(s),
            other => Self::estimate(&other.to_string()),
        }
    }
}

/// 压缩结果：载荷 + 估算值 + 是否发生过硬截断
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedPayload {
    pub value: Value,
    pub token_estimate: usize,
    pub truncated: bool,
}

/// 上下文预算器（无状态）
pub struct ContextBudgeter;

impl ContextBudgeter {
    /// 压缩到 budget 以内；不变量：返回值 estimate ≤ budget，或 truncated=true
    pub fn compress(payload: &Value, budget: usize, key_fields: &[String]) -> CompressedPayload {
        let estimate = TokenEstimator::estimate_value(payload);
        if estimate <= budget {
            return CompressedPayload { value: payload.clone(), token_estimate: estimate, truncated: false };
        }

        // 第一步：结构压缩，只留关键字段
        let mut value = Self::keep_key_fields(payload, key_fields);
        let mut estimate = TokenEstimator::estimate_value(&value);
        if estimate <= budget {
            return CompressedPayload { value, token_estimate: estimate, truncated: false };
        }

        // 第二步：列表字段按 relevance 降序截断到能装下的最大 N
        if let Some(obj) = value.as_object_mut() {
            for (_, field) in obj.iter_mut() {
                if let Some(list) = field.as_array_mut() {
                    list.sort_by(|a, b| {
                        relevance_of(b).partial_cmp(&relevance_of(a)).unwrap_or(std::cmp::Ordering::Equal)
                    });
                }
            }
        }
        loop {
            estimate = TokenEstimator::estimate_value(&value);
            if estimate <= budget {
                return CompressedPayload { value, token_estimate: estimate, truncated: false };
            }
            if !pop_least_relevant(&mut value) {
                break;
            }
        }

        // 第三步：单字段硬截断
        let truncated_value = Self::hard_truncate(&mut value, budget);
        let estimate = TokenEstimator::estimate_value(&value);
        CompressedPayload { value, token_estimate: estimate, truncated: truncated_value }
    }

    fn keep_key_fields(payload: &Value, key_fields: &[String]) -> Value {
        match payload.as_object() {
            Some(obj) if !key_fields.is_empty() => {
                let kept: serde_json::Map<String, Value> = obj
                    .iter()
                    .filter(|(k, _)| key_fields.iter().any(|f| f == *k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Value::Object(kept)
            }
            _ => payload.clone(),
        }
    }

    /// 截断最大的字符串字段并打标记；非对象载荷整体按文本截断
    fn hard_truncate(value: &mut Value, budget: usize) -> bool {
        let target_tokens = budget.saturating_sub(budget / 10).max(1);
        let Some(obj) = value.as_object_mut() else {
            let text = match value.as_str() {
                Some(s) => s.to_string(),
                None => value.to_string(),
            };
            *value = Value::String(truncate_to_tokens(&text, target_tokens));
            return true;
        };
        let largest = obj
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), TokenEstimator::estimate(s))))
            .max_by_key(|(_, est)| *est)
            .map(|(k, _)| k);

        if let Some(field) = largest {
            if let Some(text) = obj.get(&field).and_then(|v| v.as_str()) {
                let truncated = truncate_to_tokens(text, target_tokens);
                obj.insert(field, Value::String(truncated));
            }
        }
        // 即便没有可截断的字符串字段，也要让下游感知到压缩失败
        obj.insert("truncated".to_string(), Value::Bool(true));
        true
    }
}

pub(crate) fn relevance_of(item: &Value) -> f64 {
    item.get("relevance").and_then(|v| v.as_f64()).unwrap_or(0.0)
}

/// 从最长的列表字段尾部（已按 relevance 降序）弹出一项；无可弹出返回 false
fn pop_least_relevant(value: &mut Value) -> bool {
    let Some(obj) = value.as_object_mut() else {
        return false;
    };
    let longest = obj
        .iter()
        .filter_map(|(k, v)| v.as_array().filter(|a| !a.is_empty()).map(|a| (k.clone(), a.len())))
        .max_by_key(|(_, len)| *len)
        .map(|(k, _)| k);
    match longest {
        Some(field) => {
            if let Some(list) = obj.get_mut(&field).and_then(|v| v.as_array_mut()) {
                list.pop();
            }
            true
        }
        None => false,
    }
}

/// 按比例截断到指定 token 数，保留开头，留 10% 余量
fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    let estimated = TokenEstimator::estimate(text);
    if estimated <= max_tokens {
        return text.to_string();
    }
    let ratio = max_tokens as f64 / estimated as f64;
    let target_chars = (text.chars().count() as f64 * ratio * 0.9) as usize;
    let truncated: String = text.chars().take(target_chars).collect();
    format!("{}...", truncated.trim_end())
}
