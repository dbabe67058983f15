//! 会话存储抽象层
//!
//! Plan / Task / Candidate / Verdict 的持久化边界：put / get / update_field，均支持可选过期。
//! 每个写入方只更新以自身标识符为键的记录，并发任务之间不会在同一键上碰撞，无需跨任务加锁。
//! 每次状态转移后立即写入是 run 可恢复（crash-resumable）的前提，属于核心不变量而非优化。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid field path '{path}' on {key}")]
    InvalidFieldPath { key: String, path: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 写入整条记录，可选 TTL
    async fn put(&self, key: &str, record: Value, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// 读取记录；不存在或已过期返回 None
    async fn get(&self, key: &str) -> Option<Value>;

    /// 原子字段级更新：field_path 为点分路径（如 "status"、"rubric.expected_sections"）
    async fn update_field(&self, key: &str, field_path: &str, value: Value) -> Result<(), StoreError>;

    /// 清理过期记录，返回清理条数
    async fn cleanup_expired(&self) -> usize;
}

struct StoredRecord {
    value: Value,
    expires_at: Option<Instant>,
}

impl StoredRecord {
    fn expired(&self) -> bool {
        self.expires_at.map(|t| Instant::now() >= t).unwrap_or(false)
    }
}

/// 内存实现：RwLock<HashMap>，过期惰性检查 + cleanup_expired 主动清理
#[derive(Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<String, StoredRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn put(&self, key: &str, record: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.records
            .write()
            .await
            .insert(key.to_string(), StoredRecord { value: record, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Option<Value> {
        let records = self.records.read().await;
        records.get(key).filter(|r| !r.expired()).map(|r| r.value.clone())
    }

    async fn update_field(&self, key: &str, field_path: &str, value: Value) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(key)
            .filter(|r| !r.expired())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        let mut target = &mut record.value;
        let segments: Vec<&str> = field_path.split('.').collect();
        let (last, parents) = segments.split_last().ok_or_else(|| StoreError::InvalidFieldPath {
            key: key.to_string(),
            path: field_path.to_string(),
        })?;

        for segment in parents {
            target = target
                .as_object_mut()
                .and_then(|obj| obj.get_mut(*segment))
                .ok_or_else(|| StoreError::InvalidFieldPath {
                    key: key.to_string(),
                    path: field_path.to_string(),
                })?;
        }

        let obj = target.as_object_mut().ok_or_else(|| StoreError::InvalidFieldPath {
            key: key.to_string(),
            path: field_path.to_string(),
        })?;
        obj.insert((*last).to_string(), value);
        Ok(())
    }

    async fn cleanup_expired(&self) -> usize {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| !r.expired());
        before - records.len()
    }
}

/// 存储键约定：每类记录以自身标识符为键
pub fn plan_key(plan_id: &str) -> String {
    format!("plan:{plan_id}")
}

pub fn task_key(plan_id: &str, task_id: &str) -> String {
    format!("plan:{plan_id}:task:{task_id}")
}

pub fn candidate_key(plan_id: &str, cycle: u32) -> String {
    format!("plan:{plan_id}:candidate:{cycle}")
}

pub fn verdict_key(plan_id: &str, cycle: u32) -> String {
    format!("plan:{plan_id}:verdict:{cycle}")
}
