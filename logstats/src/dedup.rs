//! 去重引擎
//!
//! 同一类型的连续快照之间，只写出发生变化的 key：
//! - 新 key：写出
//! - 同类型基础值且相等：省略
//! - 两边都是嵌套快照：递归，递归结果非空才写出
//! - 其他情况（类型变化、Opaque）：原样写出
//!
//! 被删除的 key 不会留下任何标记。

use std::collections::HashMap;

use crate::snapshot::{Snapshot, Value};

/// 计算 `curr` 相对 `prev` 的增量
pub fn diff(prev: &Snapshot, curr: &Snapshot) -> Snapshot {
    let mut out = Snapshot::new();

    for (key, value) in curr.iter() {
        let Some(old) = prev.get(key) else {
            out.insert(key.clone(), value.clone());
            continue;
        };

        if value.unchanged_from(old) {
            continue;
        }

        match (value, old) {
            (Value::Nested(c), Value::Nested(p)) => {
                let inner = diff(p, c);
                if !inner.is_empty() {
                    out.insert(key.clone(), inner);
                }
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }

    out
}

/// 每种统计类型的去重基线
///
/// 基线只在写入成功后通过 [`DedupEngine::commit`] 更新，
/// 写入失败时基线保持不变，重试会得到相同的增量。
#[derive(Debug, Default)]
pub struct DedupEngine {
    baselines: HashMap<String, Snapshot>,
}

impl DedupEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 计算要写出的内容：没有基线时返回完整快照
    pub fn delta(&self, stat_type: &str, curr: &Snapshot) -> Snapshot {
        match self.baselines.get(stat_type) {
            Some(prev) => diff(prev, curr),
            None => curr.clone(),
        }
    }

    /// 记录完整快照（不是增量）作为新基线
    pub fn commit(&mut self, stat_type: &str, curr: Snapshot) {
        self.baselines.insert(stat_type.to_string(), curr);
    }

    /// 清空所有基线（分段轮转时调用）
    pub fn reset(&mut self) {
        self.baselines.clear();
    }

    pub fn has_baseline(&self, stat_type: &str) -> bool {
        self.baselines.contains_key(stat_type)
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }
}
