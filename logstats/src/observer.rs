//! 观测接口
//!
//! 各组件在构造时注入一个 [`StatsObserver`]，不依赖全局开关。
//! 默认实现 [`TracingObserver`] 转发到 tracing。

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::line::LineError;

/// 写入与回放过程中的事件回调，全部默认空实现
pub trait StatsObserver: Send + Sync {
    /// 一行已追加到活动分段
    fn on_append(&self, _stat_type: &str, _bytes: usize) {}

    /// 活动分段已封存，`sealed` 为封存后的文件
    fn on_rotate(&self, _sealed: &Path) {}

    /// 回放时某行被原样透传（格式不合法）
    fn on_passthrough(&self, _line_no: u64, _reason: &LineError) {}

    /// 回放写入端进度
    fn on_progress(&self, _lines: u64) {}
}

/// 转发到 tracing 的观测器
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl StatsObserver for TracingObserver {
    fn on_append(&self, stat_type: &str, bytes: usize) {
        debug!("logstats: {} bytes written for {}", bytes, stat_type);
    }

    fn on_rotate(&self, sealed: &Path) {
        info!("logstats: Rotated, sealed segment {}", sealed.display());
    }

    fn on_passthrough(&self, line_no: u64, reason: &LineError) {
        warn!("logstats: Line {} passed through: {}", line_no, reason);
    }

    fn on_progress(&self, lines: u64) {
        info!("logstats: {} stat lines parsed", lines);
    }
}

/// 什么都不做的观测器
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl StatsObserver for NoopObserver {}

pub fn default_observer() -> Arc<dyn StatsObserver> {
    Arc::new(TracingObserver)
}
