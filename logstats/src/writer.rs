//! 写入器模块
//!
//! 提供 PlainStatLog 和 DedupStatLog 两种写入器，统一实现 [`StatLog`]。
//! 每个实例内部用一把锁串行化整个写入路径：
//! 轮转检查 → 计算增量 → 编码 → 追加 → 可选 fsync。

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::LogStatsConfig;
use crate::dedup::DedupEngine;
use crate::error::{Error, Result};
use crate::line::{self, Timestamper};
use crate::segment::{SegmentStats, SegmentStore};
use crate::snapshot::Snapshot;

/// 统计日志写入接口
pub trait StatLog: Send + Sync {
    /// 写入一次快照
    fn write(&self, stat_type: &str, snapshot: &Snapshot) -> Result<()>;

    /// 写入一次快照，只写出相对上次发生变化的 key
    fn write_dedupe(&self, stat_type: &str, snapshot: &Snapshot) -> Result<()>;

    /// 开关每次写入后的 fsync
    fn set_durable(&self, durable: bool);

    /// 同步活动分段到磁盘
    fn sync(&self) -> Result<()>;

    fn stats(&self) -> SegmentStats;
}

/// 按配置选择写入器
pub fn open(config: &LogStatsConfig) -> Result<Box<dyn StatLog>> {
    if config.dedupe {
        Ok(Box::new(DedupStatLog::open(config)?))
    } else {
        Ok(Box::new(PlainStatLog::open(config)?))
    }
}

/// 分段存储 + 时间戳，两种写入器共用
struct Appender {
    store: SegmentStore,
    timestamper: Timestamper,
}

impl Appender {
    fn open(config: &LogStatsConfig) -> Result<Self> {
        let timestamper = Timestamper::new(&config.ts_format)?;
        let store = SegmentStore::open(config)?;
        Ok(Self { store, timestamper })
    }

    fn append(&mut self, stat_type: &str, payload: &[u8]) -> Result<()> {
        let line = line::encode(&self.timestamper.now(), stat_type, payload);
        self.store.append(stat_type, &line)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // 写入失败不会破坏内部状态，中毒的锁可以继续用
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 完整写入，每条都是全量快照
pub struct PlainStatLog {
    inner: Mutex<Appender>,
}

impl PlainStatLog {
    pub fn open(config: &LogStatsConfig) -> Result<Self> {
        Ok(Self {
            inner: Mutex::new(Appender::open(config)?),
        })
    }
}

impl StatLog for PlainStatLog {
    fn write(&self, stat_type: &str, snapshot: &Snapshot) -> Result<()> {
        let payload = snapshot.to_vec()?;

        let mut inner = lock(&self.inner);
        inner.store.rotate_if_needed()?;
        inner.append(stat_type, &payload)
    }

    fn write_dedupe(&self, _stat_type: &str, _snapshot: &Snapshot) -> Result<()> {
        Err(Error::Unsupported(
            "dedupe write on a plain stat log".to_string(),
        ))
    }

    fn set_durable(&self, durable: bool) {
        lock(&self.inner).store.set_durable(durable);
    }

    fn sync(&self) -> Result<()> {
        lock(&self.inner).store.sync()
    }

    fn stats(&self) -> SegmentStats {
        lock(&self.inner).store.stats()
    }
}

struct DedupInner {
    appender: Appender,
    engine: DedupEngine,
}

/// 去重写入
///
/// 同一类型的快照只写出变化的 key。基线在轮转时清空，
/// 所以每个分段里每种类型的第一条总是全量快照，分段可以单独回放。
pub struct DedupStatLog {
    inner: Mutex<DedupInner>,
}

impl DedupStatLog {
    pub fn open(config: &LogStatsConfig) -> Result<Self> {
        Ok(Self {
            inner: Mutex::new(DedupInner {
                appender: Appender::open(config)?,
                engine: DedupEngine::new(),
            }),
        })
    }
}

impl StatLog for DedupStatLog {
    fn write(&self, stat_type: &str, snapshot: &Snapshot) -> Result<()> {
        self.write_dedupe(stat_type, snapshot)
    }

    fn write_dedupe(&self, stat_type: &str, snapshot: &Snapshot) -> Result<()> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;

        // 先清基线再轮转：轮转中途失败时也不会对已封存的分段写增量
        if inner.appender.store.needs_rotation() {
            inner.engine.reset();
        }
        inner.appender.store.rotate_if_needed()?;

        let payload = inner.engine.delta(stat_type, snapshot).to_vec()?;
        inner.appender.append(stat_type, &payload)?;
        inner.engine.commit(stat_type, snapshot.clone());
        Ok(())
    }

    fn set_durable(&self, durable: bool) {
        lock(&self.inner).appender.store.set_durable(durable);
    }

    fn sync(&self) -> Result<()> {
        lock(&self.inner).appender.store.sync()
    }

    fn stats(&self) -> SegmentStats {
        lock(&self.inner).appender.store.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config(dir: &std::path::Path, dedupe: bool) -> LogStatsConfig {
        let mut config = LogStatsConfig::new(dir.join("w.log"));
        config.dedupe = dedupe;
        config.observer = std::sync::Arc::new(crate::observer::NoopObserver);
        config
    }

    #[test]
    fn test_plain_rejects_dedupe() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(&config(dir.path(), false)).unwrap();
        let snap = Snapshot::new().with("a", 1i64);
        assert!(matches!(
            log.write_dedupe("t", &snap),
            Err(Error::Unsupported(_))
        ));
        // 没写任何东西
        assert_eq!(log.stats().appends, 0);
    }

    #[test]
    fn test_open_selects_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(&config(dir.path(), true)).unwrap();
        let snap = Snapshot::new().with("a", 1i64).with("b", "x");
        log.write("t", &snap).unwrap();
        log.write("t", &snap).unwrap();

        let text = fs::read_to_string(dir.path().join("w.00.log")).unwrap();
        let payloads: Vec<&str> = text
            .lines()
            .map(|l| l.rsplit_once(' ').unwrap().1)
            .collect();
        assert_eq!(payloads, vec![r#"{"a":1,"b":"x"}"#, "{}"]);
    }

    #[test]
    fn test_invalid_ts_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), false);
        config.ts_format = "%Q".to_string();
        assert!(matches!(open(&config), Err(Error::Validation(_))));
    }

    #[test]
    fn test_set_durable() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(&config(dir.path(), false)).unwrap();
        assert!(!log.stats().durable);
        log.set_durable(true);
        log.write("t", &Snapshot::new().with("a", 1i64)).unwrap();
        assert!(log.stats().durable);
        assert_eq!(log.stats().appends, 1);
    }
}
