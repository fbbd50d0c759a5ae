//! logstats - 分段滚动的统计日志
//!
//! 特性：
//! - 分段滚动：活动分段超过软上限后轮转，保留固定数量的分段
//! - 可选压缩：封存的分段 gzip 压缩，活动分段永远是明文
//! - 增量去重：同一类型的连续快照只写出变化的 key
//! - 离线回放：把去重日志还原成每条都是全量快照的日志
//!
//! 行格式：
//! ```text
//! 2024-05-01T10:00:00.000+08:00 kStats {"k1":10,"k2":"Value2"}
//! ```

pub mod config;
pub mod constants;
pub mod dedup;
pub mod error;
pub mod line;
pub mod observer;
pub mod reconstruct;
pub mod segment;
pub mod snapshot;
pub mod writer;


pub use config::LogStatsConfig;
pub use dedup::DedupEngine;
pub use error::{Error, Result};
pub use line::LineError;
pub use observer::{NoopObserver, StatsObserver, TracingObserver};
pub use reconstruct::{reconstruct, reconstruct_file, ReconstructSummary, Reconstructor};
pub use segment::{SegmentName, SegmentStats, SegmentStore};
pub use snapshot::{Snapshot, Timestamp, Value};
pub use writer::{open, DedupStatLog, PlainStatLog, StatLog};
