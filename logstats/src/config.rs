//! 写入配置
//!
//! 可以直接构造，也可以从 JSON 文件加载（缺省字段取默认值）：
//! ```json
//! {
//!     "path": "/var/log/stats.log",
//!     "size_limit": 1048576,
//!     "num_files": 4,
//!     "ts_format": "%Y-%m-%dT%H:%M:%S%.3f%:z",
//!     "durable": false,
//!     "compress": true,
//!     "dedupe": true
//! }
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_NUM_FILES, DEFAULT_SIZE_LIMIT, DEFAULT_TS_FORMAT, MAX_NUM_FILES};
use crate::error::{Error, Result};
use crate::observer::{default_observer, StatsObserver};

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogStatsConfig {
    /// 日志文件名，没有 `.log` 后缀时自动补上
    pub path: PathBuf,
    /// 单个分段的软上限（字节），超过后下一次写入前轮转
    pub size_limit: u64,
    /// 保留的分段数 (1..=99)，包括活动分段
    pub num_files: usize,
    /// 时间戳格式 (chrono strftime)
    pub ts_format: String,
    /// 每次写入后 fsync
    pub durable: bool,
    /// 封存的分段使用 gzip 压缩
    pub compress: bool,
    /// 启用去重写入
    pub dedupe: bool,
    #[serde(skip, default = "default_observer")]
    pub observer: Arc<dyn StatsObserver>,
}

impl Default for LogStatsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("stats.log"),
            size_limit: DEFAULT_SIZE_LIMIT,
            num_files: DEFAULT_NUM_FILES,
            ts_format: DEFAULT_TS_FORMAT.to_string(),
            durable: false,
            compress: true,
            dedupe: false,
            observer: default_observer(),
        }
    }
}

impl fmt::Debug for LogStatsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogStatsConfig")
            .field("path", &self.path)
            .field("size_limit", &self.size_limit)
            .field("num_files", &self.num_files)
            .field("ts_format", &self.ts_format)
            .field("durable", &self.durable)
            .field("compress", &self.compress)
            .field("dedupe", &self.dedupe)
            .finish_non_exhaustive()
    }
}

impl LogStatsConfig {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// 检查分段数范围
    pub fn validate(&self) -> Result<()> {
        if self.num_files > MAX_NUM_FILES {
            return Err(Error::Validation(format!(
                "more than {} files not supported",
                MAX_NUM_FILES
            )));
        }
        if self.num_files < 1 {
            return Err(Error::Validation(format!(
                "unsupported file count {}",
                self.num_files
            )));
        }
        Ok(())
    }

    /// 从 JSON 文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let config: LogStatsConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// 保存配置到 JSON 文件
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
