//! 错误类型

use std::io;
use thiserror::Error;

/// logstats 错误
#[derive(Debug, Error)]
pub enum Error {
    /// 构造参数非法（分段数越界、路径不合法），不会重试
    #[error("invalid config: {0}")]
    Validation(String),

    /// 写入路径上的文件系统错误（打开/重命名/压缩/同步）
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// 快照序列化/反序列化失败
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// 回放：读取源文件失败
    #[error("failed to read source: {0}")]
    Read(#[source] io::Error),

    /// 回放：写入目标文件失败
    #[error("failed to write output: {0}")]
    Write(#[source] io::Error),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, Error>;
