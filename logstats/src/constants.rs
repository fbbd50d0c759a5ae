//! 常量定义
//!
//! 分段文件命名、回放流水线等使用的常量

/// 支持的最大分段文件数
pub const MAX_NUM_FILES: usize = 99;
/// 分段编号宽度 (MAX_NUM_FILES 的十进制位数，保证字典序 == 数值序)
pub const SEGMENT_INDEX_WIDTH: usize = decimal_digits(MAX_NUM_FILES);

/// 日志文件扩展名
pub const LOG_EXT: &str = "log";
/// 压缩分段扩展名
pub const GZ_EXT: &str = "gz";
/// 压缩临时文件后缀，压缩完成后才重命名为正式分段
pub const GZ_TMP_SUFFIX: &str = ".tmp";

/// 默认时间戳格式 (chrono strftime)，首字符总是数字
pub const DEFAULT_TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";
/// 默认单文件软上限 (1MB)
pub const DEFAULT_SIZE_LIMIT: u64 = 1024 * 1024;
/// 默认保留分段数
pub const DEFAULT_NUM_FILES: usize = 4;

/// 回放输出文件后缀
pub const DUPED_SUFFIX: &str = "_duped.log";
/// 回放流水线队列容量（条）
pub const QUEUE_CAPACITY: usize = 10_000;
/// 回放写入端每隔多少行刷新一次
pub const FLUSH_EVERY_LINES: u64 = 10_000;
/// 回放读取块大小
pub const READ_CHUNK_SIZE: usize = 64 * 1024;
/// 回放写入端缓冲大小 (1MB)
pub const WRITE_BUFFER_SIZE: usize = 1024 * 1024;

const fn decimal_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_width_follows_max() {
        assert_eq!(SEGMENT_INDEX_WIDTH, MAX_NUM_FILES.to_string().len());
        assert_eq!(decimal_digits(0), 1);
        assert_eq!(decimal_digits(9), 1);
        assert_eq!(decimal_digits(10), 2);
        assert_eq!(decimal_digits(999), 3);
    }
}
