//! 行编解码
//!
//! 行格式：
//! ```text
//! <时间戳> <类型> <JSON 负载>\n
//! ```
//! 类型中不能有空格（不做转义，也不做校验）。
//!
//! 解码时从行尾向前做括号配对扫描找到负载起点，再向前取类型。
//! `[` 可以被 `]` 或 `)` 闭合，`(` 也可以被 `)` 或 `]` 闭合，
//! 用于兼容直方图区间 `[a, b)` 这种写法。

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::warn;

use crate::error::{Error, Result};

/// 行解析失败原因，只影响当前行（原样透传）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineError {
    #[error("not a stat line")]
    NotStatLine,
    #[error("line does not end with a closing bracket")]
    NoPayload,
    #[error("unbalanced brackets")]
    Unbalanced,
    #[error("bracket mismatch at {at}: '{opener}' closed by '{closer}'")]
    BracketMismatch { opener: char, closer: char, at: usize },
    #[error("missing separator before payload at {at}")]
    MissingSeparator { at: usize },
    #[error("empty stat type")]
    EmptyType,
    #[error("stat type is not valid UTF-8")]
    InvalidType,
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// 拼接一行：`时间戳 + 空格 + 类型 + 空格 + 负载 + 换行`
pub fn encode(timestamp: &str, stat_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut line = Vec::with_capacity(timestamp.len() + stat_type.len() + payload.len() + 3);
    line.extend_from_slice(timestamp.as_bytes());
    line.push(b' ');
    line.extend_from_slice(stat_type.as_bytes());
    line.push(b' ');
    line.extend_from_slice(payload);
    line.push(b'\n');
    line
}

/// 按 strftime 格式生成时间戳前缀
#[derive(Debug, Clone)]
pub struct Timestamper {
    format: String,
}

impl Timestamper {
    /// 格式串非法时返回 `Error::Validation`
    pub fn new(format: &str) -> Result<Self> {
        if format.is_empty() || StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
        {
            return Err(Error::Validation(format!(
                "invalid timestamp format '{}'",
                format
            )));
        }

        let ts = Self {
            format: format.to_string(),
        };

        // 回放只识别数字开头的行
        let sample = ts.now();
        if !sample.starts_with(|c: char| c.is_ascii_digit()) {
            warn!(
                "logstats: Timestamp format '{}' renders '{}', lines will not be replayable",
                format, sample
            );
        }

        Ok(ts)
    }

    pub fn format_at(&self, at: &DateTime<Local>) -> String {
        at.format(&self.format).to_string()
    }

    pub fn now(&self) -> String {
        self.format_at(&Local::now())
    }
}

/// 解码出的统计行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatLine<'a> {
    pub stat_type: &'a str,
    /// 负载在行内的起始下标
    pub payload_start: usize,
    pub payload: &'a [u8],
}

/// 解析一行（不含换行符）
pub fn decode(line: &[u8]) -> std::result::Result<StatLine<'_>, LineError> {
    // 时间戳总是数字开头
    if !line.first().is_some_and(u8::is_ascii_digit) {
        return Err(LineError::NotStatLine);
    }

    let payload_start = find_payload_start(line)?;
    if payload_start == 0 || line[payload_start - 1] != b' ' {
        return Err(LineError::MissingSeparator { at: payload_start });
    }

    // 从分隔空格继续向前，直到上一个空格或行首
    let sep = payload_start - 1;
    let type_start = line[..sep]
        .iter()
        .rposition(|&b| b == b' ')
        .map_or(0, |i| i + 1);
    let raw_type = &line[type_start..sep];
    if raw_type.is_empty() {
        return Err(LineError::EmptyType);
    }
    let stat_type = std::str::from_utf8(raw_type).map_err(|_| LineError::InvalidType)?;

    Ok(StatLine {
        stat_type,
        payload_start,
        payload: &line[payload_start..],
    })
}

/// 用新负载替换原负载，保留前缀（含分隔空格）
pub fn splice(line: &[u8], payload_start: usize, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload_start + payload.len() + 1);
    out.extend_from_slice(&line[..payload_start]);
    out.extend_from_slice(payload);
    out
}

/// 从行尾向前扫描，栈清空的位置就是负载起点
fn find_payload_start(line: &[u8]) -> std::result::Result<usize, LineError> {
    if !matches!(line.last(), Some(b'}' | b']' | b')')) {
        return Err(LineError::NoPayload);
    }

    let mut stack: Vec<u8> = Vec::new();
    for i in (0..line.len()).rev() {
        let c = line[i];
        match c {
            b'}' | b']' | b')' => stack.push(c),
            b'{' | b'[' | b'(' => {
                let Some(closer) = stack.pop() else {
                    return Err(LineError::Unbalanced);
                };
                if !closes(c, closer) {
                    return Err(LineError::BracketMismatch {
                        opener: c as char,
                        closer: closer as char,
                        at: i,
                    });
                }
                if stack.is_empty() {
                    return Ok(i);
                }
            }
            _ => {}
        }
    }

    Err(LineError::Unbalanced)
}

fn closes(opener: u8, closer: u8) -> bool {
    matches!(
        (opener, closer),
        (b'{', b'}') | (b'[', b']') | (b'[', b')') | (b'(', b')') | (b'(', b']')
    )
}
