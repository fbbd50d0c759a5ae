//! 分段存储
//!
//! 文件命名：
//! ```text
//!   stats.log  →  stats.00.log        活动分段（永不压缩）
//!                 stats.01.log[.gz]   最新的封存分段
//!                 ...
//!                 stats.NN.log[.gz]   最旧的封存分段 (NN < num_files)
//! ```
//!
//! 轮转流程（写入前检查，活动分段大小 >= 软上限时触发）：
//! 1. 腾出 01：从 01 开始连续占用的分段按编号从大到小依次改名为 `编号+1`，
//!    没有空位时先删除最旧的 `num_files-1`；编号 >= num_files 的直接删除
//! 2. 封存活动分段：压缩到 `01.log.gz` 后删除原文件，或直接改名为 `01.log`
//! 3. 打开新的空活动分段
//!
//! 任何一步失败都返回错误，之后的写入会重试轮转。重试是可续做的：
//! 01 已空出时不再后移，压缩完成但原文件没删掉时不再重复压缩。

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::config::LogStatsConfig;
use crate::constants::{GZ_EXT, GZ_TMP_SUFFIX, LOG_EXT, SEGMENT_INDEX_WIDTH};
use crate::error::{Error, Result};
use crate::observer::StatsObserver;

/// 分段文件命名规则
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentName {
    dir: PathBuf,
    stem: String,
}

/// 目录中找到的一个分段文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub index: usize,
    pub compressed: bool,
    pub path: PathBuf,
}

impl SegmentName {
    /// 解析配置的文件名，去掉（或补上）`.log` 后缀
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = path.to_string_lossy();
        if raw.is_empty() || raw.ends_with(MAIN_SEPARATOR) || raw.ends_with('/') {
            return Err(Error::Validation(format!(
                "malformed log path '{}'",
                raw
            )));
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Validation(format!("malformed log path '{}'", raw)))?;

        let stem = file_name
            .strip_suffix(&format!(".{}", LOG_EXT))
            .unwrap_or(file_name);
        if stem.is_empty() {
            return Err(Error::Validation(format!(
                "log path '{}' has no file name",
                raw
            )));
        }

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        Ok(Self {
            dir,
            stem: stem.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// 指定编号的分段文件名，`.gz` 只用于编号 > 0
    pub fn path(&self, index: usize, compressed: bool) -> PathBuf {
        let gz = if compressed && index > 0 {
            format!(".{}", GZ_EXT)
        } else {
            String::new()
        };
        self.dir.join(format!(
            "{}.{:0width$}.{}{}",
            self.stem,
            index,
            LOG_EXT,
            gz,
            width = SEGMENT_INDEX_WIDTH
        ))
    }

    /// 活动分段
    pub fn active(&self) -> PathBuf {
        self.path(0, false)
    }

    /// 解析 `<stem>.<NN>.log[.gz]`，返回 (编号, 是否压缩)
    pub fn parse_index(&self, file_name: &str) -> Option<(usize, bool)> {
        let rest = file_name.strip_prefix(&self.stem)?.strip_prefix('.')?;
        let (digits, suffix) = rest.split_once('.')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        let compressed = if suffix == LOG_EXT {
            false
        } else if suffix.strip_suffix(GZ_EXT)?.strip_suffix('.')? == LOG_EXT {
            true
        } else {
            return None;
        };

        Some((digits.parse().ok()?, compressed))
    }

    /// 列出目录中属于该日志的全部分段，按编号升序
    pub fn list(&self) -> io::Result<Vec<SegmentFile>> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some((index, compressed)) = self.parse_index(name) {
                segments.push(SegmentFile {
                    index,
                    compressed,
                    path: entry.path(),
                });
            }
        }
        segments.sort_by_key(|s| (s.index, s.compressed));
        Ok(segments)
    }
}

/// 分段统计信息
#[derive(Debug, Clone)]
pub struct SegmentStats {
    pub active_path: PathBuf,
    pub active_size: u64,
    pub size_limit: u64,
    pub num_files: usize,
    pub compress: bool,
    pub durable: bool,
    pub appends: u64,
    pub rotations: u64,
}

impl fmt::Display for SegmentStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Stat Log Statistics:")?;
        writeln!(f, "  Active: {}", self.active_path.display())?;
        writeln!(
            f,
            "  Size: {} / {} bytes ({:.1}%)",
            self.active_size,
            self.size_limit,
            self.active_size as f64 / self.size_limit.max(1) as f64 * 100.0
        )?;
        writeln!(f, "  Max files: {}", self.num_files)?;
        writeln!(f, "  Compress: {}, Durable: {}", self.compress, self.durable)?;
        writeln!(f, "  Appends: {}", self.appends)?;
        writeln!(f, "  Rotations: {}", self.rotations)?;
        Ok(())
    }
}

/// 活动分段与轮转
pub struct SegmentStore {
    name: SegmentName,
    size_limit: u64,
    num_files: usize,
    compress: bool,
    durable: bool,
    file: Option<File>,
    /// 活动分段当前大小
    size: u64,
    appends: u64,
    rotations: u64,
    observer: Arc<dyn StatsObserver>,
    /// 已压缩出的封存副本，活动分段还没删掉（上次轮转中途失败）
    sealed_copy: Option<PathBuf>,
}

impl SegmentStore {
    /// 创建目录并打开（或创建）活动分段，大小从已有文件长度开始计
    pub fn open(config: &LogStatsConfig) -> Result<Self> {
        config.validate()?;
        let name = SegmentName::parse(&config.path)?;
        fs::create_dir_all(name.dir())?;

        let mut store = Self {
            name,
            size_limit: config.size_limit,
            num_files: config.num_files,
            compress: config.compress,
            durable: config.durable,
            file: None,
            size: 0,
            appends: 0,
            rotations: 0,
            observer: config.observer.clone(),
            sealed_copy: None,
        };
        let file = store.open_active()?;
        store.file = Some(file);
        Ok(store)
    }

    pub fn name(&self) -> &SegmentName {
        &self.name
    }

    pub fn set_durable(&mut self, durable: bool) {
        self.durable = durable;
    }

    /// 软上限：只在写入前检查，单条记录可以让文件超出上限
    pub fn needs_rotation(&self) -> bool {
        self.size >= self.size_limit
    }

    /// 需要时轮转，返回是否发生了轮转
    pub fn rotate_if_needed(&mut self) -> Result<bool> {
        if !self.needs_rotation() {
            return Ok(false);
        }
        self.rotate()?;
        Ok(true)
    }

    /// 追加一整行，不会拆分到两个分段
    pub fn append(&mut self, stat_type: &str, line: &[u8]) -> Result<()> {
        self.active_file()?.write_all(line)?;
        self.size += line.len() as u64;
        self.appends += 1;

        if self.durable {
            self.sync()?;
        }

        self.observer.on_append(stat_type, line.len());
        Ok(())
    }

    /// 同步活动分段到磁盘
    pub fn sync(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// 轮转：后移已封存分段，封存活动分段，打开新的活动分段
    pub fn rotate(&mut self) -> Result<()> {
        // 1. 腾出 01（上次只完成了压缩时 01 就是活动分段的副本，不能再动）
        if self.sealed_copy.is_none() {
            self.shift_sealed()?;
        }

        // 2. 关闭并封存活动分段
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        let sealed_path = self.seal_active()?;
        self.size = 0;
        self.rotations += 1;
        if let Some(path) = sealed_path {
            self.observer.on_rotate(&path);
        }

        // 3. 新的活动分段
        let file = self.open_active()?;
        self.file = Some(file);
        Ok(())
    }

    /// 把从 01 开始连续的分段整体后移一位
    ///
    /// 只移动到第一个空位为止：上次后移完成（或做了一半）后失败，
    /// 重试时不会把已经移过的分段再移一次。
    fn shift_sealed(&self) -> Result<()> {
        let mut sealed: Vec<SegmentFile> = Vec::new();
        for segment in self.name.list()? {
            if segment.index == 0 {
                continue;
            }
            if segment.index >= self.num_files {
                debug!("logstats: Dropping old segment {}", segment.path.display());
                fs::remove_file(&segment.path)?;
                continue;
            }
            sealed.push(segment);
        }

        let occupied = |index: usize| sealed.iter().any(|s| s.index == index);
        if !occupied(1) {
            return Ok(());
        }

        // 第一个空位之前的分段需要后移，没有空位时丢掉最旧的一个
        let top = match (1..self.num_files).find(|&i| !occupied(i)) {
            Some(gap) => gap - 1,
            None => {
                let oldest = self.num_files - 1;
                for segment in sealed.iter().filter(|s| s.index == oldest) {
                    debug!("logstats: Dropping old segment {}", segment.path.display());
                    fs::remove_file(&segment.path)?;
                }
                oldest - 1
            }
        };

        // 从大到小，保证改名目标不会覆盖还没移动的文件
        for index in (1..=top).rev() {
            for segment in sealed.iter().filter(|s| s.index == index) {
                let target = self.name.path(index + 1, segment.compressed);
                debug!(
                    "logstats: Renaming {} -> {}",
                    segment.path.display(),
                    target.display()
                );
                fs::rename(&segment.path, &target)?;
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> SegmentStats {
        SegmentStats {
            active_path: self.name.active(),
            active_size: self.size,
            size_limit: self.size_limit,
            num_files: self.num_files,
            compress: self.compress,
            durable: self.durable,
            appends: self.appends,
            rotations: self.rotations,
        }
    }

    /// 封存活动分段，返回封存后的文件（被丢弃时为 None）
    fn seal_active(&mut self) -> Result<Option<PathBuf>> {
        let active = self.name.active();
        if !active.exists() {
            return Ok(self.sealed_copy.take());
        }

        // 只保留一个分段时没有地方放旧数据
        if self.num_files == 1 {
            debug!("logstats: Discarding {}", active.display());
            fs::remove_file(&active)?;
            return Ok(None);
        }

        let target = self.name.path(1, self.compress);
        if self.compress {
            if self.sealed_copy.is_none() {
                let n = compress_file(&active, &target)?;
                debug!(
                    "logstats: Compressed {} bytes from {} into {}",
                    n,
                    active.display(),
                    target.display()
                );
                self.sealed_copy = Some(target.clone());
            }
            fs::remove_file(&active)?;
            self.sealed_copy = None;
        } else {
            debug!(
                "logstats: Renaming {} -> {}",
                active.display(),
                target.display()
            );
            fs::rename(&active, &target)?;
        }

        Ok(Some(target))
    }

    /// 取活动分段句柄，上次轮转中途失败时重新打开
    fn active_file(&mut self) -> Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => self.open_active()?,
        };
        Ok(self.file.insert(file))
    }

    fn open_active(&mut self) -> Result<File> {
        let path = self.name.active();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.size = file.metadata()?.len();
        debug!(
            "logstats: Opened log file {} ({} bytes)",
            path.display(),
            self.size
        );
        Ok(file)
    }
}

/// gzip 压缩整个文件，先写临时文件再改名，失败不会留下半个 `.gz`
fn compress_file(source: &Path, target: &Path) -> io::Result<u64> {
    let mut tmp = target.as_os_str().to_owned();
    tmp.push(GZ_TMP_SUFFIX);
    let tmp = PathBuf::from(tmp);

    match write_gzip(source, &tmp) {
        Ok(n) => {
            fs::rename(&tmp, target)?;
            Ok(n)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

fn write_gzip(source: &Path, target: &Path) -> io::Result<u64> {
    let mut reader = File::open(source)?;
    let out = File::create(target)?;
    let mut encoder = GzEncoder::new(BufWriter::new(out), Compression::default());
    let n = io::copy(&mut reader, &mut encoder)?;

    let mut out = encoder.finish()?;
    out.flush()?;
    out.get_ref().sync_all()?;
    Ok(n)
}
