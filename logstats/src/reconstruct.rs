//! 去重日志回放
//!
//! 把去重写入的日志还原成每条都是全量快照的日志。三个线程通过两个有界队列串联：
//! ```text
//!   reader ──(行)──▶ transformer ──(行)──▶ writer
//!   按块读取         解码 + 补全 + 重新编码   缓冲写入，定期刷新
//! ```
//! 队列单生产者单消费者，输出行序与输入一致。
//! 格式不合法的行原样透传，只有读写失败会终止整个流程。

use std::collections::hash_map::{Entry, HashMap};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::panic;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;

use flate2::read::MultiGzDecoder;
use tracing::{error, info};

use crate::constants::{
    DUPED_SUFFIX, FLUSH_EVERY_LINES, GZ_EXT, QUEUE_CAPACITY, READ_CHUNK_SIZE, WRITE_BUFFER_SIZE,
};
use crate::error::{Error, Result};
use crate::line::{self, LineError};
use crate::observer::StatsObserver;
use crate::snapshot::Snapshot;

/// 单行的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// 该类型的第一条，本身就是全量，原样输出
    Baseline,
    /// 已用基线补全并重新编码
    Expanded,
    /// 不是统计行
    NotStat,
    /// 格式不合法，原样输出
    Malformed(LineError),
}

/// 单个文件的回放状态：每种类型最后一次的全量快照
#[derive(Debug, Default)]
pub struct Reconstructor {
    state: HashMap<String, Snapshot>,
}

impl Reconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 还原一行（不含换行符）
    pub fn reconstruct_line(&mut self, line: Vec<u8>) -> (Vec<u8>, LineOutcome) {
        let (stat_type, payload_start, snapshot) = match line::decode(&line) {
            Ok(stat) => match Snapshot::from_slice(stat.payload) {
                Ok(snapshot) => (stat.stat_type.to_string(), stat.payload_start, snapshot),
                Err(e) => {
                    let reason = LineError::InvalidPayload(e.to_string());
                    return (line, LineOutcome::Malformed(reason));
                }
            },
            Err(LineError::NotStatLine) => return (line, LineOutcome::NotStat),
            Err(e) => return (line, LineOutcome::Malformed(e)),
        };

        match self.state.entry(stat_type) {
            Entry::Vacant(slot) => {
                slot.insert(snapshot);
                (line, LineOutcome::Baseline)
            }
            Entry::Occupied(mut slot) => {
                let mut merged = snapshot;
                merged.fill_forward(slot.get());
                let payload = match merged.to_vec() {
                    Ok(p) => p,
                    Err(e) => {
                        let reason = LineError::InvalidPayload(e.to_string());
                        return (line, LineOutcome::Malformed(reason));
                    }
                };
                slot.insert(merged);
                (line::splice(&line, payload_start, &payload), LineOutcome::Expanded)
            }
        }
    }

    /// 已知的类型数
    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}

/// 回放统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconstructSummary {
    pub lines_read: u64,
    pub lines_written: u64,
    pub baseline: u64,
    pub expanded: u64,
    pub not_stat: u64,
    pub malformed: u64,
}

impl fmt::Display for ReconstructSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} lines read, {} written ({} baseline, {} expanded, {} non-stat, {} malformed)",
            self.lines_read,
            self.lines_written,
            self.baseline,
            self.expanded,
            self.not_stat,
            self.malformed
        )
    }
}

#[derive(Debug, Default)]
struct TransformCounts {
    baseline: u64,
    expanded: u64,
    not_stat: u64,
    malformed: u64,
}

/// 回放整个输入流到输出流
///
/// 读失败返回 `Error::Read`，写失败返回 `Error::Write`，两者都在所有线程退出后才返回。
pub fn reconstruct<R, W>(
    source: R,
    sink: W,
    observer: &dyn StatsObserver,
) -> Result<ReconstructSummary>
where
    R: Read + Send,
    W: Write + Send,
{
    let (line_tx, line_rx) = mpsc::sync_channel::<Vec<u8>>(QUEUE_CAPACITY);
    let (out_tx, out_rx) = mpsc::sync_channel::<Vec<u8>>(QUEUE_CAPACITY);

    let (read, counts, written) = thread::scope(|s| {
        let reader = s.spawn(move || read_lines(source, line_tx));
        let transformer = s.spawn(move || transform(line_rx, out_tx, observer));
        let writer = s.spawn(move || write_lines(sink, out_rx, observer));

        (join(reader), join(transformer), join(writer))
    });

    let lines_read = read.map_err(|e| {
        error!("logstats: Reader stage failed: {}", e);
        Error::Read(e)
    })?;
    let lines_written = written.map_err(|e| {
        error!("logstats: Writer stage failed: {}", e);
        Error::Write(e)
    })?;

    Ok(ReconstructSummary {
        lines_read,
        lines_written,
        baseline: counts.baseline,
        expanded: counts.expanded,
        not_stat: counts.not_stat,
        malformed: counts.malformed,
    })
}

/// 回放文件，输出到同目录的 `<名字>_duped.log`，`.gz` 源文件自动解压
pub fn reconstruct_file<P: AsRef<Path>>(
    source: P,
    observer: &dyn StatsObserver,
) -> Result<(PathBuf, ReconstructSummary)> {
    let source = source.as_ref();
    let output = duped_path(source);

    let file = File::open(source).map_err(Error::Read)?;
    let input: Box<dyn Read + Send> = if source.extension().is_some_and(|e| e == GZ_EXT) {
        Box::new(MultiGzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(file)
    };

    let mut out = File::create(&output).map_err(Error::Write)?;
    info!(
        "logstats: Reconstructing {} -> {}",
        source.display(),
        output.display()
    );

    let summary = reconstruct(input, &mut out, observer)?;
    out.sync_all().map_err(Error::Write)?;

    info!("logstats: {}", summary);
    Ok((output, summary))
}

/// 输出文件名：去掉 `.gz` 和最后一个扩展名，加上 `_duped.log`
pub fn duped_path<P: AsRef<Path>>(source: P) -> PathBuf {
    let source = source.as_ref();
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = name
        .strip_suffix(&format!(".{}", GZ_EXT))
        .unwrap_or(name.as_str());
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    source.with_file_name(format!("{}{}", stem, DUPED_SUFFIX))
}

fn join<T>(handle: thread::ScopedJoinHandle<'_, T>) -> T {
    handle.join().unwrap_or_else(|e| panic::resume_unwind(e))
}

/// 阶段 1：按块读取，切成行（保留换行符），最后一行没有换行也照样输出
fn read_lines<R: Read>(mut source: R, tx: SyncSender<Vec<u8>>) -> io::Result<u64> {
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    let mut pending: Vec<u8> = Vec::new();
    let mut count = 0u64;

    loop {
        let n = match source.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        let data = &chunk[..n];
        let mut start = 0;
        while let Some(pos) = data[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos + 1;
            pending.extend_from_slice(&data[start..end]);
            count += 1;
            if tx.send(std::mem::take(&mut pending)).is_err() {
                // 下游已退出，错误由下游报告
                return Ok(count);
            }
            start = end;
        }
        pending.extend_from_slice(&data[start..]);
    }

    if !pending.is_empty() {
        count += 1;
        let _ = tx.send(pending);
    }
    Ok(count)
}

/// 阶段 2：逐行还原
fn transform(
    rx: Receiver<Vec<u8>>,
    tx: SyncSender<Vec<u8>>,
    observer: &dyn StatsObserver,
) -> TransformCounts {
    let mut rebuilder = Reconstructor::new();
    let mut counts = TransformCounts::default();
    let mut line_no = 0u64;

    for mut line in rx {
        line_no += 1;
        let terminated = line.last() == Some(&b'\n');
        if terminated {
            line.pop();
        }

        let (mut out, outcome) = rebuilder.reconstruct_line(line);
        match outcome {
            LineOutcome::Baseline => counts.baseline += 1,
            LineOutcome::Expanded => counts.expanded += 1,
            LineOutcome::NotStat => counts.not_stat += 1,
            LineOutcome::Malformed(reason) => {
                counts.malformed += 1;
                observer.on_passthrough(line_no, &reason);
            }
        }

        if terminated {
            out.push(b'\n');
        }
        if tx.send(out).is_err() {
            break;
        }
    }

    counts
}

/// 阶段 3：缓冲写入，每 FLUSH_EVERY_LINES 行刷新一次并报告进度
fn write_lines<W: Write>(
    sink: W,
    rx: Receiver<Vec<u8>>,
    observer: &dyn StatsObserver,
) -> io::Result<u64> {
    let mut out = BufWriter::with_capacity(WRITE_BUFFER_SIZE, sink);
    let mut count = 0u64;

    for line in rx {
        out.write_all(&line)?;
        count += 1;
        if count % FLUSH_EVERY_LINES == 0 {
            out.flush()?;
            observer.on_progress(count);
        }
    }

    out.flush()?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;
    use std::sync::Mutex;

    fn run(input: &[u8]) -> (Vec<u8>, ReconstructSummary) {
        let mut out = Vec::new();
        let summary = reconstruct(input, &mut out, &NoopObserver).unwrap();
        (out, summary)
    }

    #[test]
    fn test_two_line_fill_forward() {
        let input = b"2024-05-01T10:00:00 kStats {\"k1\":10,\"k2\":\"V2\"}\n\
                      2024-05-01T10:00:01 kStats {\"k1\":99}\n";
        let (out, summary) = run(input);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], r#"2024-05-01T10:00:00 kStats {"k1":10,"k2":"V2"}"#);
        assert_eq!(lines[1], r#"2024-05-01T10:00:01 kStats {"k1":99,"k2":"V2"}"#);
        assert_eq!(summary.baseline, 1);
        assert_eq!(summary.expanded, 1);
    }

    #[test]
    fn test_types_tracked_separately() {
        let input = b"1 a {\"x\":1,\"y\":2}\n\
                      2 b {\"x\":5}\n\
                      3 a {\"y\":3}\n\
                      4 b {}\n";
        let (out, _) = run(input);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "1 a {\"x\":1,\"y\":2}\n2 b {\"x\":5}\n3 a {\"x\":1,\"y\":3}\n4 b {\"x\":5}\n"
        );
    }

    #[test]
    fn test_nested_fill_forward() {
        let input = b"1 kStats {\"k1\":10,\"k3\":{\"k31\":310,\"k32\":\"V\"}}\n\
                      2 kStats {\"k3\":{\"k31\":1}}\n";
        let (out, _) = run(input);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text.lines().nth(1),
            Some(r#"2 kStats {"k1":10,"k3":{"k31":1,"k32":"V"}}"#)
        );
    }

    #[test]
    fn test_passthrough_lines() {
        let input = b"hello world\n\
                      \n\
                      2024 kStats no payload\n\
                      2024 kStats {\"a\":[1}}\n\
                      2024 kStats [1,2]\n\
                      2024 kStats {\"a\":1}\n";
        let (out, summary) = run(input);
        assert_eq!(out, input.to_vec());
        assert_eq!(summary.not_stat, 2);
        assert_eq!(summary.malformed, 3);
        assert_eq!(summary.baseline, 1);
        assert_eq!(summary.lines_read, 6);
        assert_eq!(summary.lines_written, 6);
    }

    #[test]
    fn test_trailing_line_without_newline() {
        let input = b"1 t {\"a\":1,\"b\":2}\n2 t {\"a\":5}";
        let (out, summary) = run(input);
        assert_eq!(out, b"1 t {\"a\":1,\"b\":2}\n2 t {\"a\":5,\"b\":2}".to_vec());
        assert_eq!(summary.lines_read, 2);
    }

    #[test]
    fn test_order_preserved_beyond_queue_capacity() {
        let total = QUEUE_CAPACITY * 2 + 500;
        let mut input = Vec::new();
        input.extend_from_slice(b"0 seq {\"n\":0,\"tag\":\"first\"}\n");
        for n in 1..total {
            input.extend_from_slice(format!("{} seq {{\"n\":{}}}\n", n, n).as_bytes());
        }

        let (out, summary) = run(&input);
        assert_eq!(summary.lines_written, total as u64);
        assert_eq!(summary.expanded, total as u64 - 1);

        let text = String::from_utf8(out).unwrap();
        for (n, line) in text.lines().enumerate() {
            let expected = if n == 0 {
                "0 seq {\"n\":0,\"tag\":\"first\"}".to_string()
            } else {
                format!("{} seq {{\"n\":{},\"tag\":\"first\"}}", n, n)
            };
            assert_eq!(line, expected);
        }
    }

    struct FailingReader {
        sent: bool,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.sent {
                return Err(io::Error::new(io::ErrorKind::Other, "disk gone"));
            }
            self.sent = true;
            let data = b"1 t {\"a\":1}\n";
            buf[..data.len()].copy_from_slice(data);
            Ok(data.len())
        }
    }

    #[test]
    fn test_read_error_aborts() {
        let mut out = Vec::new();
        let result = reconstruct(FailingReader { sent: false }, &mut out, &NoopObserver);
        assert!(matches!(result, Err(Error::Read(_))));
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "no space"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "no space"))
        }
    }

    #[test]
    fn test_write_error_aborts() {
        let input = b"1 t {\"a\":1}\n".repeat(100);
        let result = reconstruct(&input[..], FailingWriter, &NoopObserver);
        assert!(matches!(result, Err(Error::Write(_))));
    }

    #[derive(Default)]
    struct Recorder {
        passthrough: Mutex<Vec<u64>>,
        progress: Mutex<Vec<u64>>,
    }

    impl StatsObserver for Recorder {
        fn on_passthrough(&self, line_no: u64, _reason: &LineError) {
            self.passthrough.lock().unwrap().push(line_no);
        }

        fn on_progress(&self, lines: u64) {
            self.progress.lock().unwrap().push(lines);
        }
    }

    #[test]
    fn test_observer_callbacks() {
        let mut input = b"1 t {\"a\":1}\n2 t oops\n".to_vec();
        for _ in 0..FLUSH_EVERY_LINES {
            input.extend_from_slice(b"x\n");
        }

        let recorder = Recorder::default();
        let mut out = Vec::new();
        reconstruct(&input[..], &mut out, &recorder).unwrap();

        assert_eq!(*recorder.passthrough.lock().unwrap(), vec![2]);
        assert_eq!(*recorder.progress.lock().unwrap(), vec![FLUSH_EVERY_LINES]);
    }

    #[test]
    fn test_reconstruct_line_outcomes() {
        let mut r = Reconstructor::new();
        let (_, o) = r.reconstruct_line(b"not a stat".to_vec());
        assert_eq!(o, LineOutcome::NotStat);

        let (_, o) = r.reconstruct_line(b"1 t {\"a\":".to_vec());
        assert_eq!(o, LineOutcome::Malformed(LineError::NoPayload));

        let (_, o) = r.reconstruct_line(b"1 t {\"a\" 1}".to_vec());
        assert!(matches!(o, LineOutcome::Malformed(LineError::InvalidPayload(_))));
        assert!(r.is_empty());

        let (_, o) = r.reconstruct_line(b"1 t {\"a\":1}".to_vec());
        assert_eq!(o, LineOutcome::Baseline);
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn test_duped_path() {
        assert_eq!(
            duped_path("/data/stats.00.log"),
            PathBuf::from("/data/stats.00_duped.log")
        );
        assert_eq!(
            duped_path("/data/stats.02.log.gz"),
            PathBuf::from("/data/stats.02_duped.log")
        );
        assert_eq!(duped_path("raw"), PathBuf::from("raw_duped.log"));
    }
}
