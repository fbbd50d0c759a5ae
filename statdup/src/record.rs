//! 记录模式: 读取 `<类型> <JSON>` 行写入统计日志

use anyhow::{bail, Context, Result};
use logstats::{LogStatsConfig, Snapshot, StatLog};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// 命令行对配置文件的覆盖项
pub struct ConfigOverrides<'a> {
    pub config: Option<&'a Path>,
    pub output: Option<PathBuf>,
    pub size_limit: Option<u64>,
    pub num_files: Option<usize>,
    pub ts_format: Option<String>,
    pub durable: bool,
    pub no_compress: bool,
    pub dedupe: bool,
}

/// 先加载配置文件（可选），再用命令行参数覆盖
pub fn build_config(opts: ConfigOverrides<'_>) -> Result<LogStatsConfig> {
    let mut config = match opts.config {
        Some(path) => {
            info!("statdup: Loading config from {}", path.display());
            LogStatsConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?
        }
        None => LogStatsConfig::default(),
    };

    if let Some(output) = opts.output {
        config.path = output;
    }
    if let Some(size_limit) = opts.size_limit {
        config.size_limit = size_limit;
    }
    if let Some(num_files) = opts.num_files {
        config.num_files = num_files;
    }
    if let Some(ts_format) = opts.ts_format {
        config.ts_format = ts_format;
    }
    config.durable |= opts.durable;
    config.compress &= !opts.no_compress;
    config.dedupe |= opts.dedupe;

    config.validate()?;
    Ok(config)
}

/// 解析一行 `<类型> <JSON 对象>`
pub fn parse_record(line: &str) -> Result<(&str, Snapshot)> {
    let line = line.trim();
    let Some((stat_type, payload)) = line.split_once(' ') else {
        bail!("expected '<type> <json>'");
    };
    if stat_type.is_empty() {
        bail!("empty stat type");
    }
    let snapshot = Snapshot::from_slice(payload.trim().as_bytes())?;
    Ok((stat_type, snapshot))
}

/// 运行记录模式
pub async fn run_record(config: &LogStatsConfig, cmd: Option<&str>) -> Result<()> {
    let log = logstats::open(config)
        .with_context(|| format!("Failed to open {}", config.path.display()))?;

    info!(
        "statdup: Dedupe {}, compress {}, durable {}",
        config.dedupe, config.compress, config.durable
    );
    info!("statdup: Press Ctrl+C to stop");

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("statdup: Received Ctrl+C, stopping...");
            running_clone.store(false, Ordering::SeqCst);
        }
    });

    // 统计行来源：子进程输出或标准输入
    let (mut child, input): (Option<Child>, Box<dyn Read + Send>) = match cmd {
        Some(cmd) => {
            info!("statdup: Recording from '{}'", cmd);
            let mut child = Command::new("sh")
                .arg("-c")
                .arg(cmd)
                .stdout(Stdio::piped())
                .spawn()
                .with_context(|| format!("Failed to start '{}'", cmd))?;
            let stdout = child
                .stdout
                .take()
                .context("child stdout not captured")?;
            (Some(child), Box::new(stdout))
        }
        None => {
            info!("statdup: Recording from stdin");
            (None, Box::new(io::stdin()))
        }
    };

    // 使用通道在读取线程和主线程之间传递数据
    let (tx, rx) = mpsc::channel::<String>();

    // 读取线程
    let reader_thread = thread::spawn(move || {
        let input = BufReader::new(input);
        for line in input.lines() {
            match line {
                Ok(l) => {
                    if tx.send(l).is_err() {
                        break; // 接收端已关闭
                    }
                }
                Err(e) => {
                    warn!("statdup: Read error: {}", e);
                    break;
                }
            }
        }
    });

    // 接收与写入都会阻塞（fsync、压缩），放到阻塞线程池
    let pump_running = running.clone();
    let (log, counts) = tokio::task::spawn_blocking(move || {
        let counts = pump_lines(log.as_ref(), &rx, &pump_running);
        (log, counts)
    })
    .await
    .context("record loop panicked")?;
    let synced = log.sync();

    // 终止子进程，读取线程随管道关闭退出
    match child.as_mut() {
        Some(child) => {
            if let Err(e) = child.kill() {
                warn!("statdup: Failed to kill child process: {}", e);
            }
            let _ = child.wait();
            let _ = reader_thread.join();
        }
        // 阻塞在标准输入上的读取无法打断，随进程退出
        None => drop(reader_thread),
    }

    let counts = counts?;
    synced?;

    info!(
        "statdup: Done. {} lines, {} written, {} skipped",
        counts.lines, counts.written, counts.skipped
    );
    info!("statdup: {}", log.stats());

    Ok(())
}

#[derive(Debug, Default, PartialEq)]
struct RecordCounts {
    lines: u64,
    written: u64,
    skipped: u64,
}

/// 从通道取行写入日志，直到输入结束或收到停止信号
fn pump_lines(
    log: &dyn StatLog,
    rx: &mpsc::Receiver<String>,
    running: &AtomicBool,
) -> Result<RecordCounts> {
    let mut counts = RecordCounts::default();
    let check_interval = Duration::from_millis(100);

    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(check_interval) {
            Ok(line) => {
                counts.lines += 1;
                if line.trim().is_empty() {
                    continue;
                }

                match parse_record(&line) {
                    Ok((stat_type, snapshot)) => {
                        log.write(stat_type, &snapshot)?;
                        counts.written += 1;
                    }
                    Err(e) => {
                        warn!("statdup: Skipping line {}: {}", counts.lines, e);
                        counts.skipped += 1;
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                // 读取线程结束
                break;
            }
        }
    }

    Ok(counts)
}
