//! statdup - 统计日志工具
//!
//! 两种模式:
//! 1. reconstruct: 回放去重日志，输出每条都是全量快照的 `<名字>_duped.log`
//! 2. record: 从命令输出或标准输入读取 `<类型> <JSON>` 行，写入滚动统计日志

mod reconstruct;
mod record;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "statdup")]
#[command(about = "Stat log tool - record rotating stat logs or reconstruct deduplicated ones")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 详细输出
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// 回放去重日志（支持 .gz 分段）
    Reconstruct {
        /// 输入文件，可以有多个
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// 记录模式: 把 `<类型> <JSON>` 行写入统计日志
    Record {
        /// 产生统计行的命令，不指定时读标准输入
        #[arg(short, long)]
        cmd: Option<String>,

        /// JSON 配置文件
        #[arg(short = 'C', long)]
        config: Option<PathBuf>,

        /// 输出日志路径
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// 单个分段软上限（字节）
        #[arg(short, long)]
        size_limit: Option<u64>,

        /// 保留分段数 (1-99)
        #[arg(short, long)]
        num_files: Option<usize>,

        /// 时间戳格式 (strftime)
        #[arg(short, long)]
        ts_format: Option<String>,

        /// 每次写入后 fsync
        #[arg(long)]
        durable: bool,

        /// 封存分段不压缩
        #[arg(long)]
        no_compress: bool,

        /// 去重写入
        #[arg(short, long)]
        dedupe: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 设置日志
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Reconstruct { files } => {
            info!("statdup: Reconstruct mode, {} file(s)", files.len());
            for file in &files {
                reconstruct::run_reconstruct(file)?;
            }
        }
        Commands::Record {
            cmd,
            config,
            output,
            size_limit,
            num_files,
            ts_format,
            durable,
            no_compress,
            dedupe,
        } => {
            let config = record::build_config(record::ConfigOverrides {
                config: config.as_deref(),
                output,
                size_limit,
                num_files,
                ts_format,
                durable,
                no_compress,
                dedupe,
            })?;
            info!("statdup: Record mode, output file: {}", config.path.display());
            info!(
                "statdup: Size limit: {} bytes, {} files",
                config.size_limit, config.num_files
            );
            record::run_record(&config, cmd.as_deref()).await?;
        }
    }

    Ok(())
}
