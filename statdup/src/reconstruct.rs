//! 回放模式: 还原去重日志

use std::path::Path;

use anyhow::{Context, Result};
use logstats::TracingObserver;
use tracing::info;

pub fn run_reconstruct(input: &Path) -> Result<()> {
    info!("statdup: Reconstructing {}", input.display());

    let (output, summary) = logstats::reconstruct_file(input, &TracingObserver)
        .with_context(|| format!("Failed to reconstruct {}", input.display()))?;

    println!("{}", output.display());
    println!("  {}", summary);
    Ok(())
}
