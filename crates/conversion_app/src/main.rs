mod batch;
mod config;
mod convert;
mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use engine_logging::{engine_info, engine_warn};

use crate::convert::Html2MdConverter;
use crate::logging::LogTarget;

fn main() -> Result<()> {
    let target = LogTarget::terminal_and_file("conversion.log");
    if let Err(err) = logging::initialize(&target) {
        eprintln!("warning: {err}; logging to the terminal only");
        let _ = logging::initialize(&LogTarget { file: None, ..target });
    }

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("conversion.ron"));
    let config = config::load(&config_path);

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let outcome = runtime.block_on(batch::run(&config, &Html2MdConverter))?;

    let summary = &outcome.session.summary;
    engine_info!(
        "Session {:?}: {} written, {} failed, report at {:?}",
        summary.status,
        outcome.written.len(),
        summary.failed_conversions,
        outcome.report_path
    );
    engine_info!(
        "{} error(s) handled, {} recovered",
        outcome.errors.total_errors,
        outcome.errors.recovered_errors
    );
    for warning in &outcome.session.warnings {
        engine_warn!("{}", warning);
    }
    Ok(())
}
