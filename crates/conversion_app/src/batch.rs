use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use conversion_core::{
    ConversionId, ErrorContext, ErrorId, ErrorInfo, ItemMetadata, SessionId, SessionInfo,
};
use conversion_engine::{AtomicFileWriter, Engine, ErrorStatistics, SessionReport};
use engine_logging::{engine_info, engine_warn};
use serde_json::json;

use crate::config::AppConfig;
use crate::convert::Converter;

pub struct BatchOutcome {
    pub session: SessionReport,
    pub written: Vec<PathBuf>,
    pub errors: ErrorStatistics,
    pub report_path: PathBuf,
}

/// Convert every `.html`/`.htm` file in the input directory under one
/// supervised session, then export the diagnostic report.
pub async fn run(config: &AppConfig, converter: &dyn Converter) -> Result<BatchOutcome> {
    let engine = Engine::new(config.engine.clone()).context("invalid engine configuration")?;
    let inputs = discover(&config.input_dir)?;
    engine_info!(
        "Converting {} file(s) from {:?} to {:?}",
        inputs.len(),
        config.input_dir,
        config.output_dir
    );

    let monitor = engine.monitor();
    monitor.start_sampling();
    let session = monitor.start_session(
        SessionInfo::new("html-to-markdown", config.source.clone()).expecting(inputs.len()),
    );

    let mut written = Vec::new();
    for input in &inputs {
        if let Some(path) = convert_one(&engine, session, input, config, converter).await? {
            written.push(path);
        }
    }

    let report = monitor.complete_session(session)?;
    monitor.stop_sampling().await;
    let report_path = engine.export_diagnostic_report(config.report_path.as_deref())?;
    Ok(BatchOutcome {
        session: report,
        written,
        errors: engine.handler().statistics(),
        report_path,
    })
}

fn discover(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut inputs = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("cannot read input dir {dir:?}"))? {
        let path = entry?.path();
        let is_html = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("html") || e.eq_ignore_ascii_case("htm"));
        if is_html && path.is_file() {
            inputs.push(path);
        }
    }
    inputs.sort();
    Ok(inputs)
}

async fn convert_one(
    engine: &Engine,
    session: SessionId,
    input: &Path,
    config: &AppConfig,
    converter: &dyn Converter,
) -> Result<Option<PathBuf>> {
    let artifact = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let output = config.output_dir.join(input.with_extension("md").file_name().unwrap_or_default());

    let monitor = engine.monitor();
    let id = monitor.start_conversion(
        session,
        ItemMetadata::new(&artifact, "html", config.source.clone()),
    )?;
    let mut ctx = ErrorContext::new("file-access", "read")
        .with_conversion(id)
        .with_artifact(&artifact)
        .with_source(config.source.clone())
        .with_path(input)
        .with_output_path(output);

    let written = run_steps(engine, id, input, &mut ctx, converter).await?;

    let success = written.is_some();
    if !success {
        monitor
            .tracker()
            .record_session_warning(session, format!("{artifact} was not converted"))?;
    }
    monitor.complete_conversion(id, success, Some(json!({ "output": written })))?;
    Ok(written)
}

/// Read, convert and write one file. `Ok(None)` when a step failed for good.
async fn run_steps(
    engine: &Engine,
    id: ConversionId,
    input: &Path,
    ctx: &mut ErrorContext,
    converter: &dyn Converter,
) -> Result<Option<PathBuf>> {
    let read = supervised(engine, id, "read", "file-access", ctx, |ctx| {
        let path = ctx.path.as_deref().unwrap_or(input);
        fs::read_to_string(path).map_err(ErrorInfo::from)
    })
    .await?;
    let Some(html) = read else {
        return Ok(None);
    };

    let converted = supervised(engine, id, "convert", "convert", ctx, |ctx| {
        converter
            .to_markdown(&html, ctx.transform_mode)
            .map_err(|e| ErrorInfo::from_error(&e))
    })
    .await?;
    let Some(markdown) = converted else {
        return Ok(None);
    };

    supervised(engine, id, "write", "write-output", ctx, |ctx| {
        let target = ctx.output_path.clone().unwrap_or_default();
        AtomicFileWriter::for_path(&target)
            .and_then(|(writer, name)| writer.write(&name, &markdown))
            .map_err(|e| ErrorInfo::named("WriteError", format!("failed to write {target:?}: {e}")))
    })
    .await
}

/// Run `action` as step `step`, handing failures to the engine and retrying
/// with the recovered context. `Ok(None)` means the step failed for good.
async fn supervised<T>(
    engine: &Engine,
    id: ConversionId,
    step: &str,
    operation: &str,
    ctx: &mut ErrorContext,
    mut action: impl FnMut(&ErrorContext) -> Result<T, ErrorInfo>,
) -> Result<Option<T>> {
    ctx.operation = operation.to_string();
    ctx.phase = step.to_string();
    ctx.step = Some(step.to_string());

    // A repeat failure resumes the earlier record's attempt budget.
    let mut previous: Option<ErrorId> = None;
    let tries = engine.config().max_retry_attempts + 1;
    for _ in 0..tries {
        engine.monitor().start_step(id, step)?;
        match action(ctx) {
            Ok(value) => {
                engine.monitor().complete_step(id, step, None)?;
                return Ok(Some(value));
            }
            Err(error) => {
                let handled = match previous {
                    Some(earlier) => {
                        engine
                            .fail_step_again(id, step, earlier, error, ctx)
                            .await?
                    }
                    None => engine.fail_step(id, step, error, ctx).await?,
                };
                if !handled.recovered {
                    return Ok(None);
                }
                previous = Some(handled.error_id);
            }
        }
    }
    engine_warn!("Step {} kept failing after recovery; giving up", step);
    Ok(None)
}
