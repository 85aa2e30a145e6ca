//! Command implementations
//!
//! Each handler returns the JSON document to print plus an exit code; [`run`] prints it.

use super::commands::{AnalyzeArgs, CleanupArgs, CliArgs, Commands, ParseArgs, ResourceArgs};
use super::output::{OutputFormat, OutputFormatter};
use crate::cache::{CacheStore, DataType, HealthStatus};
use crate::config::FailtraceConfig;
use crate::framework::FrameworkRegistry;
use crate::ingest::IngestionPipeline;
use crate::parsers::ParseOptions;
use crate::serve::{ResourceServer, ResponseStatus};
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error};

/// Command output before printing
pub struct CommandOutput {
    pub document: Value,
    pub exit_code: i32,
}

impl CommandOutput {
    fn ok(document: Value) -> Self {
        Self {
            document,
            exit_code: 0,
        }
    }
}

/// Run the selected command, print its document and return the process exit code
pub async fn run(args: &CliArgs) -> i32 {
    let format = if args.compact {
        OutputFormat::Compact
    } else {
        OutputFormat::Pretty
    };
    let formatter = OutputFormatter::new(format);

    let result = match load_config(args) {
        Ok(config) => dispatch(&args.command, &config).await,
        Err(e) => Err(e),
    };

    let (text, exit_code) = match result {
        Ok(output) => (formatter.format(&output.document), output.exit_code),
        Err(e) => {
            error!("{:#}", e);
            (formatter.format_error(&e), 1)
        }
    };
    match text {
        Ok(text) => println!("{text}"),
        Err(e) => {
            eprintln!("Error: {e:#}");
            return 1;
        }
    }
    exit_code
}

fn load_config(args: &CliArgs) -> Result<FailtraceConfig> {
    let mut config = FailtraceConfig::default();
    if let Some(db) = &args.db {
        config.db_path = db.clone();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.to_lowercase();
    }
    config.validate()?;
    debug!(config = %config, "Configuration loaded");
    Ok(config)
}

async fn dispatch(command: &Commands, config: &FailtraceConfig) -> Result<CommandOutput> {
    match command {
        Commands::Parse(args) => handle_parse(args),
        Commands::Analyze(args) => {
            let cache = config.open_store().await?;
            let output = handle_analyze(args, config, &cache).await;
            cache.close().await;
            output
        }
        Commands::Resource(args) => {
            let cache = config.open_store().await?;
            let output = handle_resource(args, &cache).await;
            cache.close().await;
            Ok(output)
        }
        Commands::Stats => {
            let cache = config.open_store().await?;
            let output = handle_stats(&cache).await;
            cache.close().await;
            output
        }
        Commands::Health => {
            let cache = config.open_store().await?;
            let output = handle_health(&cache).await;
            cache.close().await;
            Ok(output)
        }
        Commands::Cleanup(args) => {
            let cache = config.open_store().await?;
            let output = handle_cleanup(args, &cache).await;
            cache.close().await;
            output
        }
    }
}

pub async fn handle_analyze(
    args: &AnalyzeArgs,
    config: &FailtraceConfig,
    cache: &Arc<CacheStore>,
) -> Result<CommandOutput> {
    let client = config.create_client()?;
    let options = ParseOptions {
        include_traceback: !args.no_traceback,
        ..ParseOptions::default()
    };
    let pipeline = IngestionPipeline::new(
        Arc::clone(cache),
        Arc::new(FrameworkRegistry::with_defaults()),
        client,
    )
    .with_max_concurrent_jobs(args.max_concurrent_jobs.unwrap_or(config.max_concurrent_jobs))
    .with_parse_options(options);

    let report = pipeline
        .trigger_analysis(args.project_id, args.pipeline_id)
        .await
        .with_context(|| {
            format!(
                "Failed to analyze pipeline {} of project {}",
                args.pipeline_id, args.project_id
            )
        })?;
    Ok(CommandOutput::ok(serde_json::to_value(&report)?))
}

pub fn handle_parse(args: &ParseArgs) -> Result<CommandOutput> {
    let trace = read_trace(&args.file)?;
    let registry = FrameworkRegistry::with_defaults();
    let options = ParseOptions {
        exclude_paths: args.exclude_path.clone(),
        ..ParseOptions::default()
    };

    let framework = args
        .framework
        .unwrap_or_else(|| registry.detect_framework(&args.job_name, &args.stage, &trace));
    let result = registry.parse_with_framework(&trace, framework, &options);

    Ok(CommandOutput::ok(json!({
        "file": args.file.display().to_string(),
        "framework": framework,
        "detected": args.framework.is_none(),
        "result": result,
    })))
}

/// Job logs are not guaranteed to be valid UTF-8
fn read_trace(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read trace file {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub async fn handle_resource(args: &ResourceArgs, cache: &Arc<CacheStore>) -> CommandOutput {
    let server = ResourceServer::new(Arc::clone(cache));
    let response = server.get_resource(&args.address()).await;
    let exit_code = match response.status {
        ResponseStatus::Success => 0,
        ResponseStatus::NotCached => 3,
        ResponseStatus::Error => 1,
    };
    let document = serde_json::to_value(&response).unwrap_or_else(|e| {
        json!({ "status": "error", "uri": args.uri, "message": e.to_string() })
    });
    CommandOutput {
        document,
        exit_code,
    }
}

pub async fn handle_stats(cache: &CacheStore) -> Result<CommandOutput> {
    let stats = cache.get_stats().await?;
    let history = cache.cleanup_history(10).await?;
    Ok(CommandOutput::ok(json!({
        "stats": stats,
        "recent_cleanups": history,
    })))
}

pub async fn handle_health(cache: &CacheStore) -> CommandOutput {
    let report = cache.check_health().await;
    let exit_code = if report.status == HealthStatus::Critical {
        1
    } else {
        0
    };
    CommandOutput {
        document: serde_json::to_value(&report).unwrap_or_else(|e| json!({ "error": e.to_string() })),
        exit_code,
    }
}

/// Removal requested by `cleanup` flags; the most specific scope wins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupScope {
    All,
    Job(u64, u64),
    PipelineType(u64, u64, DataType),
    Pipeline(u64, u64),
    Project(u64),
    Type(DataType),
    OlderThan(u64),
    Expired,
}

impl CleanupScope {
    pub fn from_args(args: &CleanupArgs) -> Self {
        if args.all {
            return Self::All;
        }
        match (args.project, args.pipeline, args.job, args.data_type) {
            (Some(project), _, Some(job), _) => Self::Job(project, job),
            (Some(project), Some(pipeline), None, Some(data_type)) => {
                Self::PipelineType(project, pipeline, data_type)
            }
            (Some(project), Some(pipeline), None, None) => Self::Pipeline(project, pipeline),
            (Some(project), None, None, _) => Self::Project(project),
            (None, _, _, Some(data_type)) => Self::Type(data_type),
            _ => match args.older_than_hours {
                Some(hours) => Self::OlderThan(hours),
                None => Self::Expired,
            },
        }
    }

    fn operation(&self) -> String {
        match self {
            Self::All => "clear_all".to_string(),
            Self::Job(p, j) => format!("invalidate_job({p}, {j})"),
            Self::PipelineType(p, pl, t) => format!("invalidate_pipeline_type({p}, {pl}, {t})"),
            Self::Pipeline(p, pl) => format!("invalidate_pipeline({p}, {pl})"),
            Self::Project(p) => format!("invalidate_project({p})"),
            Self::Type(t) => format!("clear_cache_by_type({t})"),
            Self::OlderThan(h) => format!("clear_old_entries({h}h)"),
            Self::Expired => "cleanup_expired".to_string(),
        }
    }

    async fn apply(&self, cache: &CacheStore) -> Result<u64> {
        let removed = match *self {
            Self::All => cache.clear_all().await?,
            Self::Job(project, job) => cache.invalidate_job(project, job).await?,
            Self::PipelineType(project, pipeline, data_type) => {
                cache
                    .invalidate_pipeline_type(project, pipeline, data_type)
                    .await?
            }
            Self::Pipeline(project, pipeline) => {
                cache.invalidate_pipeline(project, pipeline).await?
            }
            Self::Project(project) => cache.invalidate_project(project).await?,
            Self::Type(data_type) => cache.clear_cache_by_type(data_type).await?,
            Self::OlderThan(hours) => {
                let hours = i64::try_from(hours).unwrap_or(i64::MAX / 3600);
                cache.clear_old_entries(chrono::Duration::hours(hours)).await?
            }
            Self::Expired => cache.cleanup_expired().await?,
        };
        Ok(removed)
    }
}

pub async fn handle_cleanup(args: &CleanupArgs, cache: &CacheStore) -> Result<CommandOutput> {
    let scope = CleanupScope::from_args(args);
    let removed = scope.apply(cache).await?;

    // --expired alongside a scoped removal also sweeps what is left
    let swept = if args.expired && scope != CleanupScope::Expired {
        Some(cache.cleanup_expired().await?)
    } else {
        None
    };

    Ok(CommandOutput::ok(json!({
        "operation": scope.operation(),
        "removed": removed,
        "expired_removed": swept,
    })))
}
