use crate::cache::DataType;
use crate::framework::TestFramework;
use crate::serve::ResponseMode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Framework-aware CI job log parser with a cache-first failure store
#[derive(Parser, Debug)]
#[command(
    name = "failtrace",
    about = "Framework-aware CI job log parser with a cache-first failure store",
    version,
    author,
    long_about = "failtrace ingests the failed jobs of a GitLab pipeline, detects the test \
                  framework behind each job log, parses it into normalized error records and \
                  stores them in a local SQLite cache. Cached results are then served through \
                  gl:// resource addresses without contacting GitLab again."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(short = 'v', long, global = true, help = "Enable debug logging")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - only log errors"
    )]
    pub quiet: bool,

    #[arg(
        long,
        global = true,
        value_name = "FILE",
        help = "Cache database path (overrides FAILTRACE_DB_PATH)"
    )]
    pub db: Option<PathBuf>,

    #[arg(long, global = true, help = "Print single-line JSON")]
    pub compact: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Analyze the failed jobs of a pipeline",
        long_about = "Fetches the pipeline and its failed jobs from GitLab, parses every job \
                      trace and stores the results. Jobs whose trace is unchanged are reported \
                      as cached.\n\n\
                      Examples:\n  \
                      failtrace analyze 123 4567\n  \
                      failtrace analyze 123 4567 --max-concurrent-jobs 8"
    )]
    Analyze(AnalyzeArgs),

    #[command(
        about = "Parse a local job log",
        long_about = "Detects the framework of a trace file and prints the parse result. \
                      Nothing is stored.\n\n\
                      Examples:\n  \
                      failtrace parse job.log --job-name unit-tests\n  \
                      failtrace parse job.log --framework pytest"
    )]
    Parse(ParseArgs),

    #[command(
        about = "Read a cached resource",
        long_about = "Serves a gl:// resource from the cache only.\n\n\
                      Examples:\n  \
                      failtrace resource gl://pipeline/123/4567\n  \
                      failtrace resource 'gl://job/123/890/errors?mode=fixing'"
    )]
    Resource(ResourceArgs),

    #[command(about = "Show cache statistics")]
    Stats,

    #[command(about = "Check cache store health")]
    Health,

    #[command(
        about = "Remove cache entries",
        long_about = "Removes entries by scope. Without options, only expired entries are \
                      removed.\n\n\
                      Examples:\n  \
                      failtrace cleanup --expired\n  \
                      failtrace cleanup --project 123 --pipeline 4567\n  \
                      failtrace cleanup --type resource\n  \
                      failtrace cleanup --older-than-hours 72"
    )]
    Cleanup(CleanupArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct AnalyzeArgs {
    #[arg(value_name = "PROJECT", help = "GitLab project id")]
    pub project_id: u64,

    #[arg(value_name = "PIPELINE", help = "Pipeline id")]
    pub pipeline_id: u64,

    #[arg(
        long,
        value_name = "N",
        help = "Jobs ingested in parallel (overrides FAILTRACE_MAX_CONCURRENT_JOBS)"
    )]
    pub max_concurrent_jobs: Option<usize>,

    #[arg(long, help = "Drop extracted traceback frames from stored records")]
    pub no_traceback: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct ParseArgs {
    #[arg(value_name = "FILE", help = "Trace file to parse")]
    pub file: PathBuf,

    #[arg(long, default_value = "", help = "Job name used for detection")]
    pub job_name: String,

    #[arg(long, default_value = "", help = "Job stage used for detection")]
    pub stage: String,

    #[arg(
        long,
        value_parser = parse_framework,
        help = "Skip detection and use this framework"
    )]
    pub framework: Option<TestFramework>,

    #[arg(long, value_name = "PATH", help = "Extra path fragment treated as third-party code")]
    pub exclude_path: Vec<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct ResourceArgs {
    #[arg(value_name = "URI", help = "Resource address, e.g. gl://pipeline/123/4567")]
    pub uri: String,

    #[arg(
        long,
        value_parser = parse_mode,
        help = "Response mode (minimal, balanced, fixing, full)"
    )]
    pub mode: Option<ResponseMode>,
}

impl ResourceArgs {
    /// Address with `--mode` applied as a query, unless the address already names a mode
    pub fn address(&self) -> String {
        match self.mode {
            Some(mode) if !self.uri.contains("mode=") => {
                let separator = if self.uri.contains('?') { '&' } else { '?' };
                format!("{}{separator}mode={mode}", self.uri)
            }
            _ => self.uri.clone(),
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct CleanupArgs {
    #[arg(long, value_name = "ID", help = "Invalidate one project")]
    pub project: Option<u64>,

    #[arg(
        long,
        value_name = "ID",
        requires = "project",
        conflicts_with = "job",
        help = "Invalidate one pipeline of --project"
    )]
    pub pipeline: Option<u64>,

    #[arg(
        long,
        value_name = "ID",
        requires = "project",
        help = "Invalidate one job of --project"
    )]
    pub job: Option<u64>,

    #[arg(
        long = "type",
        value_name = "TYPE",
        value_parser = parse_data_type,
        help = "Remove every entry of one data type, or of one type within --pipeline"
    )]
    pub data_type: Option<DataType>,

    #[arg(long, value_name = "HOURS", help = "Remove entries older than this")]
    pub older_than_hours: Option<u64>,

    #[arg(long, help = "Remove expired entries")]
    pub expired: bool,

    #[arg(long, help = "Remove everything")]
    pub all: bool,
}

fn parse_framework(s: &str) -> Result<TestFramework, String> {
    s.parse()
}

fn parse_mode(s: &str) -> Result<ResponseMode, String> {
    s.parse()
}

fn parse_data_type(s: &str) -> Result<DataType, String> {
    s.parse()
}
