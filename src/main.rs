use failtrace::cli::{run, CliArgs};
use failtrace::util::logging::parse_level;
use failtrace::util::{init_logging, LoggingConfig};
use failtrace::VERSION;

use clap::Parser;
use tracing::{debug, Level};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logging(logging_config(&args));

    debug!("failtrace v{} starting", VERSION);
    debug!("Arguments: {:?}", args);

    let exit_code = run(&args).await;
    std::process::exit(exit_code);
}

/// Command-line flags override the environment
fn logging_config(args: &CliArgs) -> LoggingConfig {
    let config = LoggingConfig::from_env();
    if let Some(level) = args.log_level.as_deref().and_then(parse_level) {
        config.with_level(level)
    } else if args.verbose {
        config.with_level(Level::DEBUG)
    } else if args.quiet {
        config.with_level(Level::ERROR)
    } else {
        config
    }
}
