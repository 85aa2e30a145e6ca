pub mod commands;
pub mod handlers;
pub mod output;

pub use commands::{AnalyzeArgs, CleanupArgs, CliArgs, Commands, ParseArgs, ResourceArgs};
pub use handlers::{run, CleanupScope, CommandOutput};
pub use output::{OutputFormat, OutputFormatter};
