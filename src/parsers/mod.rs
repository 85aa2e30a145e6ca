//! Framework-specific trace parsers
//!
//! Every parser turns raw job trace text into a [`ParseResult`]. Parsing is best-effort
//! pattern matching: unexpected input yields fewer records, never an error or a panic,
//! and identical input always yields an identical result.

pub mod clean;
pub mod django;
pub mod generic;
pub mod jest;
pub mod pytest;
pub mod sonarqube;
mod types;

pub use django::DjangoPytestParser;
pub use generic::GenericParser;
pub use jest::JestParser;
pub use pytest::PytestParser;
pub use sonarqube::SonarQubeParser;
pub use types::*;

use crate::framework::TestFramework;

/// Converts trace text into normalized records for one framework
pub trait LogParser: Send + Sync {
    /// Tag reported in [`ParseResult::parser_type`]
    fn parser_type(&self) -> &'static str;

    fn framework(&self) -> TestFramework;

    fn parse(&self, trace: &str, options: &ParseOptions) -> ParseResult;
}
