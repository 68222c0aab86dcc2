//! One-shot subcommands. Each prints its result to stdout in the requested
//! format and returns errors for `main` to report.

pub(crate) mod experiment;
pub(crate) mod tick;

use serde::Serialize;

use crate::OutputFormat;

pub(crate) type CmdResult = Result<(), Box<dyn std::error::Error>>;

/// Print `value` as pretty JSON, or `text` otherwise.
pub(crate) fn emit<T: Serialize>(output: OutputFormat, value: &T, text: impl FnOnce() -> String) -> CmdResult {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => println!("{}", text()),
    }
    Ok(())
}
