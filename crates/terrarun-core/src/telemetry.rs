//! Log output for the terrarun binary.
//!
//! Results are printed on stdout, so every log line goes to stderr. When
//! `RUST_LOG` is unset the chosen level applies to terrarun's own crates and
//! everything else logs at `warn`.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Shape of the log lines written to stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line, tagged with the enclosing invocation span.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}' (expected text or json)")),
        }
    }
}

const OWN_TARGETS: [&str; 4] = ["terrarun", "terrarun_core", "terrarun_locking", "terrarun_runner"];

fn default_filter(level: Level) -> EnvFilter {
    let level = level.as_str().to_ascii_lowercase();
    let directives = OWN_TARGETS
        .iter()
        .fold(String::from("warn"), |acc, target| format!("{acc},{target}={level}"));
    EnvFilter::new(directives)
}

/// Install the global subscriber.
///
/// Returns `false` if a subscriber was already installed; the existing one
/// is left in place.
pub fn init_tracing(format: LogFormat, level: Level) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .try_init(),
    };
    installed.is_ok()
}
