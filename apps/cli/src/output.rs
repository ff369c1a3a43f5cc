//! Output formatting utilities

use crate::OutputFormat;
use dlsession_core::types::{SessionEvent, SessionSummary, Settings};
use serde::Serialize;

/// Print a value as pretty JSON, or through `human` otherwise
pub fn print_output<T: Serialize>(
    value: &T,
    format: OutputFormat,
    human: impl FnOnce(&T),
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Human => human(value),
    }
    Ok(())
}

/// One event per line, for consumers reading stdout as a stream
pub fn print_event_line(event: &SessionEvent) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

pub fn print_summary_line(summary: &SessionSummary) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(summary)?);
    Ok(())
}

pub fn print_settings(settings: &Settings) {
    println!("dlsession Configuration:");
    println!();
    println!("  Download directory: {}", settings.download_dir.display());
    println!("  Overwrite existing: {}", settings.overwrite);
    println!("  Connect timeout: {}s", settings.connect_timeout_secs);
    println!("  Read timeout: {}s", settings.read_timeout_secs);
    println!(
        "  Session timeout: {}",
        settings
            .timeout_secs
            .map(|s| format!("{}s", s))
            .unwrap_or_else(|| "None".to_string())
    );
    println!("  User agent: {}", settings.user_agent);
    println!("  Max redirects: {}", settings.max_redirects);
    println!("  Accept invalid certificates: {}", settings.accept_invalid_certs);
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}
