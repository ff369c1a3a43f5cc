//! Terminal host: progress bar, overwrite confirmation and credential prompt

use crate::output::format_bytes;
use console::style;
use dialoguer::{Confirm, Input, Password};
use dlsession_core::types::{ByteTotal, Credentials, Outcome};
use dlsession_core::{CredentialPrompt, SessionHost};
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}";
const SPINNER_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {bytes} ({bytes_per_sec}) {msg}";

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template(SPINNER_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Renders one session on the terminal
pub struct TerminalHost {
    bar: ProgressBar,
    /// Whether the bar has switched to a known length
    sized: Mutex<bool>,
}

impl TerminalHost {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(spinner_style());
        bar.enable_steady_tick(Duration::from_millis(120));
        Self {
            bar,
            sized: Mutex::new(false),
        }
    }

    /// Prompt bound to this host's bar, so questions do not fight the redraw
    pub fn prompt(&self) -> TerminalPrompt {
        TerminalPrompt {
            bar: self.bar.clone(),
        }
    }
}

impl Default for TerminalHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHost for TerminalHost {
    fn on_status_changed(&self, text: &str) {
        self.bar.set_message(text.to_string());
    }

    fn on_progress(&self, received: u64, total: ByteTotal) {
        if let ByteTotal::Known(total) = total {
            let mut sized = self.sized.lock();
            if !*sized {
                self.bar.set_style(bar_style());
                *sized = true;
            }
            self.bar.set_length(total);
        }
        self.bar.set_position(received);
    }

    fn on_terminal(&self, outcome: &Outcome) {
        match outcome {
            Outcome::Completed { path, bytes } => {
                self.bar.finish_with_message(format!(
                    "{} Saved {} ({})",
                    style("✓").green().bold(),
                    style(path.display()).cyan(),
                    format_bytes(*bytes)
                ));
            }
            Outcome::Failed { reason, .. } => {
                self.bar.abandon_with_message(format!(
                    "{} Failed: {}",
                    style("✗").red().bold(),
                    reason
                ));
            }
            Outcome::Cancelled => {
                self.bar
                    .abandon_with_message(format!("{} Cancelled", style("○").dim()));
            }
        }
    }

    fn confirm_overwrite(&self, path: &Path) -> bool {
        self.bar.suspend(|| {
            Confirm::new()
                .with_prompt(format!("{} already exists. Overwrite?", path.display()))
                .default(false)
                .interact()
                .unwrap_or_else(|e| {
                    warn!("Overwrite prompt failed: {}", e);
                    false
                })
        })
    }
}

/// Asks for a username and password on the terminal
pub struct TerminalPrompt {
    bar: ProgressBar,
}

impl CredentialPrompt for TerminalPrompt {
    fn request_credentials(&self, realm: &str, host: &str) -> Option<Credentials> {
        self.bar.suspend(|| {
            eprintln!(
                "{} {} requires a login ({})",
                style("🔒").yellow(),
                style(host).cyan(),
                realm
            );

            let username: String = Input::new()
                .with_prompt("Username")
                .allow_empty(true)
                .interact_text()
                .map_err(|e| warn!("Username prompt failed: {}", e))
                .ok()?;
            if username.trim().is_empty() {
                return None;
            }

            let password = Password::new()
                .with_prompt("Password")
                .allow_empty_password(true)
                .interact()
                .map_err(|e| warn!("Password prompt failed: {}", e))
                .ok()?;

            Some(Credentials::new(username, password))
        })
    }
}
