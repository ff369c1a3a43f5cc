//! CLI command implementations

use crate::output::{print_event_line, print_output, print_settings, print_summary_line};
use crate::progress::TerminalHost;
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, Result};
use console::style;
use dlsession_core::config::{get_setting, set_setting};
use dlsession_core::types::{Credentials, OverwritePolicy, Outcome, SessionEvent, Settings};
use dlsession_core::{
    BroadcastHost, CredentialPrompt, DestinationPolicy, DownloadSession, HttpTransport,
    RefuseCredentials, SessionHost, SettingsStore, StaticCredentials,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

// ============================================================================
// Download Command
// ============================================================================

/// Per-run overrides from the `get` command line
pub struct GetOptions {
    pub url: String,
    pub output_dir: Option<PathBuf>,
    pub force: bool,
    pub timeout: Option<u64>,
    pub insecure: bool,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl GetOptions {
    fn apply(&self, settings: &mut Settings) {
        if let Some(dir) = &self.output_dir {
            settings.download_dir = dir.clone();
        }
        if self.force {
            settings.overwrite = OverwritePolicy::Always;
        }
        if self.timeout.is_some() {
            settings.timeout_secs = self.timeout;
        }
        if self.insecure {
            settings.accept_invalid_certs = true;
        }
    }

    fn credentials(&self) -> Option<Credentials> {
        self.user.as_ref().map(|user| {
            Credentials::new(user.clone(), self.password.clone().unwrap_or_default())
        })
    }
}

pub async fn get(store: &SettingsStore, options: GetOptions, format: OutputFormat) -> Result<Outcome> {
    let mut settings = store.load().await?;
    options.apply(&mut settings);

    let transport = Arc::new(HttpTransport::new(&settings)?);
    let id = Uuid::new_v4();

    let host: Arc<dyn SessionHost>;
    let mut prompt: Arc<dyn CredentialPrompt>;
    let mut printer = None;
    match format {
        OutputFormat::Human => {
            let terminal = TerminalHost::new();
            prompt = Arc::new(terminal.prompt());
            host = Arc::new(terminal);
        }
        OutputFormat::Json => {
            let broadcast = BroadcastHost::new(id);
            printer = Some(spawn_event_printer(&broadcast));
            prompt = Arc::new(RefuseCredentials);
            host = Arc::new(broadcast);
        }
    }
    if let Some(credentials) = options.credentials() {
        prompt = Arc::new(StaticCredentials(credentials));
    }

    let mut session = DownloadSession::new(&options.url, transport, host, prompt)?
        .with_id(id)
        .with_timeout(settings.timeout_secs.map(Duration::from_secs));

    let handle = session.handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Interrupted, cancelling download");
            handle.cancel();
        }
    });

    let policy = DestinationPolicy::from_settings(&settings);
    let result = match session.start(&policy).await {
        Ok(()) => session.run().await.map(|_| ()),
        // Start failures have already been reported as the terminal outcome
        Err(e) => {
            debug!("Session did not start: {}", e);
            Ok(())
        }
    };
    interrupt.abort();
    result?;

    let outcome = session
        .outcome()
        .cloned()
        .ok_or_else(|| anyhow!("download ended without an outcome"))?;
    let summary = session.summary();
    drop(session);

    if let Some(printer) = printer {
        if let Err(e) = printer.await {
            warn!("Event printer stopped: {}", e);
        }
        // Closing line: totals, timestamps and any TLS warnings
        print_summary_line(&summary)?;
    }

    Ok(outcome)
}

/// Print broadcast events as JSON lines until the terminal one
fn spawn_event_printer(host: &BroadcastHost) -> JoinHandle<()> {
    let mut rx = host.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = print_event_line(&event) {
                        warn!("Failed to print event: {}", e);
                    }
                    if matches!(event, SessionEvent::Terminal { .. }) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} progress events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Process exit code for an outcome
pub fn exit_code(outcome: &Outcome) -> i32 {
    match outcome {
        Outcome::Completed { .. } => 0,
        Outcome::Failed { .. } => 1,
        Outcome::Cancelled => 130,
    }
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(
    store: &SettingsStore,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = store.load().await?;
            print_output(&settings, format, print_settings)?;
        }

        Some(ConfigAction::Get { key }) => {
            let settings = store.load().await?;
            println!("{}", get_setting(&settings, &key)?);
        }

        Some(ConfigAction::Set { key, value }) => {
            let mut settings = store.load().await?;
            set_setting(&mut settings, &key, &value)?;
            store.save(&settings).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset { yes }) => {
            use dialoguer::Confirm;

            let confirmed = yes
                || Confirm::new()
                    .with_prompt("Reset all settings to defaults?")
                    .default(false)
                    .interact()?;

            if confirmed {
                store.reset().await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }

        Some(ConfigAction::Path) => {
            println!("{}", store.path().display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlsession_core::types::FailureKind;

    fn options() -> GetOptions {
        GetOptions {
            url: "https://host/file.bin".to_string(),
            output_dir: None,
            force: false,
            timeout: None,
            insecure: false,
            user: None,
            password: None,
        }
    }

    #[test]
    fn test_overrides_apply_to_settings() {
        let mut settings = Settings::default();
        let options = GetOptions {
            output_dir: Some(PathBuf::from("/tmp/out")),
            force: true,
            timeout: Some(5),
            insecure: true,
            ..options()
        };

        options.apply(&mut settings);

        assert_eq!(settings.download_dir, PathBuf::from("/tmp/out"));
        assert_eq!(settings.overwrite, OverwritePolicy::Always);
        assert_eq!(settings.timeout_secs, Some(5));
        assert!(settings.accept_invalid_certs);
    }

    #[test]
    fn test_no_overrides_keep_settings() {
        let mut settings = Settings {
            timeout_secs: Some(30),
            ..Default::default()
        };
        options().apply(&mut settings);
        assert_eq!(settings.timeout_secs, Some(30));
        assert_eq!(settings.overwrite, OverwritePolicy::Ask);
    }

    #[test]
    fn test_user_without_password() {
        let with_user = GetOptions {
            user: Some("alice".to_string()),
            ..options()
        };
        assert_eq!(with_user.credentials(), Some(Credentials::new("alice", "")));
        assert_eq!(options().credentials(), None);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            exit_code(&Outcome::Completed {
                path: PathBuf::from("f"),
                bytes: 1
            }),
            0
        );
        assert_eq!(
            exit_code(&Outcome::Failed {
                kind: FailureKind::Io,
                reason: "disk full".to_string()
            }),
            1
        );
        assert_eq!(exit_code(&Outcome::Cancelled), 130);
    }
}
