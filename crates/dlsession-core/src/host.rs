//! Interfaces the session uses to talk to its presentation layer

use dlsession_types::{ByteTotal, Credentials, Outcome, SessionEvent};
use std::path::Path;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Receives status, progress and the terminal outcome of a session
pub trait SessionHost: Send + Sync {
    fn on_status_changed(&self, text: &str);

    fn on_progress(&self, received: u64, total: ByteTotal);

    /// Called exactly once per session
    fn on_terminal(&self, outcome: &Outcome);

    /// Consent to replace an existing artifact. Declines unless overridden.
    fn confirm_overwrite(&self, path: &Path) -> bool {
        debug!("Overwrite of {:?} not confirmed", path);
        false
    }
}

/// Answers authentication challenges. May block; it is run off the
/// session's task.
pub trait CredentialPrompt: Send + Sync {
    fn request_credentials(&self, realm: &str, host: &str) -> Option<Credentials>;
}

/// Refuses every challenge
#[derive(Debug, Clone, Copy, Default)]
pub struct RefuseCredentials;

impl CredentialPrompt for RefuseCredentials {
    fn request_credentials(&self, realm: &str, host: &str) -> Option<Credentials> {
        debug!("Refusing credentials for {} at {}", realm, host);
        None
    }
}

/// Answers every challenge with the same credentials
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub Credentials);

impl CredentialPrompt for StaticCredentials {
    fn request_credentials(&self, _realm: &str, _host: &str) -> Option<Credentials> {
        Some(self.0.clone())
    }
}

/// Event buffer for broadcast subscribers
pub const EVENT_BUFFER: usize = 1000;

/// Republishes everything the session reports as [`SessionEvent`]s
#[derive(Debug, Clone)]
pub struct BroadcastHost {
    id: Uuid,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl BroadcastHost {
    pub fn new(id: Uuid) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { id, event_tx }
    }

    /// Session id stamped on every event
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl SessionHost for BroadcastHost {
    fn on_status_changed(&self, text: &str) {
        self.emit(SessionEvent::StatusChanged {
            id: self.id,
            text: text.to_string(),
        });
    }

    fn on_progress(&self, received: u64, total: ByteTotal) {
        self.emit(SessionEvent::Progress {
            id: self.id,
            received,
            total: total.as_option(),
        });
    }

    fn on_terminal(&self, outcome: &Outcome) {
        self.emit(SessionEvent::Terminal {
            id: self.id,
            outcome: outcome.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_host_stamps_session_id() {
        let id = Uuid::new_v4();
        let host = BroadcastHost::new(id);
        let mut rx = host.subscribe();

        host.on_progress(10, ByteTotal::Known(100));
        host.on_terminal(&Outcome::Cancelled);

        match rx.recv().await.unwrap() {
            SessionEvent::Progress {
                id: event_id,
                received,
                total,
            } => {
                assert_eq!(event_id, id);
                assert_eq!(received, 10);
                assert_eq!(total, Some(100));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::Terminal {
                outcome: Outcome::Cancelled,
                ..
            }
        ));
    }

    #[test]
    fn test_default_overwrite_is_declined() {
        let host = BroadcastHost::new(Uuid::new_v4());
        assert!(!host.confirm_overwrite(Path::new("file.bin")));
    }
}
