//! Download session - the state machine for a single transfer
//!
//! A session owns one transport request and one destination writer for
//! its whole life. Transport events arrive on a single channel and are
//! applied on the task that owns the session, so state is never mutated
//! from two places at once. Exactly one terminal outcome is reported.
//!
//! ```text
//! Idle -> Requesting -> Streaming -> Completed | Failed
//!            \______________\_____-> Cancelling -> Cancelled
//! ```

use crate::error::{SessionError, WriterError};
use crate::host::{CredentialPrompt, SessionHost};
use crate::transport::{
    AbortHandle, AuthReply, FinishStatus, Transport, TransportEvent, TransportSession,
};
use crate::writer::{artifact_name, DestinationWriter};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dlsession_types::{
    ByteTotal, OverwritePolicy, Outcome, SessionState, SessionSummary, Settings, TlsWarning,
    TransportErrorCode, TransportFailure,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use url::Url;
use uuid::Uuid;

/// Where the artifact goes and what to do if it already exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationPolicy {
    pub directory: PathBuf,
    pub overwrite: OverwritePolicy,
}

impl DestinationPolicy {
    pub fn new(directory: impl Into<PathBuf>, overwrite: OverwritePolicy) -> Self {
        Self {
            directory: directory.into(),
            overwrite,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.download_dir.clone(), settings.overwrite)
    }
}

/// Clonable cancel switch for a session running on another task.
///
/// A request made before `start` is remembered: `start` then ends the
/// session as cancelled without touching storage or the network. Once
/// started, the request is serviced by `run`.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    token: CancellationToken,
}

impl SessionHandle {
    /// Request cancellation. Never blocks; safe to call repeatedly.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Resources that exist only while a request is in flight
#[derive(Debug)]
struct Active {
    writer: DestinationWriter,
    abort: AbortHandle,
    write_failure: Option<WriterError>,
}

#[derive(Debug)]
enum Phase {
    Idle,
    Requesting(Active),
    Streaming(Active),
    Cancelling(Active),
    Done(Outcome),
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Phase::Idle => SessionState::Idle,
            Phase::Requesting(_) => SessionState::Requesting,
            Phase::Streaming(_) => SessionState::Streaming,
            Phase::Cancelling(_) => SessionState::Cancelling,
            Phase::Done(outcome) => outcome.state(),
        }
    }
}

enum Step {
    Event(Option<TransportEvent>),
    Cancel,
    Deadline,
}

/// One attempt to fetch and persist a single resource
pub struct DownloadSession {
    id: Uuid,
    target: Url,
    file_name: String,
    phase: Phase,
    bytes_received: u64,
    bytes_total: ByteTotal,
    /// Set once by `cancel`, never cleared
    abort_requested: bool,
    last_failure: Option<TransportFailure>,
    tls_warnings: Vec<TlsWarning>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    control: CancellationToken,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    transport: Arc<dyn Transport>,
    host: Arc<dyn SessionHost>,
    prompt: Arc<dyn CredentialPrompt>,
}

impl DownloadSession {
    /// Create an idle session for `url`
    pub fn new(
        url: &str,
        transport: Arc<dyn Transport>,
        host: Arc<dyn SessionHost>,
        prompt: Arc<dyn CredentialPrompt>,
    ) -> Result<Self, SessionError> {
        let target = Url::parse(url).map_err(|_| SessionError::InvalidUrl(url.to_string()))?;
        if !matches!(target.scheme(), "http" | "https") {
            return Err(SessionError::InvalidUrl(url.to_string()));
        }
        let file_name = artifact_name(&target);

        Ok(Self {
            id: Uuid::new_v4(),
            target,
            file_name,
            phase: Phase::Idle,
            bytes_received: 0,
            bytes_total: ByteTotal::Unknown,
            abort_requested: false,
            last_failure: None,
            tls_warnings: Vec::new(),
            events: None,
            control: CancellationToken::new(),
            timeout: None,
            deadline: None,
            started_at: None,
            finished_at: None,
            transport,
            host,
            prompt,
        })
    }

    /// Use a caller-chosen id (e.g. the one a [`crate::BroadcastHost`] stamps)
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Cancel automatically once `timeout` has passed since `start`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn state(&self) -> SessionState {
        self.phase.state()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match &self.phase {
            Phase::Done(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Handle for cancelling from another task while `run` is in progress
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            token: self.control.clone(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            url: self.target.to_string(),
            file_name: self.file_name.clone(),
            state: self.state(),
            bytes_received: self.bytes_received,
            bytes_total: self.bytes_total,
            tls_warnings: self.tls_warnings.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            outcome: self.outcome().cloned(),
        }
    }

    fn span(&self) -> Span {
        info_span!("session", id = %self.id, url = %self.target)
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Open the destination and issue the request.
    ///
    /// Destination problems fail the session before any request is made.
    pub async fn start(&mut self, policy: &DestinationPolicy) -> Result<(), SessionError> {
        let span = self.span();
        self.start_inner(policy).instrument(span).await
    }

    async fn start_inner(&mut self, policy: &DestinationPolicy) -> Result<(), SessionError> {
        if !matches!(self.phase, Phase::Idle) {
            return Err(SessionError::InvalidOperation(
                "session already started; create a new session to retry".to_string(),
            ));
        }
        self.started_at = Some(Utc::now());

        if self.control.is_cancelled() {
            info!("Cancelled before start, no request issued");
            self.host.on_status_changed("Download canceled.");
            self.abort_requested = true;
            self.conclude(Outcome::Cancelled);
            return Ok(());
        }

        let path = policy.directory.join(&self.file_name);
        let exists = match tokio::fs::try_exists(&path).await {
            Ok(exists) => exists,
            Err(e) => {
                let err = SessionError::from(WriterError::on_open(path, e));
                self.conclude(failed(&err));
                return Err(err);
            }
        };
        let overwrite = exists
            && match policy.overwrite {
                OverwritePolicy::Always => true,
                OverwritePolicy::Never => false,
                OverwritePolicy::Ask => self.ask_overwrite(&path).await,
            };

        if exists && !overwrite {
            info!("Not overwriting existing file {:?}", path);
            let err = SessionError::OverwriteDeclined(path);
            self.conclude(failed(&err));
            return Err(err);
        }

        let writer = match DestinationWriter::open(&path, overwrite).await {
            Ok(writer) => writer,
            Err(e) => {
                let err = SessionError::from(e);
                self.conclude(failed(&err));
                return Err(err);
            }
        };

        let TransportSession { events, abort } = self.transport.start(&self.target);
        self.events = Some(events);
        self.deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        self.phase = Phase::Requesting(Active {
            writer,
            abort,
            write_failure: None,
        });

        info!("Starting download of {} to {:?}", self.target, path);
        self.report_status(&format!("Downloading {}.", self.file_name));
        Ok(())
    }

    /// The host may block on user input; keep it off the runtime threads
    async fn ask_overwrite(&self, path: &Path) -> bool {
        let host = Arc::clone(&self.host);
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || host.confirm_overwrite(&path))
            .await
            .unwrap_or_else(|e| {
                error!("Overwrite prompt failed: {}", e);
                false
            })
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Consume transport events until the session reaches its terminal
    /// outcome, servicing cancel requests and the deadline in between.
    pub async fn run(&mut self) -> Result<Outcome, SessionError> {
        let span = self.span();
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&mut self) -> Result<Outcome, SessionError> {
        if matches!(self.phase, Phase::Idle) {
            return Err(SessionError::InvalidOperation(
                "session has not been started".to_string(),
            ));
        }
        let control = self.control.clone();

        loop {
            if let Phase::Done(outcome) = &self.phase {
                return Ok(outcome.clone());
            }

            let cancel_armed = !self.abort_requested;
            let deadline = self.deadline;
            let step = match self.events.as_mut() {
                Some(events) => tokio::select! {
                    event = events.recv() => Step::Event(event),
                    _ = control.cancelled(), if cancel_armed => Step::Cancel,
                    _ = wait_until(deadline), if cancel_armed => Step::Deadline,
                },
                None => Step::Event(None),
            };

            match step {
                Step::Event(Some(event)) => self.handle_event(event).await,
                Step::Event(None) => self.on_channel_closed().await,
                Step::Cancel => self.cancel(),
                Step::Deadline => {
                    warn!("Session deadline elapsed, cancelling");
                    self.cancel();
                }
            }
        }
    }

    /// Apply one transport event
    pub async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ChunkReceived(chunk) => self.on_chunk(chunk).await,
            TransportEvent::Progress { received, total } => self.on_progress(received, total),
            TransportEvent::AuthRequired { realm, host, reply } => {
                self.on_auth_required(realm, host, reply).await
            }
            TransportEvent::TlsWarning(warning) => self.on_tls_warning(warning),
            TransportEvent::TransportError(failure) => self.on_transport_error(failure),
            TransportEvent::Finished(status) => self.on_finished(status).await,
        }
    }

    /// Request cancellation: flag it and abort the transport. Storage is
    /// only cleaned up once the transport reports `Finished`.
    /// Before `start` the request is remembered, as with [`SessionHandle`].
    pub fn cancel(&mut self) {
        match &self.phase {
            Phase::Requesting(_) | Phase::Streaming(_) => {}
            Phase::Cancelling(_) => {
                debug!("Cancel already requested");
                return;
            }
            Phase::Idle => {
                debug!("Cancel before start recorded");
                self.control.cancel();
                return;
            }
            Phase::Done(_) => {
                debug!("Cancel after terminal state ignored");
                return;
            }
        }

        // Status first; everything after the flag is suppressed
        self.host.on_status_changed("Download canceled.");
        self.abort_requested = true;

        if let Phase::Requesting(active) | Phase::Streaming(active) =
            std::mem::replace(&mut self.phase, Phase::Idle)
        {
            active.abort.abort();
            self.phase = Phase::Cancelling(active);
        }
        info!("Cancellation requested for {}", self.file_name);
    }

    // ========================================================================
    // Event handlers
    // ========================================================================

    async fn on_chunk(&mut self, chunk: Bytes) {
        let active = match &mut self.phase {
            Phase::Requesting(active) | Phase::Streaming(active) | Phase::Cancelling(active) => {
                active
            }
            Phase::Idle => {
                warn!("Chunk received before start, ignoring");
                return;
            }
            Phase::Done(_) => {
                debug!("Ignoring {} byte chunk after terminal state", chunk.len());
                return;
            }
        };

        if active.write_failure.is_some() {
            debug!("Dropping {} byte chunk after write failure", chunk.len());
            return;
        }

        if let Err(e) = active.writer.append(&chunk).await {
            error!("Write failed: {}", e);
            active.abort.abort();
            active.write_failure = Some(e);
            return;
        }

        let written = active.writer.bytes_written();
        self.bytes_received = self.bytes_received.max(written);
        self.promote_to_streaming();
    }

    fn promote_to_streaming(&mut self) {
        if !matches!(self.phase, Phase::Requesting(_)) {
            return;
        }
        if let Phase::Requesting(active) = std::mem::replace(&mut self.phase, Phase::Idle) {
            debug!("First bytes received");
            self.phase = Phase::Streaming(active);
        }
    }

    fn on_progress(&mut self, received: u64, total: ByteTotal) {
        if !self.state().is_active() {
            debug!("Ignoring progress {} outside an active session", received);
            return;
        }

        if total.is_known() || !self.bytes_total.is_known() {
            self.bytes_total = total;
        }
        self.bytes_received = self.bytes_received.max(received);

        if self.abort_requested {
            return;
        }
        self.host.on_progress(received, total);
    }

    async fn on_auth_required(&mut self, realm: String, host: String, reply: AuthReply) {
        if !matches!(self.phase, Phase::Requesting(_)) || self.abort_requested {
            debug!("Refusing authentication for {} outside of a pending request", host);
            reply.refuse();
            return;
        }

        info!("Authentication required: {} at {}", realm, host);
        self.report_status(&format!("{} at {}", realm, host));

        // The prompt may block on user input; keep it off the runtime threads
        let prompt = Arc::clone(&self.prompt);
        let (prompt_realm, prompt_host) = (realm.clone(), host.clone());
        let answer = tokio::task::spawn_blocking(move || {
            prompt.request_credentials(&prompt_realm, &prompt_host)
        })
        .await;

        let credentials = match answer {
            Ok(credentials) => credentials.filter(|c| !c.is_empty()),
            Err(e) => {
                error!("Credential prompt failed: {}", e);
                None
            }
        };

        match &credentials {
            Some(c) => info!("Forwarding credentials for user {} to {}", c.username, host),
            None => info!("Credentials for {} at {} refused", realm, host),
        }
        reply.answer(credentials);
    }

    fn on_tls_warning(&mut self, warning: TlsWarning) {
        if !self.state().is_active() {
            debug!("Ignoring TLS warning outside an active session: {}", warning);
            return;
        }
        warn!("TLS warning {:?}: {}", warning.code, warning.description);
        self.report_status(&format!("TLS warning: {}", warning.description));
        self.tls_warnings.push(warning);
    }

    fn on_transport_error(&mut self, failure: TransportFailure) {
        if !self.state().is_active() {
            debug!("Ignoring transport error outside an active session: {}", failure);
            return;
        }
        warn!("Network error: {}", failure);
        self.last_failure = Some(failure);
    }

    async fn on_finished(&mut self, status: FinishStatus) {
        match &self.phase {
            Phase::Done(_) => {
                debug!("Ignoring finish after terminal state: {:?}", status);
                return;
            }
            Phase::Idle => {
                warn!("Finish received before start, ignoring");
                return;
            }
            _ => {}
        }

        // Bytes can still be queued behind the finish notification
        self.drain_pending().await;

        let mut active = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Requesting(active) | Phase::Streaming(active) | Phase::Cancelling(active) => {
                active
            }
            other => {
                self.phase = other;
                return;
            }
        };

        let outcome = if self.abort_requested {
            active.writer.discard().await;
            Outcome::Cancelled
        } else if let Some(e) = active.write_failure.take() {
            active.writer.discard().await;
            failed(&SessionError::from(e))
        } else {
            let failure = match status {
                FinishStatus::Success => self.last_failure.take(),
                FinishStatus::Failed(failure) => Some(failure),
                FinishStatus::Aborted => Some(self.last_failure.take().unwrap_or_else(|| {
                    TransportFailure::new(TransportErrorCode::Other, "request aborted by transport")
                })),
            };
            match failure {
                None => self.complete(&mut active.writer).await,
                Some(failure) => {
                    active.writer.discard().await;
                    failed(&SessionError::Transport(failure))
                }
            }
        };

        self.conclude(outcome);
    }

    async fn on_channel_closed(&mut self) {
        self.events = None;
        if self.state().is_terminal() {
            return;
        }
        warn!("Transport closed its event stream without finishing");

        let status = if self.abort_requested {
            FinishStatus::Aborted
        } else {
            FinishStatus::Failed(self.last_failure.take().unwrap_or_else(|| {
                TransportFailure::new(TransportErrorCode::Other, "transport closed unexpectedly")
            }))
        };
        self.on_finished(status).await;
    }

    /// Apply whatever is already queued on the channel
    async fn drain_pending(&mut self) {
        let Some(events) = self.events.as_mut() else {
            return;
        };
        let mut pending = Vec::new();
        while let Ok(event) = events.try_recv() {
            pending.push(event);
        }
        if !pending.is_empty() {
            debug!("Draining {} queued events", pending.len());
        }

        for event in pending {
            match event {
                TransportEvent::ChunkReceived(chunk) => self.on_chunk(chunk).await,
                TransportEvent::Progress { received, total } => self.on_progress(received, total),
                TransportEvent::TlsWarning(warning) => self.on_tls_warning(warning),
                TransportEvent::TransportError(failure) => self.on_transport_error(failure),
                TransportEvent::AuthRequired { reply, .. } => reply.refuse(),
                TransportEvent::Finished(status) => {
                    debug!("Duplicate finish while draining: {:?}", status)
                }
            }
        }
    }

    async fn complete(&mut self, writer: &mut DestinationWriter) -> Outcome {
        let written = writer.bytes_written();
        if let ByteTotal::Known(expected) = self.bytes_total {
            if written < expected {
                writer.discard().await;
                return failed(&SessionError::Integrity {
                    expected,
                    actual: written,
                });
            }
        }

        match writer.finalize().await {
            Ok(bytes) => {
                self.bytes_received = bytes;
                Outcome::Completed {
                    path: writer.path().to_path_buf(),
                    bytes,
                }
            }
            Err(e) => {
                writer.discard().await;
                failed(&SessionError::from(e))
            }
        }
    }

    /// Enter the terminal state and report it. Called once per session.
    fn conclude(&mut self, outcome: Outcome) {
        self.finished_at = Some(Utc::now());
        self.events = None;

        match &outcome {
            Outcome::Completed { path, bytes } => {
                info!("Download completed: {:?} ({} bytes)", path, bytes);
                let directory = path
                    .parent()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                self.host.on_status_changed(&format!(
                    "Downloaded {} to {}.",
                    self.file_name, directory
                ));
            }
            Outcome::Failed { reason, .. } => {
                error!("Download failed: {}", reason);
                self.report_status(&format!("Download failed: {}.", reason));
            }
            Outcome::Cancelled => info!("Download cancelled: {}", self.file_name),
        }

        self.phase = Phase::Done(outcome.clone());
        self.host.on_terminal(&outcome);
    }

    fn report_status(&self, text: &str) {
        if self.abort_requested {
            return;
        }
        self.host.on_status_changed(text);
    }
}

fn failed(error: &SessionError) -> Outcome {
    Outcome::Failed {
        kind: error.failure_kind(),
        reason: error.to_string(),
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
