//! Transport - the collaborator that performs the actual network I/O
//!
//! A transport turns one request into an ordered stream of
//! [`TransportEvent`]s delivered over a channel. The session is the only
//! consumer of that stream and the only party allowed to abort it.

mod http;
#[cfg(test)]
pub(crate) mod scripted;

pub use http::*;

use bytes::Bytes;
use dlsession_types::{ByteTotal, Credentials, TlsWarning, TransportFailure};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Capacity of the event channel between transport and session
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted by a transport, in delivery order
#[derive(Debug)]
pub enum TransportEvent {
    ChunkReceived(Bytes),
    Progress {
        received: u64,
        total: ByteTotal,
    },
    /// The transport is blocked until `reply` is answered
    AuthRequired {
        realm: String,
        host: String,
        reply: AuthReply,
    },
    TlsWarning(TlsWarning),
    TransportError(TransportFailure),
    Finished(FinishStatus),
}

/// How the exchange ended, as seen by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishStatus {
    Success,
    Failed(TransportFailure),
    Aborted,
}

/// Single-use answer channel for an authentication challenge
#[derive(Debug)]
pub struct AuthReply(oneshot::Sender<Option<Credentials>>);

impl AuthReply {
    pub fn channel() -> (Self, oneshot::Receiver<Option<Credentials>>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub fn answer(self, credentials: Option<Credentials>) {
        if self.0.send(credentials).is_err() {
            debug!("Transport stopped waiting for credentials");
        }
    }

    pub fn refuse(self) {
        self.answer(None);
    }
}

/// One-shot, idempotent abort request for a running exchange
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        if !self.token.is_cancelled() {
            debug!("Aborting transport");
            self.token.cancel();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once `abort` has been called
    pub async fn aborted(&self) {
        self.token.cancelled().await
    }
}

/// A started request: its event stream and its abort switch
#[derive(Debug)]
pub struct TransportSession {
    pub events: mpsc::Receiver<TransportEvent>,
    pub abort: AbortHandle,
}

/// Starts outbound requests
pub trait Transport: Send + Sync {
    /// Issue the request. Events for it arrive on the returned channel and
    /// end with exactly one `Finished`.
    fn start(&self, url: &Url) -> TransportSession;
}
