//! Transport driven by hand from tests

use crate::transport::{AbortHandle, Transport, TransportEvent, TransportSession, EVENT_CHANNEL_CAPACITY};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

/// Records every started request and hands its event sender to the test
#[derive(Clone, Default)]
pub(crate) struct ScriptedTransport {
    feeds: Arc<Mutex<Vec<Feed>>>,
}

/// Producer side of one started request
#[derive(Clone)]
pub(crate) struct Feed {
    pub url: Url,
    pub tx: mpsc::Sender<TransportEvent>,
    pub abort: AbortHandle,
}

impl Feed {
    pub async fn send(&self, event: TransportEvent) {
        self.tx
            .send(event)
            .await
            .expect("session dropped its event receiver");
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests started so far
    pub fn requests(&self) -> usize {
        self.feeds.lock().len()
    }

    /// Feed of the most recent request
    pub fn feed(&self) -> Feed {
        self.feeds
            .lock()
            .last()
            .cloned()
            .expect("no request has been started")
    }

    /// Forget the stored feeds so the event channel can close
    pub fn release(&self) {
        self.feeds.lock().clear();
    }
}

impl Transport for ScriptedTransport {
    fn start(&self, url: &Url) -> TransportSession {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let abort = AbortHandle::new();
        self.feeds.lock().push(Feed {
            url: url.clone(),
            tx,
            abort: abort.clone(),
        });
        TransportSession { events: rx, abort }
    }
}
