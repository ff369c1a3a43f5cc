//! HTTP(S) transport backed by reqwest
//!
//! Runs one GET exchange on its own task and reports it as
//! [`TransportEvent`]s. Basic-auth challenges are forwarded to the session
//! and answered at most once; certificate problems are reported as TLS
//! warnings before the error that ends the exchange.

use crate::error::SessionError;
use crate::transport::{
    AbortHandle, AuthReply, FinishStatus, Transport, TransportEvent, TransportSession,
    EVENT_CHANNEL_CAPACITY,
};
use dlsession_types::{
    ByteTotal, Settings, TlsWarning, TlsWarningCode, TransportErrorCode, TransportFailure,
};
use futures::StreamExt;
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::{Client, Response, StatusCode};
use std::error::Error as StdError;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

/// reqwest-based transport; one client shared by every request it starts
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    insecure: bool,
}

impl HttpTransport {
    /// Build a transport from the application settings
    pub fn new(settings: &Settings) -> Result<Self, SessionError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.as_str())
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .read_timeout(Duration::from_secs(settings.read_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(settings.max_redirects))
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()?;

        Ok(Self {
            client,
            insecure: settings.accept_invalid_certs,
        })
    }
}

impl Transport for HttpTransport {
    fn start(&self, url: &Url) -> TransportSession {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let abort = AbortHandle::new();

        let exchange = Exchange {
            client: self.client.clone(),
            url: url.clone(),
            insecure: self.insecure,
            tx,
        };
        let abort_signal = abort.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                biased;
                _ = abort_signal.aborted() => FinishStatus::Aborted,
                status = exchange.run() => status,
            };
            debug!("Exchange for {} finished: {:?}", exchange.url, status);
            // Receiver may already be gone
            let _ = exchange.tx.send(TransportEvent::Finished(status)).await;
        });

        TransportSession { events: rx, abort }
    }
}

/// State of one running GET exchange
struct Exchange {
    client: Client,
    url: Url,
    insecure: bool,
    tx: mpsc::Sender<TransportEvent>,
}

impl Exchange {
    async fn run(&self) -> FinishStatus {
        if self.insecure {
            let warning = TlsWarning {
                code: TlsWarningCode::CertificateNotVerified,
                description: "certificate validation is disabled".to_string(),
            };
            if !self.emit(TransportEvent::TlsWarning(warning)).await {
                return FinishStatus::Aborted;
            }
        }

        info!("Requesting {}", self.url);
        let mut response = match self.client.get(self.url.clone()).send().await {
            Ok(response) => response,
            Err(e) => return self.fail_with(&e).await,
        };

        if response.status() == StatusCode::UNAUTHORIZED {
            match self.authenticate(&response).await {
                Some(Ok(retried)) => response = retried,
                Some(Err(e)) => return self.fail_with(&e).await,
                None => {}
            }
        }

        let status = response.status();
        if !status.is_success() {
            let code = if status == StatusCode::UNAUTHORIZED {
                TransportErrorCode::AuthenticationRequired
            } else {
                TransportErrorCode::HttpStatus(status.as_u16())
            };
            let description = status.canonical_reason().unwrap_or("").to_string();
            return self.fail(TransportFailure::new(code, description)).await;
        }

        let total = ByteTotal::from(response.content_length());
        if !self.emit(TransportEvent::Progress { received: 0, total }).await {
            return FinishStatus::Aborted;
        }

        let mut received: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(item) = stream.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => return self.fail_with(&e).await,
            };
            received += chunk.len() as u64;

            if !self.emit(TransportEvent::ChunkReceived(chunk)).await {
                return FinishStatus::Aborted;
            }
            if !self.emit(TransportEvent::Progress { received, total }).await {
                return FinishStatus::Aborted;
            }
        }

        info!("Received {} bytes from {}", received, self.url);
        FinishStatus::Success
    }

    /// Answer a 401 once. `None` means the challenge was refused and the
    /// original response stands.
    async fn authenticate(&self, response: &Response) -> Option<Result<Response, reqwest::Error>> {
        let realm = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_realm)
            .unwrap_or_default();
        let host = self.url.host_str().unwrap_or_default().to_string();

        let (reply, answer) = AuthReply::channel();
        if !self
            .emit(TransportEvent::AuthRequired {
                realm,
                host,
                reply,
            })
            .await
        {
            return None;
        }

        let credentials = answer.await.ok().flatten()?;
        debug!("Retrying {} with credentials for {}", self.url, credentials.username);

        Some(
            self.client
                .get(self.url.clone())
                .basic_auth(&credentials.username, Some(&credentials.password))
                .send()
                .await,
        )
    }

    async fn fail_with(&self, error: &reqwest::Error) -> FinishStatus {
        let failure = classify_error(error);
        if failure.code == TransportErrorCode::TlsHandshake {
            let warning = TlsWarning {
                code: TlsWarningCode::InvalidCertificate,
                description: failure.description.clone(),
            };
            self.emit(TransportEvent::TlsWarning(warning)).await;
        }
        self.fail(failure).await
    }

    async fn fail(&self, failure: TransportFailure) -> FinishStatus {
        warn!("Request to {} failed: {}", self.url, failure);
        self.emit(TransportEvent::TransportError(failure.clone()))
            .await;
        FinishStatus::Failed(failure)
    }

    /// Returns false once the session has dropped its receiver
    async fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

/// Extract the realm from a `WWW-Authenticate` header value
pub fn parse_realm(header: &str) -> Option<String> {
    let lower = header.to_ascii_lowercase();
    let start = lower.find("realm=")? + "realm=".len();
    let rest = &header[start..];

    let realm = if let Some(quoted) = rest.strip_prefix('"') {
        quoted.split('"').next().unwrap_or("")
    } else {
        rest.split(',').next().unwrap_or("").trim()
    };
    Some(realm.to_string())
}

/// Map a reqwest error onto a transport error code.
///
/// Only the underlying causes are inspected, never the request URL, and
/// only https requests can fail the TLS handshake.
pub fn classify_error(error: &reqwest::Error) -> TransportFailure {
    let chain = error_chain(error);
    let lower = cause_chain(error).to_lowercase();
    let https = error.url().is_some_and(|url| url.scheme() == "https");

    let code = if error.is_timeout() {
        TransportErrorCode::Timeout
    } else if https
        && (lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl"))
    {
        TransportErrorCode::TlsHandshake
    } else if error.is_redirect() {
        TransportErrorCode::TooManyRedirects
    } else if error.is_connect() {
        if lower.contains("dns") || lower.contains("resolve") || lower.contains("lookup") {
            TransportErrorCode::HostNotFound
        } else {
            TransportErrorCode::ConnectionRefused
        }
    } else if let Some(status) = error.status() {
        TransportErrorCode::HttpStatus(status.as_u16())
    } else if error.is_body() || error.is_decode() || error.is_request() {
        TransportErrorCode::Protocol
    } else {
        TransportErrorCode::Other
    };

    TransportFailure::new(code, chain)
}

/// Messages of the error's sources, without reqwest's own "for url" text
fn cause_chain(error: &reqwest::Error) -> String {
    let mut causes = Vec::new();
    let mut source = error.source();
    while let Some(cause) = source {
        causes.push(cause.to_string());
        source = cause.source();
    }
    causes.join(": ")
}

fn error_chain(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlsession_types::Credentials;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn collect(mut session: TransportSession) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Some(event) = session.events.recv().await {
            let done = matches!(event, TransportEvent::Finished(_));
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    fn body_of(events: &[TransportEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::ChunkReceived(chunk) => Some(chunk.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn test_parse_realm() {
        assert_eq!(
            parse_realm(r#"Basic realm="Private Area", charset="UTF-8""#),
            Some("Private Area".to_string())
        );
        assert_eq!(parse_realm("Basic Realm=files"), Some("files".to_string()));
        assert_eq!(parse_realm("Bearer"), None);
    }

    #[tokio::test]
    async fn test_successful_exchange_events() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 1000]))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&Settings::default()).unwrap();
        let url = Url::parse(&format!("{}/file.bin", server.uri())).unwrap();
        let events = collect(transport.start(&url)).await;

        assert!(matches!(
            events.first(),
            Some(TransportEvent::Progress {
                received: 0,
                total: ByteTotal::Known(1000)
            })
        ));
        assert_eq!(body_of(&events).len(), 1000);
        assert!(matches!(
            events.last(),
            Some(TransportEvent::Finished(FinishStatus::Success))
        ));
    }

    #[tokio::test]
    async fn test_http_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.bin"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&Settings::default()).unwrap();
        let url = Url::parse(&format!("{}/missing.bin", server.uri())).unwrap();
        let events = collect(transport.start(&url)).await;

        assert!(events.iter().any(|e| matches!(
            e,
            TransportEvent::TransportError(TransportFailure {
                code: TransportErrorCode::HttpStatus(404),
                ..
            })
        )));
        assert!(matches!(
            events.last(),
            Some(TransportEvent::Finished(FinishStatus::Failed(_)))
        ));
        assert!(body_of(&events).is_empty());
    }

    #[tokio::test]
    async fn test_auth_challenge_retried_with_credentials() {
        let server = MockServer::start().await;
        // "user:secret"
        Mock::given(method("GET"))
            .and(path("/private.bin"))
            .and(header("authorization", "Basic dXNlcjpzZWNyZXQ="))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"private data".to_vec()))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/private.bin"))
            .respond_with(
                ResponseTemplate::new(401)
                    .insert_header("WWW-Authenticate", r#"Basic realm="vault""#),
            )
            .with_priority(2)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&Settings::default()).unwrap();
        let url = Url::parse(&format!("{}/private.bin", server.uri())).unwrap();
        let mut session = transport.start(&url);

        let mut events = Vec::new();
        while let Some(event) = session.events.recv().await {
            match event {
                TransportEvent::AuthRequired { realm, host, reply } => {
                    assert_eq!(realm, "vault");
                    assert_eq!(host, "127.0.0.1");
                    reply.answer(Some(Credentials::new("user", "secret")));
                }
                TransportEvent::Finished(status) => {
                    assert_eq!(status, FinishStatus::Success);
                    break;
                }
                other => events.push(other),
            }
        }

        assert_eq!(body_of(&events), b"private data");
    }

    #[tokio::test]
    async fn test_refused_challenge_fails_normally() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/private.bin"))
            .respond_with(
                ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Basic realm=vault"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&Settings::default()).unwrap();
        let url = Url::parse(&format!("{}/private.bin", server.uri())).unwrap();
        let mut session = transport.start(&url);

        let mut saw_error = false;
        while let Some(event) = session.events.recv().await {
            match event {
                TransportEvent::AuthRequired { reply, .. } => reply.refuse(),
                TransportEvent::TransportError(failure) => {
                    assert_eq!(failure.code, TransportErrorCode::AuthenticationRequired);
                    saw_error = true;
                }
                TransportEvent::Finished(status) => {
                    assert!(matches!(status, FinishStatus::Failed(_)));
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_abort_finishes_with_aborted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![1u8; 64])
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&Settings::default()).unwrap();
        let url = Url::parse(&format!("{}/slow.bin", server.uri())).unwrap();
        let session = transport.start(&url);
        session.abort.abort();

        let events = collect(session).await;
        assert!(matches!(
            events.last(),
            Some(TransportEvent::Finished(FinishStatus::Aborted))
        ));
    }

    #[tokio::test]
    async fn test_insecure_mode_warns_first() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;

        let settings = Settings {
            accept_invalid_certs: true,
            ..Settings::default()
        };
        let transport = HttpTransport::new(&settings).unwrap();
        let url = Url::parse(&format!("{}/a.txt", server.uri())).unwrap();
        let events = collect(transport.start(&url)).await;

        assert!(matches!(
            events.first(),
            Some(TransportEvent::TlsWarning(TlsWarning {
                code: TlsWarningCode::CertificateNotVerified,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_tls_words_in_url_do_not_look_like_tls_failures() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = HttpTransport::new(&Settings::default()).unwrap();
        let url = Url::parse(&format!(
            "http://127.0.0.1:{}/docs/ssl-certificate-tls-setup.pdf",
            port
        ))
        .unwrap();
        let events = collect(transport.start(&url)).await;

        assert!(!events
            .iter()
            .any(|e| matches!(e, TransportEvent::TlsWarning(_))));
        assert!(matches!(
            events.last(),
            Some(TransportEvent::Finished(FinishStatus::Failed(TransportFailure {
                code: TransportErrorCode::ConnectionRefused,
                ..
            })))
        ));
    }

    #[tokio::test]
    async fn test_connection_refused_is_classified() {
        // Bind then drop to get a port with nothing listening
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = HttpTransport::new(&Settings::default()).unwrap();
        let url = Url::parse(&format!("http://127.0.0.1:{}/file.bin", port)).unwrap();
        let events = collect(transport.start(&url)).await;

        assert!(events.iter().any(|e| matches!(
            e,
            TransportEvent::TransportError(TransportFailure {
                code: TransportErrorCode::ConnectionRefused,
                ..
            })
        )));
    }
}
