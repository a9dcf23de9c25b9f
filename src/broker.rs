//! Credential & Session Broker (C2): mints authenticated sessions for each upstream, with
//! interactive login serialized across every worker via a single process-wide mutex.
//!
//! The mutex's critical section is exactly the login step (§9 design note): once a session
//! reaches `Authenticated`, the broker releases the mutex and the caller scrapes freely and
//! concurrently with any other session's login or scraping.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{cookie::Jar, Client};
use tokio::sync::Mutex;

use crate::{
    error::{Error, Result},
    upstream::{Credentials, Session, SessionState, Upstream},
};

/// Performs the interactive login handshake for one upstream, given a freshly constructed
/// client/jar pair. Implemented per-upstream (LMS vs. exam repo speak to different IdPs);
/// the broker only owns retry/backoff/mutex policy, not login mechanics.
#[async_trait::async_trait]
pub trait LoginFlow: Send + Sync {
    async fn login(&self, session: &Session, credentials: &Credentials) -> Result<()>;
}

/// Maximum login attempts before surfacing [`Error::auth`], per §4.2.
const MAX_LOGIN_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

pub struct SessionBroker {
    credentials: Credentials,
    login_mutex: Arc<Mutex<()>>,
    headless: bool,
    flows: std::collections::HashMap<Upstream, Arc<dyn LoginFlow>>,
}

impl SessionBroker {
    pub fn new(credentials: Credentials, headless: bool) -> Self {
        Self {
            credentials,
            login_mutex: Arc::new(Mutex::new(())),
            headless,
            flows: std::collections::HashMap::new(),
        }
    }

    pub fn with_flow(mut self, upstream: Upstream, flow: Arc<dyn LoginFlow>) -> Self {
        self.flows.insert(upstream, flow);
        self
    }

    pub fn is_headless(&self) -> bool {
        self.headless
    }

    /// Mints a fresh, independent session for `upstream`. Retries the login step up to
    /// [`MAX_LOGIN_ATTEMPTS`] times with exponential backoff, reinitializing the underlying
    /// client/jar on every attempt (§4.2: "each attempt reinitializes the underlying browser
    /// context").
    pub async fn acquire(&self, upstream: Upstream) -> Result<Session> {
        let flow = self
            .flows
            .get(&upstream)
            .ok_or_else(|| Error::config(format!("no login flow registered for {upstream:?}")))?
            .clone();

        let mut backoff = INITIAL_BACKOFF;
        let mut last_err: Option<Error> = None;

        for attempt in 1..=MAX_LOGIN_ATTEMPTS {
            let jar = Arc::new(Jar::default());
            let client = build_client(&jar)?;
            let mut session = Session::new(upstream, client, jar);

            let _guard = self.login_mutex.lock().await;
            session.set_state(SessionState::LoggingIn);
            match flow.login(&session, &self.credentials).await {
                Ok(()) => {
                    session.set_state(SessionState::Authenticated);
                    return Ok(session);
                }
                Err(err) if err.is_unreachable() => {
                    // Unreachable IdP: fail fast, no point retrying the same way a bad
                    // password would be retried.
                    return Err(err);
                }
                Err(err) => {
                    last_err = Some(err);
                }
            }

            drop(_guard);
            if attempt < MAX_LOGIN_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(Error::auth(format!(
            "login to {upstream:?} failed after {MAX_LOGIN_ATTEMPTS} attempts: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

fn build_client(jar: &Arc<Jar>) -> Result<Client> {
    Client::builder()
        .cookie_provider(jar.clone())
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(Error::from)
}

/// Generic username/password form-POST login flow: submits `username`/`password` fields to
/// `login_url` and treats the response as rejected if its body contains `failure_marker`
/// (case-insensitively) — the common shape of both upstreams' login pages re-rendering with
/// an inline error banner rather than returning a distinct HTTP status. The session's cookie
/// jar captures any `Set-Cookie` the IdP issues automatically; no cookie handling is needed
/// here beyond issuing the request through `session.client()`.
pub struct FormLoginFlow {
    login_url: reqwest::Url,
    failure_marker: String,
}

impl FormLoginFlow {
    pub fn new(login_url: &str, failure_marker: &str) -> Result<Self> {
        let login_url = reqwest::Url::parse(login_url).map_err(|e| Error::config(e.to_string()))?;
        Ok(Self { login_url, failure_marker: failure_marker.to_ascii_lowercase() })
    }
}

#[async_trait::async_trait]
impl LoginFlow for FormLoginFlow {
    async fn login(&self, session: &Session, credentials: &Credentials) -> Result<()> {
        let response = session
            .client()
            .post(self.login_url.clone())
            .form(&[("username", credentials.username.as_str()), ("password", credentials.password())])
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        if body.to_ascii_lowercase().contains(&self.failure_marker) {
            return Err(Error::auth(format!("login rejected by {}", self.login_url)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyFlow {
        succeed_on_attempt: usize,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl LoginFlow for FlakyFlow {
        async fn login(&self, _session: &Session, _credentials: &Credentials) -> Result<()> {
            let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt >= self.succeed_on_attempt {
                Ok(())
            } else {
                Err(Error::auth("bad password, try again"))
            }
        }
    }

    struct AlwaysAuthErrorFlow;

    #[async_trait::async_trait]
    impl LoginFlow for AlwaysAuthErrorFlow {
        async fn login(&self, _session: &Session, _credentials: &Credentials) -> Result<()> {
            Err(Error::auth("account locked"))
        }
    }

    struct UnreachableFlow;

    #[async_trait::async_trait]
    impl LoginFlow for UnreachableFlow {
        async fn login(&self, _session: &Session, _credentials: &Credentials) -> Result<()> {
            Err(Error::network("connection refused"))
        }
    }

    #[tokio::test]
    async fn retries_until_success_within_attempt_budget() {
        let broker = SessionBroker::new(Credentials::new("alice", "hunter2"), true).with_flow(
            Upstream::Lms,
            Arc::new(FlakyFlow { succeed_on_attempt: 2, calls: AtomicUsize::new(0) }),
        );
        let session = broker.acquire(Upstream::Lms).await.unwrap();
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn exhausting_retries_yields_auth_error() {
        let broker = SessionBroker::new(Credentials::new("alice", "hunter2"), true)
            .with_flow(Upstream::Lms, Arc::new(AlwaysAuthErrorFlow));
        let err = broker.acquire(Upstream::Lms).await.unwrap_err();
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn unreachable_idp_fails_fast_as_network_error() {
        let broker = SessionBroker::new(Credentials::new("alice", "hunter2"), true)
            .with_flow(Upstream::Lms, Arc::new(UnreachableFlow));
        let err = broker.acquire(Upstream::Lms).await.unwrap_err();
        assert!(err.is_network_error());
    }

    #[tokio::test]
    async fn concurrent_acquires_never_overlap_in_logging_in() {
        use std::sync::atomic::AtomicUsize;

        struct TrackingFlow {
            in_flight: Arc<AtomicUsize>,
            max_observed: Arc<AtomicUsize>,
        }

        #[async_trait::async_trait]
        impl LoginFlow for TrackingFlow {
            async fn login(&self, _session: &Session, _credentials: &Credentials) -> Result<()> {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_observed.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));
        let broker = Arc::new(
            SessionBroker::new(Credentials::new("alice", "hunter2"), true).with_flow(
                Upstream::Lms,
                Arc::new(TrackingFlow { in_flight: in_flight.clone(), max_observed: max_observed.clone() }),
            ),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let broker = broker.clone();
            handles.push(tokio::spawn(async move { broker.acquire(Upstream::Lms).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(max_observed.load(Ordering::SeqCst), 1);
    }

    fn spawn_login_server(status: u16, body: &'static str) -> std::net::SocketAddr {
        use std::io::{Read, Write};
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "HTTP/1.1 {status} OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        addr
    }

    #[tokio::test]
    async fn form_login_flow_succeeds_without_failure_marker() {
        let addr = spawn_login_server(200, "welcome back");
        let flow = FormLoginFlow::new(&format!("http://{addr}/login"), "invalid password").unwrap();
        let jar = Arc::new(Jar::default());
        let client = build_client(&jar).unwrap();
        let session = Session::new(Upstream::Lms, client, jar);
        flow.login(&session, &Credentials::new("alice", "hunter2")).await.unwrap();
    }

    #[tokio::test]
    async fn form_login_flow_fails_when_marker_present() {
        let addr = spawn_login_server(200, "Invalid Password, try again");
        let flow = FormLoginFlow::new(&format!("http://{addr}/login"), "invalid password").unwrap();
        let jar = Arc::new(Jar::default());
        let client = build_client(&jar).unwrap();
        let session = Session::new(Upstream::Lms, client, jar);
        let err = flow.login(&session, &Credentials::new("alice", "hunter2")).await.unwrap_err();
        assert!(err.is_auth_error());
    }
}
