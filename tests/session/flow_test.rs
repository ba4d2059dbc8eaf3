//! The full authorization flow, driven through the broker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use simstim::broker::{BrokerError, SessionBroker};
use simstim::cipher::{CredentialCipher, MasterSecret};
use simstim::credential::CredentialPayload;
use simstim::engine::{
    AutomationEngine, BrowserDriver, ContextProfile, DriverCookie, EngineError,
};
use simstim::session::{AuthState, SessionError};
use simstim::store::{CredentialStore, MemoryStore};

const SECRET: &str = "an adequately long master secret";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Driver whose login flag and cookie jar are scripted by the test.
struct ScriptedDriver {
    logged_in: AtomicBool,
    cookies: Mutex<Vec<DriverCookie>>,
    closes: AtomicUsize,
}

impl ScriptedDriver {
    fn new(cookies: Vec<DriverCookie>) -> Self {
        Self {
            logged_in: AtomicBool::new(false),
            cookies: Mutex::new(cookies),
            closes: AtomicUsize::new(0),
        }
    }

    fn set_cookies(&self, cookies: Vec<DriverCookie>) {
        *self.cookies.lock().unwrap() = cookies;
    }
}

fn doubao_cookies() -> Vec<DriverCookie> {
    ["sessionid", "sessionid_ss", "s_v_web_id"]
        .into_iter()
        .map(|name| DriverCookie {
            name: name.to_owned(),
            value: format!("{name}-value"),
            domain: ".doubao.com".to_owned(),
        })
        .collect()
}

#[async_trait]
impl BrowserDriver for ScriptedDriver {
    async fn create_context(
        &self,
        _context_id: &str,
        _profile: &ContextProfile,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    async fn goto(&self, _context_id: &str, url: &str) -> Result<String, EngineError> {
        Ok(url.to_owned())
    }

    async fn click(&self, _context_id: &str, _selector: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn screenshot(
        &self,
        _context_id: &str,
        _selector: Option<&str>,
    ) -> Result<String, EngineError> {
        Ok("cXItcGl4ZWxz".to_owned())
    }

    async fn evaluate(
        &self,
        _context_id: &str,
        javascript: &str,
    ) -> Result<serde_json::Value, EngineError> {
        if javascript.contains("navigator.userAgent") {
            return Ok(serde_json::Value::String("scripted-agent".to_owned()));
        }
        if javascript.contains("querySelector") {
            return Ok(serde_json::Value::Bool(
                self.logged_in.load(Ordering::SeqCst),
            ));
        }
        Ok(serde_json::json!({}))
    }

    async fn current_url(&self, _context_id: &str) -> Result<String, EngineError> {
        Ok("https://www.doubao.com/chat/".to_owned())
    }

    async fn cookies(&self, _context_id: &str) -> Result<Vec<DriverCookie>, EngineError> {
        Ok(self.cookies.lock().unwrap().clone())
    }

    async fn close_context(&self, _context_id: &str) -> Result<(), EngineError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    driver: Arc<ScriptedDriver>,
    store: Arc<MemoryStore>,
    broker: SessionBroker,
}

fn harness_with(cookies: Vec<DriverCookie>, ttl: Duration) -> Harness {
    let driver = Arc::new(ScriptedDriver::new(cookies));
    let engine = Arc::new(AutomationEngine::new(
        Arc::clone(&driver) as Arc<dyn BrowserDriver>,
        2,
    ));
    let store = Arc::new(MemoryStore::new());
    let secret = MasterSecret::new(SECRET).unwrap();
    let cipher = Arc::new(CredentialCipher::new(&secret).unwrap());
    let broker = SessionBroker::new(
        engine,
        Arc::clone(&store) as Arc<dyn CredentialStore>,
        cipher,
        ttl,
    )
    .unwrap();
    Harness {
        driver,
        store,
        broker,
    }
}

fn harness() -> Harness {
    harness_with(doubao_cookies(), Duration::from_secs(300))
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn login_flow_stores_an_encrypted_decryptable_credential() {
    let h = harness();
    let status = h.broker.start_authorization("ann", "doubao").await.unwrap();
    assert_eq!(status.state, AuthState::AwaitingLogin);

    let qr = h.broker.qr_snapshot("ann", "doubao").await.unwrap();
    assert!(!qr.png_base64.is_empty());

    h.driver.logged_in.store(true, Ordering::SeqCst);
    let status = h.broker.poll_authorization("ann", "doubao").await.unwrap();
    assert_eq!(status.state, AuthState::LoggedIn);

    let credential = h
        .broker
        .finalize_authorization("ann", "doubao")
        .await
        .unwrap();

    // At rest the blob is ciphertext, not cookies.
    assert!(!credential.cipher_blob.contains("sessionid-value"));

    // The same master secret recovers the harvested payload.
    let cipher = CredentialCipher::new(&MasterSecret::new(SECRET).unwrap()).unwrap();
    let payload: CredentialPayload = cipher.decrypt(&credential.cipher_blob).unwrap();
    assert_eq!(
        payload.cookies.get("sessionid").map(String::as_str),
        Some("sessionid-value")
    );
    assert_eq!(payload.user_agent.as_deref(), Some("scripted-agent"));

    // Session gone, context closed, credential queryable through the broker.
    assert!(h
        .broker
        .session_status("ann", "doubao")
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.driver.closes.load(Ordering::SeqCst), 1);
    let stored = h.broker.credential("ann", "doubao").await.unwrap().unwrap();
    assert!(stored.is_usable());
}

// ---------------------------------------------------------------------------
// Shape rejection and re-extraction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn slow_cookie_writes_survive_via_the_single_reextraction() {
    // First harvest sees only noise on the platform domain.
    let h = harness_with(
        vec![DriverCookie {
            name: "tt_webid".to_owned(),
            value: "tracking".to_owned(),
            domain: ".doubao.com".to_owned(),
        }],
        Duration::from_secs(300),
    );
    h.broker.start_authorization("ann", "doubao").await.unwrap();
    h.driver.logged_in.store(true, Ordering::SeqCst);
    h.broker.poll_authorization("ann", "doubao").await.unwrap();

    let first = h
        .broker
        .finalize_authorization("ann", "doubao")
        .await
        .unwrap_err();
    assert!(matches!(
        first,
        BrokerError::Session(SessionError::ShapeInvalid(_))
    ));

    // The platform finishes writing its session cookies; the retry works.
    h.driver.set_cookies(doubao_cookies());
    let credential = h
        .broker
        .finalize_authorization("ann", "doubao")
        .await
        .unwrap();
    assert!(credential.is_usable());
}

#[tokio::test]
async fn a_second_bad_harvest_expires_the_session_without_storing() {
    let h = harness_with(
        vec![DriverCookie {
            name: "tt_webid".to_owned(),
            value: "tracking".to_owned(),
            domain: ".doubao.com".to_owned(),
        }],
        Duration::from_secs(300),
    );
    h.broker.start_authorization("ann", "doubao").await.unwrap();
    h.driver.logged_in.store(true, Ordering::SeqCst);
    h.broker.poll_authorization("ann", "doubao").await.unwrap();

    for _ in 0..2 {
        let err = h
            .broker
            .finalize_authorization("ann", "doubao")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Session(SessionError::ShapeInvalid(_))
        ));
    }

    assert!(h
        .broker
        .session_status("ann", "doubao")
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.driver.closes.load(Ordering::SeqCst), 1);
    assert!(h.store.get("ann", "doubao".parse().unwrap()).await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Deadline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn the_wall_clock_deadline_expires_the_session_and_closes_the_context() {
    let h = harness_with(doubao_cookies(), Duration::from_millis(50));
    h.broker.start_authorization("ann", "doubao").await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    let err = h
        .broker
        .poll_authorization("ann", "doubao")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BrokerError::Session(SessionError::SessionExpired { .. })
    ));
    assert_eq!(h.driver.closes.load(Ordering::SeqCst), 1);
    assert!(h
        .broker
        .session_status("ann", "doubao")
        .await
        .unwrap()
        .is_none());
}

// ---------------------------------------------------------------------------
// Restart and cancel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn restarting_replaces_the_live_session_and_closes_its_context() {
    let h = harness();
    h.broker.start_authorization("ann", "doubao").await.unwrap();
    h.broker.start_authorization("ann", "doubao").await.unwrap();

    assert_eq!(h.driver.closes.load(Ordering::SeqCst), 1);
    let status = h
        .broker
        .session_status("ann", "doubao")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.state, AuthState::AwaitingLogin);

    h.broker.cancel_authorization("ann", "doubao").await.unwrap();
    assert_eq!(h.driver.closes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn sessions_are_keyed_per_owner_and_platform() {
    let h = harness();
    h.broker.start_authorization("ann", "doubao").await.unwrap();
    h.broker.start_authorization("bob", "doubao").await.unwrap();

    // Two independent sessions; neither displaced the other.
    assert_eq!(h.driver.closes.load(Ordering::SeqCst), 0);

    h.driver.logged_in.store(true, Ordering::SeqCst);
    h.broker.poll_authorization("ann", "doubao").await.unwrap();
    h.broker.finalize_authorization("ann", "doubao").await.unwrap();

    // Bob's session is untouched by Ann's finalize.
    let status = h
        .broker
        .session_status("bob", "doubao")
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        status.state,
        AuthState::AwaitingLogin | AuthState::LoggedIn
    ));
}
