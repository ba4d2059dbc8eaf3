//! The global context cap and lease release behavior.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use simstim::engine::{
    AutomationEngine, BrowserDriver, ContextProfile, DriverCookie, EngineError,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Driver that counts live contexts and can be told to fail closes.
struct CountingDriver {
    current: AtomicUsize,
    max_seen: AtomicUsize,
    closes: AtomicUsize,
    fail_close: AtomicBool,
}

impl CountingDriver {
    fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            fail_close: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl BrowserDriver for CountingDriver {
    async fn create_context(
        &self,
        _context_id: &str,
        _profile: &ContextProfile,
    ) -> Result<(), EngineError> {
        let live = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(live, Ordering::SeqCst);
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
        Ok("cGl4ZWxz".to_owned())
    }

    async fn evaluate(
        &self,
        _context_id: &str,
        _javascript: &str,
    ) -> Result<serde_json::Value, EngineError> {
        Ok(serde_json::Value::Null)
    }

    async fn current_url(&self, _context_id: &str) -> Result<String, EngineError> {
        Ok("about:blank".to_owned())
    }

    async fn cookies(&self, _context_id: &str) -> Result<Vec<DriverCookie>, EngineError> {
        Ok(Vec::new())
    }

    async fn close_context(&self, _context_id: &str) -> Result<(), EngineError> {
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(EngineError::Driver("close refused".to_owned()));
        }
        Ok(())
    }
}

fn engine_with_cap(driver: Arc<CountingDriver>, cap: usize) -> AutomationEngine {
    AutomationEngine::new(driver as Arc<dyn BrowserDriver>, cap)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn contexts_never_exceed_the_cap_under_contention() {
    let driver = Arc::new(CountingDriver::new());
    let engine = Arc::new(engine_with_cap(Arc::clone(&driver), 2));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        tasks.push(tokio::spawn(async move {
            let lease = engine.open_context(Duration::from_secs(5)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            lease.close().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(
        driver.max_seen.load(Ordering::SeqCst) <= 2,
        "cap was breached: {} contexts were live at once",
        driver.max_seen.load(Ordering::SeqCst)
    );
    assert_eq!(driver.closes.load(Ordering::SeqCst), 8);
    assert_eq!(driver.current.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn opening_past_the_cap_waits_and_times_out_on_a_spent_budget() {
    let driver = Arc::new(CountingDriver::new());
    let engine = engine_with_cap(Arc::clone(&driver), 2);

    let first = engine.open_context(Duration::from_secs(5)).await.unwrap();
    let second = engine.open_context(Duration::from_secs(5)).await.unwrap();
    assert_eq!(engine.available_contexts(), 0);

    let starved = engine.open_context(Duration::from_millis(50)).await;
    assert!(matches!(
        starved,
        Err(EngineError::AutomationTimeout { .. })
    ));

    first.close().await.unwrap();
    let third = engine.open_context(Duration::from_secs(5)).await.unwrap();
    third.close().await.unwrap();
    second.close().await.unwrap();
    assert_eq!(engine.available_contexts(), 2);
}

#[tokio::test]
async fn dropping_a_lease_closes_the_context_in_the_background() {
    let driver = Arc::new(CountingDriver::new());
    let engine = engine_with_cap(Arc::clone(&driver), 2);

    let lease = engine.open_context(Duration::from_secs(5)).await.unwrap();
    drop(lease);

    // The close runs on a spawned task; give it a moment. The permit comes
    // back only after the close finishes.
    for _ in 0..50 {
        if driver.closes.load(Ordering::SeqCst) == 1 && engine.available_contexts() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(driver.closes.load(Ordering::SeqCst), 1);
    assert_eq!(engine.available_contexts(), 2);
}

#[tokio::test]
async fn a_failed_close_still_frees_the_context_slot() {
    let driver = Arc::new(CountingDriver::new());
    let engine = engine_with_cap(Arc::clone(&driver), 1);

    let lease = engine.open_context(Duration::from_secs(5)).await.unwrap();
    driver.fail_close.store(true, Ordering::SeqCst);
    assert!(lease.close().await.is_err());

    // The slot must come back even though the driver refused the close.
    driver.fail_close.store(false, Ordering::SeqCst);
    let next = engine.open_context(Duration::from_millis(200)).await;
    assert!(next.is_ok());
}
