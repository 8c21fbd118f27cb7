use fanout_core::{with_retry, BackoffPolicy, ConnectionError, CoreError, RetryConfig, SubmissionClient};
use fanout_core::{SubmissionOutcome, SubmissionRequest};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_retry_success_first_try() {
    let counter = Arc::new(AtomicUsize::new(0));
    let config = RetryConfig::new(3, 10).without_jitter();

    let result: Result<String, anyhow::Error> = with_retry(&config, "test_op", || async {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok("success".to_string())
    })
    .await;

    assert!(result.is_ok());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retry_success_after_failures() {
    let counter = Arc::new(AtomicUsize::new(0));
    let config = RetryConfig::new(3, 10).without_jitter();

    let result: Result<String, anyhow::Error> = with_retry(&config, "test_op", || async {
        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if count < 3 {
            Err(anyhow::anyhow!("temporary error"))
        } else {
            Ok("success".to_string())
        }
    })
    .await;

    assert!(result.is_ok());
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_all_failures() {
    let counter = Arc::new(AtomicUsize::new(0));
    let config = RetryConfig::new(3, 10).without_jitter();

    let result: Result<String, anyhow::Error> = with_retry(&config, "test_op", || async {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!("permanent error"))
    })
    .await;

    assert!(result.is_err());
    assert_eq!(counter.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_retry_with_delay() {
    let counter = Arc::new(AtomicUsize::new(0));
    let config = RetryConfig::new(2, 50).without_jitter();

    let start = tokio::time::Instant::now();
    let _: Result<String, anyhow::Error> = with_retry(&config, "test_op", || async {
        counter.fetch_add(1, Ordering::SeqCst);
        if counter.load(Ordering::SeqCst) < 3 {
            Err(anyhow::anyhow!("temp"))
        } else {
            Ok("done".to_string())
        }
    })
    .await;

    // 50ms + 100ms of exponential backoff
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(150));
}

#[test]
fn test_attempt_budget() {
    let config = RetryConfig::for_attempts(3, 100);
    assert_eq!(config.max_retries, 2);
    assert_eq!(config.attempts(), 3);

    // Zero attempts still performs one try
    assert_eq!(RetryConfig::for_attempts(0, 100).attempts(), 1);
}

#[test]
fn test_backoff_hint_takes_precedence() {
    let policy = BackoffPolicy::from_millis(5_000, 60_000);
    assert_eq!(
        policy.resolve(Some(Duration::from_secs(90))),
        Duration::from_secs(90)
    );
    for _ in 0..100 {
        let d = policy.resolve(None);
        assert!(d >= Duration::from_secs(5) && d <= Duration::from_secs(60));
    }
}

/// Handshake that fails a fixed number of times before succeeding.
struct FlakyHandshake {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl SubmissionClient for FlakyHandshake {
    async fn connect(&self) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(anyhow::anyhow!("connection reset"))
        } else {
            Ok(())
        }
    }

    async fn submit(&self, _request: &SubmissionRequest) -> Result<SubmissionOutcome, CoreError> {
        Ok(SubmissionOutcome::success(1, 1.0))
    }
}

#[tokio::test(start_paused = true)]
async fn test_open_retries_handshake() {
    let client = FlakyHandshake {
        failures: 2,
        calls: AtomicUsize::new(0),
    };
    client
        .open(&RetryConfig::for_attempts(3, 10).without_jitter())
        .await
        .unwrap();
    assert_eq!(client.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_open_gives_up_after_budget() {
    let client = FlakyHandshake {
        failures: usize::MAX,
        calls: AtomicUsize::new(0),
    };
    let err = client
        .open(&RetryConfig::for_attempts(3, 10).without_jitter())
        .await
        .unwrap_err();

    match err {
        CoreError::Connection(ConnectionError::HandshakeFailed { attempts, reason }) => {
            assert_eq!(attempts, 3);
            assert!(reason.contains("connection reset"));
        }
        other => panic!("Expected HandshakeFailed, got {:?}", other),
    }
    assert_eq!(client.calls.load(Ordering::SeqCst), 3);
}
