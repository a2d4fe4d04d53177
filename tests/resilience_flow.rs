//! Retry, breaker, and wrapper timing scenarios.

use forgeflow::core::cancel::CancelToken;
use forgeflow::core::error::{ErrorKind, ForgeFlowError};
use forgeflow::resilience::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use forgeflow::resilience::retry::{RetryConfig, with_retry};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

#[test]
fn test_backoff_schedule_five_hundred_then_one_second() {
    // Fails twice with NETWORK_TIMEOUT, succeeds on the third attempt:
    // observed sleeps are 500 ms and 1000 ms.
    let config = RetryConfig {
        max_retries: 3,
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(30),
        jitter: false,
        timeout: Duration::from_secs(10),
    };
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let start = Instant::now();
    let value = with_retry(
        move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ForgeFlowError::fault(ErrorKind::NetworkTimeout, "flaky"))
            } else {
                Ok("ok")
            }
        },
        &config,
        &CancelToken::new(),
    )
    .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(value, "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(elapsed >= Duration::from_millis(1500), "elapsed {:?}", elapsed);
    assert!(elapsed < config.timeout, "elapsed {:?}", elapsed);
}

#[test]
fn test_breaker_opens_fails_fast_then_recovers() {
    let breaker = CircuitBreaker::new(
        "svc",
        BreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            timeout: Duration::from_millis(100),
        },
    );
    let failing = || {
        breaker.call(|| {
            Err::<(), _>(ForgeFlowError::fault(ErrorKind::NetworkTimeout, "down"))
        })
    };

    // Two failing calls open the circuit.
    let _ = failing();
    let _ = failing();
    assert_eq!(breaker.state(), BreakerState::Open);

    // A third call within the window returns SERVICE_UNAVAILABLE in under
    // 5 ms without touching the operation.
    let start = Instant::now();
    let err = breaker
        .call(|| Ok::<_, ForgeFlowError>("must not run"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
    assert!(start.elapsed() < Duration::from_millis(5));

    // After the timeout, one success closes it again.
    std::thread::sleep(Duration::from_millis(110));
    let value = breaker.call(|| Ok::<_, ForgeFlowError>("back")).unwrap();
    assert_eq!(value, "back");
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[test]
fn test_retry_never_reattempts_the_breaker_open_signal() {
    let breaker = CircuitBreaker::new(
        "svc",
        BreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            timeout: Duration::from_secs(60),
        },
    );
    let _ = breaker.call(|| {
        Err::<(), _>(ForgeFlowError::fault(ErrorKind::NetworkTimeout, "down"))
    });
    assert_eq!(breaker.state(), BreakerState::Open);

    let admissions = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&admissions);
    let shared = breaker.clone();
    let config = RetryConfig {
        max_retries: 5,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(10),
        jitter: false,
        timeout: Duration::from_secs(5),
    };
    let result: Result<(), _> = with_retry(
        move || {
            shared.call(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        },
        &config,
        &CancelToken::new(),
    );

    // SERVICE_UNAVAILABLE is not retryable: one admission attempt, zero
    // operation executions.
    assert_eq!(result.unwrap_err().kind(), ErrorKind::ServiceUnavailable);
    assert_eq!(admissions.load(Ordering::SeqCst), 0);
}

#[test]
fn test_deadline_bounds_a_hung_operation() {
    let config = RetryConfig {
        max_retries: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        jitter: false,
        timeout: Duration::from_millis(150),
    };
    let start = Instant::now();
    let result: Result<(), _> = with_retry(
        || {
            std::thread::sleep(Duration::from_secs(60));
            Ok(())
        },
        &config,
        &CancelToken::new(),
    );
    assert_eq!(result.unwrap_err().kind(), ErrorKind::NetworkTimeout);
    assert!(start.elapsed() < Duration::from_secs(2));
}
