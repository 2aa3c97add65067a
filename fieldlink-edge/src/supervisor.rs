//! Remote-configuration polling and the restart-without-exit loop.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

/// Why the translator stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Process-termination signal; the process should exit.
    Signal,
    /// Internal configuration reload; the process re-runs its startup
    /// routine in place so the container is not churned.
    ConfigReload,
}

/// Repeatedly fetch until a valid value arrives.
///
/// Retries forever: a never-valid remote configuration hangs here by design,
/// since the alternative is running with known-bad configuration. `fetch`
/// and `is_valid` are invoked the minimum number of times needed to reach
/// the first valid result.
pub async fn poll<T, F, Fut, V>(mut fetch: F, mut is_valid: V, interval: Duration) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    V: FnMut(&T) -> bool,
{
    loop {
        match fetch().await {
            Ok(value) => {
                if is_valid(&value) {
                    return value;
                }
                warn!("Fetched configuration is invalid, retrying");
            }
            Err(e) => {
                warn!(error = %e, "Configuration fetch failed, retrying");
            }
        }
        tokio::time::sleep(interval).await;
    }
}

/// Cancellable sleep.
///
/// Returns `true` if the full duration elapsed, `false` if cancelled first.
pub async fn wait(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.changed() => false,
    }
}

/// Fetch a configuration document from the config service.
pub async fn fetch_config(url: &str) -> anyhow::Result<serde_json::Value> {
    info!(url, "Fetching configuration");
    let response = reqwest::get(url).await?.error_for_status()?;
    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_poll_valid_on_first_try() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let checks = Arc::new(AtomicUsize::new(0));

        let f = fetches.clone();
        let c = checks.clone();
        let value = poll(
            move || {
                let f = f.clone();
                async move {
                    f.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                }
            },
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                true
            },
            Duration::from_millis(10),
        )
        .await;

        assert_eq!(value, 42);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_retries_until_valid() {
        let fetches = Arc::new(AtomicUsize::new(0));

        let f = fetches.clone();
        let value = poll(
            move || {
                let f = f.clone();
                async move { Ok(f.fetch_add(1, Ordering::SeqCst)) }
            },
            |v| *v >= 2,
            Duration::from_secs(30),
        )
        .await;

        assert_eq!(value, 2);
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_retries_fetch_errors() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let checks = Arc::new(AtomicUsize::new(0));

        let f = fetches.clone();
        let c = checks.clone();
        let value = poll(
            move || {
                let f = f.clone();
                async move {
                    if f.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("unreachable")
                    }
                    Ok("config")
                }
            },
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                true
            },
            Duration::from_secs(30),
        )
        .await;

        assert_eq!(value, "config");
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
        // The validity check never runs on a failed fetch
        assert_eq!(checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_elapses() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(wait(Duration::from_secs(5), &mut rx).await);
    }

    #[tokio::test]
    async fn test_wait_cancelled() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait(Duration::from_secs(3600), &mut rx).await });

        tx.send(true).unwrap();
        assert!(!waiter.await.unwrap());
    }
}
