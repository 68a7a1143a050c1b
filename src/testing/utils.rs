use std::future::Future;
use std::time::{Duration, Instant};

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    let interval = Duration::from_millis(10);

    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    condition().await
}

/// Like [`wait_for`] with a synchronous condition.
pub async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    wait_for(|| std::future::ready(condition()), timeout).await
}

/// Install a log subscriber honoring `RUST_LOG`. Safe to call repeatedly.
#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
