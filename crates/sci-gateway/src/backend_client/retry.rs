use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::BackendError;

/// Retries transient unavailability with jittered exponential backoff.
/// Timeouts and rejections are returned immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn none() -> Self {
        Self::new(0)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(2_u32.saturating_pow(attempt));
        let jitter_ms = rand::thread_rng().gen_range(0..=self.base_delay.as_millis() as u64 / 2);
        exp + Duration::from_millis(jitter_ms)
    }

    pub async fn run<F, Fut, T>(&self, backend_id: &str, mut op: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    warn!(
                        "Backend {} unavailable (attempt {}/{}): {}",
                        backend_id,
                        attempt + 1,
                        self.max_retries + 1,
                        e
                    );
                    tokio::time::sleep(self.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
