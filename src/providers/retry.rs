use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Backoff for rate-limited or overloaded backends. Callers bound the whole
/// call with their own timeout, so waiting here never outlives that budget.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub(crate) max_attempts: usize,
    pub(crate) base_delay: Duration,
    pub(crate) max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub(crate) fn should_retry(&self, attempt: usize, status: StatusCode, body: &str) -> bool {
        attempt < self.max_attempts && is_rate_limited(status, body)
    }

    /// Sleep before the next attempt and return the delay to use after it.
    pub(crate) async fn wait(
        &self,
        provider: &str,
        attempt: usize,
        delay: Duration,
        retry_after: Option<Duration>,
    ) -> Duration {
        let wait = match retry_after {
            Some(retry_after) if retry_after > delay => retry_after.min(self.max_delay),
            _ => delay,
        };
        warn!(
            "{} rate limited; retrying in {:.1}s (attempt {}/{})",
            provider,
            wait.as_secs_f32(),
            attempt,
            self.max_attempts
        );
        sleep(wait).await;
        self.next_delay(delay)
    }

    fn next_delay(&self, current: Duration) -> Duration {
        current
            .saturating_mul(2)
            .max(self.base_delay)
            .min(self.max_delay)
    }
}

pub(crate) fn is_rate_limited(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    let code = status.as_u16();
    if code == 529 || code == 503 {
        return true;
    }
    let lower = body.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
        || lower.contains("resource_exhausted")
        || lower.contains("overloaded")
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?.trim();
    value.parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        let mut delay = policy.base_delay;
        let mut seen = Vec::new();
        for _ in 0..6 {
            delay = policy.next_delay(delay);
            seen.push(delay.as_secs());
        }
        assert_eq!(seen, [4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn retries_only_throttling_responses() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1, StatusCode::TOO_MANY_REQUESTS, ""));
        assert!(policy.should_retry(1, StatusCode::BAD_REQUEST, "RESOURCE_EXHAUSTED"));
        assert!(!policy.should_retry(1, StatusCode::UNAUTHORIZED, "bad key"));
        assert!(!policy.should_retry(4, StatusCode::TOO_MANY_REQUESTS, ""));
    }

    #[test]
    fn parses_numeric_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "7".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert("retry-after", "soon".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
    }
}
