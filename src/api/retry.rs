//! Backoff policy and `Retry-After` parsing.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::ApiConfig;

use super::transport::Method;

/// Numeric `Retry-After` values below this are seconds, above are milliseconds.
const RETRY_AFTER_MS_THRESHOLD: u64 = 1000;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Retries after the first attempt
  pub max_retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from_config(&ApiConfig::default())
  }
}

impl RetryPolicy {
  pub fn from_config(config: &ApiConfig) -> Self {
    Self {
      max_retries: config.max_retries,
      base_delay: config.base_delay(),
      max_delay: config.max_delay(),
    }
  }

  /// `base_delay * 2^attempt`, capped at `max_delay`.
  pub fn backoff(&self, attempt: u32) -> Duration {
    2u32
      .checked_pow(attempt)
      .and_then(|factor| self.base_delay.checked_mul(factor))
      .map(|delay| delay.min(self.max_delay))
      .unwrap_or(self.max_delay)
  }

  /// Whether a 5xx may be retried for this method.
  ///
  /// GET, HEAD, OPTIONS, PUT and DELETE are idempotent by definition. POST and
  /// PATCH only qualify when the caller supplied their own idempotency key.
  pub fn allows_server_retry(&self, method: &Method, caller_idempotency_key: bool) -> bool {
    let idempotent = [
      Method::GET,
      Method::HEAD,
      Method::OPTIONS,
      Method::PUT,
      Method::DELETE,
    ];
    idempotent.contains(method) || caller_idempotency_key
  }
}

/// Parse a `Retry-After` header value.
///
/// Accepts delta-seconds, a millisecond count (values of 1000 and up), or an
/// HTTP-date. A date in the past yields a zero delay.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
  let value = value.trim();

  if let Ok(n) = value.parse::<u64>() {
    return Some(if n < RETRY_AFTER_MS_THRESHOLD {
      Duration::from_secs(n)
    } else {
      Duration::from_millis(n)
    });
  }

  if let Ok(secs) = value.parse::<f64>() {
    if secs.is_finite() && secs >= 0.0 {
      return Some(Duration::from_secs_f64(secs));
    }
    return None;
  }

  let at = DateTime::parse_from_rfc2822(value).ok()?;
  Some(
    (at.with_timezone(&Utc) - now)
      .to_std()
      .unwrap_or(Duration::ZERO),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_backoff_doubles_and_caps() {
    let policy = RetryPolicy {
      max_retries: 3,
      base_delay: Duration::from_millis(100),
      max_delay: Duration::from_millis(500),
    };

    assert_eq!(policy.backoff(0), Duration::from_millis(100));
    assert_eq!(policy.backoff(1), Duration::from_millis(200));
    assert_eq!(policy.backoff(2), Duration::from_millis(400));
    assert_eq!(policy.backoff(3), Duration::from_millis(500));
    assert_eq!(policy.backoff(64), Duration::from_millis(500));
  }

  #[test]
  fn test_server_retry_methods() {
    let policy = RetryPolicy::default();
    assert!(policy.allows_server_retry(&Method::GET, false));
    assert!(policy.allows_server_retry(&Method::PUT, false));
    assert!(policy.allows_server_retry(&Method::DELETE, false));
    assert!(!policy.allows_server_retry(&Method::POST, false));
    assert!(policy.allows_server_retry(&Method::POST, true));
    assert!(!policy.allows_server_retry(&Method::PATCH, false));
  }

  #[test]
  fn test_retry_after_seconds_or_millis() {
    let now = Utc::now();
    assert_eq!(parse_retry_after("2", now), Some(Duration::from_secs(2)));
    assert_eq!(parse_retry_after(" 120 ", now), Some(Duration::from_secs(120)));
    assert_eq!(parse_retry_after("1500", now), Some(Duration::from_millis(1500)));
    assert_eq!(parse_retry_after("0.5", now), Some(Duration::from_millis(500)));
  }

  #[test]
  fn test_retry_after_http_date() {
    let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 30).unwrap();
    assert_eq!(
      parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
      Some(Duration::from_secs(30))
    );
    assert_eq!(
      parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
      Some(Duration::ZERO)
    );
  }

  #[test]
  fn test_retry_after_garbage() {
    assert_eq!(parse_retry_after("soon", Utc::now()), None);
    assert_eq!(parse_retry_after("-3", Utc::now()), None);
  }
}
