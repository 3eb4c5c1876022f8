//! Shared retry backoff for the remote service clients.

use rand::Rng;
use std::time::Duration;

const BASE_MS: u64 = 200;
const CAP_MS: u64 = 2_000;

/// Exponential backoff with ±20% jitter: 200ms, 400ms, 800ms… capped at 2s.
/// `attempt` is zero-based (the delay before retry N uses `attempt = N - 1`).
pub fn delay(attempt: u32) -> Duration {
    let exp = BASE_MS.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(CAP_MS);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((capped as f64 * jitter) as u64)
}
