//! Circuit Breaker: global resource probe gating session admission.
//!
//! The memory-percent probe is adapted from the base crate's
//! `executor::resources::SystemResources::detect` (which reads
//! `/proc/meminfo` on Linux), generalized from "total memory" to "percent
//! currently in use" since that is what the admission decision needs.

use thiserror::Error;
use tracing::warn;

/// Circuit breaker probe errors. Only raised for genuine I/O failure reading
/// host memory stats — the breaker itself never fails a `status()` call on
/// probe error, it degrades to "closed" and logs a warning, since a stuck
/// memory probe must never block session creation outright.
#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    /// The host memory probe could not be read.
    #[error("failed to read host memory stats: {0}")]
    ProbeFailed(String),
}

/// Resource readings the `isOpen` decision is derived from.
#[derive(Debug, Clone, Copy)]
pub struct CircuitMetrics {
    /// Current count of non-terminal sessions (one container each).
    pub container_count: u32,
    /// Host memory currently in use, percent. `None` in dev mode (probe skipped).
    pub memory_percent: Option<f64>,
}

/// Result of a `status()` poll.
#[derive(Debug, Clone)]
pub struct CircuitStatus {
    /// Whether new session admission should be refused.
    pub is_open: bool,
    /// Human-readable cause, set iff `is_open`.
    pub reason: Option<String>,
    /// The readings the decision was derived from.
    pub metrics: CircuitMetrics,
}

/// Global admission gate. Polled by the Coordinator before every `createSession`.
pub struct CircuitBreaker {
    max_containers: u32,
    max_memory_percent: f64,
    dev_mode: bool,
}

impl CircuitBreaker {
    /// Construct a breaker with the given thresholds. In `dev_mode`, the
    /// memory probe is skipped entirely (aggressive host-OS file caches
    /// distort the reading in local development).
    pub fn new(max_containers: u32, max_memory_percent: f64, dev_mode: bool) -> Self {
        Self {
            max_containers,
            max_memory_percent,
            dev_mode,
        }
    }

    /// Evaluate admission status afresh. Never blocks session creation on
    /// its own account: a failed memory probe is logged and treated as "not
    /// over threshold" rather than propagated as an error.
    ///
    /// Tie-break order: container cap first, then memory.
    pub async fn status(&self, container_count: u32) -> CircuitStatus {
        if container_count >= self.max_containers {
            return CircuitStatus {
                is_open: true,
                reason: Some(format!(
                    "container count {container_count} at or above cap {}",
                    self.max_containers
                )),
                metrics: CircuitMetrics {
                    container_count,
                    memory_percent: None,
                },
            };
        }

        if self.dev_mode {
            return CircuitStatus {
                is_open: false,
                reason: None,
                metrics: CircuitMetrics {
                    container_count,
                    memory_percent: None,
                },
            };
        }

        let memory_percent = match host_memory_percent().await {
            Ok(percent) => Some(percent),
            Err(e) => {
                warn!("circuit breaker memory probe failed: {}", e);
                None
            }
        };

        let is_open = memory_percent
            .map(|p| p >= self.max_memory_percent)
            .unwrap_or(false);

        CircuitStatus {
            is_open,
            reason: is_open.then(|| {
                format!(
                    "memory usage {:.1}% at or above cap {:.1}%",
                    memory_percent.unwrap_or(0.0),
                    self.max_memory_percent
                )
            }),
            metrics: CircuitMetrics {
                container_count,
                memory_percent,
            },
        }
    }
}

/// Read the host's current memory usage as a percent.
///
/// # Errors
///
/// Returns [`CircuitBreakerError::ProbeFailed`] if `/proc/meminfo` cannot be
/// read or parsed (non-Linux hosts, or a malformed file).
async fn host_memory_percent() -> Result<f64, CircuitBreakerError> {
    #[cfg(target_os = "linux")]
    {
        linux_memory_percent().await
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(CircuitBreakerError::ProbeFailed(
            "memory probe only implemented for Linux hosts".to_string(),
        ))
    }
}

#[cfg(target_os = "linux")]
async fn linux_memory_percent() -> Result<f64, CircuitBreakerError> {
    let contents = tokio::fs::read_to_string("/proc/meminfo")
        .await
        .map_err(|e| CircuitBreakerError::ProbeFailed(e.to_string()))?;

    let mut total_kb: Option<u64> = None;
    let mut available_kb: Option<u64> = None;

    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = parse_kb_field(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = parse_kb_field(rest);
        }
        if total_kb.is_some() && available_kb.is_some() {
            break;
        }
    }

    let total = total_kb.ok_or_else(|| {
        CircuitBreakerError::ProbeFailed("MemTotal not found in /proc/meminfo".to_string())
    })?;
    let available = available_kb.ok_or_else(|| {
        CircuitBreakerError::ProbeFailed("MemAvailable not found in /proc/meminfo".to_string())
    })?;

    if total == 0 {
        return Err(CircuitBreakerError::ProbeFailed(
            "MemTotal reported as zero".to_string(),
        ));
    }

    let used = total.saturating_sub(available);
    Ok((used as f64 / total as f64) * 100.0)
}

#[cfg(target_os = "linux")]
fn parse_kb_field(rest: &str) -> Option<u64> {
    rest.trim().strip_suffix(" kB")?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_container_cap_takes_priority_over_memory() {
        let breaker = CircuitBreaker::new(2, 85.0, true);
        let status = breaker.status(2).await;
        assert!(status.is_open);
        assert!(status.reason.unwrap().contains("container count"));
    }

    #[tokio::test]
    async fn test_dev_mode_skips_memory_probe() {
        let breaker = CircuitBreaker::new(100, 0.0, true);
        let status = breaker.status(1).await;
        assert!(!status.is_open);
        assert!(status.metrics.memory_percent.is_none());
    }

    #[tokio::test]
    async fn test_closed_under_thresholds() {
        let breaker = CircuitBreaker::new(100, 99.9, true);
        let status = breaker.status(5).await;
        assert!(!status.is_open);
        assert_eq!(status.metrics.container_count, 5);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_kb_field() {
        assert_eq!(parse_kb_field("  16384000 kB"), Some(16384000));
        assert_eq!(parse_kb_field("not a number kB"), None);
    }
}
