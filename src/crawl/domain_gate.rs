//! Per-domain politeness gate.
//!
//! Each domain gets a lazily-created slot holding a concurrency semaphore
//! (at most K in-flight probes) and a token bucket (R requests per second).
//! Probes block at the gate, they are never dropped. Slots live for the
//! process lifetime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::debug;
use url::Url;

/// Token bucket refilled at a fixed rate, capped at `burst`.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
struct DomainSlot {
    semaphore: Arc<Semaphore>,
    bucket: Mutex<TokenBucket>,
}

/// Gate guarding outbound probes per domain.
#[derive(Debug)]
pub struct DomainGate {
    max_concurrency: usize,
    rate: f64,
    burst: f64,
    domains: RwLock<HashMap<String, Arc<DomainSlot>>>,
}

/// Held for the duration of one probe; releasing it frees the domain slot.
#[derive(Debug)]
pub struct DomainPermit {
    _permit: OwnedSemaphorePermit,
}

impl DomainGate {
    pub fn new(max_concurrency: usize, rate: f64) -> Self {
        Self {
            max_concurrency,
            rate,
            burst: max_concurrency as f64,
            domains: RwLock::new(HashMap::new()),
        }
    }

    /// Extract the politeness domain from a URL.
    pub fn extract_domain(url: &str) -> Option<String> {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
    }

    async fn slot(&self, domain: &str) -> Arc<DomainSlot> {
        if let Some(slot) = self.domains.read().await.get(domain) {
            return slot.clone();
        }
        let mut domains = self.domains.write().await;
        domains
            .entry(domain.to_string())
            .or_insert_with(|| {
                Arc::new(DomainSlot {
                    semaphore: Arc::new(Semaphore::new(self.max_concurrency)),
                    bucket: Mutex::new(TokenBucket {
                        tokens: self.burst,
                        last_refill: Instant::now(),
                    }),
                })
            })
            .clone()
    }

    /// Block until the domain has both a free concurrency slot and a rate
    /// token, then take them.
    pub async fn acquire(&self, domain: &str) -> DomainPermit {
        let slot = self.slot(domain).await;
        // Semaphore is never closed, acquire can only fail after close
        let permit = slot
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("domain semaphore closed"));

        loop {
            let wait = {
                let mut bucket = slot.bucket.lock().await;
                let elapsed = bucket.last_refill.elapsed();
                bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
                bucket.last_refill = Instant::now();
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate))
                }
            };
            match wait {
                None => break,
                Some(wait) => {
                    debug!("Rate limiting {}: waiting {:?}", domain, wait);
                    tokio::time::sleep(wait).await;
                }
            }
        }

        DomainPermit { _permit: permit }
    }

    /// Number of domains with live state, for diagnostics.
    pub async fn tracked_domains(&self) -> usize {
        self.domains.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            DomainGate::extract_domain("https://Example.COM/path"),
            Some("example.com".to_string())
        );
        assert_eq!(
            DomainGate::extract_domain("https://static.data.gouv.fr/file.csv"),
            Some("static.data.gouv.fr".to_string())
        );
        assert_eq!(DomainGate::extract_domain("not a url"), None);
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let gate = Arc::new(DomainGate::new(2, 1000.0));
        let first = gate.acquire("example.com").await;
        let _second = gate.acquire("example.com").await;

        // third acquire must block until a permit is released
        let gate2 = gate.clone();
        let third = tokio::spawn(async move { gate2.acquire("example.com").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!third.is_finished());

        drop(first);
        let _third = third.await.unwrap();
    }

    #[tokio::test]
    async fn test_token_bucket_throttles() {
        // burst of 1 permit, 10 tokens/sec: the second acquire waits ~100ms
        let gate = DomainGate::new(1, 10.0);
        let start = Instant::now();
        drop(gate.acquire("example.com").await);
        drop(gate.acquire("example.com").await);
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_domains_are_independent() {
        let gate = DomainGate::new(1, 0.5);
        let start = Instant::now();
        let _a = gate.acquire("a.example.com").await;
        let _b = gate.acquire("b.example.com").await;
        // no cross-domain throttling
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(gate.tracked_domains().await, 2);
    }
}
