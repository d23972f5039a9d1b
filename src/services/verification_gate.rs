// src/services/verification_gate.rs
//! Email verification codes and abuse rate limiting.
//!
//! The gate owns three independent in-memory maps, each behind its own
//! reader/writer lock:
//! - live verification codes, one per email
//! - a fixed-window limiter on code requests per email (3 per 3 minutes)
//! - a token bucket per source address (1 request/s, burst of 5)
//!
//! All entries expire after 15 minutes and are removed by [`VerificationGate::sweep`].
//! Time is read from `tokio::time::Instant`, so tests can drive it with a
//! paused clock.

use crate::errors::GateError;
use crate::utils::validation::generate_verification_code;
use log::debug;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Lifetime of codes and limiter entries.
pub const ENTRY_TTL: Duration = Duration::from_secs(15 * 60);

/// Per-email limiter window.
pub const EMAIL_WINDOW: Duration = Duration::from_secs(3 * 60);

/// Code requests allowed per email and window.
pub const EMAIL_MAX_ATTEMPTS: u32 = 3;

/// Tokens added per second to an address bucket.
pub const ADDRESS_RATE_PER_SEC: f64 = 1.0;

/// Capacity of an address bucket.
pub const ADDRESS_BURST: f64 = 5.0;

struct CodeEntry {
    code: String,
    created_at: Instant,
}

struct RateLimitEntry {
    count: u32,
    window_start: Instant,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(now: Instant) -> Self {
        TokenBucket {
            tokens: ADDRESS_BURST,
            last_refill: now,
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * ADDRESS_RATE_PER_SEC).min(ADDRESS_BURST);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Number of entries removed by one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub codes: usize,
    pub email_limits: usize,
    pub address_buckets: usize,
}

/// Gatekeeper for the email validation endpoints.
#[derive(Default)]
pub struct VerificationGate {
    codes: RwLock<HashMap<String, CodeEntry>>,
    email_limits: RwLock<HashMap<String, RateLimitEntry>>,
    address_buckets: RwLock<HashMap<IpAddr, Mutex<TokenBucket>>>,
}

// A poisoned map is still structurally valid; keep serving from it.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl VerificationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh code for `email`, replacing any live one.
    ///
    /// # Errors
    /// `GateError::RateLimited` once `email` has used its attempts for the
    /// current window. No code is stored in that case.
    pub fn request_code(&self, email: &str) -> Result<String, GateError> {
        self.sweep();
        self.register_email_attempt(email)?;

        let code = generate_verification_code();
        write(&self.codes).insert(
            email.to_string(),
            CodeEntry {
                code: code.clone(),
                created_at: Instant::now(),
            },
        );
        Ok(code)
    }

    fn register_email_attempt(&self, email: &str) -> Result<(), GateError> {
        let now = Instant::now();
        let mut limits = write(&self.email_limits);

        match limits.get_mut(email) {
            Some(entry) if now.duration_since(entry.window_start) <= EMAIL_WINDOW => {
                if entry.count >= EMAIL_MAX_ATTEMPTS {
                    return Err(GateError::RateLimited);
                }
                entry.count += 1;
            }
            _ => {
                limits.insert(
                    email.to_string(),
                    RateLimitEntry {
                        count: 1,
                        window_start: now,
                    },
                );
            }
        }
        Ok(())
    }

    /// Consumes the code for `email` if it matches.
    ///
    /// Returns `false` and leaves the entry untouched on a mismatch. Check and
    /// removal happen under one exclusive lock, so a code can only be used once.
    pub fn verify_code(&self, email: &str, code: &str) -> bool {
        let mut codes = write(&self.codes);

        let matches = codes
            .get(email)
            .map(|entry| entry.created_at.elapsed() <= ENTRY_TTL && entry.code == code)
            .unwrap_or(false);

        if matches {
            codes.remove(email);
        }
        matches
    }

    /// Token-bucket check for a source address.
    pub fn allow(&self, address: IpAddr) -> bool {
        let now = Instant::now();

        {
            let buckets = read(&self.address_buckets);
            if let Some(bucket) = buckets.get(&address) {
                let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
                return bucket.try_take(now);
            }
        }

        let mut buckets = write(&self.address_buckets);
        let bucket = buckets
            .entry(address)
            .or_insert_with(|| Mutex::new(TokenBucket::full(now)));
        let allowed = bucket
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .try_take(now);
        allowed
    }

    /// Drops every entry older than [`ENTRY_TTL`].
    ///
    /// Address buckets idle for that long have refilled to their burst, so
    /// removing them does not change any later decision.
    pub fn sweep(&self) -> SweepStats {
        let now = Instant::now();
        let expired = |at: Instant| now.saturating_duration_since(at) > ENTRY_TTL;
        let mut stats = SweepStats::default();

        {
            let mut limits = write(&self.email_limits);
            let before = limits.len();
            limits.retain(|_, entry| !expired(entry.window_start));
            stats.email_limits = before - limits.len();
        }

        {
            let mut codes = write(&self.codes);
            let before = codes.len();
            codes.retain(|_, entry| !expired(entry.created_at));
            stats.codes = before - codes.len();
        }

        {
            let mut buckets = write(&self.address_buckets);
            let before = buckets.len();
            buckets.retain(|_, bucket| {
                !expired(bucket.get_mut().unwrap_or_else(PoisonError::into_inner).last_refill)
            });
            stats.address_buckets = before - buckets.len();
        }

        if stats != SweepStats::default() {
            debug!(
                "Swept expired entries: {} codes, {} email limits, {} address buckets",
                stats.codes, stats.email_limits, stats.address_buckets
            );
        }
        stats
    }
}
