//! Short-lived numeric pairing codes.
//!
//! A device shows a 6-digit code; another device types it in and the code
//! resolves to the owner's device id. Codes expire after a fixed TTL and
//! succeed at most once.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ids::DeviceId;

pub const CODE_MIN: u32 = 100_000;
pub const CODE_MAX: u32 = 999_999;
pub const DEFAULT_CODE_TTL_SECS: i64 = 5 * 60;
pub const DEFAULT_MAX_GENERATE_ATTEMPTS: u32 = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCode {
    pub code: String,
    pub owner_device_id: DeviceId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

impl AuthCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.used || self.is_expired(now)
    }
}

/// Why a code did not validate. Carried as a reason string across the
/// pairing boundary, never as a panic or a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthCodeError {
    #[error("pairing code not found")]
    NotFound,
    #[error("pairing code already used")]
    AlreadyUsed,
    #[error("pairing code expired")]
    Expired,
    #[error("no free pairing code could be generated")]
    Exhausted,
}

impl AuthCodeError {
    pub fn reason(self) -> &'static str {
        match self {
            AuthCodeError::NotFound => "not_found",
            AuthCodeError::AlreadyUsed => "already_used",
            AuthCodeError::Expired => "expired",
            AuthCodeError::Exhausted => "exhausted",
        }
    }
}

type CodeSource = Box<dyn FnMut() -> u32 + Send>;

/// In-memory registry of issued codes, keyed by code.
pub struct AuthCodeRegistry {
    codes: HashMap<String, AuthCode>,
    ttl: Duration,
    max_attempts: u32,
    source: CodeSource,
}

impl fmt::Debug for AuthCodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCodeRegistry")
            .field("codes", &self.codes.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Default for AuthCodeRegistry {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_CODE_TTL_SECS))
    }
}

impl AuthCodeRegistry {
    /// Registry drawing codes uniformly from [100000, 999999] with the
    /// thread-local CSPRNG.
    pub fn new(ttl: Duration) -> Self {
        Self::with_source(ttl, Box::new(|| rand::rng().random_range(CODE_MIN..=CODE_MAX)))
    }

    pub fn with_source(ttl: Duration, source: CodeSource) -> Self {
        Self {
            codes: HashMap::new(),
            ttl,
            max_attempts: DEFAULT_MAX_GENERATE_ATTEMPTS,
            source,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Issues a fresh code for `owner`.
    ///
    /// A drawn code that collides with a live entry is redrawn; stale
    /// (expired or used) entries are simply replaced.
    pub fn generate(&mut self, owner: &DeviceId, now: DateTime<Utc>) -> Result<AuthCode, AuthCodeError> {
        for attempt in 1..=self.max_attempts {
            let code = format!("{:06}", (self.source)());
            let collides = self
                .codes
                .get(&code)
                .map(|existing| !existing.is_stale(now))
                .unwrap_or(false);
            if collides {
                debug!(attempt, "pairing code collision, redrawing");
                continue;
            }

            let auth_code = AuthCode {
                code: code.clone(),
                owner_device_id: owner.clone(),
                issued_at: now,
                expires_at: now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
                used: false,
            };
            self.codes.insert(code, auth_code.clone());
            info!(owner = %owner, expires_at = %auth_code.expires_at, "issued pairing code");
            return Ok(auth_code);
        }

        warn!(owner = %owner, attempts = self.max_attempts, "pairing code space exhausted");
        Err(AuthCodeError::Exhausted)
    }

    /// Consumes `code` on behalf of `requester` and returns the owner.
    pub fn validate(&mut self, code: &str, requester: &DeviceId, now: DateTime<Utc>) -> Result<DeviceId, AuthCodeError> {
        let Some(entry) = self.codes.get_mut(code) else {
            debug!(requester = %requester, "pairing code not found");
            return Err(AuthCodeError::NotFound);
        };

        if entry.used {
            return Err(AuthCodeError::AlreadyUsed);
        }

        if entry.is_expired(now) {
            self.codes.remove(code);
            return Err(AuthCodeError::Expired);
        }

        entry.used = true;
        info!(owner = %entry.owner_device_id, requester = %requester, "pairing code validated");
        Ok(entry.owner_device_id.clone())
    }

    /// Drops expired and used codes; returns how many were removed.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.codes.len();
        self.codes.retain(|_, entry| !entry.is_stale(now));
        before - self.codes.len()
    }

    pub fn get(&self, code: &str) -> Option<&AuthCode> {
        self.codes.get(code)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// Strips separators users commonly type ("123 456", "123-456") and checks
/// the remaining text is six digits.
pub fn normalize_code(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
    (digits.len() == 6 && digits.chars().all(|c| c.is_ascii_digit())).then_some(digits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    fn scripted(values: Vec<u32>) -> CodeSource {
        let queue = Arc::new(Mutex::new(VecDeque::from(values)));
        Box::new(move || queue.lock().unwrap().pop_front().unwrap_or(CODE_MIN))
    }

    fn owner() -> DeviceId {
        DeviceId::new("owner")
    }

    #[test]
    fn test_generated_code_is_six_digits_in_range() {
        let mut registry = AuthCodeRegistry::default();
        let now = Utc::now();
        for _ in 0..200 {
            let code = registry.generate(&owner(), now).unwrap();
            let value: u32 = code.code.parse().unwrap();
            assert_eq!(code.code.len(), 6);
            assert!((CODE_MIN..=CODE_MAX).contains(&value));
            assert_eq!(code.expires_at - code.issued_at, Duration::minutes(5));
        }
    }

    #[test]
    fn test_code_validates_exactly_once() {
        let mut registry = AuthCodeRegistry::default();
        let now = Utc::now();
        let code = registry.generate(&owner(), now).unwrap();

        let requester = DeviceId::new("phone");
        assert_eq!(registry.validate(&code.code, &requester, now), Ok(owner()));
        assert_eq!(
            registry.validate(&code.code, &requester, now),
            Err(AuthCodeError::AlreadyUsed)
        );
    }

    #[test]
    fn test_expired_code_is_evicted() {
        let mut registry = AuthCodeRegistry::default();
        let now = Utc::now();
        let code = registry.generate(&owner(), now).unwrap();
        let later = now + Duration::minutes(5);

        let requester = DeviceId::new("phone");
        assert_eq!(
            registry.validate(&code.code, &requester, later),
            Err(AuthCodeError::Expired)
        );
        assert_eq!(
            registry.validate(&code.code, &requester, later),
            Err(AuthCodeError::NotFound)
        );
    }

    #[test]
    fn test_unbounded_ttl_saturates_expiry() {
        let mut registry = AuthCodeRegistry::new(Duration::MAX);
        let now = Utc::now();
        let code = registry.generate(&owner(), now).unwrap();
        assert_eq!(code.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(!code.is_expired(now));
    }

    #[test]
    fn test_unknown_code_is_not_found() {
        let mut registry = AuthCodeRegistry::default();
        let err = registry
            .validate("123456", &DeviceId::new("phone"), Utc::now())
            .unwrap_err();
        assert_eq!(err.reason(), "not_found");
    }

    #[test]
    fn test_collision_with_live_code_is_redrawn() {
        let mut registry = AuthCodeRegistry::with_source(Duration::minutes(5), scripted(vec![111111, 111111, 222222]));
        let now = Utc::now();
        let first = registry.generate(&DeviceId::new("a"), now).unwrap();
        let second = registry.generate(&DeviceId::new("b"), now).unwrap();

        assert_eq!(first.code, "111111");
        assert_eq!(second.code, "222222");
        assert_eq!(registry.get("111111").unwrap().owner_device_id, DeviceId::new("a"));
    }

    #[test]
    fn test_stale_code_is_replaced_on_collision() {
        let mut registry = AuthCodeRegistry::with_source(Duration::minutes(5), scripted(vec![333333, 333333]));
        let now = Utc::now();
        registry.generate(&DeviceId::new("a"), now).unwrap();
        registry.validate("333333", &DeviceId::new("x"), now).unwrap();

        let again = registry.generate(&DeviceId::new("b"), now).unwrap();
        assert_eq!(again.code, "333333");
        assert!(!again.used);
    }

    #[test]
    fn test_exhausted_when_every_draw_collides() {
        let mut registry =
            AuthCodeRegistry::with_source(Duration::minutes(5), Box::new(|| 444444)).with_max_attempts(3);
        let now = Utc::now();
        registry.generate(&owner(), now).unwrap();
        assert_eq!(registry.generate(&owner(), now), Err(AuthCodeError::Exhausted));
    }

    #[test]
    fn test_sweep_purges_used_and_expired() {
        let mut registry = AuthCodeRegistry::with_source(Duration::minutes(5), scripted(vec![100001, 100002, 100003]));
        let now = Utc::now();
        registry.generate(&owner(), now).unwrap();
        registry.generate(&owner(), now + Duration::minutes(4)).unwrap();
        registry.generate(&owner(), now + Duration::minutes(4)).unwrap();
        registry.validate("100003", &DeviceId::new("x"), now + Duration::minutes(4)).unwrap();

        let removed = registry.sweep(now + Duration::minutes(6));
        assert_eq!(removed, 2);
        assert!(registry.get("100002").is_some());
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code(" 123 456 "), Some("123456".to_string()));
        assert_eq!(normalize_code("123-456"), Some("123456".to_string()));
        assert_eq!(normalize_code("12345"), None);
        assert_eq!(normalize_code("12345a"), None);
    }
}
