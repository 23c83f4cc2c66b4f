//! Owns the pairing code registry and its periodic sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, Instrument};

use pd_core::ids::DeviceId;
use pd_core::pairing::{AuthCode, AuthCodeError, AuthCodeRegistry};
use pd_core::ports::ClockPort;
use pd_core::settings::PairingSettings;

pub struct AuthCodeService {
    registry: Arc<Mutex<AuthCodeRegistry>>,
    clock: Arc<dyn ClockPort>,
    sweeper: Mutex<Option<AbortHandle>>,
}

impl AuthCodeService {
    pub fn new(registry: AuthCodeRegistry, clock: Arc<dyn ClockPort>) -> Self {
        Self {
            registry: Arc::new(Mutex::new(registry)),
            clock,
            sweeper: Mutex::new(None),
        }
    }

    pub fn from_settings(settings: &PairingSettings, clock: Arc<dyn ClockPort>) -> Self {
        let secs = i64::try_from(settings.code_ttl_secs).unwrap_or(i64::MAX);
        let ttl = chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX);
        let registry = AuthCodeRegistry::new(ttl).with_max_attempts(settings.max_code_attempts);
        Self::new(registry, clock)
    }

    pub async fn generate_code(&self, owner: &DeviceId) -> Result<AuthCode, AuthCodeError> {
        let now = self.clock.now();
        self.registry.lock().await.generate(owner, now)
    }

    /// Marks the code used and returns the device that issued it.
    pub async fn validate_code(&self, code: &str, requester: &DeviceId) -> Result<DeviceId, AuthCodeError> {
        let now = self.clock.now();
        self.registry
            .lock()
            .await
            .validate(code, requester, now)
            .inspect_err(|e| info!(requester = %requester, reason = e.reason(), "pairing code refused"))
    }

    /// Purges expired and used codes now; returns how many were removed.
    pub async fn sweep(&self) -> usize {
        sweep_registry(&self.registry, self.clock.as_ref()).await
    }

    pub async fn live_codes(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Starts the periodic sweep. Calling it again restarts the timer.
    pub async fn start_sweep(&self, every: Duration) {
        let registry = self.registry.clone();
        let clock = self.clock.clone();
        let span = info_span!("pairing.code_sweep", every_secs = every.as_secs());
        let task = tokio::spawn(
            async move {
                let mut ticker = interval_at(Instant::now() + every, every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    sweep_registry(&registry, clock.as_ref()).await;
                }
            }
            .instrument(span),
        );

        if let Some(previous) = self.sweeper.lock().await.replace(task.abort_handle()) {
            previous.abort();
        }
    }

    pub async fn stop(&self) {
        if let Some(task) = self.sweeper.lock().await.take() {
            task.abort();
        }
    }
}

impl Drop for AuthCodeService {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

async fn sweep_registry(registry: &Mutex<AuthCodeRegistry>, clock: &dyn ClockPort) -> usize {
    let removed = registry.lock().await.sweep(clock.now());
    if removed > 0 {
        debug!(removed, "swept stale pairing codes");
    }
    removed
}
