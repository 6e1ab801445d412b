//! Permission gate for the three tracking capabilities.
//!
//! The gate is the only writer of the persisted [`PermissionState`]. Checks
//! inside the debounce window return the cached state without touching the
//! platform; a `tokio` mutex serialises check-then-persist so a UI prompt and a
//! background re-validation cannot interleave.

use crate::config::TrackerConfig;
use crate::error::TrackerResult;
use crate::preferences::{self, PreferenceStore, PERMISSIONS_KEY};
use crate::types::{Capability, PermissionState};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{timeout, Instant};

/// Platform permission API.
#[async_trait]
pub trait PermissionPlatform: Send + Sync {
    /// Current grant, or `None` when the platform cannot be queried.
    async fn query(&self, capability: Capability) -> Option<bool>;

    /// Show the system prompt for one capability and return the outcome.
    async fn prompt(&self, capability: Capability) -> bool;
}

struct GateCache {
    state: PermissionState,
    checked_at: Option<Instant>,
}

pub struct PermissionGate {
    platform: Arc<dyn PermissionPlatform>,
    prefs: Arc<dyn PreferenceStore>,
    debounce: Duration,
    query_timeout: Duration,
    cache: tokio::sync::Mutex<GateCache>,
}

impl PermissionGate {
    pub fn new(
        platform: Arc<dyn PermissionPlatform>,
        prefs: Arc<dyn PreferenceStore>,
        config: &TrackerConfig,
    ) -> Self {
        let state = preferences::load(prefs.as_ref(), PERMISSIONS_KEY).unwrap_or_default();
        Self {
            platform,
            prefs,
            debounce: config.permission_debounce(),
            query_timeout: config.permission_check_timeout(),
            cache: tokio::sync::Mutex::new(GateCache {
                state,
                checked_at: None,
            }),
        }
    }

    /// Re-read current grants. Capabilities the platform cannot report, or
    /// does not report in time, keep their last persisted value.
    pub async fn check(&self) -> PermissionState {
        let mut cache = self.cache.lock().await;
        if let Some(at) = cache.checked_at {
            if at.elapsed() < self.debounce {
                debug!("[permissions] check debounced");
                return cache.state;
            }
        }

        let mut state: PermissionState =
            preferences::load(self.prefs.as_ref(), PERMISSIONS_KEY).unwrap_or(cache.state);
        for capability in Capability::ALL {
            match timeout(self.query_timeout, self.platform.query(capability)).await {
                Ok(Some(granted)) => state.set(capability, granted),
                Ok(None) => {}
                Err(_) => warn!(
                    "[permissions] {} query timed out, using persisted value",
                    capability
                ),
            }
        }

        cache.state = state;
        cache.checked_at = Some(Instant::now());
        state
    }

    /// Prompt for exactly one capability and persist the outcome, granted or not.
    pub async fn request(&self, capability: Capability) -> bool {
        let mut cache = self.cache.lock().await;
        let granted = self.platform.prompt(capability).await;
        cache.state.set(capability, granted);
        cache.checked_at = Some(Instant::now());
        if let Err(e) = self.persist(&cache.state) {
            warn!("[permissions] failed to persist {} grant: {}", capability, e);
        }
        info!(
            "[permissions] {} {}",
            capability,
            if granted { "granted" } else { "denied" }
        );
        granted
    }

    /// Location, then motion, then notifications. Notifications never gate tracking.
    pub async fn request_all(&self) -> bool {
        let mut outcome = PermissionState::default();
        for capability in Capability::ALL {
            outcome.set(capability, self.request(capability).await);
        }
        outcome.tracking_allowed()
    }

    /// Check, then prompt for any missing tracking capability.
    pub async fn ensure_tracking(&self) -> PermissionState {
        let mut state = self.check().await;
        for capability in [Capability::Location, Capability::Motion] {
            if !state.get(capability) {
                let granted = self.request(capability).await;
                state.set(capability, granted);
            }
        }
        state
    }

    /// Last known state, without any platform call.
    pub async fn cached(&self) -> PermissionState {
        self.cache.lock().await.state
    }

    fn persist(&self, state: &PermissionState) -> TrackerResult<()> {
        preferences::save(self.prefs.as_ref(), PERMISSIONS_KEY, state)
    }
}

/// Platform with scripted grants: prompts return the scripted answer and the
/// answer sticks. Used by the simulated backend, the CLI and tests.
pub struct StaticPermissions {
    grants: Mutex<HashMap<Capability, bool>>,
    queryable: bool,
    prompts: AtomicU32,
    queries: AtomicU32,
}

impl StaticPermissions {
    pub fn new(grants: PermissionState) -> Self {
        let map = Capability::ALL
            .into_iter()
            .map(|c| (c, grants.get(c)))
            .collect();
        Self {
            grants: Mutex::new(map),
            queryable: true,
            prompts: AtomicU32::new(0),
            queries: AtomicU32::new(0),
        }
    }

    pub fn granting_all() -> Self {
        Self::new(PermissionState::all_granted())
    }

    /// A platform without grant queries; the gate falls back to persisted state.
    pub fn without_queries(grants: PermissionState) -> Self {
        Self {
            queryable: false,
            ..Self::new(grants)
        }
    }

    pub fn set(&self, capability: Capability, granted: bool) {
        if let Ok(mut grants) = self.grants.lock() {
            grants.insert(capability, granted);
        }
    }

    pub fn prompt_count(&self) -> u32 {
        self.prompts.load(Ordering::Relaxed)
    }

    pub fn query_count(&self) -> u32 {
        self.queries.load(Ordering::Relaxed)
    }

    fn grant(&self, capability: Capability) -> bool {
        self.grants
            .lock()
            .ok()
            .and_then(|g| g.get(&capability).copied())
            .unwrap_or(false)
    }
}

#[async_trait]
impl PermissionPlatform for StaticPermissions {
    async fn query(&self, capability: Capability) -> Option<bool> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.queryable.then(|| self.grant(capability))
    }

    async fn prompt(&self, capability: Capability) -> bool {
        self.prompts.fetch_add(1, Ordering::Relaxed);
        self.grant(capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preferences::MemoryPreferences;

    fn gate_with(platform: Arc<StaticPermissions>) -> (PermissionGate, Arc<MemoryPreferences>) {
        let prefs = Arc::new(MemoryPreferences::new());
        let gate = PermissionGate::new(platform, prefs.clone(), &TrackerConfig::default());
        (gate, prefs)
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_is_debounced() {
        let platform = Arc::new(StaticPermissions::granting_all());
        let (gate, _) = gate_with(platform.clone());

        assert!(gate.check().await.tracking_allowed());
        assert_eq!(platform.query_count(), 3);

        tokio::time::advance(Duration::from_millis(1500)).await;
        gate.check().await;
        assert_eq!(platform.query_count(), 3);

        tokio::time::advance(Duration::from_millis(600)).await;
        gate.check().await;
        assert_eq!(platform.query_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_sees_revocation_after_debounce() {
        let platform = Arc::new(StaticPermissions::granting_all());
        let (gate, _) = gate_with(platform.clone());
        assert!(gate.check().await.location);

        platform.set(Capability::Location, false);
        tokio::time::advance(Duration::from_secs(3)).await;
        let state = gate.check().await;
        assert!(!state.location);
        assert!(state.motion);
    }

    #[tokio::test]
    async fn test_request_persists_denial_too() {
        let platform = Arc::new(StaticPermissions::new(PermissionState {
            location: false,
            motion: true,
            notifications: true,
        }));
        let (gate, prefs) = gate_with(platform);

        assert!(!gate.request(Capability::Location).await);
        let stored: PermissionState =
            preferences::load(prefs.as_ref(), PERMISSIONS_KEY).unwrap();
        assert!(!stored.location);

        assert!(gate.request(Capability::Motion).await);
        let stored: PermissionState =
            preferences::load(prefs.as_ref(), PERMISSIONS_KEY).unwrap();
        assert!(stored.motion);
    }

    #[tokio::test]
    async fn test_request_all_ignores_notifications() {
        let platform = Arc::new(StaticPermissions::new(PermissionState {
            location: true,
            motion: true,
            notifications: false,
        }));
        let (gate, _) = gate_with(platform.clone());
        assert!(gate.request_all().await);
        assert_eq!(platform.prompt_count(), 3);

        platform.set(Capability::Motion, false);
        assert!(!gate.request_all().await);
    }

    #[tokio::test]
    async fn test_unqueryable_platform_falls_back_to_persisted() {
        let platform = Arc::new(StaticPermissions::without_queries(PermissionState::all_granted()));
        let prefs = Arc::new(MemoryPreferences::new());
        preferences::save(
            prefs.as_ref(),
            PERMISSIONS_KEY,
            &PermissionState {
                location: true,
                motion: false,
                notifications: false,
            },
        )
        .unwrap();

        let gate = PermissionGate::new(platform, prefs, &TrackerConfig::default());
        let state = gate.check().await;
        assert!(state.location);
        assert!(!state.motion);
    }

    struct HangingPlatform;

    #[async_trait]
    impl PermissionPlatform for HangingPlatform {
        async fn query(&self, _capability: Capability) -> Option<bool> {
            std::future::pending::<()>().await;
            None
        }

        async fn prompt(&self, _capability: Capability) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_query_times_out() {
        let prefs = Arc::new(MemoryPreferences::new());
        preferences::save(prefs.as_ref(), PERMISSIONS_KEY, &PermissionState::all_granted())
            .unwrap();
        let gate = PermissionGate::new(Arc::new(HangingPlatform), prefs, &TrackerConfig::default());

        let state = gate.check().await;
        assert!(state.tracking_allowed());
    }

    #[tokio::test]
    async fn test_ensure_tracking_prompts_only_missing() {
        let platform = Arc::new(StaticPermissions::granting_all());
        let (gate, _) = gate_with(platform.clone());
        assert!(gate.ensure_tracking().await.tracking_allowed());
        assert_eq!(platform.prompt_count(), 0);
    }
}
