//! The plugin process manager.
//!
//! Lazily starts plugin processes on first invoke, pools them up to the
//! manifest's `max_instances`, monitors health by pinging, restarts dead
//! processes under an exponential backoff, and quarantines plugins whose
//! backoff hits the ceiling so fallback routing can take over.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aster_core::PluginId;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::PluginError;
use crate::manifest::PluginManifest;
use crate::process::{PluginConnection, PluginProcess};
use crate::protocol::{self, InvokeParams};
use crate::state::ProcessState;

/// Consecutive ping failures before a process is declared dead.
const PING_FAILURE_LIMIT: u32 = 3;

/// Manager tuning knobs.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Handshake time budget.
    pub handshake_timeout: Duration,
    /// Ping time budget.
    pub ping_timeout: Duration,
    /// Grace period granted on shutdown.
    pub shutdown_grace: Duration,
    /// First restart delay; doubles per consecutive failure.
    pub restart_backoff_base: Duration,
    /// Backoff ceiling; reaching it quarantines the plugin.
    pub restart_backoff_ceiling: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            restart_backoff_base: Duration::from_millis(500),
            restart_backoff_ceiling: Duration::from_secs(60),
        }
    }
}

/// Exponential restart backoff with a quarantine ceiling.
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    base: Duration,
    ceiling: Duration,
    consecutive_failures: u32,
}

impl RestartBackoff {
    /// A fresh backoff.
    #[must_use]
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling,
            consecutive_failures: 0,
        }
    }

    /// Record one failed start.
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    /// Record a successful start.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    /// The delay to wait before the next restart attempt.
    ///
    /// `Some(0)` with no failures on record, doubling per failure after
    /// that; `None` once the delay reaches the ceiling (quarantine).
    #[must_use]
    pub fn delay(&self) -> Option<Duration> {
        if self.consecutive_failures == 0 {
            return Some(Duration::ZERO);
        }
        let exponent = (self.consecutive_failures - 1).min(32);
        let delay = self
            .base
            .saturating_mul(2u32.checked_pow(exponent).unwrap_or(u32::MAX));
        if delay >= self.ceiling {
            None
        } else {
            Some(delay)
        }
    }

    /// Failures since the last reset.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Factory seam producing live connections; tests substitute fakes.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Spawn and handshake a new connection for a plugin.
    async fn connect(
        &self,
        manifest: &PluginManifest,
        config: &ManagerConfig,
    ) -> Result<Box<dyn PluginConnection>, PluginError>;
}

/// The production factory: real subprocesses.
pub struct ProcessFactory;

#[async_trait]
impl ConnectionFactory for ProcessFactory {
    async fn connect(
        &self,
        manifest: &PluginManifest,
        config: &ManagerConfig,
    ) -> Result<Box<dyn PluginConnection>, PluginError> {
        let mut process = PluginProcess::spawn(manifest).await?;
        process.handshake(None, config.handshake_timeout).await?;
        Ok(Box::new(process))
    }
}

struct Slot {
    connection: Option<Box<dyn PluginConnection>>,
    state: ProcessState,
    ping_failures: u32,
}

struct Pool {
    manifest: PluginManifest,
    slots: Vec<Arc<Mutex<Slot>>>,
    backoff: parking_lot::Mutex<RestartBackoff>,
    quarantined: std::sync::atomic::AtomicBool,
}

/// One invoke request, as the engine hands it to the manager.
#[derive(Debug, Clone)]
pub struct PluginInvoke {
    /// The module id being executed.
    pub step: String,
    /// Canonicalized parameters.
    pub input: Value,
    /// Plugin-level configuration.
    pub config: Value,
    /// Sanitized context (public layer only — never secrets).
    pub context: Value,
    /// Per-call time budget in milliseconds.
    pub timeout_ms: u64,
}

/// Tracks `{plugin_id → process pool}` and drives the lifecycle.
pub struct PluginManager {
    config: ManagerConfig,
    factory: Arc<dyn ConnectionFactory>,
    pools: RwLock<HashMap<PluginId, Arc<Pool>>>,
}

impl PluginManager {
    /// A manager spawning real subprocesses.
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_factory(config, Arc::new(ProcessFactory))
    }

    /// A manager with a custom connection factory (tests).
    #[must_use]
    pub fn with_factory(config: ManagerConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            config,
            factory,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a plugin manifest. Processes start lazily on first invoke.
    pub fn load(&self, manifest: PluginManifest) -> Result<(), PluginError> {
        manifest.validate()?;
        let mut pools = self.pools.write();
        let slots = (0..manifest.max_instances)
            .map(|_| {
                Arc::new(Mutex::new(Slot {
                    connection: None,
                    state: ProcessState::Dead,
                    ping_failures: 0,
                }))
            })
            .collect();
        pools.insert(
            manifest.name.clone(),
            Arc::new(Pool {
                backoff: parking_lot::Mutex::new(RestartBackoff::new(
                    self.config.restart_backoff_base,
                    self.config.restart_backoff_ceiling,
                )),
                quarantined: std::sync::atomic::AtomicBool::new(false),
                manifest,
                slots,
            }),
        );
        Ok(())
    }

    /// Loaded plugin ids.
    #[must_use]
    pub fn loaded(&self) -> Vec<PluginId> {
        let mut ids: Vec<PluginId> = self.pools.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether a plugin has been quarantined.
    #[must_use]
    pub fn is_quarantined(&self, plugin: &PluginId) -> bool {
        self.pools
            .read()
            .get(plugin)
            .is_some_and(|p| p.quarantined.load(std::sync::atomic::Ordering::Acquire))
    }

    fn pool(&self, plugin: &PluginId) -> Result<Arc<Pool>, PluginError> {
        self.pools
            .read()
            .get(plugin)
            .cloned()
            .ok_or_else(|| PluginError::NotLoaded(plugin.clone()))
    }

    /// Invoke a module on a plugin.
    ///
    /// Acquires an idle process (starting one lazily), issues the `invoke`
    /// RPC, and returns the raw result value. A crash mid-invoke marks the
    /// slot dead and surfaces `PLUGIN_CRASHED` upward as a retryable step
    /// error.
    pub async fn invoke(
        &self,
        plugin: &PluginId,
        request: PluginInvoke,
    ) -> Result<Value, PluginError> {
        let pool = self.pool(plugin)?;
        if pool.quarantined.load(std::sync::atomic::Ordering::Acquire) {
            return Err(PluginError::Quarantined(plugin.clone()));
        }

        let slot_arc = Self::pick_slot(&pool);
        let mut slot = slot_arc.lock().await;
        self.ensure_connected(plugin, &pool, &mut slot).await?;

        let params = InvokeParams {
            step: request.step,
            input: request.input,
            config: request.config,
            context: request.context,
            timeout_ms: request.timeout_ms,
        };
        let timeout = Duration::from_millis(request.timeout_ms.max(1));

        slot.state = ProcessState::Busy;
        let connection = slot.connection.as_mut().expect("connected above");
        let result = connection
            .call(
                protocol::method::INVOKE,
                serde_json::to_value(&params).unwrap_or(Value::Null),
                timeout,
            )
            .await;

        match &result {
            Err(PluginError::Crashed(_)) => {
                warn!(plugin = %plugin, "plugin crashed mid-invoke");
                slot.connection = None;
                slot.state = ProcessState::Dead;
            }
            _ => slot.state = ProcessState::Idle,
        }
        result
    }

    /// Ping every live process once; three consecutive failures mark a
    /// process dead so the next invoke restarts it.
    pub async fn health_check(&self) {
        let pools: Vec<(PluginId, Arc<Pool>)> = self
            .pools
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (plugin, pool) in pools {
            for slot_arc in &pool.slots {
                let mut slot = slot_arc.lock().await;
                if !slot.state.accepts_requests() {
                    continue;
                }
                let Some(connection) = slot.connection.as_mut() else {
                    continue;
                };
                let pong = connection
                    .call(
                        protocol::method::PING,
                        serde_json::json!({}),
                        self.config.ping_timeout,
                    )
                    .await;
                match pong {
                    Ok(_) => slot.ping_failures = 0,
                    Err(_) => {
                        slot.ping_failures += 1;
                        warn!(
                            plugin = %plugin,
                            failures = slot.ping_failures,
                            "plugin ping failed"
                        );
                        if slot.ping_failures >= PING_FAILURE_LIMIT {
                            slot.connection = None;
                            slot.state = ProcessState::Dead;
                            slot.ping_failures = 0;
                        }
                    }
                }
            }
        }
    }

    /// Spawn a background task pinging every live process at `interval`.
    ///
    /// The task runs until the manager is dropped (it holds only a weak
    /// reference). Three consecutive failed pings mark a process dead.
    pub fn spawn_health_monitor(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.health_check().await;
            }
        })
    }

    /// Gracefully shut down every process.
    pub async fn shutdown_all(&self, reason: &str) {
        let pools: Vec<Arc<Pool>> = self.pools.read().values().cloned().collect();
        for pool in pools {
            for slot_arc in &pool.slots {
                let mut slot = slot_arc.lock().await;
                if slot.connection.is_some() {
                    slot.state = ProcessState::ShuttingDown;
                    let connection = slot.connection.as_mut().expect("checked is_some above");
                    connection.shutdown(reason, self.config.shutdown_grace).await;
                }
                slot.connection = None;
                slot.state = ProcessState::Dead;
            }
        }
    }

    /// Drain and forget every pool (hot reload step (a)+(b)).
    pub async fn unload_all(&self, reason: &str) {
        self.shutdown_all(reason).await;
        self.pools.write().clear();
    }

    fn pick_slot(pool: &Pool) -> Arc<Mutex<Slot>> {
        // Prefer a slot that is free right now; otherwise queue on the
        // first one (single-instance plugins serialize naturally here).
        for slot in &pool.slots {
            if slot.try_lock().is_ok() {
                return slot.clone();
            }
        }
        pool.slots[0].clone()
    }

    async fn ensure_connected(
        &self,
        plugin: &PluginId,
        pool: &Pool,
        slot: &mut Slot,
    ) -> Result<(), PluginError> {
        if slot.connection.as_mut().is_some_and(|c| c.is_alive()) {
            return Ok(());
        }
        slot.connection = None;
        slot.state = ProcessState::Starting;

        let delay = match pool.backoff.lock().delay() {
            Some(delay) => delay,
            None => {
                pool.quarantined
                    .store(true, std::sync::atomic::Ordering::Release);
                return Err(PluginError::Quarantined(plugin.clone()));
            }
        };
        if !delay.is_zero() {
            debug!(plugin = %plugin, ?delay, "restart backoff");
            tokio::time::sleep(delay).await;
        }

        match self.factory.connect(&pool.manifest, &self.config).await {
            Ok(connection) => {
                slot.connection = Some(connection);
                slot.state = ProcessState::Idle;
                slot.ping_failures = 0;
                pool.backoff.lock().reset();
                Ok(())
            }
            Err(err) => {
                slot.state = ProcessState::Dead;
                pool.backoff.lock().record_failure();
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.loaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn manifest(name: &str) -> PluginManifest {
        PluginManifest::from_yaml(&format!(
            "name: {name}\nversion: \"0.1.0\"\nruntime: {{language: test, entry: unused}}\nmodules:\n  - {{id: test.op, label: Op}}\n"
        ))
        .unwrap()
    }

    fn invoke_request() -> PluginInvoke {
        PluginInvoke {
            step: "test.op".into(),
            input: serde_json::json!({}),
            config: Value::Null,
            context: Value::Null,
            timeout_ms: 1000,
        }
    }

    // ── Fakes ───────────────────────────────────────────────────────

    struct FakeConnection {
        alive: bool,
        crash_after: Option<u32>,
        calls: u32,
    }

    #[async_trait]
    impl PluginConnection for FakeConnection {
        async fn call(
            &mut self,
            method: &str,
            _params: Value,
            _timeout: Duration,
        ) -> Result<Value, PluginError> {
            self.calls += 1;
            if let Some(limit) = self.crash_after {
                if self.calls > limit {
                    self.alive = false;
                    return Err(PluginError::Crashed(
                        PluginId::new("fake").unwrap(),
                    ));
                }
            }
            Ok(serde_json::json!({"method": method, "call": self.calls}))
        }

        async fn shutdown(&mut self, _reason: &str, _grace: Duration) {
            self.alive = false;
        }

        fn is_alive(&mut self) -> bool {
            self.alive
        }
    }

    struct FakeFactory {
        connects: AtomicU32,
        fail_first: u32,
        crash_after: Option<u32>,
    }

    #[async_trait]
    impl ConnectionFactory for FakeFactory {
        async fn connect(
            &self,
            manifest: &PluginManifest,
            _config: &ManagerConfig,
        ) -> Result<Box<dyn PluginConnection>, PluginError> {
            let attempt = self.connects.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                return Err(PluginError::Spawn {
                    plugin: manifest.name.clone(),
                    source: std::io::Error::other("refused"),
                });
            }
            Ok(Box::new(FakeConnection {
                alive: true,
                crash_after: self.crash_after,
                calls: 0,
            }))
        }
    }

    fn fast_config() -> ManagerConfig {
        ManagerConfig {
            restart_backoff_base: Duration::from_millis(1),
            restart_backoff_ceiling: Duration::from_millis(8),
            ..ManagerConfig::default()
        }
    }

    fn manager(fail_first: u32, crash_after: Option<u32>) -> PluginManager {
        PluginManager::with_factory(
            fast_config(),
            Arc::new(FakeFactory {
                connects: AtomicU32::new(0),
                fail_first,
                crash_after,
            }),
        )
    }

    // ── Backoff ─────────────────────────────────────────────────────

    #[test]
    fn backoff_doubles_to_ceiling() {
        let mut backoff = RestartBackoff::new(Duration::from_millis(500), Duration::from_secs(5));
        assert_eq!(backoff.delay(), Some(Duration::ZERO));
        backoff.record_failure();
        assert_eq!(backoff.delay(), Some(Duration::from_millis(500)));
        backoff.record_failure();
        assert_eq!(backoff.delay(), Some(Duration::from_millis(1000)));
        backoff.record_failure();
        assert_eq!(backoff.delay(), Some(Duration::from_millis(2000)));
        backoff.record_failure();
        assert_eq!(backoff.delay(), Some(Duration::from_millis(4000)));
        backoff.record_failure();
        assert_eq!(backoff.delay(), None); // 8s >= 5s ceiling
    }

    #[test]
    fn backoff_reset_on_success() {
        let mut backoff = RestartBackoff::new(Duration::from_millis(500), Duration::from_secs(5));
        backoff.record_failure();
        backoff.record_failure();
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.delay(), Some(Duration::ZERO));
    }

    // ── Manager ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn lazy_start_and_invoke() {
        let manager = manager(0, None);
        manager.load(manifest("echo")).unwrap();
        let plugin = PluginId::new("echo").unwrap();

        let result = manager.invoke(&plugin, invoke_request()).await.unwrap();
        assert_eq!(result["method"], "invoke");
    }

    #[tokio::test]
    async fn unloaded_plugin_fails() {
        let manager = manager(0, None);
        let err = manager
            .invoke(&PluginId::new("ghost").unwrap(), invoke_request())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotLoaded(_)));
    }

    #[tokio::test]
    async fn crash_marks_slot_dead_then_restarts() {
        let manager = manager(0, Some(1));
        manager.load(manifest("flaky")).unwrap();
        let plugin = PluginId::new("flaky").unwrap();

        // First call OK, second crashes.
        manager.invoke(&plugin, invoke_request()).await.unwrap();
        let err = manager.invoke(&plugin, invoke_request()).await.unwrap_err();
        assert!(matches!(err, PluginError::Crashed(_)));

        // Next invoke restarts a fresh connection.
        let result = manager.invoke(&plugin, invoke_request()).await.unwrap();
        assert_eq!(result["call"], 1);
    }

    #[tokio::test]
    async fn repeated_spawn_failures_quarantine() {
        let manager = manager(u32::MAX, None);
        manager.load(manifest("broken")).unwrap();
        let plugin = PluginId::new("broken").unwrap();

        // Keep invoking until the backoff ceiling quarantines the plugin.
        let mut quarantined = false;
        for _ in 0..10 {
            match manager.invoke(&plugin, invoke_request()).await {
                Err(PluginError::Quarantined(_)) => {
                    quarantined = true;
                    break;
                }
                Err(_) => {}
                Ok(_) => panic!("connect should never succeed"),
            }
        }
        assert!(quarantined);
        assert!(manager.is_quarantined(&plugin));

        // Once quarantined, invokes fail fast.
        let err = manager.invoke(&plugin, invoke_request()).await.unwrap_err();
        assert!(matches!(err, PluginError::Quarantined(_)));
    }

    #[tokio::test]
    async fn shutdown_all_clears_connections() {
        let manager = manager(0, None);
        manager.load(manifest("echo")).unwrap();
        let plugin = PluginId::new("echo").unwrap();
        manager.invoke(&plugin, invoke_request()).await.unwrap();

        manager.shutdown_all("test teardown").await;
        // Next invoke starts a fresh connection (call counter resets).
        let result = manager.invoke(&plugin, invoke_request()).await.unwrap();
        assert_eq!(result["call"], 1);
    }

    #[tokio::test]
    async fn unload_all_forgets_pools() {
        let manager = manager(0, None);
        manager.load(manifest("echo")).unwrap();
        manager.unload_all("reload").await;
        assert!(manager.loaded().is_empty());
    }

    #[tokio::test]
    async fn health_check_resets_on_success() {
        let manager = manager(0, None);
        manager.load(manifest("echo")).unwrap();
        let plugin = PluginId::new("echo").unwrap();
        manager.invoke(&plugin, invoke_request()).await.unwrap();

        // Healthy connection: ping succeeds, nothing changes.
        manager.health_check().await;
        let result = manager.invoke(&plugin, invoke_request()).await.unwrap();
        // Two invokes plus one ping on the same connection.
        assert_eq!(result["call"], 3);
    }

    #[tokio::test]
    async fn three_failed_pings_kill_the_process() {
        // Crashes on call 2+: the first health ping fails and keeps failing.
        let manager = manager(0, Some(1));
        manager.load(manifest("sick")).unwrap();
        let plugin = PluginId::new("sick").unwrap();
        manager.invoke(&plugin, invoke_request()).await.unwrap();

        for _ in 0..PING_FAILURE_LIMIT {
            manager.health_check().await;
        }
        // Slot was torn down; next invoke reconnects.
        let result = manager.invoke(&plugin, invoke_request()).await.unwrap();
        assert_eq!(result["call"], 1);
    }
}
