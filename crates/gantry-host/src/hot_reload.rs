//! State-preserving hot reload.
//!
//! Replaces a running plugin's code with a new build of the same bundle
//! without losing runtime state. The swap runs through ordered phases,
//! each timed; any failure after the plugin has been touched rolls the
//! bundle file back to a pre-reload backup and re-enables the old code
//! best-effort.

use crate::manager::PluginManager;
use crate::snapshot::{SnapshotStore, StateSnapshot};
use dashmap::DashSet;
use gantry_core::{Bundle, Error, Result};
use gantry_watch::{FileWatcher, WatchCallback, WatchEvent, WatchOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

/// Phases of a hot reload, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadPhase {
    /// Plugin exists, is enabled, and consents (or the caller forces).
    Validating,
    /// Snapshot of config, custom data, and active task ids.
    CapturingState,
    /// The plugin quiesces via `prepare_for_reload`.
    GracefulShutdown,
    /// Disable, unload, and unregister the old instance.
    Disabling,
    /// Load and register the new code.
    LoadingNewVersion,
    /// Push the snapshot into the new instance.
    RestoringState,
    /// Enable the new instance.
    Enabling,
    /// Terminal success.
    Completed,
    /// Terminal failure handling.
    RollingBack,
}

impl std::fmt::Display for ReloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Validating => "validating",
            Self::CapturingState => "capturing-state",
            Self::GracefulShutdown => "graceful-shutdown",
            Self::Disabling => "disabling",
            Self::LoadingNewVersion => "loading-new-version",
            Self::RestoringState => "restoring-state",
            Self::Enabling => "enabling",
            Self::Completed => "completed",
            Self::RollingBack => "rolling-back",
        };
        write!(f, "{name}")
    }
}

/// Reload tuning knobs.
#[derive(Debug, Clone)]
pub struct ReloadOptions {
    /// Capture state before the swap and restore it afterwards.
    pub preserve_state: bool,
    /// Proceed even when the plugin declines or quiescing times out.
    pub force: bool,
    /// Budget for `prepare_for_reload`.
    pub shutdown_timeout: Duration,
}

impl Default for ReloadOptions {
    fn default() -> Self {
        Self {
            preserve_state: true,
            force: false,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ReloadOptions {
    /// Options used by watcher-triggered reloads: shorter quiesce
    /// budget.
    #[must_use]
    pub fn auto() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Toggle state preservation.
    #[must_use]
    pub const fn with_preserve_state(mut self, enabled: bool) -> Self {
        self.preserve_state = enabled;
        self
    }

    /// Force the reload through declined validation and timeouts.
    #[must_use]
    pub const fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Set the quiesce budget.
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// A timed phase.
#[derive(Debug, Clone, Copy)]
pub struct PhaseRecord {
    /// Which phase.
    pub phase: ReloadPhase,
    /// How long it took.
    pub duration: Duration,
}

/// Outcome of one reload.
#[derive(Debug, Clone)]
pub struct ReloadReport {
    /// Plugin name.
    pub plugin: String,
    /// Whether the reload completed.
    pub success: bool,
    /// Per-phase durations, in execution order.
    pub phases: Vec<PhaseRecord>,
    /// Wall-clock total.
    pub total: Duration,
    /// Whether captured state was restored into the new instance.
    pub state_preserved: bool,
    /// Phase that failed, for unsuccessful reloads.
    pub failed_phase: Option<ReloadPhase>,
    /// Failure cause, for unsuccessful reloads.
    pub error: Option<String>,
}

struct PhaseTimer {
    started: Instant,
    records: Vec<PhaseRecord>,
}

impl PhaseTimer {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            records: Vec::new(),
        }
    }

    fn record(&mut self, phase: ReloadPhase, began: Instant) {
        self.records.push(PhaseRecord {
            phase,
            duration: began.elapsed(),
        });
    }
}

/// Coordinates hot reloads: one in flight per plugin, a bounded number
/// across plugins.
pub struct HotReloadOrchestrator {
    manager: Arc<PluginManager>,
    snapshots: SnapshotStore,
    in_flight: DashSet<String>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for HotReloadOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotReloadOrchestrator")
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl HotReloadOrchestrator {
    /// Create an orchestrator over a manager. Snapshots live in the
    /// manager's state directory.
    #[must_use]
    pub fn new(manager: Arc<PluginManager>) -> Self {
        let snapshots = SnapshotStore::new(manager.options().state_dir.clone());
        Self {
            manager,
            snapshots,
            in_flight: DashSet::new(),
            permits: Arc::new(Semaphore::new(crate::RELOAD_POOL_SIZE)),
        }
    }

    /// The snapshot store.
    #[must_use]
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Whether a reload for `name` is currently in flight.
    #[must_use]
    pub fn is_reloading(&self, name: &str) -> bool {
        self.in_flight.contains(name)
    }

    /// Hot reload a plugin.
    ///
    /// Fails fast with a state error when a reload for the same name is
    /// already in flight; otherwise always returns a report, successful
    /// or not.
    pub async fn reload(&self, name: &str, options: ReloadOptions) -> Result<ReloadReport> {
        if !self.in_flight.insert(name.to_string()) {
            return Err(Error::state(format!(
                "reload of '{name}' is already in flight"
            )));
        }
        let permit = self.permits.acquire().await;
        let report = self.run(name, &options).await;
        drop(permit);
        self.in_flight.remove(name);
        Ok(report)
    }

    async fn run(&self, name: &str, options: &ReloadOptions) -> ReloadReport {
        let mut timer = PhaseTimer::new();
        info!(plugin = name, "hot reload starting");

        // Phase 1: VALIDATING.
        let began = Instant::now();
        let validated = self.validate(name, options);
        timer.record(ReloadPhase::Validating, began);
        let metadata = match validated {
            Ok(metadata) => metadata,
            Err(e) => return self.failure(name, timer, ReloadPhase::Validating, &e),
        };

        // Phase 2: CAPTURING_STATE.
        let began = Instant::now();
        let snapshot = if options.preserve_state {
            match self.capture(name, &metadata).await {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    timer.record(ReloadPhase::CapturingState, began);
                    return self.failure(name, timer, ReloadPhase::CapturingState, &e);
                }
            }
        } else {
            None
        };
        timer.record(ReloadPhase::CapturingState, began);

        // Bundle backup for strict rollback, before anything
        // destructive happens. The loader's staged copy still holds the
        // bytes of the running build even when a new build has already
        // replaced the file on disk.
        let old_bytes = self
            .manager
            .loader()
            .namespace(name)
            .map_or_else(|| metadata.source.clone(), |ns| ns.root().to_path_buf());
        let backup = self.backup_bundle(name, &old_bytes);

        match self
            .swap(name, options, &metadata, snapshot.as_ref(), &mut timer)
            .await
        {
            Ok(state_preserved) => {
                let began = Instant::now();
                if let Some(backup) = &backup {
                    let _ = std::fs::remove_file(backup);
                }
                timer.record(ReloadPhase::Completed, began);
                let total = timer.started.elapsed();
                info!(
                    plugin = name,
                    total_ms = total.as_millis(),
                    state_preserved,
                    "hot reload completed"
                );
                ReloadReport {
                    plugin: name.to_string(),
                    success: true,
                    phases: timer.records,
                    total,
                    state_preserved,
                    failed_phase: None,
                    error: None,
                }
            }
            Err((phase, e)) => {
                let began = Instant::now();
                self.rollback(name, &metadata.source, backup.as_deref()).await;
                timer.record(ReloadPhase::RollingBack, began);
                self.failure(name, timer, phase, &e)
            }
        }
    }

    /// Phases 3–7. Returns whether state was preserved.
    async fn swap(
        &self,
        name: &str,
        options: &ReloadOptions,
        metadata: &gantry_core::PluginMetadata,
        snapshot: Option<&StateSnapshot>,
        timer: &mut PhaseTimer,
    ) -> std::result::Result<bool, (ReloadPhase, Error)> {
        // Phase 3: GRACEFUL_SHUTDOWN.
        let began = Instant::now();
        let quiesced = self.quiesce(name, options).await;
        timer.record(ReloadPhase::GracefulShutdown, began);
        if let Err(e) = quiesced {
            return Err((ReloadPhase::GracefulShutdown, e));
        }

        // Phase 4: DISABLING (disable, unload, unregister). Teardown
        // hook failures abort the swap and roll back; the best-effort
        // unload path is not used here.
        let began = Instant::now();
        let disabled = self.disable_old(name).await;
        timer.record(ReloadPhase::Disabling, began);
        if let Err(e) = disabled {
            return Err((ReloadPhase::Disabling, e));
        }

        // Phase 5: LOADING_NEW_VERSION.
        let began = Instant::now();
        let loaded = self.load_new(name, metadata).await;
        timer.record(ReloadPhase::LoadingNewVersion, began);
        if let Err(e) = loaded {
            return Err((ReloadPhase::LoadingNewVersion, e));
        }

        // Phase 6: RESTORING_STATE. Failures are logged, never fatal.
        let began = Instant::now();
        let state_preserved = match snapshot {
            Some(snapshot) => self.restore(name, snapshot).await,
            None => false,
        };
        timer.record(ReloadPhase::RestoringState, began);

        // Phase 7: ENABLING.
        let began = Instant::now();
        let enabled = self.manager.enable(name).await;
        timer.record(ReloadPhase::Enabling, began);
        if let Err(e) = enabled {
            return Err((ReloadPhase::Enabling, e));
        }

        Ok(state_preserved)
    }

    fn validate(
        &self,
        name: &str,
        options: &ReloadOptions,
    ) -> Result<gantry_core::PluginMetadata> {
        let Some(instance) = self.manager.registry().get(name) else {
            return Err(Error::NotFound {
                name: name.to_string(),
            });
        };
        if !self.manager.is_enabled(name) {
            return Err(Error::state(format!(
                "plugin '{name}' is not enabled ({})",
                self.manager.registry().get_state(name)
            )));
        }
        if let Some(capability) = instance.hot_reload()
            && !capability.can_hot_reload()
            && !options.force
        {
            return Err(Error::state(format!(
                "plugin '{name}' declined the hot reload"
            )));
        }
        self.manager.metadata(name).ok_or_else(|| Error::NotFound {
            name: name.to_string(),
        })
    }

    async fn capture(
        &self,
        name: &str,
        metadata: &gantry_core::PluginMetadata,
    ) -> Result<StateSnapshot> {
        let mut snapshot = StateSnapshot::new(name, metadata.version.clone());

        if let Ok(config) = self.manager.configs().plugin(name) {
            snapshot.config_data = config.all();
        }
        if let Some(instance) = self.manager.registry().get(name)
            && let Some(stateful) = instance.stateful()
        {
            snapshot.custom_data = stateful
                .capture_state()
                .await
                .map_err(|e| Error::state(format!("state capture failed: {e}")))?;
        }
        snapshot.active_task_ids = self.manager.scheduler().tasks_for_owner(name);

        self.snapshots.write(&snapshot)?;
        debug!(
            plugin = name,
            config_keys = snapshot.config_data.len(),
            tasks = snapshot.active_task_ids.len(),
            "state captured"
        );
        Ok(snapshot)
    }

    async fn quiesce(&self, name: &str, options: &ReloadOptions) -> Result<()> {
        let Some(instance) = self.manager.registry().get(name) else {
            return Err(Error::NotFound {
                name: name.to_string(),
            });
        };
        let Some(capability) = instance.hot_reload() else {
            return Ok(());
        };
        match tokio::time::timeout(options.shutdown_timeout, capability.prepare_for_reload()).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if options.force => {
                warn!(plugin = name, error = %e, "quiesce failed, forced through");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) if options.force => {
                warn!(plugin = name, "quiesce timed out, forced through");
                Ok(())
            }
            Err(_) => Err(Error::state(format!(
                "plugin '{name}' did not quiesce within {:?}",
                options.shutdown_timeout
            ))),
        }
    }

    /// Take the old instance down, surfacing `on_disable` and
    /// `on_unload` failures so the caller can roll back.
    async fn disable_old(&self, name: &str) -> Result<()> {
        self.manager.disable(name).await?;
        self.manager.unload_strict(name).await
    }

    async fn load_new(
        &self,
        name: &str,
        metadata: &gantry_core::PluginMetadata,
    ) -> Result<()> {
        if !metadata.source.exists() {
            return Err(Error::load(&metadata.source, "bundle file disappeared"));
        }
        self.manager.flush_metadata(name);
        self.manager.try_load(name, &metadata.source).await
    }

    /// Restore captured state into the freshly loaded instance. Only
    /// compatible snapshot versions are applied: exact match, or same
    /// major with a minor that did not go backwards.
    async fn restore(&self, name: &str, snapshot: &StateSnapshot) -> bool {
        let Some(new_metadata) = self.manager.metadata(name) else {
            return false;
        };
        if !snapshot.version.compatible_with(&new_metadata.version) {
            warn!(
                plugin = name,
                old = %snapshot.version,
                new = %new_metadata.version,
                "snapshot version incompatible, state not restored"
            );
            return false;
        }

        let mut restored = true;
        match self.manager.configs().plugin(name) {
            Ok(config) => {
                for (key, value) in &snapshot.config_data {
                    config.set(key.clone(), value);
                }
                if let Err(e) = config.save() {
                    warn!(plugin = name, error = %e, "config restore failed");
                    restored = false;
                }
            }
            Err(e) => {
                warn!(plugin = name, error = %e, "config restore failed");
                restored = false;
            }
        }

        if let Some(instance) = self.manager.registry().get(name)
            && let Some(stateful) = instance.stateful()
        {
            if let Err(e) = stateful.restore_state(snapshot.custom_data.clone()).await {
                warn!(plugin = name, error = %e, "custom state restore failed");
                restored = false;
            }
            if let Err(e) = stateful.restore_tasks(&snapshot.active_task_ids).await {
                warn!(plugin = name, error = %e, "task restore failed");
                restored = false;
            }
        }

        debug!(plugin = name, restored, "state restore finished");
        restored
    }

    fn backup_bundle(&self, name: &str, source: &std::path::Path) -> Option<PathBuf> {
        let dir = self.snapshots.dir();
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!(plugin = name, error = %e, "cannot create state directory");
            return None;
        }
        let backup = dir.join(format!("{name}.rollback.{}", gantry_core::BUNDLE_EXTENSION));
        match std::fs::copy(source, &backup) {
            Ok(_) => Some(backup),
            Err(e) => {
                warn!(plugin = name, error = %e, "pre-reload bundle backup failed");
                None
            }
        }
    }

    /// Best-effort rollback: restore the bundle bytes and bring the old
    /// code back up. Ends with the plugin enabled or in the error
    /// state, never silently disabled.
    async fn rollback(&self, name: &str, source: &std::path::Path, backup: Option<&std::path::Path>) {
        warn!(plugin = name, "rolling back hot reload");
        if let Some(backup) = backup {
            if let Err(e) = std::fs::copy(backup, source) {
                warn!(plugin = name, error = %e, "bundle restore failed");
            } else {
                let _ = std::fs::remove_file(backup);
            }
        }

        if !self.manager.registry().contains(name) {
            self.manager.flush_metadata(name);
            if let Err(e) = self.manager.try_load(name, source).await {
                warn!(plugin = name, error = %e, "cannot re-load old bundle");
                return;
            }
        }
        if !self.manager.is_enabled(name)
            && let Err(e) = self.manager.enable(name).await
        {
            warn!(plugin = name, error = %e, "cannot re-enable old bundle");
            self.manager
                .registry()
                .force_state(name, gantry_core::PluginState::Error);
        }
    }

    fn failure(
        &self,
        name: &str,
        timer: PhaseTimer,
        phase: ReloadPhase,
        error: &Error,
    ) -> ReloadReport {
        warn!(plugin = name, %phase, error = %error, "hot reload failed");
        let total = timer.started.elapsed();
        ReloadReport {
            plugin: name.to_string(),
            success: false,
            phases: timer.records,
            total,
            state_preserved: false,
            failed_phase: Some(phase),
            error: Some(error.to_string()),
        }
    }

    /// Watch the plugins directory and reload plugins whose bundles
    /// change.
    ///
    /// The watcher's stability gate debounces raw events; an additional
    /// guard here drops triggers for plugins already reloading. Triggers
    /// are funneled through a single queue consumer.
    pub fn start_watching(self: &Arc<Self>) -> Result<FileWatcher> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
        let callback: WatchCallback = Arc::new(move |event| {
            if let WatchEvent::Changed(path) = event {
                let _ = tx.send(path);
            }
        });
        let watcher = FileWatcher::start(
            self.manager.options().plugins_dir.clone(),
            WatchOptions::default(),
            callback,
        )
        .map_err(|e| Error::state(format!("cannot watch plugins directory: {e}")))?;

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                orchestrator.handle_bundle_change(&path).await;
            }
        });
        info!("auto-reload watcher started");
        Ok(watcher)
    }

    async fn handle_bundle_change(&self, path: &std::path::Path) {
        let name = match Bundle::read_metadata(path) {
            Ok(Some(metadata)) => metadata.name,
            Ok(None) => {
                warn!(bundle = %path.display(), "changed bundle has no manifest, ignoring");
                return;
            }
            Err(e) => {
                warn!(bundle = %path.display(), error = %e, "cannot read changed bundle");
                return;
            }
        };

        if !self.manager.registry().contains(&name) {
            debug!(plugin = %name, "changed bundle is not loaded, ignoring");
            return;
        }
        if self.is_reloading(&name) {
            debug!(plugin = %name, "reload already in flight, trigger dropped");
            return;
        }

        match self.reload(&name, ReloadOptions::auto()).await {
            Ok(report) if report.success => {
                info!(plugin = %name, total_ms = report.total.as_millis(), "auto reload succeeded");
            }
            Ok(report) => {
                warn!(
                    plugin = %name,
                    phase = ?report.failed_phase,
                    error = ?report.error,
                    "auto reload failed"
                );
            }
            Err(e) => debug!(plugin = %name, error = %e, "auto reload skipped"),
        }
    }
}
