use crate::config::{RuntimeSettings, WatchdogSettings};
use crate::error::DeployError;
use crate::model::ServiceStatus;
use crate::notify::{Notifier, Recipient};
use crate::registry::ServiceRegistry;
use crate::runtime;
use crate::supervisor::Supervisor;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

pub const BACKOFF_BASE_MS: u64 = 100;
pub const BACKOFF_CAP_MS: u64 = 30_000;

/// Exponential backoff delay: 100ms * 2^count, capped at 30s
pub fn compute_backoff(restart_count: u32) -> Duration {
    let ms = BACKOFF_BASE_MS.saturating_mul(2u64.saturating_pow(restart_count));
    Duration::from_millis(ms.min(BACKOFF_CAP_MS))
}

struct Monitor {
    generation: u64,
    cancel: watch::Sender<bool>,
}

struct Inner {
    registry: ServiceRegistry,
    supervisor: Arc<Supervisor>,
    notifier: Arc<dyn Notifier>,
    runtime: RuntimeSettings,
    settings: WatchdogSettings,
    active: Mutex<HashMap<String, Monitor>>,
    generation: AtomicU64,
}

/// One polling monitor per service that restarts the process when it dies
/// while the service is meant to be running.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

enum Tick {
    Healthy,
    Restarted,
    Retire,
}

impl Watchdog {
    pub fn new(
        registry: ServiceRegistry,
        supervisor: Arc<Supervisor>,
        notifier: Arc<dyn Notifier>,
        runtime: RuntimeSettings,
        settings: WatchdogSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                supervisor,
                notifier,
                runtime,
                settings,
                active: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Starts a monitor for the service. Returns `false` if one is already active.
    pub fn attach(&self, service_id: &str) -> bool {
        let (tx, rx) = watch::channel(false);
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.contains_key(service_id) {
                return false;
            }
            active.insert(
                service_id.to_string(),
                Monitor {
                    generation,
                    cancel: tx,
                },
            );
        }
        tracing::debug!(service = service_id, generation, "watchdog attached");
        let inner = Arc::clone(&self.inner);
        let id = service_id.to_string();
        tokio::spawn(async move { run(inner, id, generation, rx).await });
        true
    }

    /// Stops the service's monitor, if any, before its next tick.
    pub fn cancel(&self, service_id: &str) {
        let removed = {
            let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            active.remove(service_id)
        };
        if let Some(monitor) = removed {
            let _ = monitor.cancel.send(true);
            tracing::debug!(service = service_id, "watchdog cancelled");
        }
    }

    pub fn cancel_all(&self) {
        let drained: Vec<_> = {
            let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            active.drain().collect()
        };
        for (_, monitor) in drained {
            let _ = monitor.cancel.send(true);
        }
    }

    pub fn is_active(&self, service_id: &str) -> bool {
        let active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
        active.contains_key(service_id)
    }
}

impl Inner {
    fn retire(&self, service_id: &str, generation: u64) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active
            .get(service_id)
            .is_some_and(|m| m.generation == generation)
        {
            active.remove(service_id);
        }
    }

    fn still_running(&self, service_id: &str) -> Result<bool, DeployError> {
        Ok(self
            .registry
            .find(service_id)?
            .is_some_and(|s| s.status == ServiceStatus::Running))
    }

    async fn tick(&self, service_id: &str, crashes: u32) -> Result<Tick, DeployError> {
        if !self.still_running(service_id)? {
            return Ok(Tick::Retire);
        }
        if self.supervisor.is_alive(service_id).await {
            return Ok(Tick::Healthy);
        }

        let _guard = self.supervisor.lock(service_id).await;
        // A concurrent operation may have changed things while we waited
        let Some(service) = self.registry.find(service_id)? else {
            return Ok(Tick::Retire);
        };
        if service.status != ServiceStatus::Running {
            return Ok(Tick::Retire);
        }
        if self.supervisor.is_alive(service_id).await {
            return Ok(Tick::Healthy);
        }

        if crashes >= self.settings.max_restarts {
            self.registry
                .transition(service_id, ServiceStatus::CrashLoop, "crash-loop")?;
            tracing::error!(
                service = service_id,
                restarts = crashes,
                "service keeps crashing, automatic restarts disabled"
            );
            let msg = format!(
                "Service {service_id} crashed {crashes} times in a row and was marked crash_loop. Redeploy it after fixing the problem."
            );
            self.notifier.notify(Recipient::User(service.user_id), &msg);
            self.notifier.notify(
                Recipient::Operator,
                &format!("Service {service_id} of user {} is crash-looping", service.user_id),
            );
            return Ok(Tick::Retire);
        }

        tracing::warn!(service = service_id, crashes, "process died, restarting");
        let spec = runtime::launch_spec(&service, &self.runtime)?;
        self.supervisor.start(service_id, &spec).await?;
        self.registry.touch_restart(service_id)?;
        self.notifier.notify(
            Recipient::Operator,
            &format!(
                "Auto-restarted service {service_id} for user {}",
                service.user_id
            ),
        );
        Ok(Tick::Restarted)
    }
}

async fn run(inner: Arc<Inner>, service_id: String, generation: u64, mut cancel: watch::Receiver<bool>) {
    let interval = Duration::from_millis(inner.settings.interval_ms);
    let min_uptime = Duration::from_millis(inner.settings.min_uptime_ms);
    let mut crashes: u32 = 0;
    let mut last_restart: Option<Instant> = None;

    loop {
        let mut wait = interval;
        if crashes > 0 && !inner.supervisor.is_alive(&service_id).await {
            wait = wait.max(compute_backoff(crashes - 1));
        }
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.changed() => break,
        }
        if *cancel.borrow() {
            break;
        }

        match inner.tick(&service_id, crashes).await {
            Ok(Tick::Healthy) => {
                if last_restart.is_some_and(|t| t.elapsed() >= min_uptime) {
                    crashes = 0;
                    last_restart = None;
                }
            }
            Ok(Tick::Restarted) => {
                crashes += 1;
                last_restart = Some(Instant::now());
            }
            Ok(Tick::Retire) => break,
            Err(e) => {
                crashes += 1;
                tracing::error!(service = %service_id, error = %e, "watchdog restart failed");
                inner.notifier.notify(
                    Recipient::Operator,
                    &format!("Watchdog could not restart service {service_id}: {e}"),
                );
            }
        }
    }

    inner.retire(&service_id, generation);
    tracing::debug!(service = %service_id, generation, "watchdog retired");
}
