//! The deployment pipeline and every other operation a user or admin can run
//! against a service.
//!
//! Each operation on an existing service holds that service's lock from the
//! [`Supervisor`] for its whole duration. Every failure is reported to the
//! initiating user exactly once, and every success produces one user message,
//! one operator message and one audit entry.

use crate::archive::{self, Upload};
use crate::config::Settings;
use crate::error::DeployError;
use crate::model::{ActivityLogEntry, Actor, Ban, ProjectType, Service, ServiceStatus, ServiceView};
use crate::notify::{Notifier, Recipient};
use crate::paths::Paths;
use crate::ports::PortAllocator;
use crate::registry::ServiceRegistry;
use crate::runtime;
use crate::store::Store;
use crate::supervisor::Supervisor;
use crate::validator::{Validator, Verdict};
use crate::watchdog::Watchdog;
use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct Orchestrator {
    paths: Paths,
    settings: Settings,
    registry: ServiceRegistry,
    supervisor: Arc<Supervisor>,
    watchdog: Watchdog,
    ports: PortAllocator,
    validator: Arc<dyn Validator>,
    notifier: Arc<dyn Notifier>,
}

/// Removes a service root on drop unless disarmed.
struct RootGuard {
    path: PathBuf,
    armed: bool,
}

impl RootGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        if self.armed
            && let Err(e) = std::fs::remove_dir_all(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to clean up service root");
        }
    }
}

impl Orchestrator {
    pub fn new(
        paths: Paths,
        settings: Settings,
        store: Arc<dyn Store>,
        validator: Arc<dyn Validator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let registry = ServiceRegistry::new(store);
        let supervisor = Arc::new(Supervisor::new(
            paths.clone(),
            Duration::from_millis(settings.supervisor.kill_timeout_ms),
        ));
        let watchdog = Watchdog::new(
            registry.clone(),
            Arc::clone(&supervisor),
            Arc::clone(&notifier),
            settings.runtime.clone(),
            settings.watchdog.clone(),
        );
        let ports = PortAllocator::new(&settings.ports);
        Self {
            paths,
            settings,
            registry,
            supervisor,
            watchdog,
            ports,
            validator,
            notifier,
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // -----------------------------------------------------------------------
    // Deploy
    // -----------------------------------------------------------------------

    /// Turns an uploaded archive into a new running service.
    pub async fn deploy(&self, actor: Actor, upload: Upload) -> Result<Service, DeployError> {
        let result = self.deploy_inner(actor, &upload).await;
        drop(upload);
        let service = self.report(actor, "deploy", result)?;

        let link = service.link(&self.settings.public_host);
        let mut msg = format!(
            "Deployment successful! Service ID: {}\nLink: {link}",
            service.id
        );
        if service.project_type == ProjectType::Dynamic {
            msg.push_str(&format!(
                "\nNote: the application must listen on 0.0.0.0 and the port given in ${}.",
                self.settings.runtime.port_env
            ));
        }
        self.succeed(
            actor,
            "deploy",
            &service.id,
            msg,
            format!(
                "New deployment by user {}: {} ({}) on port {}",
                actor.user_id, service.id, service.project_type, service.port
            ),
        );
        Ok(service)
    }

    async fn deploy_inner(&self, actor: Actor, upload: &Upload) -> Result<Service, DeployError> {
        let staged = self.intake(actor, upload).await?;

        let user_key = format!("user:{}", actor.user_id);
        let _user_guard = self.supervisor.lock(&user_key).await;
        let store = self.registry.store();
        let user = store.user(actor.user_id)?;
        let limit = self.settings.quota_for(user.premium);
        if user.deployment_count >= limit {
            return Err(DeployError::QuotaExceeded { limit });
        }

        let service_id = self.new_service_id()?;
        let root = self.paths.service_root(actor.user_id, &service_id);
        archive::promote(staged, &root)?;
        let root_guard = RootGuard::new(root.clone());

        let rt = &self.settings.runtime;
        let project_type = runtime::classify(&root, rt)?;
        runtime::provision(&root, project_type, rt).await?;

        let lease = self.ports.allocate(&store.assigned_ports()?)?;
        let now = Utc::now();
        let service = Service {
            id: service_id.clone(),
            user_id: actor.user_id,
            port: lease.port(),
            status: ServiceStatus::Running,
            project_type,
            path: root.to_string_lossy().into_owned(),
            created_at: now,
            last_restart: now,
            domain: None,
            domain_token: None,
            domain_verified: false,
        };

        let _guard = self.supervisor.lock(&service_id).await;
        self.registry.create(&service)?;
        drop(lease);
        store.adjust_deployment_count(actor.user_id, 1)?;

        let started = match runtime::launch_spec(&service, rt) {
            Ok(spec) => self.supervisor.start(&service_id, &spec).await.map_err(DeployError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            self.registry.remove(&service_id)?;
            store.adjust_deployment_count(actor.user_id, -1)?;
            return Err(e);
        }
        root_guard.disarm();

        if user.premium {
            self.watchdog.attach(&service_id);
        }
        Ok(service)
    }

    fn new_service_id(&self) -> Result<String, DeployError> {
        loop {
            let id = generate_service_id();
            if self.registry.find(&id)?.is_none() {
                return Ok(id);
            }
        }
    }

    /// Extracts the upload into staging and runs the validator over it.
    async fn intake(&self, actor: Actor, upload: &Upload) -> Result<TempDir, DeployError> {
        let staged = archive::extract(upload.path(), &self.paths.staging_dir()).await?;

        let validator = Arc::clone(&self.validator);
        let dir = staged.path().to_path_buf();
        let verdict = tokio::task::spawn_blocking(move || validator.scan(&dir))
            .await
            .map_err(|e| DeployError::Internal(format!("scan task failed: {e}")))??;

        if let Verdict::Malicious(reason) = verdict {
            self.registry.store().ban(&Ban {
                user_id: actor.user_id,
                reason: reason.clone(),
                banned_at: Utc::now(),
            })?;
            tracing::warn!(user = actor.user_id, %reason, "banned user for malicious upload");
            self.notifier.notify(
                Recipient::Operator,
                &format!(
                    "User {} banned for malicious upload: {reason}",
                    actor.user_id
                ),
            );
            return Err(DeployError::ValidationFailed(reason));
        }
        Ok(staged)
    }

    // -----------------------------------------------------------------------
    // Update
    // -----------------------------------------------------------------------

    /// Replaces a service's content with a new upload and restarts it. On any
    /// failure the previous content and process state are restored.
    pub async fn update(
        &self,
        actor: Actor,
        service_id: &str,
        upload: Upload,
    ) -> Result<Service, DeployError> {
        let result = self.update_inner(actor, service_id, &upload).await;
        drop(upload);
        let service = self.report(actor, "update", result)?;
        self.succeed(
            actor,
            "update",
            service_id,
            format!(
                "Update successful for {service_id}! Link: {}",
                service.link(&self.settings.public_host)
            ),
            format!("User {} updated service {service_id}", actor.user_id),
        );
        Ok(service)
    }

    async fn update_inner(
        &self,
        actor: Actor,
        service_id: &str,
        upload: &Upload,
    ) -> Result<Service, DeployError> {
        let _guard = self.supervisor.lock(service_id).await;
        let original = self.registry.authorized(actor, service_id)?;
        if matches!(
            original.status,
            ServiceStatus::Maintenance | ServiceStatus::Suspended
        ) {
            return Err(DeployError::InvalidState {
                id: service_id.to_string(),
                op: "update",
                status: original.status,
            });
        }
        let was_running = original.status == ServiceStatus::Running;

        self.watchdog.cancel(service_id);
        self.supervisor.stop(service_id).await;

        let replaced = match self.intake(actor, upload).await {
            Ok(staged) => self.replace_content(&original, staged).await,
            Err(e) => Err(e),
        };
        match replaced {
            Ok(service) => {
                if self.is_premium(service.user_id) {
                    self.watchdog.attach(service_id);
                }
                Ok(service)
            }
            Err(e) => {
                self.restore(&original, was_running).await;
                Err(e)
            }
        }
    }

    async fn replace_content(&self, original: &Service, staged: TempDir) -> Result<Service, DeployError> {
        let root = PathBuf::from(&original.path);
        let previous = previous_root(&root);
        remove_dir_if_exists(&previous).await?;
        if root.exists() {
            std::fs::rename(&root, &previous)?;
        }
        if let Err(e) = archive::promote(staged, &root) {
            put_back(&root, &previous).await;
            return Err(e.into());
        }

        match self.activate(original, &root).await {
            Ok(service) => {
                if let Err(e) = remove_dir_if_exists(&previous).await {
                    tracing::warn!(path = %previous.display(), error = %e, "failed to remove previous content");
                }
                Ok(service)
            }
            Err(e) => {
                put_back(&root, &previous).await;
                Err(e)
            }
        }
    }

    /// Classifies and provisions the new content, persists the service as
    /// running and starts it.
    async fn activate(&self, original: &Service, root: &Path) -> Result<Service, DeployError> {
        let rt = &self.settings.runtime;
        let project_type = runtime::classify(root, rt)?;
        runtime::provision(root, project_type, rt).await?;

        let mut service = original.clone();
        service.project_type = project_type;
        self.registry.save(&service)?;
        let service = self
            .registry
            .transition(&service.id, ServiceStatus::Running, "update")?;
        let spec = runtime::launch_spec(&service, rt)?;
        self.supervisor.start(&service.id, &spec).await?;
        Ok(service)
    }

    /// Puts the persisted record back and restarts the old process if it was up.
    async fn restore(&self, original: &Service, was_running: bool) {
        if let Err(e) = self.registry.save(original) {
            tracing::error!(service = %original.id, error = %e, "failed to restore service record");
            return;
        }
        if !was_running {
            return;
        }
        let started = match runtime::launch_spec(original, &self.settings.runtime) {
            Ok(spec) => self
                .supervisor
                .start(&original.id, &spec)
                .await
                .map_err(DeployError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            tracing::error!(service = %original.id, error = %e, "failed to restart previous version");
        }
        if self.is_premium(original.user_id) {
            self.watchdog.attach(&original.id);
        }
    }

    // -----------------------------------------------------------------------
    // Resume: redeploy, maintenance off, unsuspend
    // -----------------------------------------------------------------------

    pub async fn redeploy(&self, actor: Actor, service_id: &str) -> Result<Service, DeployError> {
        let allowed = [
            ServiceStatus::Running,
            ServiceStatus::Stopped,
            ServiceStatus::CrashLoop,
        ];
        let result = self.resume(actor, service_id, "redeploy", &allowed).await;
        let service = self.report(actor, "redeploy", result)?;
        self.succeed(
            actor,
            "redeploy",
            service_id,
            format!(
                "Service {service_id} redeployed. Link: {}",
                service.link(&self.settings.public_host)
            ),
            format!("User {} redeployed service {service_id}", actor.user_id),
        );
        Ok(service)
    }

    /// Turns maintenance mode on (stops the process) or off (restarts it).
    pub async fn set_maintenance(
        &self,
        actor: Actor,
        service_id: &str,
        enabled: bool,
    ) -> Result<Service, DeployError> {
        if enabled {
            let result = self
                .pause(actor, service_id, ServiceStatus::Maintenance, "maintenance")
                .await;
            let service = self.report(actor, "maintenance", result)?;
            self.succeed(
                actor,
                "maintenance_on",
                service_id,
                format!("Service {service_id} is now in maintenance mode."),
                format!("User {} put service {service_id} into maintenance", actor.user_id),
            );
            Ok(service)
        } else {
            let result = self
                .resume(actor, service_id, "maintenance", &[ServiceStatus::Maintenance])
                .await;
            let service = self.report(actor, "maintenance", result)?;
            self.succeed(
                actor,
                "maintenance_off",
                service_id,
                format!(
                    "Service {service_id} is back online. Link: {}",
                    service.link(&self.settings.public_host)
                ),
                format!("User {} took service {service_id} out of maintenance", actor.user_id),
            );
            Ok(service)
        }
    }

    pub async fn unsuspend(&self, actor: Actor, service_id: &str) -> Result<Service, DeployError> {
        let result = if actor.admin {
            self.resume(actor, service_id, "unsuspend", &[ServiceStatus::Suspended])
                .await
        } else {
            Err(DeployError::AdminOnly)
        };
        let service = self.report(actor, "unsuspend", result)?;
        if service.user_id != actor.user_id {
            self.notifier.notify(
                Recipient::User(service.user_id),
                &format!("Your service {service_id} has been unsuspended."),
            );
        }
        self.succeed(
            actor,
            "unsuspend",
            service_id,
            format!("Service {service_id} unsuspended."),
            format!("Admin {} unsuspended service {service_id}", actor.user_id),
        );
        Ok(service)
    }

    async fn resume(
        &self,
        actor: Actor,
        service_id: &str,
        op: &'static str,
        allowed: &[ServiceStatus],
    ) -> Result<Service, DeployError> {
        let _guard = self.supervisor.lock(service_id).await;
        let original = self.registry.authorized(actor, service_id)?;
        if !allowed.contains(&original.status) {
            return Err(DeployError::InvalidState {
                id: service_id.to_string(),
                op,
                status: original.status,
            });
        }

        self.watchdog.cancel(service_id);
        self.supervisor.stop(service_id).await;

        let service = self
            .registry
            .transition(service_id, ServiceStatus::Running, op)?;
        let started = match runtime::launch_spec(&service, &self.settings.runtime) {
            Ok(spec) => self
                .supervisor
                .start(service_id, &spec)
                .await
                .map_err(DeployError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            let mut restored = original;
            // the old process was stopped above
            if restored.status == ServiceStatus::Running {
                restored.status = ServiceStatus::Stopped;
            }
            self.registry.save(&restored)?;
            return Err(e);
        }

        if self.is_premium(service.user_id) {
            self.watchdog.attach(service_id);
        }
        Ok(service)
    }

    // -----------------------------------------------------------------------
    // Pause: stop, maintenance on, suspend
    // -----------------------------------------------------------------------

    pub async fn stop(&self, actor: Actor, service_id: &str) -> Result<Service, DeployError> {
        let result = self
            .pause(actor, service_id, ServiceStatus::Stopped, "stop")
            .await;
        let service = self.report(actor, "stop", result)?;
        self.succeed(
            actor,
            "stop",
            service_id,
            format!("Service {service_id} stopped."),
            format!("User {} stopped service {service_id}", actor.user_id),
        );
        Ok(service)
    }

    pub async fn suspend(&self, actor: Actor, service_id: &str) -> Result<Service, DeployError> {
        let result = if actor.admin {
            self.pause(actor, service_id, ServiceStatus::Suspended, "suspend")
                .await
        } else {
            Err(DeployError::AdminOnly)
        };
        let service = self.report(actor, "suspend", result)?;
        if service.user_id != actor.user_id {
            self.notifier.notify(
                Recipient::User(service.user_id),
                &format!("Your service {service_id} has been suspended by an administrator."),
            );
        }
        self.succeed(
            actor,
            "suspend",
            service_id,
            format!("Service {service_id} suspended."),
            format!("Admin {} suspended service {service_id}", actor.user_id),
        );
        Ok(service)
    }

    async fn pause(
        &self,
        actor: Actor,
        service_id: &str,
        next: ServiceStatus,
        op: &'static str,
    ) -> Result<Service, DeployError> {
        let _guard = self.supervisor.lock(service_id).await;
        let service = self.registry.authorized(actor, service_id)?;
        self.registry.check(&service, next, op)?;

        self.watchdog.cancel(service_id);
        self.supervisor.stop(service_id).await;
        self.registry.transition(service_id, next, op)
    }

    // -----------------------------------------------------------------------
    // Delete
    // -----------------------------------------------------------------------

    /// Stops the process, removes the content and the record, and gives the
    /// quota slot and port back.
    pub async fn delete(&self, actor: Actor, service_id: &str) -> Result<(), DeployError> {
        let result = self.delete_inner(actor, service_id).await;
        self.report(actor, "delete", result)?;
        self.supervisor.forget(service_id);
        self.succeed(
            actor,
            "delete",
            service_id,
            format!("Service {service_id} deleted."),
            format!("User {} deleted service {service_id}", actor.user_id),
        );
        Ok(())
    }

    async fn delete_inner(&self, actor: Actor, service_id: &str) -> Result<(), DeployError> {
        let _guard = self.supervisor.lock(service_id).await;
        let service = self.registry.authorized(actor, service_id)?;

        self.watchdog.cancel(service_id);
        self.supervisor.stop(service_id).await;

        let root = PathBuf::from(&service.path);
        remove_dir_if_exists(&root).await?;
        remove_dir_if_exists(&previous_root(&root)).await?;
        self.registry.remove(service_id)?;
        self.registry
            .store()
            .adjust_deployment_count(service.user_id, -1)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Premium
    // -----------------------------------------------------------------------

    /// Grants or revokes premium. Watchdogs follow the flag for the user's
    /// running services.
    pub async fn set_premium(
        &self,
        actor: Actor,
        target_user: i64,
        premium: bool,
    ) -> Result<(), DeployError> {
        let result = self.set_premium_inner(actor, target_user, premium);
        self.report(actor, "premium", result)?;
        let (action, state) = if premium {
            ("premium_on", "granted")
        } else {
            ("premium_off", "revoked")
        };
        if target_user != actor.user_id {
            self.notifier.notify(
                Recipient::User(target_user),
                &format!("Premium has been {state} for your account."),
            );
        }
        self.succeed(
            actor,
            action,
            &format!("user {target_user}"),
            format!("Premium {state} for user {target_user}."),
            format!("Admin {} {state} premium for user {target_user}", actor.user_id),
        );
        Ok(())
    }

    fn set_premium_inner(&self, actor: Actor, target_user: i64, premium: bool) -> Result<(), DeployError> {
        if !actor.admin {
            return Err(DeployError::AdminOnly);
        }
        self.registry.store().set_premium(target_user, premium)?;
        for service in self.registry.owned_by(target_user)? {
            if premium && service.status == ServiceStatus::Running {
                self.watchdog.attach(&service.id);
            } else if !premium {
                self.watchdog.cancel(&service.id);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Bans
    // -----------------------------------------------------------------------

    /// Bans a user from every entry point. Their services keep their state.
    pub async fn ban(&self, actor: Actor, target_user: i64, reason: &str) -> Result<(), DeployError> {
        let result = if actor.admin {
            self.registry
                .store()
                .ban(&Ban {
                    user_id: target_user,
                    reason: reason.to_string(),
                    banned_at: Utc::now(),
                })
                .map_err(DeployError::from)
        } else {
            Err(DeployError::AdminOnly)
        };
        self.report(actor, "ban", result)?;
        self.notifier.notify(
            Recipient::User(target_user),
            &format!("You have been banned: {reason}"),
        );
        self.succeed(
            actor,
            "ban",
            &format!("user {target_user}"),
            format!("Banned user {target_user}: {reason}"),
            format!("Admin {} banned user {target_user}: {reason}", actor.user_id),
        );
        Ok(())
    }

    /// Lifts a ban. Fails with `NotFound` when the user was not banned.
    pub async fn unban(&self, actor: Actor, target_user: i64) -> Result<(), DeployError> {
        let result = if actor.admin {
            match self.registry.store().unban(target_user) {
                Ok(true) => Ok(()),
                Ok(false) => Err(DeployError::NotFound(format!("ban for user {target_user}"))),
                Err(e) => Err(e.into()),
            }
        } else {
            Err(DeployError::AdminOnly)
        };
        self.report(actor, "unban", result)?;
        self.notifier
            .notify(Recipient::User(target_user), "You have been unbanned.");
        self.succeed(
            actor,
            "unban",
            &format!("user {target_user}"),
            format!("Unbanned user {target_user}."),
            format!("Admin {} unbanned user {target_user}", actor.user_id),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn list(&self, actor: Actor) -> Result<Vec<Service>, DeployError> {
        self.registry.owned_by(actor.user_id)
    }

    pub async fn info(&self, actor: Actor, service_id: &str) -> Result<ServiceView, DeployError> {
        let service = self.registry.authorized(actor, service_id)?;
        let pid = self.supervisor.pid(service_id).await;
        Ok(ServiceView {
            link: service.link(&self.settings.public_host),
            pid,
            uptime_secs: match pid {
                Some(_) => self.supervisor.uptime(service_id).await.map(|d| d.as_secs()),
                None => None,
            },
            monitored: self.watchdog.is_active(service_id),
            service,
        })
    }

    /// Returns the last `lines` lines of the service's output log.
    pub async fn logs(
        &self,
        actor: Actor,
        service_id: &str,
        lines: usize,
    ) -> Result<Vec<String>, DeployError> {
        self.registry.authorized(actor, service_id)?;
        match tokio::fs::read(self.paths.service_log(service_id)).await {
            Ok(bytes) => Ok(tail_lines(&String::from_utf8_lossy(&bytes), lines)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Daemon lifecycle
    // -----------------------------------------------------------------------

    /// Starts every service persisted as running. Failures are reported and
    /// skipped. Returns how many processes were started.
    pub async fn recover(&self) -> Result<usize, DeployError> {
        let mut started = 0;
        for service in self.registry.running()? {
            let _guard = self.supervisor.lock(&service.id).await;
            let outcome = match runtime::launch_spec(&service, &self.settings.runtime) {
                Ok(spec) => self
                    .supervisor
                    .start(&service.id, &spec)
                    .await
                    .map_err(DeployError::from),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(_) => {
                    started += 1;
                    if let Err(e) = self.registry.touch_restart(&service.id) {
                        tracing::warn!(service = %service.id, error = %e, "failed to record restart");
                    }
                }
                Err(e) => {
                    tracing::error!(service = %service.id, error = %e, "failed to recover service");
                    self.notifier.notify(
                        Recipient::Operator,
                        &format!("Could not restart service {} after boot: {e}", service.id),
                    );
                }
            }
            // the watchdog retries a failed start on its next tick
            if self.is_premium(service.user_id) {
                self.watchdog.attach(&service.id);
            }
        }
        tracing::info!(started, "recovered running services");
        Ok(started)
    }

    /// Stops monitors and processes. Records keep their status so the next
    /// boot restarts them.
    pub async fn shutdown(&self) {
        self.watchdog.cancel_all();
        self.supervisor.shutdown_all().await;
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    fn is_premium(&self, user_id: i64) -> bool {
        match self.registry.store().user(user_id) {
            Ok(user) => user.premium,
            Err(e) => {
                tracing::warn!(user = user_id, error = %e, "cannot read user tier");
                false
            }
        }
    }

    fn report<T>(&self, actor: Actor, op: &str, result: Result<T, DeployError>) -> Result<T, DeployError> {
        if let Err(e) = &result {
            tracing::warn!(user = actor.user_id, op, kind = e.kind(), error = %e, "operation failed");
            self.notifier.notify(Recipient::User(actor.user_id), &e.to_string());
        }
        result
    }

    fn succeed(&self, actor: Actor, action: &str, subject: &str, user_msg: String, operator_msg: String) {
        tracing::info!(user = actor.user_id, action, subject, "operation succeeded");
        self.notifier.notify(Recipient::User(actor.user_id), &user_msg);
        self.notifier.notify(Recipient::Operator, &operator_msg);
        let entry = ActivityLogEntry::now(actor.user_id, action, subject);
        if let Err(e) = self.registry.store().log_activity(&entry) {
            tracing::warn!(action, error = %e, "failed to write audit entry");
        }
    }
}

/// Eight lowercase hex characters.
pub fn generate_service_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

fn previous_root(root: &Path) -> PathBuf {
    let mut name = root.as_os_str().to_os_string();
    name.push(".previous");
    PathBuf::from(name)
}

async fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Drops the new content at `root` and renames `previous` back in its place.
async fn put_back(root: &Path, previous: &Path) {
    if let Err(e) = remove_dir_if_exists(root).await {
        tracing::error!(path = %root.display(), error = %e, "failed to discard new content");
    }
    if previous.exists()
        && let Err(e) = tokio::fs::rename(previous, root).await
    {
        tracing::error!(path = %root.display(), error = %e, "failed to restore previous content");
    }
}

fn tail_lines(text: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|l| l.to_string()).collect()
}
