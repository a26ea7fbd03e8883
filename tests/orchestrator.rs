use deployx::archive::{self, Upload};
use deployx::config::Settings;
use deployx::error::DeployError;
use deployx::model::{Actor, ProjectType, ServiceStatus};
use deployx::notify::{Notifier, Recipient};
use deployx::orchestrator::Orchestrator;
use deployx::paths::Paths;
use deployx::store::{MemoryStore, Store};
use deployx::validator::KeywordScanner;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const OWNER: i64 = 1;
const STRANGER: i64 = 2;
const ADMIN: i64 = 900;

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(Recipient, String)>>,
}

impl RecordingNotifier {
    fn to(&self, recipient: Recipient) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| *r == recipient)
            .map(|(_, m)| m.clone())
            .collect()
    }

    fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, to: Recipient, message: &str) {
        self.sent.lock().unwrap().push((to, message.to_string()));
    }
}

/// Shell bodies for the fake interpreter. `venv_python` and `pip` end up in
/// the service's environment; `serve` runs for static services.
struct Stub {
    pip: &'static str,
    venv_python: &'static str,
    serve: &'static str,
}

impl Default for Stub {
    fn default() -> Self {
        Self {
            pip: "exit 0",
            venv_python: "exec sleep 999",
            serve: "echo \"serving $*\"; exec sleep 999",
        }
    }
}

fn write_stub(dir: &Path, stub: &Stub) -> PathBuf {
    let path = dir.join("fake-python.sh");
    let script = format!(
        r#"if [ "$1" = "-m" ] && [ "$2" = "venv" ]; then
  mkdir -p "$3/bin"
  printf '%s\n' '#!/bin/sh' '{pip}' > "$3/bin/pip"
  printf '%s\n' '#!/bin/sh' '{python}' > "$3/bin/python"
  chmod +x "$3/bin/pip" "$3/bin/python"
  exit 0
fi
{serve}
"#,
        pip = stub.pip,
        python = stub.venv_python,
        serve = stub.serve,
    );
    std::fs::write(&path, script).unwrap();
    path
}

struct Harness {
    dir: TempDir,
    paths: Paths,
    settings: Settings,
    store: Arc<MemoryStore>,
    notes: Arc<RecordingNotifier>,
    orch: Orchestrator,
    uploads: AtomicUsize,
}

impl Harness {
    fn new() -> Self {
        Self::with(Stub::default(), |_| {})
    }

    fn with(stub: Stub, tweak: impl FnOnce(&mut Settings)) -> Self {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().join("data"));
        paths.ensure_layout().unwrap();
        let python = write_stub(dir.path(), &stub);

        let mut settings = Settings::default();
        settings.admins = vec![ADMIN];
        settings.ports.start = 41000;
        settings.ports.end = 41999;
        settings.quota.free = 2;
        settings.quota.premium = 5;
        settings.watchdog.interval_ms = 50;
        settings.watchdog.max_restarts = 2;
        settings.watchdog.min_uptime_ms = 60_000;
        settings.supervisor.kill_timeout_ms = 500;
        settings.runtime.python = format!("sh {}", shell_words::quote(&python.to_string_lossy()));
        tweak(&mut settings);

        let store = Arc::new(MemoryStore::new());
        let notes = Arc::new(RecordingNotifier::default());
        let orch = build(&paths, &settings, &store, &notes);
        Self {
            dir,
            paths,
            settings,
            store,
            notes,
            orch,
            uploads: AtomicUsize::new(0),
        }
    }

    /// Packs `files` into an archive in the uploads directory.
    fn upload(&self, files: &[(&str, &str)]) -> Upload {
        let n = self.uploads.fetch_add(1, Ordering::Relaxed);
        let src = self.dir.path().join(format!("src-{n}"));
        for (name, content) in files {
            let path = src.join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        let dest = self.paths.uploads_dir().join(format!("upload-{n}.tar.gz"));
        archive::pack(&src, &dest).unwrap();
        Upload::new(dest)
    }

    fn site(&self, body: &str) -> Upload {
        self.upload(&[("index.html", body)])
    }

    fn staging_is_empty(&self) -> bool {
        std::fs::read_dir(self.paths.staging_dir()).unwrap().next().is_none()
    }

    fn uploads_is_empty(&self) -> bool {
        std::fs::read_dir(self.paths.uploads_dir()).unwrap().next().is_none()
    }
}

fn build(
    paths: &Paths,
    settings: &Settings,
    store: &Arc<MemoryStore>,
    notes: &Arc<RecordingNotifier>,
) -> Orchestrator {
    let store: Arc<dyn Store> = store.clone();
    let notifier: Arc<dyn Notifier> = notes.clone();
    Orchestrator::new(
        paths.clone(),
        settings.clone(),
        store,
        Arc::new(KeywordScanner::default()),
        notifier,
    )
}

fn owner() -> Actor {
    Actor::user(OWNER)
}

fn admin() -> Actor {
    Actor::admin(ADMIN)
}

async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

// ---------------------------------------------------------------------------
// Deploy
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deploy_static_site() {
    let h = Harness::new();
    let service = h.orch.deploy(owner(), h.site("<h1>hi</h1>")).await.unwrap();

    assert_eq!(service.id.len(), 8);
    assert_eq!(service.status, ServiceStatus::Running);
    assert_eq!(service.project_type, ProjectType::Static);
    assert!((41000..=41999).contains(&service.port));
    assert_eq!(service.path, h.paths.service_root(OWNER, &service.id).to_string_lossy());
    assert!(Path::new(&service.path).join("index.html").is_file());
    assert!(h.orch.supervisor().is_alive(&service.id).await);

    assert_eq!(h.store.user(OWNER).unwrap().deployment_count, 1);
    assert!(h.uploads_is_empty(), "upload is consumed");
    assert!(h.staging_is_empty());

    let user_msgs = h.notes.to(Recipient::User(OWNER));
    assert_eq!(user_msgs.len(), 1);
    assert!(user_msgs[0].starts_with(&format!("Deployment successful! Service ID: {}", service.id)));
    assert!(user_msgs[0].contains(&format!("http://127.0.0.1:{}", service.port)));
    let ops = h.notes.to(Recipient::Operator);
    assert!(ops.iter().any(|m| m.starts_with("New deployment by user 1")));
    let audit = h.store.activity_for(OWNER).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, "deploy");

    h.orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deploy_dynamic_app_provisions_environment() {
    let h = Harness::new();
    let upload = h.upload(&[
        ("app.py", "print('hello')\n"),
        ("requirements.txt", "flask\n"),
    ]);
    let service = h.orch.deploy(owner(), upload).await.unwrap();

    assert_eq!(service.project_type, ProjectType::Dynamic);
    let root = PathBuf::from(&service.path);
    assert!(root.join("venv/bin/python").is_file());
    assert!(h.orch.supervisor().is_alive(&service.id).await);
    let msg = &h.notes.to(Recipient::User(OWNER))[0];
    assert!(msg.contains("$PORT"), "dynamic deploys mention the port variable: {msg}");

    h.orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unclassifiable_upload_leaves_nothing_behind() {
    let h = Harness::new();
    let err = h
        .orch
        .deploy(owner(), h.upload(&[("README.txt", "nothing to run")]))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::ClassificationFailed { .. }));
    assert!(h.store.services_for_user(OWNER).unwrap().is_empty());
    assert_eq!(h.store.user(OWNER).unwrap().deployment_count, 0);
    assert!(h.staging_is_empty());
    assert!(h.uploads_is_empty());
    let user_dir = h.paths.user_dir(OWNER);
    assert!(!user_dir.exists() || std::fs::read_dir(&user_dir).unwrap().next().is_none());
    // exactly one failure notice
    assert_eq!(h.notes.to(Recipient::User(OWNER)).len(), 1);
    assert!(h.store.activity_for(OWNER).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_corrupt_archive_is_extraction_failure() {
    let h = Harness::new();
    let path = h.paths.uploads_dir().join("junk.tar.gz");
    std::fs::write(&path, "definitely not gzip").unwrap();

    let err = h.orch.deploy(owner(), Upload::new(&path)).await.unwrap_err();
    assert_eq!(err.kind(), "extraction_failed");
    assert!(!path.exists());
    assert!(h.staging_is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_quota_exceeded_keeps_counter() {
    let h = Harness::new();
    h.orch.deploy(owner(), h.site("one")).await.unwrap();
    h.orch.deploy(owner(), h.site("two")).await.unwrap();

    let err = h.orch.deploy(owner(), h.site("three")).await.unwrap_err();
    assert!(matches!(err, DeployError::QuotaExceeded { limit: 2 }));
    assert_eq!(h.store.user(OWNER).unwrap().deployment_count, 2);
    assert_eq!(h.store.services_for_user(OWNER).unwrap().len(), 2);
    assert!(h.staging_is_empty());

    h.orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malicious_upload_bans_user() {
    let h = Harness::new();
    let upload = h.upload(&[
        ("app.py", "import os\nos.system('true')\n"),
        ("requirements.txt", ""),
    ]);
    let err = h.orch.deploy(owner(), upload).await.unwrap_err();

    assert_eq!(err.kind(), "validation_failed");
    let ban = h.store.ban_for(OWNER).unwrap().expect("user is banned");
    assert!(ban.reason.contains("os.system"));
    assert!(h.store.services_for_user(OWNER).unwrap().is_empty());
    assert!(h.staging_is_empty());
    let ops = h.notes.to(Recipient::Operator);
    assert!(ops.iter().any(|m| m.starts_with("User 1 banned for malicious upload")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_provisioning_failure_reports_installer_output() {
    let stub = Stub {
        pip: "echo \"no matching distribution for nosuchpkg\" >&2; exit 1",
        ..Stub::default()
    };
    let h = Harness::with(stub, |_| {});
    let upload = h.upload(&[("app.py", "print(1)\n"), ("requirements.txt", "nosuchpkg\n")]);
    let err = h.orch.deploy(owner(), upload).await.unwrap_err();

    match err {
        DeployError::ProvisioningFailed(output) => {
            assert!(output.contains("no matching distribution"), "{output}");
        }
        other => panic!("expected provisioning failure, got {other:?}"),
    }
    assert!(h.store.services_for_user(OWNER).unwrap().is_empty());
    assert_eq!(h.store.user(OWNER).unwrap().deployment_count, 0);
    let user_dir = h.paths.user_dir(OWNER);
    assert!(!user_dir.exists() || std::fs::read_dir(&user_dir).unwrap().next().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ports_are_unique() {
    let h = Harness::new();
    h.store.set_premium(OWNER, true).unwrap();
    let mut ports = HashSet::new();
    for i in 0..5 {
        let s = h.orch.deploy(owner(), h.site(&format!("site {i}"))).await.unwrap();
        assert!(ports.insert(s.port), "port {} handed out twice", s.port);
    }
    h.orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_port_exhaustion_leaves_nothing_behind() {
    let h = Harness::with(Stub::default(), |s| {
        s.ports.start = 41500;
        s.ports.end = 41500;
    });
    let first = h.orch.deploy(owner(), h.site("one")).await.unwrap();
    assert_eq!(first.port, 41500);

    let err = h.orch.deploy(owner(), h.site("two")).await.unwrap_err();
    assert!(matches!(err, DeployError::ResourceExhausted { start: 41500, end: 41500 }), "{err:?}");

    let services = h.store.services_for_user(OWNER).unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].id, first.id);
    assert_eq!(h.store.user(OWNER).unwrap().deployment_count, 1);
    let roots: Vec<_> = std::fs::read_dir(h.paths.user_dir(OWNER))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(roots, vec![std::ffi::OsString::from(&first.id)]);
    assert!(h.staging_is_empty());
    assert!(h.uploads_is_empty());

    h.orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spawn_failure_leaves_nothing_behind() {
    let h = Harness::with(Stub::default(), |s| {
        s.runtime.python = "/nonexistent/deployx-python".to_string();
    });
    let err = h.orch.deploy(owner(), h.site("x")).await.unwrap_err();
    assert!(matches!(err, DeployError::ProcessSpawnFailed(_)), "{err:?}");

    assert!(h.store.services_for_user(OWNER).unwrap().is_empty());
    assert!(h.store.assigned_ports().unwrap().is_empty());
    assert_eq!(h.store.user(OWNER).unwrap().deployment_count, 0);
    let user_dir = h.paths.user_dir(OWNER);
    assert!(!user_dir.exists() || std::fs::read_dir(&user_dir).unwrap().next().is_none());
    assert!(h.staging_is_empty());
    assert!(h.uploads_is_empty());
    assert_eq!(h.notes.to(Recipient::User(OWNER)).len(), 1);
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_update_replaces_content() {
    let h = Harness::new();
    let original = h.orch.deploy(owner(), h.site("v1")).await.unwrap();
    let updated = h
        .orch
        .update(owner(), &original.id, h.site("v2"))
        .await
        .unwrap();

    assert_eq!(updated.id, original.id);
    assert_eq!(updated.port, original.port);
    assert_eq!(updated.status, ServiceStatus::Running);
    assert!(updated.last_restart > original.last_restart);
    let root = PathBuf::from(&updated.path);
    assert_eq!(std::fs::read_to_string(root.join("index.html")).unwrap(), "v2");
    assert!(!PathBuf::from(format!("{}.previous", updated.path)).exists());
    assert!(h.orch.supervisor().is_alive(&updated.id).await);
    assert_eq!(h.store.user(OWNER).unwrap().deployment_count, 1);

    h.orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_update_by_stranger_is_rejected() {
    let h = Harness::new();
    let service = h.orch.deploy(owner(), h.site("mine")).await.unwrap();
    let upload = h.site("theirs");
    let upload_path = upload.path().to_path_buf();

    let err = h
        .orch
        .update(Actor::user(STRANGER), &service.id, upload)
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::AuthorizationFailed(_)));
    let root = PathBuf::from(&service.path);
    assert_eq!(std::fs::read_to_string(root.join("index.html")).unwrap(), "mine");
    assert!(h.orch.supervisor().is_alive(&service.id).await);
    assert!(!upload_path.exists());

    h.orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_update_restores_previous_version() {
    let h = Harness::new();
    let service = h.orch.deploy(owner(), h.site("v1")).await.unwrap();

    let err = h
        .orch
        .update(owner(), &service.id, h.upload(&[("notes.txt", "no entry point")]))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::ClassificationFailed { .. }));

    let after = h.store.service(&service.id).unwrap().unwrap();
    assert_eq!(after.status, ServiceStatus::Running);
    assert_eq!(after.port, service.port);
    let root = PathBuf::from(&service.path);
    assert_eq!(std::fs::read_to_string(root.join("index.html")).unwrap(), "v1");
    assert!(!root.join("notes.txt").exists());
    assert!(!PathBuf::from(format!("{}.previous", service.path)).exists());
    assert!(h.orch.supervisor().is_alive(&service.id).await);

    h.orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_update_refused_in_maintenance() {
    let h = Harness::new();
    let service = h.orch.deploy(owner(), h.site("v1")).await.unwrap();
    h.orch.set_maintenance(owner(), &service.id, true).await.unwrap();

    let err = h
        .orch
        .update(owner(), &service.id, h.site("v2"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DeployError::InvalidState {
            status: ServiceStatus::Maintenance,
            ..
        }
    ));
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_then_stop_again() {
    let h = Harness::new();
    let service = h.orch.deploy(owner(), h.site("x")).await.unwrap();

    let stopped = h.orch.stop(owner(), &service.id).await.unwrap();
    assert_eq!(stopped.status, ServiceStatus::Stopped);
    assert!(!h.orch.supervisor().is_alive(&service.id).await);

    let err = h.orch.stop(owner(), &service.id).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_state");
    assert_eq!(
        h.store.service(&service.id).unwrap().unwrap().status,
        ServiceStatus::Stopped
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_redeploy_stopped_service() {
    let h = Harness::new();
    let service = h.orch.deploy(owner(), h.site("x")).await.unwrap();
    h.orch.stop(owner(), &service.id).await.unwrap();

    let again = h.orch.redeploy(owner(), &service.id).await.unwrap();
    assert_eq!(again.status, ServiceStatus::Running);
    assert_eq!(again.port, service.port);
    assert!(again.last_restart > service.last_restart);
    assert!(h.orch.supervisor().is_alive(&service.id).await);

    h.orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_redeploy_marks_service_stopped() {
    let h = Harness::new();
    let upload = h.upload(&[("app.py", "print(1)\n"), ("requirements.txt", "")]);
    let service = h.orch.deploy(owner(), upload).await.unwrap();
    std::fs::remove_file(PathBuf::from(&service.path).join("venv/bin/python")).unwrap();

    let err = h.orch.redeploy(owner(), &service.id).await.unwrap_err();
    assert!(matches!(err, DeployError::ProcessSpawnFailed(_)), "{err:?}");

    let after = h.store.service(&service.id).unwrap().unwrap();
    assert_eq!(after.status, ServiceStatus::Stopped);
    assert_eq!(after.port, service.port);
    assert!(!h.orch.supervisor().is_alive(&service.id).await);

    h.orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_maintenance_round_trip() {
    let h = Harness::new();
    let service = h.orch.deploy(owner(), h.site("x")).await.unwrap();

    let paused = h.orch.set_maintenance(owner(), &service.id, true).await.unwrap();
    assert_eq!(paused.status, ServiceStatus::Maintenance);
    assert!(!h.orch.supervisor().is_alive(&service.id).await);

    // redeploy does not bypass maintenance
    let err = h.orch.redeploy(owner(), &service.id).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_state");

    let back = h.orch.set_maintenance(owner(), &service.id, false).await.unwrap();
    assert_eq!(back.status, ServiceStatus::Running);
    assert!(h.orch.supervisor().is_alive(&service.id).await);

    h.orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_suspend_is_admin_only() {
    let h = Harness::new();
    let service = h.orch.deploy(owner(), h.site("x")).await.unwrap();

    let err = h.orch.suspend(owner(), &service.id).await.unwrap_err();
    assert!(matches!(err, DeployError::AdminOnly));
    assert!(h.orch.supervisor().is_alive(&service.id).await);

    h.orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_suspend_and_unsuspend() {
    let h = Harness::new();
    let service = h.orch.deploy(owner(), h.site("x")).await.unwrap();
    h.notes.clear();

    let suspended = h.orch.suspend(admin(), &service.id).await.unwrap();
    assert_eq!(suspended.status, ServiceStatus::Suspended);
    assert!(!h.orch.supervisor().is_alive(&service.id).await);
    assert!(
        h.notes
            .to(Recipient::User(OWNER))
            .iter()
            .any(|m| m.contains("suspended"))
    );

    // the owner cannot lift it
    let err = h.orch.redeploy(owner(), &service.id).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_state");
    assert!(h.orch.unsuspend(owner(), &service.id).await.is_err());

    let resumed = h.orch.unsuspend(admin(), &service.id).await.unwrap();
    assert_eq!(resumed.status, ServiceStatus::Running);
    assert_eq!(resumed.port, service.port);
    assert!(resumed.last_restart > suspended.last_restart);
    assert!(h.orch.supervisor().is_alive(&service.id).await);

    h.orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_frees_quota_and_files() {
    let h = Harness::new();
    let a = h.orch.deploy(owner(), h.site("a")).await.unwrap();
    h.orch.deploy(owner(), h.site("b")).await.unwrap();

    h.orch.delete(owner(), &a.id).await.unwrap();
    assert!(h.store.service(&a.id).unwrap().is_none());
    assert!(!Path::new(&a.path).exists());
    assert!(!h.orch.supervisor().is_alive(&a.id).await);
    assert_eq!(h.store.user(OWNER).unwrap().deployment_count, 1);

    // the freed slot can be used again
    h.orch.deploy(owner(), h.site("c")).await.unwrap();
    assert_eq!(h.store.user(OWNER).unwrap().deployment_count, 2);

    h.orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stranger_cannot_touch_service() {
    let h = Harness::new();
    let service = h.orch.deploy(owner(), h.site("x")).await.unwrap();
    let stranger = Actor::user(STRANGER);

    assert_eq!(h.orch.stop(stranger, &service.id).await.unwrap_err().kind(), "authorization_failed");
    assert_eq!(h.orch.delete(stranger, &service.id).await.unwrap_err().kind(), "authorization_failed");
    assert_eq!(h.orch.info(stranger, &service.id).await.unwrap_err().kind(), "authorization_failed");
    // unknown ids look the same to non-owners
    assert_eq!(h.orch.stop(stranger, "ffffffff").await.unwrap_err().kind(), "authorization_failed");
    assert!(h.orch.list(stranger).unwrap().is_empty());
    assert!(h.orch.supervisor().is_alive(&service.id).await);

    // admins act on anyone's service
    let stopped = h.orch.stop(admin(), &service.id).await.unwrap();
    assert_eq!(stopped.status, ServiceStatus::Stopped);
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_info_and_logs() {
    let h = Harness::new();
    let service = h.orch.deploy(owner(), h.site("x")).await.unwrap();

    let info = h.orch.info(owner(), &service.id).await.unwrap();
    assert_eq!(info.link, format!("http://127.0.0.1:{}", service.port));
    assert!(info.pid.is_some());
    assert!(!info.monitored);

    let orch = &h.orch;
    let id = service.id.as_str();
    let found = wait_until(Duration::from_secs(5), move || async move {
        orch.logs(owner(), id, 15)
            .await
            .unwrap()
            .iter()
            .any(|l| l.contains("http.server"))
    })
    .await;
    assert!(found, "service output reaches its log");

    h.orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ban_and_unban_are_admin_only() {
    let h = Harness::new();
    let err = h.orch.ban(owner(), STRANGER, "spam").await.unwrap_err();
    assert!(matches!(err, DeployError::AdminOnly));
    assert!(h.store.ban_for(STRANGER).unwrap().is_none());

    h.orch.ban(admin(), STRANGER, "spam").await.unwrap();
    assert_eq!(h.store.ban_for(STRANGER).unwrap().unwrap().reason, "spam");
    assert!(
        h.notes
            .to(Recipient::User(STRANGER))
            .iter()
            .any(|m| m == "You have been banned: spam")
    );

    let err = h.orch.unban(owner(), STRANGER).await.unwrap_err();
    assert!(matches!(err, DeployError::AdminOnly));
    h.orch.unban(admin(), STRANGER).await.unwrap();
    assert!(h.store.ban_for(STRANGER).unwrap().is_none());

    let err = h.orch.unban(admin(), STRANGER).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");

    let actions: Vec<String> = h
        .store
        .activity_for(ADMIN)
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(actions, vec!["ban", "unban"]);
}

// ---------------------------------------------------------------------------
// Premium and watchdog
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_set_premium_requires_admin() {
    let h = Harness::new();
    let err = h.orch.set_premium(owner(), OWNER, true).await.unwrap_err();
    assert!(matches!(err, DeployError::AdminOnly));
    assert!(!h.store.user(OWNER).unwrap().premium);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_premium_toggles_watchdog() {
    let h = Harness::new();
    let service = h.orch.deploy(owner(), h.site("x")).await.unwrap();
    assert!(!h.orch.watchdog().is_active(&service.id));

    h.orch.set_premium(admin(), OWNER, true).await.unwrap();
    assert!(h.store.user(OWNER).unwrap().premium);
    assert!(h.orch.watchdog().is_active(&service.id));

    h.orch.set_premium(admin(), OWNER, false).await.unwrap();
    assert!(!h.orch.watchdog().is_active(&service.id));

    h.orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watchdog_restarts_killed_process() {
    let h = Harness::new();
    h.store.set_premium(OWNER, true).unwrap();
    let service = h.orch.deploy(owner(), h.site("x")).await.unwrap();
    assert!(h.orch.watchdog().is_active(&service.id));

    let pid = h.orch.supervisor().pid(&service.id).await.unwrap();
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    let supervisor = h.orch.supervisor();
    let id = service.id.as_str();
    let restarted = wait_until(Duration::from_secs(5), move || async move {
        supervisor.pid(id).await.is_some_and(|p| p != pid)
    })
    .await;
    assert!(restarted, "watchdog brings the process back");

    let after = h.store.service(&service.id).unwrap().unwrap();
    assert_eq!(after.status, ServiceStatus::Running);
    assert!(after.last_restart > service.last_restart);
    assert!(
        h.notes
            .to(Recipient::Operator)
            .iter()
            .any(|m| m == &format!("Auto-restarted service {} for user 1", service.id))
    );

    h.orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watchdog_leaves_stopped_service_alone() {
    let h = Harness::new();
    h.store.set_premium(OWNER, true).unwrap();
    let service = h.orch.deploy(owner(), h.site("x")).await.unwrap();

    h.orch.stop(owner(), &service.id).await.unwrap();
    assert!(!h.orch.watchdog().is_active(&service.id));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!h.orch.supervisor().is_alive(&service.id).await);
    assert_eq!(
        h.store.service(&service.id).unwrap().unwrap().status,
        ServiceStatus::Stopped
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_crashing_service_enters_crash_loop() {
    let stub = Stub {
        serve: "echo boom >&2; exit 1",
        ..Stub::default()
    };
    let h = Harness::with(stub, |_| {});
    h.store.set_premium(OWNER, true).unwrap();
    let service = h.orch.deploy(owner(), h.site("x")).await.unwrap();

    let store = &h.store;
    let watchdog = h.orch.watchdog();
    let id = service.id.as_str();
    let tripped = wait_until(Duration::from_secs(10), move || async move {
        store.service(id).unwrap().unwrap().status == ServiceStatus::CrashLoop
    })
    .await;
    assert!(tripped, "service is marked crash_loop");
    let retired = wait_until(Duration::from_secs(2), move || async move {
        !watchdog.is_active(id)
    })
    .await;
    assert!(retired);
    assert!(
        h.notes
            .to(Recipient::User(OWNER))
            .iter()
            .any(|m| m.contains("crash_loop"))
    );

    // a crash-looping service may be stopped and redeployed
    let stopped = h.orch.stop(owner(), &service.id).await.unwrap();
    assert_eq!(stopped.status, ServiceStatus::Stopped);
}

// ---------------------------------------------------------------------------
// Startup recovery
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recover_restarts_running_services() {
    let h = Harness::new();
    let running = h.orch.deploy(owner(), h.site("a")).await.unwrap();
    let stopped = h.orch.deploy(owner(), h.site("b")).await.unwrap();
    h.orch.stop(owner(), &stopped.id).await.unwrap();
    h.orch.shutdown().await;
    assert!(!h.orch.supervisor().is_alive(&running.id).await);

    let rebooted = build(&h.paths, &h.settings, &h.store, &h.notes);
    assert_eq!(rebooted.recover().await.unwrap(), 1);
    assert!(rebooted.supervisor().is_alive(&running.id).await);
    assert!(!rebooted.supervisor().is_alive(&stopped.id).await);
    let after = h.store.service(&running.id).unwrap().unwrap();
    assert_eq!(after.port, running.port);
    assert!(after.last_restart > running.last_restart);

    rebooted.shutdown().await;
}
