use crate::archive::Upload;
use crate::config;
use crate::error::DeployError;
use crate::model::{Actor, Service};
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::orchestrator::Orchestrator;
use crate::paths::Paths;
use crate::pid::PidFile;
use crate::protocol::{self, Request, Response};
use crate::store::SqliteStore;
use crate::validator::KeywordScanner;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

/// Runs the daemon until a `Kill` request or SIGTERM/SIGINT.
pub async fn run(paths: Paths) -> color_eyre::Result<()> {
    fs::create_dir_all(paths.data_dir())?;
    let _pid = PidFile::acquire(&paths)?;

    let settings = config::load_settings(&paths.config_file())?;
    paths.ensure_layout()?;
    let store = Arc::new(SqliteStore::open(&paths.db_file())?);
    let notifier: Arc<dyn Notifier> = match &settings.notify.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };
    let orchestrator = Arc::new(Orchestrator::new(
        paths.clone(),
        settings,
        store,
        Arc::new(KeywordScanner::default()),
        notifier,
    ));

    if let Err(e) = orchestrator.recover().await {
        tracing::error!(error = %e, "startup recovery failed");
    }

    // Remove stale socket file if it exists
    let socket_path = paths.socket_file();
    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    tracing::info!(socket = %socket_path.display(), "daemon listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let result = run_accept_loop(&paths, &listener, &shutdown_tx, &mut shutdown_rx, &orchestrator).await;

    tracing::info!("shutting down, stopping all services");
    orchestrator.shutdown().await;
    let _ = fs::remove_file(&socket_path);

    result
}

async fn run_accept_loop(
    paths: &Paths,
    listener: &UnixListener,
    shutdown_tx: &watch::Sender<bool>,
    shutdown_rx: &mut watch::Receiver<bool>,
    orchestrator: &Arc<Orchestrator>,
) -> color_eyre::Result<()> {
    let signalled = signal_shutdown();
    tokio::pin!(signalled);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, _addr) = accept_result?;
                let tx = shutdown_tx.clone();
                let paths = paths.clone();
                let orch = Arc::clone(orchestrator);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &tx, &orch, &paths).await {
                        tracing::warn!(error = %e, "connection error");
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            res = &mut signalled => {
                if let Err(e) = res {
                    tracing::error!(error = %e, "cannot listen for signals");
                }
                break;
            }
        }
    }

    Ok(())
}

async fn signal_shutdown() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    Ok(())
}

async fn handle_connection(
    stream: tokio::net::UnixStream,
    shutdown_tx: &watch::Sender<bool>,
    orchestrator: &Orchestrator,
    paths: &Paths,
) -> color_eyre::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();
    buf_reader.read_line(&mut line).await?;

    if line.is_empty() {
        return Ok(());
    }

    let response = match protocol::decode_request(&line) {
        Ok(request) => dispatch(request, shutdown_tx, orchestrator, paths).await,
        Err(e) => Response::error("bad_request", e.to_string()),
    };
    let encoded = protocol::encode_response(&response)?;
    writer.write_all(&encoded).await?;
    writer.shutdown().await?;

    Ok(())
}

fn actor_for(orchestrator: &Orchestrator, user_id: i64) -> Actor {
    if orchestrator.settings().is_admin(user_id) {
        Actor::admin(user_id)
    } else {
        Actor::user(user_id)
    }
}

/// Rejects requests from banned users before they reach the orchestrator.
fn ban_guard(orchestrator: &Orchestrator, actor: Actor) -> Option<Response> {
    if actor.admin {
        return None;
    }
    match orchestrator.registry().store().ban_for(actor.user_id) {
        Ok(None) => None,
        Ok(Some(ban)) => Some(Response::error(
            "banned",
            format!("you are banned: {}", ban.reason),
        )),
        Err(e) => Some(DeployError::from(e).into()),
    }
}

/// Takes ownership of an archive the client placed in the uploads directory.
fn accept_upload(paths: &Paths, archive: &str) -> Result<Upload, DeployError> {
    let uploads = paths.uploads_dir().canonicalize()?;
    let path = Path::new(archive)
        .canonicalize()
        .map_err(|e| DeployError::ExtractionFailed(format!("{archive}: {e}")))?;
    if !path.starts_with(&uploads) || !path.is_file() {
        return Err(DeployError::ExtractionFailed(format!(
            "archive must be a file inside {}",
            uploads.display()
        )));
    }
    Ok(Upload::new(path))
}

fn claimed(upload: Option<Result<Upload, DeployError>>) -> Result<Upload, DeployError> {
    upload.unwrap_or_else(|| Err(DeployError::Internal("request carries no archive".to_string())))
}

fn service_response(result: Result<Service, DeployError>, message: impl FnOnce(&Service) -> String) -> Response {
    match result {
        Ok(service) => Response::Success {
            message: Some(message(&service)),
            service: Some(Box::new(service)),
        },
        Err(e) => e.into(),
    }
}

async fn dispatch(
    request: Request,
    shutdown_tx: &watch::Sender<bool>,
    orchestrator: &Orchestrator,
    paths: &Paths,
) -> Response {
    // claimed before any guard so a rejected request still removes its archive
    let upload = match &request {
        Request::Deploy { archive, .. } | Request::Update { archive, .. } => {
            Some(accept_upload(paths, archive))
        }
        _ => None,
    };
    let actor = request.user().map(|uid| actor_for(orchestrator, uid));
    if let Some(actor) = actor
        && let Some(rejected) = ban_guard(orchestrator, actor)
    {
        return rejected;
    }
    let host = orchestrator.settings().public_host.clone();

    match (request, actor) {
        (Request::Kill, _) => {
            let _ = shutdown_tx.send(true);
            Response::message("daemon shutting down")
        }
        (Request::Deploy { .. }, Some(actor)) => {
            let result = match claimed(upload) {
                Ok(upload) => orchestrator.deploy(actor, upload).await,
                Err(e) => Err(e),
            };
            service_response(result, |s| {
                format!("deployed {} ({}) at {}", s.id, s.project_type, s.link(&host))
            })
        }
        (Request::Update { service_id, .. }, Some(actor)) => {
            let result = match claimed(upload) {
                Ok(upload) => orchestrator.update(actor, &service_id, upload).await,
                Err(e) => Err(e),
            };
            service_response(result, |s| format!("updated {} at {}", s.id, s.link(&host)))
        }
        (Request::Redeploy { service_id, .. }, Some(actor)) => service_response(
            orchestrator.redeploy(actor, &service_id).await,
            |s| format!("redeployed {} at {}", s.id, s.link(&host)),
        ),
        (Request::Stop { service_id, .. }, Some(actor)) => service_response(
            orchestrator.stop(actor, &service_id).await,
            |s| format!("stopped {}", s.id),
        ),
        (Request::Delete { service_id, .. }, Some(actor)) => {
            match orchestrator.delete(actor, &service_id).await {
                Ok(()) => Response::message(format!("deleted {service_id}")),
                Err(e) => e.into(),
            }
        }
        (Request::Maintenance { service_id, enabled, .. }, Some(actor)) => service_response(
            orchestrator.set_maintenance(actor, &service_id, enabled).await,
            |s| format!("{} is now {}", s.id, s.status),
        ),
        (Request::Suspend { service_id, .. }, Some(actor)) => service_response(
            orchestrator.suspend(actor, &service_id).await,
            |s| format!("suspended {}", s.id),
        ),
        (Request::Unsuspend { service_id, .. }, Some(actor)) => service_response(
            orchestrator.unsuspend(actor, &service_id).await,
            |s| format!("unsuspended {}", s.id),
        ),
        (Request::SetPremium { target, premium, .. }, Some(actor)) => {
            match orchestrator.set_premium(actor, target, premium).await {
                Ok(()) => Response::message(format!(
                    "premium {} for user {target}",
                    if premium { "granted" } else { "revoked" }
                )),
                Err(e) => e.into(),
            }
        }
        (Request::Ban { target, reason, .. }, Some(actor)) => {
            match orchestrator.ban(actor, target, &reason).await {
                Ok(()) => Response::message(format!("banned user {target}: {reason}")),
                Err(e) => e.into(),
            }
        }
        (Request::Unban { target, .. }, Some(actor)) => match orchestrator.unban(actor, target).await {
            Ok(()) => Response::message(format!("unbanned user {target}")),
            Err(e) => e.into(),
        },
        (Request::List { .. }, Some(actor)) => match orchestrator.list(actor) {
            Ok(services) => Response::ServiceList { services },
            Err(e) => e.into(),
        },
        (Request::Info { service_id, .. }, Some(actor)) => {
            match orchestrator.info(actor, &service_id).await {
                Ok(info) => Response::ServiceDetail {
                    info: Box::new(info),
                },
                Err(e) => e.into(),
            }
        }
        (Request::Logs { service_id, lines, .. }, Some(actor)) => {
            match orchestrator.logs(actor, &service_id, lines).await {
                Ok(lines) => Response::LogLines { lines },
                Err(e) => e.into(),
            }
        }
        (_, None) => Response::error("bad_request", "request has no user"),
    }
}
