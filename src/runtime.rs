//! Runtime profiles: how a service's content is classified, provisioned and
//! launched.
//!
//! [`launch_spec`] is the only place a service command line is built. Deploy,
//! update, redeploy, resume, unsuspend, startup recovery and the watchdog all
//! go through it.

use crate::config::RuntimeSettings;
use crate::error::{DeployError, truncate_output};
use crate::model::{ProjectType, Service};
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Everything needed to spawn a service process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
}

/// Inspects the top level of `dir` and picks a profile.
pub fn classify(dir: &Path, rt: &RuntimeSettings) -> Result<ProjectType, DeployError> {
    if dir.join(&rt.entry_file).is_file() && dir.join(&rt.manifest).is_file() {
        Ok(ProjectType::Dynamic)
    } else if dir.join(&rt.index).is_file() {
        Ok(ProjectType::Static)
    } else {
        Err(DeployError::ClassificationFailed {
            entry: rt.entry_file.clone(),
            manifest: rt.manifest.clone(),
            index: rt.index.clone(),
        })
    }
}

fn interpreter(rt: &RuntimeSettings) -> Result<(String, Vec<String>), DeployError> {
    let mut words = shell_words::split(&rt.python)
        .map_err(|e| DeployError::Internal(format!("invalid interpreter command: {e}")))?;
    if words.is_empty() {
        return Err(DeployError::Internal("interpreter command is empty".to_string()));
    }
    let program = words.remove(0);
    Ok((program, words))
}

fn venv_bin(root: &Path, rt: &RuntimeSettings, tool: &str) -> PathBuf {
    root.join(&rt.venv_dir).join("bin").join(tool)
}

/// Creates the isolated environment for a dynamic service and installs its
/// manifest. Static services need nothing.
pub async fn provision(
    root: &Path,
    project_type: ProjectType,
    rt: &RuntimeSettings,
) -> Result<(), DeployError> {
    if project_type == ProjectType::Static {
        return Ok(());
    }

    let (program, mut args) = interpreter(rt)?;
    args.extend([
        "-m".to_string(),
        "venv".to_string(),
        root.join(&rt.venv_dir).to_string_lossy().into_owned(),
    ]);
    let mut venv = Command::new(&program);
    venv.args(&args).current_dir(root);
    run_step(venv, "environment creation", rt.output_limit).await?;

    let mut pip = Command::new(venv_bin(root, rt, "pip"));
    pip.arg("install")
        .arg("-r")
        .arg(root.join(&rt.manifest))
        .current_dir(root);
    run_step(pip, "dependency install", rt.output_limit).await
}

async fn run_step(mut cmd: Command, step: &str, limit: usize) -> Result<(), DeployError> {
    cmd.stdin(std::process::Stdio::null()).kill_on_drop(true);
    let output = cmd
        .output()
        .await
        .map_err(|e| DeployError::ProvisioningFailed(format!("{step} could not start: {e}")))?;
    if output.status.success() {
        return Ok(());
    }
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Err(DeployError::ProvisioningFailed(format!(
        "{step} exited with {}\n{}",
        output.status,
        truncate_output(&text, limit)
    )))
}

/// Builds the command line for `service` from its persisted path, port and type.
pub fn launch_spec(service: &Service, rt: &RuntimeSettings) -> Result<LaunchSpec, DeployError> {
    let root = PathBuf::from(&service.path);
    let port = service.port.to_string();
    match service.project_type {
        ProjectType::Static => {
            let (program, mut args) = interpreter(rt)?;
            args.extend([
                "-m".to_string(),
                "http.server".to_string(),
                port,
                "--directory".to_string(),
                service.path.clone(),
            ]);
            Ok(LaunchSpec {
                program,
                args,
                env: Vec::new(),
                cwd: root,
            })
        }
        ProjectType::Dynamic => Ok(LaunchSpec {
            program: venv_bin(&root, rt, "python").to_string_lossy().into_owned(),
            args: vec![root.join(&rt.entry_file).to_string_lossy().into_owned()],
            env: vec![(rt.port_env.clone(), port)],
            cwd: root,
        }),
    }
}
