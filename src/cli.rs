use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "deployx", about = "Deploy and supervise uploaded web projects", version)]
pub struct Cli {
    #[arg(long, hide = true)]
    pub daemon: bool,

    #[arg(long, global = true)]
    pub json: bool,

    /// User id to act as (falls back to $DEPLOYX_USER)
    #[arg(long, global = true)]
    pub user: Option<i64>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    pub fn enabled(self) -> bool {
        self == Toggle::On
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Deploy a project archive (.tar.gz) or directory as a new service
    Deploy { archive: PathBuf },
    /// Replace a service's content with a new archive
    Update {
        service_id: String,
        archive: PathBuf,
    },
    /// Restart a service from its current content
    Redeploy { service_id: String },
    /// Stop a service
    Stop { service_id: String },
    /// Stop a service and remove it with its files
    Delete { service_id: String },
    /// Put a service into maintenance mode or bring it back
    Maintenance { service_id: String, state: Toggle },
    /// Suspend a service (admin)
    Suspend { service_id: String },
    /// Lift a suspension (admin)
    Unsuspend { service_id: String },
    /// Grant or revoke premium for a user (admin)
    Premium { user_id: i64, state: Toggle },
    /// Ban a user from every command (admin)
    Ban { user_id: i64, reason: String },
    /// Lift a user's ban (admin)
    Unban { user_id: i64 },
    /// List your services
    #[command(visible_alias = "ls")]
    List,
    /// Show details and the link of a service
    Info { service_id: String },
    /// Show the tail of a service's output log
    Logs {
        service_id: String,
        #[arg(long, default_value_t = 15)]
        lines: usize,
    },
    /// Stop all services and shut down the daemon
    Kill,
}
