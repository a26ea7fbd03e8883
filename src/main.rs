use clap::{CommandFactory, Parser};
use color_eyre::eyre::{bail, eyre};
use comfy_table::{Attribute, Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use deployx::cli::{Cli, Command};
use deployx::model::{Service, ServiceStatus};
use deployx::paths::Paths;
use deployx::protocol::{Request, Response};
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    if cli.daemon {
        init_logging()?;
        let paths = Paths::new()?;
        deployx::daemon::run(paths).await?;
    } else if let Some(command) = cli.command {
        let paths = Paths::new()?;
        let request = command_to_request(&paths, command, cli.user)?;
        let response = tokio::task::spawn_blocking(move || {
            deployx::client::send_request(&paths, &request)
        })
        .await??;
        if cli.json {
            print_response_json(&response)?;
        } else {
            print_response(&response);
        }
        if matches!(response, Response::Error { .. }) {
            std::process::exit(1);
        }
    } else {
        Cli::command().print_help()?;
    }

    Ok(())
}

/// Human-readable logs on stderr; `DEPLOYX_LOG_JSON=1` switches to JSON.
fn init_logging() -> color_eyre::Result<()> {
    let filter = EnvFilter::try_from_env("DEPLOYX_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let json_logs = std::env::var("DEPLOYX_LOG_JSON").unwrap_or_default() == "1";
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| eyre!("failed to install logger: {e}"))
}

fn resolve_user(flag: Option<i64>) -> color_eyre::Result<i64> {
    if let Some(user) = flag {
        return Ok(user);
    }
    match std::env::var("DEPLOYX_USER") {
        Ok(v) => v
            .parse()
            .map_err(|_| eyre!("DEPLOYX_USER is not a valid user id: {v}")),
        Err(_) => bail!("no user given; pass --user or set DEPLOYX_USER"),
    }
}

fn command_to_request(
    paths: &Paths,
    command: Command,
    user: Option<i64>,
) -> color_eyre::Result<Request> {
    if matches!(command, Command::Kill) {
        return Ok(Request::Kill);
    }
    let user = resolve_user(user)?;
    let staged = |archive: &std::path::Path| -> color_eyre::Result<String> {
        let path = deployx::client::stage_upload(paths, archive)?;
        Ok(path.to_string_lossy().into_owned())
    };
    Ok(match command {
        Command::Deploy { archive } => Request::Deploy {
            user,
            archive: staged(&archive)?,
        },
        Command::Update {
            service_id,
            archive,
        } => Request::Update {
            user,
            service_id,
            archive: staged(&archive)?,
        },
        Command::Redeploy { service_id } => Request::Redeploy { user, service_id },
        Command::Stop { service_id } => Request::Stop { user, service_id },
        Command::Delete { service_id } => Request::Delete { user, service_id },
        Command::Maintenance { service_id, state } => Request::Maintenance {
            user,
            service_id,
            enabled: state.enabled(),
        },
        Command::Suspend { service_id } => Request::Suspend { user, service_id },
        Command::Unsuspend { service_id } => Request::Unsuspend { user, service_id },
        Command::Premium { user_id, state } => Request::SetPremium {
            user,
            target: user_id,
            premium: state.enabled(),
        },
        Command::Ban { user_id, reason } => Request::Ban {
            user,
            target: user_id,
            reason,
        },
        Command::Unban { user_id } => Request::Unban {
            user,
            target: user_id,
        },
        Command::List => Request::List { user },
        Command::Info { service_id } => Request::Info { user, service_id },
        Command::Logs { service_id, lines } => Request::Logs {
            user,
            service_id,
            lines,
        },
        Command::Kill => Request::Kill,
    })
}

fn print_response_json(response: &Response) -> color_eyre::Result<()> {
    println!("{}", serde_json::to_string(response)?);
    Ok(())
}

fn format_uptime(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        s if s < 86_400 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        s => format!("{}d {}h", s / 86_400, (s % 86_400) / 3600),
    }
}

fn status_color(status: ServiceStatus) -> Color {
    match status {
        ServiceStatus::Running => Color::Green,
        ServiceStatus::Stopped => Color::Reset,
        ServiceStatus::Maintenance => Color::Yellow,
        ServiceStatus::Suspended => Color::Magenta,
        ServiceStatus::CrashLoop => Color::Red,
    }
}

fn colored_status(status: ServiceStatus) -> String {
    let s = status.as_str();
    match status {
        ServiceStatus::Running => s.green().to_string(),
        ServiceStatus::Stopped => s.to_string(),
        ServiceStatus::Maintenance => s.yellow().to_string(),
        ServiceStatus::Suspended => s.magenta().to_string(),
        ServiceStatus::CrashLoop => s.red().to_string(),
    }
}

fn services_table(services: &[Service]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("id").add_attribute(Attribute::Bold),
        Cell::new("type").add_attribute(Attribute::Bold),
        Cell::new("port").add_attribute(Attribute::Bold),
        Cell::new("status").add_attribute(Attribute::Bold),
        Cell::new("last restart").add_attribute(Attribute::Bold),
    ]);
    for s in services {
        table.add_row(vec![
            Cell::new(&s.id).fg(Color::Cyan),
            Cell::new(s.project_type.as_str()),
            Cell::new(s.port),
            Cell::new(s.status.as_str()).fg(status_color(s.status)),
            Cell::new(s.last_restart.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }
    table
}

fn print_response(response: &Response) {
    match response {
        Response::Success { message, .. } => {
            println!("{}", message.as_deref().unwrap_or("ok").green());
        }
        Response::Error { kind, message } => {
            eprintln!("{} {} {}", "error:".red().bold(), format!("[{kind}]").dimmed(), message);
        }
        Response::ServiceList { services } => {
            if services.is_empty() {
                println!("{}", "no services deployed".yellow());
            } else {
                println!("{}", services_table(services));
            }
        }
        Response::ServiceDetail { info } => {
            let s = &info.service;
            println!("{}: {}", s.id.cyan().bold(), colored_status(s.status));
            println!("  {} {}", "link:".dimmed(), info.link);
            println!("  {} {}", "type:".dimmed(), s.project_type);
            println!("  {} {}", "port:".dimmed(), s.port);
            if let Some(pid) = info.pid {
                println!("  {} {pid}", "pid:".dimmed());
            }
            if let Some(secs) = info.uptime_secs {
                println!("  {} {}", "uptime:".dimmed(), format_uptime(secs));
            }
            println!("  {} {}", "path:".dimmed(), s.path);
            println!("  {} {}", "created:".dimmed(), s.created_at.to_rfc3339());
            println!("  {} {}", "last restart:".dimmed(), s.last_restart.to_rfc3339());
            println!(
                "  {} {}",
                "watchdog:".dimmed(),
                if info.monitored { "on" } else { "off" }
            );
            if let Some(domain) = &s.domain {
                let state = if s.domain_verified { "verified" } else { "pending" };
                println!("  {} {domain} ({state})", "domain:".dimmed());
            }
        }
        Response::LogLines { lines } => {
            for line in lines {
                println!("{line}");
            }
        }
    }
}
