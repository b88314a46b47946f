//! Kana: local WordPress development sites in containers.

mod config;
mod console;
mod error;
mod setup;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kana_docker::docker::DockerEngine;
use kana_docker::images::ImageCheckLog;
use kana_docker::Controller;
use kana_site::{HttpsProbe, RunState, Site, SiteSettings};
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::console::ConsoleProgress;
use crate::error::{Result, io_error};

#[derive(Parser)]
#[command(name = "kana", version, about = "Local WordPress development sites")]
struct Cli {
    /// Use a named site under the Kana directory instead of the current project
    #[arg(short, long, global = true)]
    name: Option<String>,

    /// Project directory (defaults to the current directory)
    #[arg(short = 'C', long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the site, the proxy and any optional services
    Start,
    /// Stop the site; the proxy goes too once no site is left
    Stop,
    /// Show the site's state and containers
    Status,
    /// List every site with running containers
    List,
    /// Run wp-cli against the site
    Wp {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "kana: command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = AppConfig::from_env()?;
    let working_dir = match cli.dir {
        Some(dir) => dir,
        None => std::env::current_dir().map_err(io_error(std::path::Path::new(".")))?,
    };
    let settings = config.site_settings(cli.name.as_deref(), &working_dir)?;

    let engine = Arc::new(DockerEngine::connect().await?);
    let log = ImageCheckLog::load(settings.image_log_path())?;
    let controller = Controller::new(engine, log).with_progress(Arc::new(ConsoleProgress::default()));
    let site = Site::new(&controller, &settings);

    match cli.command {
        Command::Start => {
            setup::write_proxy_config(&settings)?;
            site.start().await?;
            println!("Site {} is running at {}", settings.name, settings.url());
        }
        Command::Stop => {
            if site.stop().await? {
                println!("Site {} stopped", settings.name);
            } else {
                println!("Site {} was not running", settings.name);
            }
        }
        Command::Status => status(&site, &settings).await?,
        Command::List => list(&controller).await?,
        Command::Wp { args } => {
            let output = site.wp_cli(&args).await?;
            print!("{}", output.log);
            if !output.success() {
                let code = u8::try_from(output.exit_code).unwrap_or(1);
                return Ok(ExitCode::from(code.max(1)));
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn status(site: &Site<'_>, settings: &SiteSettings) -> Result<()> {
    // Without a root nothing was ever started, and status must not create one.
    let state = match kana_certs::load_root(&settings.root_files())? {
        Some(root) => site.run_state(&HttpsProbe::new(root.cert_pem())?).await?,
        None => RunState::Unprovisioned,
    };

    println!("{}: {} ({})", settings.name, state, settings.url());
    for container in site.containers().await? {
        println!("  {:<32} {:<24} {:?}", container.name, container.image, container.state);
    }
    Ok(())
}

async fn list(controller: &Controller) -> Result<()> {
    let mut sites: BTreeMap<String, usize> = BTreeMap::new();
    for container in controller.list_by_site("").await? {
        if let Some(site) = container.site() {
            *sites.entry(site.to_string()).or_default() += usize::from(container.state.is_running());
        }
    }

    if sites.is_empty() {
        println!("No sites found");
    }
    for (site, running) in sites {
        let state = if running > 0 { "running" } else { "stopped" };
        println!("{site:<32} {state}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn wp_passes_flags_through() {
        let cli = Cli::try_parse_from(["kana", "wp", "plugin", "list", "--format=json"]).unwrap();
        match cli.command {
            Command::Wp { args } => assert_eq!(args, ["plugin", "list", "--format=json"]),
            _ => panic!("expected wp"),
        }
    }

    #[test]
    fn name_is_global() {
        let cli = Cli::try_parse_from(["kana", "start", "--name", "demo"]).unwrap();
        assert_eq!(cli.name.as_deref(), Some("demo"));
        assert!(matches!(cli.command, Command::Start));
    }
}
