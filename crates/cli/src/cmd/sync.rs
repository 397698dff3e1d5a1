use std::{fs::File, io::BufReader, path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result, bail};
use argp::FromArgs;
use tokio::sync::watch;
use xcbot_core::config::{Config, GitHubConfig, ServerConfig, StoreConfig, SyncConfig};
use xcbot_github::{GitHub, extract_github_url};
use xcbot_server::XcodeServer;
use xcbot_store::StatusStore;
use xcbot_sync::Reconciler;

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Reconcile the server's bots with the repository's open pull requests.
#[argp(subcommand, name = "sync")]
pub struct Args {
    #[argp(option, short = 'c')]
    /// YAML config file; the flags below override its values
    config: Option<PathBuf>,
    #[argp(option, short = 's')]
    /// network name of the Xcode server
    server: Option<String>,
    #[argp(option, short = 'u')]
    /// username for the Xcode server
    user: Option<String>,
    #[argp(option, short = 'p')]
    /// password for the Xcode server
    password: Option<String>,
    #[argp(option, short = 'r')]
    /// repository to track, as owner/name or a GitHub URL
    repo: Option<String>,
    #[argp(option, short = 't')]
    /// GitHub API token (default: the GITHUB_TOKEN environment variable)
    token: Option<String>,
    #[argp(option, short = 'b')]
    /// name of the template bot duplicated for each PR
    template: Option<String>,
    #[argp(option)]
    /// status store database URL (default: sqlite:xcbot.db)
    store: Option<String>,
    #[argp(switch, short = 'n')]
    /// compute and log the plan without creating, deleting or reporting
    dry_run: bool,
    #[argp(switch)]
    /// run passes repeatedly until interrupted
    repeat: bool,
    #[argp(option, short = 'i')]
    /// seconds between passes in repeat mode
    interval: Option<u64>,
}

pub async fn run(args: Args) -> Result<ExitCode> {
    let config = load_config(&args)?;
    let github = Arc::new(GitHub::new(&config.github)?);
    let server = Arc::new(XcodeServer::new(&config.server)?);
    let store = StatusStore::new(&config.store).await?;
    let reconciler = Reconciler::new(
        config.sync.clone(),
        config.github.owner.clone(),
        config.github.repo.clone(),
        github.clone(),
        server,
        github,
        store.clone(),
    );

    if args.repeat {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    let _ = tx.send(true);
                }
                Err(err) => tracing::error!("Failed to listen for ctrl-c: {err}"),
            }
        });
        reconciler.run_loop(rx).await;
        store.close().await;
        return Ok(ExitCode::SUCCESS);
    }

    let outcome = reconciler.run_pass().await?;
    outcome.log();
    let removed = store.cleanup_expired().await?;
    if removed > 0 {
        tracing::debug!(removed, "Removed expired status records");
    }
    store.close().await;
    Ok(if outcome.has_errors() { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

/// Resolve the effective configuration: the YAML file if given, then flag
/// overrides, then the GITHUB_TOKEN fallback.
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open config file {}", path.display()))?;
            serde_yaml::from_reader(BufReader::new(file))
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        }
        None => Config {
            server: ServerConfig {
                name: String::new(),
                user: None,
                password: None,
                timeout_secs: 30,
            },
            github: GitHubConfig {
                token: String::new(),
                owner: String::new(),
                repo: String::new(),
                timeout_secs: 30,
            },
            store: StoreConfig::default(),
            sync: SyncConfig {
                template_bot: String::new(),
                dry_run: false,
                interval_secs: 60,
                concurrency: 4,
            },
        },
    };
    if let Some(server) = &args.server {
        config.server.name = server.clone();
    }
    if args.user.is_some() {
        config.server.user = args.user.clone();
    }
    if args.password.is_some() {
        config.server.password = args.password.clone();
    }
    if let Some(repo) = &args.repo {
        let (owner, name) = parse_repo(repo)?;
        config.github.owner = owner;
        config.github.repo = name;
    }
    if let Some(token) = &args.token {
        config.github.token = token.clone();
    }
    if let Some(template) = &args.template {
        config.sync.template_bot = template.clone();
    }
    if let Some(store) = &args.store {
        config.store.url = store.clone();
    }
    if args.dry_run {
        config.sync.dry_run = true;
    }
    if let Some(interval) = args.interval {
        config.sync.interval_secs = interval;
    }
    if config.github.token.is_empty() {
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            config.github.token = token;
        }
    }

    if config.server.name.is_empty() {
        bail!("A server name is required (--server or config file)");
    }
    if config.github.owner.is_empty() || config.github.repo.is_empty() {
        bail!("A repository is required (--repo or config file)");
    }
    if config.github.token.is_empty() {
        bail!("A GitHub token is required (--token, GITHUB_TOKEN, or config file)");
    }
    if config.sync.template_bot.is_empty() {
        bail!("A template bot name is required (--template or config file)");
    }
    Ok(config)
}

fn parse_repo(value: &str) -> Result<(String, String)> {
    if let Some((owner, repo)) = extract_github_url(value) {
        return Ok((owner.to_string(), repo.to_string()));
    }
    if let Some((owner, repo)) = value.split_once('/') {
        if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') {
            return Ok((owner.to_string(), repo.to_string()));
        }
    }
    bail!("Invalid repository {value:?}; expected owner/name or a GitHub URL")
}
