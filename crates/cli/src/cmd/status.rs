use std::process::ExitCode;

use anyhow::{Context, Result};
use argp::FromArgs;
use xcbot_core::{BotDirectory, config::ServerConfig, status};
use xcbot_server::XcodeServer;

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Print the latest integration status of every bot on the server.
#[argp(subcommand, name = "status")]
pub struct Args {
    #[argp(option, short = 's')]
    /// network name of the Xcode server
    server: String,
    #[argp(option, short = 'u')]
    /// username for the Xcode server
    user: Option<String>,
    #[argp(option, short = 'p')]
    /// password for the Xcode server
    password: Option<String>,
}

pub async fn run(args: Args) -> Result<ExitCode> {
    let config = ServerConfig {
        name: args.server,
        user: args.user,
        password: args.password,
        timeout_secs: 30,
    };
    let server = XcodeServer::new(&config)?;
    let (lines, failures) = collect_lines(&server).await?;
    if lines.is_empty() && failures == 0 {
        println!("No bots configured on {}", server.server_name());
        return Ok(ExitCode::SUCCESS);
    }
    for line in &lines {
        println!("{line}");
    }
    Ok(if failures > 0 { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

/// Render one summary line per bot. A bot whose status cannot be fetched is
/// logged and skipped; only the bot listing itself is fatal.
async fn collect_lines(directory: &dyn BotDirectory) -> Result<(Vec<String>, usize)> {
    let bots = directory.bots().await.context("Failed to list bots")?;
    let mut lines = Vec::with_capacity(bots.len());
    let mut failures = 0;
    for bot in &bots {
        match directory.status(bot).await {
            Ok(status) => lines.push(status::summary(&status)),
            Err(err) => {
                failures += 1;
                tracing::error!("Failed to fetch status of bot {}: {err:#}", bot.name);
            }
        }
    }
    Ok((lines, failures))
}
