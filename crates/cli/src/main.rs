mod cmd;

use std::process::ExitCode;

use argp::FromArgs;
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Keep an Xcode server's bots in sync with a repository's open pull requests.
struct TopLevel {
    #[argp(switch, short = 'v')]
    /// enable debug logging
    verbose: bool,
    #[argp(subcommand)]
    command: Command,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
#[argp(subcommand)]
enum Command {
    Sync(cmd::sync::Args),
    Status(cmd::status::Args),
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: TopLevel = argp::parse_args_or_exit(argp::DEFAULT);
    let default_level = if args.verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let env_filter =
        EnvFilter::builder().with_default_directive(default_level.into()).from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let result = match args.command {
        Command::Sync(args) => cmd::sync::run(args).await,
        Command::Status(args) => cmd::status::run(args).await,
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:?}");
            ExitCode::FAILURE
        }
    }
}
