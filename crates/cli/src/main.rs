mod commands;

use clap::{CommandFactory, Parser};
use clap_complete::{Shell, generate};
use sitedeploy_core::CancellationToken;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sitedeploy")]
#[command(version, about = "Build a static site and ship it to a hosting backend", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./sitedeploy.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Build the site without deploying
    Build {
        /// Empty the output directory first
        #[arg(long)]
        clean: bool,

        /// Skip the Pagefind search index step
        #[arg(long)]
        no_pagefind: bool,

        /// Override the site's base URL
        #[arg(long)]
        base_url: Option<String>,
    },

    /// Deploy the built site
    Deploy {
        /// Target id (defaults to deployment.method)
        #[arg(long, conflicts_with = "all")]
        to: Option<String>,

        /// Deploy to every configured target
        #[arg(long)]
        all: bool,

        /// Build before deploying
        #[arg(long)]
        build: bool,

        /// Commit or deploy message
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Show the remote state of a target
    Status {
        /// Target id (defaults to deployment.method)
        #[arg(long)]
        to: Option<String>,
    },

    /// Check credentials and reachability without deploying
    Test {
        /// Target id (defaults to deployment.method)
        #[arg(long)]
        to: Option<String>,
    },

    /// List deployment targets
    Targets {
        /// Include each target's settings fields
        #[arg(long)]
        schema: bool,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_writer(io::stderr),
        )
        .init();

    if let Command::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "sitedeploy", &mut io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    let orchestrator = commands::load_orchestrator(cli.config.as_deref())?;
    let json = cli.json;

    let code = match cli.command {
        Command::Build {
            clean,
            no_pagefind,
            base_url,
        } => commands::build::run(&orchestrator, clean, !no_pagefind, base_url, &cancel, json).await,
        Command::Deploy {
            to,
            all,
            build,
            message,
        } => {
            let options = commands::deploy::Options {
                target: to,
                all,
                build,
                message,
            };
            commands::deploy::run(orchestrator, options, cancel, json).await?
        }
        Command::Status { to } => commands::status::run(&orchestrator, to, &cancel, json).await?,
        Command::Test { to } => commands::status::test(&orchestrator, to, &cancel, json).await?,
        Command::Targets { schema } => commands::targets::run(&orchestrator, schema, json)?,
        Command::Completions { .. } => ExitCode::SUCCESS,
    };
    Ok(code)
}
