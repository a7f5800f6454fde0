// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Entry point for the `uplift` binary. The same executable serves as the
//! hub on the coordinator host and as the agent on every segment host, so a
//! single file needs to be installed cluster-wide.

use std::fs::File;
use std::process::exit;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use uplift_types::NextActionError;

#[derive(Parser)]
#[command(name = "uplift", version, about = "In-place major-version upgrades for Greenplum clusters")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator-host service that drives the upgrade.
    Hub {
        #[arg(long, default_value_t = 7527)]
        port: u16,
        /// Print a readiness line for a daemonizing parent to wait on.
        #[arg(long)]
        daemonize: bool,
        /// Append logs to hub.log in this directory instead of stderr.
        #[arg(long)]
        log_directory: Option<Utf8PathBuf>,
    },
    /// Run the per-host service the hub fans work out to.
    Agent {
        #[arg(long, default_value_t = 6416)]
        port: u16,
        /// Print a readiness line for a daemonizing parent to wait on.
        #[arg(long)]
        daemonize: bool,
        /// Append logs to agent.log in this directory instead of stderr.
        #[arg(long)]
        log_directory: Option<Utf8PathBuf>,
    },
}

fn init_tracing(process: &str, log_directory: Option<&Utf8PathBuf>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_directory {
        Some(dir) => {
            std::fs::create_dir_all(dir.as_std_path())?;
            let file = File::options()
                .create(true)
                .append(true)
                .open(dir.join(format!("{process}.log")).as_std_path())?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Hub {
            port,
            daemonize,
            log_directory,
        } => {
            init_tracing("hub", log_directory.as_ref())?;
            uplift_hub::serve(uplift_hub::HubOptions { port, daemonize }).await
        }
        Command::Agent {
            port,
            daemonize,
            log_directory,
        } => {
            init_tracing("agent", log_directory.as_ref())?;
            uplift_agent::serve(uplift_agent::AgentOptions { port, daemonize }).await
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        eprintln!("Error: {err:#}");
        if let Some(next) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<NextActionError>())
        {
            eprintln!("{}", next.help());
        }
        exit(1);
    }
}
