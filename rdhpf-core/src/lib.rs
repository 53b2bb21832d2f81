// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{env, fs, io, sync::Mutex};

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

mod breaker;
mod config;
mod consts;
mod endpoint;
mod events;
mod forward;
mod history;
mod inspector;
mod ipc;
mod manager;
mod reconciler;
mod remote_cmd;
mod session;
mod signals;
mod state;
mod statefile;
mod status;
mod util;
mod watchdog;

pub use endpoint::RemoteEndpoint;
pub use manager::Manager;

/// The command line arguments rdhpf expects. These can be directly
/// parsed with clap or manually constructed to embed rdhpf inside some
/// other tool's CLI.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(short, long, action, help = "The file to write logs to (default: stderr)")]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(short, long, action, help = "A toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Run the forwarder daemon against a remote docker host")]
    Run {
        #[clap(long, help = "The remote endpoint, e.g. ssh://dev@build-box:2222")]
        endpoint: String,
    },

    #[clap(about = "Print the current forwarding status")]
    Status {
        #[clap(long, help = "The remote endpoint, e.g. ssh://dev@build-box:2222")]
        endpoint: String,
        #[clap(long, help = "Print the status as JSON instead of a table")]
        json: bool,
    },
}

fn init_logging(args: &Args) {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    let trace_level = env::var(consts::LOG_LEVEL_VAR)
        .ok()
        .and_then(|v| v.parse::<tracing::Level>().ok())
        .unwrap_or(trace_level);

    if let Some(log_file) = args.log_file.clone() {
        if let Ok(file) = fs::File::create(log_file) {
            tracing_subscriber::fmt()
                .with_max_level(trace_level)
                .with_thread_ids(true)
                .with_target(false)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_writer(Mutex::new(file))
                .init();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_max_level(trace_level)
        .with_thread_ids(true)
        .with_target(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(io::stderr)
        .init();
}

/// Run rdhpf with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    init_logging(&args);

    let config = config::read_config(&args.config_file)?;

    let res: anyhow::Result<()> = match &args.command {
        Commands::Run { endpoint } => run_daemon(endpoint, config),
        Commands::Status { endpoint, json } => run_status(endpoint, *json),
    };

    if let Err(err) = res {
        error!("{:?}", err);
        std::process::exit(1);
    }
    Ok(())
}

fn run_daemon(endpoint: &str, config: config::Config) -> anyhow::Result<()> {
    let endpoint = RemoteEndpoint::parse(endpoint)?;
    let shutdown_flag = signals::install_shutdown_flag()?;
    let manager = Manager::new(endpoint, config);
    manager.run(shutdown_flag)
}

fn run_status(endpoint: &str, json: bool) -> anyhow::Result<()> {
    let endpoint = RemoteEndpoint::parse(endpoint)?;
    let report = status::read_status(&endpoint)?;
    if json {
        println!("{}", status::render_json(&report)?);
    } else {
        print!("{}", status::render_table(&report));
    }
    Ok(())
}
