//! rdbg - command-line client for iOS Web Inspector remote debugging
//!
//! This is the binary entry point. Protocol logic lives in the library crates;
//! results are printed to stdout as NDJSON and logs go to the log file.

mod commands;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::Result;
use tracing::{error, info};

use rdbg_core::{DebuggerKind, Settings};

use crate::output::OutputEvent;

/// rdbg - Web Inspector remote debugging from the command line
#[derive(Parser, Debug)]
#[command(name = "rdbg")]
#[command(about = "Web Inspector remote debugging from the command line", long_about = None)]
struct Args {
    /// Directory holding `.rdbg/config.toml` (defaults to the current directory)
    #[arg(long, value_name = "PATH")]
    project: Option<PathBuf>,

    /// Endpoint flavour
    #[arg(long, value_enum)]
    kind: Option<KindArg>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Unix socket of a simulator's inspector endpoint
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Bundle identifier of the application to target
    #[arg(long)]
    bundle_id: Option<String>,

    #[arg(long)]
    platform_version: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List connected applications
    Apps,

    /// List the pages of an application (WebKit: of the endpoint)
    Pages {
        /// Application id, e.g. `PID:42`; defaults to the selected target
        app_id: Option<String>,
    },

    /// Evaluate a script in a page and print its value
    Eval {
        #[arg(long)]
        app: Option<String>,

        #[arg(long)]
        page: String,

        script: String,
    },

    /// Print page changes of an application until disconnected
    Watch {
        #[arg(long)]
        app: Option<String>,
    },

    /// Write the effective settings to `.rdbg/config.toml`
    Init,

    /// Simulator management
    Sim {
        #[command(subcommand)]
        command: SimCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SimCommand {
    /// List simulators
    List {
        /// Only simulators of this iOS SDK, e.g. `9.3`
        #[arg(long)]
        sdk: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Native,
    Webkit,
}

impl From<KindArg> for DebuggerKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Native => DebuggerKind::Native,
            KindArg::Webkit => DebuggerKind::WebKit,
        }
    }
}

impl Args {
    /// Flags take precedence over the config file.
    fn apply(&self, settings: &mut Settings) {
        let debugger = &mut settings.debugger;
        if let Some(kind) = self.kind {
            debugger.kind = kind.into();
        }
        if let Some(host) = &self.host {
            debugger.host = host.clone();
        }
        if let Some(port) = self.port {
            debugger.port = port;
        }
        if let Some(socket) = &self.socket {
            debugger.socket_path = Some(socket.clone());
        }
        if let Some(bundle_id) = &self.bundle_id {
            debugger.bundle_id = Some(bundle_id.clone());
        }
        if let Some(version) = &self.platform_version {
            debugger.platform_version = Some(version.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    rdbg_core::logging::init()?;

    let project = args
        .project
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let mut settings = rdbg_core::load_settings(&project);
    args.apply(&mut settings);
    info!(
        "Endpoint: {} {}:{}",
        settings.debugger.kind, settings.debugger.host, settings.debugger.port
    );

    let result = match &args.command {
        Command::Apps => commands::apps(&settings).await,
        Command::Pages { app_id } => commands::pages(&settings, app_id.as_deref()).await,
        Command::Eval { app, page, script } => {
            commands::eval(&settings, app.as_deref(), page, script).await
        }
        Command::Watch { app } => commands::watch(&settings, app.as_deref()).await,
        Command::Init => commands::init(&project, &settings),
        Command::Sim {
            command: SimCommand::List { sdk },
        } => commands::sim_list(&settings, sdk.as_deref()).await,
    };

    if let Err(ref e) = result {
        error!("Command failed: {:?}", e);
        OutputEvent::error(e).emit();
    }
    Ok(result?)
}
