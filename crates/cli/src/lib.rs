pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "propline",
    about = "Propline operator CLI",
    long_about = "Operate the property intake stores: migrations, readiness checks, \
                  offline message simulation, and graph index rebuilds.",
    after_help = "Examples:\n  propline doctor --json\n  propline simulate --from whatsapp:+2348012345678 \"hi\"\n  propline reindex --principal +2348012345678"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending migrations to the relational and graph stores")]
    Migrate,
    #[command(about = "Validate config, extraction client readiness, and store connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Run one inbound message through the intake runtime and print the reply")]
    Simulate {
        #[arg(long, help = "Sender id, e.g. whatsapp:+2348012345678")]
        from: String,
        #[arg(long, help = "Provider message id; generated when omitted")]
        message_id: Option<String>,
        #[arg(help = "Message text")]
        text: String,
    },
    #[command(about = "Rebuild a principal's graph nodes and edges from relational state")]
    Reindex {
        #[arg(long, help = "Principal phone number or sender id")]
        principal: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Simulate { from, message_id, text } => {
            commands::simulate::run(&from, message_id.as_deref(), &text)
        }
        Command::Reindex { principal } => commands::reindex::run(&principal),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Diagnostics go to stderr so command output on stdout stays parseable.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("PROPLINE_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .compact()
        .try_init();
}
