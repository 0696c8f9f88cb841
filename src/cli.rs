use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::{self, CommandReport};
use crate::logging;

#[derive(Debug, Parser)]
#[command(
    name = "chat2bear",
    version,
    about = "Import ChatGPT conversations into Bear and reconcile what landed"
)]
struct Cli {
    /// Print the command report as JSON.
    #[arg(long, global = true)]
    json: bool,
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Ledger file (defaults to $CHAT2BEAR_LEDGER or ~/.chat2bear/ledger.jsonl).
    #[arg(long, global = true)]
    ledger: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ask Bear to create a note for every conversation not yet imported.
    Import(ImportArgs),
    /// Ask Bear whether imported notes still exist.
    #[command(
        name = "check-bear-notes-exist",
        visible_alias = "check",
        alias = "check_bear_notes_exist"
    )]
    Check(CheckArgs),
    /// Run the callback receiver that records Bear's answers.
    Serve(ServeArgs),
    /// Summarise the ledger, optionally against an export.
    Status(StatusArgs),
}

#[derive(Debug, Args)]
struct ImportArgs {
    /// ChatGPT export (`conversations.json`).
    #[arg(long, default_value = "conversations.json")]
    export: PathBuf,
    /// Stop after this many launch attempts.
    #[arg(long)]
    max: Option<u64>,
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// Check the conversations of this export instead of the ledger's.
    #[arg(long)]
    export: Option<PathBuf>,
    #[arg(long)]
    max: Option<u64>,
    /// Re-check notes already confirmed or known missing.
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Loopback address to listen on (defaults to the configured bind_addr).
    #[arg(long)]
    bind: Option<String>,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[arg(long)]
    export: Option<PathBuf>,
    /// Also show where one conversation stands.
    #[arg(long)]
    conversation: Option<String>,
}

fn render(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let state = if report.ok { "ok" } else { "issues" };
    println!("{}: {state}", report.command);
    for detail in &report.details {
        println!("  {detail}");
    }
    if !report.issues.is_empty() {
        println!("issues:");
        for issue in &report.issues {
            println!("  - {issue}");
        }
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let report = match cli.command {
        Command::Import(args) => commands::import::run(&commands::import::ImportOptions {
            ledger: cli.ledger.clone(),
            export: args.export,
            max: args.max,
        })?,
        Command::Check(args) => commands::check::run(&commands::check::CheckOptions {
            ledger: cli.ledger.clone(),
            export: args.export,
            max: args.max,
            force: args.force,
        })?,
        Command::Serve(args) => commands::serve::run(&commands::serve::ServeOptions {
            ledger: cli.ledger.clone(),
            bind: args.bind,
        })?,
        Command::Status(args) => commands::status::run(&commands::status::StatusOptions {
            ledger: cli.ledger.clone(),
            export: args.export,
            conversation: args.conversation,
        })?,
    };

    render(&report, cli.json)?;
    if !report.ok {
        anyhow::bail!(
            "{} finished with {} issue(s)",
            report.command,
            report.issues.len()
        );
    }
    Ok(())
}
