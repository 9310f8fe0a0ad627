//! docsync CLI
//!
//! Command-line tools for the docsync engine.
//!
//! # Commands
//!
//! - `demo` - Synchronize a generated data set against an in-process backend
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// docsync command-line tools.
#[derive(Parser)]
#[command(name = "docsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sync against an in-process backend and print the event stream
    Demo {
        /// Number of documents the backend starts with
        #[arg(short, long, default_value = "12")]
        documents: usize,

        /// Number of backend documents carrying an attachment
        #[arg(short, long, default_value = "3")]
        attachments: usize,

        /// Number of documents created on the device before syncing
        #[arg(short, long, default_value = "4")]
        local: usize,

        /// Changes requested per pull page
        #[arg(short, long, default_value = "5")]
        page_size: u32,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Revoke the device token and sync once more
        #[arg(short, long)]
        revoke: bool,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Demo {
            documents,
            attachments,
            local,
            page_size,
            format,
            revoke,
        } => {
            let options = commands::demo::DemoOptions {
                documents,
                attachments,
                local,
                page_size,
                format: format.parse()?,
                revoke,
            };
            commands::demo::run(&options).await?;
        }
        Commands::Version => {
            println!("docsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("docsync protocol v{}", docsync_protocol::PROTOCOL_VERSION);
        }
    }

    Ok(())
}
