//! netctl - CLI client for the netbd daemon.
//!
//! Usage:
//!   netctl export add <name> <backend-url> [--description <text>]
//!   netctl export remove <name>
//!   netctl export list
//!   netctl status

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use netbd::control::{ExportInfo, Request, Response};

const DEFAULT_SOCKET_PATH: &str = "/run/netbd/netbd.sock";

#[derive(Parser)]
#[command(name = "netctl")]
#[command(about = "Control the netbd daemon")]
struct Cli {
    /// Control socket path
    #[arg(short, long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export management
    Export {
        #[command(subcommand)]
        command: ExportCommands,
    },
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum ExportCommands {
    /// Register an export
    Add {
        /// Export name
        name: String,
        /// Backend URL, e.g. memory:?size=1073741824 or file:///var/lib/netbd/disk0.img
        backend: String,
        /// Description shown to clients listing exports
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Unregister an export
    Remove {
        /// Export name
        name: String,
    },
    /// List all exports
    List,
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.2} GiB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.2} MiB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

async fn send_request(socket: &PathBuf, request: Request) -> Result<Response> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("Failed to connect to daemon at {}", socket.display()))?;

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let req_json = serde_json::to_string(&request)? + "\n";
    writer.write_all(req_json.as_bytes()).await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let response: Response = serde_json::from_str(&line)?;

    Ok(response)
}

fn print_export(info: &ExportInfo) {
    println!("Export: {}", info.name);
    println!("  Description: {}", info.description);
    println!("  Size:        {}", format_size(info.size_bytes));
    println!("  Backend:     {}", info.backend);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let request = match cli.command {
        Commands::Export { command } => match command {
            ExportCommands::Add {
                name,
                backend,
                description,
            } => Request::ExportAdd {
                name,
                description,
                backend,
            },
            ExportCommands::Remove { name } => Request::ExportRemove { name },
            ExportCommands::List => Request::ExportList,
        },
        Commands::Status => Request::Status,
    };

    let response = send_request(&cli.socket, request).await?;

    match response {
        Response::Ok => {
            println!("OK");
        }
        Response::Error(msg) => {
            eprintln!("Error: {}", msg);
            std::process::exit(1);
        }
        Response::Export(info) => print_export(&info),
        Response::ExportList(exports) => {
            if exports.is_empty() {
                println!("No exports");
            } else {
                println!("{:<20} {:>12}  {:<30} BACKEND", "NAME", "SIZE", "DESCRIPTION");
                for export in exports {
                    println!(
                        "{:<20} {:>12}  {:<30} {}",
                        export.name,
                        format_size(export.size_bytes),
                        export.description,
                        export.backend
                    );
                }
            }
        }
        Response::Status(status) => {
            println!("netbd daemon status:");
            println!("  Exports:    {}", status.export_count);
            println!("  Sessions:   {}", status.active_sessions);
            println!("  NBD:        {} ({})", status.address, status.network);
            println!("  Read-only:  {}", status.read_only);
        }
    }

    Ok(())
}
