//! Control protocol for netbd <-> netctl communication over Unix Domain Socket.
//!
//! One JSON-encoded [`Request`] per line; every request is answered with one
//! JSON-encoded [`Response`] line.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::config::Network;
use crate::daemon::Daemon;
use crate::registry::Export;

/// Request from netctl to netbd.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Register an export backed by the given backend URL.
    ExportAdd {
        name: String,
        description: String,
        backend: String,
    },
    /// Unregister an export.
    ExportRemove { name: String },
    /// List all exports.
    ExportList,
    /// Get daemon status.
    Status,
}

/// Response from netbd to netctl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Error(String),
    Export(ExportInfo),
    ExportList(Vec<ExportInfo>),
    Status(ServerStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportInfo {
    pub name: String,
    pub description: String,
    pub size_bytes: u64,
    /// Backend identity, as displayed by the backend.
    pub backend: String,
}

impl From<&Export> for ExportInfo {
    fn from(export: &Export) -> Self {
        Self {
            name: export.name().to_string(),
            description: export.description().to_string(),
            size_bytes: export.size_bytes(),
            backend: export.backend().to_string(),
        }
    }
}

/// Daemon status information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub export_count: usize,
    pub active_sessions: usize,
    /// NBD listen address.
    pub address: String,
    pub network: Network,
    pub read_only: bool,
}

/// Serve one control connection until the peer closes it.
///
/// Lines that do not parse as a request get an error response; the
/// connection stays open.
pub async fn serve_control<S>(stream: S, daemon: &Daemon) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => process_request(daemon, request).await,
            Err(e) => Response::Error(e.to_string()),
        };
        let resp = serde_json::to_string(&response)? + "\n";
        writer.write_all(resp.as_bytes()).await?;
    }
}

pub async fn process_request(daemon: &Daemon, req: Request) -> Response {
    match req {
        Request::ExportAdd {
            name,
            description,
            backend,
        } => match daemon.add_export(&name, &description, &backend).await {
            Ok(export) => Response::Export(ExportInfo::from(export.as_ref())),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::ExportRemove { name } => match daemon.remove_export(&name).await {
            Ok(_) => Response::Ok,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::ExportList => {
            let exports = daemon.list_exports().await;
            Response::ExportList(exports.iter().map(|e| ExportInfo::from(e.as_ref())).collect())
        }
        Request::Status => Response::Status(ServerStatus {
            export_count: daemon.registry().len().await,
            active_sessions: daemon.active_sessions(),
            address: daemon.address().to_string(),
            network: daemon.config().server.network,
            read_only: daemon.options().read_only,
        }),
    }
}
