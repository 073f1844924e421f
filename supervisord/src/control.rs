//! The control listener: a minimal line-oriented JSON codec over a Unix
//! domain socket, sitting on top of [`supervisor_core::ControlApi`].
//! Framing and serialization are deliberately simple; the supervision core
//! only requires a request/response boundary, not any particular wire
//! format.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use supervisor_core::{ControlApi, ProcessStatus, StatusLabel};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Gobin {
        source_path: PathBuf,
        name: String,
        #[serde(default)]
        keep_alive: bool,
        #[serde(default)]
        args: Vec<String>,
    },
    StartProc { name: String },
    StopProc { name: String },
    RestartProc { name: String },
    DeleteProc { name: String },
    Monit,
    Save,
    Resurrect,
}

#[derive(Debug, Serialize)]
struct StatusEntry {
    name: String,
    pid: Option<u32>,
    status: String,
    keep_alive: bool,
    restart_count: u64,
}

impl From<ProcessStatus> for StatusEntry {
    fn from(status: ProcessStatus) -> Self {
        let StatusLabel(label) = status.status_label;
        StatusEntry {
            name: status.name,
            pid: status.pid,
            status: label,
            keep_alive: status.keep_alive,
            restart_count: status.restart_count,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Response {
    Ack { ok: bool },
    BuildLog { ok: bool, output: String },
    Status { ok: bool, procs: Vec<StatusEntry> },
    Error { ok: bool, error: String },
}

/// Binds `socket_path` (removing a stale socket file first) and serves
/// control connections until the process exits. Each connection is handled
/// on its own task; a malformed request gets an `Error` response and the
/// connection stays open for the next line.
pub async fn serve(socket_path: &Path, supervisor: Arc<dyn ControlApi>) -> anyhow::Result<()> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "control listener bound");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            if let Err(error) = handle_connection(stream, supervisor).await {
                warn!(%error, "control connection ended with error");
            }
        });
    }
}

async fn handle_connection(stream: UnixStream, supervisor: Arc<dyn ControlApi>) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(&*supervisor, request).await,
            Err(error) => Response::Error {
                ok: false,
                error: format!("malformed request: {error}"),
            },
        };
        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        writer.write_all(&payload).await?;
    }
    Ok(())
}

async fn dispatch(supervisor: &dyn ControlApi, request: Request) -> Response {
    match request {
        Request::Gobin { source_path, name, keep_alive, args } => {
            match supervisor.gobin(source_path, name, keep_alive, args).await {
                Ok(output) => Response::BuildLog { ok: true, output },
                Err(error) => Response::Error { ok: false, error: error.to_string() },
            }
        }
        Request::StartProc { name } => result_response(supervisor.start_proc(&name).await),
        Request::StopProc { name } => result_response(supervisor.stop_proc(&name).await),
        Request::RestartProc { name } => result_response(supervisor.restart_proc(&name).await),
        Request::DeleteProc { name } => result_response(supervisor.delete_proc(&name).await),
        Request::Monit => Response::Status {
            ok: true,
            procs: supervisor.monit().await.into_iter().map(StatusEntry::from).collect(),
        },
        Request::Save => result_response(supervisor.save_proc().await),
        Request::Resurrect => result_response(supervisor.resurrect().await),
    }
}

fn result_response(result: supervisor_core::Result<()>) -> Response {
    match result {
        Ok(()) => Response::Ack { ok: true },
        Err(error) => Response::Error { ok: false, error: error.to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gobin_request() {
        let request: Request = serde_json::from_str(
            r#"{"op": "gobin", "source_path": "./sleeper", "name": "a", "keep_alive": true, "args": ["30"]}"#,
        )
        .unwrap();
        match request {
            Request::Gobin { source_path, name, keep_alive, args } => {
                assert_eq!(source_path, PathBuf::from("./sleeper"));
                assert_eq!(name, "a");
                assert!(keep_alive);
                assert_eq!(args, vec!["30".to_string()]);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn parses_bare_ops_without_arguments() {
        let request: Request = serde_json::from_str(r#"{"op": "monit"}"#).unwrap();
        assert!(matches!(request, Request::Monit));
    }

    #[test]
    fn error_response_round_trips_through_json() {
        let response = Response::Error { ok: false, error: "unknown process \"a\"".to_string() };
        let text = serde_json::to_string(&response).unwrap();
        assert!(text.contains("\"ok\":false"));
        assert!(text.contains("unknown process"));
    }
}
