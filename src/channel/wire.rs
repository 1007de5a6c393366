//! Line-delimited JSON wire protocol between controller and worker.

use std::io;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::engine::ExportedFrame;
use crate::output::OutputMode;
use crate::worker::{GrantReport, GrantRequest};

/// Requests accepted by the worker. One JSON object per line, tagged by
/// `op`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Version,
    Setup {
        /// Engine user directory. Falls back to the worker's configured
        /// directory when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_dir: Option<PathBuf>,
    },
    GrantPermissions {
        #[serde(flatten)]
        request: GrantRequest,
    },
    SetForcedOutputSize {
        width: u32,
        height: u32,
    },
    ClearForcedOutputSize,
    SetMonitorSurface {
        path: Option<PathBuf>,
    },
    SetOutputMode {
        mode: OutputMode,
    },
    StartCapture,
    StopCapture,
    GetOutputId,
    SetResolution {
        width: u32,
        height: u32,
        dpi: u32,
    },
    LoadResource {
        path: PathBuf,
    },
    SetInstanceOption {
        key: i32,
        value: String,
    },
    AppendTask {
        task_type: String,
        params: String,
    },
    SetTaskParams {
        task_id: i32,
        params: String,
    },
    GetTasksList,
    Start,
    Stop,
    Running,
    BackToHome,
    GetUuid,
    GetImage,
    GetImageBgr,
    Exit,
}

/// Worker replies, tagged by `result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Bool { value: bool },
    Int { value: i32 },
    IntList { values: Vec<i32> },
    Text { value: Option<String> },
    Grants { report: GrantReport },
    Frame { frame: Option<ExportedFrame> },
    Error { message: String },
}

impl Response {
    pub fn bool_value(&self) -> bool {
        matches!(self, Response::Bool { value: true })
    }
}

/// Serialize one message and write it as a single line.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Read one line and deserialize it. `None` means the peer closed the
/// connection cleanly.
pub async fn read_message<R, T>(reader: &mut BufReader<R>) -> io::Result<Option<T>>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    let message = serde_json::from_str(line.trim_end())?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_tagged_by_op() {
        let json = serde_json::to_string(&Request::AppendTask {
            task_type: "Startup".to_string(),
            params: "{}".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""op":"append_task""#));

        let back: Request = serde_json::from_str(&json).unwrap();
        match back {
            Request::AppendTask { task_type, .. } => assert_eq!(task_type, "Startup"),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn setup_parses_with_and_without_a_user_dir() {
        let bare: Request = serde_json::from_str(r#"{"op":"setup"}"#).unwrap();
        assert!(matches!(bare, Request::Setup { user_dir: None }));

        let json = serde_json::to_string(&Request::Setup {
            user_dir: Some(PathBuf::from("/data/engine")),
        })
        .unwrap();
        assert!(json.contains(r#""user_dir":"/data/engine""#));
    }

    #[test]
    fn unknown_op_fails_to_parse() {
        let err = serde_json::from_str::<Request>(r#"{"op":"self_destruct"}"#);
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn messages_round_trip_over_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut client_tx) = tokio::io::split(client);
        let (server_rx, _) = tokio::io::split(server);
        let mut reader = BufReader::new(server_rx);

        write_message(&mut client_tx, &Request::Ping).await.unwrap();
        write_message(&mut client_tx, &Request::GetOutputId)
            .await
            .unwrap();

        let first: Request = read_message(&mut reader).await.unwrap().unwrap();
        let second: Request = read_message(&mut reader).await.unwrap().unwrap();
        assert!(matches!(first, Request::Ping));
        assert!(matches!(second, Request::GetOutputId));

        drop(client_tx);
        let eof: Option<Request> = read_message(&mut reader).await.unwrap();
        assert!(eof.is_none());
    }
}
