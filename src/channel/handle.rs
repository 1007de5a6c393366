use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::wire::{read_message, write_message, Request, Response};
use super::ChannelError;

const PING_TIMEOUT: Duration = Duration::from_secs(1);

struct Conn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Cheap-to-clone handle over the worker connection. Calls are serialized
/// on the underlying stream; one request is always answered before the
/// next is written.
#[derive(Clone)]
pub struct RemoteHandle {
    conn: Arc<Mutex<Conn>>,
}

impl RemoteHandle {
    pub fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            conn: Arc::new(Mutex::new(Conn {
                reader: BufReader::new(read_half),
                writer: write_half,
            })),
        }
    }

    /// Send one request and wait for its reply. A closed stream maps to
    /// [`ChannelError::Died`], a worker-side failure to
    /// [`ChannelError::Remote`].
    pub async fn call(&self, request: &Request) -> Result<Response, ChannelError> {
        let mut conn = self.conn.lock().await;
        write_message(&mut conn.writer, request).await?;
        match read_message(&mut conn.reader).await? {
            Some(Response::Error { message }) => Err(ChannelError::Remote(message)),
            Some(response) => Ok(response),
            None => Err(ChannelError::Died),
        }
    }

    /// Liveness check with a short deadline.
    pub async fn ping(&self) -> bool {
        match tokio::time::timeout(PING_TIMEOUT, self.call(&Request::Ping)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("ping failed: {e}");
                false
            }
            Err(_) => {
                debug!("ping timed out");
                false
            }
        }
    }
}
