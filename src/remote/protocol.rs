//! Worker wire format: 4-byte big-endian length followed by a `bincode` payload.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::RemoteDispatchError;

/// Largest accepted frame payload.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Size of artifact chunks streamed by `Fetch`.
pub const CHUNK_BYTES: usize = 1024 * 1024;

/// Build one round on a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Artifact tag.
    pub tag: String,
    /// `(locator, value)` pairs in site order.
    pub mutations: Vec<(String, String)>,
}

/// Client to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerRequest {
    /// Apply values and build.
    Build(BuildRequest),
    /// Stream an artifact back.
    Fetch {
        /// Worker-side artifact path.
        path: String,
    },
    /// Remove a worker-side artifact.
    Discard {
        /// Worker-side artifact path.
        path: String,
    },
}

/// Worker to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// Build request queued.
    Accepted,
    /// Build finished; artifact stored at `path` on the worker.
    Built {
        /// Worker-side artifact path.
        path: String,
    },
    /// Request failed.
    Failed {
        /// Error text.
        message: String,
    },
    /// Directory entry of the artifact, relative to its root (`""` for the root itself).
    Directory {
        /// `/`-separated path below the artifact root.
        relative: String,
    },
    /// Following chunks belong to this file (`""` when the artifact is a single file).
    File {
        /// `/`-separated path below the artifact root.
        relative: String,
    },
    /// Part of the current file.
    Chunk(Vec<u8>),
    /// Artifact stream complete.
    End,
    /// Discard complete.
    Done,
}

/// Serialize `message` into a complete frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, RemoteDispatchError> {
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(RemoteDispatchError::FrameTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn checked_len(header: [u8; 4]) -> Result<usize, RemoteDispatchError> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(RemoteDispatchError::FrameTooLarge(len));
    }
    Ok(len)
}

/// Write one message.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), RemoteDispatchError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    writer.write_all(&encode_frame(message)?).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message; `None` when the peer closed the connection between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, RemoteDispatchError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let mut body = vec![0u8; checked_len(header)?];
    reader.read_exact(&mut body).await?;
    Ok(Some(bincode::deserialize(&body)?))
}

/// Blocking variant of [`write_frame`].
pub fn write_frame_blocking<W, T>(writer: &mut W, message: &T) -> Result<(), RemoteDispatchError>
where
    W: Write,
    T: Serialize,
{
    writer.write_all(&encode_frame(message)?)?;
    writer.flush()?;
    Ok(())
}

/// Blocking variant of [`read_frame`].
pub fn read_frame_blocking<R, T>(reader: &mut R) -> Result<Option<T>, RemoteDispatchError>
where
    R: Read,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let mut body = vec![0u8; checked_len(header)?];
    reader.read_exact(&mut body)?;
    Ok(Some(bincode::deserialize(&body)?))
}
