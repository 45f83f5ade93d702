//! Client side of the worker protocol.

use std::fs::File;
use std::future::Future;
use std::io::{Read, Write};
use std::net::{TcpStream as StdTcpStream, ToSocketAddrs};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tokio::net::TcpStream;

use super::protocol::{
    BuildRequest, WorkerRequest, WorkerResponse, read_frame, read_frame_blocking, write_frame,
    write_frame_blocking,
};
use super::{RemoteDispatchError, RemoteLocation};
use crate::config::WorkerEndpoint;

/// Issues build requests to a worker.
pub trait BuildTransport: Send + Sync + 'static {
    /// Build `request` on `worker`; resolves to the worker-side artifact path.
    fn build(
        &self,
        worker: &WorkerEndpoint,
        request: BuildRequest,
    ) -> impl Future<Output = Result<String, RemoteDispatchError>> + Send;
}

/// Moves remote artifacts to local storage. Called from the blocking test stage.
pub trait ArtifactFetcher: Send + Sync {
    /// Copy the artifact at `location`, a file or a directory tree, to `dest`.
    fn fetch(&self, location: &RemoteLocation, dest: &Path) -> Result<(), RemoteDispatchError>;

    /// Delete the worker-side copy.
    fn discard(&self, location: &RemoteLocation) -> Result<(), RemoteDispatchError>;
}

/// One TCP connection per request.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

fn unexpected(response: Option<WorkerResponse>) -> RemoteDispatchError {
    match response {
        Some(other) => RemoteDispatchError::Protocol(format!("unexpected response {other:?}")),
        None => RemoteDispatchError::Protocol("connection closed mid-request".to_string()),
    }
}

impl TcpTransport {
    /// Transport with a custom connect timeout.
    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn connect_blocking(&self, worker: &WorkerEndpoint) -> Result<StdTcpStream, RemoteDispatchError> {
        let addr = (worker.host.as_str(), worker.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RemoteDispatchError::Protocol(format!("cannot resolve {worker}")))?;
        Ok(StdTcpStream::connect_timeout(&addr, self.connect_timeout)?)
    }
}

impl BuildTransport for TcpTransport {
    async fn build(
        &self,
        worker: &WorkerEndpoint,
        request: BuildRequest,
    ) -> Result<String, RemoteDispatchError> {
        let connect = TcpStream::connect((worker.host.as_str(), worker.port));
        let mut stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                RemoteDispatchError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {worker} timed out"),
                ))
            })??;
        write_frame(&mut stream, &WorkerRequest::Build(request)).await?;

        match read_frame(&mut stream).await? {
            Some(WorkerResponse::Accepted) => {}
            Some(WorkerResponse::Failed { message }) => {
                return Err(RemoteDispatchError::Worker {
                    worker: worker.to_string(),
                    message,
                });
            }
            other => return Err(unexpected(other)),
        }
        match read_frame(&mut stream).await? {
            Some(WorkerResponse::Built { path }) => Ok(path),
            Some(WorkerResponse::Failed { message }) => Err(RemoteDispatchError::Worker {
                worker: worker.to_string(),
                message,
            }),
            other => Err(unexpected(other)),
        }
    }
}

/// Local path of a streamed entry; `""` names the artifact root.
fn entry_path(root: &Path, relative: &str) -> Result<PathBuf, RemoteDispatchError> {
    if relative.is_empty() {
        return Ok(root.to_path_buf());
    }
    let rel = Path::new(relative);
    if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(RemoteDispatchError::Protocol(format!(
            "artifact entry `{relative}` escapes the artifact root"
        )));
    }
    Ok(root.join(rel))
}

/// Remove a file or directory tree; a missing path is fine.
fn remove_path(path: &Path) -> std::io::Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Write the streamed entries below `root`; returns the number of bytes received.
fn receive_artifact<R: Read>(
    stream: &mut R,
    location: &RemoteLocation,
    root: &Path,
) -> Result<usize, RemoteDispatchError> {
    let mut current: Option<File> = None;
    let mut received = 0usize;
    loop {
        match read_frame_blocking(stream)? {
            Some(WorkerResponse::Directory { relative }) => {
                current = None;
                std::fs::create_dir_all(entry_path(root, &relative)?)?;
            }
            Some(WorkerResponse::File { relative }) => {
                let path = entry_path(root, &relative)?;
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                current = Some(File::create(&path)?);
            }
            Some(WorkerResponse::Chunk(chunk)) => {
                let Some(file) = current.as_mut() else {
                    return Err(RemoteDispatchError::Protocol(
                        "chunk received outside a file".to_string(),
                    ));
                };
                file.write_all(&chunk)?;
                received += chunk.len();
            }
            Some(WorkerResponse::End) => break,
            Some(WorkerResponse::Failed { message }) => {
                return Err(RemoteDispatchError::Worker {
                    worker: location.worker.to_string(),
                    message,
                });
            }
            other => return Err(unexpected(other)),
        }
    }
    Ok(received)
}

impl ArtifactFetcher for TcpTransport {
    fn fetch(&self, location: &RemoteLocation, dest: &Path) -> Result<(), RemoteDispatchError> {
        let mut stream = self.connect_blocking(&location.worker)?;
        write_frame_blocking(
            &mut stream,
            &WorkerRequest::Fetch {
                path: location.path.clone(),
            },
        )?;

        let Some(name) = dest.file_name() else {
            return Err(RemoteDispatchError::Protocol(format!(
                "artifact destination {} has no file name",
                dest.display()
            )));
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut partial_name = name.to_os_string();
        partial_name.push(".part");
        let partial = dest.with_file_name(partial_name);
        remove_path(&partial)?;

        let received = match receive_artifact(&mut stream, location, &partial) {
            Ok(received) => received,
            Err(e) => {
                let _ = remove_path(&partial);
                return Err(e);
            }
        };
        if !partial.exists() {
            return Err(RemoteDispatchError::Protocol(
                "artifact stream carried no entries".to_string(),
            ));
        }
        remove_path(dest)?;
        std::fs::rename(&partial, dest)?;
        tracing::debug!(
            worker = %location.worker,
            path = %location.path,
            bytes = received,
            "fetched artifact"
        );
        Ok(())
    }

    fn discard(&self, location: &RemoteLocation) -> Result<(), RemoteDispatchError> {
        let mut stream = self.connect_blocking(&location.worker)?;
        write_frame_blocking(
            &mut stream,
            &WorkerRequest::Discard {
                path: location.path.clone(),
            },
        )?;
        match read_frame_blocking(&mut stream)? {
            Some(WorkerResponse::Done) => Ok(()),
            Some(WorkerResponse::Failed { message }) => Err(RemoteDispatchError::Worker {
                worker: location.worker.to_string(),
                message,
            }),
            other => Err(unexpected(other)),
        }
    }
}
