//! Build worker: applies requested values to a private project copy and builds it.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use walkdir::WalkDir;

use super::RemoteDispatchError;
use super::protocol::{
    BuildRequest, CHUNK_BYTES, WorkerRequest, WorkerResponse, read_frame, write_frame,
};
use crate::adaptor::AppAdaptor;
use crate::mutator::Mutator;
use crate::sequencer::{find_overlap, write_order};
use crate::site::SiteEntry;

/// Worker state shared by all connections.
pub struct BuildWorker {
    mutator: Mutator,
    adaptor: Arc<dyn AppAdaptor>,
    artifact_root: PathBuf,
    build_lock: Mutex<()>,
}

impl std::fmt::Debug for BuildWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildWorker")
            .field("project", &self.mutator.root())
            .field("artifact_root", &self.artifact_root)
            .finish_non_exhaustive()
    }
}

impl BuildWorker {
    /// Worker mutating `mutator`'s tree and serving artifacts stored below `artifact_root`.
    pub fn new(mutator: Mutator, adaptor: Arc<dyn AppAdaptor>, artifact_root: impl Into<PathBuf>) -> Self {
        Self {
            mutator,
            adaptor,
            artifact_root: artifact_root.into(),
            build_lock: Mutex::new(()),
        }
    }

    /// Apply the requested values, build, and restore the tree. Builds are serialized.
    pub fn build(&self, request: &BuildRequest) -> Result<PathBuf, String> {
        let _guard = self.build_lock.lock();
        let mut sequences = Vec::with_capacity(request.mutations.len());
        for (locator, value) in &request.mutations {
            let entry = SiteEntry::supplied(locator.clone(), vec![value.clone()]);
            sequences.push(self.mutator.open(&entry).map_err(|e| e.to_string())?);
        }
        if let Some((first, second)) = find_overlap(&sequences) {
            return Err(format!(
                "{} overlaps {}",
                sequences[second].locator(),
                sequences[first].locator()
            ));
        }
        for i in write_order(&sequences) {
            sequences[i].next_mutation().map_err(|e| e.to_string())?;
        }
        let built = self
            .adaptor
            .build(self.mutator.root(), &request.tag)
            .map_err(|e| e.to_string());
        for seq in sequences {
            seq.close().map_err(|e| e.to_string())?;
        }
        built?;
        Ok(self.adaptor.artifact_path(&request.tag))
    }

    fn contained(&self, path: &str) -> Result<PathBuf, String> {
        let root = self
            .artifact_root
            .canonicalize()
            .map_err(|e| format!("artifact root unavailable: {e}"))?;
        let target = Path::new(path)
            .canonicalize()
            .map_err(|e| format!("{path}: {e}"))?;
        if !target.starts_with(&root) {
            return Err(format!("{path} is outside the artifact directory"));
        }
        Ok(target)
    }
}

async fn handle_build(
    worker: Arc<BuildWorker>,
    stream: &mut TcpStream,
    request: BuildRequest,
) -> Result<(), RemoteDispatchError> {
    write_frame(stream, &WorkerResponse::Accepted).await?;
    let tag = request.tag.clone();
    tracing::info!(tag = %tag, "build accepted");
    let result = tokio::task::spawn_blocking(move || worker.build(&request))
        .await
        .map_err(|e| RemoteDispatchError::Protocol(format!("build task failed: {e}")))?;
    let response = match result {
        Ok(path) => {
            tracing::info!(tag = %tag, path = %path.display(), "build finished");
            WorkerResponse::Built {
                path: path.display().to_string(),
            }
        }
        Err(message) => {
            tracing::warn!(tag = %tag, error = %message, "build failed");
            WorkerResponse::Failed { message }
        }
    };
    write_frame(stream, &response).await
}

/// One entry of an artifact in stream order.
#[derive(Debug)]
struct ArtifactEntry {
    relative: String,
    path: PathBuf,
    is_dir: bool,
}

/// Entries of the artifact at `root`: the file itself, or the directory tree parents first.
fn artifact_entries(root: &Path) -> Result<Vec<ArtifactEntry>, String> {
    if !root.is_dir() {
        return Ok(vec![ArtifactEntry {
            relative: String::new(),
            path: root.to_path_buf(),
            is_dir: false,
        }]);
    }
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| e.to_string())?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| e.to_string())?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        entries.push(ArtifactEntry {
            relative,
            path: entry.path().to_path_buf(),
            is_dir: entry.file_type().is_dir(),
        });
    }
    Ok(entries)
}

async fn handle_fetch(
    worker: &BuildWorker,
    stream: &mut TcpStream,
    path: &str,
) -> Result<(), RemoteDispatchError> {
    let entries = match worker.contained(path) {
        Ok(target) => tokio::task::spawn_blocking(move || artifact_entries(&target))
            .await
            .map_err(|e| e.to_string())
            .and_then(|listed| listed),
        Err(message) => Err(message),
    };
    let entries = match entries {
        Ok(entries) => entries,
        Err(message) => return write_frame(stream, &WorkerResponse::Failed { message }).await,
    };

    for entry in entries {
        if entry.is_dir {
            let relative = entry.relative;
            write_frame(stream, &WorkerResponse::Directory { relative }).await?;
            continue;
        }
        let bytes = match tokio::fs::read(&entry.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let message = format!("{}: {e}", entry.path.display());
                return write_frame(stream, &WorkerResponse::Failed { message }).await;
            }
        };
        let relative = entry.relative;
        write_frame(stream, &WorkerResponse::File { relative }).await?;
        for chunk in bytes.chunks(CHUNK_BYTES) {
            write_frame(stream, &WorkerResponse::Chunk(chunk.to_vec())).await?;
        }
    }
    write_frame(stream, &WorkerResponse::End).await
}

async fn handle_discard(
    worker: &BuildWorker,
    stream: &mut TcpStream,
    path: &str,
) -> Result<(), RemoteDispatchError> {
    let removed = match worker.contained(path) {
        Ok(target) if target.is_dir() => tokio::fs::remove_dir_all(&target)
            .await
            .map_err(|e| e.to_string()),
        Ok(target) => tokio::fs::remove_file(&target)
            .await
            .map_err(|e| e.to_string()),
        Err(message) => Err(message),
    };
    let response = match removed {
        Ok(()) => WorkerResponse::Done,
        Err(message) => WorkerResponse::Failed { message },
    };
    write_frame(stream, &response).await
}

async fn handle_connection(
    worker: Arc<BuildWorker>,
    mut stream: TcpStream,
) -> Result<(), RemoteDispatchError> {
    let Some(request) = read_frame::<_, WorkerRequest>(&mut stream).await? else {
        return Ok(());
    };
    match request {
        WorkerRequest::Build(request) => handle_build(worker, &mut stream, request).await,
        WorkerRequest::Fetch { path } => handle_fetch(&worker, &mut stream, &path).await,
        WorkerRequest::Discard { path } => handle_discard(&worker, &mut stream, &path).await,
    }
}

/// Accept connections until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    worker: Arc<BuildWorker>,
    shutdown: F,
) -> Result<(), RemoteDispatchError>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    tracing::info!(addr = ?listener.local_addr().ok(), "worker listening");
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("worker shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let worker = Arc::clone(&worker);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(worker, stream).await {
                        tracing::warn!(peer = %peer, error = %e, "connection failed");
                    }
                });
            }
        }
    }
}
