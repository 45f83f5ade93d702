//! Build dispatch, local or across a pool of remote workers.
//!
//! Local builds run on a blocking thread while the producer waits for them. Remote builds
//! run concurrently, at most one per worker; their results pass through a
//! [`RetirementQueue`] so the artifact channel sees them in submission order.

pub mod retirement;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};

pub use retirement::{RetirementQueue, Ticket};

use crate::adaptor::AppAdaptor;
use crate::config::WorkerEndpoint;
use crate::pipeline::{ArtifactSender, BuiltArtifact, ChannelClosed};
use crate::remote::{BuildRequest, BuildTransport, RemoteLocation, TcpTransport};

/// Dispatch failures. Build failures are not errors here; they travel as artifacts.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The test stage stopped listening.
    #[error(transparent)]
    Closed(#[from] ChannelClosed),
    /// A build task panicked or was cancelled.
    #[error("build task failed: {0}")]
    Task(String),
    /// Remote mode without workers.
    #[error("remote dispatch needs at least one worker")]
    NoWorkers,
}

/// One round to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildJob {
    /// Artifact tag.
    pub tag: String,
    /// Batch locators in site order.
    pub site_paths: Vec<String>,
    /// Batch start index.
    pub batch_index: usize,
    /// Value per site in site order.
    pub mutations: Vec<String>,
}

impl BuildJob {
    fn request(&self) -> BuildRequest {
        BuildRequest {
            tag: self.tag.clone(),
            mutations: self
                .site_paths
                .iter()
                .cloned()
                .zip(self.mutations.iter().cloned())
                .collect(),
        }
    }
}

/// Builds on the producer's side, one at a time.
pub struct LocalDispatcher {
    adaptor: Arc<dyn AppAdaptor>,
    project: PathBuf,
    out: ArtifactSender,
}

/// Builds across a worker pool.
pub struct RemoteDispatcher<T: BuildTransport> {
    transport: Arc<T>,
    idle_tx: mpsc::UnboundedSender<WorkerEndpoint>,
    idle_rx: mpsc::UnboundedReceiver<WorkerEndpoint>,
    lookahead: Arc<Semaphore>,
    retirement: Arc<RetirementQueue<(BuiltArtifact, OwnedSemaphorePermit)>>,
    forwarder: JoinHandle<Result<(), ChannelClosed>>,
    in_flight: JoinSet<()>,
}

/// Build dispatcher selected once per run.
pub enum BuildDispatcher<T: BuildTransport = TcpTransport> {
    /// Build in place.
    Local(LocalDispatcher),
    /// Build on workers.
    Remote(RemoteDispatcher<T>),
}

impl<T: BuildTransport> std::fmt::Debug for BuildDispatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(local) => f
                .debug_struct("Local")
                .field("project", &local.project)
                .finish_non_exhaustive(),
            Self::Remote(remote) => f
                .debug_struct("Remote")
                .field("in_flight", &remote.in_flight.len())
                .field("pending", &remote.retirement.pending())
                .finish_non_exhaustive(),
        }
    }
}

impl<T: BuildTransport> BuildDispatcher<T> {
    /// Local dispatcher building `project` with `adaptor`.
    pub fn local(adaptor: Arc<dyn AppAdaptor>, project: impl Into<PathBuf>, out: ArtifactSender) -> Self {
        Self::Local(LocalDispatcher {
            adaptor,
            project: project.into(),
            out,
        })
    }

    /// Remote dispatcher over `workers`. Must be created inside a tokio runtime.
    pub fn remote(
        transport: T,
        workers: Vec<WorkerEndpoint>,
        out: ArtifactSender,
    ) -> Result<Self, DispatchError> {
        if workers.is_empty() {
            return Err(DispatchError::NoWorkers);
        }
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let pool = workers.len();
        for worker in workers {
            // The receiver is held by this dispatcher, so the send cannot fail.
            let _ = idle_tx.send(worker);
        }
        let (queue, mut retired) = RetirementQueue::new();
        let forwarder = tokio::spawn(async move {
            while let Some((artifact, permit)) = retired.recv().await {
                out.put(artifact).await?;
                drop(permit);
            }
            Ok(())
        });
        tracing::info!(workers = pool, lookahead = 2 * pool, "remote dispatch ready");
        Ok(Self::Remote(RemoteDispatcher {
            transport: Arc::new(transport),
            idle_tx,
            idle_rx,
            lookahead: Arc::new(Semaphore::new(2 * pool)),
            retirement: Arc::new(queue),
            forwarder,
            in_flight: JoinSet::new(),
        }))
    }

    /// Build `job` and deliver the result to the artifact channel.
    ///
    /// Local mode returns after the artifact is enqueued. Remote mode returns once the
    /// build has been issued to a worker.
    pub async fn dispatch(&mut self, job: BuildJob) -> Result<(), DispatchError> {
        match self {
            Self::Local(local) => local.dispatch(job).await,
            Self::Remote(remote) => remote.dispatch(job).await,
        }
    }

    /// Deliver an artifact that never reached a build, behind everything already dispatched.
    pub async fn submit_failure(&mut self, artifact: BuiltArtifact) -> Result<(), DispatchError> {
        match self {
            Self::Local(local) => Ok(local.out.put(artifact).await?),
            Self::Remote(remote) => {
                let permit = Arc::clone(&remote.lookahead)
                    .acquire_owned()
                    .await
                    .map_err(|e| DispatchError::Task(e.to_string()))?;
                let ticket = remote.retirement.reserve();
                remote.retirement.complete(ticket, (artifact, permit));
                Ok(())
            }
        }
    }

    /// Wait for every issued build to be delivered.
    pub async fn finish(self) -> Result<(), DispatchError> {
        match self {
            Self::Local(_) => Ok(()),
            Self::Remote(remote) => remote.finish().await,
        }
    }
}

impl LocalDispatcher {
    async fn dispatch(&mut self, job: BuildJob) -> Result<(), DispatchError> {
        let adaptor = Arc::clone(&self.adaptor);
        let project = self.project.clone();
        let tag = job.tag.clone();
        tracing::info!(tag = %tag, "building locally");
        let built = tokio::task::spawn_blocking(move || adaptor.build(&project, &tag))
            .await
            .map_err(|e| DispatchError::Task(e.to_string()))?;

        let artifact = match built {
            Ok(()) => BuiltArtifact::built(job.site_paths, job.batch_index, job.mutations, job.tag),
            Err(e) => {
                tracing::warn!(tag = %job.tag, error = %e, "local build failed");
                BuiltArtifact::failed(job.site_paths, job.batch_index, job.mutations, e.to_string())
            }
        };
        self.out.put(artifact).await?;
        Ok(())
    }
}

impl<T: BuildTransport> RemoteDispatcher<T> {
    async fn dispatch(&mut self, job: BuildJob) -> Result<(), DispatchError> {
        let permit = Arc::clone(&self.lookahead)
            .acquire_owned()
            .await
            .map_err(|e| DispatchError::Task(e.to_string()))?;
        let worker = self
            .idle_rx
            .recv()
            .await
            .ok_or_else(|| DispatchError::Task("worker pool closed".to_string()))?;
        let ticket = self.retirement.reserve();
        tracing::info!(tag = %job.tag, worker = %worker, seq = ticket.seq(), "dispatching build");

        let transport = Arc::clone(&self.transport);
        let idle_tx = self.idle_tx.clone();
        let retirement = Arc::clone(&self.retirement);
        self.in_flight.spawn(async move {
            let result = transport.build(&worker, job.request()).await;
            // Slot reuse does not wait for retirement.
            let _ = idle_tx.send(worker.clone());
            let artifact = match result {
                Ok(path) => {
                    tracing::info!(tag = %job.tag, worker = %worker, "remote build finished");
                    BuiltArtifact::built_remote(
                        job.site_paths,
                        job.batch_index,
                        job.mutations,
                        job.tag,
                        RemoteLocation { worker, path },
                    )
                }
                Err(e) => {
                    tracing::warn!(tag = %job.tag, worker = %worker, error = %e, "remote build failed");
                    BuiltArtifact::failed(
                        job.site_paths,
                        job.batch_index,
                        job.mutations,
                        format!("remote build on {worker} failed: {e}"),
                    )
                }
            };
            retirement.complete(ticket, (artifact, permit));
        });

        while let Some(joined) = self.in_flight.try_join_next() {
            joined.map_err(|e| DispatchError::Task(e.to_string()))?;
        }
        Ok(())
    }

    async fn finish(mut self) -> Result<(), DispatchError> {
        while let Some(joined) = self.in_flight.join_next().await {
            joined.map_err(|e| DispatchError::Task(e.to_string()))?;
        }
        self.retirement.close();
        self.forwarder
            .await
            .map_err(|e| DispatchError::Task(e.to_string()))??;
        Ok(())
    }
}
