//! Remote build workers: wire protocol, client transport and worker server.

pub mod client;
pub mod protocol;
pub mod server;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::WorkerEndpoint;

pub use client::{ArtifactFetcher, BuildTransport, TcpTransport};
pub use protocol::{BuildRequest, WorkerRequest, WorkerResponse};
pub use server::{BuildWorker, serve};

/// Remote dispatch failures.
#[derive(Debug, Error)]
pub enum RemoteDispatchError {
    /// Socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    /// A frame exceeded the size limit.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    /// The peer sent something out of protocol order.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The worker reported a failure.
    #[error("worker {worker}: {message}")]
    Worker {
        /// Reporting worker.
        worker: String,
        /// Error text from the worker.
        message: String,
    },
}

/// Where a remotely built artifact waits to be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLocation {
    /// Worker holding the artifact.
    pub worker: WorkerEndpoint,
    /// Path on the worker.
    pub path: String,
}
