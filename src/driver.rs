//! Wiring of a whole profiling run.
//!
//! [`ProfileRun`] prepares the project tree, builds the reference, then runs the producer on
//! the tokio runtime and the consumer on a blocking thread, connected by the artifact channel.
//! Exit statuses of the binary come from [`ProfileError::exit_code`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::adaptor::script::copy_tree;
use crate::adaptor::{AppAdaptor, BuildError, ExecutionError};
use crate::checkpoint::{CheckpointError, CheckpointStore, FileCheckpoint};
use crate::config::{ConfigError, ProfileConfig, ProfileDocument};
use crate::dispatch::{BuildDispatcher, DispatchError};
use crate::mutator::{EnumTable, LiteralKind, Mutator};
use crate::pipeline::{ChannelClosed, ProducerOutcome, ProjectBuilder, artifact_channel};
use crate::remote::{
    ArtifactFetcher, BuildTransport, BuildWorker, RemoteDispatchError, TcpTransport, serve,
};
use crate::results::{MutResult, RefResult, ResultStream, ResultStreamError};
use crate::site::{SiteEntry, SiteError, load_sites, load_supplied_mutations};
use crate::tester::{ConsumerOutcome, REFERENCE_TAG, StabilityTestRunner, TestError, TestPlan};

/// Run-level errors.
#[derive(Debug, Error)]
pub enum ProfileError {
    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Site list could not be read.
    #[error("site list error: {0}")]
    Site(#[from] SiteError),
    /// File-system failure while preparing the run.
    #[error("io error on {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The unmodified project does not build.
    #[error("reference build failed: {0}")]
    ReferenceBuild(#[source] BuildError),
    /// The unmodified build could not be measured.
    #[error("reference execution failed: {0}")]
    ReferenceExecution(#[source] ExecutionError),
    /// Producer-side failure.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    /// Results could not be written.
    #[error(transparent)]
    Results(#[from] ResultStreamError),
    /// The checkpoint could not be read or written.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    /// Worker socket failure.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteDispatchError),
    /// A pipeline task panicked or could not start.
    #[error("task failed: {0}")]
    Task(String),
    /// Signal handler error.
    #[error("signal handler installation failed: {0}")]
    Signal(String),
}

impl From<TestError> for ProfileError {
    fn from(e: TestError) -> Self {
        match e {
            TestError::ReferenceExecution(e) => Self::ReferenceExecution(e),
            TestError::Results(e) => Self::Results(e),
            TestError::Checkpoint(e) => Self::Checkpoint(e),
        }
    }
}

impl ProfileError {
    /// Process exit status: `1` when the reference could not be measured, `2` when it could
    /// not be built, `3` for every other failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ReferenceExecution(_) => 1,
            Self::ReferenceBuild(_) => 2,
            _ => 3,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every batch was measured and recorded.
    Completed {
        /// Batch records written by this run.
        batches: usize,
        /// Artifacts produced by this run, failures included.
        artifacts: usize,
    },
    /// Stopped early; resuming continues at the checkpoint.
    Interrupted,
}

fn interrupt_flags() -> &'static Mutex<Vec<Arc<AtomicBool>>> {
    static FLAGS: OnceLock<Mutex<Vec<Arc<AtomicBool>>>> = OnceLock::new();
    FLAGS.get_or_init(|| Mutex::new(Vec::new()))
}

/// Route Ctrl-C to `flag`. The process-wide handler is installed on first use.
pub fn install_interrupt_handler(flag: Arc<AtomicBool>) -> Result<(), ProfileError> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();

    interrupt_flags().lock().push(flag);
    let result = INIT.get_or_init(|| {
        ctrlc::set_handler(|| {
            tracing::warn!("interrupt received, stopping after the current artifact");
            for flag in interrupt_flags().lock().iter() {
                flag.store(true, Ordering::SeqCst);
            }
        })
        .map_err(|e| e.to_string())
    });

    match result {
        Ok(()) => Ok(()),
        Err(msg) => Err(ProfileError::Signal(msg.clone())),
    }
}

/// Directory the pipeline mutates: a fresh private copy of the project when `copy_project` is
/// set, the project itself otherwise.
pub fn prepare_project(general: &ProfileConfig) -> Result<PathBuf, ProfileError> {
    if !general.copy_project {
        return Ok(general.project.clone());
    }
    let workspace = general.workspace_dir();
    let io = |source| ProfileError::Io {
        path: workspace.clone(),
        source,
    };
    if workspace.exists() {
        std::fs::remove_dir_all(&workspace).map_err(io)?;
    }
    std::fs::create_dir_all(&workspace).map_err(io)?;
    copy_tree(&general.project, &workspace).map_err(io)?;
    tracing::info!(from = %general.project.display(), to = %workspace.display(), "project copied");
    Ok(workspace)
}

/// Site list of the run, with or without supplied values.
pub fn load_site_list(general: &ProfileConfig) -> Result<Vec<SiteEntry>, ProfileError> {
    let sites = if general.supply_mutations {
        load_supplied_mutations(&general.supplied_mutations_path())?
    } else {
        load_sites(&general.sites_path())?
    };
    Ok(sites)
}

/// Mutator over `root`, with the enum table resolved against the run directory.
pub fn build_mutator(general: &ProfileConfig, root: &Path) -> Result<Mutator, ProfileError> {
    let mutator = Mutator::new(root, general.literal_kind);
    let Some(table) = &general.enum_definitions else {
        if general.literal_kind == LiteralKind::Enum {
            tracing::warn!("no enum definitions configured, enum sites have no candidates");
        }
        return Ok(mutator);
    };
    let path = if table.is_relative() {
        general.run_dir.join(table)
    } else {
        table.clone()
    };
    let enums = EnumTable::load(&path).map_err(|source| ProfileError::Io { path, source })?;
    Ok(mutator.with_enum_table(enums))
}

/// One profiling run over a loaded [`ProfileDocument`].
pub struct ProfileRun {
    doc: ProfileDocument,
    adaptor: Arc<dyn AppAdaptor>,
    checkpoint: Arc<dyn CheckpointStore>,
    interrupted: Arc<AtomicBool>,
}

impl std::fmt::Debug for ProfileRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileRun")
            .field("run_dir", &self.doc.general.run_dir)
            .field("project", &self.doc.general.project)
            .finish_non_exhaustive()
    }
}

impl ProfileRun {
    /// Run checkpointing to the run directory's checkpoint file.
    pub fn new(doc: ProfileDocument, adaptor: Arc<dyn AppAdaptor>) -> Self {
        let checkpoint = Arc::new(FileCheckpoint::new(doc.general.checkpoint_path()));
        Self {
            doc,
            adaptor,
            checkpoint,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use another checkpoint store.
    pub fn with_checkpoint(mut self, checkpoint: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Stop both stages once `flag` is set.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = flag;
        self
    }

    /// Run to completion over TCP workers (remote mode) or locally.
    pub fn run(self) -> Result<RunOutcome, ProfileError> {
        self.run_with(TcpTransport::default())
    }

    /// Run with `transport` for remote builds and artifact transfer.
    pub fn run_with<T>(self, transport: T) -> Result<RunOutcome, ProfileError>
    where
        T: BuildTransport + ArtifactFetcher + Clone,
    {
        self.doc.validate()?;
        let general = self.doc.general.clone();
        let root = prepare_project(&general)?;
        let sites = load_site_list(&general)?;
        let mutator = build_mutator(&general, &root)?;
        tracing::info!(sites = sites.len(), remote = general.enable_remote, "profile run starting");

        self.adaptor
            .build(&root, REFERENCE_TAG)
            .map_err(|e| {
                tracing::error!(error = %e, "reference build failed");
                ProfileError::ReferenceBuild(e)
            })?;

        let start = self.checkpoint.load()?;
        if start > 0 {
            tracing::info!(start, "resuming from checkpoint");
        }
        let ref_stream = ResultStream::<RefResult>::open(general.ref_results_path(), start)?;
        let mut_stream = ResultStream::<MutResult>::open(general.mut_results_path(), start)?;

        let mut runner = StabilityTestRunner::new(
            TestPlan::from(&general),
            Arc::clone(&self.adaptor),
            Arc::clone(&self.checkpoint),
            ref_stream,
            mut_stream,
            start,
        )
        .with_interrupt(Arc::clone(&self.interrupted));
        if general.enable_remote {
            runner = runner.with_fetcher(Arc::new(transport.clone()));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| ProfileError::Task(e.to_string()))?;

        let (tx, mut rx) = artifact_channel(general.channel_capacity);
        let outcome = runtime.block_on(async {
            let dispatcher = if general.enable_remote {
                BuildDispatcher::remote(transport, self.doc.workers.clone(), tx.clone())?
            } else {
                BuildDispatcher::local(Arc::clone(&self.adaptor), root.clone(), tx.clone())
            };
            let producer = ProjectBuilder::new(mutator, sites, general.batch_size, dispatcher, tx)
                .with_start(start)
                .with_interrupt(Arc::clone(&self.interrupted));
            let producer = tokio::spawn(producer.run());
            let consumer = tokio::task::spawn_blocking(move || runner.run(&mut rx));

            let consumed = consumer
                .await
                .map_err(|e| ProfileError::Task(format!("consumer: {e}")))?;
            let produced = producer
                .await
                .map_err(|e| ProfileError::Task(format!("producer: {e}")))?;
            join_stages(produced, consumed)
        })?;

        if let RunOutcome::Completed { .. } = outcome {
            if let Err(e) = self.adaptor.delete(REFERENCE_TAG) {
                tracing::warn!(error = %e, "reference artifact not deleted");
            }
        }
        tracing::info!(?outcome, "profile run finished");
        Ok(outcome)
    }
}

/// Combine stage results. A consumer error wins; a producer that lost its channel because
/// the consumer stopped is not an error of its own.
fn join_stages(
    produced: Result<ProducerOutcome, DispatchError>,
    consumed: Result<ConsumerOutcome, TestError>,
) -> Result<RunOutcome, ProfileError> {
    let consumed = consumed?;
    match (produced, consumed) {
        (Ok(ProducerOutcome::Completed { artifacts }), ConsumerOutcome::Completed { batches }) => {
            Ok(RunOutcome::Completed { batches, artifacts })
        }
        (Err(DispatchError::Closed(ChannelClosed)), ConsumerOutcome::Interrupted)
        | (Ok(_), ConsumerOutcome::Interrupted)
        | (Ok(ProducerOutcome::Interrupted), _) => Ok(RunOutcome::Interrupted),
        (Err(e), _) => Err(e.into()),
    }
}

/// Run `doc` with `adaptor` until every batch is recorded or `interrupt` is set.
pub fn run_profile(
    doc: ProfileDocument,
    adaptor: Arc<dyn AppAdaptor>,
    interrupt: Arc<AtomicBool>,
) -> Result<RunOutcome, ProfileError> {
    ProfileRun::new(doc, adaptor).with_interrupt(interrupt).run()
}

/// Serve remote builds on `port` until `interrupt` is set.
///
/// The worker mutates its own copy of the project and keeps artifacts where `adaptor` puts
/// them, below `artifact_root`.
pub fn serve_worker(
    doc: &ProfileDocument,
    adaptor: Arc<dyn AppAdaptor>,
    artifact_root: PathBuf,
    port: u16,
    interrupt: Arc<AtomicBool>,
) -> Result<(), ProfileError> {
    let root = prepare_project(&doc.general)?;
    let mutator = build_mutator(&doc.general, &root)?;
    std::fs::create_dir_all(&artifact_root).map_err(|source| ProfileError::Io {
        path: artifact_root.clone(),
        source,
    })?;
    let worker = Arc::new(BuildWorker::new(mutator, adaptor, artifact_root));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| ProfileError::Task(e.to_string()))?;
    runtime.block_on(async move {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(RemoteDispatchError::from)?;
        let shutdown = async move {
            while !interrupt.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        };
        serve(listener, worker, shutdown).await?;
        Ok::<(), ProfileError>(())
    })
}
