use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use litprof::adaptor::{AppAdaptor, BuildError, ExecutionError, TrialResult};
use litprof::checkpoint::MemoryCheckpoint;
use litprof::config::{ProfileConfig, ProfileDocument, WorkerEndpoint};
use litprof::driver::{ProfileRun, RunOutcome};
use litprof::mutator::{LiteralKind, Mutator};
use litprof::remote::{
    ArtifactFetcher, BuildRequest, BuildTransport, BuildWorker, RemoteDispatchError,
    RemoteLocation, TcpTransport, serve,
};
use litprof::results::{MutResult, Status, read_records};

/// "Builds" by copying `Conf.java` into `out/<tag>`; a trial reports the artifact it finds.
struct CopyAdaptor {
    out: PathBuf,
    seen: Mutex<Vec<String>>,
}

impl CopyAdaptor {
    fn new(out: &Path) -> Self {
        std::fs::create_dir_all(out).expect("artifact dir should be created");
        Self {
            out: out.to_path_buf(),
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl AppAdaptor for CopyAdaptor {
    fn build(&self, project: &Path, tag: &str) -> Result<(), BuildError> {
        let source = std::fs::read_to_string(project.join("Conf.java"))
            .map_err(|e| BuildError(e.to_string()))?;
        if source.contains("= 0;") {
            return Err(BuildError("zero timeout".to_string()));
        }
        std::fs::write(self.artifact_path(tag), source).map_err(|e| BuildError(e.to_string()))
    }

    fn prepare(&self, _tag: &str) -> Result<(), ExecutionError> {
        Ok(())
    }

    fn run(&self, tag: &str, _suffix: &str, _dummy: bool) -> Result<TrialResult, ExecutionError> {
        let artifact = std::fs::read_to_string(self.artifact_path(tag))?;
        self.seen.lock().push(format!("{tag}: {artifact}"));
        Ok(TrialResult::from([("bytes".to_string(), artifact.len() as f64)]))
    }

    fn artifact_path(&self, tag: &str) -> PathBuf {
        self.out.join(tag)
    }
}

/// Builds a directory artifact: `out/<tag>/bin/conf`, `out/<tag>/logs/` and `out/<tag>/VERSION`.
struct TreeAdaptor {
    out: PathBuf,
}

impl AppAdaptor for TreeAdaptor {
    fn build(&self, project: &Path, tag: &str) -> Result<(), BuildError> {
        let io = |e: std::io::Error| BuildError(e.to_string());
        let root = self.artifact_path(tag);
        std::fs::create_dir_all(root.join("bin")).map_err(io)?;
        std::fs::create_dir_all(root.join("logs")).map_err(io)?;
        std::fs::copy(project.join("Conf.java"), root.join("bin").join("conf")).map_err(io)?;
        std::fs::write(root.join("VERSION"), tag).map_err(io)
    }

    fn prepare(&self, _tag: &str) -> Result<(), ExecutionError> {
        Ok(())
    }

    fn run(&self, _tag: &str, _suffix: &str, _dummy: bool) -> Result<TrialResult, ExecutionError> {
        Ok(TrialResult::new())
    }

    fn artifact_path(&self, tag: &str) -> PathBuf {
        self.out.join(tag)
    }
}

fn project(dir: &Path) {
    std::fs::create_dir_all(dir).expect("project dir should be created");
    std::fs::write(dir.join("Conf.java"), "timeout = 1;").expect("source should be written");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_builds_fetches_and_discards() {
    let tmp = tempdir().expect("tempdir should be created");
    let worker_project = tmp.path().join("worker-project");
    project(&worker_project);
    let worker_out = tmp.path().join("worker-out");
    let worker = Arc::new(BuildWorker::new(
        Mutator::new(&worker_project, LiteralKind::Numeric),
        Arc::new(CopyAdaptor::new(&worker_out)),
        &worker_out,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind should succeed");
    let port = listener.local_addr().expect("local addr").port();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(serve(listener, worker, async {
        let _ = stop_rx.await;
    }));

    let endpoint = WorkerEndpoint::new("127.0.0.1", port);
    let transport = TcpTransport::default();
    let path = transport
        .build(
            &endpoint,
            BuildRequest {
                tag: "0_8".to_string(),
                mutations: vec![("Conf.java@10..11".to_string(), "8".to_string())],
            },
        )
        .await
        .expect("remote build should succeed");

    let failed = transport
        .build(
            &endpoint,
            BuildRequest {
                tag: "0_0".to_string(),
                mutations: vec![("Conf.java@10..11".to_string(), "0".to_string())],
            },
        )
        .await
        .expect_err("zero should not build");
    assert!(matches!(failed, RemoteDispatchError::Worker { message, .. } if message.contains("zero")));

    let location = RemoteLocation {
        worker: endpoint.clone(),
        path: path.clone(),
    };
    let local = tmp.path().join("local").join("0_8");
    let fetched = tokio::task::spawn_blocking({
        let local = local.clone();
        move || {
            transport.fetch(&location, &local)?;
            transport.discard(&location)
        }
    })
    .await
    .expect("fetch task should join");
    fetched.expect("fetch and discard should succeed");

    assert_eq!(std::fs::read_to_string(&local).expect("fetched artifact"), "timeout = 8;");
    assert!(!Path::new(&path).exists());
    assert_eq!(
        std::fs::read_to_string(worker_project.join("Conf.java")).expect("source"),
        "timeout = 1;"
    );

    let _ = stop_tx.send(());
    server
        .await
        .expect("server task should join")
        .expect("server should stop cleanly");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn directory_artifacts_are_fetched_whole() {
    let tmp = tempdir().expect("tempdir should be created");
    let worker_project = tmp.path().join("worker-project");
    project(&worker_project);
    let worker_out = tmp.path().join("worker-out");
    std::fs::create_dir_all(&worker_out).expect("artifact dir should be created");
    let worker = Arc::new(BuildWorker::new(
        Mutator::new(&worker_project, LiteralKind::Numeric),
        Arc::new(TreeAdaptor {
            out: worker_out.clone(),
        }),
        &worker_out,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind should succeed");
    let port = listener.local_addr().expect("local addr").port();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(serve(listener, worker, async {
        let _ = stop_rx.await;
    }));

    let endpoint = WorkerEndpoint::new("127.0.0.1", port);
    let transport = TcpTransport::default();
    let path = transport
        .build(
            &endpoint,
            BuildRequest {
                tag: "0_8".to_string(),
                mutations: vec![("Conf.java@10..11".to_string(), "8".to_string())],
            },
        )
        .await
        .expect("remote build should succeed");

    let local = tmp.path().join("local").join("0_8");
    std::fs::create_dir_all(local.parent().expect("parent")).expect("local dir");
    std::fs::write(&local, "stale").expect("stale artifact");
    let location = RemoteLocation {
        worker: endpoint,
        path: path.clone(),
    };
    tokio::task::spawn_blocking({
        let local = local.clone();
        move || {
            transport.fetch(&location, &local)?;
            transport.discard(&location)
        }
    })
    .await
    .expect("fetch task should join")
    .expect("fetch and discard should succeed");

    assert_eq!(
        std::fs::read_to_string(local.join("bin").join("conf")).expect("fetched file"),
        "timeout = 8;"
    );
    assert_eq!(std::fs::read_to_string(local.join("VERSION")).expect("version"), "0_8");
    assert!(local.join("logs").is_dir());
    assert!(!Path::new(&path).exists());

    let _ = stop_tx.send(());
    server
        .await
        .expect("server task should join")
        .expect("server should stop cleanly");
}

#[test]
fn remote_profile_run_measures_fetched_artifacts() {
    let tmp = tempdir().expect("tempdir should be created");
    let local_project = tmp.path().join("project");
    project(&local_project);
    let worker_project = tmp.path().join("worker-project");
    project(&worker_project);
    let worker_out = tmp.path().join("worker-out");
    let run_dir = tmp.path().join("run");
    std::fs::create_dir_all(&run_dir).expect("run dir should be created");
    std::fs::write(run_dir.join("literal-sites.txt"), "Conf.java@10..11\n").expect("site list");

    let (port_tx, port_rx) = std::sync::mpsc::channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let worker_thread = std::thread::spawn({
        let worker_out = worker_out.clone();
        move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .expect("worker runtime should build");
            runtime.block_on(async move {
                let worker = Arc::new(BuildWorker::new(
                    Mutator::new(&worker_project, LiteralKind::Numeric),
                    Arc::new(CopyAdaptor::new(&worker_out)),
                    &worker_out,
                ));
                let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind should succeed");
                port_tx
                    .send(listener.local_addr().expect("local addr").port())
                    .expect("port should be reported");
                serve(listener, worker, async {
                    let _ = stop_rx.await;
                })
                .await
            })
        }
    });
    let port = port_rx.recv().expect("worker should report its port");

    let mut doc = ProfileDocument::new(
        ProfileConfig::default()
            .with_project(&local_project)
            .with_run_dir(&run_dir)
            .with_repeat(1)
            .with_remote(true),
    );
    doc.workers = vec![WorkerEndpoint::new("127.0.0.1", port)];
    let local = Arc::new(CopyAdaptor::new(&run_dir.join("build")));
    let checkpoint = MemoryCheckpoint::default();

    let outcome = ProfileRun::new(doc, Arc::clone(&local) as Arc<dyn AppAdaptor>)
        .with_checkpoint(Arc::new(checkpoint.clone()))
        .run()
        .expect("remote run should complete");
    assert_eq!(outcome, RunOutcome::Completed { batches: 1, artifacts: 2 });

    let records: Vec<MutResult> = read_records(&run_dir.join("mut-results.jsonl"))
        .expect("mut results")
        .records;
    let entries: Vec<(Vec<String>, Status)> = records[0]
        .mutations
        .iter()
        .map(|m| (m.mutation.clone(), m.status))
        .collect();
    assert_eq!(
        entries,
        vec![
            (vec!["8".to_string()], Status::Finish),
            (vec!["0".to_string()], Status::AbortCompile),
        ]
    );
    assert!(local.seen.lock().contains(&"0_8: timeout = 8;".to_string()));
    assert!(!run_dir.join("build").join("0_8").exists());
    assert!(!worker_out.join("0_8").exists());
    assert_eq!(checkpoint.history(), vec![1]);

    let _ = stop_tx.send(());
    worker_thread
        .join()
        .expect("worker thread should join")
        .expect("worker should stop cleanly");
}
