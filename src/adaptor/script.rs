//! Backend driven by shell commands from the `script` section of `profile.yml`.
//!
//! Every command runs through `sh -c` with these variables set:
//!
//! - `LITPROF_TAG`: artifact tag (`ref` for the reference build)
//! - `LITPROF_ARTIFACT`: local artifact location
//! - `LITPROF_PROJECT`: project tree (build only)
//! - `LITPROF_SUFFIX`: trial suffix (run only)
//! - `LITPROF_DUMMY`: `1` for warm-up trials, `0` otherwise (run only)
//!
//! The run command prints one `name value` pair per line on stdout.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::{AppAdaptor, BuildError, ExecutionError, TrialResult};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The `script` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptConfig {
    /// Build command, run inside the project tree.
    #[serde(default)]
    pub build: Option<String>,
    /// Build output relative to the project tree, copied to the artifact location after a
    /// successful build. When absent the build command writes `$LITPROF_ARTIFACT` itself.
    #[serde(default)]
    pub artifact: Option<String>,
    /// Environment preparation command.
    #[serde(default)]
    pub prepare: Option<String>,
    /// Trial command.
    #[serde(default)]
    pub run: Option<String>,
    /// Cleanup command.
    #[serde(default)]
    pub cleanup: Option<String>,
    /// Environment snapshot command.
    #[serde(default)]
    pub save_state: Option<String>,
    /// Environment restore command.
    #[serde(default)]
    pub restore_state: Option<String>,
    /// Upper bound per command, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Captured result of one shell command.
#[derive(Debug)]
struct CommandOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

/// Shell-command backend.
#[derive(Debug, Clone)]
pub struct ScriptAdaptor {
    config: ScriptConfig,
    work_dir: PathBuf,
    build_dir: PathBuf,
}

impl ScriptAdaptor {
    /// Backend running non-build commands in `work_dir` and keeping artifacts in `build_dir`.
    pub fn new(config: ScriptConfig, work_dir: impl Into<PathBuf>, build_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            work_dir: work_dir.into(),
            build_dir: build_dir.into(),
        }
    }

    /// Directory holding artifacts.
    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    fn shell(
        &self,
        script: &str,
        cwd: &Path,
        envs: &[(&str, String)],
    ) -> Result<CommandOutput, String> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in envs {
            cmd.env(key, value);
        }

        let Some(limit) = self.config.timeout_secs.map(Duration::from_secs) else {
            let out = cmd.output().map_err(|e| format!("cannot spawn `{script}`: {e}"))?;
            return Ok(CommandOutput {
                status: out.status,
                stdout: String::from_utf8_lossy(&out.stdout).to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).to_string(),
            });
        };

        let mut child = cmd.spawn().map_err(|e| format!("cannot spawn `{script}`: {e}"))?;
        let stdout = child.stdout.take().map(drain_in_background);
        let stderr = child.stderr.take().map(drain_in_background);
        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= limit => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!("`{script}` timed out after {}s", limit.as_secs()));
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(format!("cannot wait for `{script}`: {e}")),
            }
        };
        let join = |h: Option<std::thread::JoinHandle<String>>| {
            h.and_then(|h| h.join().ok()).unwrap_or_default()
        };
        Ok(CommandOutput {
            status,
            stdout: join(stdout),
            stderr: join(stderr),
        })
    }

    fn checked(
        &self,
        script: &str,
        cwd: &Path,
        envs: &[(&str, String)],
    ) -> Result<CommandOutput, String> {
        let out = self.shell(script, cwd, envs)?;
        if !out.status.success() {
            return Err(format!(
                "`{script}` exited with {}: {}",
                out.status,
                out.stderr.trim()
            ));
        }
        Ok(out)
    }

    fn hook(&self, script: Option<&String>, tag: &str) -> Result<(), ExecutionError> {
        let Some(script) = script else {
            return Ok(());
        };
        self.checked(script, &self.work_dir, &self.base_env(tag))
            .map(|_| ())
            .map_err(ExecutionError)
    }

    fn base_env(&self, tag: &str) -> Vec<(&'static str, String)> {
        vec![
            ("LITPROF_TAG", tag.to_string()),
            (
                "LITPROF_ARTIFACT",
                self.artifact_path(tag).display().to_string(),
            ),
        ]
    }
}

fn drain_in_background<R: Read + Send + 'static>(mut reader: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).to_string()
    })
}

/// Parse `name value` lines. Lines that do not hold exactly a name and a number are ignored.
pub fn parse_metrics(stdout: &str) -> TrialResult {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            let value: f64 = parts.next()?.parse().ok()?;
            if parts.next().is_some() {
                return None;
            }
            Some((name.to_string(), value))
        })
        .collect()
}

/// Copy a file or a directory tree. Entries below `to` are skipped when `to` lies inside `from`.
pub(crate) fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    if from.is_dir() {
        let walker = walkdir::WalkDir::new(from)
            .into_iter()
            .filter_entry(|entry| !entry.path().starts_with(to));
        for entry in walker {
            let entry = entry.map_err(std::io::Error::other)?;
            let rel = entry
                .path()
                .strip_prefix(from)
                .map_err(std::io::Error::other)?;
            let dest = to.join(rel);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&dest)?;
            } else {
                std::fs::copy(entry.path(), &dest)?;
            }
        }
        Ok(())
    } else {
        std::fs::copy(from, to).map(|_| ())
    }
}

impl AppAdaptor for ScriptAdaptor {
    fn build(&self, project: &Path, tag: &str) -> Result<(), BuildError> {
        let Some(script) = &self.config.build else {
            return Err(BuildError("no build command configured".to_string()));
        };
        std::fs::create_dir_all(&self.build_dir).map_err(|e| BuildError(e.to_string()))?;
        let mut envs = self.base_env(tag);
        envs.push(("LITPROF_PROJECT", project.display().to_string()));
        self.checked(script, project, &envs).map_err(BuildError)?;

        if let Some(artifact) = &self.config.artifact {
            let dest = self.artifact_path(tag);
            copy_tree(&project.join(artifact), &dest)
                .map_err(|e| BuildError(format!("cannot collect {artifact}: {e}")))?;
        }
        tracing::debug!(tag, "script build finished");
        Ok(())
    }

    fn prepare(&self, tag: &str) -> Result<(), ExecutionError> {
        self.hook(self.config.prepare.as_ref(), tag)
    }

    fn run(&self, tag: &str, suffix: &str, dummy: bool) -> Result<TrialResult, ExecutionError> {
        let Some(script) = &self.config.run else {
            return Err(ExecutionError("no run command configured".to_string()));
        };
        let mut envs = self.base_env(tag);
        envs.push(("LITPROF_SUFFIX", suffix.to_string()));
        envs.push(("LITPROF_DUMMY", if dummy { "1" } else { "0" }.to_string()));
        let out = self
            .checked(script, &self.work_dir, &envs)
            .map_err(ExecutionError)?;
        let metrics = parse_metrics(&out.stdout);
        if metrics.is_empty() {
            return Err(ExecutionError(format!("`{script}` reported no metrics")));
        }
        Ok(metrics)
    }

    fn cleanup(&self, tag: &str) -> Result<(), ExecutionError> {
        self.hook(self.config.cleanup.as_ref(), tag)
    }

    fn save_state(&self, tag: &str) -> Result<(), ExecutionError> {
        self.hook(self.config.save_state.as_ref(), tag)
    }

    fn restore_state(&self, tag: &str) -> Result<(), ExecutionError> {
        self.hook(self.config.restore_state.as_ref(), tag)
    }

    fn artifact_path(&self, tag: &str) -> PathBuf {
        self.build_dir.join(tag)
    }
}
