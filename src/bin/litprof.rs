use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};

use litprof::adaptor::{AppAdaptor, ScriptAdaptor};
use litprof::checkpoint::{CheckpointStore, FileCheckpoint};
use litprof::config::{PROFILE_FILE, ProfileConfig, ProfileDocument};
use litprof::driver::{
    ProfileError, RunOutcome, install_interrupt_handler, load_site_list, run_profile, serve_worker,
};
use litprof::logging::{LoggingConfig, init_logging};
use litprof::mutator::LiteralKind;
use litprof::report::{ProfileReport, ReportFormat, render_report};

#[derive(Debug, Parser)]
#[command(name = "litprof")]
#[command(about = "Profile an application by building and measuring alternate literal values")]
struct Cli {
    /// Run directory holding profile.yml, the site list and results.
    #[arg(long, global = true, default_value = ".")]
    dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a default profile.yml into the run directory.
    Init {
        /// Application source tree.
        #[arg(long)]
        project: PathBuf,
        /// Kind of literal the site list refers to.
        #[arg(long, value_enum, default_value = "numeric")]
        kind: Kind,
        /// Overwrite an existing profile.yml.
        #[arg(long)]
        force: bool,
    },
    /// Run, or resume, the profile of the run directory.
    Run,
    /// Serve remote builds.
    Worker {
        /// TCP port to listen on.
        #[arg(long)]
        port: u16,
    },
    /// Show progress of the run directory.
    Status,
    /// Render the recorded results.
    Report {
        /// Output format.
        #[arg(long, value_enum, default_value = "md")]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    /// Integer and floating-point literals
    Numeric,
    /// true / false
    Boolean,
    /// Qualified enum constants
    Enum,
}

impl From<Kind> for LiteralKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Numeric => LiteralKind::Numeric,
            Kind::Boolean => LiteralKind::Boolean,
            Kind::Enum => LiteralKind::Enum,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Markdown
    Md,
    /// JSON
    Json,
}

fn script_adaptor(doc: &ProfileDocument) -> Arc<dyn AppAdaptor> {
    Arc::new(ScriptAdaptor::new(
        doc.script.clone(),
        doc.general.run_dir.clone(),
        doc.general.build_dir(),
    ))
}

fn load(dir: &Path) -> Result<ProfileDocument> {
    let doc = ProfileDocument::load(dir)
        .with_context(|| format!("cannot load {}", dir.join(PROFILE_FILE).display()))?;
    init_logging(&doc.logging)?;
    Ok(doc)
}

fn exit_on_profile_error(result: Result<RunOutcome, ProfileError>) -> Result<()> {
    match result {
        Ok(RunOutcome::Completed { batches, artifacts }) => {
            println!("completed: batches={batches}, artifacts={artifacts}");
            Ok(())
        }
        Ok(RunOutcome::Interrupted) => {
            println!("interrupted: rerun `litprof run` to resume from the checkpoint");
            Ok(())
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let dir = cli.dir;

    match cli.command {
        Command::Init {
            project,
            kind,
            force,
        } => {
            let target = dir.join(PROFILE_FILE);
            if target.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", target.display());
            }
            std::fs::create_dir_all(&dir)?;
            let general = ProfileConfig::default()
                .with_project(project)
                .with_run_dir(&dir)
                .with_literal_kind(kind.into());
            let path = ProfileDocument::new(general).save()?;
            println!("wrote {}", path.display());
        }
        Command::Run => {
            let doc = load(&dir)?;
            let interrupt = Arc::new(AtomicBool::new(false));
            install_interrupt_handler(Arc::clone(&interrupt))?;
            let adaptor = script_adaptor(&doc);
            exit_on_profile_error(run_profile(doc, adaptor, interrupt))?;
        }
        Command::Worker { port } => {
            let doc = load(&dir)?;
            let interrupt = Arc::new(AtomicBool::new(false));
            install_interrupt_handler(Arc::clone(&interrupt))?;
            let adaptor = script_adaptor(&doc);
            let artifact_root = doc.general.build_dir();
            println!("worker listening on port {port}");
            serve_worker(&doc, adaptor, artifact_root, port, interrupt)?;
        }
        Command::Status => {
            init_logging(&LoggingConfig::default())?;
            let doc = ProfileDocument::load(&dir)?;
            let general = &doc.general;
            let checkpoint = FileCheckpoint::new(general.checkpoint_path()).load()?;
            let report = ProfileReport::load(&general.ref_results_path(), &general.mut_results_path())?;
            match load_site_list(general) {
                Ok(sites) => println!("sites: {}", sites.len()),
                Err(e) => println!("sites: unavailable ({e})"),
            }
            println!("checkpoint: {checkpoint}");
            println!(
                "summary: batches={}, finished={}, abort_compile={}, abort_exec={}",
                report.summary.batches,
                report.summary.finished,
                report.summary.abort_compile,
                report.summary.abort_exec
            );
        }
        Command::Report { format } => {
            let doc = ProfileDocument::load(&dir)?;
            let general = &doc.general;
            let format = match format {
                OutputFormat::Md => ReportFormat::Markdown,
                OutputFormat::Json => ReportFormat::Json,
            };
            let report = ProfileReport::load(&general.ref_results_path(), &general.mut_results_path())?;
            println!("{}", render_report(&report, format)?);
        }
    }

    Ok(())
}
