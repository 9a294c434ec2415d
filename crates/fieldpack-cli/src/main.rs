//! `fieldpack` binary.
//!
//! Every subcommand prints its result as JSON on stdout. The exit code is 0
//! on success, 1 when a bundle is refused or a ledger fails to verify, and 2
//! on errors.
//!
//! # Usage
//!
//! ```
//! fieldpack init-keys
//! fieldpack ingest notes.txt scan.pdf
//! fieldpack seal site-4
//! fieldpack verify .fieldpack/bundles/site-4-0a1b2c3d4e5f.zip
//! fieldpack import bundle.zip --actor alice
//! ```

use std::{
  path::{Path, PathBuf},
  process::ExitCode,
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use fieldpack_core::{
  policy::AcceptanceMode,
  staging::{Decision, StageStatus},
};
use fieldpack_pipeline::{
  FieldpackConfig, Pipeline,
  accept::ImportRequest,
  keys::{generate_key, signer_entry},
};
use serde::Serialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ─── CLI args ────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(author, version, about = "Provenance-first evidence bundles")]
struct Cli {
  /// Path to the configuration file. Missing files are ignored.
  #[arg(short, long, default_value = "fieldpack.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Create the signing key and print its allowlist entry.
  InitKeys,
  /// Ingest files into the CAS and the ingest ledger.
  Ingest {
    #[arg(required = true)]
    paths: Vec<PathBuf>,
  },
  /// Run an allowlisted tool and record the run.
  RunTool {
    tool: String,
    #[arg(last = true)]
    args: Vec<String>,
    #[arg(long)]
    cwd:  Option<PathBuf>,
  },
  /// Seal everything recorded since the last seal into a signed bundle.
  Seal { label: String },
  /// Verify a bundle against the local policy and allowlist.
  Verify { bundle: PathBuf },
  /// Verify, then replay a bundle and compare its state root.
  Replay { bundle: PathBuf },
  /// Verify a bundle and merge or stage it.
  Import {
    bundle: PathBuf,
    /// Override the policy's acceptance mode.
    #[arg(long, value_parser = parse_mode)]
    mode:   Option<AcceptanceMode>,
    #[arg(long, default_value = "")]
    actor:  String,
    #[arg(long, default_value = "")]
    notes:  String,
  },
  /// Approve a staged bundle and merge it.
  Approve {
    id:    Uuid,
    #[arg(long)]
    actor: String,
    #[arg(long, default_value = "")]
    notes: String,
  },
  /// Reject a staged bundle.
  Reject {
    id:    Uuid,
    #[arg(long)]
    actor: String,
    #[arg(long, default_value = "")]
    notes: String,
  },
  /// List staged bundles.
  Staged {
    #[arg(long, value_parser = parse_status)]
    status: Option<StageStatus>,
  },
  /// Re-verify the local ledgers and rebuild the graph from the delta ledger.
  Check,
}

fn parse_mode(s: &str) -> Result<AcceptanceMode, String> {
  AcceptanceMode::parse(s).ok_or_else(|| format!("unknown acceptance mode {s:?}"))
}

fn parse_status(s: &str) -> Result<StageStatus, String> {
  StageStatus::parse(s).ok_or_else(|| format!("unknown staging status {s:?}"))
}

// ─── Entry point ─────────────────────────────────────────────────────────────

fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();
  match run(cli) {
    Ok(true) => ExitCode::SUCCESS,
    Ok(false) => ExitCode::from(1),
    Err(e) => {
      tracing::error!("{e:#}");
      ExitCode::from(2)
    }
  }
}

fn emit<T: Serialize>(value: &T) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string_pretty(value).context("failed to encode output")?);
  Ok(())
}

fn open(config: &FieldpackConfig) -> anyhow::Result<Pipeline> {
  Pipeline::open(config).with_context(|| {
    format!("failed to open runtime at {}", config.runtime_root.display())
  })
}

fn accepted(decision: &Decision) -> bool {
  !matches!(decision, Decision::Refused { .. } | Decision::Invalid { .. } | Decision::Killed { .. })
}

/// Returns whether the command succeeded.
fn run(cli: Cli) -> anyhow::Result<bool> {
  let config = FieldpackConfig::load(Some(&cli.config))
    .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

  match cli.command {
    Command::InitKeys => {
      let path = config.resolved().signing_key_path;
      let key = generate_key(&path)
        .with_context(|| format!("failed to create signing key at {}", path.display()))?;
      emit(&signer_entry(&key))?;
      Ok(true)
    }
    Command::Ingest { paths } => {
      let pipeline = open(&config)?;
      let ingested = paths
        .iter()
        .map(|p| pipeline.ingest(p).with_context(|| format!("failed to ingest {}", p.display())))
        .collect::<anyhow::Result<Vec<_>>>()?;
      emit(&ingested)?;
      Ok(true)
    }
    Command::RunTool { tool, args, cwd } => {
      let pipeline = open(&config)?;
      let event = pipeline
        .run_tool(&tool, &args, cwd.as_deref())
        .with_context(|| format!("failed to run {tool}"))?;
      let ok = event.payload.exit_code == 0;
      emit(&event)?;
      Ok(ok)
    }
    Command::Seal { label } => {
      let pipeline = open(&config)?;
      let outcome = pipeline.seal(&label).with_context(|| format!("failed to seal {label:?}"))?;
      emit(&outcome)?;
      Ok(true)
    }
    Command::Verify { bundle } => {
      let result = open(&config)?.verify_path(&bundle).with_context(|| read_failed(&bundle))?;
      emit(&result)?;
      Ok(result.ok)
    }
    Command::Replay { bundle } => {
      let result = open(&config)?.replay_path(&bundle).with_context(|| read_failed(&bundle))?;
      emit(&result)?;
      Ok(result.ok)
    }
    Command::Import { bundle, mode, actor, notes } => {
      let pipeline = open(&config)?;
      let request = ImportRequest { path: bundle, mode, actor, notes };
      let decision = pipeline
        .import_bundle(&request)
        .with_context(|| format!("failed to import {}", request.path.display()))?;
      emit(&decision)?;
      Ok(accepted(&decision))
    }
    Command::Approve { id, actor, notes } => {
      let decision = open(&config)?
        .review_approve(id, &actor, &notes)
        .with_context(|| format!("failed to approve {id}"))?;
      emit(&decision)?;
      Ok(accepted(&decision))
    }
    Command::Reject { id, actor, notes } => {
      let decision = open(&config)?
        .review_reject(id, &actor, &notes)
        .with_context(|| format!("failed to reject {id}"))?;
      emit(&decision)?;
      Ok(true)
    }
    Command::Staged { status } => {
      let staged = open(&config)?.list_staged(status).context("failed to list staged bundles")?;
      emit(&staged)?;
      Ok(true)
    }
    Command::Check => {
      let report = open(&config)?.replay_local_graph().context("failed to check the runtime")?;
      emit(&report)?;
      Ok(report.ok)
    }
  }
}

fn read_failed(path: &Path) -> String { format!("failed to read {}", path.display()) }
