//! Tool runs and LLM calls: the two exogenous inputs besides documents.
//!
//! Their byte payloads go to the CAS as `aux` blobs; the ledgers only carry
//! digests, so a replay never re-executes anything.

use std::{
  path::Path,
  process::Command,
  time::{Duration, Instant},
};

use fieldpack_core::{
  LedgerEvent,
  document::BlobKind,
  records::{LlmCallRecord, ToolRunRecord},
};
use serde_json::Value;

use crate::{Error, Pipeline, Result};

/// A finished command, ready to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRun {
  pub tool_id:   String,
  pub argv:      Vec<String>,
  pub cwd:       Option<String>,
  pub exit_code: i32,
  pub stdout:    Vec<u8>,
  pub stderr:    Vec<u8>,
  pub duration:  Duration,
}

impl Pipeline {
  pub fn record_tool_run(&self, run: &CompletedRun) -> Result<LedgerEvent<ToolRunRecord>> {
    let stdout = self.cas.put(&run.stdout, BlobKind::Aux, None)?;
    let stderr = self.cas.put(&run.stderr, BlobKind::Aux, None)?;
    let event = self.store.tool_run_ledger().append(ToolRunRecord {
      tool_id:       run.tool_id.clone(),
      argv:          run.argv.clone(),
      cwd:           run.cwd.clone(),
      exit_code:     run.exit_code,
      stdout_sha256: stdout.sha256,
      stderr_sha256: stderr.sha256,
      duration_ms:   u64::try_from(run.duration.as_millis()).unwrap_or(u64::MAX),
      toolchain_id:  self.config.toolchain_id.clone(),
    })?;
    tracing::info!(
      tool = %run.tool_id,
      exit_code = run.exit_code,
      seq = event.seq,
      "recorded tool run"
    );
    Ok(event)
  }

  /// Run the allowlisted program `tool_id` with `args` (no shell) and record
  /// it. A non-zero exit is recorded, not returned as an error.
  pub fn run_tool(
    &self,
    tool_id: &str,
    args: &[String],
    cwd: Option<&Path>,
  ) -> Result<LedgerEvent<ToolRunRecord>> {
    if tool_id.is_empty() {
      return Err(Error::EmptyCommand);
    }
    if !self.allowlist.allows_tool(tool_id) {
      return Err(Error::ToolNotAllowed(tool_id.to_owned()));
    }

    let mut command = Command::new(tool_id);
    command.args(args);
    if let Some(dir) = cwd {
      command.current_dir(dir);
    }
    let started = Instant::now();
    let output = command.output()?;

    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(tool_id.to_owned());
    argv.extend_from_slice(args);
    self.record_tool_run(&CompletedRun {
      tool_id: tool_id.to_owned(),
      argv,
      cwd: cwd.map(|d| d.to_string_lossy().into_owned()),
      // Killed by a signal.
      exit_code: output.status.code().unwrap_or(-1),
      stdout: output.stdout,
      stderr: output.stderr,
      duration: started.elapsed(),
    })
  }

  /// Record a model call whose response has already been obtained.
  pub fn record_llm_call(
    &self,
    provider: &str,
    model: &str,
    prompt: &str,
    response: &str,
    params: Value,
  ) -> Result<LedgerEvent<LlmCallRecord>> {
    let prompt = self.cas.put(prompt.as_bytes(), BlobKind::Aux, None)?;
    let response = self.cas.put(response.as_bytes(), BlobKind::Aux, None)?;
    let event = self.store.llm_call_ledger().append(LlmCallRecord {
      provider: provider.to_owned(),
      model: model.to_owned(),
      prompt_sha256: prompt.sha256,
      response_sha256: response.sha256,
      params,
      toolchain_id: self.config.toolchain_id.clone(),
    })?;
    tracing::info!(%provider, %model, seq = event.seq, "recorded llm call");
    Ok(event)
  }
}
