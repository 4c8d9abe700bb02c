// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command-line channel
//!
//! Wraps the `tpm2-tools` utilities the verifier depends on. The tools and
//! the TPM behind them are not safe to drive concurrently, so every
//! invocation holds the context lock for the lifetime of the command.

use std::{
    io::{ErrorKind, Write as _},
    process::{Command, Output},
    sync::{Mutex, PoisonError},
};

use anyhow::{bail, Context, Result};
use regex::Regex;
use tempfile::NamedTempFile;
use tpm_eventlog::{DecodedLog, EventLogDecoder, ToolsVersion};
use tracing::{debug, info, warn};

/// Result of a TPM command execution
#[derive(Debug)]
pub struct TpmOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl TpmOutput {
    fn from_output(output: Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// Serialized access to the tpm2-tools binaries
#[derive(Debug, Default)]
pub struct Tpm2Tools {
    tcti: Option<String>,
    lock: Mutex<()>,
}

impl Tpm2Tools {
    /// Create a channel, optionally pinned to a TCTI string
    pub fn new(tcti: Option<&str>) -> Self {
        Self {
            tcti: tcti.map(str::to_string),
            lock: Mutex::new(()),
        }
    }

    /// Run a tpm2 command while holding the channel lock
    pub fn run_cmd(&self, cmd: &str, args: &[&str]) -> Result<TpmOutput> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut command = Command::new(cmd);
        command.args(args);
        if let Some(tcti) = &self.tcti {
            command.env("TPM2TOOLS_TCTI", tcti);
        }
        debug!("running {cmd} {}", args.join(" "));
        match command.output() {
            Ok(output) => Ok(TpmOutput::from_output(output)),
            Err(err) if err.kind() == ErrorKind::NotFound => bail!("{cmd} not found"),
            Err(err) => Err(err).with_context(|| format!("failed to run {cmd}")),
        }
    }

    /// Establish the output generation of the installed tools
    pub fn detect_tools_version(&self) -> Result<ToolsVersion> {
        let output = self.run_cmd("tpm2_startup", &["--version"])?;
        if !output.success {
            bail!(
                "failed to establish tpm2-tools version using tpm2_startup: {}",
                output.stderr_string()
            );
        }
        let version = parse_tools_version(&output.stdout_string())?;
        info!("tpm2-tools version: {version}");
        Ok(version)
    }
}

/// Extract `version="x.y.z"` from `tpm2_startup --version` output
pub fn parse_tools_version(output: &str) -> Result<ToolsVersion> {
    let re = Regex::new(r#"version="([^"]+)""#).context("invalid version pattern")?;
    let raw = re
        .captures(output)
        .and_then(|caps| caps.get(1))
        .with_context(|| {
            format!("could not determine tpm2-tools version from tpm2_startup output '{output}'")
        })?;
    ToolsVersion::from_version_string(raw.as_str())
}

impl EventLogDecoder for Tpm2Tools {
    /// Decode with `tpm2_eventlog`; the staging file is removed on drop
    fn decode(&self, raw: &[u8]) -> Result<DecodedLog> {
        let mut staged = NamedTempFile::new().context("failed to create event log file")?;
        staged
            .write_all(raw)
            .context("failed to stage event log")?;
        staged.flush().context("failed to stage event log")?;

        let path = staged.path().to_string_lossy().to_string();
        let output = self.run_cmd("tpm2_eventlog", &["--eventlog-version=2", &path])?;
        if !output.success {
            warn!("tpm2_eventlog failed: {}", output.stderr_string());
            bail!("tpm2_eventlog failed: {}", output.stderr_string());
        }

        Ok(DecodedLog {
            yaml: output.stdout_string(),
            diagnostics: output.stderr_string(),
        })
    }
}
