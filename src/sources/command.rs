// src/sources/command.rs
//! External EPG tool invoked as a child process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::config::CommandSourceConfig;
use crate::sources::{GuideSource, SourceError};

/// Replaced in `args` by the adapter's private output path.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const STDERR_TAIL_LINES: usize = 8;

/// Where the tool leaves its XMLTV document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputCapture {
    /// The tool writes to the path substituted for `{output}`.
    Argument,
    /// The tool prints the document on stdout.
    Stdout,
    /// The tool always writes to this fixed path; it is moved into place afterwards.
    File(PathBuf),
}

pub struct CommandSource {
    id: String,
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    current_dir: Option<PathBuf>,
    capture: OutputCapture,
    version_args: Option<Vec<String>>,
    version: OnceCell<Option<String>>,
}

impl CommandSource {
    pub fn new(id: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            current_dir: None,
            capture: OutputCapture::Argument,
            version_args: None,
            version: OnceCell::new(),
        }
    }

    pub fn from_config(id: &str, cfg: &CommandSourceConfig) -> Self {
        let capture = match (&cfg.output_path, cfg.stdout) {
            (Some(p), _) => OutputCapture::File(p.clone()),
            (None, true) => OutputCapture::Stdout,
            (None, false) => OutputCapture::Argument,
        };
        let mut src = Self::new(id, cfg.program.clone())
            .args(cfg.args.clone())
            .capture(capture);
        src.env = cfg.env.clone();
        src.current_dir = cfg.current_dir.clone();
        src.version_args = cfg.version_args.clone();
        src
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn capture(mut self, capture: OutputCapture) -> Self {
        self.capture = capture;
        self
    }

    pub fn version_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.version_args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    fn render_args(&self, output: &Path) -> Vec<String> {
        let out = output.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace(OUTPUT_PLACEHOLDER, &out))
            .collect()
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn probe_version(&self) -> Option<String> {
        let args = self.version_args.as_ref()?;
        let child = self.command(args).spawn().ok()?;
        let out = tokio::time::timeout(VERSION_PROBE_TIMEOUT, child.wait_with_output())
            .await
            .ok()?
            .ok()?;
        // some tools print their version on stderr
        let found = [&out.stdout, &out.stderr]
            .into_iter()
            .flat_map(|b| String::from_utf8_lossy(b).lines().map(str::to_string).collect::<Vec<_>>())
            .map(|l| l.trim().to_string())
            .find(|l| !l.is_empty());
        found
    }
}

#[async_trait]
impl GuideSource for CommandSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn version(&self) -> Option<String> {
        self.version
            .get_or_init(|| self.probe_version())
            .await
            .clone()
    }

    async fn produce(&self, output: &Path) -> Result<(), SourceError> {
        let args = self.render_args(output);
        tracing::debug!(target: "source", source = %self.id, program = %self.program, ?args, "spawning tool");

        let child = self.command(&args).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SourceError::ToolNotFound(self.program.clone())
            } else {
                SourceError::Io(e)
            }
        })?;

        // Dropping this future (timeout, shutdown) kills the child.
        let out = child.wait_with_output().await?;
        if !out.status.success() {
            return Err(SourceError::ToolExitedNonZero {
                code: out.status.code(),
                stderr: tail_lines(&out.stderr, STDERR_TAIL_LINES),
            });
        }

        match &self.capture {
            OutputCapture::Argument => {}
            OutputCapture::Stdout => tokio::fs::write(output, &out.stdout).await?,
            OutputCapture::File(declared) => move_into(declared, output).await?,
        }

        if tokio::fs::metadata(output).await.is_err() {
            return Err(SourceError::OutputUnparsable(format!(
                "tool exited cleanly but left no output at {}",
                output.display()
            )));
        }
        Ok(())
    }
}

async fn move_into(declared: &Path, output: &Path) -> Result<(), SourceError> {
    if tokio::fs::metadata(declared).await.is_err() {
        return Err(SourceError::OutputUnparsable(format!(
            "declared output {} is missing",
            declared.display()
        )));
    }
    // rename fails across filesystems; fall back to copy
    if tokio::fs::rename(declared, output).await.is_err() {
        tokio::fs::copy(declared, output).await?;
        let _ = tokio::fs::remove_file(declared).await;
    }
    Ok(())
}

fn tail_lines(bytes: &[u8], n: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join(" | ")
}
