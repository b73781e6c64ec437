use std::{path::PathBuf, process::Stdio, time::Duration};

use {
    serde::{Deserialize, Serialize},
    tokio::{io::AsyncWriteExt, process::Command},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

const TRUNCATED_MARKER: &str = "\n... [output truncated]";

/// Result of a shell command execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("command failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("command cancelled")]
    Cancelled,
}

impl ExecError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Options controlling exec behavior.
#[derive(Debug, Clone)]
pub struct ExecOpts {
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
    pub cancel: Option<CancellationToken>,
}

impl Default for ExecOpts {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_output_bytes: 200 * 1024,
            working_dir: None,
            env: Vec::new(),
            stdin: None,
            cancel: None,
        }
    }
}

impl ExecOpts {
    /// Same deadline, cap and stdin, with the working dir and env dropped.
    /// Used when a command was already prepared with those applied.
    pub fn prepared(&self) -> Self {
        Self {
            working_dir: None,
            env: Vec::new(),
            ..self.clone()
        }
    }
}

/// Lossy-decode `bytes`, keeping at most `max` of them.
pub fn truncate_output(bytes: &[u8], max: usize) -> String {
    if bytes.len() <= max {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut out = String::from_utf8_lossy(&bytes[..max]).into_owned();
    out.push_str(TRUNCATED_MARKER);
    out
}

/// Execute a shell command through `sh -c`.
pub async fn exec_command(command: &str, opts: &ExecOpts) -> Result<ExecResult, ExecError> {
    debug!(
        command,
        timeout_ms = opts.timeout.as_millis() as u64,
        "exec_command"
    );
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    run_command(cmd, opts).await
}

/// Run a prepared command under the deadline and cancellation token in `opts`.
///
/// The child is killed when the deadline passes or the token fires.
pub async fn run_command(mut cmd: Command, opts: &ExecOpts) -> Result<ExecResult, ExecError> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();

    if let Some(ref dir) = opts.working_dir {
        cmd.current_dir(dir);
    }
    for (k, v) in &opts.env {
        cmd.env(k, v);
    }
    let stdin = if opts.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    };
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(stdin)
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
        program: program.clone(),
        source,
    })?;

    if let (Some(input), Some(mut pipe)) = (opts.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = pipe.write_all(input.as_bytes()).await {
                debug!(error = %e, "stdin write failed");
            }
        });
    }

    let cancel = opts.cancel.clone().unwrap_or_default();
    let output = tokio::select! {
        out = child.wait_with_output() => out?,
        () = tokio::time::sleep(opts.timeout) => {
            warn!(program, "exec timeout");
            return Err(ExecError::Timeout(opts.timeout));
        },
        () = cancel.cancelled() => {
            debug!(program, "exec cancelled");
            return Err(ExecError::Cancelled);
        },
    };

    let stdout = truncate_output(&output.stdout, opts.max_output_bytes);
    let stderr = truncate_output(&output.stderr, opts.max_output_bytes);
    let exit_code = output.status.code().unwrap_or(-1);
    debug!(
        exit_code,
        stdout_len = stdout.len(),
        stderr_len = stderr.len(),
        "exec done"
    );

    Ok(ExecResult {
        stdout,
        stderr,
        exit_code,
    })
}
