//! Subprocess Adapter (spec §4.4). Invokes the external code-generation
//! CLI with a single task prompt, streaming its output to our own stdout
//! (and, if configured, a per-item task log) while capturing it for later
//! inclusion in the published change-set body.

use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

/// Size-limited inclusion in the change-set description (spec §4.4).
pub const CAPTURED_OUTPUT_HEAD_BYTES: usize = 3000;

pub struct SubprocessOutcome {
    pub success: bool,
    pub captured_stdout: String,
}

pub struct SubprocessAdapter {
    binary: String,
}

impl SubprocessAdapter {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    pub async fn run(
        &self,
        prompt: &str,
        cwd: &Path,
        task_log: Option<&Path>,
    ) -> Result<SubprocessOutcome, std::io::Error> {
        let mut log_file = match task_log {
            Some(path) => Some(open_log_file(path).await?),
            None => None,
        };

        if let Some(f) = log_file.as_mut() {
            write_header(f, prompt).await?;
        }

        let mut child = Command::new(&self.binary)
            .current_dir(cwd)
            .arg(prompt)
            .env("TERM", "dumb")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let mut captured = String::new();
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        loop {
            tokio::select! {
                line = stdout_lines.next_line() => {
                    match line? {
                        Some(line) => {
                            println!("{line}");
                            captured.push_str(&line);
                            captured.push('\n');
                            if let Some(f) = log_file.as_mut() {
                                f.write_all(line.as_bytes()).await?;
                                f.write_all(b"\n").await?;
                            }
                        }
                        None => break,
                    }
                }
                line = stderr_lines.next_line() => {
                    if let Some(line) = line? {
                        eprintln!("[stderr] {line}");
                        if let Some(f) = log_file.as_mut() {
                            f.write_all(format!("[stderr] {line}\n").as_bytes()).await?;
                        }
                    }
                }
            }
        }

        // Drain any remaining stderr after stdout closes.
        while let Some(line) = stderr_lines.next_line().await? {
            eprintln!("[stderr] {line}");
            if let Some(f) = log_file.as_mut() {
                f.write_all(format!("[stderr] {line}\n").as_bytes()).await?;
            }
        }

        let status = child.wait().await?;
        let success = status.success();

        if let Some(f) = log_file.as_mut() {
            write_footer(f, success, status.code()).await?;
        }

        if !success {
            warn!(binary = %self.binary, code = ?status.code(), "subprocess exited non-zero");
        } else {
            info!(binary = %self.binary, "subprocess completed");
        }

        Ok(SubprocessOutcome {
            success,
            captured_stdout: captured,
        })
    }
}

async fn open_log_file(path: &Path) -> Result<tokio::fs::File, std::io::Error> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

async fn write_header(f: &mut tokio::fs::File, prompt: &str) -> Result<(), std::io::Error> {
    let header = format!(
        "=== task started at {} ===\nprompt: {}\n---\n",
        chrono::Utc::now().to_rfc3339(),
        prompt
    );
    f.write_all(header.as_bytes()).await
}

async fn write_footer(
    f: &mut tokio::fs::File,
    success: bool,
    code: Option<i32>,
) -> Result<(), std::io::Error> {
    let footer = format!(
        "---\n=== task finished at {} (success={success}, exit_code={code:?}) ===\n",
        chrono::Utc::now().to_rfc3339()
    );
    f.write_all(footer.as_bytes()).await
}

/// First `CAPTURED_OUTPUT_HEAD_BYTES` of the captured output, split on a
/// char boundary (spec §4.7 step 6: "the head 3000 characters").
pub fn head_for_publish(output: &str) -> &str {
    if output.len() <= CAPTURED_OUTPUT_HEAD_BYTES {
        return output;
    }
    let mut end = CAPTURED_OUTPUT_HEAD_BYTES;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    &output[..end]
}
