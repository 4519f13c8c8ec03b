//! Child-process execution with size-bounded, incrementally captured output.
//!
//! Backend processes can stream megabytes of progress output; capture keeps
//! the newest lines and drops the oldest once the configured byte ceiling is
//! exceeded. Raw stdout is teed line-by-line to a log file so the on-disk
//! record stays complete even when the in-memory buffer drops lines.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    /// Process exit code; 127 when the binary was not found, -1 when killed
    /// by a signal.
    pub exit_code: i32,
    /// Bounded combined output: stdout first, stderr appended.
    pub combined: String,
    /// Bytes dropped from the in-memory buffer (log file keeps everything).
    pub dropped_bytes: usize,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Byte-bounded line buffer that drops the oldest lines first.
#[derive(Debug)]
pub struct LineBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
    dropped: usize,
}

impl LineBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, line: String) {
        self.bytes += line.len();
        self.lines.push_back(line);
        while self.bytes > self.limit && self.lines.len() > 1 {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.len();
                self.dropped += old.len();
            }
        }
    }

    pub fn dropped_bytes(&self) -> usize {
        self.dropped
    }

    pub fn into_string(self) -> String {
        let mut out = String::with_capacity(self.bytes);
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(line);
        }
        out
    }
}

/// Render the command line for log headers.
pub fn render_command(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    for arg in cmd.get_args() {
        parts.push(arg.to_string_lossy().into_owned());
    }
    parts.join(" ")
}

/// Run a command to completion, consuming stdout line-by-line.
///
/// - `stdin`: written fully to the child before output is consumed.
/// - `output_limit_bytes`: ceiling for the in-memory combined buffer.
/// - `log_path`: raw stdout is teed here as it arrives (flushed per line),
///   with a `$ command` header and the stderr capture appended at the end.
/// - `on_line`: invoked for every stdout line (streamed-event backends parse
///   their event feed through this).
///
/// No timeout is enforced: cancellation is cooperative at orchestrator
/// checkpoints, never by killing an in-flight agent.
#[instrument(skip_all, fields(output_limit_bytes))]
pub fn run_streaming(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    output_limit_bytes: usize,
    log_path: &Path,
    mut on_line: Option<&mut dyn FnMut(&str)>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let log_file = std::fs::File::create(log_path)
        .with_context(|| format!("create log file {}", log_path.display()))?;
    let mut log = std::io::BufWriter::new(log_file);
    writeln!(log, "$ {}\n", render_command(&cmd)).context("write log header")?;

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let program = cmd.get_program().to_string_lossy().into_owned();
            warn!(program = %program, "binary not found");
            writeln!(log, "[agentrun] command not found: {program}").context("write log")?;
            log.flush().context("flush log")?;
            return Ok(CommandOutput {
                exit_code: 127,
                combined: format!("command not found: {program}"),
                dropped_bytes: 0,
            });
        }
        Err(err) => return Err(err).context("spawn command"),
    };

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stderr_limit = output_limit_bytes;
    let stderr_handle =
        thread::spawn(move || -> Result<LineBuffer> { read_lines(stderr, stderr_limit) });

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // A closed pipe just means the child stopped reading early.
        if let Err(err) = child_stdin.write_all(input) {
            if err.kind() != ErrorKind::BrokenPipe {
                return Err(err).context("write stdin");
            }
        }
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let mut reader = BufReader::new(stdout);
    let mut stdout_buf = LineBuffer::new(output_limit_bytes);
    let mut raw_line = Vec::new();
    loop {
        raw_line.clear();
        let n = reader.read_until(b'\n', &mut raw_line).context("read stdout")?;
        if n == 0 {
            break;
        }
        log.write_all(&raw_line).context("write log line")?;
        log.flush().context("flush log line")?;
        let line = String::from_utf8_lossy(&raw_line)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        if let Some(callback) = on_line.as_deref_mut() {
            callback(&line);
        }
        stdout_buf.push(line);
    }

    let status = child.wait().context("wait for command")?;
    let stderr_buf = stderr_handle
        .join()
        .map_err(|_| anyhow!("stderr reader thread panicked"))?
        .context("read stderr")?;

    let dropped_bytes = stdout_buf.dropped_bytes() + stderr_buf.dropped_bytes();
    if dropped_bytes > 0 {
        warn!(dropped_bytes, "output exceeded capture limit, oldest lines dropped");
    }

    let stderr_text = stderr_buf.into_string();
    if !stderr_text.is_empty() {
        writeln!(log, "\n=== stderr ===\n{stderr_text}").context("write stderr section")?;
    }
    log.flush().context("flush log")?;

    let mut combined = stdout_buf.into_string();
    if !stderr_text.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&stderr_text);
    }

    let exit_code = status.code().unwrap_or(-1);
    debug!(exit_code, "command finished");
    Ok(CommandOutput {
        exit_code,
        combined,
        dropped_bytes,
    })
}

fn read_lines<R: Read>(reader: R, limit: usize) -> Result<LineBuffer> {
    let mut buf_reader = BufReader::new(reader);
    let mut buffer = LineBuffer::new(limit);
    let mut raw_line = Vec::new();
    loop {
        raw_line.clear();
        let n = buf_reader
            .read_until(b'\n', &mut raw_line)
            .context("read line")?;
        if n == 0 {
            break;
        }
        buffer.push(
            String::from_utf8_lossy(&raw_line)
                .trim_end_matches(['\n', '\r'])
                .to_string(),
        );
    }
    Ok(buffer)
}
