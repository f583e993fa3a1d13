//! Subprocess driver for external batch programs.
//!
//! One invocation runs the program with three concurrent tasks:
//!
//! - a writer that streams the batch into stdin and closes it
//! - a drain that logs stderr line by line
//! - a reader that consumes stdout (parsing score lines when scoring)
//!
//! All three are joined before the exit status is inspected. Input and
//! output may each be far larger than a pipe buffer, so no direction may wait
//! for another to finish first.

use std::collections::VecDeque;
use std::io;
use std::process::Stdio;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{BoxerError, BoxerResult};

/// Log-score substituted for probabilities that are zero, negative, or so
/// small that their logarithm would be below this value.
pub const LOG_FLOOR: f64 = -1000.0;

/// Number of trailing stderr lines kept for failure messages.
const STDERR_TAIL: usize = 20;

/// Log of a probability, floored at [`LOG_FLOOR`].
#[inline]
pub fn probability_to_log(p: f64) -> f64 {
    if p > 0.0 {
        p.ln().max(LOG_FLOOR)
    } else {
        LOG_FLOOR
    }
}

/// What to do with the program's stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdoutMode {
    /// Diagnostics only; every line is logged.
    Log,
    /// One score line per example, `classes` probabilities each.
    Scores { rows: usize, classes: usize },
}

/// A fully specified program run.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub input: Vec<u8>,
}

impl Invocation {
    /// Split a command line (program first) into an invocation.
    pub fn from_command_line(mut line: Vec<String>, input: Vec<u8>) -> BoxerResult<Self> {
        if line.is_empty() {
            return Err(BoxerError::InvalidConfig("empty command line".to_string()));
        }
        let program = line.remove(0);
        Ok(Self {
            program,
            args: line,
            input,
        })
    }
}

/// Parse `id p_1 .. p_n predicted` into `n` floored log-probabilities.
pub fn parse_score_line(line: &str, classes: usize) -> Result<Vec<f64>, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 3 {
        return Err(format!(
            "expected an id, {} probabilities and a prediction, got {} tokens",
            classes,
            tokens.len()
        ));
    }
    let probs = &tokens[1..tokens.len() - 1];
    if probs.len() != classes {
        return Err(format!(
            "expected {} probabilities, got {}",
            classes,
            probs.len()
        ));
    }
    probs
        .iter()
        .map(|tok| match tok.parse::<f64>() {
            Ok(p) if !p.is_nan() => Ok(probability_to_log(p)),
            _ => Err(format!("invalid probability '{}'", tok)),
        })
        .collect()
}

#[derive(Debug, Default)]
struct StdoutOutcome {
    rows: Vec<Vec<f64>>,
    extra_lines: usize,
    /// First unparseable line: `(line number, details)`.
    first_error: Option<(usize, String)>,
}

/// Read the next line into `buf` as raw bytes, without its `\n` or `\r\n`
/// terminator. Returns `false` at end of stream.
///
/// Program output is not required to be UTF-8, so decoding is left to the
/// caller.
async fn next_raw_line<R: AsyncBufRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<bool> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(false);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(true)
}

fn join_error(task: &str, e: tokio::task::JoinError) -> BoxerError {
    BoxerError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("{} task failed: {}", task, e),
    ))
}

/// Run one invocation to completion.
///
/// Returns the parsed score rows in [`StdoutMode::Scores`], and an empty
/// vector in [`StdoutMode::Log`].
///
/// # Errors
/// - `ProcessLaunch` if the program cannot be started
/// - `ProcessFailed` for a non-zero or signal exit (with the stderr tail)
/// - `MalformedOutput` for unparseable or missing score lines
pub async fn run(invocation: &Invocation, mode: StdoutMode) -> BoxerResult<Vec<Vec<f64>>> {
    let program = invocation.program.clone();
    info!(program = %program, args = ?invocation.args, bytes = invocation.input.len(), "launching external program");

    let mut child = Command::new(&invocation.program)
        .args(&invocation.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BoxerError::ProcessLaunch {
            program: program.clone(),
            details: e.to_string(),
        })?;

    let missing_pipe = |name: &str| BoxerError::ProcessLaunch {
        program: program.clone(),
        details: format!("{} pipe not available", name),
    };
    let mut stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

    let input = invocation.input.clone();
    let writer = tokio::spawn(async move {
        let result = stdin.write_all(&input).await;
        let flushed = stdin.shutdown().await;
        drop(stdin);
        result.and(flushed)
    });

    let drain_program = program.clone();
    let drain = tokio::spawn(async move {
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL);
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        while next_raw_line(&mut reader, &mut buf).await? {
            let line = String::from_utf8_lossy(&buf).into_owned();
            info!(program = %drain_program, "[stderr] {}", line);
            if tail.len() == STDERR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Ok::<_, io::Error>(tail)
    });

    let reader_program = program.clone();
    let reader = tokio::spawn(async move {
        let mut outcome = StdoutOutcome::default();
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        let mut number = 0usize;
        while next_raw_line(&mut reader, &mut buf).await? {
            number += 1;
            match mode {
                StdoutMode::Log => {
                    debug!(program = %reader_program, "[stdout] {}", String::from_utf8_lossy(&buf))
                }
                StdoutMode::Scores { rows, classes } => {
                    let text = std::str::from_utf8(&buf);
                    if matches!(text, Ok(line) if line.trim().is_empty()) {
                        continue;
                    }
                    if outcome.rows.len() >= rows {
                        outcome.extra_lines += 1;
                        continue;
                    }
                    // Keep draining after a bad line so the child never blocks.
                    if outcome.first_error.is_some() {
                        continue;
                    }
                    let parsed = match text {
                        Ok(line) => parse_score_line(line, classes),
                        Err(e) => Err(format!("line is not valid UTF-8: {}", e)),
                    };
                    match parsed {
                        Ok(row) => outcome.rows.push(row),
                        Err(details) => outcome.first_error = Some((number, details)),
                    }
                }
            }
        }
        Ok::<_, io::Error>(outcome)
    });

    let (written, drained, read) = tokio::join!(writer, drain, reader);
    let status = child.wait().await?;

    let tail = drained.map_err(|e| join_error("stderr", e))??;
    let outcome = read.map_err(|e| join_error("stdout", e))??;

    match written.map_err(|e| join_error("stdin", e))? {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe && status.success() => {
            warn!(program = %program, "program exited before reading all of its input");
        }
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
        Err(e) => return Err(BoxerError::Io(e)),
    }

    if !status.success() {
        let mut description = status.to_string();
        if !tail.is_empty() {
            description.push_str("; stderr: ");
            description.push_str(&tail.into_iter().collect::<Vec<_>>().join(" | "));
        }
        return Err(BoxerError::ProcessFailed {
            program,
            status: description,
        });
    }

    if let StdoutMode::Scores { rows, .. } = mode {
        if let Some((line, details)) = outcome.first_error {
            return Err(BoxerError::MalformedOutput {
                program,
                line,
                details,
            });
        }
        if outcome.rows.len() < rows {
            return Err(BoxerError::MalformedOutput {
                program,
                line: outcome.rows.len() + 1,
                details: format!(
                    "expected {} score lines, got {}",
                    rows,
                    outcome.rows.len()
                ),
            });
        }
        if outcome.extra_lines > 0 {
            warn!(program = %program, extra = outcome.extra_lines, "ignoring extra score lines");
        }
    }

    info!(program = %program, %status, "external program finished");
    Ok(outcome.rows)
}

/// Run an invocation from synchronous code.
///
/// The tasks run on a private current-thread runtime owned by a scoped
/// thread, so this is safe to call whether or not the caller is itself
/// inside a tokio runtime.
pub fn run_blocking(invocation: &Invocation, mode: StdoutMode) -> BoxerResult<Vec<Vec<f64>>> {
    std::thread::scope(|scope| {
        scope
            .spawn(|| {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                runtime.block_on(run(invocation, mode))
            })
            .join()
            .map_err(|_| {
                BoxerError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "subprocess driver thread panicked",
                ))
            })?
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, input: &str) -> Invocation {
        Invocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            input: input.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_probability_to_log_floors() {
        assert_eq!(probability_to_log(0.0), LOG_FLOOR);
        assert_eq!(probability_to_log(-0.5), LOG_FLOOR);
        assert_eq!(probability_to_log(1.0), 0.0);
        assert!((probability_to_log(0.5) - 0.5f64.ln()).abs() < 1e-15);
    }

    #[test]
    fn test_parse_score_line() {
        let row = parse_score_line("7 0.75 0.25 1", 2).unwrap();
        assert!((row[0] - 0.75f64.ln()).abs() < 1e-15);
        assert!((row[1] - 0.25f64.ln()).abs() < 1e-15);

        let floored = parse_score_line("1 1 0 1", 2).unwrap();
        assert_eq!(floored, vec![0.0, LOG_FLOOR]);
    }

    #[test]
    fn test_parse_score_line_rejects_bad_shapes() {
        assert!(parse_score_line("1 0.5", 1).is_err());
        assert!(parse_score_line("1 0.5 0.5 0.0 1", 2).is_err());
        assert!(parse_score_line("1 abc 0.5 1", 2).is_err());
        assert!(parse_score_line("1 nan 0.5 1", 2).is_err());
    }

    #[test]
    fn test_from_command_line_splits_program() {
        let inv = Invocation::from_command_line(
            vec!["prog".to_string(), "-x".to_string()],
            Vec::new(),
        )
        .unwrap();
        assert_eq!(inv.program, "prog");
        assert_eq!(inv.args, vec!["-x"]);
        assert!(Invocation::from_command_line(Vec::new(), Vec::new()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_blocking_parses_scores() {
        let inv = sh(r#"awk '{ print NR, "0.6", "0.4", 1 }'"#, "a\nb\nc\n");
        let rows = run_blocking(&inv, StdoutMode::Scores { rows: 3, classes: 2 }).unwrap();
        assert_eq!(rows.len(), 3);
        assert!((rows[2][0] - 0.6f64.ln()).abs() < 1e-12);
    }

    #[cfg(unix)]
    #[test]
    fn test_run_blocking_reports_exit_status_and_stderr() {
        let inv = sh("cat >/dev/null; echo boom >&2; exit 3", "x\n");
        let err = run_blocking(&inv, StdoutMode::Log).unwrap_err();
        match err {
            BoxerError::ProcessFailed { status, .. } => assert!(status.contains("boom")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_run_blocking_missing_lines() {
        let inv = sh("cat >/dev/null; echo '1 0.5 0.5 1'", "");
        let err = run_blocking(&inv, StdoutMode::Scores { rows: 2, classes: 2 }).unwrap_err();
        assert!(matches!(err, BoxerError::MalformedOutput { line: 2, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_blocking_malformed_line_is_drained() {
        let inv = sh("cat >/dev/null; echo 'garbage'; echo '2 0.5 0.5 1'", "");
        let err = run_blocking(&inv, StdoutMode::Scores { rows: 2, classes: 2 }).unwrap_err();
        assert!(matches!(err, BoxerError::MalformedOutput { line: 1, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_blocking_tolerates_non_utf8_stderr() {
        let inv = sh(r"cat >/dev/null; printf 'caf\351 warning\n' >&2; printf 'more\n' >&2; exit 0", "x\n");
        let rows = run_blocking(&inv, StdoutMode::Log).unwrap();
        assert!(rows.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_blocking_non_utf8_stderr_kept_in_failure_tail() {
        let inv = sh(r"cat >/dev/null; printf 'caf\351\n' >&2; echo boom >&2; exit 4", "");
        let err = run_blocking(&inv, StdoutMode::Log).unwrap_err();
        match err {
            BoxerError::ProcessFailed { status, .. } => {
                assert!(status.contains("caf\u{FFFD}"));
                assert!(status.contains("boom"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_run_blocking_non_utf8_score_line_is_malformed() {
        let inv = sh(
            r"cat >/dev/null; echo '1 0.5 0.5 1'; printf '2 0.5\351 0.5 1\n'; echo '3 0.5 0.5 1'",
            "",
        );
        let err = run_blocking(&inv, StdoutMode::Scores { rows: 3, classes: 2 }).unwrap_err();
        assert!(matches!(err, BoxerError::MalformedOutput { line: 2, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_blocking_extra_lines_are_ignored() {
        let inv = sh("cat >/dev/null; echo '1 1 0 1'; echo '2 1 0 1'", "");
        let rows = run_blocking(&inv, StdoutMode::Scores { rows: 1, classes: 2 }).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_launch_failure() {
        let inv = Invocation {
            program: "/nonexistent/boxer-program".to_string(),
            args: Vec::new(),
            input: Vec::new(),
        };
        let err = run_blocking(&inv, StdoutMode::Log).unwrap_err();
        assert!(matches!(err, BoxerError::ProcessLaunch { .. }));
        assert!(err.is_environment_error());
    }
}
