// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! System call utilities.
//!
//! Helpers shell out to package managers, pip, git, and compilers. Every such
//! call goes through [`execute`], which streams the output of the child
//! process through the log line by line instead of buffering all of it.

use std::{
    ffi::{OsStr, OsString},
    io::{BufRead, BufReader, Read},
    path::Path,
    process::{Command, Stdio},
    sync::mpsc,
    thread,
};
use tracing::{debug, instrument, warn};

/// Captured result of a finished system call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Output {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run command, streaming its output through the log.
///
/// Lines of stdout are logged with a "1> " prefix, and lines of stderr with a
/// "2> " prefix. The call succeeds only if the exit code is in `expect`, which
/// defaults to `[0]` when empty.
///
/// # Errors
///
/// - Return [`SystemError::Spawn`] if command cannot be started.
/// - Return [`SystemError::Status`] if exit code is not expected.
#[instrument(skip(args, cwd, expect), level = "debug")]
pub fn execute(
    cmd: impl AsRef<OsStr> + std::fmt::Debug,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
    cwd: Option<&Path>,
    expect: &[i32],
) -> Result<Output> {
    let program = cmd.as_ref().to_os_string();
    let args = args
        .into_iter()
        .map(|arg| arg.as_ref().to_os_string())
        .collect::<Vec<_>>();
    debug!("execute {}", render(&program, &args));

    let mut command = Command::new(&program);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let mut child = command.spawn().map_err(|source| SystemError::Spawn {
        source,
        program: program.clone(),
    })?;

    // INVARIANT: Drain both pipes concurrently so neither one can fill up and
    // block the child.
    let (sender, receiver) = mpsc::channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_line_reader(stdout, 1, sender.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_line_reader(stderr, 2, sender.clone()));
    }
    drop(sender);

    let mut output = Output::default();
    for (stream, line) in receiver {
        debug!("{stream}> {line}");
        let buffer = if stream == 1 {
            &mut output.stdout
        } else {
            &mut output.stderr
        };
        buffer.push_str(&line);
        buffer.push('\n');
    }

    for reader in readers {
        if reader.join().is_err() {
            warn!("output reader of {program:?} panicked");
        }
    }

    let status = child.wait().map_err(|source| SystemError::Spawn {
        source,
        program: program.clone(),
    })?;
    output.code = status.code().unwrap_or(-1);

    let expect = if expect.is_empty() { &[0][..] } else { expect };
    if !expect.contains(&output.code) {
        return Err(SystemError::Status {
            command: render(&program, &args),
            code: output.code,
            message: chomp(&output.stderr),
        });
    }

    Ok(output)
}

/// Run command attached to current terminal.
///
/// Used when the child may need to prompt the user, e.g., `sudo`.
///
/// # Errors
///
/// - Return [`SystemError::Spawn`] if command cannot be started.
/// - Return [`SystemError::Status`] if command exits unsuccessfully.
pub fn execute_interactive(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> Result<()> {
    let program = cmd.as_ref().to_os_string();
    let args = args
        .into_iter()
        .map(|arg| arg.as_ref().to_os_string())
        .collect::<Vec<_>>();
    debug!("execute interactively {}", render(&program, &args));

    let status = Command::new(&program)
        .args(&args)
        .spawn()
        .and_then(|mut child| child.wait())
        .map_err(|source| SystemError::Spawn {
            source,
            program: program.clone(),
        })?;

    if !status.success() {
        return Err(SystemError::Status {
            command: render(&program, &args),
            code: status.code().unwrap_or(-1),
            message: String::new(),
        });
    }

    Ok(())
}

/// Check if executable can be found on `$PATH`.
pub fn have_executable(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn spawn_line_reader(
    stream: impl Read + Send + 'static,
    id: u8,
    sender: mpsc::Sender<(u8, String)>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) => break,
                Ok(_) => {}
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    warn!("cannot read output stream {id}: {error}");
                    break;
                }
            }

            let line = String::from_utf8_lossy(&buffer);
            let line = line
                .strip_suffix('\n')
                .map(|line| line.strip_suffix('\r').unwrap_or(line))
                .unwrap_or(&line);
            if sender.send((id, line.to_string())).is_err() {
                break;
            }
        }
    })
}

fn render(program: &OsStr, args: &[OsString]) -> String {
    let mut rendered = program.to_string_lossy().into_owned();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}

// INVARIANT: Chomp trailing newlines.
fn chomp(message: &str) -> String {
    message
        .strip_suffix("\r\n")
        .or(message.strip_suffix('\n'))
        .unwrap_or(message)
        .to_string()
}

/// System call error types.
#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    /// Command could not be started or waited on.
    #[error("cannot run command {program:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        program: OsString,
    },

    /// Command exited with an unexpected code.
    #[error("command {command:?} exited with code {code}: {message}")]
    Status {
        command: String,
        code: i32,
        message: String,
    },
}

/// Friendly result alias :3
type Result<T, E = SystemError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn execute_captures_both_streams() -> anyhow::Result<()> {
        let output = execute("sh", ["-c", "echo out; echo err >&2"], None, &[])?;
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.code, 0);
        Ok(())
    }

    #[test]
    fn execute_checks_expected_codes() -> anyhow::Result<()> {
        let output = execute("sh", ["-c", "exit 3"], None, &[0, 3])?;
        assert_eq!(output.code, 3);

        let result = execute("sh", ["-c", "echo bad >&2; exit 1"], None, &[]);
        match result {
            Err(SystemError::Status { code, message, .. }) => {
                assert_eq!(code, 1);
                assert_eq!(message, "bad");
            }
            other => panic!("expected status error, got {other:?}"),
        }

        Ok(())
    }

    #[test]
    fn execute_runs_in_working_directory() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let output = execute("pwd", std::iter::empty::<&str>(), Some(tmp.path()), &[])?;
        assert_eq!(
            crate::path::resolve(Path::new(output.stdout.trim())),
            crate::path::resolve(tmp.path())
        );
        Ok(())
    }

    #[test]
    fn execute_keeps_reading_past_invalid_utf8() -> anyhow::Result<()> {
        let output = execute(
            "sh",
            [
                "-c",
                "printf 'ok\\n\\377\\n'; head -c 300000 /dev/zero | tr '\\0' x; printf '\\nend\\n'",
            ],
            None,
            &[],
        )?;
        let lines = output.stdout.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "ok");
        assert_eq!(lines[1], "\u{FFFD}");
        assert_eq!(lines[2].len(), 300000);
        assert_eq!(lines[3], "end");
        assert_eq!(output.code, 0);
        Ok(())
    }

    #[test]
    fn have_executable_finds_shell() {
        assert!(have_executable("sh"));
        assert!(!have_executable("definitely-not-a-real-binary-hearth"));
    }
}
