//! Bounded shell command execution.
//!
//! Used by the `EXEC` handler both synchronously and from worker
//! threads. The child runs under `sh -c` with piped output; a deadline
//! is enforced by polling, and an overrun child is killed so a worker
//! is never stuck behind a runaway command.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Default command timeout.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of one command run.
#[derive(Debug)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub timed_out: bool,
}

/// Run `command` under `sh -c`, capturing output, with a hard
/// deadline.
///
/// # Errors
///
/// Returns the spawn error if the shell itself cannot be started.
pub fn run_command(
    command: &str,
    cwd: Option<&Path>,
    timeout: Duration,
) -> std::io::Result<ExecOutcome> {
    let started = Instant::now();

    let mut builder = Command::new("sh");
    builder
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        builder.current_dir(cwd);
    }
    let mut child = builder.spawn()?;

    // Drain the pipes on their own threads so a chatty child cannot
    // deadlock against a full pipe buffer.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_reader = std::thread::spawn(move || read_all(stdout));
    let stderr_reader = std::thread::spawn(move || read_all(stderr));

    let deadline = started + timeout;
    let mut timed_out = false;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break Some(status),
            None => {
                if Instant::now() >= deadline {
                    timed_out = true;
                    let _ = child.kill();
                    break child.wait().ok();
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    let exit_code = status.map_or(-1, |s| {
        use std::os::unix::process::ExitStatusExt;
        s.code().or_else(|| s.signal().map(|sig| 128 + sig)).unwrap_or(-1)
    });

    Ok(ExecOutcome {
        stdout,
        stderr,
        exit_code,
        duration_ms: started.elapsed().as_millis() as u64,
        timed_out,
    })
}

fn read_all(pipe: Option<impl Read>) -> String {
    let mut buffer = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buffer);
    }
    buffer
}
