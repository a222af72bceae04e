mod capture;
mod process_tree;
mod session_lock;

pub use capture::CapturedStream;

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ResourceLimits;
use capture::{OutputBudget, StreamSink, capture};

/// How long readers may keep draining after the process group is gone
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// The ceiling that forced a process group down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Breach {
    WallTime,
    Memory,
    Output,
}

/// What the governor saw of one supervised process
#[derive(Debug, Clone)]
pub struct ProcessObservation {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub breach: Option<Breach>,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub duration: Duration,
    pub peak_memory_bytes: u64,
}

impl ProcessObservation {
    /// Zero exit with no ceiling breached
    pub fn success(&self) -> bool {
        self.breach.is_none() && self.exit_code == Some(0)
    }
}

/// Enforces wall-time, memory and output ceilings on a subprocess tree
///
/// Every supervised command is started as the leader of a new process
/// group, and with the session lock on, no descendant can leave it. Any
/// breach kills the whole group with SIGKILL; there is no cooperative
/// shutdown since the program cannot be trusted to honor one.
#[derive(Debug, Clone)]
pub struct Governor {
    limits: ResourceLimits,
    poll_interval: Duration,
    lock_sessions: bool,
}

impl Governor {
    pub fn new(limits: ResourceLimits, poll_interval: Duration) -> Self {
        Self {
            limits,
            poll_interval,
            lock_sessions: true,
        }
    }

    /// Whether supervised processes are barred from `setsid`/`setpgid`
    pub fn with_session_lock(mut self, enabled: bool) -> Self {
        self.lock_sessions = enabled;
        self
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Spawns `command` and supervises it until it and its group are gone
    ///
    /// `stdin` is written and closed right after launch; without it the
    /// child reads from the null device.
    pub async fn run(&self, mut command: Command, stdin: Option<&[u8]>) -> Result<ProcessObservation> {
        command
            .process_group(0)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if self.lock_sessions && session_lock::supported() {
            let filter = session_lock::filter();
            // SAFETY: the hook runs between fork and exec and only issues
            // prctl calls on a filter that was built before forking.
            unsafe {
                command.pre_exec(move || session_lock::install(filter));
            }
        }

        let start = Instant::now();
        let mut child = command.spawn().context("Failed to spawn subprocess")?;
        let pgid = child
            .id()
            .context("Subprocess was reaped before supervision started")?;

        let budget = Arc::new(OutputBudget::new(self.limits.max_output_bytes.as_usize()));
        let stdout_sink = StreamSink::default();
        let stderr_sink = StreamSink::default();
        let stdout_task = tokio::spawn(capture(
            child.stdout.take().context("stdout is not piped")?,
            budget.clone(),
            stdout_sink.clone(),
        ));
        let stderr_task = tokio::spawn(capture(
            child.stderr.take().context("stderr is not piped")?,
            budget.clone(),
            stderr_sink.clone(),
        ));
        let stdin_task = match (child.stdin.take(), stdin) {
            (Some(mut pipe), Some(input)) => {
                let input = input.to_vec();
                Some(tokio::spawn(async move {
                    // dropping the pipe afterwards delivers EOF
                    if let Err(e) = pipe.write_all(&input).await {
                        log::debug!("Subprocess {pgid} did not consume its stdin: {e}");
                    }
                }))
            }
            _ => None,
        };

        let deadline = tokio::time::sleep(self.limits.max_wall_time_ms.into());
        tokio::pin!(deadline);
        let mut memory_tick = tokio::time::interval(self.poll_interval);
        memory_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let max_memory = self.limits.max_memory_bytes.0;
        let mut peak_memory_bytes = 0;
        let mut breach = None;

        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.context("Failed to wait for subprocess")?;
                }
                _ = &mut deadline, if breach.is_none() => {
                    breach = Some(Breach::WallTime);
                    terminate(pgid, Breach::WallTime);
                }
                _ = budget.exceeded().cancelled(), if breach.is_none() => {
                    breach = Some(Breach::Output);
                    terminate(pgid, Breach::Output);
                }
                _ = memory_tick.tick() => {
                    let rss = tokio::task::spawn_blocking(move || process_tree::group_rss_bytes(pgid))
                        .await
                        .unwrap_or(0);
                    peak_memory_bytes = peak_memory_bytes.max(rss);
                    if rss > max_memory && breach.is_none() {
                        breach = Some(Breach::Memory);
                        terminate(pgid, Breach::Memory);
                    }
                }
            }
        };
        let duration = start.elapsed();

        // Descendants of a leader that exited on its own may still be running
        // and holding the output pipes open.
        if let Err(e) = process_tree::kill_group(pgid) {
            log::warn!("Failed to reap process group {pgid}: {e}");
        }

        if let Some(task) = stdin_task {
            task.abort();
        }
        tokio::join!(
            drain(stdout_task, pgid, "stdout"),
            drain(stderr_task, pgid, "stderr")
        );

        // The program may have overrun its budget and exited before the
        // breach arm above got polled.
        if breach.is_none() && budget.exceeded().is_cancelled() {
            log::info!("Process group {pgid} breached Output ceiling before exiting");
            breach = Some(Breach::Output);
        }

        let stdout = std::mem::take(&mut *stdout_sink.lock());
        let stderr = std::mem::take(&mut *stderr_sink.lock());

        log::debug!(
            "Process group {pgid} finished in {}ms: status {status}, breach {breach:?}, {} + {} bytes captured",
            duration.as_millis(),
            stdout.bytes.len(),
            stderr.bytes.len()
        );

        Ok(ProcessObservation {
            exit_code: status.code(),
            signal: status.signal(),
            breach,
            stdout,
            stderr,
            duration,
            peak_memory_bytes,
        })
    }
}

fn terminate(pgid: u32, breach: Breach) {
    log::info!("Process group {pgid} breached {breach:?} ceiling, killing");
    if let Err(e) = process_tree::kill_group(pgid) {
        log::error!("Failed to kill process group {pgid}: {e}");
    }
}

/// Waits a bounded time for a reader to hit EOF, then abandons it
async fn drain(task: JoinHandle<std::io::Result<()>>, pgid: u32, stream: &str) {
    let abort = task.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => log::warn!("Reading {stream} of process group {pgid} failed: {e}"),
        Ok(Err(e)) => log::warn!("Reader for {stream} of process group {pgid} died: {e}"),
        Err(_) => {
            log::warn!("{stream} of process group {pgid} still open after the group was killed");
            abort.abort();
        }
    }
}
