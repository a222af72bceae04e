use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

const CHUNK_SIZE: usize = 8192;

/// Bytes kept from one output stream
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CapturedStream {
    pub bytes: Vec<u8>,
    /// Set when bytes were discarded because the budget ran out
    pub truncated: bool,
}

/// Cumulative byte allowance shared by all output streams of one process
#[derive(Debug)]
pub(super) struct OutputBudget {
    remaining: AtomicUsize,
    exceeded: CancellationToken,
}

impl OutputBudget {
    pub(super) fn new(limit: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(limit),
            exceeded: CancellationToken::new(),
        }
    }

    /// Reserves up to `wanted` bytes and returns how many may be kept
    pub(super) fn take(&self, wanted: usize) -> usize {
        let mut granted = 0;
        let _ = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                granted = remaining.min(wanted);
                Some(remaining - granted)
            });

        if granted < wanted {
            self.exceeded.cancel();
        }
        granted
    }

    /// Cancelled as soon as any stream had to discard bytes
    pub(super) fn exceeded(&self) -> &CancellationToken {
        &self.exceeded
    }
}

pub(super) type StreamSink = Arc<Mutex<CapturedStream>>;

/// Copies `reader` into `sink` chunk by chunk until EOF
///
/// Bytes past the budget are read and dropped so the writer never blocks on
/// a full pipe. The sink holds whatever was kept even if this task is
/// aborted midway.
pub(super) async fn capture<R>(
    mut reader: R,
    budget: Arc<OutputBudget>,
    sink: StreamSink,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }

        let kept = budget.take(n);
        let mut captured = sink.lock();
        captured.bytes.extend_from_slice(&chunk[..kept]);
        if kept < n {
            captured.truncated = true;
        }
    }
}
