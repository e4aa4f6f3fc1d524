// ⏳ Chunked processing - bounded unit of work, progress update, yield, continue
//
// Keeps a foreground consumer responsive while large raw arrays are normalized.
// The output never depends on the chunk size.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Entries,
    DeviceStatus,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Entries => "glucose entries",
            Stage::DeviceStatus => "device status",
        }
    }
}

/// How far a processing stage has got
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub stage: Stage,
    pub current: usize,
    pub total: usize,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.current as f64 / self.total as f64
        }
    }
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}/{}", self.stage.label(), self.current, self.total)
    }
}

/// External progress sink (a progress bar, a log line, a channel...)
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: Progress);
}

impl<F> ProgressSink for F
where
    F: Fn(Progress) + Send + Sync,
{
    fn report(&self, progress: Progress) {
        self(progress)
    }
}

/// Sink that discards every update
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _progress: Progress) {}
}

/// Map `items` through `step` in chunks of `chunk_size`, reporting progress and
/// yielding to the scheduler after each chunk. `None` from `step` drops the item.
pub async fn process_in_chunks<T, O, F>(
    items: &[T],
    chunk_size: usize,
    stage: Stage,
    sink: &dyn ProgressSink,
    mut step: F,
) -> Vec<O>
where
    F: FnMut(&T) -> Option<O>,
{
    let total = items.len();
    let mut output = Vec::with_capacity(total);
    let mut current = 0;

    for chunk in items.chunks(chunk_size.max(1)) {
        output.extend(chunk.iter().filter_map(&mut step));
        current += chunk.len();

        sink.report(Progress { stage, current, total });
        tokio::task::yield_now().await;
    }

    output
}
