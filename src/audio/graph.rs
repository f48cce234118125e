use crate::error::ConversationError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Lifecycle state of an audio graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    Suspended,
    Running,
    Closed,
}

/// A decoded mono buffer ready to be placed on an output timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl PlaybackBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// An output graph with its own clock onto which buffers are scheduled at
/// absolute graph times (seconds).
pub trait OutputGraph: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Current graph time in seconds. Does not advance while suspended.
    fn current_time(&self) -> f64;

    fn state(&self) -> GraphState;

    fn resume(&self) -> Result<(), ConversationError>;

    /// Schedules `buffer` to start playing exactly at `start_at`.
    fn schedule(&self, buffer: PlaybackBuffer, start_at: f64) -> Result<(), ConversationError>;

    /// Closes the graph. Closing an already-closed graph is a no-op.
    fn close(&self) -> Result<(), ConversationError>;
}

/// A buffer placement as recorded by [`SoftwareOutputGraph`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSpan {
    pub start: f64,
    pub duration: f64,
    pub frames: usize,
}

impl ScheduledSpan {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// How a [`SoftwareOutputGraph`] measures time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    /// Elapsed (tokio) wall time while running.
    Wall,
    /// Frames pulled through [`SoftwareOutputGraph::render_into`].
    Rendered,
}

const SPAN_HISTORY_LIMIT: usize = 4096;

struct PendingBuffer {
    start: f64,
    buffer: PlaybackBuffer,
}

struct SoftwareGraphInner {
    state: GraphState,
    // Wall clock bookkeeping.
    accumulated: f64,
    running_since: Option<Instant>,
    // Rendered clock bookkeeping.
    rendered_frames: u64,
    pending: Vec<PendingBuffer>,
    history: VecDeque<ScheduledSpan>,
}

/// In-process output graph: keeps a clock, accepts scheduled buffers and mixes
/// them on demand.
///
/// With [`ClockSource::Wall`] it runs headless and only records placements.
/// With [`ClockSource::Rendered`] an audio device callback drives it through
/// [`render_into`](Self::render_into).
pub struct SoftwareOutputGraph {
    sample_rate: u32,
    clock: ClockSource,
    inner: Mutex<SoftwareGraphInner>,
}

impl SoftwareOutputGraph {
    /// Creates a suspended graph, like a freshly constructed browser audio
    /// context that still needs `resume()`.
    pub fn new(sample_rate: u32, clock: ClockSource) -> Self {
        Self {
            sample_rate,
            clock,
            inner: Mutex::new(SoftwareGraphInner {
                state: GraphState::Suspended,
                accumulated: 0.0,
                running_since: None,
                rendered_frames: 0,
                pending: Vec::new(),
                history: VecDeque::new(),
            }),
        }
    }

    pub fn headless(sample_rate: u32) -> Self {
        Self::new(sample_rate, ClockSource::Wall)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SoftwareGraphInner> {
        // A poisoned lock only means another thread panicked mid-update; the
        // timeline data is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn time_of(&self, inner: &SoftwareGraphInner) -> f64 {
        match self.clock {
            ClockSource::Wall => {
                inner.accumulated
                    + inner
                        .running_since
                        .map(|since| since.elapsed().as_secs_f64())
                        .unwrap_or(0.0)
            }
            ClockSource::Rendered => inner.rendered_frames as f64 / self.sample_rate as f64,
        }
    }

    /// Placements in scheduling order (most recent `4096` kept).
    pub fn scheduled_spans(&self) -> Vec<ScheduledSpan> {
        self.lock().history.iter().copied().collect()
    }

    /// Suspends the clock. Used when the output device stalls.
    pub fn suspend(&self) {
        let mut inner = self.lock();
        if inner.state != GraphState::Running {
            return;
        }
        inner.accumulated = self.time_of(&inner);
        inner.running_since = None;
        inner.state = GraphState::Suspended;
    }

    /// Mixes every scheduled buffer overlapping the next `out.len()` frames
    /// into `out` and advances a [`ClockSource::Rendered`] clock by that much.
    /// Emits silence while the graph is not running.
    pub fn render_into(&self, out: &mut [f32]) {
        out.iter_mut().for_each(|s| *s = 0.0);
        let mut inner = self.lock();
        if inner.state != GraphState::Running {
            return;
        }

        let rate = self.sample_rate as f64;
        let window_start = self.time_of(&inner);
        let window_end = window_start + out.len() as f64 / rate;
        for pending in &inner.pending {
            let buffer = &pending.buffer;
            let end = pending.start + buffer.duration();
            if end <= window_start || pending.start >= window_end {
                continue;
            }
            let first = ((pending.start - window_start) * rate).ceil().max(0.0) as usize;
            for (offset, slot) in out.iter_mut().enumerate().skip(first) {
                let t = window_start + offset as f64 / rate;
                if t >= end {
                    break;
                }
                if t < pending.start {
                    continue;
                }
                let src = ((t - pending.start) * buffer.sample_rate() as f64).floor() as usize;
                if let Some(sample) = buffer.samples().get(src) {
                    *slot += *sample;
                }
            }
        }

        if self.clock == ClockSource::Rendered {
            inner.rendered_frames += out.len() as u64;
        }
        let now = self.time_of(&inner);
        inner
            .pending
            .retain(|p| p.start + p.buffer.duration() > now);
    }
}

impl OutputGraph for SoftwareOutputGraph {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        let inner = self.lock();
        self.time_of(&inner)
    }

    fn state(&self) -> GraphState {
        self.lock().state
    }

    fn resume(&self) -> Result<(), ConversationError> {
        let mut inner = self.lock();
        match inner.state {
            GraphState::Closed => Err(ConversationError::GraphClosed),
            GraphState::Running => Ok(()),
            GraphState::Suspended => {
                inner.running_since = Some(Instant::now());
                inner.state = GraphState::Running;
                debug!("[OutputGraph] Resumed at t={:.3}s.", inner.accumulated);
                Ok(())
            }
        }
    }

    fn schedule(&self, buffer: PlaybackBuffer, start_at: f64) -> Result<(), ConversationError> {
        let mut inner = self.lock();
        if inner.state == GraphState::Closed {
            return Err(ConversationError::GraphClosed);
        }
        let span = ScheduledSpan {
            start: start_at,
            duration: buffer.duration(),
            frames: buffer.len(),
        };
        trace!(
            "[OutputGraph] Scheduled {} frames at {:.4}s (ends {:.4}s).",
            span.frames,
            span.start,
            span.end()
        );
        if inner.history.len() == SPAN_HISTORY_LIMIT {
            inner.history.pop_front();
        }
        inner.history.push_back(span);
        if self.clock == ClockSource::Rendered {
            inner.pending.push(PendingBuffer {
                start: start_at,
                buffer,
            });
        }
        Ok(())
    }

    fn close(&self) -> Result<(), ConversationError> {
        let mut inner = self.lock();
        if inner.state == GraphState::Closed {
            return Ok(());
        }
        inner.accumulated = self.time_of(&inner);
        inner.running_since = None;
        inner.pending.clear();
        inner.state = GraphState::Closed;
        debug!("[OutputGraph] Closed at t={:.3}s.", inner.accumulated);
        Ok(())
    }
}
