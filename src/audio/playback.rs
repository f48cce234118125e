use super::graph::{GraphState, OutputGraph, PlaybackBuffer};
use super::pcm::TransportFrame;
use crate::error::ConversationError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

struct PlaybackState {
    queue: VecDeque<PlaybackBuffer>,
    next_play_time: f64,
    stopped: bool,
}

/// Schedules received audio frames back to back on an output graph.
///
/// Frames are decoded and queued in submission order, then drained onto the
/// graph timeline at a virtual clock (`next_play_time`) that advances by each
/// buffer's duration. If the clock has fallen behind the graph it snaps forward
/// to the graph's current time, trading an audible gap for correct ordering.
///
/// `add` may be called from any task. Only one drain runs at a time; a caller
/// that finds a drain in progress returns immediately and the running drain
/// picks up its buffer.
pub struct AudioPlaybackScheduler {
    graph: Arc<dyn OutputGraph>,
    state: Mutex<PlaybackState>,
    is_scheduling: AtomicBool,
}

impl AudioPlaybackScheduler {
    pub fn new(graph: Arc<dyn OutputGraph>) -> Self {
        info!(
            "[Playback] Scheduler created for {}Hz output graph.",
            graph.sample_rate()
        );
        Self {
            graph,
            state: Mutex::new(PlaybackState {
                queue: VecDeque::new(),
                next_play_time: 0.0,
                stopped: false,
            }),
            is_scheduling: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlaybackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decodes `frame`, queues it and drains the queue onto the graph.
    ///
    /// A malformed frame is dropped and reported back to the caller only; the
    /// queue and clock are untouched.
    pub fn add(&self, frame: &TransportFrame) -> Result<(), ConversationError> {
        let samples = frame.decode_f32().map_err(|e| {
            warn!("[Playback] Dropping undecodable frame: {}", e);
            e
        })?;
        if samples.is_empty() {
            trace!("[Playback] Ignoring empty frame.");
            return Ok(());
        }
        {
            let mut state = self.lock();
            if state.stopped {
                debug!("[Playback] Frame received after stop; discarded.");
                return Ok(());
            }
            state
                .queue
                .push_back(PlaybackBuffer::new(samples, frame.sample_rate()));
        }
        self.drain();
        Ok(())
    }

    /// Drains the queue. Returns immediately if another drain holds the guard.
    fn drain(&self) {
        loop {
            if self
                .is_scheduling
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            self.drain_queue();
            self.is_scheduling.store(false, Ordering::Release);

            // A buffer queued between our last pop and releasing the guard
            // would otherwise wait for the next add.
            let state = self.lock();
            if state.stopped || state.queue.is_empty() {
                return;
            }
        }
    }

    fn drain_queue(&self) {
        if self.graph.state() == GraphState::Suspended {
            if let Err(e) = self.graph.resume() {
                warn!("[Playback] Failed to resume output graph: {}", e);
            }
        }

        {
            let mut state = self.lock();
            let now = self.graph.current_time();
            if state.next_play_time < now {
                if state.next_play_time > 0.0 {
                    debug!(
                        "[Playback] Underrun: clock {:.4}s behind graph time {:.4}s; snapping forward.",
                        now - state.next_play_time,
                        now
                    );
                }
                state.next_play_time = now;
            }
        }

        loop {
            let (buffer, start_at) = {
                let mut state = self.lock();
                if state.stopped {
                    return;
                }
                let Some(buffer) = state.queue.pop_front() else {
                    return;
                };
                let start_at = state.next_play_time;
                state.next_play_time += buffer.duration();
                (buffer, start_at)
            };

            let frames = buffer.len();
            if let Err(e) = self.graph.schedule(buffer, start_at) {
                warn!(
                    "[Playback] Failed to schedule {} frames at {:.4}s: {}",
                    frames, start_at, e
                );
            }
        }
    }

    /// Virtual clock: graph time at which the next buffer will start.
    pub fn next_play_time(&self) -> f64 {
        self.lock().next_play_time
    }

    pub fn queued_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Discards queued audio and closes the output graph. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.queue.clear();
        }
        if let Err(e) = self.graph.close() {
            warn!("[Playback] Error closing output graph: {}", e);
        }
        info!("[Playback] Stopped.");
    }
}

impl Drop for AudioPlaybackScheduler {
    fn drop(&mut self) {
        if !self.is_stopped() {
            debug!("[Playback] Dropped without stop(); closing output graph.");
            self.stop();
        }
    }
}
