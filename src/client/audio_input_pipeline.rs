use crate::audio::input::{StreamFormat, downmix_to_mono};
use crate::audio::pcm::TransportFrame;
use crate::audio::processor::BlockProcessor;
use crate::error::ConversationError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Default number of mono samples per processing block.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Counters reported by a processing node when it is disconnected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub blocks_processed: u64,
    pub blocks_dropped: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputGraphState {
    Idle,
    Running,
    Closed,
}

struct ProcessingNode {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<NodeStats>,
}

/// Re-frames mono samples into fixed-size blocks. Never holds more than one
/// block's worth of samples between pushes.
struct BlockFramer {
    block_size: usize,
    pending: Vec<f32>,
}

impl BlockFramer {
    fn new(block_size: usize) -> Self {
        Self {
            block_size,
            pending: Vec::with_capacity(block_size * 2),
        }
    }

    fn push(&mut self, samples: &[f32], mut on_block: impl FnMut(&[f32])) {
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= self.block_size {
            let block: Vec<f32> = self.pending.drain(..self.block_size).collect();
            on_block(&block);
        }
    }
}

/// Captures microphone audio and turns it into 16kHz transport frames.
///
/// `start` spawns a processing node that consumes the microphone's chunk
/// channel, down-mixes to mono, cuts fixed-size blocks and hands each frame the
/// node produces to `sink` without waiting. A full sink drops the frame, so
/// nothing queues up behind a slow consumer. A block that fails to process is
/// dropped and capture carries on with the next one.
pub struct AudioInputProcessor {
    block_size: usize,
    graph: InputGraphState,
    node: Option<ProcessingNode>,
}

impl Default for AudioInputProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl AudioInputProcessor {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            graph: InputGraphState::Idle,
            node: None,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn is_running(&self) -> bool {
        self.node.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.graph == InputGraphState::Closed
    }

    /// Spawns the processing node. It runs until `disconnect`, or until the
    /// microphone's chunk channel or `sink` closes.
    ///
    /// # Arguments
    ///
    /// * `chunks`: Interleaved `f32` chunks from the microphone.
    /// * `format`: Sample rate and channel count of `chunks`.
    /// * `processor`: Loaded node that resamples and encodes each mono block.
    /// * `sink`: Receives one transport frame per block. Sends never wait; a
    ///   full sink drops the frame.
    ///
    /// # Errors
    ///
    /// Returns `ConversationError::NotReady` if the input graph was closed.
    /// Calling `start` on a running pipeline logs a warning and returns `Ok`.
    pub fn start(
        &mut self,
        chunks: mpsc::Receiver<Vec<f32>>,
        format: StreamFormat,
        processor: Box<dyn BlockProcessor>,
        sink: mpsc::Sender<TransportFrame>,
    ) -> Result<(), ConversationError> {
        match self.graph {
            InputGraphState::Closed => {
                return Err(ConversationError::NotReady(
                    "input graph already closed".to_string(),
                ));
            }
            InputGraphState::Running => {
                warn!("[InputPipeline] start() called while already running; ignoring.");
                return Ok(());
            }
            InputGraphState::Idle => {}
        }

        info!(
            "[InputPipeline] Starting: {}Hz {}ch -> {}Hz mono, {} samples per block.",
            format.sample_rate,
            format.channels,
            processor.target_sample_rate(),
            self.block_size
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_processing_node(
            chunks,
            format,
            processor,
            sink,
            self.block_size,
            shutdown_rx,
        ));
        self.node = Some(ProcessingNode {
            shutdown_tx: Some(shutdown_tx),
            task,
        });
        self.graph = InputGraphState::Running;
        Ok(())
    }

    /// Stops the processing node and waits for it to finish, so no frame is
    /// produced after this returns.
    ///
    /// Returns the node's counters, or `None` if no node was running. Never
    /// fails; a node that panicked is logged and reports no counters.
    pub async fn disconnect(&mut self) -> Option<NodeStats> {
        let mut node = self.node.take()?;
        if let Some(tx) = node.shutdown_tx.take() {
            if tx.send(()).is_err() {
                debug!("[InputPipeline] Processing node already finished.");
            }
        }
        match node.task.await {
            Ok(stats) => {
                info!(
                    "[InputPipeline] Node disconnected: {} blocks processed, {} dropped, {} frames sent, {} frames dropped.",
                    stats.blocks_processed,
                    stats.blocks_dropped,
                    stats.frames_sent,
                    stats.frames_dropped
                );
                Some(stats)
            }
            Err(e) => {
                warn!("[InputPipeline] Processing node ended abnormally: {}", e);
                None
            }
        }
    }

    /// Closes the input graph. A closed graph cannot be started again.
    pub fn close(&mut self) {
        if self.graph == InputGraphState::Closed {
            return;
        }
        if let Some(node) = self.node.take() {
            node.task.abort();
        }
        self.graph = InputGraphState::Closed;
        debug!("[InputPipeline] Input graph closed.");
    }

    /// `disconnect` followed by `close`. Idempotent.
    pub async fn stop(&mut self) {
        self.disconnect().await;
        self.close();
    }
}

impl Drop for AudioInputProcessor {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            debug!("[InputPipeline] Dropped while running; aborting processing node.");
            node.task.abort();
        }
    }
}

async fn run_processing_node(
    mut chunks: mpsc::Receiver<Vec<f32>>,
    format: StreamFormat,
    mut processor: Box<dyn BlockProcessor>,
    sink: mpsc::Sender<TransportFrame>,
    block_size: usize,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> NodeStats {
    let mut stats = NodeStats::default();
    let mut framer = BlockFramer::new(block_size);
    let mut sink_closed = false;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                debug!("[InputPipeline] Shutdown signal received.");
                break;
            }
            chunk = chunks.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            info!("[InputPipeline] Microphone stream ended.");
            break;
        };

        let Some(mono) = downmix_to_mono(&chunk, format.channels) else {
            let e = ConversationError::MalformedBlock(format!(
                "{} samples is not a whole number of {}-channel frames",
                chunk.len(),
                format.channels
            ));
            warn!("[InputPipeline] Dropping chunk: {}", e);
            stats.blocks_dropped += 1;
            continue;
        };

        framer.push(&mono, |block| match processor.process(block) {
            Ok(frame) => {
                stats.blocks_processed += 1;
                match sink.try_send(frame) {
                    Ok(()) => stats.frames_sent += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        stats.frames_dropped += 1;
                        trace!("[InputPipeline] Sink full; frame dropped.");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        stats.frames_dropped += 1;
                        sink_closed = true;
                    }
                }
            }
            Err(e) => {
                stats.blocks_dropped += 1;
                warn!("[InputPipeline] Dropping block: {}", e);
            }
        });

        if sink_closed {
            info!("[InputPipeline] Frame sink closed; stopping processing node.");
            break;
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::processor::ProcessorKind;
    use crate::client::handle::test_utils::setup_test;
    use std::time::Duration;
    use tokio::time::timeout;

    fn mono_48k() -> StreamFormat {
        StreamFormat {
            sample_rate: 48000,
            channels: 1,
        }
    }

    struct FailingEveryOther {
        calls: usize,
    }

    impl BlockProcessor for FailingEveryOther {
        fn process(&mut self, block: &[f32]) -> Result<TransportFrame, ConversationError> {
            self.calls += 1;
            if self.calls % 2 == 1 {
                return Err(ConversationError::MalformedBlock("simulated".to_string()));
            }
            Ok(TransportFrame::from_f32(block, 16000))
        }

        fn target_sample_rate(&self) -> u32 {
            16000
        }
    }

    #[tokio::test]
    async fn emits_one_frame_per_full_block() {
        setup_test();
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (frame_tx, mut frame_rx) = mpsc::channel(8);
        let mut pipeline = AudioInputProcessor::new(4096);
        let processor = ProcessorKind::Script.load(48000, 16000, 4096).unwrap();
        pipeline
            .start(chunk_rx, mono_48k(), processor, frame_tx)
            .unwrap();

        // 3000 + 3000 samples -> one full block, 1904 pending.
        chunk_tx.send(vec![0.2; 3000]).await.unwrap();
        chunk_tx.send(vec![0.2; 3000]).await.unwrap();

        let frame = timeout(Duration::from_millis(500), frame_rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("sink closed");
        assert_eq!(frame.mime_type(), "audio/pcm;rate=16000");
        assert_eq!(frame.decode_pcm16().unwrap().len(), 1365);

        let stats = pipeline.disconnect().await.unwrap();
        assert_eq!(stats.blocks_processed, 1);
        assert_eq!(stats.frames_sent, 1);
        assert!(frame_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failing_block_does_not_end_capture() {
        setup_test();
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (frame_tx, mut frame_rx) = mpsc::channel(8);
        let mut pipeline = AudioInputProcessor::new(256);
        pipeline
            .start(
                chunk_rx,
                mono_48k(),
                Box::new(FailingEveryOther { calls: 0 }),
                frame_tx,
            )
            .unwrap();

        chunk_tx.send(vec![0.1; 256 * 4]).await.unwrap();
        for _ in 0..2 {
            timeout(Duration::from_millis(500), frame_rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        let stats = pipeline.disconnect().await.unwrap();
        assert_eq!(stats.blocks_dropped, 2);
        assert_eq!(stats.frames_sent, 2);
    }

    #[tokio::test]
    async fn malformed_interleaved_chunk_is_dropped() {
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (frame_tx, mut frame_rx) = mpsc::channel(8);
        let mut pipeline = AudioInputProcessor::new(256);
        let format = StreamFormat {
            sample_rate: 16000,
            channels: 2,
        };
        let processor = ProcessorKind::Worklet.load(16000, 16000, 256).unwrap();
        pipeline.start(chunk_rx, format, processor, frame_tx).unwrap();

        chunk_tx.send(vec![0.5; 3]).await.unwrap();
        chunk_tx.send(vec![0.5; 512]).await.unwrap();

        let frame = timeout(Duration::from_millis(500), frame_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.decode_pcm16().unwrap().len(), 256);
        let stats = pipeline.disconnect().await.unwrap();
        assert_eq!(stats.blocks_dropped, 1);
    }

    #[tokio::test]
    async fn full_sink_drops_frames_instead_of_queueing() {
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (frame_tx, mut frame_rx) = mpsc::channel(1);
        let mut pipeline = AudioInputProcessor::new(256);
        let processor = ProcessorKind::Script.load(16000, 16000, 256).unwrap();
        pipeline
            .start(chunk_rx, mono_48k(), processor, frame_tx)
            .unwrap();

        // All three blocks are cut from one chunk before the first is read.
        chunk_tx.send(vec![0.0; 256 * 3]).await.unwrap();
        timeout(Duration::from_millis(500), frame_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let stats = timeout(Duration::from_millis(500), pipeline.disconnect())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.frames_dropped, 2);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closed_graph_cannot_restart() {
        let (_chunk_tx, chunk_rx) = mpsc::channel(8);
        let (frame_tx, _frame_rx) = mpsc::channel(8);
        let mut pipeline = AudioInputProcessor::default();
        let processor = ProcessorKind::Script.load(48000, 16000, 4096).unwrap();
        pipeline
            .start(chunk_rx, mono_48k(), processor, frame_tx.clone())
            .unwrap();
        assert!(pipeline.is_running());

        pipeline.stop().await;
        pipeline.stop().await;
        assert!(!pipeline.is_running());
        assert!(pipeline.is_closed());

        let (_tx, rx) = mpsc::channel(1);
        let processor = ProcessorKind::Script.load(48000, 16000, 4096).unwrap();
        assert!(matches!(
            pipeline.start(rx, mono_48k(), processor, frame_tx),
            Err(ConversationError::NotReady(_))
        ));
    }

    #[test]
    fn framer_never_retains_a_full_block() {
        let mut framer = BlockFramer::new(4);
        let mut blocks = Vec::new();
        framer.push(&[1.0, 2.0, 3.0], |b| blocks.push(b.to_vec()));
        assert!(blocks.is_empty());
        framer.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0], |b| blocks.push(b.to_vec()));
        assert_eq!(blocks, vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]]);
        assert_eq!(framer.pending, vec![9.0]);
    }
}
