//! cpal-backed [`AudioBackend`]. Streams live on dedicated threads because
//! `cpal::Stream` is not `Send` on every platform.

use super::graph::{ClockSource, GraphState, OutputGraph, PlaybackBuffer, SoftwareOutputGraph};
use super::input::{MediaTrack, MicrophoneStream, StreamFormat};
use super::{AudioBackend, pcm};
use crate::error::ConversationError;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Sender, bounded};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace};

const DEFAULT_CHUNK_CAPACITY: usize = 64;

pub struct CpalAudioBackend {
    chunk_capacity: usize,
}

impl Default for CpalAudioBackend {
    fn default() -> Self {
        Self {
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
        }
    }
}

impl CpalAudioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_capacity(mut self, capacity: usize) -> Self {
        self.chunk_capacity = capacity.max(1);
        self
    }
}

struct DeviceTrack {
    label: String,
    stop_tx: Option<Sender<()>>,
}

impl MediaTrack for DeviceTrack {
    fn stop(&mut self) {
        // Dropping the sender wakes the capture thread, which drops the stream.
        if self.stop_tx.take().is_some() {
            info!("[Microphone] Track '{}' stopped.", self.label);
        }
    }

    fn label(&self) -> &str {
        &self.label
    }
}

fn forward_chunk(tx: &mpsc::Sender<Vec<f32>>, chunk: Vec<f32>) {
    if chunk.is_empty() {
        return;
    }
    match tx.try_send(chunk) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            trace!("[Microphone] Chunk channel full; dropping chunk.")
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

fn build_input_stream(
    chunk_tx: mpsc::Sender<Vec<f32>>,
) -> Result<(cpal::Stream, StreamFormat, String), ConversationError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or_else(|| {
        ConversationError::PermissionDenied("No input device available".to_string())
    })?;
    let name = device.name().unwrap_or_else(|_| "default input".to_string());
    let supported = device
        .default_input_config()
        .map_err(|e| ConversationError::PermissionDenied(e.to_string()))?;
    let config: cpal::StreamConfig = supported.config();
    let format = StreamFormat {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    };
    let err_fn = |err: cpal::StreamError| error!("[Microphone] Device error: {}", err);

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => {
            let tx = chunk_tx.clone();
            device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| forward_chunk(&tx, data.to_vec()),
                err_fn,
                None,
            )
        }
        cpal::SampleFormat::I16 => {
            let tx = chunk_tx.clone();
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    forward_chunk(&tx, pcm::decode_samples(data))
                },
                err_fn,
                None,
            )
        }
        other => {
            return Err(ConversationError::PermissionDenied(format!(
                "Unsupported input sample format {:?}",
                other
            )));
        }
    }
    .map_err(|e| ConversationError::PermissionDenied(e.to_string()))?;

    stream
        .play()
        .map_err(|e| ConversationError::PermissionDenied(e.to_string()))?;
    Ok((stream, format, name))
}

/// Output graph whose clock is driven by the device callback.
pub struct DeviceOutputGraph {
    timeline: Arc<SoftwareOutputGraph>,
    stop_tx: Mutex<Option<Sender<()>>>,
}

impl OutputGraph for DeviceOutputGraph {
    fn sample_rate(&self) -> u32 {
        self.timeline.sample_rate()
    }

    fn current_time(&self) -> f64 {
        self.timeline.current_time()
    }

    fn state(&self) -> GraphState {
        self.timeline.state()
    }

    fn resume(&self) -> Result<(), ConversationError> {
        self.timeline.resume()
    }

    fn schedule(&self, buffer: PlaybackBuffer, start_at: f64) -> Result<(), ConversationError> {
        self.timeline.schedule(buffer, start_at)
    }

    fn close(&self) -> Result<(), ConversationError> {
        let result = self.timeline.close();
        let mut guard = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner());
        if guard.take().is_some() {
            debug!("[OutputGraph] Releasing output device.");
        }
        result
    }
}

impl Drop for DeviceOutputGraph {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn build_output_stream(
    requested_rate: u32,
) -> Result<(cpal::Stream, Arc<SoftwareOutputGraph>), ConversationError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or_else(|| {
        ConversationError::ServiceUnavailable("No output device available".to_string())
    })?;
    let supported = device
        .default_output_config()
        .map_err(|e| ConversationError::ServiceUnavailable(e.to_string()))?;
    if supported.sample_format() != cpal::SampleFormat::F32 {
        return Err(ConversationError::ServiceUnavailable(format!(
            "Unsupported output sample format {:?}",
            supported.sample_format()
        )));
    }
    let config: cpal::StreamConfig = supported.config();
    let channels = config.channels.max(1) as usize;
    info!(
        "[OutputGraph] Device output {}Hz {}ch for {}Hz audio.",
        config.sample_rate.0, channels, requested_rate
    );

    let timeline = Arc::new(SoftwareOutputGraph::new(
        config.sample_rate.0,
        ClockSource::Rendered,
    ));
    let render_timeline = timeline.clone();
    let mut scratch: Vec<f32> = Vec::new();
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                scratch.resize(frames, 0.0);
                render_timeline.render_into(&mut scratch);
                for (frame, sample) in data.chunks_mut(channels).zip(scratch.iter()) {
                    frame.iter_mut().for_each(|s| *s = *sample);
                }
            },
            |err: cpal::StreamError| error!("[OutputGraph] Device error: {}", err),
            None,
        )
        .map_err(|e| ConversationError::ServiceUnavailable(e.to_string()))?;
    stream
        .play()
        .map_err(|e| ConversationError::ServiceUnavailable(e.to_string()))?;
    Ok((stream, timeline))
}

#[async_trait]
impl AudioBackend for CpalAudioBackend {
    async fn open_microphone(&self) -> Result<MicrophoneStream, ConversationError> {
        let (chunk_tx, chunk_rx) = mpsc::channel(self.chunk_capacity);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = bounded::<()>(1);

        std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || match build_input_stream(chunk_tx) {
                Ok((stream, format, name)) => {
                    let _ = ready_tx.send(Ok((format, name)));
                    // Returns once the track drops its sender.
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| ConversationError::PermissionDenied(e.to_string()))?;

        let (format, label) = ready_rx.await.map_err(|_| {
            ConversationError::PermissionDenied("Capture thread exited early".to_string())
        })??;
        info!(
            "[Microphone] Opened '{}' at {}Hz {}ch.",
            label, format.sample_rate, format.channels
        );
        let track = DeviceTrack {
            label,
            stop_tx: Some(stop_tx),
        };
        Ok(MicrophoneStream::new(format, chunk_rx, vec![Box::new(track)]))
    }

    async fn open_output(&self, sample_rate: u32) -> Result<Arc<dyn OutputGraph>, ConversationError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = bounded::<()>(1);

        std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || match build_output_stream(sample_rate) {
                Ok((stream, timeline)) => {
                    let _ = ready_tx.send(Ok(timeline));
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| ConversationError::ServiceUnavailable(e.to_string()))?;

        let timeline = ready_rx.await.map_err(|_| {
            ConversationError::ServiceUnavailable("Output thread exited early".to_string())
        })??;
        Ok(Arc::new(DeviceOutputGraph {
            timeline,
            stop_tx: Mutex::new(Some(stop_tx)),
        }))
    }
}
