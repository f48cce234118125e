//! Audio primitives for the conversation pipeline: resampling, PCM transport
//! encoding, microphone streams, block processors, output graphs and the
//! playback scheduler.

pub mod graph;
pub mod input;
pub mod pcm;
pub mod playback;
pub mod processor;
pub mod resample;

#[cfg(feature = "device-audio")]
pub mod device;

pub use graph::{ClockSource, GraphState, OutputGraph, PlaybackBuffer, SoftwareOutputGraph};
pub use input::{MediaTrack, MicrophoneStream, StreamFormat};
pub use pcm::TransportFrame;
pub use playback::AudioPlaybackScheduler;
pub use processor::{BlockProcessor, ProcessorKind};

use crate::error::ConversationError;
use async_trait::async_trait;
use std::sync::Arc;

/// Platform audio: microphone access and output graphs.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Requests the microphone. Refusal or absence of a device is reported as
    /// [`ConversationError::PermissionDenied`].
    async fn open_microphone(&self) -> Result<MicrophoneStream, ConversationError>;

    /// Opens an output graph that plays buffers recorded at `sample_rate`.
    async fn open_output(&self, sample_rate: u32) -> Result<Arc<dyn OutputGraph>, ConversationError>;
}
