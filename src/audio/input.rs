use tokio::sync::mpsc;
use tracing::debug;

/// Native format of a captured stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// A capture source that can be stopped, e.g. one microphone track.
pub trait MediaTrack: Send {
    fn stop(&mut self);

    fn label(&self) -> &str {
        "track"
    }
}

/// A granted microphone: its format, the channel of interleaved sample chunks
/// it produces, and the tracks that keep the device open.
///
/// Dropping the stream stops any tracks that were not stopped explicitly.
pub struct MicrophoneStream {
    format: StreamFormat,
    chunks: Option<mpsc::Receiver<Vec<f32>>>,
    tracks: Vec<Box<dyn MediaTrack>>,
}

impl MicrophoneStream {
    pub fn new(
        format: StreamFormat,
        chunks: mpsc::Receiver<Vec<f32>>,
        tracks: Vec<Box<dyn MediaTrack>>,
    ) -> Self {
        Self {
            format,
            chunks: Some(chunks),
            tracks,
        }
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Hands the chunk receiver to a consumer. Returns `None` once taken.
    pub fn take_chunks(&mut self) -> Option<mpsc::Receiver<Vec<f32>>> {
        self.chunks.take()
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Stops every track. Safe to call repeatedly.
    pub fn stop_tracks(&mut self) {
        for mut track in self.tracks.drain(..) {
            debug!("[Microphone] Stopping track '{}'.", track.label());
            track.stop();
        }
        self.chunks.take();
    }
}

impl Drop for MicrophoneStream {
    fn drop(&mut self) {
        if !self.tracks.is_empty() {
            debug!("[Microphone] Dropped with live tracks; stopping them.");
            self.stop_tracks();
        }
    }
}

/// Averages interleaved frames down to mono. Returns `None` if `chunk` does
/// not hold a whole number of frames.
pub fn downmix_to_mono(chunk: &[f32], channels: u16) -> Option<Vec<f32>> {
    let channels = channels.max(1) as usize;
    if chunk.len() % channels != 0 {
        return None;
    }
    if channels == 1 {
        return Some(chunk.to_vec());
    }
    Some(
        chunk
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTrack(Arc<AtomicUsize>);

    impl MediaTrack for CountingTrack {
        fn stop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn stream_with_tracks(stops: &Arc<AtomicUsize>, n: usize) -> MicrophoneStream {
        let (_tx, rx) = mpsc::channel(1);
        let tracks = (0..n)
            .map(|_| Box::new(CountingTrack(stops.clone())) as Box<dyn MediaTrack>)
            .collect();
        MicrophoneStream::new(
            StreamFormat {
                sample_rate: 48000,
                channels: 1,
            },
            rx,
            tracks,
        )
    }

    #[test]
    fn stop_tracks_stops_each_track_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let mut mic = stream_with_tracks(&stops, 2);
        mic.stop_tracks();
        mic.stop_tracks();
        drop(mic);
        assert_eq!(stops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn drop_stops_live_tracks() {
        let stops = Arc::new(AtomicUsize::new(0));
        drop(stream_with_tracks(&stops, 1));
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn downmix_averages_channels() {
        assert_eq!(
            downmix_to_mono(&[1.0, 0.0, 0.5, 0.5], 2),
            Some(vec![0.5, 0.5])
        );
        assert_eq!(downmix_to_mono(&[1.0, 0.0, 0.5], 2), None);
        assert_eq!(downmix_to_mono(&[0.25], 1), Some(vec![0.25]));
    }
}
