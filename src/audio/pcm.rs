use crate::error::ConversationError;
use base64::Engine as _;

const PCM_SCALE: f32 = i16::MAX as f32;

/// Quantizes one float sample to signed 16-bit PCM.
///
/// Values outside `[-1, 1]` are clamped first. NaN maps to silence.
#[inline]
pub fn encode_sample(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample.clamp(-1.0, 1.0) * PCM_SCALE).round() as i16
}

/// Maps a 16-bit sample back to `[-1, 1)`.
#[inline]
pub fn decode_sample(sample: i16) -> f32 {
    sample as f32 / PCM_SCALE
}

/// Quantizes a block of float samples with [`encode_sample`].
pub fn encode_samples(samples: &[f32]) -> Vec<i16> {
    samples.iter().copied().map(encode_sample).collect()
}

pub fn decode_samples(samples: &[i16]) -> Vec<f32> {
    samples.iter().copied().map(decode_sample).collect()
}

/// Packs 16-bit samples as little-endian bytes, two per sample.
///
/// # Arguments
///
/// * `samples`: Mono PCM samples, in playback order.
pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut byte_data = Vec::with_capacity(samples.len() * 2);
    for sample_val in samples {
        byte_data.extend_from_slice(&sample_val.to_le_bytes());
    }
    byte_data
}

/// Unpacks little-endian 16-bit samples.
///
/// # Errors
///
/// Returns `ConversationError::MalformedFrame` if `bytes` has an odd length.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Result<Vec<i16>, ConversationError> {
    if bytes.len() % 2 != 0 {
        return Err(ConversationError::MalformedFrame(format!(
            "PCM payload has odd byte length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

/// Builds the MIME descriptor used on the wire, e.g. `audio/pcm;rate=16000`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extracts the `rate=` parameter from a PCM MIME descriptor.
pub fn rate_from_mime_type(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// Base64-encoded little-endian 16-bit mono PCM at a fixed sample rate.
///
/// Immutable once built; ownership moves to whoever transports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFrame {
    data: String,
    sample_rate: u32,
}

impl TransportFrame {
    pub fn from_pcm16(samples: &[i16], sample_rate: u32) -> Self {
        let byte_data = pcm16_to_le_bytes(samples);
        Self {
            data: base64::engine::general_purpose::STANDARD.encode(&byte_data),
            sample_rate,
        }
    }

    /// Quantizes and encodes float samples in one step.
    pub fn from_f32(samples: &[f32], sample_rate: u32) -> Self {
        Self::from_pcm16(&encode_samples(samples), sample_rate)
    }

    /// Wraps an already-encoded payload as received from the wire. Nothing is
    /// validated until the frame is decoded.
    pub fn from_base64(data: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            data: data.into(),
            sample_rate,
        }
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn into_data(self) -> String {
        self.data
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn mime_type(&self) -> String {
        pcm_mime_type(self.sample_rate)
    }

    /// Decodes the base64 payload (standard alphabet, padded).
    ///
    /// # Errors
    ///
    /// Returns `ConversationError::MalformedFrame` if the payload is not valid
    /// base64.
    pub fn decode_bytes(&self) -> Result<Vec<u8>, ConversationError> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| ConversationError::MalformedFrame(format!("invalid base64: {}", e)))
    }

    pub fn decode_pcm16(&self) -> Result<Vec<i16>, ConversationError> {
        pcm16_from_le_bytes(&self.decode_bytes()?)
    }

    /// Decodes the frame into float samples in `[-1, 1)`.
    ///
    /// # Errors
    ///
    /// Returns `ConversationError::MalformedFrame` for invalid base64 or an odd
    /// byte count. The playback scheduler drops such frames.
    pub fn decode_f32(&self) -> Result<Vec<f32>, ConversationError> {
        Ok(decode_samples(&self.decode_pcm16()?))
    }
}
