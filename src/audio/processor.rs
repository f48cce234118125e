use super::pcm::TransportFrame;
use super::resample::{resample, resample_block};
use crate::error::ConversationError;
use serde::Deserialize;

/// Smallest and largest block size a processing node accepts.
pub const MIN_BLOCK_SIZE: usize = 256;
pub const MAX_BLOCK_SIZE: usize = 16384;

/// Turns one fixed-size block of mono input samples into a transport frame.
pub trait BlockProcessor: Send {
    fn process(&mut self, block: &[f32]) -> Result<TransportFrame, ConversationError>;

    fn target_sample_rate(&self) -> u32;
}

/// Which processing node the capture pipeline loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    /// Script-style node using the general capture resampler.
    #[default]
    Script,
    /// `pcm-processor` worklet node using the block resampler.
    Worklet,
}

impl ProcessorKind {
    pub fn module_name(&self) -> &'static str {
        match self {
            ProcessorKind::Script => "script-processor",
            ProcessorKind::Worklet => "pcm-processor",
        }
    }

    /// Instantiates the node for a stream at `native_rate`.
    ///
    /// Fails with [`ConversationError::ModuleLoadFailure`] when the block size
    /// is not a power of two within `256..=16384` or either rate is zero.
    pub fn load(
        self,
        native_rate: u32,
        target_rate: u32,
        block_size: usize,
    ) -> Result<Box<dyn BlockProcessor>, ConversationError> {
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(ConversationError::ModuleLoadFailure(format!(
                "{}: block size {} must be a power of two between {} and {}",
                self.module_name(),
                block_size,
                MIN_BLOCK_SIZE,
                MAX_BLOCK_SIZE
            )));
        }
        if native_rate == 0 || target_rate == 0 {
            return Err(ConversationError::ModuleLoadFailure(format!(
                "{}: cannot convert {}Hz to {}Hz",
                self.module_name(),
                native_rate,
                target_rate
            )));
        }
        Ok(match self {
            ProcessorKind::Script => Box::new(ScriptBlockProcessor {
                native_rate,
                target_rate,
            }),
            ProcessorKind::Worklet => Box::new(PcmWorkletProcessor {
                native_rate,
                target_rate,
            }),
        })
    }
}

#[derive(Debug)]
pub struct ScriptBlockProcessor {
    native_rate: u32,
    target_rate: u32,
}

impl BlockProcessor for ScriptBlockProcessor {
    fn process(&mut self, block: &[f32]) -> Result<TransportFrame, ConversationError> {
        let resampled = resample(block, self.native_rate, self.target_rate)?;
        Ok(TransportFrame::from_f32(&resampled, self.target_rate))
    }

    fn target_sample_rate(&self) -> u32 {
        self.target_rate
    }
}

#[derive(Debug)]
pub struct PcmWorkletProcessor {
    native_rate: u32,
    target_rate: u32,
}

impl BlockProcessor for PcmWorkletProcessor {
    fn process(&mut self, block: &[f32]) -> Result<TransportFrame, ConversationError> {
        let resampled = resample_block(block, self.native_rate, self.target_rate)?;
        Ok(TransportFrame::from_f32(&resampled, self.target_rate))
    }

    fn target_sample_rate(&self) -> u32 {
        self.target_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_block_sizes() {
        for size in [0, 100, 128, 4095, 32768] {
            let result = ProcessorKind::Script.load(48000, 16000, size);
            assert!(
                matches!(result, Err(ConversationError::ModuleLoadFailure(_))),
                "block size {size} should fail"
            );
        }
        assert!(ProcessorKind::Worklet.load(48000, 16000, 4096).is_ok());
    }

    #[test]
    fn rejects_zero_rates() {
        assert!(matches!(
            ProcessorKind::Worklet.load(0, 16000, 4096),
            Err(ConversationError::ModuleLoadFailure(msg)) if msg.contains("pcm-processor")
        ));
    }

    #[test]
    fn script_node_emits_16k_frame_of_formula_length() {
        let mut node = ProcessorKind::Script.load(48000, 16000, 4096).unwrap();
        let frame = node.process(&vec![0.1; 4096]).unwrap();
        assert_eq!(frame.sample_rate(), 16000);
        assert_eq!(frame.mime_type(), "audio/pcm;rate=16000");
        assert_eq!(frame.decode_pcm16().unwrap().len(), 1365);
    }

    #[test]
    fn worklet_node_uses_block_formula() {
        let mut node = ProcessorKind::Worklet.load(48000, 16000, 4096).unwrap();
        let frame = node.process(&vec![0.1; 4096]).unwrap();
        // 4096 / 3 = 1365.33 -> 1365
        assert_eq!(frame.decode_pcm16().unwrap().len(), 1365);

        let mut node = ProcessorKind::Worklet.load(44100, 16000, 4096).unwrap();
        let frame = node.process(&vec![0.1; 4096]).unwrap();
        let expected = (4096.0f64 / (44100.0 / 16000.0)).round() as usize;
        assert_eq!(frame.decode_pcm16().unwrap().len(), expected);
    }
}
