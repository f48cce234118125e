use crate::error::ConversationError;
use std::borrow::Cow;

/// Reads `input[index]`, treating anything past the end as silence.
#[inline]
fn sample_or_silence(input: &[f32], index: usize) -> f32 {
    input.get(index).copied().unwrap_or(0.0)
}

fn output_len(input_len: usize, ratio: f64, from: u32, to: u32) -> Result<usize, ConversationError> {
    let len = (input_len as f64 / ratio).round();
    if !len.is_finite() || len < 0.0 {
        return Err(ConversationError::InvalidSampleRate { from, to });
    }
    Ok(len as usize)
}

/// Linear-interpolation resampler used on the general capture path.
///
/// The step between output samples is `(from - 1) / (to - 1)` input samples and
/// the output holds `round(len / step)` samples. Each output sample blends the
/// input samples at `floor(pos)` and `floor(pos) + 1`; positions past the end
/// of `input` read as `0.0`.
///
/// When `from == to` the input is returned borrowed. A target of 1Hz makes the
/// step infinite and yields an empty output.
pub fn resample<'a>(
    input: &'a [f32],
    from: u32,
    to: u32,
) -> Result<Cow<'a, [f32]>, ConversationError> {
    if from == to {
        return Ok(Cow::Borrowed(input));
    }
    if from == 0 || to == 0 {
        return Err(ConversationError::InvalidSampleRate { from, to });
    }

    let ratio = (from as f64 - 1.0) / (to as f64 - 1.0);
    let new_len = output_len(input.len(), ratio, from, to)?;

    let mut output = Vec::with_capacity(new_len);
    for i in 0..new_len {
        let pos = i as f64 * ratio;
        let low = pos.floor() as usize;
        let weight = (pos - pos.floor()) as f32;
        let a = sample_or_silence(input, low);
        let b = sample_or_silence(input, low + 1);
        output.push(a + (b - a) * weight);
    }
    Ok(Cow::Owned(output))
}

/// Block resampler used by the `pcm-processor` worklet node.
///
/// Step is `from / to`, output length `round(len / step)`, and each output
/// sample interpolates between `floor(pos)` and `ceil(pos)`. Out-of-range reads
/// are silence, as in [`resample`].
pub fn resample_block<'a>(
    input: &'a [f32],
    from: u32,
    to: u32,
) -> Result<Cow<'a, [f32]>, ConversationError> {
    if from == to {
        return Ok(Cow::Borrowed(input));
    }
    if from == 0 || to == 0 {
        return Err(ConversationError::InvalidSampleRate { from, to });
    }

    let ratio = from as f64 / to as f64;
    let new_len = output_len(input.len(), ratio, from, to)?;

    let output = (0..new_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let low = pos.floor();
            let high = pos.ceil();
            let weight = (pos - low) as f32;
            let a = sample_or_silence(input, low as usize);
            let b = sample_or_silence(input, high as usize);
            a * (1.0 - weight) + b * weight
        })
        .collect();
    Ok(Cow::Owned(output))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected_len(len: usize, from: u32, to: u32) -> usize {
        (len as f64 / ((from as f64 - 1.0) / (to as f64 - 1.0))).round() as usize
    }

    #[test]
    fn identity_when_rates_match_is_borrowed() {
        let input = vec![0.1, -0.2, 0.3];
        let out = resample(&input, 16000, 16000).unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(&*out, &input[..]);

        let out = resample_block(&input, 24000, 24000).unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
    }

    #[test]
    fn capture_block_48k_to_16k_has_formula_length() {
        let input = vec![0.25f32; 4096];
        let out = resample(&input, 48000, 16000).unwrap();
        assert_eq!(out.len(), expected_len(4096, 48000, 16000));
        assert_eq!(out.len(), 1365);
    }

    #[test]
    fn output_length_matches_formula_across_rates() {
        let rates = [(44100, 16000), (48000, 16000), (22050, 16000), (8000, 16000), (16000, 24000)];
        for len in [0usize, 1, 7, 128, 1000, 4096] {
            let input: Vec<f32> = (0..len).map(|i| (i as f32 * 0.01).sin()).collect();
            for (from, to) in rates {
                let out = resample(&input, from, to).unwrap();
                assert_eq!(out.len(), expected_len(len, from, to), "len={len} {from}->{to}");
            }
        }
    }

    #[test]
    fn target_rate_of_one_yields_empty_output() {
        let input = vec![0.5f32; 100];
        let out = resample(&input, 48000, 1).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn degenerate_rates_are_rejected() {
        let input = vec![0.5f32; 10];
        assert!(matches!(
            resample(&input, 0, 16000),
            Err(ConversationError::InvalidSampleRate { from: 0, to: 16000 })
        ));
        assert!(matches!(
            resample(&input, 1, 16000),
            Err(ConversationError::InvalidSampleRate { .. })
        ));
        assert!(resample_block(&input, 48000, 0).is_err());
    }

    #[test]
    fn interpolates_linearly_and_reads_silence_past_end() {
        // Upsampling 3 -> 5: step = 2/4 = 0.5.
        let input = [0.0f32, 1.0, 0.5];
        let out = resample(&input, 3, 5).unwrap();
        assert_eq!(out.len(), 6);
        let expected = [0.0, 0.5, 1.0, 0.75, 0.5, 0.25];
        for (got, want) in out.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "got {got}, want {want}");
        }
    }

    #[test]
    fn block_resampler_decimates_by_integer_ratio() {
        let input: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let out = resample_block(&input, 48000, 16000).unwrap();
        assert_eq!(&*out, &[0.0, 3.0, 6.0, 9.0]);
    }

    #[test]
    fn block_resampler_upsample_tail_reads_silence() {
        let input = [1.0f32, 1.0];
        // step 0.5 -> positions 0, 0.5, 1.0, 1.5; the last blends with silence.
        let out = resample_block(&input, 8000, 16000).unwrap();
        assert_eq!(out.len(), 4);
        assert!((out[3] - 0.5).abs() < 1e-6);
    }
}
