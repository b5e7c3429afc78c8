use anyhow::{anyhow, Result};
use rubato::{FftFixedIn, Resampler};

// Chunk size for the offline rubato pass on the playback path.
const RESAMPLER_CHUNK_SIZE: usize = 1024;

/// Per-block linear resampler for the capture path.
///
/// Each capture block is resampled in isolation: no state is carried across
/// blocks, trading minor boundary artifacts for a pipeline where a dropped
/// or muted block never skews the next one. Output length is
/// `round(input_len * out_rate / in_rate)`.
pub struct BlockResampler {
    in_rate: u32,
    out_rate: u32,
}

impl BlockResampler {
    pub fn new(in_rate: u32, out_rate: u32) -> Self {
        assert!(in_rate > 0 && out_rate > 0, "sample rates must be non-zero");
        Self { in_rate, out_rate }
    }

    pub fn is_passthrough(&self) -> bool {
        self.in_rate == self.out_rate
    }

    /// Resample one block. Passthrough when the rates match.
    pub fn process(&self, block: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return block.to_vec();
        }
        if block.is_empty() {
            return Vec::new();
        }

        let ratio = self.in_rate as f64 / self.out_rate as f64;
        let out_len = (block.len() as f64 / ratio).round() as usize;
        let mut output = Vec::with_capacity(out_len);

        for i in 0..out_len {
            let src_pos = i as f64 * ratio;
            let idx = src_pos as usize;
            let frac = (src_pos - idx as f64) as f32;
            let a = block[idx.min(block.len() - 1)];
            let b = block[(idx + 1).min(block.len() - 1)];
            output.push(a + (b - a) * frac);
        }

        output
    }
}

/// Quantize f32 samples to signed 16-bit little-endian PCM with hard
/// clamping to [-1.0, 1.0].
pub fn quantize_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = sample.clamp(-1.0, 1.0);
        let value = if s < 0.0 {
            (s * 0x8000 as f32) as i16
        } else {
            (s * 0x7FFF as f32) as i16
        };
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode little-endian PCM16 bytes to f32 samples in [-1.0, 1.0].
///
/// A trailing odd byte is ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Offline high-quality resampling pass over a complete chunk, used when a
/// playback chunk's rate differs from the output device rate.
///
/// The chunk is processed in fixed-size pieces; the zero-padded tail is
/// trimmed back to the expected output length.
pub fn resample_chunk(samples: &[f32], in_rate: u32, out_rate: u32) -> Result<Vec<f32>> {
    if in_rate == out_rate {
        return Ok(samples.to_vec());
    }
    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let mut resampler = FftFixedIn::<f32>::new(
        in_rate as usize,
        out_rate as usize,
        RESAMPLER_CHUNK_SIZE,
        1,
        1,
    )
    .map_err(|e| anyhow!("Failed to create resampler: {}", e))?;

    let mut output = Vec::new();
    let mut input_pos = 0;

    while input_pos + RESAMPLER_CHUNK_SIZE <= samples.len() {
        let chunk = &samples[input_pos..input_pos + RESAMPLER_CHUNK_SIZE];
        if let Ok(resampled) = resampler.process(&[chunk], None) {
            output.extend_from_slice(&resampled[0]);
        }
        input_pos += RESAMPLER_CHUNK_SIZE;
    }

    // Pad the remainder with zeros, then trim the output back so the
    // padding does not stretch the chunk.
    if input_pos < samples.len() {
        let remaining = samples.len() - input_pos;
        let mut last_chunk = vec![0.0; RESAMPLER_CHUNK_SIZE];
        last_chunk[..remaining].copy_from_slice(&samples[input_pos..]);
        if let Ok(resampled) = resampler.process(&[last_chunk.as_slice()], None) {
            let out_len = (remaining as f64 * (out_rate as f64 / in_rate as f64)).round() as usize;
            output.extend_from_slice(&resampled[0][..out_len.min(resampled[0].len())]);
        }
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_identity() {
        let resampler = BlockResampler::new(16_000, 16_000);
        let block = vec![0.1, -0.2, 0.3, 0.5];
        assert_eq!(resampler.process(&block), block);
    }

    #[test]
    fn test_output_length_matches_ratio() {
        // 48k -> 16k: exactly a third
        let resampler = BlockResampler::new(48_000, 16_000);
        assert_eq!(resampler.process(&vec![0.0; 4096]).len(), 1365);

        // 44.1k -> 16k
        let resampler = BlockResampler::new(44_100, 16_000);
        let out = resampler.process(&vec![0.0; 4096]);
        let expected = (4096.0 * 16_000.0 / 44_100.0_f64).round() as usize;
        assert!((out.len() as i64 - expected as i64).abs() <= 1);

        // Upsampling
        let resampler = BlockResampler::new(16_000, 24_000);
        assert_eq!(resampler.process(&vec![0.0; 1000]).len(), 1500);
    }

    #[test]
    fn test_constant_signal_stays_constant() {
        let resampler = BlockResampler::new(48_000, 16_000);
        let out = resampler.process(&vec![0.25; 3000]);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_empty_block() {
        let resampler = BlockResampler::new(48_000, 16_000);
        assert!(resampler.process(&[]).is_empty());
    }

    #[test]
    fn test_quantize_clamps_and_rounds() {
        let bytes = quantize_pcm16(&[0.0, 1.0, -1.0, 2.0, -2.0]);
        assert_eq!(bytes.len(), 10);
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        assert_eq!(samples, vec![0, 32767, -32768, 32767, -32768]);
    }

    #[test]
    fn test_pcm16_round_trip() {
        let original = vec![0.0, 0.5, -0.5, 0.99, -0.99];
        let decoded = decode_pcm16(&quantize_pcm16(&original));
        assert_eq!(decoded.len(), original.len());
        for (a, b) in original.iter().zip(decoded.iter()) {
            assert!((a - b).abs() < 1.0 / 32000.0, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_decode_ignores_trailing_byte() {
        assert_eq!(decode_pcm16(&[0, 0, 7]).len(), 1);
    }

    #[test]
    fn test_resample_chunk_passthrough() {
        let samples = vec![0.5; 100];
        let out = resample_chunk(&samples, 24_000, 24_000).unwrap();
        assert_eq!(out, samples);
    }

    #[test]
    fn test_resample_chunk_length() {
        // Integer ratio keeps the length math exact: 24k -> 48k doubles.
        let samples = vec![0.0; 4800];
        let out = resample_chunk(&samples, 24_000, 48_000).unwrap();
        assert_eq!(out.len(), 9600);
    }
}
