//! Whole-file and raw-stream audio input.
//!
//! The decoder consumes 16-bit mono PCM at the configured `samprate`. This
//! module gets recorded audio into that shape:
//!
//! - [`read_wav`] decodes a WAV file (`hound`), downmixes to mono and
//!   converts the sample rate with [`resample::RateConverter`] when needed.
//! - [`RawSampleReader`] pulls little-endian 16-bit samples out of any
//!   `Read` in bounded chunks, carrying an odd trailing byte between reads.

pub mod resample;

use std::io::{ErrorKind, Read};
use std::path::Path;

use tracing::{debug, info};

use crate::error::{DecoderError, Result};

use self::resample::RateConverter;

const RESAMPLE_CHUNK: usize = 1024;

fn wav_error(path: &Path, err: hound::Error) -> DecoderError {
    match err {
        hound::Error::IoError(e) => DecoderError::Io(e),
        other => DecoderError::Other(anyhow::Error::new(other).context(format!("reading {}", path.display()))),
    }
}

/// Decodes a WAV file into mono i16 samples at `target_rate`.
pub fn read_wav(path: &Path, target_rate: u32) -> Result<Vec<i16>> {
    let mut reader = hound::WavReader::open(path).map_err(|e| wav_error(path, e))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| wav_error(path, e))?,
        hound::SampleFormat::Int if spec.bits_per_sample <= 16 => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| wav_error(path, e))?,
        hound::SampleFormat::Int => {
            let max = ((1_i64 << (spec.bits_per_sample - 1)) - 1) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| wav_error(path, e))?
        }
    };

    let mono: Vec<f32> = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    let converted = if spec.sample_rate == target_rate {
        mono
    } else {
        info!(
            path = %path.display(),
            from = spec.sample_rate,
            to = target_rate,
            "converting WAV sample rate"
        );
        let mut rc = RateConverter::new(spec.sample_rate, target_rate, RESAMPLE_CHUNK)?;
        let mut out = rc.process(&mono)?;
        out.extend(rc.finish()?);
        out
    };

    debug!(
        path = %path.display(),
        channels,
        bits = spec.bits_per_sample,
        samples = converted.len(),
        "WAV decoded"
    );
    Ok(converted.into_iter().map(to_i16).collect())
}

fn to_i16(v: f32) -> i16 {
    (v * i16::MAX as f32).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Decodes little-endian 16-bit samples; a trailing odd byte is ignored.
pub fn samples_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Reads a headerless 16-bit little-endian stream in chunks.
#[derive(Debug)]
pub struct RawSampleReader<R> {
    inner: R,
    carry: Option<u8>,
    bytes: Vec<u8>,
}

impl<R: Read> RawSampleReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            carry: None,
            bytes: Vec::new(),
        }
    }

    /// Reads up to `max_samples` samples. An empty result means end of stream.
    pub fn read_chunk(&mut self, max_samples: usize) -> Result<Vec<i16>> {
        let want = max_samples.max(1) * 2;
        self.bytes.clear();
        if let Some(b) = self.carry.take() {
            self.bytes.push(b);
        }
        let mut buf = vec![0u8; want - self.bytes.len()];
        while self.bytes.len() < want {
            let room = want - self.bytes.len();
            match self.inner.read(&mut buf[..room]) {
                Ok(0) => break,
                Ok(n) => self.bytes.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if self.bytes.len() % 2 == 1 {
            self.carry = self.bytes.pop();
        }
        Ok(samples_from_le_bytes(&self.bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Hands out at most `step` bytes per read.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn le_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn le_bytes_ignore_trailing_odd_byte() {
        assert_eq!(samples_from_le_bytes(&[0x01, 0x00, 0xff, 0xff, 0x07]), vec![1, -1]);
    }

    #[test]
    fn raw_reader_carries_odd_bytes_between_reads() {
        let samples: Vec<i16> = (0..100).map(|i| (i * 331 - 9000) as i16).collect();
        let mut reader = RawSampleReader::new(Trickle {
            data: le_bytes(&samples),
            pos: 0,
            step: 3,
        });
        let mut out = Vec::new();
        loop {
            let chunk = reader.read_chunk(7).expect("read chunk");
            if chunk.is_empty() {
                break;
            }
            assert!(chunk.len() <= 7);
            out.extend(chunk);
        }
        assert_eq!(out, samples);
    }

    #[test]
    fn raw_reader_empty_stream_ends_immediately() {
        let mut reader = RawSampleReader::new(Cursor::new(Vec::<u8>::new()));
        assert!(reader.read_chunk(256).expect("read chunk").is_empty());
    }

    fn write_wav(path: &Path, rate: u32, channels: u16, frames: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
        for &s in frames {
            for _ in 0..channels {
                writer.write_sample(s).expect("write sample");
            }
        }
        writer.finalize().expect("finalize wav");
    }

    #[test]
    fn wav_at_target_rate_is_sample_exact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mono.wav");
        let samples: Vec<i16> = (0..800).map(|i| ((i * 97) % 20_000 - 10_000) as i16).collect();
        write_wav(&path, 16_000, 1, &samples);
        assert_eq!(read_wav(&path, 16_000).expect("read wav"), samples);
    }

    #[test]
    fn stereo_wav_is_downmixed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stereo.wav");
        let samples: Vec<i16> = vec![1000, -2000, 3000, 0];
        write_wav(&path, 16_000, 2, &samples);
        assert_eq!(read_wav(&path, 16_000).expect("read wav"), samples);
    }

    #[test]
    fn wav_at_other_rate_is_converted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("48k.wav");
        let samples: Vec<i16> = (0..4_800)
            .map(|i| ((i as f32 * 0.03).sin() * 8_000.0) as i16)
            .collect();
        write_wav(&path, 48_000, 1, &samples);
        let out = read_wav(&path, 16_000).expect("read wav");
        assert!((out.len() as isize - 1_600).abs() <= 1, "len={}", out.len());
    }

    #[test]
    fn missing_wav_is_an_io_error() {
        let err = read_wav(Path::new("/nonexistent/voxdec.wav"), 16_000).expect_err("missing file");
        assert!(matches!(err, DecoderError::Io(_)), "{err:?}");
    }
}
