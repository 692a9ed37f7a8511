//! Audio decoding for the supported recording formats

use super::{resample_to_target, AudioFormat};
use crate::error::{PipelineError, Result};
use std::path::Path;

/// Decoded audio data
#[derive(Debug, Clone)]
pub struct AudioData {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_ms: u32,
}

impl AudioData {
    /// Convert to mono by averaging channels
    pub fn to_mono(&self) -> Vec<f32> {
        if self.channels == 1 {
            return self.samples.clone();
        }

        let mut mono = Vec::with_capacity(self.samples.len() / self.channels as usize);
        for chunk in self.samples.chunks(self.channels as usize) {
            let avg: f32 = chunk.iter().sum::<f32>() / chunk.len() as f32;
            mono.push(avg);
        }
        mono
    }

    /// Duration in seconds
    pub fn duration_s(&self) -> f64 {
        self.duration_ms as f64 / 1000.0
    }
}

fn decode_err(path: &Path, reason: impl std::fmt::Display) -> PipelineError {
    PipelineError::Decode {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Decode an audio file to mono at the target sample rate.
///
/// `target_sample_rate` of 0 keeps the native rate.
pub fn decode_audio(path: &Path, target_sample_rate: u32) -> Result<AudioData> {
    if !path.exists() {
        return Err(decode_err(path, "file not found"));
    }

    let format = AudioFormat::from_path(path);
    let mut audio_data = match format {
        AudioFormat::Wav => decode_wav(path)?,
        AudioFormat::Flac => decode_flac(path)?,
        AudioFormat::Ogg => decode_ogg(path)?,
        AudioFormat::Mp3 => decode_mp3(path)?,
        AudioFormat::Unknown => {
            return Err(decode_err(path, "unsupported audio format"));
        }
    };

    if audio_data.sample_rate == 0 || audio_data.samples.is_empty() {
        return Err(decode_err(path, "no audio frames decoded"));
    }

    let target = if target_sample_rate == 0 {
        audio_data.sample_rate
    } else {
        target_sample_rate
    };

    if audio_data.sample_rate != target {
        let mono = audio_data.to_mono();
        audio_data.samples = resample_to_target(&mono, audio_data.sample_rate, target);
        audio_data.sample_rate = target;
        audio_data.channels = 1;
    } else if audio_data.channels > 1 {
        audio_data.samples = audio_data.to_mono();
        audio_data.channels = 1;
    }

    audio_data.duration_ms =
        (audio_data.samples.len() as f64 / audio_data.sample_rate as f64 * 1000.0) as u32;

    Ok(audio_data)
}

/// Decode WAV file
fn decode_wav(path: &Path) -> Result<AudioData> {
    let mut reader = hound::WavReader::open(path).map_err(|e| decode_err(path, e))?;

    let spec = reader.spec();
    let sample_rate = spec.sample_rate;
    let channels = spec.channels;

    // Read samples and convert to f32
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| decode_err(path, e))?,
        hound::SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| decode_err(path, e))?
        }
    };

    let duration_ms =
        (samples.len() as f64 / (sample_rate * channels as u32) as f64 * 1000.0) as u32;

    Ok(AudioData {
        samples,
        sample_rate,
        channels,
        duration_ms,
    })
}

/// Decode FLAC file
fn decode_flac(path: &Path) -> Result<AudioData> {
    let mut reader = claxon::FlacReader::open(path).map_err(|e| decode_err(path, e))?;

    let info = reader.streaminfo();
    let sample_rate = info.sample_rate;
    let channels = info.channels as u16;
    let bits_per_sample = info.bits_per_sample;

    let max_val = (1i64 << (bits_per_sample - 1)) as f32;
    let samples: Vec<f32> = reader
        .samples()
        .map(|s| s.map(|v| v as f32 / max_val))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| decode_err(path, e))?;

    let duration_ms =
        (samples.len() as f64 / (sample_rate * channels as u32) as f64 * 1000.0) as u32;

    Ok(AudioData {
        samples,
        sample_rate,
        channels,
        duration_ms,
    })
}

/// Decode OGG Vorbis file
fn decode_ogg(path: &Path) -> Result<AudioData> {
    let file = std::fs::File::open(path).map_err(|e| decode_err(path, e))?;

    let mut reader =
        lewton::inside_ogg::OggStreamReader::new(file).map_err(|e| decode_err(path, e))?;

    let sample_rate = reader.ident_hdr.audio_sample_rate;
    let channels = reader.ident_hdr.audio_channels as u16;

    let mut samples = Vec::new();
    while let Some(packet) = reader
        .read_dec_packet_itl()
        .map_err(|e| decode_err(path, e))?
    {
        // Convert i16 to f32
        for &sample in &packet {
            samples.push(sample as f32 / 32768.0);
        }
    }

    let duration_ms =
        (samples.len() as f64 / (sample_rate * channels as u32) as f64 * 1000.0) as u32;

    Ok(AudioData {
        samples,
        sample_rate,
        channels,
        duration_ms,
    })
}

/// Decode MP3 file
fn decode_mp3(path: &Path) -> Result<AudioData> {
    let data = std::fs::read(path).map_err(|e| decode_err(path, e))?;

    let mut decoder = minimp3::Decoder::new(&data[..]);
    let mut samples = Vec::new();
    let mut sample_rate = 0;
    let mut channels = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if sample_rate == 0 {
                    sample_rate = frame.sample_rate as u32;
                    channels = frame.channels as u16;
                }
                // Convert i16 to f32
                for &sample in &frame.data {
                    samples.push(sample as f32 / 32768.0);
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(decode_err(path, format!("MP3 decode error: {}", e))),
        }
    }

    if sample_rate == 0 {
        return Err(decode_err(path, "no MP3 frames found"));
    }

    let duration_ms =
        (samples.len() as f64 / (sample_rate * channels as u32) as f64 * 1000.0) as u32;

    Ok(AudioData {
        samples,
        sample_rate,
        channels,
        duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_test_wav(path: &Path, sample_rate: u32, samples: &[f32]) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample((s * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_decode_wav_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let samples: Vec<f32> = (0..16000)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16000.0).sin() * 0.5)
            .collect();
        write_test_wav(&path, 16000, &samples);

        let audio = decode_audio(&path, 0).unwrap();
        assert_eq!(audio.sample_rate, 16000);
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.samples.len(), 16000);
        assert_eq!(audio.duration_ms, 1000);
    }

    #[test]
    fn test_decode_resamples_to_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_test_wav(&path, 32000, &vec![0.25; 32000]);

        let audio = decode_audio(&path, 16000).unwrap();
        assert_eq!(audio.sample_rate, 16000);
        assert!((audio.samples.len() as i64 - 16000).abs() <= 1);
    }

    #[test]
    fn test_missing_file_is_decode_error() {
        let err = decode_audio(Path::new("/nonexistent/rec.wav"), 0);
        assert!(matches!(err, Err(PipelineError::Decode { .. })));
    }

    #[test]
    fn test_unknown_extension_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "not audio").unwrap();
        let err = decode_audio(&path, 0);
        assert!(matches!(err, Err(PipelineError::Decode { .. })));
    }

    #[test]
    fn test_to_mono_averages_channels() {
        let audio = AudioData {
            samples: vec![1.0, 0.0, 0.5, 0.5],
            sample_rate: 16000,
            channels: 2,
            duration_ms: 0,
        };
        let mono = audio.to_mono();
        assert_eq!(mono, vec![0.5, 0.5]);
    }
}
