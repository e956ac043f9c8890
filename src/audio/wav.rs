//! # WAV Encoding
//!
//! Packages a normalized frame into a 16-bit PCM RIFF/WAVE container for
//! backends that want a file instead of raw samples.
//!
//! ## Layout (44-byte header, little-endian):
//! - `0..4`   "RIFF", `4..8` total length - 8, `8..12` "WAVE"
//! - `12..16` "fmt ", `16..20` 16, `20..22` format 1 (PCM), `22..24` channels
//! - `24..28` sample rate, `28..32` byte rate, `32..34` block align, `34..36` bits
//! - `36..40` "data", `40..44` data length, then the samples

use crate::audio::frame::{AudioFrame, TARGET_CHANNELS, TARGET_SAMPLE_RATE};
use byteorder::{LittleEndian, WriteBytesExt};

/// Size of the RIFF/WAVE header written by `encode_wav`.
pub const WAV_HEADER_LEN: usize = 44;

const BITS_PER_SAMPLE: u16 = 16;
const BYTES_PER_SAMPLE: u32 = 2;

/// Serialize a frame as mono 16-bit 16 kHz WAV.
pub fn encode_wav(frame: &AudioFrame) -> Vec<u8> {
    let channels = TARGET_CHANNELS as u32;
    let data_len = frame.len() as u32 * BYTES_PER_SAMPLE * channels;
    let total_len = WAV_HEADER_LEN as u32 + data_len;

    let mut out = Vec::with_capacity(total_len as usize);

    // Writes into a Vec cannot fail, so the io::Results are discarded.
    let _ = write_header(&mut out, total_len, data_len);
    for &sample in frame.samples() {
        let _ = out.write_i16::<LittleEndian>(quantize(sample));
    }

    out
}

fn write_header(out: &mut Vec<u8>, total_len: u32, data_len: u32) -> std::io::Result<()> {
    let channels = TARGET_CHANNELS;

    out.extend_from_slice(b"RIFF");
    out.write_u32::<LittleEndian>(total_len - 8)?;
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.write_u32::<LittleEndian>(16)?;
    out.write_u16::<LittleEndian>(1)?; // PCM
    out.write_u16::<LittleEndian>(channels)?;
    out.write_u32::<LittleEndian>(TARGET_SAMPLE_RATE)?;
    out.write_u32::<LittleEndian>(TARGET_SAMPLE_RATE * BYTES_PER_SAMPLE * channels as u32)?;
    out.write_u16::<LittleEndian>(channels * BYTES_PER_SAMPLE as u16)?;
    out.write_u16::<LittleEndian>(BITS_PER_SAMPLE)?;

    out.extend_from_slice(b"data");
    out.write_u32::<LittleEndian>(data_len)?;
    Ok(())
}

/// Convert a float sample to signed 16-bit.
///
/// The sample is clamped to [-1, 1]; negative values scale by 32768 and the
/// rest by 32767, so both extremes land exactly on the i16 limits.
pub fn quantize(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    let scaled = if 0.5 + s < 0.0 { s * 32768.0 } else { s * 32767.0 };
    scaled.round() as i16
}
