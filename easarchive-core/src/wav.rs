//! Canonical WAV (RIFF/WAVE, PCM) container header.
//!
//! The recorder writes a fixed 44-byte header and patches the two size
//! fields when it closes the file. Until then the sizes disagree with the
//! on-disk length, which is what [`WavHeader::is_finalized`] detects.
//!
//! ```text
//! offset  size  field
//! 0       4     "RIFF"
//! 4       4     riff chunk size (file length - 8)
//! 8       4     "WAVE"
//! 12      4     "fmt "
//! 16      4     fmt chunk size (16 for PCM)
//! 20      2     audio format (1 = PCM)
//! 22      2     channels
//! 24      4     sample rate
//! 28      4     byte rate
//! 32      2     block align
//! 34      2     bits per sample
//! 36      4     "data"
//! 40      4     data chunk size (file length - 44)
//! ```

use crate::error::HeaderError;

/// Magic bytes at offset 0
pub const RIFF_MAGIC: [u8; 4] = *b"RIFF";

/// Magic bytes at offset 8
pub const WAVE_MAGIC: [u8; 4] = *b"WAVE";

/// Format chunk marker at offset 12
pub const FMT_MARKER: [u8; 4] = *b"fmt ";

/// Data chunk marker at offset 36
pub const DATA_MARKER: [u8; 4] = *b"data";

/// Header size in bytes (fixed)
pub const HEADER_SIZE: usize = 44;

/// Parsed canonical WAV header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavHeader {
    /// Declared RIFF chunk size
    pub riff_size: u32,
    /// Audio format (1 = integer PCM)
    pub audio_format: u16,
    /// Number of channels
    pub channels: u16,
    /// Samples per second
    pub sample_rate: u32,
    /// Bits per sample
    pub bits_per_sample: u16,
    /// Declared data chunk size
    pub data_size: u32,
}

impl WavHeader {
    /// Parse the header from the first [`HEADER_SIZE`] bytes of a file.
    pub fn parse(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_SIZE {
            return Err(HeaderError::TooShort {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }

        check_marker(buf, 0, &RIFF_MAGIC)?;
        check_marker(buf, 8, &WAVE_MAGIC)?;
        check_marker(buf, 12, &FMT_MARKER)?;
        check_marker(buf, 36, &DATA_MARKER)?;

        Ok(Self {
            riff_size: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            audio_format: u16::from_le_bytes([buf[20], buf[21]]),
            channels: u16::from_le_bytes([buf[22], buf[23]]),
            sample_rate: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
            bits_per_sample: u16::from_le_bytes([buf[34], buf[35]]),
            data_size: u32::from_le_bytes([buf[40], buf[41], buf[42], buf[43]]),
        })
    }

    /// Serialize a header describing `data_size` bytes of PCM samples.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let block_align = self.channels * (self.bits_per_sample / 8);
        let byte_rate = self.sample_rate * block_align as u32;

        buf[0..4].copy_from_slice(&RIFF_MAGIC);
        buf[4..8].copy_from_slice(&self.riff_size.to_le_bytes());
        buf[8..12].copy_from_slice(&WAVE_MAGIC);
        buf[12..16].copy_from_slice(&FMT_MARKER);
        buf[16..20].copy_from_slice(&16u32.to_le_bytes());
        buf[20..22].copy_from_slice(&self.audio_format.to_le_bytes());
        buf[22..24].copy_from_slice(&self.channels.to_le_bytes());
        buf[24..28].copy_from_slice(&self.sample_rate.to_le_bytes());
        buf[28..32].copy_from_slice(&byte_rate.to_le_bytes());
        buf[32..34].copy_from_slice(&block_align.to_le_bytes());
        buf[34..36].copy_from_slice(&self.bits_per_sample.to_le_bytes());
        buf[36..40].copy_from_slice(&DATA_MARKER);
        buf[40..44].copy_from_slice(&self.data_size.to_le_bytes());
        buf
    }

    /// Header for a mono 16-bit 48 kHz recording holding `data_size` bytes,
    /// the layout the recorder produces.
    pub fn pcm16_mono(data_size: u32) -> Self {
        Self {
            riff_size: data_size.saturating_add((HEADER_SIZE - 8) as u32),
            audio_format: 1,
            channels: 1,
            sample_rate: 48_000,
            bits_per_sample: 16,
            data_size,
        }
    }

    /// True when both declared sizes agree with the file's actual length.
    pub fn is_finalized(&self, file_len: u64) -> bool {
        u64::from(self.riff_size) + 8 == file_len
            && HEADER_SIZE as u64 + u64::from(self.data_size) == file_len
    }
}

fn check_marker(buf: &[u8], offset: usize, expected: &[u8; 4]) -> Result<(), HeaderError> {
    let actual = &buf[offset..offset + 4];
    if actual != expected {
        return Err(HeaderError::InvalidMarker {
            offset,
            expected: String::from_utf8_lossy(expected).into_owned(),
            actual: String::from_utf8_lossy(actual).into_owned(),
        });
    }
    Ok(())
}

/// Decide finalization from the leading bytes of a file and its length.
///
/// Any header problem counts as "not finalized": a writer that has not yet
/// flushed its header looks exactly like that.
pub fn is_finalized(header_bytes: &[u8], file_len: u64) -> bool {
    match WavHeader::parse(header_bytes) {
        Ok(header) => header.is_finalized(file_len),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_with(header: &WavHeader, payload_len: usize) -> Vec<u8> {
        let mut bytes = header.to_bytes().to_vec();
        bytes.resize(HEADER_SIZE + payload_len, 0x11);
        bytes
    }

    #[test]
    fn test_parse_canonical_header() {
        let bytes = file_with(&WavHeader::pcm16_mono(200), 200);
        let header = WavHeader::parse(&bytes).unwrap();
        assert_eq!(header.riff_size, 236);
        assert_eq!(header.data_size, 200);
        assert_eq!(header.channels, 1);
        assert_eq!(header.sample_rate, 48_000);
        assert!(header.is_finalized(bytes.len() as u64));
    }

    #[test]
    fn test_short_file_is_not_finalized() {
        assert!(!is_finalized(b"RIFF", 4));
        assert!(matches!(
            WavHeader::parse(&[0u8; 10]),
            Err(HeaderError::TooShort { actual: 10, .. })
        ));
    }

    #[test]
    fn test_bad_marker_is_rejected() {
        let mut bytes = file_with(&WavHeader::pcm16_mono(8), 8);
        bytes[8..12].copy_from_slice(b"AVI ");
        assert!(matches!(
            WavHeader::parse(&bytes),
            Err(HeaderError::InvalidMarker { offset: 8, .. })
        ));
        assert!(!is_finalized(&bytes, bytes.len() as u64));
    }

    #[test]
    fn test_writer_still_appending() {
        // Header written with zero sizes, samples already on disk
        let bytes = file_with(&WavHeader::pcm16_mono(0), 512);
        assert!(!is_finalized(&bytes, bytes.len() as u64));

        // Header patched on close: immediately finalized
        let bytes = file_with(&WavHeader::pcm16_mono(512), 512);
        assert!(is_finalized(&bytes, bytes.len() as u64));

        // More bytes appended after the patch
        assert!(!is_finalized(&bytes, bytes.len() as u64 + 2));
    }
}
