//! Frame type and pixel conversion: YUYV/Y16 decoding and JPEG encoding.

use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

/// Pixel layout of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Packed 8-bit RGB (3 bytes/pixel).
    Rgb8,
    /// 8-bit grayscale (1 byte/pixel).
    Gray8,
}

impl FrameFormat {
    pub fn channels(self) -> usize {
        match self {
            Self::Rgb8 => 3,
            Self::Gray8 => 1,
        }
    }

    fn color_type(self) -> ExtendedColorType {
        match self {
            Self::Rgb8 => ExtendedColorType::Rgb8,
            Self::Gray8 => ExtendedColorType::L8,
        }
    }
}

/// A captured camera frame. Immutable once built; shared as `Arc<Frame>`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub captured_at: DateTime<Utc>,
    pub sequence: u32,
}

impl Frame {
    /// Build a frame, checking that `data` holds exactly one full image.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: FrameFormat,
        sequence: u32,
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * format.channels();
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            format,
            captured_at: Utc::now(),
            sequence,
        })
    }

    /// Encode the frame as a baseline JPEG.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode(&self.data, self.width, self.height, self.format.color_type())
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(out)
    }
}

/// Convert packed YUYV (4:2:2) to RGB24 using BT.601 integer coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share
/// the chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = width as usize * height as usize;
    let expected = pixels * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity(pixels * 3);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

/// Downscale 16-bit little-endian grayscale to 8 bits (keep the high byte).
pub fn y16_to_gray(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = width as usize * height as usize;
    let expected = pixels * 2;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(buf[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("JPEG encoding failed: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        // 2x1 image: [Y0=128, U=128, Y1=128, V=128]
        let rgb = yuyv_to_rgb(&[128, 128, 128, 128], 2, 1).unwrap();
        assert_eq!(rgb.len(), 6);
        assert!(rgb.iter().all(|&c| c == rgb[0]));
        assert_eq!(rgb[0], 130);
    }

    #[test]
    fn test_yuyv_black_and_white_levels() {
        let rgb = yuyv_to_rgb(&[16, 128, 235, 128], 2, 1).unwrap();
        assert_eq!(&rgb[..3], &[0, 0, 0]);
        assert_eq!(&rgb[3..], &[255, 255, 255]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let result = yuyv_to_rgb(&[100, 128], 2, 1);
        assert!(matches!(
            result,
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        let gray = y16_to_gray(&[0x34, 0x12, 0xff, 0xab], 2, 1).unwrap();
        assert_eq!(gray, vec![0x12, 0xab]);
    }

    #[test]
    fn test_frame_rejects_partial_buffer() {
        let result = Frame::new(vec![0u8; 10], 2, 2, FrameFormat::Rgb8, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_encode_jpeg_has_soi_marker() {
        let frame = Frame::new(vec![90u8; 16 * 16 * 3], 16, 16, FrameFormat::Rgb8, 1).unwrap();
        let jpeg = frame.encode_jpeg(90).unwrap();
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
    }

    #[test]
    fn test_encode_gray_jpeg() {
        let frame = Frame::new(vec![200u8; 8 * 8], 8, 8, FrameFormat::Gray8, 1).unwrap();
        assert!(!frame.encode_jpeg(75).unwrap().is_empty());
    }
}
