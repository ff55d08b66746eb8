//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameFormat};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
/// Frames dropped after STREAMON while auto-exposure settles.
const WARMUP_FRAMES: usize = 3;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, converted to RGB).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
    /// 16-bit little-endian grayscale (2 bytes/pixel).
    Y16,
}

/// V4L2 camera device handle with a streaming capture queue.
///
/// The mmap stream is opened once and stays on for the handle's lifetime.
/// It shares the device handle, so dropping the camera stops streaming and
/// closes the device.
pub struct Camera {
    stream: MmapStream<'static>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `/dev/video{index}` and negotiate a capture format.
    pub fn open(index: u32) -> Result<Self, CameraError> {
        let device_path = format!("/dev/video{index}");
        let device = Device::new(index as usize).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = %device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for colour YUYV; IR-only sensors usually answer with GREY or Y16.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            PixelFormat::Y16
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        for _ in 0..WARMUP_FRAMES {
            stream
                .next()
                .map_err(|e| CameraError::CaptureFailed(format!("failed to start stream: {e}")))?;
        }

        Ok(Self {
            stream,
            width: negotiated.width,
            height: negotiated.height,
            device_path,
            fourcc,
            pixel_format,
        })
    }

    /// Dequeue the next frame, decoding it to RGB or 8-bit gray.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let (width, height, pixel_format) = (self.width, self.height, self.pixel_format);
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        if buf.is_empty() {
            return Err(CameraError::CaptureFailed("device returned no data".into()));
        }

        let (data, format) = decode(pixel_format, width, height, buf)?;
        Frame::new(data, width, height, format, meta.sequence)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }
}

fn decode(
    pixel_format: PixelFormat,
    width: u32,
    height: u32,
    buf: &[u8],
) -> Result<(Vec<u8>, FrameFormat), CameraError> {
    let pixels = (width * height) as usize;
    let convert_err = |e: frame::FrameError| CameraError::CaptureFailed(e.to_string());

    match pixel_format {
        PixelFormat::Yuyv => Ok((
            frame::yuyv_to_rgb(buf, width, height).map_err(convert_err)?,
            FrameFormat::Rgb8,
        )),
        PixelFormat::Grey => {
            if buf.len() < pixels {
                return Err(CameraError::CaptureFailed(format!(
                    "GREY buffer too short: expected {pixels}, got {}",
                    buf.len()
                )));
            }
            Ok((buf[..pixels].to_vec(), FrameFormat::Gray8))
        }
        PixelFormat::Y16 => Ok((
            frame::y16_to_gray(buf, width, height).map_err(convert_err)?,
            FrameFormat::Gray8,
        )),
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path, "camera released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_yuyv_to_rgb() {
        let (data, format) = decode(PixelFormat::Yuyv, 2, 1, &[128, 128, 128, 128]).unwrap();
        assert_eq!(format, FrameFormat::Rgb8);
        assert_eq!(data.len(), 6);
    }

    #[test]
    fn test_decode_grey_truncates_padding() {
        let (data, format) = decode(PixelFormat::Grey, 2, 2, &[1, 2, 3, 4, 0, 0]).unwrap();
        assert_eq!(format, FrameFormat::Gray8);
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_decode_short_buffer() {
        assert!(matches!(
            decode(PixelFormat::Grey, 4, 4, &[0; 8]),
            Err(CameraError::CaptureFailed(_))
        ));
        assert!(decode(PixelFormat::Y16, 4, 4, &[0; 8]).is_err());
    }
}
