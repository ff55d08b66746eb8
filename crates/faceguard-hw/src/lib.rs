//! faceguard-hw: Camera capture and the continuous frame source.
//!
//! Provides V4L2-based camera access, pixel decoding, and a capture thread
//! that keeps the most recent frame available to readers.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, PixelFormat};
pub use frame::{Frame, FrameError, FrameFormat};
pub use source::{FrameDevice, FrameProvider, FrameSource, SourceError, SourceOptions, SourceState};
