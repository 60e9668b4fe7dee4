//! Wire protocols: the SMTP disguise and the multiplex frame format

pub mod frames;
pub mod smtp;

pub use frames::{Frame, FrameCodec, FrameError, FrameType};
