//! Media input capture module

pub mod audio;
pub mod video;

pub use audio::{AudioCaptureEncoder, AudioInput, OutboundAudioChunk};
pub use video::{spawn_frame_sampler, FrameSampler, OutboundImageChunk, VideoSource};
