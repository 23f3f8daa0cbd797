//! Acquisition of the capture and playback devices a session owns.

use crate::error::{DeviceError, DeviceKind, LiveError, Result};
use crate::events::EventSender;
use crate::media_in::{AudioInput, VideoSource};
use crate::playback::AudioOutput;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Asks the user before a device is opened.
pub trait PermissionPrompt: Send + Sync {
    fn request(&self, kind: DeviceKind) -> bool;
}

/// Grants everything. Used by the headless runner.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoGrant;

impl PermissionPrompt for AutoGrant {
    fn request(&self, _kind: DeviceKind) -> bool {
        true
    }
}

/// Opens devices. Calls may block and are made off the session task.
pub trait DeviceProvider: Send + Sync {
    fn microphone(&self, block_size: usize) -> std::result::Result<Box<dyn AudioInput>, DeviceError>;

    fn camera(&self) -> std::result::Result<Arc<dyn VideoSource>, DeviceError>;

    /// The output pipeline. `events` receives its playback-ended notifications.
    fn speaker(&self, events: EventSender) -> std::result::Result<Box<dyn AudioOutput>, DeviceError>;
}

/// Everything acquired for one session. Owned by the session controller,
/// which releases each handle exactly once.
pub struct AcquiredDevices {
    pub microphone: Box<dyn AudioInput>,
    pub speaker: Box<dyn AudioOutput>,
    pub camera: Option<Arc<dyn VideoSource>>,
    /// Set when video was requested but could not be opened.
    pub camera_error: Option<DeviceError>,
}

impl AcquiredDevices {
    /// Release everything. For devices that arrive after their session ended.
    pub fn release(mut self) {
        self.microphone.release();
        self.speaker.close();
        if let Some(camera) = self.camera.take() {
            camera.release();
        }
    }
}

impl fmt::Debug for AcquiredDevices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquiredDevices")
            .field("camera", &self.camera.is_some())
            .field("camera_error", &self.camera_error)
            .finish_non_exhaustive()
    }
}

/// Open the microphone and speaker, plus the camera when `want_camera`.
///
/// The microphone and speaker are mandatory. A camera that is denied or fails
/// to open only clears video; the result then carries `camera_error`.
pub fn acquire(
    provider: &dyn DeviceProvider,
    prompt: &dyn PermissionPrompt,
    want_camera: bool,
    block_size: usize,
    events: EventSender,
) -> Result<AcquiredDevices> {
    if !prompt.request(DeviceKind::Microphone) {
        return Err(LiveError::device(DeviceKind::Microphone, DeviceError::PermissionDenied));
    }
    let mut microphone = provider
        .microphone(block_size)
        .map_err(|e| LiveError::device(DeviceKind::Microphone, e))?;

    let speaker = match provider.speaker(events) {
        Ok(speaker) => speaker,
        Err(e) => {
            microphone.release();
            return Err(LiveError::device(DeviceKind::Speaker, e));
        }
    };

    let (camera, camera_error) = if !want_camera {
        (None, None)
    } else if !prompt.request(DeviceKind::Camera) {
        warn!("Camera permission denied, continuing with audio only");
        (None, Some(DeviceError::PermissionDenied))
    } else {
        match provider.camera() {
            Ok(camera) => (Some(camera), None),
            Err(e) => {
                warn!("Camera unavailable ({}), continuing with audio only", e);
                (None, Some(e))
            }
        }
    };

    info!(
        "Devices acquired: microphone, speaker{}",
        if camera.is_some() { ", camera" } else { "" }
    );
    Ok(AcquiredDevices {
        microphone,
        speaker,
        camera,
        camera_error,
    })
}

/// The host's devices: PulseAudio for sound, screen capture for video.
///
/// Each device is only available when the crate is built with the matching
/// feature (`pulse`, `capture`).
#[derive(Debug, Clone)]
pub struct SystemDevices {
    pub app_name: String,
}

impl Default for SystemDevices {
    fn default() -> Self {
        Self {
            app_name: "mmlive".to_string(),
        }
    }
}

impl DeviceProvider for SystemDevices {
    #[cfg(feature = "pulse")]
    fn microphone(&self, block_size: usize) -> std::result::Result<Box<dyn AudioInput>, DeviceError> {
        let microphone = crate::media_in::audio::PulseMicrophone::open(&self.app_name, None, block_size)?;
        Ok(Box::new(microphone))
    }

    #[cfg(not(feature = "pulse"))]
    fn microphone(&self, _block_size: usize) -> std::result::Result<Box<dyn AudioInput>, DeviceError> {
        Err(DeviceError::Unavailable("built without the `pulse` feature".to_string()))
    }

    #[cfg(feature = "capture")]
    fn camera(&self) -> std::result::Result<Arc<dyn VideoSource>, DeviceError> {
        let source = crate::media_in::video::ScreenSource::open().map_err(|e| DeviceError::Unavailable(format!("{:#}", e)))?;
        Ok(Arc::new(source))
    }

    #[cfg(not(feature = "capture"))]
    fn camera(&self) -> std::result::Result<Arc<dyn VideoSource>, DeviceError> {
        Err(DeviceError::Unavailable("built without the `capture` feature".to_string()))
    }

    #[cfg(feature = "pulse")]
    fn speaker(&self, events: EventSender) -> std::result::Result<Box<dyn AudioOutput>, DeviceError> {
        let speaker = crate::speaker::PulseSpeaker::open(&self.app_name, None, events)?;
        Ok(Box::new(speaker))
    }

    #[cfg(not(feature = "pulse"))]
    fn speaker(&self, _events: EventSender) -> std::result::Result<Box<dyn AudioOutput>, DeviceError> {
        Err(DeviceError::Unavailable("built without the `pulse` feature".to_string()))
    }
}
