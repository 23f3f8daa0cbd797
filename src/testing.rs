//! In-memory devices and transport used by the unit tests.

use crate::devices::DeviceProvider;
use crate::error::{DeviceError, DeviceKind, LiveError, Result};
use crate::events::{EventSender, SessionEvent, TransportEvent};
use crate::media_in::{AudioCaptureEncoder, AudioInput, VideoSource};
use crate::playback::{AudioOutput, InboundAudioBuffer, SourceId};
use crate::protocol::{ClientMessage, Setup};
use crate::transport::{Connector, Transport};
use image::RgbaImage;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct OutputState {
    time: f64,
    played: Vec<(SourceId, f64)>,
    stopped: Vec<SourceId>,
    flushes: usize,
    closed: usize,
}

/// Output device whose clock only moves when the test says so.
#[derive(Debug, Clone, Default)]
pub struct ManualOutput {
    state: Arc<Mutex<OutputState>>,
}

impl ManualOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_time(&self, time: f64) {
        self.state.lock().unwrap().time = time;
    }

    pub fn played(&self) -> Vec<(SourceId, f64)> {
        self.state.lock().unwrap().played.clone()
    }

    pub fn stopped(&self) -> Vec<SourceId> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn flushes(&self) -> usize {
        self.state.lock().unwrap().flushes
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().closed
    }
}

impl AudioOutput for ManualOutput {
    fn current_time(&self) -> f64 {
        self.state.lock().unwrap().time
    }

    fn play(&mut self, id: SourceId, _buffer: InboundAudioBuffer, start_at: f64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed > 0 {
            return Err(LiveError::device(
                DeviceKind::Speaker,
                DeviceError::Unavailable("closed".to_string()),
            ));
        }
        state.played.push((id, start_at));
        Ok(())
    }

    fn stop(&mut self, id: SourceId) {
        self.state.lock().unwrap().stopped.push(id);
    }

    fn flush(&mut self) {
        self.state.lock().unwrap().flushes += 1;
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closed += 1;
    }
}

#[derive(Debug, Default)]
struct MicState {
    events: Option<EventSender>,
    releases: usize,
}

/// Microphone that records start/release and lets the test push blocks.
#[derive(Debug, Clone, Default)]
pub struct MockMicrophone {
    state: Arc<Mutex<MicState>>,
}

impl MockMicrophone {
    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().events.is_some()
    }

    pub fn releases(&self) -> usize {
        self.state.lock().unwrap().releases
    }

    /// Feed one capture block as if the device callback fired.
    pub fn capture(&self, block: &[f32]) -> bool {
        let events = self.state.lock().unwrap().events.clone();
        match events {
            Some(events) => events.send(SessionEvent::Audio(AudioCaptureEncoder::new(block.len()).encode(block))),
            None => false,
        }
    }
}

impl AudioInput for MockMicrophone {
    fn start(&mut self, _encoder: AudioCaptureEncoder, events: EventSender) -> Result<()> {
        self.state.lock().unwrap().events = Some(events);
        Ok(())
    }

    fn release(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.events = None;
        state.releases += 1;
    }
}

/// Camera that always has a small frame ready.
#[derive(Debug, Default)]
pub struct MockCamera {
    releases: Mutex<usize>,
}

impl MockCamera {
    pub fn releases(&self) -> usize {
        *self.releases.lock().unwrap()
    }
}

impl VideoSource for MockCamera {
    fn ready_frame(&self) -> Option<RgbaImage> {
        Some(RgbaImage::from_pixel(64, 48, image::Rgba([10, 20, 30, 255])))
    }

    fn release(&self) {
        *self.releases.lock().unwrap() += 1;
    }
}

/// Device provider backed by the mocks above.
#[derive(Clone)]
pub struct MockDevices {
    pub microphone: MockMicrophone,
    pub camera: Arc<MockCamera>,
    pub speaker: ManualOutput,
    pub microphone_error: Option<DeviceError>,
    pub camera_error: Option<DeviceError>,
}

impl Default for MockDevices {
    fn default() -> Self {
        Self {
            microphone: MockMicrophone::default(),
            camera: Arc::new(MockCamera::default()),
            speaker: ManualOutput::new(),
            microphone_error: None,
            camera_error: None,
        }
    }
}

impl DeviceProvider for MockDevices {
    fn microphone(&self, _block_size: usize) -> std::result::Result<Box<dyn AudioInput>, DeviceError> {
        match &self.microphone_error {
            Some(e) => Err(e.clone()),
            None => Ok(Box::new(self.microphone.clone())),
        }
    }

    fn camera(&self) -> std::result::Result<Arc<dyn VideoSource>, DeviceError> {
        match &self.camera_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.camera.clone()),
        }
    }

    fn speaker(&self, _events: EventSender) -> std::result::Result<Box<dyn AudioOutput>, DeviceError> {
        Ok(Box::new(self.speaker.clone()))
    }
}

#[derive(Debug, Default)]
struct TransportState {
    setups: Vec<Setup>,
    events: Option<EventSender>,
    sent: Vec<ClientMessage>,
    closes: usize,
    fail_connect: bool,
}

/// Connector that hands out an in-memory transport and keeps its event sender
/// so the test can play the server's part.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<TransportState>>,
}

impl MockConnector {
    pub fn failing() -> Self {
        let connector = Self::default();
        connector.state.lock().unwrap().fail_connect = true;
        connector
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().setups.len()
    }

    pub fn last_setup(&self) -> Option<Setup> {
        self.state.lock().unwrap().setups.last().cloned()
    }

    pub fn emit(&self, event: TransportEvent) -> bool {
        let events = self.state.lock().unwrap().events.clone();
        events.is_some_and(|events| events.send(SessionEvent::Transport(event)))
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }
}

impl Connector for MockConnector {
    fn connect(&self, setup: Setup, events: EventSender) -> Result<Box<dyn Transport>> {
        let mut state = self.state.lock().unwrap();
        state.setups.push(setup);
        if state.fail_connect {
            return Err(LiveError::ConnectionClosed);
        }
        state.events = Some(events);
        Ok(Box::new(MockTransport {
            state: self.state.clone(),
        }))
    }
}

struct MockTransport {
    state: Arc<Mutex<TransportState>>,
}

impl Transport for MockTransport {
    fn send(&mut self, message: ClientMessage) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closes > 0 {
            return Err(LiveError::ConnectionClosed);
        }
        state.sent.push(message);
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closes += 1;
    }
}
