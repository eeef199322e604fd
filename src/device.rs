//! Audio device abstraction
//!
//! Thin seams over the platform microphone and speaker. The pipeline only
//! sees the two traits here: blocking fixed-size frame reads/writes plus an
//! idempotent `close` that unblocks any waiter. Device initialization
//! failure is a reported error, never a crash — the call simply does not
//! start.
//!
//! The cpal-backed implementation lives in `cpal_audio` behind the
//! `cpal-audio` feature; the in-memory backend below serves tests and
//! headless environments.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Audio device errors. All of these are user-visible outcomes ("audio
/// unavailable"), not fatal conditions.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("no audio input device available")]
    NoInputDevice,

    #[error("no audio output device available")]
    NoOutputDevice,

    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("audio device is busy: {0}")]
    Busy(String),

    #[error("unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("failed to build audio stream: {0}")]
    Stream(String),
}

/// PCM frame geometry. Frames are 20ms of 16-bit samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpec {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u16,
}

impl FrameSpec {
    /// Frame duration; every frame covers the same wall-clock span.
    pub const FRAME_MILLIS: u64 = 20;

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(Self::FRAME_MILLIS)
    }

    /// Samples per frame across all channels
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize / 50) * self.channels as usize
    }

    /// Frame size in bytes (16-bit samples)
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * 2
    }
}

/// Microphone handle.
pub trait CaptureDevice: Send + Sync {
    /// Block until one fixed-size frame is available, or the device is
    /// closed — in which case `None` signals end of stream, not an error.
    fn read_frame(&self) -> Option<Bytes>;

    /// Release the device. Idempotent; wakes any blocked `read_frame`.
    fn close(&self);
}

/// Speaker/earpiece handle.
pub trait PlaybackDevice: Send + Sync {
    /// Block until the frame is accepted by the device buffer. Returns
    /// `false` once the device is closed.
    fn write_frame(&self, frame: &[u8]) -> bool;

    /// Route output to the loudspeaker instead of the earpiece.
    /// Best-effort; backends without routing ignore it.
    fn set_speaker(&self, enabled: bool);

    /// Release the device. Idempotent; wakes any blocked `write_frame`.
    fn close(&self);
}

/// Factory for per-call device handles. The pipeline borrows devices for
/// the duration of one call and closes them on every exit path.
pub trait AudioBackend: Send + Sync {
    fn open_capture(&self, spec: FrameSpec) -> Result<Arc<dyn CaptureDevice>, DeviceError>;
    fn open_playback(&self, spec: FrameSpec) -> Result<Arc<dyn PlaybackDevice>, DeviceError>;
}

// ============================================================
// In-memory backend
// ============================================================

struct CaptureShared {
    frames: Mutex<VecDeque<Bytes>>,
    cond: Condvar,
    reads: AtomicU64,
    opens: AtomicU64,
    live: AtomicBool,
}

struct PlaybackShared {
    frames: Mutex<Vec<Bytes>>,
    opens: AtomicU64,
    live: AtomicBool,
    speaker: AtomicBool,
}

/// In-memory [`AudioBackend`] for tests and headless environments.
///
/// Capture frames are fed with [`push_capture_frame`](Self::push_capture_frame);
/// played frames are recorded for inspection. Open/close bookkeeping makes
/// device-release assertions possible.
pub struct MemoryBackend {
    capture: Arc<CaptureShared>,
    playback: Arc<PlaybackShared>,
    fail_capture: AtomicBool,
    fail_playback: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            capture: Arc::new(CaptureShared {
                frames: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                reads: AtomicU64::new(0),
                opens: AtomicU64::new(0),
                live: AtomicBool::new(false),
            }),
            playback: Arc::new(PlaybackShared {
                frames: Mutex::new(Vec::new()),
                opens: AtomicU64::new(0),
                live: AtomicBool::new(false),
                speaker: AtomicBool::new(false),
            }),
            fail_capture: AtomicBool::new(false),
            fail_playback: AtomicBool::new(false),
        })
    }

    /// Queue one frame for the capture device to "record"
    pub fn push_capture_frame(&self, frame: Bytes) {
        self.capture.frames.lock().push_back(frame);
        self.capture.cond.notify_all();
    }

    /// Queue `count` copies of `frame`
    pub fn push_capture_frames(&self, count: usize, frame: Bytes) {
        {
            let mut frames = self.capture.frames.lock();
            for _ in 0..count {
                frames.push_back(frame.clone());
            }
        }
        self.capture.cond.notify_all();
    }

    /// Total successful `read_frame` calls across all opens
    pub fn capture_reads(&self) -> u64 {
        self.capture.reads.load(Ordering::SeqCst)
    }

    /// How many times the microphone was opened
    pub fn capture_opens(&self) -> u64 {
        self.capture.opens.load(Ordering::SeqCst)
    }

    /// How many times the speaker was opened
    pub fn playback_opens(&self) -> u64 {
        self.playback.opens.load(Ordering::SeqCst)
    }

    /// Whether a capture handle is currently open
    pub fn is_capture_open(&self) -> bool {
        self.capture.live.load(Ordering::SeqCst)
    }

    /// Whether a playback handle is currently open
    pub fn is_playback_open(&self) -> bool {
        self.playback.live.load(Ordering::SeqCst)
    }

    /// Frames written to the speaker so far
    pub fn played_frames(&self) -> Vec<Bytes> {
        self.playback.frames.lock().clone()
    }

    /// Last speaker-routing flag the playback device saw
    pub fn speaker_enabled(&self) -> bool {
        self.playback.speaker.load(Ordering::SeqCst)
    }

    /// Make the next `open_capture` fail, simulating a revoked permission
    pub fn set_fail_capture(&self, fail: bool) {
        self.fail_capture.store(fail, Ordering::SeqCst);
    }

    /// Make the next `open_playback` fail
    pub fn set_fail_playback(&self, fail: bool) {
        self.fail_playback.store(fail, Ordering::SeqCst);
    }
}

impl AudioBackend for MemoryBackend {
    fn open_capture(&self, _spec: FrameSpec) -> Result<Arc<dyn CaptureDevice>, DeviceError> {
        if self.fail_capture.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied);
        }
        self.capture.opens.fetch_add(1, Ordering::SeqCst);
        self.capture.live.store(true, Ordering::SeqCst);
        Ok(Arc::new(MemoryCapture {
            shared: Arc::clone(&self.capture),
            closed: AtomicBool::new(false),
        }))
    }

    fn open_playback(&self, _spec: FrameSpec) -> Result<Arc<dyn PlaybackDevice>, DeviceError> {
        if self.fail_playback.load(Ordering::SeqCst) {
            return Err(DeviceError::NoOutputDevice);
        }
        self.playback.opens.fetch_add(1, Ordering::SeqCst);
        self.playback.live.store(true, Ordering::SeqCst);
        Ok(Arc::new(MemoryPlayback {
            shared: Arc::clone(&self.playback),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryCapture {
    shared: Arc<CaptureShared>,
    closed: AtomicBool,
}

impl CaptureDevice for MemoryCapture {
    fn read_frame(&self) -> Option<Bytes> {
        let mut frames = self.shared.frames.lock();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(frame) = frames.pop_front() {
                self.shared.reads.fetch_add(1, Ordering::SeqCst);
                return Some(frame);
            }
            // Re-check the closed flag even without a notify
            self.shared
                .cond
                .wait_for(&mut frames, Duration::from_millis(20));
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.live.store(false, Ordering::SeqCst);
            self.shared.cond.notify_all();
        }
    }
}

struct MemoryPlayback {
    shared: Arc<PlaybackShared>,
    closed: AtomicBool,
}

impl PlaybackDevice for MemoryPlayback {
    fn write_frame(&self, frame: &[u8]) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.shared
            .frames
            .lock()
            .push(Bytes::copy_from_slice(frame));
        true
    }

    fn set_speaker(&self, enabled: bool) {
        self.shared.speaker.store(enabled, Ordering::SeqCst);
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.live.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_spec_geometry() {
        let spec = FrameSpec {
            sample_rate: 44_100,
            channels: 1,
        };
        assert_eq!(spec.samples_per_frame(), 882);
        assert_eq!(spec.frame_bytes(), 1764);

        let stereo = FrameSpec {
            sample_rate: 8000,
            channels: 2,
        };
        assert_eq!(stereo.frame_bytes(), 640);
    }

    #[test]
    fn capture_read_returns_frames_then_eof_on_close() {
        let backend = MemoryBackend::new();
        let spec = FrameSpec {
            sample_rate: 8000,
            channels: 1,
        };
        backend.push_capture_frame(Bytes::from_static(b"aa"));
        let device = backend.open_capture(spec).unwrap();

        assert_eq!(device.read_frame(), Some(Bytes::from_static(b"aa")));
        assert_eq!(backend.capture_reads(), 1);

        // A blocked reader must wake up on close and see end-of-stream.
        let reader = {
            let device = Arc::clone(&device);
            std::thread::spawn(move || device.read_frame())
        };
        std::thread::sleep(Duration::from_millis(30));
        device.close();
        assert_eq!(reader.join().unwrap(), None);
        assert!(!backend.is_capture_open());
    }

    #[test]
    fn close_is_idempotent_even_if_open_failed() {
        let backend = MemoryBackend::new();
        let spec = FrameSpec {
            sample_rate: 8000,
            channels: 1,
        };
        backend.set_fail_capture(true);
        assert!(matches!(
            backend.open_capture(spec),
            Err(DeviceError::PermissionDenied)
        ));

        backend.set_fail_capture(false);
        let device = backend.open_capture(spec).unwrap();
        device.close();
        device.close();
        assert_eq!(backend.capture_opens(), 1);
        assert!(!backend.is_capture_open());
    }

    #[test]
    fn playback_records_frames_until_closed() {
        let backend = MemoryBackend::new();
        let spec = FrameSpec {
            sample_rate: 8000,
            channels: 1,
        };
        let device = backend.open_playback(spec).unwrap();

        assert!(device.write_frame(b"xy"));
        device.set_speaker(true);
        device.close();
        assert!(!device.write_frame(b"zz"));

        assert_eq!(backend.played_frames(), vec![Bytes::from_static(b"xy")]);
        assert!(backend.speaker_enabled());
        assert!(!backend.is_playback_open());
    }
}
