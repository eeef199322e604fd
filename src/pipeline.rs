//! Audio frame pipeline
//!
//! Two unidirectional loops, started together when a call goes active and
//! stopped together when it leaves active:
//! - capture: microphone -> signaling channel (`audio-data` messages)
//! - playback: bounded incoming queue -> speaker
//!
//! Both loops run on blocking threads because device I/O blocks. Mute
//! discards frames after the device read so the microphone never stalls.
//! The incoming queue drops its oldest frame under backpressure rather
//! than growing without bound or blocking the receive path; every drop is
//! counted, never silent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tokio::task::JoinHandle;

use crate::channel::{SendError, SignalingChannel};
use crate::codec::SignalingMessage;
use crate::device::{CaptureDevice, FrameSpec, PlaybackDevice};

/// One fixed-size PCM frame plus a monotonically increasing sequence
/// number assigned at capture (or arrival) time. Sequence numbers diagnose
/// drops; delivery order is already guaranteed by the single connection.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub seq: u64,
    pub data: Bytes,
}

/// Counters for one pipeline run. Snapshot type; all counts are totals
/// since `start`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_captured: u64,
    pub frames_sent: u64,
    pub frames_muted: u64,
    pub frames_dropped_outgoing: u64,
    pub frames_played: u64,
    pub frames_dropped_incoming: u64,
}

#[derive(Default)]
struct Counters {
    captured: AtomicU64,
    sent: AtomicU64,
    muted: AtomicU64,
    dropped_outgoing: AtomicU64,
    played: AtomicU64,
}

enum Pop {
    Frame(AudioFrame),
    TimedOut,
    Closed,
}

struct QueueInner {
    frames: VecDeque<AudioFrame>,
    closed: bool,
}

/// Bounded frame queue between the network receive path and the playback
/// loop. Push never blocks: when full, the oldest frame is dropped and
/// counted. This bounds end-to-end latency at the cost of gaps.
pub struct FrameQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
    capacity: usize,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            cond: Condvar::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking push with drop-oldest overflow
    pub fn push(&self, frame: AudioFrame) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        if inner.frames.len() >= self.capacity {
            inner.frames.pop_front();
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
        inner.frames.push_back(frame);
        self.cond.notify_one();
    }

    fn pop(&self, timeout: Duration) -> Pop {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.pop_front() {
            return Pop::Frame(frame);
        }
        if inner.closed {
            return Pop::Closed;
        }
        self.cond.wait_for(&mut inner, timeout);
        match inner.frames.pop_front() {
            Some(frame) => Pop::Frame(frame),
            None if inner.closed => Pop::Closed,
            None => Pop::TimedOut,
        }
    }

    /// Close the queue; wakes the consumer, which drains and exits.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.cond.notify_all();
    }

    /// Frames dropped to overflow so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The two audio loops of one active call.
///
/// Owns its queues and borrows the device handles for the call's duration;
/// both devices are closed on every exit path, including read/write errors
/// and end-of-stream.
pub struct FramePipeline {
    incoming: Arc<FrameQueue>,
    counters: Arc<Counters>,
    stop_flag: Arc<AtomicBool>,
    capture: Arc<dyn CaptureDevice>,
    playback: Arc<dyn PlaybackDevice>,
    capture_task: Option<JoinHandle<()>>,
    playback_task: Option<JoinHandle<()>>,
}

impl FramePipeline {
    /// Start both loops. `muted` is read by the capture loop on every
    /// frame; flipping it never stalls the device.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        channel: Arc<SignalingChannel>,
        capture: Arc<dyn CaptureDevice>,
        playback: Arc<dyn PlaybackDevice>,
        spec: FrameSpec,
        remote_user: String,
        muted: Arc<AtomicBool>,
        playback_queue_depth: usize,
    ) -> Self {
        let incoming = Arc::new(FrameQueue::new(playback_queue_depth));
        let counters = Arc::new(Counters::default());
        let stop_flag = Arc::new(AtomicBool::new(false));

        let capture_task = {
            let capture = Arc::clone(&capture);
            let counters = Arc::clone(&counters);
            let stop = Arc::clone(&stop_flag);
            tokio::task::spawn_blocking(move || {
                capture_loop(channel, capture, counters, stop, muted, spec, remote_user);
            })
        };

        let playback_task = {
            let playback = Arc::clone(&playback);
            let incoming = Arc::clone(&incoming);
            let counters = Arc::clone(&counters);
            let stop = Arc::clone(&stop_flag);
            tokio::task::spawn_blocking(move || {
                playback_loop(playback, incoming, counters, stop);
            })
        };

        tracing::info!(
            "frame pipeline started ({} Hz, {} ch, {} byte frames)",
            spec.sample_rate,
            spec.channels,
            spec.frame_bytes()
        );

        Self {
            incoming,
            counters,
            stop_flag,
            capture,
            playback,
            capture_task: Some(capture_task),
            playback_task: Some(playback_task),
        }
    }

    /// Queue fed by the controller with decoded `audio-data` payloads
    pub fn incoming(&self) -> Arc<FrameQueue> {
        Arc::clone(&self.incoming)
    }

    /// Forward the speaker-routing flag to the playback device
    pub fn set_speaker(&self, enabled: bool) {
        self.playback.set_speaker(enabled);
    }

    /// Stop both loops and release both devices. Bounded latency: each
    /// loop wakes within one frame-read/queue-pop timeout.
    pub async fn stop(&mut self) -> PipelineStats {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.capture.close();
        self.playback.close();
        self.incoming.close();

        if let Some(task) = self.capture_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.playback_task.take() {
            let _ = task.await;
        }

        let stats = self.stats();
        tracing::info!(
            "frame pipeline stopped: captured={} sent={} muted={} dropped_out={} played={} dropped_in={}",
            stats.frames_captured,
            stats.frames_sent,
            stats.frames_muted,
            stats.frames_dropped_outgoing,
            stats.frames_played,
            stats.frames_dropped_incoming,
        );
        stats
    }

    /// Current counter snapshot
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames_captured: self.counters.captured.load(Ordering::SeqCst),
            frames_sent: self.counters.sent.load(Ordering::SeqCst),
            frames_muted: self.counters.muted.load(Ordering::SeqCst),
            frames_dropped_outgoing: self.counters.dropped_outgoing.load(Ordering::SeqCst),
            frames_played: self.counters.played.load(Ordering::SeqCst),
            frames_dropped_incoming: self.incoming.dropped(),
        }
    }
}

fn capture_loop(
    channel: Arc<SignalingChannel>,
    capture: Arc<dyn CaptureDevice>,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
    muted: Arc<AtomicBool>,
    spec: FrameSpec,
    remote_user: String,
) {
    let mut seq: u64 = 0;
    while !stop.load(Ordering::SeqCst) {
        let Some(frame) = capture.read_frame() else {
            // Device closed: end of stream
            break;
        };
        seq += 1;
        counters.captured.fetch_add(1, Ordering::SeqCst);

        // The frame was read either way; mute only suppresses the send.
        if muted.load(Ordering::SeqCst) {
            counters.muted.fetch_add(1, Ordering::SeqCst);
            continue;
        }

        let message =
            SignalingMessage::audio_data(&remote_user, &frame, spec.sample_rate, spec.channels);
        match channel.send(&message) {
            Ok(()) => {
                counters.sent.fetch_add(1, Ordering::SeqCst);
            }
            Err(SendError::QueueFull) => {
                // Slow network must not stall the microphone; shed the frame.
                counters.dropped_outgoing.fetch_add(1, Ordering::SeqCst);
                tracing::debug!("send queue full, dropping captured frame {}", seq);
            }
            Err(SendError::NotOpen) => {
                tracing::debug!("signaling channel closed, stopping capture loop");
                break;
            }
        }
    }
    capture.close();
    tracing::debug!("capture loop exited after {} frames", seq);
}

fn playback_loop(
    playback: Arc<dyn PlaybackDevice>,
    incoming: Arc<FrameQueue>,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
) {
    let timeout = Duration::from_millis(FrameSpec::FRAME_MILLIS * 2);
    loop {
        match incoming.pop(timeout) {
            Pop::Frame(frame) => {
                if !playback.write_frame(&frame.data) {
                    break;
                }
                counters.played.fetch_add(1, Ordering::SeqCst);
            }
            Pop::TimedOut => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
            }
            Pop::Closed => break,
        }
    }
    playback.close();
    tracing::debug!("playback loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{AudioBackend, MemoryBackend};

    fn spec() -> FrameSpec {
        FrameSpec {
            sample_rate: 8000,
            channels: 1,
        }
    }

    fn frame(seq: u64) -> AudioFrame {
        AudioFrame {
            seq,
            data: Bytes::from(vec![seq as u8; 4]),
        }
    }

    #[test]
    fn queue_drops_oldest_when_full_and_counts_it() {
        let queue = FrameQueue::new(2);
        queue.push(frame(1));
        queue.push(frame(2));
        queue.push(frame(3));

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 2);
        match queue.pop(Duration::from_millis(1)) {
            Pop::Frame(f) => assert_eq!(f.seq, 2),
            _ => panic!("expected a frame"),
        }
    }

    #[test]
    fn queue_pop_sees_close_promptly() {
        let queue = Arc::new(FrameQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || loop {
                match queue.pop(Duration::from_millis(20)) {
                    Pop::Closed => return true,
                    Pop::Frame(_) | Pop::TimedOut => continue,
                }
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        queue.close();
        assert!(consumer.join().unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn playback_side_drains_incoming_frames_to_device() {
        let backend = MemoryBackend::new();
        let capture = backend.open_capture(spec()).unwrap();
        let playback = backend.open_playback(spec()).unwrap();
        // Channel never opened: capture sends fail fast, playback is what
        // this test watches.
        let (channel, _events) = SignalingChannel::new(4);

        let mut pipeline = FramePipeline::start(
            Arc::new(channel),
            capture,
            playback,
            spec(),
            "buyer-7".to_string(),
            Arc::new(AtomicBool::new(false)),
            8,
        );

        let incoming = pipeline.incoming();
        incoming.push(frame(1));
        incoming.push(frame(2));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = pipeline.stop().await;

        assert_eq!(stats.frames_played, 2);
        assert_eq!(backend.played_frames().len(), 2);
        assert!(!backend.is_capture_open());
        assert!(!backend.is_playback_open());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_releases_devices_even_with_idle_loops() {
        let backend = MemoryBackend::new();
        let capture = backend.open_capture(spec()).unwrap();
        let playback = backend.open_playback(spec()).unwrap();
        let (channel, _events) = SignalingChannel::new(4);

        let mut pipeline = FramePipeline::start(
            Arc::new(channel),
            capture,
            playback,
            spec(),
            "buyer-7".to_string(),
            Arc::new(AtomicBool::new(false)),
            8,
        );

        // Both loops are blocked waiting for input; stop must still return
        // promptly and close both handles.
        let started = std::time::Instant::now();
        let _ = pipeline.stop().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!backend.is_capture_open());
        assert!(!backend.is_playback_open());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mute_discards_after_read_without_stalling_capture() {
        let backend = MemoryBackend::new();
        let capture = backend.open_capture(spec()).unwrap();
        let playback = backend.open_playback(spec()).unwrap();
        let (channel, _events) = SignalingChannel::new(4);
        let muted = Arc::new(AtomicBool::new(true));

        let mut pipeline = FramePipeline::start(
            Arc::new(channel),
            capture,
            playback,
            spec(),
            "buyer-7".to_string(),
            Arc::clone(&muted),
            8,
        );

        backend.push_capture_frames(5, Bytes::from(vec![0u8; 16]));

        // All five frames must be consumed from the device despite mute.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while backend.capture_reads() < 5 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = pipeline.stop().await;

        assert_eq!(stats.frames_captured, 5);
        assert_eq!(stats.frames_muted, 5);
        assert_eq!(stats.frames_sent, 0);
        assert_eq!(backend.capture_reads(), 5);
    }
}
