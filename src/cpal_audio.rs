//! cpal-backed audio devices
//!
//! Desktop implementation of the device traits on top of cpal streams and
//! lock-free ring buffers. The cpal callbacks run on the audio thread and
//! only touch the ring buffer; the blocking frame reads/writes of the
//! pipeline happen on our side of the ring.
//!
//! `cpal::Stream` is not `Send`: some hosts require the stream to be used
//! and dropped on the thread that built it. Each device therefore spawns a
//! dedicated owner thread that builds the stream, starts it, and parks
//! until `close`, so the stream never crosses a thread boundary.
//!
//! Speaker routing is a no-op here: desktop hosts have no earpiece to
//! route away from.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::device::{AudioBackend, CaptureDevice, DeviceError, FrameSpec, PlaybackDevice};

// Hold half a second of samples so scheduling hiccups do not clip audio.
fn ring_capacity(spec: FrameSpec) -> usize {
    (spec.sample_rate as usize / 2) * spec.channels as usize
}

/// One-shot latch the owner thread parks on until the device is closed.
struct ShutdownGate {
    released: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownGate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            released: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    fn wait(&self) {
        let mut released = self.released.lock();
        while !*released {
            self.cond.wait(&mut released);
        }
    }

    fn release(&self) {
        let mut released = self.released.lock();
        *released = true;
        self.cond.notify_all();
    }
}

/// Handle to a stream living on its owner thread. Releasing the gate lets
/// the thread drop the stream where it was built.
struct StreamOwner {
    gate: Arc<ShutdownGate>,
}

impl StreamOwner {
    /// Spawn the owner thread, run `build` on it, and start the stream.
    /// Returns once the stream is playing (or with the build error).
    fn spawn<F>(label: &'static str, build: F) -> Result<Self, DeviceError>
    where
        F: FnOnce() -> Result<cpal::Stream, DeviceError> + Send + 'static,
    {
        let gate = ShutdownGate::new();
        let thread_gate = Arc::clone(&gate);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        std::thread::Builder::new()
            .name(format!("audio-{}", label))
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(DeviceError::Stream(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                thread_gate.wait();
                drop(stream);
                tracing::debug!("{} stream dropped on its owner thread", label);
            })
            .map_err(|e| DeviceError::Stream(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { gate }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DeviceError::Stream(format!(
                "{} owner thread exited before the stream started",
                label
            ))),
        }
    }

    fn close(&self) {
        self.gate.release();
    }
}

impl Drop for StreamOwner {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// [`AudioBackend`] using the host's default input and output devices.
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl AudioBackend for CpalBackend {
    fn open_capture(&self, spec: FrameSpec) -> Result<Arc<dyn CaptureDevice>, DeviceError> {
        let (mut producer, consumer) = HeapRb::<i16>::new(ring_capacity(spec)).split();

        let owner = StreamOwner::spawn("capture", move || {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or(DeviceError::NoInputDevice)?;

            let sample_format = device
                .default_input_config()
                .map_err(|e| DeviceError::Stream(e.to_string()))?
                .sample_format();

            let config = StreamConfig {
                channels: spec.channels,
                sample_rate: SampleRate(spec.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };
            let err_fn = |e| tracing::error!("capture stream error: {}", e);

            let stream = match sample_format {
                SampleFormat::I16 => device
                    .build_input_stream(
                        &config,
                        move |data: &[i16], _: &cpal::InputCallbackInfo| {
                            push_samples(&mut producer, data.iter().copied());
                        },
                        err_fn,
                        None,
                    )
                    .map_err(|e| DeviceError::Stream(e.to_string()))?,
                SampleFormat::F32 => device
                    .build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            push_samples(&mut producer, data.iter().map(|s| f32_to_i16(*s)));
                        },
                        err_fn,
                        None,
                    )
                    .map_err(|e| DeviceError::Stream(e.to_string()))?,
                other => {
                    return Err(DeviceError::UnsupportedConfig(format!(
                        "input sample format {:?}",
                        other
                    )))
                }
            };
            tracing::info!(
                "microphone opened ({} Hz, {} ch, {:?})",
                spec.sample_rate,
                spec.channels,
                sample_format
            );
            Ok(stream)
        })?;

        Ok(Arc::new(CpalCapture {
            spec,
            owner,
            consumer: Mutex::new(consumer),
            closed: AtomicBool::new(false),
        }))
    }

    fn open_playback(&self, spec: FrameSpec) -> Result<Arc<dyn PlaybackDevice>, DeviceError> {
        let (producer, mut consumer) = HeapRb::<i16>::new(ring_capacity(spec)).split();

        let owner = StreamOwner::spawn("playback", move || {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or(DeviceError::NoOutputDevice)?;

            let sample_format = device
                .default_output_config()
                .map_err(|e| DeviceError::Stream(e.to_string()))?
                .sample_format();

            let config = StreamConfig {
                channels: spec.channels,
                sample_rate: SampleRate(spec.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };
            let err_fn = |e| tracing::error!("playback stream error: {}", e);

            let stream = match sample_format {
                SampleFormat::I16 => device
                    .build_output_stream(
                        &config,
                        move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                            // Underrun plays silence, never stale samples
                            for slot in data.iter_mut() {
                                *slot = consumer.try_pop().unwrap_or(0);
                            }
                        },
                        err_fn,
                        None,
                    )
                    .map_err(|e| DeviceError::Stream(e.to_string()))?,
                SampleFormat::F32 => device
                    .build_output_stream(
                        &config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            for slot in data.iter_mut() {
                                *slot = consumer.try_pop().map(i16_to_f32).unwrap_or(0.0);
                            }
                        },
                        err_fn,
                        None,
                    )
                    .map_err(|e| DeviceError::Stream(e.to_string()))?,
                other => {
                    return Err(DeviceError::UnsupportedConfig(format!(
                        "output sample format {:?}",
                        other
                    )))
                }
            };
            tracing::info!(
                "speaker opened ({} Hz, {} ch, {:?})",
                spec.sample_rate,
                spec.channels,
                sample_format
            );
            Ok(stream)
        })?;

        Ok(Arc::new(CpalPlayback {
            owner,
            producer: Mutex::new(producer),
            closed: AtomicBool::new(false),
        }))
    }
}

struct CpalCapture {
    spec: FrameSpec,
    owner: StreamOwner,
    consumer: Mutex<HeapCons<i16>>,
    closed: AtomicBool,
}

impl CaptureDevice for CpalCapture {
    fn read_frame(&self) -> Option<Bytes> {
        let samples = self.spec.samples_per_frame();
        let mut frame = Vec::with_capacity(samples * 2);
        let mut pending = vec![0i16; samples];
        let mut filled = 0;

        while filled < samples {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            let taken = self.consumer.lock().pop_slice(&mut pending[filled..]);
            filled += taken;
            if filled < samples {
                // Let the audio thread refill the ring
                std::thread::sleep(Duration::from_millis(FrameSpec::FRAME_MILLIS / 4));
            }
        }
        for sample in pending {
            frame.extend_from_slice(&sample.to_le_bytes());
        }
        Some(Bytes::from(frame))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.owner.close();
            tracing::debug!("microphone released");
        }
    }
}

struct CpalPlayback {
    owner: StreamOwner,
    producer: Mutex<HeapProd<i16>>,
    closed: AtomicBool,
}

impl PlaybackDevice for CpalPlayback {
    fn write_frame(&self, frame: &[u8]) -> bool {
        let samples: Vec<i16> = frame
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        let mut offset = 0;
        while offset < samples.len() {
            if self.closed.load(Ordering::SeqCst) {
                return false;
            }
            let written = self.producer.lock().push_slice(&samples[offset..]);
            offset += written;
            if offset < samples.len() {
                std::thread::sleep(Duration::from_millis(FrameSpec::FRAME_MILLIS / 4));
            }
        }
        true
    }

    fn set_speaker(&self, enabled: bool) {
        tracing::debug!("speaker routing ignored on this host (enabled={})", enabled);
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.owner.close();
            tracing::debug!("speaker released");
        }
    }
}

fn push_samples(producer: &mut HeapProd<i16>, samples: impl Iterator<Item = i16>) {
    for sample in samples {
        // A full ring means the reader stalled; shedding here keeps the
        // audio thread realtime-safe.
        if producer.try_push(sample).is_err() {
            break;
        }
    }
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}
