//! Peer-to-peer voice calls for the marketplace seller client
//!
//! This crate is the call subsystem of the seller app. Everything else in
//! the app (product/order CRUD, notifications, uploads) talks to hosted
//! services; calls are negotiated directly over a hand-rolled signaling
//! protocol and a raw PCM audio pipeline. Features:
//! - JSON signaling over a persistent WebSocket connection
//! - Registration, call setup/teardown, and glare handling
//! - Microphone capture and speaker playback loops with bounded queues
//! - One explicit call state machine driving all side effects
//!
//! The UI layer drives a [`CallController`] and observes [`CallEvent`]s;
//! nothing else in the crate is stateful across calls.

pub mod channel;
pub mod codec;
pub mod config;
pub mod controller;
pub mod device;
pub mod pipeline;
pub mod state;

#[cfg(feature = "cpal-audio")]
pub mod cpal_audio;

pub use channel::{ChannelEvent, ChannelState, ConnectError, SendError, SignalingChannel};
pub use codec::{DecodeError, MessageType, SignalingCodec, SignalingMessage};
pub use config::{AcceptPolicy, VoiceConfig};
pub use controller::{
    CallController, CallEvent, CallNotifier, CallSession, IdentityProvider, NoopNotifier,
    StaticIdentity,
};
pub use device::{
    AudioBackend, CaptureDevice, DeviceError, FrameSpec, MemoryBackend, PlaybackDevice,
};
pub use pipeline::{AudioFrame, FramePipeline, PipelineStats};
pub use state::{CallDirection, CallState, InvalidStateError};

use thiserror::Error;

/// Umbrella error for callers that do not want to match per-module types.
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    InvalidState(#[from] InvalidStateError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no signed-in user id available")]
    NoIdentity,
}
