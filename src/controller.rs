//! Call controller
//!
//! The orchestrator the UI talks to. Owns the signaling channel, the state
//! machine, and the pipeline of the current call, and serializes every
//! state-affecting operation behind one async lock so local intents and
//! remote signaling events can never interleave mid-transition.
//!
//! Side effects ordered by the state machine (sends, pipeline start/stop)
//! run before the resulting state change is reported, so by the time an
//! observer sees `Idle` the devices are already released.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Mutex};

use crate::channel::{ChannelEvent, SignalingChannel};
use crate::codec::{MessageType, SignalingMessage};
use crate::config::{AcceptPolicy, VoiceConfig};
use crate::device::AudioBackend;
use crate::pipeline::{AudioFrame, FramePipeline, PipelineStats};
use crate::state::{Action, CallDirection, CallInput, CallState, CallStateMachine};
use crate::VoiceError;

/// Source of the signed-in user's id. Calls cannot start without one.
pub trait IdentityProvider: Send + Sync {
    fn user_id(&self) -> Option<String>;
}

/// Fixed identity, for tests and single-user tools
pub struct StaticIdentity {
    user_id: String,
}

impl StaticIdentity {
    pub fn new(user_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            user_id: user_id.into(),
        })
    }
}

impl IdentityProvider for StaticIdentity {
    fn user_id(&self) -> Option<String> {
        Some(self.user_id.clone())
    }
}

/// Platform hooks for ringtones and call notifications. All methods are
/// optional; they fire from the controller's event task and must not block.
pub trait CallNotifier: Send + Sync {
    fn incoming_call(&self, _from: &str) {}
    fn call_connected(&self, _peer: &str) {}
    fn call_ended(&self) {}
}

/// Notifier that does nothing
pub struct NoopNotifier;

impl CallNotifier for NoopNotifier {}

/// Events for the UI layer, in the order they happened
#[derive(Debug)]
pub enum CallEvent {
    /// The call state changed; `remote` is the current peer, if any
    StateChanged {
        state: CallState,
        remote: Option<String>,
    },
    /// An incoming call is ringing and needs a local decision
    IncomingCall { from: String },
    /// The peer declined our call request
    CallRejectedByPeer { reason: Option<String> },
    /// The signaling server reported an error
    ServerError { message: String },
    /// Audio devices could not be opened; the call is being torn down
    AudioUnavailable { reason: String },
    /// Connect attempt failed before the connection opened
    ConnectFailed { reason: String },
    /// The signaling connection closed
    ChannelClosed { reason: String },
    /// The pipeline of a call stopped; final counters attached
    PipelineStopped { stats: PipelineStats },
}

/// Snapshot of the current call, safe to hand to the UI
#[derive(Debug, Clone)]
pub struct CallSession {
    pub state: CallState,
    pub direction: CallDirection,
    pub local_user: Option<String>,
    pub remote_user: Option<String>,
    pub muted: bool,
    pub speaker_enabled: bool,
    pub duration: Option<chrono::Duration>,
}

/// State guarded by the control lock
struct ControlInner {
    machine: CallStateMachine,
    pipeline: Option<FramePipeline>,
    incoming_seq: u64,
    user_id: Option<String>,
}

/// The one call orchestrator of the process.
///
/// Construct with [`CallController::new`], then `connect` and drive calls
/// with the async operations. All operations are safe to call from any
/// task; illegal ones fail with a typed error instead of corrupting state.
pub struct CallController {
    config: VoiceConfig,
    channel: Arc<SignalingChannel>,
    backend: Arc<dyn AudioBackend>,
    identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn CallNotifier>,
    inner: Mutex<ControlInner>,
    muted: Arc<AtomicBool>,
    speaker: Arc<AtomicBool>,
    event_tx: mpsc::Sender<CallEvent>,
}

impl CallController {
    /// Create the controller and the receiver for its event stream. Spawns
    /// the background task that applies signaling events; the task exits
    /// when the controller is dropped.
    pub fn new(
        config: VoiceConfig,
        backend: Arc<dyn AudioBackend>,
        identity: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn CallNotifier>,
    ) -> (Arc<Self>, mpsc::Receiver<CallEvent>) {
        let (channel, channel_rx) = SignalingChannel::new(config.send_queue_depth);
        let (event_tx, event_rx) = mpsc::channel(64);

        let controller = Arc::new(Self {
            config,
            channel: Arc::new(channel),
            backend,
            identity,
            notifier,
            inner: Mutex::new(ControlInner {
                machine: CallStateMachine::new(),
                pipeline: None,
                incoming_seq: 0,
                user_id: None,
            }),
            muted: Arc::new(AtomicBool::new(false)),
            speaker: Arc::new(AtomicBool::new(false)),
            event_tx,
        });

        // The task holds a weak handle so a dropped controller is not kept
        // alive by its own event loop.
        tokio::spawn(event_task(Arc::downgrade(&controller), channel_rx));

        (controller, event_rx)
    }

    /// Connect to the signaling server from the configuration and register
    /// the signed-in user.
    pub async fn connect(&self) -> Result<(), VoiceError> {
        self.config.validate().map_err(VoiceError::Config)?;
        let user_id = self.identity.user_id().ok_or(VoiceError::NoIdentity)?;
        self.inner.lock().await.user_id = Some(user_id);

        self.channel
            .connect(
                &self.config.server_host,
                self.config.server_port,
                self.config.connect_timeout(),
            )
            .await?;
        Ok(())
    }

    /// Close the connection. Any call in progress is torn down first, so
    /// devices are released before this returns.
    pub async fn disconnect(&self) {
        // Tear down synchronously rather than waiting for the Closed event,
        // so callers observe Idle as soon as this returns.
        let _ = self.drive(CallInput::ConnectionClosed).await;
        self.channel.disconnect().await;
    }

    /// Place a call to `peer`. Legal only in `Ready`.
    pub async fn place_call(&self, peer: &str) -> Result<(), VoiceError> {
        self.drive(CallInput::PlaceCall {
            peer: peer.to_string(),
        })
        .await?;
        Ok(())
    }

    /// Accept the ringing incoming call
    pub async fn accept_incoming(&self) -> Result<(), VoiceError> {
        self.drive(CallInput::Accept).await?;
        Ok(())
    }

    /// Decline the ringing incoming call
    pub async fn reject_incoming(&self) -> Result<(), VoiceError> {
        self.drive(CallInput::Reject).await?;
        Ok(())
    }

    /// Hang up. Idempotent: a second press during or after teardown is a
    /// quiet no-op.
    pub async fn hangup(&self) -> Result<(), VoiceError> {
        self.drive(CallInput::Hangup).await?;
        Ok(())
    }

    /// Mute or unmute the microphone. Call-scoped: a no-op without a call
    /// session. Takes effect on the next captured frame; capture keeps
    /// draining the device either way.
    pub async fn set_muted(&self, muted: bool) {
        let inner = self.inner.lock().await;
        if inner.machine.has_session() {
            self.muted.store(muted, Ordering::SeqCst);
        }
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Route audio to the loudspeaker. Call-scoped like mute; best-effort
    /// on backends without output routing.
    pub async fn set_speaker_enabled(&self, enabled: bool) {
        let inner = self.inner.lock().await;
        if !inner.machine.has_session() {
            return;
        }
        self.speaker.store(enabled, Ordering::SeqCst);
        if let Some(pipeline) = &inner.pipeline {
            pipeline.set_speaker(enabled);
        }
    }

    pub fn speaker_enabled(&self) -> bool {
        self.speaker.load(Ordering::SeqCst)
    }

    /// Current call state
    pub async fn state(&self) -> CallState {
        self.inner.lock().await.machine.state()
    }

    /// Snapshot of the current call
    pub async fn session(&self) -> CallSession {
        let inner = self.inner.lock().await;
        CallSession {
            state: inner.machine.state(),
            direction: inner.machine.direction(),
            local_user: inner.user_id.clone(),
            remote_user: inner.machine.remote_user().map(String::from),
            muted: self.muted(),
            speaker_enabled: self.speaker_enabled(),
            duration: inner.machine.duration(),
        }
    }

    async fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event).await;
    }

    /// Apply one input and everything it cascades into. The first input's
    /// rejection is the caller's error; follow-on inputs queued by actions
    /// are guarded by the table and only logged if they miss.
    async fn drive(&self, input: CallInput) -> Result<(), crate::state::InvalidStateError> {
        let mut inner = self.inner.lock().await;
        let mut work = VecDeque::from([input]);
        let mut is_first = true;

        while let Some(input) = work.pop_front() {
            let prev = inner.machine.state();
            let actions = match inner.machine.transition(input) {
                Ok(actions) => actions,
                Err(e) if is_first => return Err(e),
                Err(e) => {
                    tracing::debug!("skipping queued input: {}", e);
                    continue;
                }
            };
            is_first = false;

            let state = inner.machine.state();
            if prev == CallState::Ready
                && matches!(state, CallState::Dialing | CallState::RingingIncoming)
            {
                // Fresh call, fresh controls
                self.muted.store(false, Ordering::SeqCst);
                self.speaker.store(false, Ordering::SeqCst);
            }

            for action in actions {
                self.run_action(&mut inner, action, &mut work).await;
            }

            let state = inner.machine.state();
            if state != prev {
                let remote = inner.machine.remote_user().map(String::from);
                self.emit(CallEvent::StateChanged {
                    state,
                    remote: remote.clone(),
                })
                .await;
                match state {
                    CallState::Active => {
                        self.notifier.call_connected(remote.as_deref().unwrap_or(""))
                    }
                    CallState::Idle | CallState::Ready
                        if matches!(
                            prev,
                            CallState::Dialing
                                | CallState::RingingIncoming
                                | CallState::Active
                                | CallState::Ending
                        ) =>
                    {
                        self.notifier.call_ended()
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn run_action(
        &self,
        inner: &mut ControlInner,
        action: Action,
        work: &mut VecDeque<CallInput>,
    ) {
        match action {
            Action::SendRegister => {
                let Some(user_id) = inner.user_id.clone() else {
                    tracing::error!("cannot register without a signed-in user");
                    return;
                };
                self.send(&SignalingMessage::register(&user_id, &self.config.role));
            }
            Action::SendCallRequest { to } => {
                self.send(&SignalingMessage::call_request(&to));
            }
            Action::SendAccept { to } => {
                self.send(&SignalingMessage::call_accepted(&to));
            }
            Action::SendReject { to, reason } => {
                self.send(&SignalingMessage::call_rejected(&to, reason.as_deref()));
            }
            Action::SendHangup { to } => {
                self.send(&SignalingMessage::call_ended(&to));
            }
            Action::StartPipeline { peer } => {
                let spec = self.config.frame_spec();
                let capture = match self.backend.open_capture(spec) {
                    Ok(capture) => capture,
                    Err(e) => {
                        tracing::error!("microphone unavailable: {}", e);
                        self.emit(CallEvent::AudioUnavailable {
                            reason: e.to_string(),
                        })
                        .await;
                        work.push_back(CallInput::MediaFailed);
                        return;
                    }
                };
                let playback = match self.backend.open_playback(spec) {
                    Ok(playback) => playback,
                    Err(e) => {
                        capture.close();
                        tracing::error!("speaker unavailable: {}", e);
                        self.emit(CallEvent::AudioUnavailable {
                            reason: e.to_string(),
                        })
                        .await;
                        work.push_back(CallInput::MediaFailed);
                        return;
                    }
                };

                let pipeline = FramePipeline::start(
                    Arc::clone(&self.channel),
                    capture,
                    playback,
                    spec,
                    peer,
                    Arc::clone(&self.muted),
                    self.config.playback_queue_depth,
                );
                pipeline.set_speaker(self.speaker.load(Ordering::SeqCst));
                inner.incoming_seq = 0;
                inner.pipeline = Some(pipeline);
            }
            Action::StopPipeline => {
                if let Some(mut pipeline) = inner.pipeline.take() {
                    let stats = pipeline.stop().await;
                    self.emit(CallEvent::PipelineStopped { stats }).await;
                }
                if inner.machine.state() == CallState::Ending {
                    work.push_back(CallInput::PipelineStopped);
                }
            }
        }
    }

    /// Control-message send. Failures here mean the connection is going
    /// down; the Closed event carries the actual cleanup.
    fn send(&self, message: &SignalingMessage) {
        if let Err(e) = self.channel.send(message) {
            tracing::warn!("failed to send {} message: {}", message.kind(), e);
        }
    }

    async fn handle_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => {
                let _ = self.drive(CallInput::ConnectionOpened).await;
            }
            ChannelEvent::Failed { reason } => {
                self.emit(CallEvent::ConnectFailed { reason }).await;
            }
            ChannelEvent::Closed { reason } => {
                let _ = self.drive(CallInput::ConnectionClosed).await;
                self.emit(CallEvent::ChannelClosed { reason }).await;
            }
            ChannelEvent::Message(message) => self.handle_message(message).await,
        }
    }

    async fn handle_message(&self, message: SignalingMessage) {
        match message.kind() {
            MessageType::Ready => {
                let _ = self.drive(CallInput::RemoteReady).await;
            }
            MessageType::CallRequest => {
                let Some(peer) = message.from_user().map(String::from) else {
                    tracing::warn!("dropping call-request without a sender");
                    return;
                };
                if self
                    .drive(CallInput::RemoteCallRequest { peer: peer.clone() })
                    .await
                    .is_err()
                {
                    return;
                }
                if self.state().await == CallState::RingingIncoming {
                    self.notifier.incoming_call(&peer);
                    self.emit(CallEvent::IncomingCall { from: peer }).await;
                    if self.config.accept_policy == AcceptPolicy::Auto {
                        let _ = self.drive(CallInput::Accept).await;
                    }
                }
            }
            MessageType::CallAccepted => {
                let _ = self.drive(CallInput::RemoteAccepted).await;
            }
            MessageType::CallRejected => {
                let reason = message.reason().map(String::from);
                if self.drive(CallInput::RemoteRejected).await.is_ok() {
                    self.emit(CallEvent::CallRejectedByPeer { reason }).await;
                }
            }
            MessageType::CallEnded => {
                let _ = self.drive(CallInput::RemoteEnded).await;
            }
            MessageType::AudioData => {
                let mut inner = self.inner.lock().await;
                if inner.pipeline.is_some() {
                    match message.audio_payload() {
                        Ok(data) => {
                            inner.incoming_seq += 1;
                            let frame = AudioFrame {
                                seq: inner.incoming_seq,
                                data,
                            };
                            if let Some(pipeline) = &inner.pipeline {
                                pipeline.incoming().push(frame);
                            }
                        }
                        Err(e) => {
                            tracing::warn!("dropping audio frame with bad payload: {}", e);
                        }
                    }
                }
            }
            MessageType::Error => {
                let message = message
                    .error_message()
                    .unwrap_or("unknown server error")
                    .to_string();
                tracing::warn!("signaling server error: {}", message);
                self.emit(CallEvent::ServerError { message }).await;
            }
            MessageType::Register => {
                tracing::debug!("ignoring unexpected register message from server");
            }
        }
    }
}

async fn event_task(controller: Weak<CallController>, mut events: mpsc::Receiver<ChannelEvent>) {
    while let Some(event) = events.recv().await {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.handle_channel_event(event).await;
    }
}
