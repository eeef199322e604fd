//! Call state machine
//!
//! One explicit tagged state per call, replacing the scattered boolean
//! flags of the legacy client (`isConnected`, `isCallActive`) that allowed
//! unmodeled combinations. All legal transitions live in the table below;
//! anything else is rejected with a typed error, never silently ignored,
//! so UI/control bugs stay visible.
//!
//! The machine is pure: `transition` mutates session bookkeeping and
//! returns the side effects for the controller to execute. No I/O happens
//! here, which is what makes the table unit-testable.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Call state. `Idle` is the only rest state; teardown paths drain back to
/// it once the pipeline has stopped and devices are released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// No connection to the signaling server
    Idle,
    /// Connection open, `register` sent, waiting for `ready`
    Registering,
    /// Registered; can place and receive calls
    Ready,
    /// Outgoing `call-request` sent, waiting for the peer's answer
    Dialing,
    /// Incoming `call-request` waiting for a local decision
    RingingIncoming,
    /// Media flowing in both directions
    Active,
    /// Tearing down; waiting for the pipeline to stop
    Ending,
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallState::Idle => write!(f, "Idle"),
            CallState::Registering => write!(f, "Registering"),
            CallState::Ready => write!(f, "Ready"),
            CallState::Dialing => write!(f, "Dialing"),
            CallState::RingingIncoming => write!(f, "RingingIncoming"),
            CallState::Active => write!(f, "Active"),
            CallState::Ending => write!(f, "Ending"),
        }
    }
}

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallDirection {
    /// No call in progress
    #[default]
    None,
    /// We initiated
    Outgoing,
    /// The peer initiated
    Incoming,
}

/// Inputs driving the machine: local intents and remote signaling events.
#[derive(Debug, Clone, PartialEq)]
pub enum CallInput {
    ConnectionOpened,
    RemoteReady,
    PlaceCall { peer: String },
    RemoteCallRequest { peer: String },
    RemoteAccepted,
    RemoteRejected,
    Accept,
    Reject,
    Hangup,
    RemoteEnded,
    MediaFailed,
    PipelineStopped,
    ConnectionClosed,
}

impl CallInput {
    fn name(&self) -> &'static str {
        match self {
            CallInput::ConnectionOpened => "connection-opened",
            CallInput::RemoteReady => "ready",
            CallInput::PlaceCall { .. } => "place-call",
            CallInput::RemoteCallRequest { .. } => "call-request",
            CallInput::RemoteAccepted => "call-accepted",
            CallInput::RemoteRejected => "call-rejected",
            CallInput::Accept => "accept",
            CallInput::Reject => "reject",
            CallInput::Hangup => "hangup",
            CallInput::RemoteEnded => "call-ended",
            CallInput::MediaFailed => "media-failed",
            CallInput::PipelineStopped => "pipeline-stopped",
            CallInput::ConnectionClosed => "connection-closed",
        }
    }
}

/// Side effects the controller must execute after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SendRegister,
    SendCallRequest { to: String },
    SendAccept { to: String },
    SendReject { to: String, reason: Option<String> },
    SendHangup { to: String },
    StartPipeline { peer: String },
    StopPipeline,
}

/// An operation was attempted in a state where it is not legal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("event '{event}' is not legal in state {state}")]
pub struct InvalidStateError {
    pub state: CallState,
    pub event: &'static str,
}

/// The authoritative state of the (single) current call.
#[derive(Debug)]
pub struct CallStateMachine {
    state: CallState,
    direction: CallDirection,
    remote_user: Option<String>,
    started_at: Option<DateTime<Utc>>,
    connected_at: Option<DateTime<Utc>>,
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self {
            state: CallState::Idle,
            direction: CallDirection::None,
            remote_user: None,
            started_at: None,
            connected_at: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    /// The peer of the current call, if one exists
    pub fn remote_user(&self) -> Option<&str> {
        self.remote_user.as_deref()
    }

    /// Whether a call session exists (a peer is attached)
    pub fn has_session(&self) -> bool {
        self.remote_user.is_some()
    }

    /// Call duration since connect (or since setup began, if never
    /// connected)
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.connected_at.or(self.started_at)?;
        Some(Utc::now() - start)
    }

    fn begin(&mut self, peer: String, direction: CallDirection) {
        self.remote_user = Some(peer);
        self.direction = direction;
        self.started_at = Some(Utc::now());
        self.connected_at = None;
    }

    fn clear_session(&mut self) {
        self.remote_user = None;
        self.direction = CallDirection::None;
        self.started_at = None;
        self.connected_at = None;
    }

    fn reject(&self, input: &CallInput) -> InvalidStateError {
        InvalidStateError {
            state: self.state,
            event: input.name(),
        }
    }

    /// Apply one input. Returns the side effects to execute, or an error
    /// if the input is illegal in the current state (in which case nothing
    /// changed).
    pub fn transition(&mut self, input: CallInput) -> Result<Vec<Action>, InvalidStateError> {
        use CallState::*;

        let actions = match (self.state, &input) {
            (Idle, CallInput::ConnectionOpened) => {
                self.state = Registering;
                vec![Action::SendRegister]
            }
            (Registering, CallInput::RemoteReady) => {
                self.state = Ready;
                vec![]
            }
            (Ready, CallInput::PlaceCall { peer }) => {
                self.begin(peer.clone(), CallDirection::Outgoing);
                self.state = Dialing;
                vec![Action::SendCallRequest { to: peer.clone() }]
            }
            (Ready, CallInput::RemoteCallRequest { peer }) => {
                self.begin(peer.clone(), CallDirection::Incoming);
                self.state = RingingIncoming;
                vec![]
            }
            // Glare and any request while already busy: first call wins,
            // the later request is answered busy and the state stands.
            (
                Dialing | RingingIncoming | Active | Ending,
                CallInput::RemoteCallRequest { peer },
            ) => {
                vec![Action::SendReject {
                    to: peer.clone(),
                    reason: Some("busy".to_string()),
                }]
            }
            (Dialing, CallInput::RemoteAccepted) => {
                self.connected_at = Some(Utc::now());
                self.state = Active;
                let peer = self.must_peer();
                vec![Action::StartPipeline { peer }]
            }
            (Dialing, CallInput::RemoteRejected) => {
                self.clear_session();
                self.state = Ready;
                vec![]
            }
            // Peer cancelled before we answered or were answered
            (Dialing | RingingIncoming, CallInput::RemoteEnded) => {
                self.clear_session();
                self.state = Ready;
                vec![]
            }
            (RingingIncoming, CallInput::Accept) => {
                self.connected_at = Some(Utc::now());
                self.state = Active;
                let peer = self.must_peer();
                vec![
                    Action::SendAccept { to: peer.clone() },
                    Action::StartPipeline { peer },
                ]
            }
            (RingingIncoming, CallInput::Reject) => {
                let peer = self.must_peer();
                self.clear_session();
                self.state = Ready;
                vec![Action::SendReject {
                    to: peer,
                    reason: Some("declined".to_string()),
                }]
            }
            // Hanging up an unanswered call needs no pipeline teardown
            (Dialing | RingingIncoming, CallInput::Hangup) => {
                let peer = self.must_peer();
                self.clear_session();
                self.state = Ready;
                vec![Action::SendHangup { to: peer }]
            }
            (Active, CallInput::Hangup) => {
                self.state = Ending;
                let peer = self.must_peer();
                vec![Action::SendHangup { to: peer }, Action::StopPipeline]
            }
            (Active, CallInput::RemoteEnded) => {
                self.state = Ending;
                vec![Action::StopPipeline]
            }
            (Active, CallInput::MediaFailed) => {
                self.state = Ending;
                let peer = self.must_peer();
                vec![Action::SendHangup { to: peer }, Action::StopPipeline]
            }
            (Ending, CallInput::PipelineStopped) => {
                self.clear_session();
                self.state = Idle;
                vec![]
            }
            // Hangup is idempotent across teardown and the rest state:
            // pressing it twice must not surface an error.
            (Ending | Idle, CallInput::Hangup) => vec![],
            // Peer teardown crossing our own in flight
            (Ending, CallInput::RemoteEnded) => vec![],
            // Connection loss tears everything down from any state.
            (_, CallInput::ConnectionClosed) => {
                let had_media = matches!(self.state, Active | Ending);
                self.clear_session();
                self.state = Idle;
                if had_media {
                    vec![Action::StopPipeline]
                } else {
                    vec![]
                }
            }
            _ => return Err(self.reject(&input)),
        };

        debug_assert!(
            self.remote_user.is_some()
                == matches!(self.state, Dialing | RingingIncoming | Active | Ending),
            "session invariant violated in state {}",
            self.state
        );

        Ok(actions)
    }

    fn must_peer(&self) -> String {
        // Guarded by the transition table: every arm calling this holds a
        // session.
        self.remote_user.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_in(state: CallState) -> CallStateMachine {
        let mut m = CallStateMachine::new();
        match state {
            CallState::Idle => {}
            CallState::Registering => {
                m.transition(CallInput::ConnectionOpened).unwrap();
            }
            CallState::Ready => {
                m.transition(CallInput::ConnectionOpened).unwrap();
                m.transition(CallInput::RemoteReady).unwrap();
            }
            CallState::Dialing => {
                m = machine_in(CallState::Ready);
                m.transition(CallInput::PlaceCall {
                    peer: "buyer-7".into(),
                })
                .unwrap();
            }
            CallState::RingingIncoming => {
                m = machine_in(CallState::Ready);
                m.transition(CallInput::RemoteCallRequest {
                    peer: "buyer-7".into(),
                })
                .unwrap();
            }
            CallState::Active => {
                m = machine_in(CallState::Dialing);
                m.transition(CallInput::RemoteAccepted).unwrap();
            }
            CallState::Ending => {
                m = machine_in(CallState::Active);
                m.transition(CallInput::Hangup).unwrap();
            }
        }
        assert_eq!(m.state(), state);
        m
    }

    #[test]
    fn happy_path_outgoing_call() {
        let mut m = CallStateMachine::new();

        assert_eq!(
            m.transition(CallInput::ConnectionOpened).unwrap(),
            vec![Action::SendRegister]
        );
        assert!(m.transition(CallInput::RemoteReady).unwrap().is_empty());

        let actions = m
            .transition(CallInput::PlaceCall {
                peer: "buyer-7".into(),
            })
            .unwrap();
        assert_eq!(
            actions,
            vec![Action::SendCallRequest {
                to: "buyer-7".into()
            }]
        );
        assert_eq!(m.state(), CallState::Dialing);
        assert_eq!(m.direction(), CallDirection::Outgoing);

        let actions = m.transition(CallInput::RemoteAccepted).unwrap();
        assert_eq!(
            actions,
            vec![Action::StartPipeline {
                peer: "buyer-7".into()
            }]
        );
        assert_eq!(m.state(), CallState::Active);

        let actions = m.transition(CallInput::Hangup).unwrap();
        assert_eq!(
            actions,
            vec![
                Action::SendHangup {
                    to: "buyer-7".into()
                },
                Action::StopPipeline
            ]
        );
        assert_eq!(m.state(), CallState::Ending);

        assert!(m.transition(CallInput::PipelineStopped).unwrap().is_empty());
        assert_eq!(m.state(), CallState::Idle);
        assert!(!m.has_session());
    }

    #[test]
    fn incoming_call_accept_and_remote_end() {
        let mut m = machine_in(CallState::RingingIncoming);
        assert_eq!(m.direction(), CallDirection::Incoming);

        let actions = m.transition(CallInput::Accept).unwrap();
        assert_eq!(
            actions,
            vec![
                Action::SendAccept {
                    to: "buyer-7".into()
                },
                Action::StartPipeline {
                    peer: "buyer-7".into()
                },
            ]
        );
        assert_eq!(m.state(), CallState::Active);

        let actions = m.transition(CallInput::RemoteEnded).unwrap();
        assert_eq!(actions, vec![Action::StopPipeline]);
        assert_eq!(m.state(), CallState::Ending);
    }

    #[test]
    fn reject_incoming_returns_to_ready_with_declined() {
        let mut m = machine_in(CallState::RingingIncoming);
        let actions = m.transition(CallInput::Reject).unwrap();
        assert_eq!(
            actions,
            vec![Action::SendReject {
                to: "buyer-7".into(),
                reason: Some("declined".into())
            }]
        );
        assert_eq!(m.state(), CallState::Ready);
        assert!(!m.has_session());
    }

    #[test]
    fn glare_request_while_dialing_is_answered_busy_and_state_stands() {
        let mut m = machine_in(CallState::Dialing);
        let actions = m
            .transition(CallInput::RemoteCallRequest {
                peer: "buyer-9".into(),
            })
            .unwrap();
        assert_eq!(
            actions,
            vec![Action::SendReject {
                to: "buyer-9".into(),
                reason: Some("busy".into())
            }]
        );
        // The first request still wins
        assert_eq!(m.state(), CallState::Dialing);
        assert_eq!(m.remote_user(), Some("buyer-7"));

        // ...and proceeds normally
        m.transition(CallInput::RemoteAccepted).unwrap();
        assert_eq!(m.state(), CallState::Active);
    }

    #[test]
    fn rejected_outgoing_call_returns_to_ready() {
        let mut m = machine_in(CallState::Dialing);
        assert!(m.transition(CallInput::RemoteRejected).unwrap().is_empty());
        assert_eq!(m.state(), CallState::Ready);
        assert!(!m.has_session());
    }

    #[test]
    fn hangup_is_idempotent_through_teardown() {
        let mut m = machine_in(CallState::Active);

        let first = m.transition(CallInput::Hangup).unwrap();
        assert!(first.contains(&Action::SendHangup {
            to: "buyer-7".into()
        }));

        // Second press: no new sends, no error
        assert!(m.transition(CallInput::Hangup).unwrap().is_empty());
        assert_eq!(m.state(), CallState::Ending);

        // The peer's own call-ended crossing ours is just as quiet
        assert!(m.transition(CallInput::RemoteEnded).unwrap().is_empty());
        assert_eq!(m.state(), CallState::Ending);

        m.transition(CallInput::PipelineStopped).unwrap();
        assert!(m.transition(CallInput::Hangup).unwrap().is_empty());
        assert_eq!(m.state(), CallState::Idle);
    }

    #[test]
    fn connection_loss_force_stops_from_active() {
        let mut m = machine_in(CallState::Active);
        let actions = m.transition(CallInput::ConnectionClosed).unwrap();
        assert_eq!(actions, vec![Action::StopPipeline]);
        assert_eq!(m.state(), CallState::Idle);
        assert!(!m.has_session());

        // A fresh call attempt requires a fresh connection
        let err = m
            .transition(CallInput::PlaceCall {
                peer: "buyer-7".into(),
            })
            .unwrap_err();
        assert_eq!(err.state, CallState::Idle);
    }

    #[test]
    fn connection_loss_outside_a_call_is_quiet() {
        for state in [CallState::Idle, CallState::Registering, CallState::Ready] {
            let mut m = machine_in(state);
            assert!(m.transition(CallInput::ConnectionClosed).unwrap().is_empty());
            assert_eq!(m.state(), CallState::Idle);
        }
    }

    #[test]
    fn illegal_events_are_rejected_not_applied() {
        let cases: Vec<(CallState, CallInput)> = vec![
            (CallState::Idle, CallInput::PlaceCall { peer: "x".into() }),
            (CallState::Idle, CallInput::Accept),
            (CallState::Registering, CallInput::PlaceCall { peer: "x".into() }),
            (
                CallState::Registering,
                CallInput::RemoteCallRequest { peer: "x".into() },
            ),
            (CallState::Ready, CallInput::Accept),
            (CallState::Ready, CallInput::RemoteAccepted),
            (CallState::Dialing, CallInput::Accept),
            (CallState::Dialing, CallInput::PlaceCall { peer: "y".into() }),
            (CallState::Active, CallInput::RemoteAccepted),
            (CallState::Active, CallInput::Accept),
            (CallState::Ending, CallInput::RemoteAccepted),
        ];

        for (state, input) in cases {
            let mut m = machine_in(state);
            let before = m.state();
            let err = m.transition(input.clone()).unwrap_err();
            assert_eq!(err.state, before, "wrong error state for {:?}", input);
            assert_eq!(m.state(), before, "state mutated by illegal {:?}", input);
        }
    }

    #[test]
    fn session_invariant_holds_across_a_long_legal_sequence() {
        let mut m = CallStateMachine::new();
        let script = vec![
            CallInput::ConnectionOpened,
            CallInput::RemoteReady,
            CallInput::RemoteCallRequest { peer: "a".into() },
            CallInput::Reject,
            CallInput::PlaceCall { peer: "b".into() },
            CallInput::RemoteRejected,
            CallInput::PlaceCall { peer: "c".into() },
            CallInput::RemoteAccepted,
            CallInput::RemoteEnded,
            CallInput::PipelineStopped,
        ];
        for input in script {
            m.transition(input).unwrap();
            let call_state = matches!(
                m.state(),
                CallState::Dialing | CallState::RingingIncoming | CallState::Active | CallState::Ending
            );
            assert_eq!(m.has_session(), call_state);
        }
        assert_eq!(m.state(), CallState::Idle);
    }
}
