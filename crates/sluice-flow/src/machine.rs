//! Subscription state machine -- one token, one RTS/CTS conversation.
//!
//! Pure: no I/O, no clocks. Every event returns `FlowActions` for the driver
//! to execute in order. Waiting for a download slot is the driver's job; the
//! machine only reports `needs_clear_to_send()` and emits CTS when told a
//! slot is free.
//!
//!   Idle -> Connecting -> AwaitingSubscribed -> Waiting <-> AwaitingResource
//!                                                  \-> Complete
//!   any non-terminal -> Cancelled | Failed

use std::sync::Arc;

use sluice_protocol::{MessageKind, ProtocolMessage, Token};

use crate::backoff::ResumePolicy;
use crate::item::{Resource, ResourceItem, Terminal};
use crate::stats::FlowStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    Connecting = 1,
    AwaitingSubscribed = 2,
    Waiting = 3,
    AwaitingResource = 4,
    Complete = 5,
    Cancelled = 6,
    Failed = 7,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Cancelled | Phase::Failed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Connecting => "connecting",
            Phase::AwaitingSubscribed => "awaiting_subscribed",
            Phase::Waiting => "waiting",
            Phase::AwaitingResource => "awaiting_resource",
            Phase::Complete => "complete",
            Phase::Cancelled => "cancelled",
            Phase::Failed => "failed",
        }
    }

    pub(crate) fn from_u8(v: u8) -> Phase {
        match v {
            0 => Phase::Idle,
            1 => Phase::Connecting,
            2 => Phase::AwaitingSubscribed,
            3 => Phase::Waiting,
            4 => Phase::AwaitingResource,
            5 => Phase::Complete,
            6 => Phase::Cancelled,
            _ => Phase::Failed,
        }
    }
}

/// One side effect for the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowAction {
    /// Establish a transport (through the reconnect coordinator).
    Open,
    /// Write a frame on the current transport.
    Send(ProtocolMessage),
    /// Append an item to the delivery queue.
    Deliver(ResourceItem),
    /// Append the terminal marker to the delivery queue.
    Finish(Terminal),
    /// Close the current transport (idempotent).
    Close,
}

/// Result of feeding one event to the machine.
#[derive(Debug, Default)]
pub struct FlowActions {
    pub actions: Vec<FlowAction>,
    /// (from, to) if the phase changed.
    pub transition: Option<(Phase, Phase)>,
    /// Set when the event was ignored as a protocol violation.
    pub violation: Option<String>,
}

impl FlowActions {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Frames this event asks the driver to send.
    pub fn sends(&self) -> impl Iterator<Item = &ProtocolMessage> {
        self.actions.iter().filter_map(|a| match a {
            FlowAction::Send(m) => Some(m),
            _ => None,
        })
    }
}

pub struct SubscriptionMachine {
    token: Token,
    phase: Phase,
    resume_policy: ResumePolicy,
    /// SUBSCRIBED seen at least once; later handshakes are resumes.
    established: bool,
    /// In `AwaitingResource`: CTS already written for the current RTS.
    cts_sent: bool,
    next_seq: u64,
    stats: Arc<FlowStats>,
}

impl SubscriptionMachine {
    pub fn new(token: impl Into<Token>, resume_policy: ResumePolicy) -> Self {
        Self::with_stats(token, resume_policy, Arc::new(FlowStats::new()))
    }

    pub fn with_stats(
        token: impl Into<Token>,
        resume_policy: ResumePolicy,
        stats: Arc<FlowStats>,
    ) -> Self {
        stats.set_phase(Phase::Idle);
        Self {
            token: token.into(),
            phase: Phase::Idle,
            resume_policy,
            established: false,
            cts_sent: false,
            next_seq: 1,
            stats,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn stats(&self) -> &Arc<FlowStats> {
        &self.stats
    }

    /// An RTS is outstanding and no CTS has answered it yet.
    pub fn needs_clear_to_send(&self) -> bool {
        self.phase == Phase::AwaitingResource && !self.cts_sent
    }

    /// Caller asked for the stream: `Idle -> Connecting`.
    pub fn subscribe(&mut self) -> FlowActions {
        let mut out = FlowActions::default();
        if self.phase != Phase::Idle {
            return self.violation(out, format!("subscribe while {}", self.phase.name()));
        }
        self.transition(&mut out, Phase::Connecting);
        out.actions.push(FlowAction::Open);
        out
    }

    /// Transport is up: send SUBSCRIBE.
    pub fn on_open(&mut self) -> FlowActions {
        let mut out = FlowActions::default();
        if self.phase != Phase::Connecting {
            tracing::debug!(
                token = %self.token,
                phase = self.phase.name(),
                "transport open outside connecting phase ignored"
            );
            return out;
        }
        self.transition(&mut out, Phase::AwaitingSubscribed);
        out.actions
            .push(FlowAction::Send(ProtocolMessage::subscribe(self.token.clone())));
        out
    }

    /// A download slot is free; answer the outstanding RTS if there is one.
    pub fn on_slot_available(&mut self) -> FlowActions {
        let mut out = FlowActions::default();
        if !self.needs_clear_to_send() {
            return out;
        }
        self.cts_sent = true;
        FlowStats::bump(&self.stats.cts_sent);
        out.actions
            .push(FlowAction::Send(ProtocolMessage::clear_to_send(self.token.clone())));
        out
    }

    /// One frame from the server.
    pub fn on_message(&mut self, message: ProtocolMessage) -> FlowActions {
        let out = FlowActions::default();
        if self.phase.is_terminal() {
            tracing::debug!(
                token = %self.token,
                kind = %message.kind(),
                phase = self.phase.name(),
                "frame after terminal phase dropped"
            );
            return out;
        }
        if message.token() != self.token {
            let reason = format!("foreign token {} on {}", message.token(), message.kind());
            return self.violation(out, reason);
        }
        if message.kind().is_server_bound() {
            let reason = format!("server sent client frame {}", message.kind());
            return self.violation(out, reason);
        }

        let kind = message.kind();
        match (self.phase, message) {
            (
                Phase::AwaitingSubscribed | Phase::Waiting | Phase::AwaitingResource,
                ProtocolMessage::Ping { .. },
            ) => {
                let mut out = out;
                out.actions
                    .push(FlowAction::Send(ProtocolMessage::pong(self.token.clone())));
                out
            }
            (Phase::AwaitingSubscribed, ProtocolMessage::Subscribed { resumed, .. }) => {
                self.on_subscribed(out, resumed)
            }
            (Phase::Waiting | Phase::AwaitingResource, ProtocolMessage::Subscribed { .. }) => {
                tracing::debug!(token = %self.token, "duplicate SUBSCRIBED ignored");
                out
            }
            (Phase::Waiting, ProtocolMessage::ReadyToSend { .. }) => {
                let mut out = out;
                self.cts_sent = false;
                self.transition(&mut out, Phase::AwaitingResource);
                out
            }
            (Phase::AwaitingResource, ProtocolMessage::Resource { token, body }) if self.cts_sent => {
                let seq = self.take_seq();
                FlowStats::bump(&self.stats.resources);
                let item = ResourceItem::Resource(Resource::from_body(seq, token, body));
                self.delivered(out, item)
            }
            (Phase::AwaitingResource, ProtocolMessage::Error { token, body }) if self.cts_sent => {
                let seq = self.take_seq();
                FlowStats::bump(&self.stats.errors);
                let item = ResourceItem::Error {
                    seq,
                    token,
                    text: body,
                };
                self.delivered(out, item)
            }
            (Phase::Waiting | Phase::AwaitingResource, ProtocolMessage::Complete { .. }) => {
                let mut out = out;
                self.transition(&mut out, Phase::Complete);
                tracing::info!(
                    token = %self.token,
                    delivered = self.next_seq - 1,
                    "subscription complete"
                );
                out.actions.push(FlowAction::Finish(Terminal::Complete));
                out.actions.push(FlowAction::Close);
                out
            }
            (phase, _) => self.violation(out, format!("unexpected {kind} while {}", phase.name())),
        }
    }

    /// Transport dropped unexpectedly: back to `Connecting` for a resume.
    pub fn on_transport_lost(&mut self, reason: &str) -> FlowActions {
        let mut out = FlowActions::default();
        if self.phase.is_terminal() || self.phase == Phase::Idle {
            return out;
        }
        tracing::warn!(
            token = %self.token,
            phase = self.phase.name(),
            reason,
            "transport lost, reconnecting"
        );
        FlowStats::bump(&self.stats.reconnects);
        self.cts_sent = false;
        self.transition(&mut out, Phase::Connecting);
        out.actions.push(FlowAction::Close);
        out.actions.push(FlowAction::Open);
        out
    }

    /// The reconnect coordinator gave up.
    pub fn on_reconnect_exhausted(&mut self, reason: &str) -> FlowActions {
        self.fail(format!("reconnect attempts exhausted: {reason}"))
    }

    /// Caller cancelled. Safe to call in any phase.
    pub fn cancel(&mut self) -> FlowActions {
        let mut out = FlowActions::default();
        if self.phase.is_terminal() {
            return out;
        }
        tracing::info!(token = %self.token, phase = self.phase.name(), "subscription cancelled");
        self.transition(&mut out, Phase::Cancelled);
        out.actions.push(FlowAction::Finish(Terminal::Cancelled));
        out.actions.push(FlowAction::Close);
        out
    }

    /// Fatal fault outside the frame stream (consumer gone, local error).
    pub fn fail(&mut self, reason: impl Into<String>) -> FlowActions {
        let mut out = FlowActions::default();
        if self.phase.is_terminal() {
            return out;
        }
        let reason = reason.into();
        tracing::error!(token = %self.token, phase = self.phase.name(), %reason, "subscription failed");
        self.transition(&mut out, Phase::Failed);
        out.actions.push(FlowAction::Finish(Terminal::Failed(reason)));
        out.actions.push(FlowAction::Close);
        out
    }

    fn on_subscribed(&mut self, mut out: FlowActions, resumed: bool) -> FlowActions {
        if self.established && !resumed {
            match self.resume_policy {
                ResumePolicy::Fail => {
                    return self.fail("server lost subscription state on resume");
                }
                ResumePolicy::Restart => {
                    tracing::warn!(
                        token = %self.token,
                        "server restarted subscription from scratch, resources may repeat"
                    );
                }
            }
        } else if resumed {
            tracing::info!(token = %self.token, "subscription resumed");
        } else {
            tracing::info!(token = %self.token, "subscription opened");
        }
        self.established = true;
        self.transition(&mut out, Phase::Waiting);
        out
    }

    fn delivered(&mut self, mut out: FlowActions, item: ResourceItem) -> FlowActions {
        self.cts_sent = false;
        self.transition(&mut out, Phase::Waiting);
        out.actions.push(FlowAction::Deliver(item));
        out
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn transition(&mut self, out: &mut FlowActions, to: Phase) {
        let from = self.phase;
        if from == to {
            return;
        }
        tracing::debug!(token = %self.token, from = from.name(), to = to.name(), "phase transition");
        self.phase = to;
        self.stats.set_phase(to);
        out.transition = Some((from, to));
    }

    fn violation(&mut self, mut out: FlowActions, reason: String) -> FlowActions {
        tracing::warn!(
            token = %self.token,
            phase = self.phase.name(),
            %reason,
            "protocol violation ignored"
        );
        FlowStats::bump(&self.stats.violations);
        out.violation = Some(reason);
        out
    }
}
