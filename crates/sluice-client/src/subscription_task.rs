//! Subscription driver task -- one per active token.
//!
//! Each turn of the loop:
//!   1. cancelled: feed `cancel()` to the machine
//!   2. no transport: connect (initial connect or backoff reconnect)
//!   3. otherwise select on cancel, consumer drop, a free slot (only while
//!      a CTS is owed) and the next server frame
//!   4. execute the returned actions in order
//!
//! The machine decides; this task only performs I/O. It never blocks the
//! frame loop on slot availability, and checks the cancel flag before every
//! send.

use std::sync::atomic::Ordering;
use std::time::Duration;

use sluice_flow::{
    DeliverySender, FlowAction, FlowActions, Phase, QueueError, SlotTracker, SubscriptionMachine,
    Terminal,
};
use sluice_protocol::ProtocolMessage;
use tokio_util::sync::CancellationToken;

use crate::reconnect::{ReconnectError, Reconnector};
use crate::transport::{Connector, Transport, TransportError};

pub struct SubscriptionTask<C: Connector> {
    machine: SubscriptionMachine,
    reconnector: Reconnector<C>,
    slots: SlotTracker,
    queue: DeliverySender,
    cancel: CancellationToken,
    slot_poll: Duration,
    transport: Option<C::Transport>,
    /// Connect attempt number; 0 until the first failure or loss.
    attempt: u32,
    terminal: Option<Terminal>,
}

impl<C: Connector> SubscriptionTask<C> {
    pub fn new(
        machine: SubscriptionMachine,
        reconnector: Reconnector<C>,
        slots: SlotTracker,
        queue: DeliverySender,
        cancel: CancellationToken,
        slot_poll: Duration,
    ) -> Self {
        Self {
            machine,
            reconnector,
            slots,
            queue,
            cancel,
            slot_poll,
            transport: None,
            attempt: 0,
            terminal: None,
        }
    }

    /// Drive the subscription to a terminal phase.
    pub async fn run(mut self) -> Terminal {
        let token = self.machine.token().to_string();
        tracing::info!(%token, "subscription task started");

        let opened = self.machine.subscribe();
        self.apply(opened).await;

        while !self.machine.is_terminal() {
            let actions = self.next_event().await;
            self.apply(actions).await;
        }

        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }

        let terminal = self
            .terminal
            .take()
            .unwrap_or_else(|| Terminal::Failed("driver stopped without a terminal marker".into()));
        let stats = self.machine.stats().snapshot();
        tracing::info!(
            %token,
            %terminal,
            cts_sent = stats.cts_sent,
            resources = stats.resources,
            errors = stats.errors,
            reconnects = stats.reconnects,
            violations = stats.violations,
            "subscription task finished"
        );
        terminal
    }

    async fn next_event(&mut self) -> FlowActions {
        if self.cancel.is_cancelled() {
            return self.machine.cancel();
        }
        if self.transport.is_none() {
            return self.connect().await;
        }
        let owes_cts = self.machine.needs_clear_to_send();
        let Some(transport) = self.transport.as_mut() else {
            return FlowActions::default();
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => self.machine.cancel(),
            _ = self.queue.consumer_dropped() => {
                tracing::info!(token = %self.machine.token(), "all consumers dropped the stream");
                self.machine.cancel()
            }
            _ = slot_freed(&self.slots, self.slot_poll), if owes_cts => {
                self.machine.on_slot_available()
            }
            frame = transport.recv() => on_frame(&mut self.machine, frame),
        }
    }

    async fn connect(&mut self) -> FlowActions {
        let token = self.machine.token().to_string();
        let attempt = self.attempt;

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return self.machine.cancel(),
            _ = self.queue.consumer_dropped() => return self.machine.cancel(),
            result = self.reconnector.reconnect(&token, attempt) => result,
        };

        match result {
            Ok(transport) => {
                self.transport = Some(transport);
                self.machine.on_open()
            }
            Err(e @ ReconnectError::GiveUp { .. }) => {
                self.machine.on_reconnect_exhausted(&e.to_string())
            }
            Err(ReconnectError::Attempt { .. }) => {
                self.attempt += 1;
                FlowActions::default()
            }
        }
    }

    /// Execute actions in order. An action that produces a follow-up event
    /// (failed send, cancelled delivery) replaces whatever was left.
    async fn apply(&mut self, mut out: FlowActions) {
        loop {
            self.track_attempts(&out);
            let mut follow_up = None;
            for action in out.actions.drain(..) {
                if let Some(next) = self.execute(action).await {
                    follow_up = Some(next);
                    break;
                }
            }
            match follow_up {
                Some(next) => out = next,
                None => return,
            }
        }
    }

    fn track_attempts(&mut self, out: &FlowActions) {
        match out.transition {
            Some((Phase::AwaitingSubscribed, Phase::Waiting)) => {
                self.attempt = 0;
                self.reconnector.reset();
            }
            Some((from, Phase::Connecting)) if from != Phase::Idle => {
                self.attempt += 1;
            }
            _ => {}
        }
    }

    async fn execute(&mut self, action: FlowAction) -> Option<FlowActions> {
        match action {
            // The loop connects whenever there is no transport.
            FlowAction::Open => None,
            FlowAction::Send(message) => self.send(message).await,
            FlowAction::Deliver(item) => {
                let seq = item.seq();
                let pushed = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    result = self.queue.push(item) => Some(result),
                };
                match pushed {
                    Some(Ok(())) => {
                        tracing::debug!(token = %self.machine.token(), seq, "item delivered");
                        None
                    }
                    None => Some(self.machine.cancel()),
                    Some(Err(QueueError::ConsumerGone)) => {
                        tracing::info!(token = %self.machine.token(), seq, "consumer gone, cancelling");
                        Some(self.machine.cancel())
                    }
                    Some(Err(QueueError::Closed)) => {
                        Some(self.machine.fail("delivery queue closed under a live subscription"))
                    }
                }
            }
            FlowAction::Finish(terminal) => {
                if let Err(e) = self.queue.close(terminal.clone()) {
                    tracing::debug!(token = %self.machine.token(), "terminal marker not written: {e}");
                }
                self.terminal = Some(terminal);
                None
            }
            FlowAction::Close => {
                if let Some(mut transport) = self.transport.take() {
                    transport.close().await;
                }
                None
            }
        }
    }

    async fn send(&mut self, message: ProtocolMessage) -> Option<FlowActions> {
        if self.cancel.is_cancelled() && !self.machine.is_terminal() {
            return Some(self.machine.cancel());
        }
        let kind = message.kind();
        let Some(transport) = self.transport.as_mut() else {
            tracing::debug!(token = %self.machine.token(), %kind, "no transport, frame dropped");
            return None;
        };
        match transport.send(message).await {
            Ok(()) => {
                tracing::debug!(token = %self.machine.token(), %kind, "frame sent");
                None
            }
            Err(e) => Some(self.machine.on_transport_lost(&e.to_string())),
        }
    }
}

fn on_frame(
    machine: &mut SubscriptionMachine,
    frame: Option<Result<ProtocolMessage, TransportError>>,
) -> FlowActions {
    match frame {
        Some(Ok(message)) => machine.on_message(message),
        Some(Err(e)) if !e.is_fatal() => {
            tracing::warn!(token = %machine.token(), "undecodable frame ignored: {e}");
            machine.stats().violations.fetch_add(1, Ordering::Relaxed);
            FlowActions::default()
        }
        Some(Err(e)) => machine.on_transport_lost(&e.to_string()),
        None => machine.on_transport_lost("connection closed by server"),
    }
}

/// Resolves once `slots` has capacity. Wakes on permit release, with a
/// poll as fallback.
pub(crate) async fn slot_freed(slots: &SlotTracker, poll: Duration) {
    loop {
        let changed = slots.changed();
        tokio::pin!(changed);
        changed.as_mut().enable();
        if slots.has_capacity() {
            return;
        }
        tokio::select! {
            _ = changed => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
}
