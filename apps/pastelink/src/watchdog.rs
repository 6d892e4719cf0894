//! Channel supervision while a session is `Connecting`.
//!
//! Every tick looks at the elapsed time since the attempt started, whether the
//! data channel is open and whether the connection underneath it is usable,
//! and picks one of four outcomes: declare the session open, recreate a
//! stalled channel, give up, or look again after one interval.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::controller::{ConnectionController, FailureCause, Notice};
use crate::session::{AttemptId, Phase, Role, SessionEvent};
use crate::transport::ChannelState;

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);

pub const SENDER_CHANNEL_LABEL: &str = "passwordChannel";
pub const SENDER_FALLBACK_LABEL: &str = "passwordChannelSender";
pub const RECEIVER_FALLBACK_LABEL: &str = "passwordChannelReceiver";

pub fn fallback_label(role: Role) -> &'static str {
    match role {
        Role::Sender => SENDER_FALLBACK_LABEL,
        Role::Receiver => RECEIVER_FALLBACK_LABEL,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogPolicy {
    pub interval: Duration,
    /// How long a connected session may go without an open channel before
    /// the channel is recreated.
    pub grace: Duration,
    pub failure_budget: Duration,
    /// Whether a channel that is still connecting may be replaced. The
    /// receiver only falls back when it has no usable channel at all.
    pub replaces_pending_channel: bool,
}

impl WatchdogPolicy {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Sender => Self {
                interval: DEFAULT_INTERVAL,
                grace: Duration::from_millis(5_000),
                failure_budget: Duration::from_millis(20_000),
                replaces_pending_channel: true,
            },
            Role::Receiver => Self {
                interval: DEFAULT_INTERVAL,
                grace: Duration::from_millis(3_000),
                failure_budget: Duration::from_millis(15_000),
                replaces_pending_channel: false,
            },
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Decides what a tick does. The failure budget is checked before the
    /// fallback so a recreated channel never pushes the verdict past
    /// `failure_budget + interval`.
    pub fn judge(&self, probe: Probe) -> Verdict {
        if probe.channel == Some(ChannelState::Open) {
            Verdict::Open
        } else if probe.elapsed > self.failure_budget {
            Verdict::Fail
        } else if probe.connected
            && !probe.fallback_fired
            && probe.elapsed > self.grace
            && self.may_replace(probe.channel)
        {
            Verdict::RecreateChannel
        } else {
            Verdict::Continue
        }
    }

    fn may_replace(&self, channel: Option<ChannelState>) -> bool {
        match channel {
            None | Some(ChannelState::Closing | ChannelState::Closed) => true,
            Some(_) => self.replaces_pending_channel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub elapsed: Duration,
    pub channel: Option<ChannelState>,
    pub connected: bool,
    pub fallback_fired: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Open,
    RecreateChannel,
    Fail,
    Continue,
}

/// A scheduled tick. Dropping or cancelling the ticket aborts the tick.
#[derive(Debug)]
pub struct WatchdogTicket {
    handle: AbortHandle,
}

impl WatchdogTicket {
    pub fn schedule(
        tx: mpsc::UnboundedSender<SessionEvent>,
        attempt: AttemptId,
        delay: Duration,
    ) -> Self {
        let task = tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(SessionEvent::WatchdogTick { attempt });
        });
        Self {
            handle: task.abort_handle(),
        }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for WatchdogTicket {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl ConnectionController {
    pub(crate) fn arm_watchdog(&mut self, attempt: AttemptId) {
        let interval = self.config().watchdog_interval;
        let tx = self.event_sender();
        if let Some(session) = self.session_mut() {
            if session.attempt() == attempt && session.phase() == Phase::Connecting {
                session.store_ticket(WatchdogTicket::schedule(tx, attempt, interval));
            }
        }
    }

    pub(crate) async fn on_watchdog_tick(&mut self, attempt: AttemptId) {
        let interval = self.config().watchdog_interval;
        let Some(session) = self.session_mut() else {
            return;
        };
        if session.attempt() != attempt || session.phase() != Phase::Connecting {
            debug!(
                target: "pastelink::watchdog",
                %attempt,
                current = %session.attempt(),
                phase = %session.phase(),
                "ignoring tick for a session that is no longer supervised"
            );
            return;
        }
        session.take_ticket();

        let role = session.role();
        let connected = session.peer().is_some_and(|peer| peer.is_connected());
        if !connected {
            session.fallback_fired = false;
        }
        let probe = Probe {
            elapsed: session.elapsed(),
            channel: session.channel().map(|channel| channel.ready_state()),
            connected,
            fallback_fired: session.fallback_fired,
        };
        let policy = WatchdogPolicy::for_role(role).with_interval(interval);
        let verdict = policy.judge(probe);
        debug!(
            target: "pastelink::watchdog",
            %attempt,
            %role,
            elapsed_ms = probe.elapsed.as_millis() as u64,
            connected,
            channel = ?probe.channel,
            ?verdict,
            "tick"
        );

        match verdict {
            Verdict::Open => self.mark_open(),
            Verdict::Fail => {
                warn!(
                    target: "pastelink::watchdog",
                    %attempt,
                    %role,
                    budget_ms = policy.failure_budget.as_millis() as u64,
                    "data channel never opened"
                );
                self.fail(FailureCause::ChannelStalled).await;
            }
            Verdict::RecreateChannel => {
                self.recreate_channel().await;
                self.arm_watchdog(attempt);
            }
            Verdict::Continue => self.arm_watchdog(attempt),
        }
    }

    async fn recreate_channel(&mut self) {
        let Some(session) = self.session_mut() else {
            return;
        };
        session.fallback_fired = true;
        let role = session.role();
        let Some(peer) = session.peer().cloned() else {
            return;
        };
        if let Some(stale) = session.take_channel() {
            debug!(
                target: "pastelink::watchdog",
                channel = %stale.id(),
                state = ?stale.ready_state(),
                "closing stalled data channel"
            );
            stale.close().await;
        }

        let label = fallback_label(role);
        match peer.create_channel(label).await {
            Ok(channel) => {
                info!(
                    target: "pastelink::watchdog",
                    %role,
                    channel = %channel.id(),
                    label,
                    "created fallback data channel"
                );
                self.install_channel(channel);
                self.notify(Notice::ChannelRecreated {
                    role,
                    label: label.to_string(),
                });
            }
            Err(err) => {
                warn!(
                    target: "pastelink::watchdog",
                    %role,
                    error = %err,
                    "failed to create fallback data channel"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPEN: Option<ChannelState> = Some(ChannelState::Open);
    const PENDING: Option<ChannelState> = Some(ChannelState::Connecting);

    fn probe(
        elapsed_ms: u64,
        channel: Option<ChannelState>,
        connected: bool,
        fallback_fired: bool,
    ) -> Probe {
        Probe {
            elapsed: Duration::from_millis(elapsed_ms),
            channel,
            connected,
            fallback_fired,
        }
    }

    #[test]
    fn open_channel_wins_every_tick() {
        let policy = WatchdogPolicy::for_role(Role::Sender);
        assert_eq!(policy.judge(probe(0, OPEN, false, false)), Verdict::Open);
        assert_eq!(policy.judge(probe(60_000, OPEN, true, true)), Verdict::Open);
    }

    #[test]
    fn fallback_waits_for_grace_and_connectivity() {
        let sender = WatchdogPolicy::for_role(Role::Sender);
        assert_eq!(sender.judge(probe(5_000, PENDING, true, false)), Verdict::Continue);
        assert_eq!(
            sender.judge(probe(5_001, PENDING, true, false)),
            Verdict::RecreateChannel
        );
        assert_eq!(sender.judge(probe(9_000, PENDING, false, false)), Verdict::Continue);
        assert_eq!(sender.judge(probe(9_000, PENDING, true, true)), Verdict::Continue);

        let receiver = WatchdogPolicy::for_role(Role::Receiver);
        assert_eq!(receiver.judge(probe(3_001, None, true, false)), Verdict::RecreateChannel);
    }

    #[test]
    fn receiver_leaves_a_connecting_channel_alone() {
        let receiver = WatchdogPolicy::for_role(Role::Receiver);
        assert_eq!(receiver.judge(probe(3_001, PENDING, true, false)), Verdict::Continue);
        assert_eq!(receiver.judge(probe(14_000, PENDING, true, false)), Verdict::Continue);
        assert_eq!(
            receiver.judge(probe(3_001, Some(ChannelState::Closed), true, false)),
            Verdict::RecreateChannel
        );
        assert_eq!(
            receiver.judge(probe(3_001, Some(ChannelState::Closing), true, false)),
            Verdict::RecreateChannel
        );
    }

    #[test]
    fn failure_budget_is_role_specific() {
        let sender = WatchdogPolicy::for_role(Role::Sender);
        assert_eq!(sender.judge(probe(20_000, PENDING, true, true)), Verdict::Continue);
        assert_eq!(sender.judge(probe(20_001, PENDING, true, true)), Verdict::Fail);

        let receiver = WatchdogPolicy::for_role(Role::Receiver);
        assert_eq!(receiver.judge(probe(15_001, None, false, false)), Verdict::Fail);
        assert_eq!(receiver.judge(probe(15_001, PENDING, true, false)), Verdict::Fail);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_ticket_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ticket = WatchdogTicket::schedule(tx, AttemptId(3), DEFAULT_INTERVAL);
        ticket.cancel();
        sleep(DEFAULT_INTERVAL * 3).await;
        assert!(rx.try_recv().is_err());
        assert!(ticket.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn ticket_fires_once_after_interval() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ticket = WatchdogTicket::schedule(tx, AttemptId(4), DEFAULT_INTERVAL);
        sleep(DEFAULT_INTERVAL / 2).await;
        assert!(rx.try_recv().is_err());
        sleep(DEFAULT_INTERVAL).await;
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::WatchdogTick { attempt: AttemptId(4) })
        ));
        sleep(DEFAULT_INTERVAL * 3).await;
        assert!(rx.try_recv().is_err());
    }
}
