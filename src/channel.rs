//! Per-pipette command state machine.
//!
//! A [`Channel`] owns the mutable state of one pipette. Writers (`accept`,
//! `on_device_signal`, `on_link_error`, `reset`) are serialized by a mutex;
//! after every mutation the state and completion flag are published to an
//! atomic word so `poll_completion` never waits on a writer. Serial I/O never
//! happens here: accepted commands are queued to the channel's worker thread.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::command::{ChannelParams, Command};
use crate::constants::{STATUS_BUSY, STATUS_FAULTED, STATUS_IDLE};
use crate::register_map::{ChannelDefaults, ChannelId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Busy,
    Faulted,
}

impl ChannelState {
    /// Value exposed on the status register.
    pub const fn code(self) -> u16 {
        match self {
            Self::Idle => STATUS_IDLE,
            Self::Busy => STATUS_BUSY,
            Self::Faulted => STATUS_FAULTED,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Busy => "BUSY",
            Self::Faulted => "FAULTED",
        }
    }

    const fn to_bits(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Busy => 1,
            Self::Faulted => 2,
        }
    }

    const fn from_bits(bits: u8) -> Self {
        match bits & STATE_MASK {
            1 => Self::Busy,
            2 => Self::Faulted,
            _ => Self::Idle,
        }
    }
}

const STATE_MASK: u8 = 0b011;
const COMPLETION_BIT: u8 = 0b100;

/// Signal read back from the device by the completion monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSignal {
    Completed,
    Error(String),
    Pending,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("a command is already in flight")]
    Busy,
    #[error("channel is faulted and needs a reset")]
    Faulted,
}

/// Work handed to a channel's serial worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkRequest {
    Execute(Command),
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub id: ChannelId,
    pub state: ChannelState,
    pub completion: bool,
    pub current_command: Option<Command>,
    pub params: ChannelParams,
    pub last_error: Option<String>,
    pub accepted: u32,
    pub rejected: u32,
    pub completed: u32,
    pub faults: u32,
}

#[derive(Debug)]
struct Inner {
    state: ChannelState,
    completion: bool,
    current_command: Option<Command>,
    params: ChannelParams,
    last_error: Option<String>,
    accepted: u32,
    rejected: u32,
    completed: u32,
    faults: u32,
}

impl Inner {
    fn fault(&mut self, reason: String) {
        self.state = ChannelState::Faulted;
        self.completion = false;
        self.current_command = None;
        self.last_error = Some(reason);
        self.faults = self.faults.wrapping_add(1);
    }
}

#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    inner: Mutex<Inner>,
    published: AtomicU8,
    link_tx: Sender<LinkRequest>,
}

impl Channel {
    /// Starts Idle with the completion flag raised so a robot polling for
    /// readiness may issue its first command.
    pub fn new(id: ChannelId, defaults: ChannelDefaults, link_tx: Sender<LinkRequest>) -> Self {
        let inner = Inner {
            state: ChannelState::Idle,
            completion: true,
            current_command: None,
            params: ChannelParams {
                volume: defaults.volume,
                dispense_amount: defaults.dispense_amount,
                speed: defaults.speed,
            },
            last_error: None,
            accepted: 0,
            rejected: 0,
            completed: 0,
            faults: 0,
        };
        let channel = Self {
            id,
            inner: Mutex::new(inner),
            published: AtomicU8::new(0),
            link_tx,
        };
        channel.publish(&channel.lock());
        channel
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    #[cfg(test)]
    pub fn accept(&self, command: Command) -> Result<(), Rejection> {
        self.accept_with(|_| command).map(|_| ())
    }

    /// Accept the command `build` makes from the channel's parameters. The
    /// parameters are read under the same lock that accepts the command.
    pub fn accept_with(
        &self,
        build: impl FnOnce(ChannelParams) -> Command,
    ) -> Result<Command, Rejection> {
        let mut inner = self.lock();
        let command = build(inner.params);
        debug_assert_eq!(command.channel, self.id, "command routed to wrong channel");
        match inner.state {
            ChannelState::Busy => {
                inner.rejected = inner.rejected.wrapping_add(1);
                log::warn!("{}: rejected {command}: busy", self.id);
                return Err(Rejection::Busy);
            }
            ChannelState::Faulted => {
                inner.rejected = inner.rejected.wrapping_add(1);
                log::warn!("{}: rejected {command}: faulted", self.id);
                return Err(Rejection::Faulted);
            }
            ChannelState::Idle => {}
        }

        if self.link_tx.send(LinkRequest::Execute(command)).is_err() {
            inner.fault("serial worker stopped".into());
            self.publish(&inner);
            log::error!("{}: serial worker stopped, channel faulted", self.id);
            return Err(Rejection::Faulted);
        }

        inner.state = ChannelState::Busy;
        inner.completion = false;
        inner.current_command = Some(command);
        inner.params = ChannelParams {
            volume: command.volume,
            dispense_amount: command.dispense_amount,
            speed: command.speed,
        };
        inner.accepted = inner.accepted.wrapping_add(1);
        self.publish(&inner);
        log::info!("{}: accepted {command}", self.id);
        Ok(command)
    }

    pub fn poll_completion(&self) -> bool {
        self.published.load(Ordering::Acquire) & COMPLETION_BIT != 0
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_bits(self.published.load(Ordering::Acquire))
    }

    pub fn on_device_signal(&self, signal: DeviceSignal) {
        match signal {
            DeviceSignal::Pending => {}
            DeviceSignal::Completed => {
                let mut inner = self.lock();
                if inner.state != ChannelState::Busy {
                    log::debug!(
                        "{}: completion ignored in state {}",
                        self.id,
                        inner.state.label()
                    );
                    return;
                }
                let finished = inner.current_command.take();
                inner.state = ChannelState::Idle;
                inner.completion = true;
                inner.completed = inner.completed.wrapping_add(1);
                self.publish(&inner);
                if let Some(command) = finished {
                    log::info!("{}: completed {command}", self.id);
                }
            }
            DeviceSignal::Error(reason) => {
                let mut inner = self.lock();
                log::error!("{}: device error: {reason}", self.id);
                inner.fault(reason);
                self.publish(&inner);
            }
        }
    }

    /// A send to the device failed.
    pub fn on_link_error(&self, reason: String) {
        let mut inner = self.lock();
        log::error!("{}: serial error: {reason}", self.id);
        inner.fault(reason);
        self.publish(&inner);
    }

    pub fn reset(&self) -> Result<(), Rejection> {
        let mut inner = self.lock();
        match inner.state {
            ChannelState::Busy => Err(Rejection::Busy),
            ChannelState::Idle => Ok(()),
            ChannelState::Faulted => {
                inner.state = ChannelState::Idle;
                inner.completion = true;
                inner.last_error = None;
                self.publish(&inner);
                log::info!("{}: reset to idle", self.id);
                Ok(())
            }
        }
    }

    pub fn params(&self) -> ChannelParams {
        self.lock().params
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        let inner = self.lock();
        ChannelSnapshot {
            id: self.id,
            state: inner.state,
            completion: inner.completion,
            current_command: inner.current_command,
            params: inner.params,
            last_error: inner.last_error.clone(),
            accepted: inner.accepted,
            rejected: inner.rejected,
            completed: inner.completed,
            faults: inner.faults,
        }
    }

    /// Ask the worker to stop; a worker that already exited is fine.
    pub fn terminate(&self) {
        self.link_tx.send(LinkRequest::Terminate).ok();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &Inner) {
        let mut bits = inner.state.to_bits();
        if inner.completion {
            bits |= COMPLETION_BIT;
        }
        self.published.store(bits, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::{Channel, ChannelState, DeviceSignal, LinkRequest, Rejection};
    use crate::command::{self, ChannelParams, Command};
    use crate::register_map::{ActionKind, ChannelDefaults, ChannelId};

    fn aspirate(volume: u16) -> Command {
        Command {
            channel: ChannelId::One,
            action: ActionKind::Aspirate,
            volume,
            dispense_amount: 1250,
            speed: 5,
        }
    }

    fn channel() -> (Channel, mpsc::Receiver<LinkRequest>) {
        let (tx, rx) = mpsc::channel();
        (Channel::new(ChannelId::One, ChannelDefaults::default(), tx), rx)
    }

    #[test]
    fn starts_idle_and_ready() {
        let (channel, _rx) = channel();
        assert_eq!(channel.state(), ChannelState::Idle);
        assert!(channel.poll_completion());
        assert_eq!(
            channel.params(),
            ChannelParams {
                volume: 5000,
                dispense_amount: 1250,
                speed: 5,
            }
        );
    }

    #[test]
    fn accept_moves_to_busy_and_queues_command() {
        let (channel, rx) = channel();
        channel.accept(aspirate(1000)).expect("idle channel accepts");

        assert_eq!(channel.state(), ChannelState::Busy);
        assert!(!channel.poll_completion());
        assert_eq!(channel.params().volume, 1000);
        assert_eq!(
            rx.try_recv().expect("command queued"),
            LinkRequest::Execute(aspirate(1000))
        );
    }

    #[test]
    fn busy_rejection_leaves_state_untouched() {
        let (channel, rx) = channel();
        channel.accept(aspirate(1000)).expect("idle channel accepts");
        let before = channel.snapshot();

        let err = channel.accept(aspirate(2000)).expect_err("busy channel rejects");
        assert_eq!(err, Rejection::Busy);

        let after = channel.snapshot();
        assert_eq!(after.state, before.state);
        assert_eq!(after.completion, before.completion);
        assert_eq!(after.current_command, before.current_command);
        assert_eq!(after.params, before.params);
        assert_eq!(after.rejected, 1);
        rx.try_recv().expect("first command queued");
        assert!(rx.try_recv().is_err(), "rejected command must not be queued");
    }

    #[test]
    fn completion_returns_to_idle() {
        let (channel, _rx) = channel();
        channel.accept(aspirate(1000)).expect("idle channel accepts");
        channel.on_device_signal(DeviceSignal::Completed);

        assert_eq!(channel.state(), ChannelState::Idle);
        assert!(channel.poll_completion());
        let snapshot = channel.snapshot();
        assert_eq!(snapshot.params.volume, 1000);
        assert_eq!(snapshot.current_command, None);
        assert_eq!(snapshot.completed, 1);
    }

    #[test]
    fn accept_with_builds_from_last_accepted_parameters() {
        let (channel, rx) = channel();
        channel.accept(aspirate(1000)).expect("idle channel accepts");
        channel.on_device_signal(DeviceSignal::Completed);
        rx.try_recv().expect("first command queued");

        let command = channel
            .accept_with(|params| {
                assert_eq!(params.volume, 1000);
                command::build_command(ChannelId::One, ActionKind::Aspirate, 0, params)
            })
            .expect("idle channel accepts");
        assert_eq!(command.volume, 1000);
        assert_eq!(
            rx.try_recv().expect("second command queued"),
            LinkRequest::Execute(command)
        );
    }

    #[test]
    fn pending_signal_changes_nothing() {
        let (channel, _rx) = channel();
        channel.accept(aspirate(1000)).expect("idle channel accepts");
        channel.on_device_signal(DeviceSignal::Pending);
        assert_eq!(channel.state(), ChannelState::Busy);
        assert!(!channel.poll_completion());
    }

    #[test]
    fn stray_completion_while_idle_is_ignored() {
        let (channel, _rx) = channel();
        channel.on_device_signal(DeviceSignal::Completed);
        assert_eq!(channel.snapshot().completed, 0);
        assert_eq!(channel.state(), ChannelState::Idle);
    }

    #[test]
    fn device_error_faults_from_any_state() {
        let (channel, _rx) = channel();
        channel.on_device_signal(DeviceSignal::Error("hardware error 7".into()));
        assert_eq!(channel.state(), ChannelState::Faulted);
        assert!(!channel.poll_completion());

        let snapshot = channel.snapshot();
        assert_eq!(snapshot.last_error.as_deref(), Some("hardware error 7"));
        assert_eq!(snapshot.faults, 1);
    }

    #[test]
    fn link_error_faults_busy_channel() {
        let (channel, _rx) = channel();
        channel.accept(aspirate(1000)).expect("idle channel accepts");
        channel.on_link_error("write failed".into());

        assert_eq!(channel.state(), ChannelState::Faulted);
        assert_eq!(channel.snapshot().current_command, None);
        assert_eq!(
            channel.accept(aspirate(10)).expect_err("faulted channel rejects"),
            Rejection::Faulted
        );
    }

    #[test]
    fn reset_recovers_faulted_channel() {
        let (channel, _rx) = channel();
        channel.on_link_error("write failed".into());
        channel.reset().expect("faulted channel resets");

        assert_eq!(channel.state(), ChannelState::Idle);
        assert!(channel.poll_completion());
        assert_eq!(channel.snapshot().last_error, None);
        channel.accept(aspirate(100)).expect("reset channel accepts");
    }

    #[test]
    fn reset_is_refused_while_busy_and_noop_when_idle() {
        let (channel, _rx) = channel();
        channel.reset().expect("idle reset is a no-op");
        assert_eq!(channel.state(), ChannelState::Idle);

        channel.accept(aspirate(100)).expect("idle channel accepts");
        assert_eq!(channel.reset(), Err(Rejection::Busy));
        assert_eq!(channel.state(), ChannelState::Busy);
    }

    #[test]
    fn stopped_worker_faults_on_accept() {
        let (channel, rx) = channel();
        drop(rx);
        assert_eq!(channel.accept(aspirate(100)), Err(Rejection::Faulted));
        assert_eq!(channel.state(), ChannelState::Faulted);
    }

    #[test]
    fn state_codes_match_status_register() {
        assert_eq!(ChannelState::Idle.code(), 0);
        assert_eq!(ChannelState::Busy.code(), 1);
        assert_eq!(ChannelState::Faulted.code(), 2);
    }
}
