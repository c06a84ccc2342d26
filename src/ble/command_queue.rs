//! Outbound GATT command queue.
//!
//! The transport accepts one read/write per link at a time. Each GATT
//! client owns one of these rings and pushes its requests through it:
//!
//! - commands leave strictly in submission order,
//! - a command refused with a transient error stays at the head and is
//!   retried on the next drain,
//! - a command for a link that is no longer the client's current link, or
//!   refused with a hard error, is abandoned,
//! - when the ring is full the oldest unsent command is overwritten and
//!   counted.
//!
//! Draining happens right after every enqueue and after every write/read
//! response on the link, so no scheduler is needed.

use crate::ble::transport::{Payload, Transport, WriteKind};
use crate::ble::ConnHandle;
use crate::config::COMMAND_QUEUE_LEN;

/// A GATT operation waiting for its turn.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GattRequest {
    Read {
        handle: u16,
    },
    Write {
        handle: u16,
        value: Payload,
        kind: WriteKind,
    },
}

/// A queued GATT operation bound to the link it was issued for.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PendingCommand {
    pub link: ConnHandle,
    pub request: GattRequest,
}

impl PendingCommand {
    pub fn read(link: ConnHandle, handle: u16) -> Self {
        Self {
            link,
            request: GattRequest::Read { handle },
        }
    }

    /// Write command; `value` is truncated to the ATT payload size.
    pub fn write(link: ConnHandle, handle: u16, value: &[u8], kind: WriteKind) -> Self {
        let mut payload = Payload::new();
        let n = value.len().min(payload.capacity());
        let _ = payload.extend_from_slice(&value[..n]);
        Self {
            link,
            request: GattRequest::Write {
                handle,
                value: payload,
                kind,
            },
        }
    }

    fn submit(&self, transport: &mut dyn Transport) -> Result<(), crate::error::TransportError> {
        match &self.request {
            GattRequest::Read { handle } => transport.gatt_read(self.link, *handle),
            GattRequest::Write {
                handle,
                value,
                kind,
            } => transport.gatt_write(self.link, *handle, value, *kind),
        }
    }
}

/// What a single drain step did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DrainOutcome {
    /// Nothing queued.
    Idle,
    /// The head command was accepted by the transport.
    Submitted,
    /// The transport was busy; the head command stays queued.
    Retry,
    /// The head command was abandoned.
    Dropped,
}

/// Fixed-capacity ring of pending commands. `N` must be a power of two.
pub struct CommandQueue<const N: usize = COMMAND_QUEUE_LEN> {
    buf: [Option<PendingCommand>; N],
    insert: usize,
    drain: usize,
    len: usize,
    overwritten: u32,
    abandoned: u32,
}

impl<const N: usize> Default for CommandQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> CommandQueue<N> {
    const MASK: usize = {
        assert!(N.is_power_of_two(), "command queue length must be a power of two");
        N - 1
    };

    pub fn new() -> Self {
        Self {
            buf: core::array::from_fn(|_| None),
            insert: 0,
            drain: 0,
            len: 0,
            overwritten: 0,
            abandoned: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Commands lost because the ring was full.
    pub fn overwritten(&self) -> u32 {
        self.overwritten
    }

    /// Commands dropped for a stale link, a hard transport error or a purge.
    pub fn abandoned(&self) -> u32 {
        self.abandoned
    }

    /// The command that will be submitted next.
    pub fn head(&self) -> Option<&PendingCommand> {
        if self.len == 0 {
            None
        } else {
            self.buf[self.drain].as_ref()
        }
    }

    /// Append a command. Never blocks; a full ring loses its oldest entry.
    pub fn enqueue(&mut self, command: PendingCommand) {
        if self.len == N {
            warn!("command queue full - overwriting oldest command on {:?}", command.link);
            self.buf[self.insert] = Some(command);
            self.insert = (self.insert + 1) & Self::MASK;
            self.drain = self.insert;
            self.overwritten = self.overwritten.wrapping_add(1);
            return;
        }

        self.buf[self.insert] = Some(command);
        self.insert = (self.insert + 1) & Self::MASK;
        self.len += 1;
    }

    /// Try to submit the head command.
    ///
    /// `current` is the owning client's live link; a command bound to any
    /// other link is stale and is dropped without touching the transport.
    pub fn drain_one(
        &mut self,
        transport: &mut dyn Transport,
        current: Option<ConnHandle>,
    ) -> DrainOutcome {
        let Some(command) = self.head() else {
            return DrainOutcome::Idle;
        };

        if Some(command.link) != current {
            debug!("dropping command for stale link {:?}", command.link);
            self.pop();
            self.abandoned = self.abandoned.wrapping_add(1);
            return DrainOutcome::Dropped;
        }

        match command.submit(transport) {
            Ok(()) => {
                self.pop();
                DrainOutcome::Submitted
            }
            Err(e) if e.is_transient() => {
                debug!("GATT read/write busy on {:?} - will retry", command.link);
                DrainOutcome::Retry
            }
            Err(e) => {
                warn!("GATT read/write on {:?} failed: {:?} - dropping", command.link, e);
                self.pop();
                self.abandoned = self.abandoned.wrapping_add(1);
                DrainOutcome::Dropped
            }
        }
    }

    /// Drain until a command is submitted, the transport is busy or the
    /// ring is empty. Dropped commands do not stop the drain.
    pub fn process(
        &mut self,
        transport: &mut dyn Transport,
        current: Option<ConnHandle>,
    ) -> DrainOutcome {
        loop {
            match self.drain_one(transport, current) {
                DrainOutcome::Dropped => continue,
                outcome => return outcome,
            }
        }
    }

    /// Remove every command bound to `link`, keeping the order of the
    /// rest. Returns how many were removed.
    pub fn purge(&mut self, link: ConnHandle) -> usize {
        let mut kept = 0;
        let mut removed = 0;
        for i in 0..self.len {
            let from = (self.drain + i) & Self::MASK;
            if let Some(command) = self.buf[from].take() {
                if command.link == link {
                    removed += 1;
                    continue;
                }
                let to = (self.drain + kept) & Self::MASK;
                self.buf[to] = Some(command);
                kept += 1;
            }
        }
        self.len = kept;
        self.insert = (self.drain + kept) & Self::MASK;
        self.abandoned = self.abandoned.wrapping_add(removed as u32);
        removed
    }

    fn pop(&mut self) {
        self.buf[self.drain] = None;
        self.drain = (self.drain + 1) & Self::MASK;
        self.len -= 1;
    }
}
