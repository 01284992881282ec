//! Lifecycle tracking: in-flight accounting and the close state machine.
//!
//! Every logical message and every datagram in flight holds a ticket.
//! Tickets decrement their counter when dropped, so every exit path of a
//! send (success, early abort, error, panic) releases exactly what it took.
//! Shutdown waits on the counters through a `watch` channel and finalizes
//! once both reach zero.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::error::GelfError;

/// Outstanding work at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InFlightCounters {
    /// Log calls that have not finished
    pub unsent_messages: usize,
    /// Datagrams handed to the transport that have not completed
    pub unsent_chunks: usize,
}

impl InFlightCounters {
    pub fn is_drained(&self) -> bool {
        self.unsent_messages == 0 && self.unsent_chunks == 0
    }
}

/// Counter pair shared by the client and its tickets.
#[derive(Debug)]
pub struct InFlight {
    counters: watch::Sender<InFlightCounters>,
}

impl InFlight {
    pub fn new() -> Self {
        let (counters, _) = watch::channel(InFlightCounters::default());
        Self { counters }
    }

    /// Count one logical message until the ticket is dropped.
    pub fn track_message(self: &Arc<Self>) -> MessageTicket {
        self.counters.send_modify(|c| c.unsent_messages += 1);
        MessageTicket {
            in_flight: Arc::clone(self),
        }
    }

    /// Count one datagram until the ticket is dropped.
    pub fn track_chunk(&self) -> ChunkTicket<'_> {
        self.counters.send_modify(|c| c.unsent_chunks += 1);
        ChunkTicket { in_flight: self }
    }

    pub fn snapshot(&self) -> InFlightCounters {
        *self.counters.borrow()
    }

    pub fn is_drained(&self) -> bool {
        self.snapshot().is_drained()
    }

    /// Resolve once both counters are zero.
    pub async fn drained(&self) {
        let mut rx = self.counters.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(InFlightCounters::is_drained).await;
    }
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for the lifetime of one log call.
#[derive(Debug)]
pub struct MessageTicket {
    in_flight: Arc<InFlight>,
}

impl Drop for MessageTicket {
    fn drop(&mut self) {
        self.in_flight
            .counters
            .send_modify(|c| c.unsent_messages -= 1);
    }
}

/// Held while one datagram is with the transport.
#[derive(Debug)]
pub struct ChunkTicket<'a> {
    in_flight: &'a InFlight,
}

impl Drop for ChunkTicket<'_> {
    fn drop(&mut self) {
        self.in_flight
            .counters
            .send_modify(|c| c.unsent_chunks -= 1);
    }
}

/// Client lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Sends accepted, socket may be created
    Active,
    /// Close requested, waiting for in-flight work to drain
    ClosePending,
    /// Socket released; terminal
    Closed,
}

/// Close state machine plus the in-flight counters it waits on.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
    in_flight: Arc<InFlight>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Active),
            in_flight: Arc::new(InFlight::new()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    /// Move from `Active` to `ClosePending`.
    ///
    /// # Errors
    ///
    /// Returns `GelfError::DoubleClose` if a close was already requested.
    /// The state is left untouched in that case.
    pub fn request_close(&self) -> Result<(), GelfError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            LifecycleState::Active => {
                *state = LifecycleState::ClosePending;
                Ok(())
            }
            LifecycleState::ClosePending | LifecycleState::Closed => Err(GelfError::DoubleClose),
        }
    }

    pub fn mark_closed(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = LifecycleState::Closed;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
