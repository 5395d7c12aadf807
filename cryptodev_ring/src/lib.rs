// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fixed-capacity descriptor-set queue connecting a guest-side driver to a
//! host-side device, with a notification doorbell in each direction.
//!
//! A [`DescriptorSet`] is an ordered list of memory regions, split into
//! readable regions (filled by the guest, consumed by the host) and writable
//! regions (sized by the guest, produced by the host). The guest submits a
//! set and kicks the host; the host retrieves it, writes results into the
//! writable regions, and returns the whole set, which the guest then
//! retrieves as the completion. Each set is handed to each side exactly
//! once, so regions are never aliased across the boundary while the other
//! side owns them.
//!
//! The queue is a transport only: it attaches no meaning to region contents
//! or ordering. The wire schema layered on top lives in `cryptodev_protocol`.

#![forbid(unsafe_code)]

use event_listener::Event;
use event_listener::Listener;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by queue endpoints.
///
/// Transport failures are not recoverable within a call; callers treat them
/// as fatal and surface them distinct from any in-band device status.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RingError {
    /// The ring already holds its capacity of in-flight descriptor sets.
    #[error("descriptor ring is full")]
    Full,
    /// The other endpoint has been dropped.
    #[error("transport channel is closed")]
    Closed,
}

/// An ordered list of memory regions transferred to the host for one call.
#[derive(Debug, Default)]
pub struct DescriptorSet {
    readable: Vec<Vec<u8>>,
    writable: Vec<Vec<u8>>,
}

impl DescriptorSet {
    /// Creates an empty descriptor set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a guest-filled region the host may only read.
    pub fn push_readable(&mut self, bytes: Vec<u8>) {
        self.readable.push(bytes);
    }

    /// Appends a zero-filled region of `len` bytes for the host to produce.
    pub fn push_writable(&mut self, len: usize) {
        self.writable.push(vec![0; len]);
    }

    /// The readable regions, in submission order.
    pub fn readable_regions(&self) -> &[Vec<u8>] {
        &self.readable
    }

    /// The writable regions, in submission order.
    pub fn writable_regions(&self) -> &[Vec<u8>] {
        &self.writable
    }

    /// Splits the set into its readable half and a mutable writable half,
    /// so results can be produced while request regions stay borrowed.
    pub fn split_mut(&mut self) -> (&[Vec<u8>], &mut [Vec<u8>]) {
        (&self.readable, &mut self.writable)
    }
}

struct State {
    submitted: VecDeque<DescriptorSet>,
    completed: VecDeque<DescriptorSet>,
    /// Sets owned by the channel: submitted, in service, or awaiting
    /// completion retrieval.
    in_flight: usize,
    capacity: usize,
    guest_closed: bool,
    host_closed: bool,
}

struct Shared {
    state: Mutex<State>,
    /// Kicked on submit and on guest teardown.
    host_doorbell: Event,
    /// Kicked on completion and on host teardown.
    guest_doorbell: Event,
}

/// Creates a connected queue pair with room for `capacity` in-flight
/// descriptor sets.
pub fn connected_queue_pair(capacity: usize) -> (GuestHandle, HostHandle) {
    assert!(capacity > 0, "queue capacity must be nonzero");
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            submitted: VecDeque::new(),
            completed: VecDeque::new(),
            in_flight: 0,
            capacity,
            guest_closed: false,
            host_closed: false,
        }),
        host_doorbell: Event::new(),
        guest_doorbell: Event::new(),
    });
    (
        GuestHandle {
            shared: shared.clone(),
        },
        HostHandle { shared },
    )
}

/// The guest endpoint: submits descriptor sets and retrieves completions.
pub struct GuestHandle {
    shared: Arc<Shared>,
}

impl GuestHandle {
    /// Submits a descriptor set and rings the host doorbell.
    pub fn submit(&self, set: DescriptorSet) -> Result<(), RingError> {
        {
            let mut state = self.shared.state.lock();
            if state.host_closed {
                return Err(RingError::Closed);
            }
            if state.in_flight == state.capacity {
                return Err(RingError::Full);
            }
            state.in_flight += 1;
            state.submitted.push_back(set);
        }
        self.shared.host_doorbell.notify(1);
        Ok(())
    }

    /// Retrieves a completed descriptor set if one is ready.
    pub fn try_complete(&self) -> Option<DescriptorSet> {
        let mut state = self.shared.state.lock();
        let set = state.completed.pop_front();
        if set.is_some() {
            state.in_flight -= 1;
        }
        set
    }

    /// Blocks until a completed descriptor set is returned by the host.
    ///
    /// Each completion is handed back exactly once. Fails with
    /// [`RingError::Closed`] if the host endpoint goes away while requests
    /// are outstanding.
    pub fn wait_complete(&self) -> Result<DescriptorSet, RingError> {
        loop {
            let listener = self.shared.guest_doorbell.listen();
            {
                let mut state = self.shared.state.lock();
                if let Some(set) = state.completed.pop_front() {
                    state.in_flight -= 1;
                    return Ok(set);
                }
                if state.host_closed {
                    return Err(RingError::Closed);
                }
            }
            listener.wait();
        }
    }
}

impl Drop for GuestHandle {
    fn drop(&mut self) {
        self.shared.state.lock().guest_closed = true;
        self.shared.host_doorbell.notify(usize::MAX);
    }
}

/// The host endpoint: retrieves submitted sets and returns completions.
pub struct HostHandle {
    shared: Arc<Shared>,
}

impl HostHandle {
    /// Pops the next submitted descriptor set without blocking.
    pub fn try_next(&self) -> Option<DescriptorSet> {
        self.shared.state.lock().submitted.pop_front()
    }

    /// Blocks until a descriptor set is submitted.
    ///
    /// Fails with [`RingError::Closed`] once the guest endpoint is gone and
    /// all submitted sets have been drained.
    pub fn wait_next(&self) -> Result<DescriptorSet, RingError> {
        loop {
            let listener = self.shared.host_doorbell.listen();
            {
                let mut state = self.shared.state.lock();
                if let Some(set) = state.submitted.pop_front() {
                    return Ok(set);
                }
                if state.guest_closed {
                    return Err(RingError::Closed);
                }
            }
            listener.wait();
        }
    }

    /// Returns a serviced descriptor set to the guest and rings its
    /// doorbell.
    ///
    /// Must be called exactly once per set retrieved, whatever the outcome
    /// of servicing it; a dropped set would leave the guest blocked forever.
    pub fn complete(&self, set: DescriptorSet) {
        {
            let mut state = self.shared.state.lock();
            if state.guest_closed {
                // Nobody left to retrieve it.
                return;
            }
            state.completed.push_back(set);
        }
        self.shared.guest_doorbell.notify(1);
    }
}

impl Drop for HostHandle {
    fn drop(&mut self) {
        self.shared.state.lock().host_closed = true;
        self.shared.guest_doorbell.notify(usize::MAX);
    }
}
