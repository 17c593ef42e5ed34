//! Slots written by the receive task and read by the machine.
//!
//! Process commands are level-triggered flags: once seen they stay set for
//! the lifetime of the device. Bind responses are kept only when they answer
//! the request currently awaited.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, MutexGuard, PoisonError,
};

use tracing::debug;

use crate::core::protocol::{BindResponse, ProcessCommand};

#[derive(Default)]
struct BindSlot {
    expected: Option<String>,
    response: Option<BindResponse>,
}

#[derive(Default)]
pub struct DeviceSignals {
    start: AtomicBool,
    stop: AtomicBool,
    bind: Mutex<BindSlot>,
}

impl DeviceSignals {
    pub fn new() -> Self {
        Self::default()
    }

    fn bind_slot(&self) -> MutexGuard<'_, BindSlot> {
        self.bind.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_command(&self, command: ProcessCommand) {
        match command {
            ProcessCommand::Start => self.start.store(true, Ordering::SeqCst),
            ProcessCommand::Finish => self.stop.store(true, Ordering::SeqCst),
        }
    }

    pub fn start_requested(&self) -> bool {
        self.start.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Arms the slot for `req_id`, discarding any earlier response.
    pub fn expect_bind(&self, req_id: &str) {
        let mut slot = self.bind_slot();
        slot.expected = Some(req_id.to_string());
        slot.response = None;
    }

    /// Stores `response` if it answers the awaited request.
    pub fn offer_bind_response(&self, response: BindResponse) -> bool {
        let mut slot = self.bind_slot();
        if slot.expected.as_deref() != Some(response.req_id.as_str()) {
            debug!(
                "Ignoring bind response for req_id={} (not ours)",
                response.req_id
            );
            return false;
        }
        slot.response = Some(response);
        true
    }

    pub fn take_bind_response(&self) -> Option<BindResponse> {
        self.bind_slot().response.take()
    }
}
