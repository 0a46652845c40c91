//! Per-slot dispatch loops.
//!
//! Each listener owns one call channel. It parks on the call word while it
//! is idle, decodes the record when a ref marks it pending, runs the call
//! inside `catch_unwind`, writes the reply and errno, then flips the word
//! back to idle and wakes the caller. A listener retires after serving the
//! close of its own descriptor, or when the Park shuts down.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use farm_abi::layout::{
    CALL_IDLE, CALL_PENDING, CALL_SHUTDOWN, ERRNO_PARK_FAULT, REPLY_KIND_WORD, SLOT_RETIRED,
};
use farm_abi::Errno;
use tracing::{debug, error, trace, warn};

use super::ParkInner;
use crate::error::{panic_message, FarmError};
use crate::region::{Record, Slot};
use crate::sync::lock;
use crate::wire::{Reply, Request};

/// Which call channel a listener serves.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Channel {
    Fd(u32),
    Base,
}

pub(crate) fn run(inner: &Arc<ParkInner>, channel: Channel) {
    let slot = match channel {
        Channel::Fd(fd) => match inner.region.slot(fd) {
            Some(slot) => slot,
            None => return,
        },
        Channel::Base => inner.region.base(),
    };
    debug!(?channel, "listener started");
    loop {
        slot.call.wait(CALL_IDLE, None);
        match slot.call.load() {
            CALL_IDLE => continue,
            CALL_PENDING => {}
            CALL_SHUTDOWN => {
                slot.set_state(SLOT_RETIRED);
                break;
            }
            other => {
                error!(?channel, word = other, "protocol violation: unexpected call word; resetting");
                reset(inner, slot);
                continue;
            }
        }
        let retire = serve(inner, channel, &slot.record());
        if retire {
            slot.set_state(SLOT_RETIRED);
        }
        reset(inner, slot);
        if retire {
            break;
        }
    }
    debug!(?channel, "listener retired");
}

fn reset(inner: &ParkInner, slot: &Slot) {
    slot.call.store(CALL_IDLE);
    slot.call.wake(u32::MAX);
    if let Some(partner) = slot.take_abandoned() {
        reclaim(inner, slot, partner);
    }
}

/// Free the reply a timed-out caller will never read and release the locks
/// it left held.
fn reclaim(inner: &ParkInner, slot: &Slot, partner: Option<u32>) {
    if let Err(e) = Reply::decode(&slot.record(), inner.region.arena()) {
        warn!(error = %e, "abandoned reply payload could not be freed");
    }
    lock::release(&slot.lock, "abandoned");
    if let Some(other) = partner.and_then(|fd| inner.region.slot(fd)) {
        lock::release(&other.lock, "abandoned-pair");
    }
    debug!(?partner, "abandoned call reclaimed");
}

/// Serve one pending call. Returns whether the listener should retire.
fn serve(inner: &Arc<ParkInner>, channel: Channel, record: &Record<'_>) -> bool {
    let arena = inner.region.arena();
    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<(Errno, Reply, bool), FarmError> {
        let request = Request::decode(record, arena)?;
        trace!(?channel, func = request.func().name(), "dispatch");
        match (channel, request) {
            (Channel::Base, Request::SetFdsMap { ref_id, fds }) => {
                Ok((inner.set_fds_map(ref_id, &fds), Reply::None, false))
            }
            (Channel::Fd(fd), request) if request.fd() == fd => inner.dispatch(request),
            (channel, request) => Err(FarmError::Protocol(format!(
                "{} for descriptor {} arrived on {:?}",
                request.func().name(),
                request.fd(),
                channel
            ))),
        }
    }));
    match outcome {
        Ok(Ok((errno, reply, retire))) => {
            if let Err(e) = reply.encode(record, arena) {
                error!(?channel, error = %e, "reply payload could not be written");
                fault(record);
            } else {
                record.set_errno_raw(i32::from(errno.raw()));
            }
            retire
        }
        Ok(Err(e)) => {
            error!(?channel, error = %e, "call rejected");
            fault(record);
            false
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref()).unwrap_or_else(|| "non-string panic".into());
            error!(?channel, panic = %message, "dispatch panicked; slot recovered");
            fault(record);
            false
        }
    }
}

fn fault(record: &Record<'_>) {
    record.set_u32(REPLY_KIND_WORD, 0);
    record.set_errno_raw(ERRNO_PARK_FAULT);
}
