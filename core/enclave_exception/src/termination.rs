//! Abort/termination policy for unresolved exceptions.
//!
//! An exception that no handler resolves ends the faulting thread's enclave execution. Nothing is retried and
//! nothing is resumed partially. The host only observes the enclave call failing.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::dispatch::AbortReason;

/// Trait for the fallback taken when an exception is not resolved.
pub trait TerminationPolicy: Sync {
    /// Ends the faulting thread's enclave execution. Never returns to the faulting code.
    fn terminate(&self, reason: &AbortReason) -> !;
}

/// Default policy: report the reason and abort.
///
/// Enclave images are built with `panic = "abort"`, so the panic never unwinds back into enclave code.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortEnclaveThread;

impl TerminationPolicy for AbortEnclaveThread {
    fn terminate(&self, reason: &AbortReason) -> ! {
        log::error!("Unhandled enclave exception: {}", reason);
        cfg_if::cfg_if! {
            if #[cfg(feature = "std")] {
                std::process::abort()
            } else {
                panic!("Unhandled enclave exception: {}", reason)
            }
        }
    }
}

/// Test policy that records the reason and unwinds out of the dispatch.
#[cfg(test)]
#[derive(Default)]
struct RecordingPolicy {
    reasons: spin::Mutex<alloc::vec::Vec<AbortReason>>,
}

#[cfg(test)]
impl TerminationPolicy for RecordingPolicy {
    fn terminate(&self, reason: &AbortReason) -> ! {
        self.reasons.lock().push(*reason);
        panic!("terminated: {}", reason)
    }
}

/// Runs `f` against a recording policy. Returns the reason `f` terminated with, or `None` if it returned.
#[cfg(test)]
pub(crate) fn terminated_with(f: impl FnOnce(&dyn TerminationPolicy)) -> Option<AbortReason> {
    let policy = RecordingPolicy::default();
    let result = std::panic::catch_unwind(core::panic::AssertUnwindSafe(|| f(&policy)));
    let reasons = policy.reasons.lock();
    match result {
        Ok(()) => {
            assert!(reasons.is_empty(), "Policy was invoked but execution continued!");
            None
        }
        Err(payload) => match reasons.as_slice() {
            [reason] => Some(*reason),
            [] => std::panic::resume_unwind(payload),
            _ => panic!("Policy invoked more than once: {:?}", *reasons),
        },
    }
}
