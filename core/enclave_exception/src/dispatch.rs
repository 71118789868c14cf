//! Exception dispatch state machine.
//!
//! A dispatch walks the handler snapshot taken when it started, most recently registered handler first:
//!
//! ```text
//!   Searching(0) --ContinueSearch--> Searching(1) --...--> Searching(n) --(no handler left)--> Exhausted
//!        |                                                                                        |
//!        +--ContinueExecution--> Resolved                                                         v
//!        +--AbortExecution / unrecognized verdict ------------------------------------------> Aborted
//! ```
//!
//! `Resolved` writes the (possibly modified) register context back for the trap stub to restore. Every other
//! outcome, including a payload that failed validation, ends in the termination policy. Each handler is invoked
//! at most once per exception.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::fmt;

use crate::abi;
use crate::config::ExceptionConfig;
use crate::error::PayloadError;
use crate::platform::PlatformCapabilities;
use crate::record::{ExceptionRecord, RecordBuilder, TrapPayload};
use crate::registry::{HandlerRegistry, HandlerSnapshot, RegistrationHandle};
use crate::termination::TerminationPolicy;

/// A handler's decision about an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Not handled here, consult the next handler.
    ContinueSearch,
    /// Resolved, resume execution with the (possibly modified) register context.
    ContinueExecution,
    /// Terminate, regardless of the handlers not yet consulted.
    AbortExecution,
}

impl Verdict {
    /// Decodes a verdict returned through the C ABI. Anything but the three known values is `None`.
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            abi::EXCEPTION_CONTINUE_SEARCH => Some(Verdict::ContinueSearch),
            abi::EXCEPTION_CONTINUE_EXECUTION => Some(Verdict::ContinueExecution),
            abi::EXCEPTION_ABORT_EXECUTION => Some(Verdict::AbortExecution),
            _ => None,
        }
    }

    pub const fn as_raw(self) -> u64 {
        match self {
            Verdict::ContinueSearch => abi::EXCEPTION_CONTINUE_SEARCH,
            Verdict::ContinueExecution => abi::EXCEPTION_CONTINUE_EXECUTION,
            Verdict::AbortExecution => abi::EXCEPTION_ABORT_EXECUTION,
        }
    }
}

/// Why an exception ended in termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The raw payload failed validation, no record was built.
    MalformedPayload(PayloadError),
    /// The subsystem was not initialized when the exception was raised.
    NotStarted,
    /// The handler registry could not be read, typically because the faulting thread holds its lock.
    RegistryUnavailable,
    /// A handler returned [`Verdict::AbortExecution`].
    HandlerAborted(RegistrationHandle),
    /// A handler returned a value that is not a verdict.
    ContractViolation { handle: RegistrationHandle, verdict: u64 },
    /// Every handler returned [`Verdict::ContinueSearch`], or none was installed.
    Exhausted,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::MalformedPayload(e) => write!(f, "malformed trap payload: {e}"),
            AbortReason::NotStarted => write!(f, "exception subsystem not initialized"),
            AbortReason::RegistryUnavailable => write!(f, "exception handler registry unavailable"),
            AbortReason::HandlerAborted(handle) => write!(f, "handler {} aborted execution", handle.as_raw()),
            AbortReason::ContractViolation { handle, verdict } => {
                write!(f, "handler {} returned unrecognized verdict {verdict:#x}", handle.as_raw())
            }
            AbortReason::Exhausted => write!(f, "no handler resolved the exception"),
        }
    }
}

/// Final outcome of dispatching one exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The handler with this handle resolved the exception, execution resumes.
    ContinueExecution(RegistrationHandle),
    /// The faulting thread must be terminated.
    Abort(AbortReason),
}

/// States of a single dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Consult the handler at this index of the snapshot next.
    Searching(usize),
    Resolved(RegistrationHandle),
    Exhausted,
    Aborted(AbortReason),
}

impl DispatchState {
    /// Returns true for the states a dispatch ends in.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DispatchState::Resolved(_) | DispatchState::Aborted(_))
    }
}

/// Walks `snapshot` against `record` until a terminal state is reached.
pub fn walk(snapshot: &HandlerSnapshot, record: &mut ExceptionRecord<'_>) -> Disposition {
    let mut state = DispatchState::Searching(0);
    loop {
        state = match state {
            DispatchState::Searching(index) => match snapshot.get(index) {
                None => DispatchState::Exhausted,
                Some(registration) => {
                    let handle = registration.handle();
                    match registration.invoke(record) {
                        Ok(Verdict::ContinueSearch) => {
                            log::trace!("Handler {:?} continued the search.", handle);
                            DispatchState::Searching(index + 1)
                        }
                        Ok(Verdict::ContinueExecution) => DispatchState::Resolved(handle),
                        Ok(Verdict::AbortExecution) => DispatchState::Aborted(AbortReason::HandlerAborted(handle)),
                        Err(verdict) => {
                            log::warn!("Handler {:?} returned unrecognized verdict {:#x}.", handle, verdict);
                            DispatchState::Aborted(AbortReason::ContractViolation { handle, verdict })
                        }
                    }
                }
            },
            DispatchState::Exhausted => DispatchState::Aborted(AbortReason::Exhausted),
            DispatchState::Resolved(handle) => return Disposition::ContinueExecution(handle),
            DispatchState::Aborted(reason) => return Disposition::Abort(reason),
        }
    }
}

/// Dispatches exceptions raised on the calling thread.
///
/// Dispatchers share nothing but the registry, so any number of threads may dispatch concurrently.
pub struct Dispatcher<'a> {
    registry: &'a HandlerRegistry,
    builder: RecordBuilder<'a>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        registry: &'a HandlerRegistry,
        config: &'a ExceptionConfig,
        platform: &'a dyn PlatformCapabilities,
    ) -> Self {
        Self { registry, builder: RecordBuilder::new(config, platform) }
    }

    /// Builds the record for `trap` and walks the handlers installed right now.
    ///
    /// On [`Disposition::ContinueExecution`] the register context has been written back into `trap.context`.
    pub fn dispatch(&self, trap: &mut TrapPayload<'_>) -> Disposition {
        let mut context = match self.builder.capture_context(trap) {
            Ok(context) => context,
            Err(e) => return Disposition::Abort(AbortReason::MalformedPayload(e)),
        };

        let disposition = match self.builder.build(trap, &mut context) {
            Ok(mut record) => match self.registry.try_snapshot() {
                Some(snapshot) => {
                    log::trace!("Dispatching {:?} to {} handlers.", record.code(), snapshot.len());
                    walk(&snapshot, &mut record)
                }
                None => Disposition::Abort(AbortReason::RegistryUnavailable),
            },
            Err(e) => Disposition::Abort(AbortReason::MalformedPayload(e)),
        };

        if let Disposition::ContinueExecution(_) = disposition {
            if let Err(e) = context.write_to(&mut trap.context[..]) {
                return Disposition::Abort(AbortReason::MalformedPayload(e));
            }
        }
        disposition
    }

    /// Dispatches `trap` and terminates the thread through `policy` unless a handler resolved it.
    ///
    /// Returns only when execution is to resume from the context written back into `trap.context`.
    pub fn handle(&self, trap: &mut TrapPayload<'_>, policy: &dyn TerminationPolicy) {
        match self.dispatch(trap) {
            Disposition::ContinueExecution(handle) => {
                log::trace!("Exception resolved by handler {:?}.", handle);
            }
            Disposition::Abort(reason) => policy.terminate(&reason),
        }
    }
}
