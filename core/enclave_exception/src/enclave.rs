//! Enclave-wide exception subsystem state.
//!
//! The enclave owns exactly one handler registry and one configuration. Both live for the lifetime of the
//! enclave: [`initialize`] is called once by the runtime at enclave start, before the first exception can be
//! dispatched, and [`teardown`] when the enclave is destroyed. Nothing is persisted across an enclave restart.
//!
//! Code that does not need the enclave-wide state (tests in particular) should construct its own
//! [`HandlerRegistry`] and [`Dispatcher`] instead.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use spin::rwlock::RwLock;

use crate::config::ExceptionConfig;
use crate::dispatch::{AbortReason, Dispatcher, Disposition};
use crate::error::{ExceptionError, Result};
use crate::platform::{PlatformCapabilities, StaticCapabilities};
use crate::record::TrapPayload;
use crate::registry::{HandlerRegistry, HandlerType, RegistrationHandle};
use crate::termination::TerminationPolicy;

#[derive(Debug, Clone, Copy)]
struct EnclaveState {
    config: ExceptionConfig,
    capabilities: StaticCapabilities,
}

// The registry has its own lock so registration never waits on configuration readers.
static EXCEPTION_HANDLERS: HandlerRegistry = HandlerRegistry::new();
static ENCLAVE_STATE: RwLock<Option<EnclaveState>> = RwLock::new(None);

#[cfg(test)]
pub(crate) static TEST_LOCK: spin::Mutex<()> = spin::Mutex::new(());

/// Initializes the exception subsystem for this enclave.
///
/// # Errors
///
/// Returns [`AlreadyStarted`](ExceptionError::AlreadyStarted) if the subsystem is already initialized.
///
pub fn initialize(config: ExceptionConfig, capabilities: StaticCapabilities) -> Result<()> {
    let mut state = ENCLAVE_STATE.write();
    if state.is_some() {
        return Err(ExceptionError::AlreadyStarted);
    }

    log::debug!(
        "Exception subsystem initialized (extended fault info: {}, opt in: {:?}).",
        capabilities.extended_fault_info(),
        config.capture_pf_gp
    );
    *state = Some(EnclaveState { config, capabilities });
    Ok(())
}

/// Removes every handler and forgets the configuration.
pub fn teardown() {
    let mut state = ENCLAVE_STATE.write();
    EXCEPTION_HANDLERS.clear();
    *state = None;
    log::debug!("Exception subsystem torn down.");
}

pub fn is_initialized() -> bool {
    ENCLAVE_STATE.read().is_some()
}

/// The enclave-wide handler registry.
pub fn registry() -> &'static HandlerRegistry {
    &EXCEPTION_HANDLERS
}

/// Installs a handler in the enclave-wide registry, ahead of every handler already installed.
///
/// # Errors
///
/// Returns [`NotStarted`](ExceptionError::NotStarted) before [`initialize`].
/// Returns [`OutOfResources`](ExceptionError::OutOfResources) if the registry is full.
///
pub fn add_vectored_exception_handler(handler: HandlerType) -> Result<RegistrationHandle> {
    if !is_initialized() {
        return Err(ExceptionError::NotStarted);
    }
    EXCEPTION_HANDLERS.register(handler)
}

/// Removes a handler from the enclave-wide registry.
///
/// # Errors
///
/// Returns [`NotFound`](ExceptionError::NotFound) if `handle` is not registered.
///
pub fn remove_vectored_exception_handler(handle: RegistrationHandle) -> Result<()> {
    EXCEPTION_HANDLERS.unregister(handle)
}

// Copied out so handlers run without holding the lock.
fn current_state() -> Option<EnclaveState> {
    *ENCLAVE_STATE.read()
}

/// Dispatches an exception raised on the calling thread to the enclave-wide registry.
///
/// Fails closed with [`AbortReason::NotStarted`] before [`initialize`].
pub fn dispatch_exception(trap: &mut TrapPayload<'_>) -> Disposition {
    let Some(state) = current_state() else {
        return Disposition::Abort(AbortReason::NotStarted);
    };

    Dispatcher::new(&EXCEPTION_HANDLERS, &state.config, &state.capabilities).dispatch(trap)
}

/// Dispatches an exception raised on the calling thread and terminates through `policy` unless it is resolved.
///
/// Returns only when execution is to resume from the context written back into `trap.context`.
pub fn handle_exception(trap: &mut TrapPayload<'_>, policy: &dyn TerminationPolicy) {
    let Some(state) = current_state() else {
        policy.terminate(&AbortReason::NotStarted);
    };

    Dispatcher::new(&EXCEPTION_HANDLERS, &state.config, &state.capabilities).handle(trap, policy)
}
