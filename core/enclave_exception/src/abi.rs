//! C ABI surface of the exception subsystem.
//!
//! The trap entry stub and C code inside the enclave talk to the subsystem through the `#[repr(C)]` types and
//! `extern "C"` functions in this module. Raw verdict values are only ever seen here; everything past this module
//! works with [`Verdict`](crate::Verdict).
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::slice;

use crate::context::RegisterContext;
use crate::dispatch::AbortReason;
use crate::enclave;
use crate::error::{ExceptionError, PayloadError};
use crate::record::{ExceptionRecord, RawExtendedFault, TrapPayload};
use crate::registry::{HandlerType, RegistrationHandle};
use crate::termination::{AbortEnclaveThread, TerminationPolicy};

/// Raw verdict: not handled, consult the next handler.
pub const EXCEPTION_CONTINUE_SEARCH: u64 = 0x0;
/// Raw verdict: resolved, resume execution.
pub const EXCEPTION_CONTINUE_EXECUTION: u64 = 0xFFFF_FFFF;
/// Raw verdict: terminate.
pub const EXCEPTION_ABORT_EXECUTION: u64 = 0xFFFF_FFF0;

/// Exception record handed to C handlers.
///
/// There is no presence flag for the extended fields: they are zero whenever the extended information was not
/// delivered.
#[repr(C)]
#[derive(Debug)]
pub struct RawExceptionRecord {
    pub code: u32,
    pub flags: u32,
    pub address: u64,
    pub faulting_address: u64,
    pub error_code: u32,
    pub context: *mut RegisterContext,
}

/// C exception handler. Returns one of the `EXCEPTION_*` verdict values.
pub type RawExceptionHandler = extern "C" fn(*mut RawExceptionRecord) -> u64;

/// Runs a C handler against `record` and returns its raw verdict.
///
/// The handler sees the record's register context in place. Changes it makes to any other field are discarded.
pub(crate) fn invoke_routine(routine: RawExceptionHandler, record: &mut ExceptionRecord<'_>) -> u64 {
    let (faulting_address, error_code) =
        record.extended().map_or((0, 0), |extended| (extended.faulting_address(), extended.raw_error_code()));
    let mut raw = RawExceptionRecord {
        code: record.code().as_raw(),
        flags: record.flags().as_raw(),
        address: record.address(),
        faulting_address,
        error_code,
        context: record.context_mut() as *mut RegisterContext,
    };
    routine(&mut raw)
}

/// Frame built by the trap entry stub for [`enclave_dispatch_exception`].
#[repr(C)]
#[derive(Debug)]
pub struct RawTrapFrame {
    pub code: u32,
    pub flags: u32,
    pub address: u64,
    /// Saved register context, restored by the stub when execution continues.
    pub context: *mut u8,
    pub context_size: usize,
    /// Non-zero when the stub captured valid extended fault information.
    pub extended_info_valid: u8,
    pub faulting_address: u64,
    pub error_code: u32,
}

/// Status returned by the C registration functions.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

impl Status {
    pub const SUCCESS: Status = Status(0);
    pub const FAILURE: Status = Status(1);
    pub const INVALID_PARAMETER: Status = Status(2);
    pub const OUT_OF_RESOURCES: Status = Status(3);
    pub const NOT_FOUND: Status = Status(4);
    pub const ALREADY_STARTED: Status = Status(5);
    pub const NOT_STARTED: Status = Status(6);

    pub fn is_success(self) -> bool {
        self == Status::SUCCESS
    }
}

impl From<ExceptionError> for Status {
    fn from(value: ExceptionError) -> Self {
        match value {
            ExceptionError::InvalidParameter => Status::INVALID_PARAMETER,
            ExceptionError::OutOfResources => Status::OUT_OF_RESOURCES,
            ExceptionError::NotFound => Status::NOT_FOUND,
            ExceptionError::AlreadyStarted => Status::ALREADY_STARTED,
            ExceptionError::NotStarted => Status::NOT_STARTED,
            ExceptionError::MalformedPayload(_) => Status::FAILURE,
        }
    }
}

/// Installs a C handler in the enclave-wide registry, ahead of every handler already installed.
///
/// On success the registration handle is stored through `handle`.
///
/// # Safety
///
/// `handle` must be null or valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn enclave_add_vectored_exception_handler(
    handler: Option<RawExceptionHandler>,
    handle: *mut u64,
) -> Status {
    let Some(handler) = handler else {
        return Status::INVALID_PARAMETER;
    };
    if handle.is_null() {
        return Status::INVALID_PARAMETER;
    }

    match enclave::add_vectored_exception_handler(HandlerType::Routine(handler)) {
        Ok(registration) => {
            // SAFETY: `handle` is non-null and the caller guarantees it is writable.
            unsafe { handle.write(registration.as_raw()) };
            Status::SUCCESS
        }
        Err(e) => e.into(),
    }
}

/// Removes a handler from the enclave-wide registry. Returns false if `handle` is not registered.
#[no_mangle]
pub extern "C" fn enclave_remove_vectored_exception_handler(handle: u64) -> bool {
    enclave::remove_vectored_exception_handler(RegistrationHandle::from_raw(handle)).is_ok()
}

/// Entry point for the trap stub.
///
/// Returns only when a handler resolved the exception, with the resumed register context written back into
/// `frame.context`. Otherwise the faulting thread is terminated.
///
/// # Safety
///
/// `frame` must be null or point to a valid frame whose `context` is null or valid for `context_size` bytes of
/// reads and writes, not aliased for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn enclave_dispatch_exception(frame: *mut RawTrapFrame) {
    // SAFETY: forwarded from the caller.
    unsafe { dispatch_trap_frame(frame, &AbortEnclaveThread) }
}

/// Validates the raw frame pointers and dispatches, terminating through `policy` unless the exception is resolved.
///
/// # Safety
///
/// Same as [`enclave_dispatch_exception`].
unsafe fn dispatch_trap_frame(frame: *mut RawTrapFrame, policy: &dyn TerminationPolicy) {
    // SAFETY: the caller guarantees `frame` is null or valid.
    let Some(frame) = (unsafe { frame.as_ref() }) else {
        policy.terminate(&AbortReason::MalformedPayload(PayloadError::MissingContext));
    };
    if frame.context.is_null() {
        policy.terminate(&AbortReason::MalformedPayload(PayloadError::MissingContext));
    }

    // SAFETY: non-null, and the caller guarantees `context_size` bytes are valid and exclusively ours.
    let context = unsafe { slice::from_raw_parts_mut(frame.context, frame.context_size) };
    let mut trap = TrapPayload {
        code: frame.code,
        flags: frame.flags,
        address: frame.address,
        context,
        extended_info_valid: frame.extended_info_valid != 0,
        // The frame always carries the fields; they only hold data when the stub marked them valid.
        extended: (frame.extended_info_valid != 0)
            .then_some(RawExtendedFault { faulting_address: frame.faulting_address, error_code: frame.error_code }),
    };

    enclave::handle_exception(&mut trap, policy);
}
