//! Module for the error taxonomy of the exception subsystem.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::fmt;

/// A specialized [`Result`](core::result::Result) type for exception subsystem operations.
pub type Result<T> = core::result::Result<T, ExceptionError>;

/// Errors returned by the registry, the record builder and the enclave lifecycle.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ExceptionError {
    /// The parameter was incorrect.
    InvalidParameter,
    /// The registry has no room for another handler.
    OutOfResources,
    /// The registration handle does not name a live registration.
    NotFound,
    /// The subsystem has already been initialized.
    AlreadyStarted,
    /// The subsystem has not been initialized.
    NotStarted,
    /// The raw trap payload failed structural validation. No record was built.
    MalformedPayload(PayloadError),
}

/// Structural validation failures of a raw trap payload.
///
/// Every variant means the payload cannot be trusted and the exception must be treated as unresolved.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PayloadError {
    /// The trap frame or its register context buffer is missing.
    MissingContext,
    /// The register context buffer is not the size of a [`RegisterContext`](crate::context::RegisterContext).
    BadContextSize { expected: usize, actual: usize },
    /// The register context buffer does not start on a 16 byte boundary.
    MisalignedContext,
    /// The flags word is not exactly one of hardware or software.
    InvalidFlags(u32),
    /// The flags saved in the register context disagree with the flags of the trap.
    FlagsMismatch { trap: u32, context: u64 },
    /// The faulting instruction address lies outside the enclave.
    AddressOutOfRange(u64),
    /// The saved instruction pointer lies outside the enclave.
    InstructionPointerOutOfRange(u64),
    /// The trap claims valid extended fault information but did not supply any.
    ExtendedInfoMissing,
}

impl From<PayloadError> for ExceptionError {
    fn from(e: PayloadError) -> Self {
        ExceptionError::MalformedPayload(e)
    }
}

impl fmt::Display for ExceptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionError::InvalidParameter => write!(f, "invalid parameter"),
            ExceptionError::OutOfResources => write!(f, "exception handler registry is full"),
            ExceptionError::NotFound => write!(f, "exception handler registration not found"),
            ExceptionError::AlreadyStarted => write!(f, "exception subsystem already initialized"),
            ExceptionError::NotStarted => write!(f, "exception subsystem not initialized"),
            ExceptionError::MalformedPayload(e) => write!(f, "malformed trap payload: {e}"),
        }
    }
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadError::MissingContext => write!(f, "register context missing"),
            PayloadError::BadContextSize { expected, actual } => {
                write!(f, "register context is {actual} bytes, expected {expected}")
            }
            PayloadError::MisalignedContext => write!(f, "register context is not 16 byte aligned"),
            PayloadError::InvalidFlags(flags) => write!(f, "invalid exception flags {flags:#x}"),
            PayloadError::FlagsMismatch { trap, context } => {
                write!(f, "trap flags {trap:#x} disagree with context flags {context:#x}")
            }
            PayloadError::AddressOutOfRange(_) => write!(f, "faulting address outside the enclave"),
            PayloadError::InstructionPointerOutOfRange(_) => write!(f, "saved rip outside the enclave"),
            PayloadError::ExtendedInfoMissing => write!(f, "extended fault info claimed but absent"),
        }
    }
}
