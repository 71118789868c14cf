//! Exception Record Builder
//!
//! Turns the raw payload handed over by the trap entry stub into an [`ExceptionRecord`]. The payload crosses the
//! trust boundary, so this is the only place trust is established:
//!
//! - unknown exception codes become [`ExceptionCode::Unknown`],
//! - the flags must name exactly one origin and agree with the flags saved in the context,
//! - the faulting address and the saved `rip` must lie inside the enclave,
//! - the register context must be exactly [`RegisterContext::SIZE`] bytes and 16 byte aligned,
//! - extended #PF/#GP information is kept only when the platform makes it authentic *and* the enclave opted in.
//!
//! Any structural failure fails closed: no record is built and the exception is treated as unresolved.
//! Records are only built by [`Dispatcher`](crate::Dispatcher), which validates the context captured from the same
//! payload it hands to handlers.
//! Passing these checks does not make an address safe to jump to. Handlers must treat addresses as data.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::config::ExceptionConfig;
use crate::context::{ErrorCodeBits, ExceptionCode, ExceptionFlags, RegisterContext};
use crate::error::PayloadError;
use crate::platform::PlatformCapabilities;

/// Extended fault information as reported by the trap entry stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawExtendedFault {
    pub faulting_address: u64,
    pub error_code: u32,
}

/// Raw exception information captured by the trap entry stub. Nothing in here is trusted.
#[derive(Debug)]
pub struct TrapPayload<'a> {
    pub code: u32,
    pub flags: u32,
    pub address: u64,
    /// Register context bytes. Written back in place when a handler continues execution.
    pub context: &'a mut [u8],
    /// Whether the stub claims the extended fault information is valid for this exception.
    pub extended_info_valid: bool,
    pub extended: Option<RawExtendedFault>,
}

/// Extended #PF/#GP information that passed the trust checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedFault {
    faulting_address: u64,
    error_code: ErrorCodeBits,
}

impl ExtendedFault {
    /// The memory address whose access faulted. This may be outside the enclave.
    pub fn faulting_address(&self) -> u64 {
        self.faulting_address
    }

    pub fn error_code(&self) -> ErrorCodeBits {
        self.error_code
    }

    pub fn raw_error_code(&self) -> u32 {
        self.error_code.into_bits()
    }
}

/// The record passed to every exception handler.
///
/// Handlers can read the code, flags and addresses, and may modify the register context before asking the
/// dispatcher to continue execution.
#[derive(Debug)]
pub struct ExceptionRecord<'c> {
    code: ExceptionCode,
    flags: ExceptionFlags,
    address: u64,
    extended: Option<ExtendedFault>,
    context: &'c mut RegisterContext,
}

impl<'c> ExceptionRecord<'c> {
    #[cfg(test)]
    pub(crate) fn new_for_test(code: ExceptionCode, flags: ExceptionFlags, context: &'c mut RegisterContext) -> Self {
        Self { code, flags, address: context.rip, extended: None, context }
    }

    pub fn code(&self) -> ExceptionCode {
        self.code
    }

    pub fn flags(&self) -> ExceptionFlags {
        self.flags
    }

    /// Address of the faulting instruction.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Extended #PF/#GP information, present only when it is authentic and the enclave opted in.
    pub fn extended(&self) -> Option<&ExtendedFault> {
        self.extended.as_ref()
    }

    pub fn context(&self) -> &RegisterContext {
        self.context
    }

    /// The context restored to the CPU if a handler continues execution.
    pub fn context_mut(&mut self) -> &mut RegisterContext {
        self.context
    }
}

/// Builds validated exception records from raw trap payloads.
pub(crate) struct RecordBuilder<'a> {
    config: &'a ExceptionConfig,
    platform: &'a dyn PlatformCapabilities,
}

impl<'a> RecordBuilder<'a> {
    pub(crate) fn new(config: &'a ExceptionConfig, platform: &'a dyn PlatformCapabilities) -> Self {
        Self { config, platform }
    }

    /// Copies the register context out of the payload.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::BadContextSize`] or [`PayloadError::MisalignedContext`] if the buffer does not hold
    /// a register context.
    ///
    pub(crate) fn capture_context(&self, payload: &TrapPayload<'_>) -> Result<RegisterContext, PayloadError> {
        RegisterContext::from_bytes(&payload.context[..])
    }

    /// Validates `payload` and builds the record handed to exception handlers.
    ///
    /// `context` is the context previously captured from the same payload.
    ///
    /// # Errors
    ///
    /// Returns the first [`PayloadError`] found. No partial record is ever returned.
    ///
    pub(crate) fn build<'c>(
        &self,
        payload: &TrapPayload<'_>,
        context: &'c mut RegisterContext,
    ) -> Result<ExceptionRecord<'c>, PayloadError> {
        let flags = ExceptionFlags::from_raw(payload.flags).ok_or(PayloadError::InvalidFlags(payload.flags))?;
        if context.flags != payload.flags as u64 {
            return Err(PayloadError::FlagsMismatch { trap: payload.flags, context: context.flags });
        }

        let range = self.config.enclave_range;
        if !range.contains(payload.address) {
            return Err(PayloadError::AddressOutOfRange(payload.address));
        }
        if !range.contains(context.rip) {
            return Err(PayloadError::InstructionPointerOutOfRange(context.rip));
        }

        if payload.extended_info_valid && payload.extended.is_none() {
            return Err(PayloadError::ExtendedInfoMissing);
        }

        let code = ExceptionCode::from_raw(payload.code);
        if code == ExceptionCode::Unknown {
            log::debug!("Normalized exception code {:#x} to unknown.", payload.code);
        }

        let extended = self.trusted_extended_fault(code, payload);

        Ok(ExceptionRecord { code, flags, address: payload.address, extended, context })
    }

    fn trusted_extended_fault(&self, code: ExceptionCode, payload: &TrapPayload<'_>) -> Option<ExtendedFault> {
        let raw = payload.extended?;

        if !code.has_extended_info() {
            log::trace!("Dropping extended fault info reported with {:?}.", code);
            return None;
        }
        if !payload.extended_info_valid {
            log::warn!("Dropping extended fault info not marked valid.");
            return None;
        }
        if !self.platform.extended_fault_info() {
            log::warn!("Dropping extended fault info, the platform cannot report it authentically.");
            return None;
        }
        if !self.config.capture_pf_gp.covers(code) {
            log::trace!("Dropping extended fault info for {:?}, no opt in.", code);
            return None;
        }

        Some(ExtendedFault {
            faulting_address: raw.faulting_address,
            error_code: ErrorCodeBits::from_bits(raw.error_code),
        })
    }
}
