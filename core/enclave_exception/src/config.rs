//! Exception Subsystem Configuration
//!
//! Defines the configuration supplied once at enclave start. It carries the values the record builder needs to
//! decide which parts of a raw trap payload are trusted: the address range the enclave occupies and the classes
//! of exceptions for which the enclave opted in to receive extended fault information.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::context::ExceptionCode;

/// The linear address range occupied by the enclave image and its heap, stacks and thread control structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnclaveRange {
    base: u64,
    size: u64,
}

impl EnclaveRange {
    /// Creates a range of `size` bytes starting at `base`.
    pub const fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    pub const fn base(&self) -> u64 {
        self.base
    }

    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Returns true if `base <= address < base + size`.
    ///
    /// Written without computing `base + size` so a range that ends at the top of the address space works.
    pub const fn contains(&self, address: u64) -> bool {
        address >= self.base && address - self.base < self.size
    }
}

/// Per-class opt in for extended #PF/#GP fault information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtendedFaultOptIn {
    /// Deliver the faulting address and error code with page faults.
    pub page_fault: bool,
    /// Deliver the faulting address and error code with general protection faults (access violations).
    pub general_protection: bool,
}

impl ExtendedFaultOptIn {
    /// Opt in for both classes.
    pub const fn all() -> Self {
        Self { page_fault: true, general_protection: true }
    }

    /// Returns true if the enclave opted in for extended information on `code`.
    pub const fn covers(&self, code: ExceptionCode) -> bool {
        match code {
            ExceptionCode::PageFault => self.page_fault,
            ExceptionCode::AccessViolation => self.general_protection,
            _ => false,
        }
    }
}

/// Configuration of the exception subsystem.
///
/// The default configuration has an empty enclave range, so every payload fails validation until the loader
/// supplies the real range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExceptionConfig {
    pub enclave_range: EnclaveRange,
    pub capture_pf_gp: ExtendedFaultOptIn,
}

impl ExceptionConfig {
    pub const fn new(enclave_range: EnclaveRange) -> Self {
        Self { enclave_range, capture_pf_gp: ExtendedFaultOptIn { page_fault: false, general_protection: false } }
    }

    pub const fn with_capture_pf_gp(mut self, capture_pf_gp: ExtendedFaultOptIn) -> Self {
        self.capture_pf_gp = capture_pf_gp;
        self
    }
}
