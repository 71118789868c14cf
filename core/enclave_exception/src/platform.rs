//! Platform capabilities relevant to exception delivery.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

/// `MISCSELECT` bit that makes the CPU save the faulting address and error code of #PF and #GP in the SSA.
pub const MISCSELECT_EXINFO: u32 = 0x1;

/// Capabilities of the platform the enclave runs on.
///
/// Implementations must derive their answers from enclave-measured state (for example the enclave's own
/// `MISCSELECT`), never from values the host reports at exception time.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait PlatformCapabilities: Send + Sync {
    /// Returns true if the CPU reports authentic extended #PF/#GP information to the enclave.
    fn extended_fault_info(&self) -> bool;
}

/// Capabilities fixed at enclave start.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StaticCapabilities {
    extended_fault_info: bool,
}

impl StaticCapabilities {
    pub const fn new(extended_fault_info: bool) -> Self {
        Self { extended_fault_info }
    }

    /// Derives the capabilities from the `MISCSELECT` value the enclave was created with.
    pub const fn from_miscselect(miscselect: u32) -> Self {
        Self { extended_fault_info: miscselect & MISCSELECT_EXINFO != 0 }
    }
}

impl PlatformCapabilities for StaticCapabilities {
    fn extended_fault_info(&self) -> bool {
        self.extended_fault_info
    }
}
