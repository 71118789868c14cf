//! Enclave Exception Crate
//!
//! Vectored exception dispatch for code running inside a trusted execution environment. When the processor raises
//! an exception on an enclave thread, the trap entry stub hands the raw exception information to this crate. The
//! crate validates it, builds an [`ExceptionRecord`], and offers it to every registered handler, most recently
//! registered first, until one resolves it or terminates the thread.
//!
//! ## Examples
//!
//! ```
//! use enclave_exception::{
//!     Disposition, Dispatcher, EnclaveRange, ExceptionCode, ExceptionConfig, HandlerRegistry, RegisterContext,
//!     StaticCapabilities, TrapPayload, Verdict,
//! };
//!
//! let registry = HandlerRegistry::new();
//! let config = ExceptionConfig::new(EnclaveRange::new(0x10_0000, 0x10_0000));
//! let platform = StaticCapabilities::default();
//!
//! // Step over `int3`.
//! let handle = registry
//!     .register_fn(|record| match record.code() {
//!         ExceptionCode::Breakpoint => {
//!             record.context_mut().rip += 1;
//!             Verdict::ContinueExecution
//!         }
//!         _ => Verdict::ContinueSearch,
//!     })
//!     .unwrap();
//!
//! #[repr(C, align(16))]
//! struct Saved([u8; RegisterContext::SIZE]);
//! let mut saved = Saved([0; RegisterContext::SIZE]);
//! RegisterContext { flags: 0x1, rip: 0x10_1000, ..Default::default() }.write_to(&mut saved.0).unwrap();
//!
//! let mut trap = TrapPayload {
//!     code: 0x1,
//!     flags: 0x1,
//!     address: 0x10_1000,
//!     context: &mut saved.0,
//!     extended_info_valid: false,
//!     extended: None,
//! };
//! let disposition = Dispatcher::new(&registry, &config, &platform).dispatch(&mut trap);
//! assert_eq!(Disposition::ContinueExecution(handle), disposition);
//! assert_eq!(0x10_1001, RegisterContext::from_bytes(&saved.0).unwrap().rip);
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]
extern crate alloc;

pub mod abi;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod enclave;
pub mod error;
pub mod platform;
pub mod record;
pub mod registry;
pub mod termination;

pub use config::{EnclaveRange, ExceptionConfig, ExtendedFaultOptIn};
pub use context::{BasicXState, ErrorCodeBits, ExceptionCode, ExceptionFlags, RegisterContext};
pub use dispatch::{AbortReason, DispatchState, Dispatcher, Disposition, Verdict};
pub use error::{ExceptionError, PayloadError, Result};
pub use platform::{PlatformCapabilities, StaticCapabilities};
pub use record::{ExceptionRecord, ExtendedFault, RawExtendedFault, TrapPayload};
pub use registry::{
    ExceptionHandler, HandlerRegistry, HandlerSnapshot, HandlerType, Registration, RegistrationHandle,
    MAX_EXCEPTION_HANDLERS, SNAPSHOT_ATTEMPTS,
};
pub use termination::{AbortEnclaveThread, TerminationPolicy};
