//! Exception Context Model
//!
//! Data definitions shared by the record builder, the dispatcher and installed handlers: the closed set of
//! exception codes, the hardware/software flags, the saved register context and the decoded page-fault error code.
//!
//! The register context has a fixed `#[repr(C)]` layout because the trap entry stub hands it over as raw bytes
//! and restores it verbatim into the CPU when a handler resumes execution.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use bitfield_struct::bitfield;
use core::mem::{align_of, offset_of, size_of};

use crate::error::PayloadError;

/// Size in bytes of the basic XSTATE area (legacy x87 and SSE state, the `FXSAVE` image).
pub const BASIC_XSTATE_SIZE: usize = 512;

/// Required alignment of the basic XSTATE area and of the register context that embeds it.
pub const CONTEXT_ALIGNMENT: usize = 16;

/// Exception codes reported to handlers.
///
/// This is a closed set. Raw values that do not map onto one of the known codes become [`ExceptionCode::Unknown`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    DivideByZero = 0x0,
    Breakpoint = 0x1,
    BoundOutOfRange = 0x2,
    IllegalInstruction = 0x3,
    AccessViolation = 0x4,
    PageFault = 0x5,
    X87FloatPoint = 0x6,
    Misalignment = 0x7,
    SimdFloatPoint = 0x8,
    Unknown = 0xFFFF_FFFF,
}

impl ExceptionCode {
    /// Maps a raw exception code onto the closed set.
    pub const fn from_raw(code: u32) -> Self {
        match code {
            0x0 => ExceptionCode::DivideByZero,
            0x1 => ExceptionCode::Breakpoint,
            0x2 => ExceptionCode::BoundOutOfRange,
            0x3 => ExceptionCode::IllegalInstruction,
            0x4 => ExceptionCode::AccessViolation,
            0x5 => ExceptionCode::PageFault,
            0x6 => ExceptionCode::X87FloatPoint,
            0x7 => ExceptionCode::Misalignment,
            0x8 => ExceptionCode::SimdFloatPoint,
            _ => ExceptionCode::Unknown,
        }
    }

    /// Maps an x86 exception vector onto the closed set.
    ///
    /// Vectors that enclave code cannot observe or handle (NMI, double fault, machine check, ...) are
    /// [`ExceptionCode::Unknown`].
    pub const fn from_hardware_vector(vector: u8) -> Self {
        match vector {
            0 => ExceptionCode::DivideByZero,
            3 => ExceptionCode::Breakpoint,
            5 => ExceptionCode::BoundOutOfRange,
            6 => ExceptionCode::IllegalInstruction,
            13 => ExceptionCode::AccessViolation,
            14 => ExceptionCode::PageFault,
            16 => ExceptionCode::X87FloatPoint,
            17 => ExceptionCode::Misalignment,
            19 => ExceptionCode::SimdFloatPoint,
            _ => ExceptionCode::Unknown,
        }
    }

    /// Returns the raw code as seen through the C ABI.
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// Returns true for the classes that may carry an extended fault payload (#PF and #GP).
    pub const fn has_extended_info(self) -> bool {
        matches!(self, ExceptionCode::PageFault | ExceptionCode::AccessViolation)
    }
}

/// Where the exception originated. Exactly one of the two is set for every exception.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionFlags {
    /// Enclave execution exited because of a hardware exception.
    Hardware = 0x1,
    /// Enclave software raised the exception.
    Software = 0x2,
}

impl ExceptionFlags {
    /// Decodes a raw flags word. Returns `None` unless exactly one known bit is set.
    pub const fn from_raw(flags: u32) -> Option<Self> {
        match flags {
            0x1 => Some(ExceptionFlags::Hardware),
            0x2 => Some(ExceptionFlags::Software),
            _ => None,
        }
    }

    pub const fn as_raw(self) -> u32 {
        self as u32
    }
}

/// Blob that contains x87 and SSE data.
#[repr(C, align(16))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BasicXState {
    pub blob: [u8; BASIC_XSTATE_SIZE],
}

impl BasicXState {
    pub const fn zeroed() -> Self {
        Self { blob: [0; BASIC_XSTATE_SIZE] }
    }
}

impl Default for BasicXState {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl core::fmt::Debug for BasicXState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // The blob is CPU defined and opaque here.
        f.debug_struct("BasicXState").field("len", &self.blob.len()).finish_non_exhaustive()
    }
}

/// Register state saved when the exception was taken and restored when a handler continues execution.
///
/// Segment registers and the extended (AVX and later) XSTATE components are not part of the context.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterContext {
    /// Raw exception flags, see [`ExceptionFlags`].
    pub flags: u64,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    /// SSE control and status.
    pub mxcsr: u32,
    pub basic_xstate: BasicXState,
}

const _: () = assert!(size_of::<RegisterContext>() == RegisterContext::SIZE);
const _: () = assert!(align_of::<RegisterContext>() == CONTEXT_ALIGNMENT);
const _: () = assert!(offset_of!(RegisterContext, basic_xstate) % CONTEXT_ALIGNMENT == 0);

macro_rules! u64_fields {
    ($callback:ident) => {
        $callback!(flags, rax, rbx, rcx, rdx, rbp, rsp, rdi, rsi, r8, r9, r10, r11, r12, r13, r14, r15, rip)
    };
}

impl RegisterContext {
    /// Size of the context in bytes as exchanged with the trap entry stub.
    pub const SIZE: usize = 672;

    /// Parses a context from the raw bytes captured by the trap entry stub.
    ///
    /// The bytes are copied without interpretation. Padding between `mxcsr` and the XSTATE area is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::BadContextSize`] if `bytes` is not exactly [`Self::SIZE`] long.
    /// Returns [`PayloadError::MisalignedContext`] if `bytes` does not start on a 16 byte boundary.
    ///
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        check_buffer(bytes)?;

        let mut context = Self::default();
        macro_rules! read_fields {
            ($($field:ident),*) => {
                $(context.$field = read_u64(bytes, offset_of!(RegisterContext, $field));)*
            };
        }
        u64_fields!(read_fields);

        let mxcsr = offset_of!(RegisterContext, mxcsr);
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[mxcsr..mxcsr + 4]);
        context.mxcsr = u32::from_le_bytes(raw);

        let xstate = offset_of!(RegisterContext, basic_xstate);
        context.basic_xstate.blob.copy_from_slice(&bytes[xstate..xstate + BASIC_XSTATE_SIZE]);

        Ok(context)
    }

    /// Writes the context back into a buffer in the layout the trap entry stub restores from.
    ///
    /// Padding bytes in `out` are left untouched so a context that was not modified restores byte for byte.
    ///
    /// # Errors
    ///
    /// Same as [`Self::from_bytes`].
    ///
    pub fn write_to(&self, out: &mut [u8]) -> Result<(), PayloadError> {
        check_buffer(out)?;

        macro_rules! write_fields {
            ($($field:ident),*) => {
                $(write_u64(out, offset_of!(RegisterContext, $field), self.$field);)*
            };
        }
        u64_fields!(write_fields);

        let mxcsr = offset_of!(RegisterContext, mxcsr);
        out[mxcsr..mxcsr + 4].copy_from_slice(&self.mxcsr.to_le_bytes());

        let xstate = offset_of!(RegisterContext, basic_xstate);
        out[xstate..xstate + BASIC_XSTATE_SIZE].copy_from_slice(&self.basic_xstate.blob);

        Ok(())
    }
}

fn check_buffer(bytes: &[u8]) -> Result<(), PayloadError> {
    if bytes.len() != RegisterContext::SIZE {
        return Err(PayloadError::BadContextSize { expected: RegisterContext::SIZE, actual: bytes.len() });
    }
    if bytes.as_ptr() as usize % CONTEXT_ALIGNMENT != 0 {
        return Err(PayloadError::MisalignedContext);
    }
    Ok(())
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Decoded view of the error code reported with #PF and #GP exceptions.
///
/// Only meaningful when the platform reports authentic extended fault information (SGX2 with `MISCSELECT.EXINFO`).
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct ErrorCodeBits {
    /// Set when the fault was a protection violation on a present page, clear when the page was not present.
    pub present: bool,
    /// Set when the fault was caused by a write, clear for a read.
    pub write: bool,
    /// Set when the access was a user-mode access, clear for supervisor mode.
    pub user_mode: bool,
    /// Set when a reserved bit was set in a paging structure.
    pub reserved_bit: bool,
    /// Set when the fault was caused by an instruction fetch.
    pub instruction_fetch: bool,
    /// Set when the fault was caused by a protection-key violation.
    pub protection_key: bool,
    #[bits(9)]
    _reserved_0: u16,
    /// Set when the fault is specific to the isolation boundary (an EPCM violation) rather than ordinary paging.
    pub isolation_boundary: bool,
    #[bits(16)]
    _reserved_1: u16,
}
