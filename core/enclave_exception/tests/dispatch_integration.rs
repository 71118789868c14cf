//! Enclave Exception Integration Tests
//!
//! Exercises dispatch through the public API the way a trap entry stub and enclave code use it.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Barrier, Mutex,
};

use enclave_exception::{
    AbortReason, Dispatcher, Disposition, EnclaveRange, ExceptionCode, ExceptionConfig, ExtendedFaultOptIn,
    HandlerRegistry, PayloadError, PlatformCapabilities, RawExtendedFault, RegisterContext, TrapPayload, Verdict,
};

const ENCLAVE_BASE: u64 = 0x7F00_0000_0000;
const ENCLAVE_SIZE: u64 = 0x40_0000;
const FAULTING_RIP: u64 = ENCLAVE_BASE + 0x1234;

/// Platform with SGX2 extended fault reporting.
struct ExInfoPlatform;

impl PlatformCapabilities for ExInfoPlatform {
    fn extended_fault_info(&self) -> bool {
        true
    }
}

/// Platform without extended fault reporting.
struct LegacyPlatform;

impl PlatformCapabilities for LegacyPlatform {
    fn extended_fault_info(&self) -> bool {
        false
    }
}

#[repr(C, align(16))]
struct SavedContext([u8; RegisterContext::SIZE]);

impl SavedContext {
    /// A context as a trap stub would save it, with every byte outside the registers set to a known pattern.
    fn new(flags: u64) -> Self {
        let mut saved = SavedContext([0; RegisterContext::SIZE]);
        for (i, byte) in saved.0.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(31).wrapping_add(7);
        }
        saved.0[0..8].copy_from_slice(&flags.to_le_bytes());
        saved.0[136..144].copy_from_slice(&FAULTING_RIP.to_le_bytes());
        saved
    }
}

fn config() -> ExceptionConfig {
    ExceptionConfig::new(EnclaveRange::new(ENCLAVE_BASE, ENCLAVE_SIZE))
}

fn breakpoint(saved: &mut SavedContext) -> TrapPayload<'_> {
    TrapPayload {
        code: 0x1,
        flags: 0x1,
        address: FAULTING_RIP,
        context: &mut saved.0,
        extended_info_valid: false,
        extended: None,
    }
}

#[test]
fn test_resumed_context_is_byte_identical_except_modified_fields() {
    let registry = HandlerRegistry::new();
    let config = config();
    registry
        .register_fn(|record| {
            record.context_mut().rax = 0x1122_3344_5566_7788;
            Verdict::ContinueExecution
        })
        .unwrap();

    let mut saved = SavedContext::new(0x1);
    let before = saved.0;
    let disposition = Dispatcher::new(&registry, &config, &LegacyPlatform).dispatch(&mut breakpoint(&mut saved));
    assert!(matches!(disposition, Disposition::ContinueExecution(_)));

    let rax = 8..16;
    assert_eq!(&0x1122_3344_5566_7788u64.to_le_bytes(), &saved.0[rax.clone()]);
    for (i, (after, before)) in saved.0.iter().zip(before.iter()).enumerate() {
        if !rax.contains(&i) {
            assert_eq!(before, after, "byte {i} changed");
        }
    }
}

#[test]
fn test_unresolved_context_is_untouched() {
    let registry = HandlerRegistry::new();
    let config = config();
    registry
        .register_fn(|record| {
            record.context_mut().rip = 0;
            Verdict::ContinueSearch
        })
        .unwrap();

    let mut saved = SavedContext::new(0x1);
    let before = saved.0;
    let disposition = Dispatcher::new(&registry, &config, &LegacyPlatform).dispatch(&mut breakpoint(&mut saved));
    assert_eq!(Disposition::Abort(AbortReason::Exhausted), disposition);
    assert_eq!(before, saved.0);
}

#[test]
fn test_page_fault_error_code_reaches_handler() {
    let registry = HandlerRegistry::new();
    let config = config().with_capture_pf_gp(ExtendedFaultOptIn { page_fault: true, general_protection: false });
    let seen = Arc::new(Mutex::new(None));

    let seen_by_handler = seen.clone();
    registry
        .register_fn(move |record| {
            *seen_by_handler.lock().unwrap() = Some((record.code(), record.extended().copied()));
            Verdict::ContinueExecution
        })
        .unwrap();

    let mut saved = SavedContext::new(0x1);
    let mut trap = TrapPayload {
        code: 0x5,
        flags: 0x1,
        address: FAULTING_RIP,
        context: &mut saved.0,
        extended_info_valid: true,
        extended: Some(RawExtendedFault { faulting_address: 0x1000, error_code: 0x6 }),
    };
    let disposition = Dispatcher::new(&registry, &config, &ExInfoPlatform).dispatch(&mut trap);
    assert!(matches!(disposition, Disposition::ContinueExecution(_)));

    let (code, extended) = seen.lock().unwrap().take().expect("Handler was not invoked!");
    assert_eq!(ExceptionCode::PageFault, code);
    let extended = extended.expect("Extended fault info was not delivered!");
    assert_eq!(0x1000, extended.faulting_address());
    assert!(extended.error_code().write());
    assert!(extended.error_code().user_mode());
    assert!(!extended.error_code().present());

    // Same fault on a platform that cannot vouch for the data.
    let mut saved = SavedContext::new(0x1);
    let mut trap = TrapPayload {
        code: 0x5,
        flags: 0x1,
        address: FAULTING_RIP,
        context: &mut saved.0,
        extended_info_valid: true,
        extended: Some(RawExtendedFault { faulting_address: 0x1000, error_code: 0x6 }),
    };
    Dispatcher::new(&registry, &config, &LegacyPlatform).dispatch(&mut trap);
    let (_, extended) = seen.lock().unwrap().take().expect("Handler was not invoked!");
    assert_eq!(None, extended);
}

#[test]
fn test_handler_abort_stops_the_walk() {
    let registry = HandlerRegistry::new();
    let config = config();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let log = calls.clone();
    registry
        .register_fn(move |_| {
            log.lock().unwrap().push("first");
            Verdict::ContinueExecution
        })
        .unwrap();
    let log = calls.clone();
    let aborting = registry
        .register_fn(move |_| {
            log.lock().unwrap().push("second");
            Verdict::AbortExecution
        })
        .unwrap();

    let mut saved = SavedContext::new(0x1);
    let disposition = Dispatcher::new(&registry, &config, &LegacyPlatform).dispatch(&mut breakpoint(&mut saved));
    assert_eq!(Disposition::Abort(AbortReason::HandlerAborted(aborting)), disposition);
    assert_eq!(vec!["second"], *calls.lock().unwrap());
}

#[test]
fn test_out_of_range_payload_never_reaches_handlers() {
    let registry = HandlerRegistry::new();
    let config = config();
    let invoked = Arc::new(AtomicBool::new(false));

    let flag = invoked.clone();
    registry
        .register_fn(move |_| {
            flag.store(true, Ordering::SeqCst);
            Verdict::ContinueExecution
        })
        .unwrap();

    let mut saved = SavedContext::new(0x1);
    let mut trap = breakpoint(&mut saved);
    trap.address = ENCLAVE_BASE + ENCLAVE_SIZE;
    let disposition = Dispatcher::new(&registry, &config, &LegacyPlatform).dispatch(&mut trap);
    assert_eq!(
        Disposition::Abort(AbortReason::MalformedPayload(PayloadError::AddressOutOfRange(ENCLAVE_BASE + ENCLAVE_SIZE))),
        disposition
    );
    assert!(!invoked.load(Ordering::SeqCst));
}

#[test]
fn test_registration_during_dispatch_is_not_observed() {
    let registry = HandlerRegistry::new();
    let config = config();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let in_handler = Arc::new(Barrier::new(2));
    let registered = Arc::new(Barrier::new(2));
    let first_call = Arc::new(AtomicBool::new(true));

    let log = calls.clone();
    let (entered, release, first) = (in_handler.clone(), registered.clone(), first_call.clone());
    registry
        .register_fn(move |_| {
            log.lock().unwrap().push("a");
            if first.swap(false, Ordering::SeqCst) {
                entered.wait();
                release.wait();
            }
            Verdict::ContinueSearch
        })
        .unwrap();

    std::thread::scope(|s| {
        let in_flight = s.spawn(|| {
            let mut saved = SavedContext::new(0x1);
            Dispatcher::new(&registry, &config, &LegacyPlatform).dispatch(&mut breakpoint(&mut saved))
        });

        in_handler.wait();
        let log = calls.clone();
        registry
            .register_fn(move |_| {
                log.lock().unwrap().push("c");
                Verdict::ContinueExecution
            })
            .unwrap();
        registered.wait();

        assert_eq!(Disposition::Abort(AbortReason::Exhausted), in_flight.join().unwrap());
    });
    assert_eq!(vec!["a"], *calls.lock().unwrap());

    let mut saved = SavedContext::new(0x1);
    let disposition = Dispatcher::new(&registry, &config, &LegacyPlatform).dispatch(&mut breakpoint(&mut saved));
    assert!(matches!(disposition, Disposition::ContinueExecution(_)));
    assert_eq!(vec!["a", "c"], *calls.lock().unwrap());
}

#[test]
fn test_concurrent_dispatch() {
    let registry = HandlerRegistry::new();
    let config = config();
    registry
        .register_fn(|record| {
            record.context_mut().rip += 1;
            Verdict::ContinueExecution
        })
        .unwrap();

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..100 {
                    let mut saved = SavedContext::new(0x1);
                    let disposition =
                        Dispatcher::new(&registry, &config, &LegacyPlatform).dispatch(&mut breakpoint(&mut saved));
                    assert!(matches!(disposition, Disposition::ContinueExecution(_)));
                    assert_eq!(FAULTING_RIP + 1, RegisterContext::from_bytes(&saved.0).unwrap().rip);
                }
            });
        }
    });
}
