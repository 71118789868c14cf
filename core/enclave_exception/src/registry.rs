//! Vectored exception handler registry.
//!
//! Handlers are consulted most recently registered first: a newly installed handler gets the first look at every
//! exception, wrapping the chain that was installed before it.
//!
//! Dispatch never walks the live registry. It takes a [`HandlerSnapshot`] up front, so registrations and removals
//! made by other threads while an exception is being dispatched only affect later exceptions. Removing a handler
//! that is currently running is allowed.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{sync::Arc, vec::Vec};
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::rwlock::RwLock;

use crate::abi::{self, RawExceptionHandler};
use crate::dispatch::Verdict;
use crate::error::{ExceptionError, Result};
use crate::record::ExceptionRecord;

/// Maximum number of handlers the enclave-wide registry holds at once.
pub const MAX_EXCEPTION_HANDLERS: usize = 64;

/// Number of times [`HandlerRegistry::try_snapshot`] tries to take the registry lock.
pub const SNAPSHOT_ATTEMPTS: usize = 1 << 16;

/// Trait for structs that handle enclave exceptions.
///
/// Handlers run in exception context on the faulting thread and may run concurrently on several threads. They
/// must not block for arbitrary amounts of time and any mutable state must use internal locking.
///
pub trait ExceptionHandler: Send + Sync {
    /// Invoked for every exception dispatched while the handler is registered.
    ///
    /// Return [`Verdict::ContinueExecution`] only after the condition has been resolved, for example by repairing
    /// the register context, since execution resumes at the context's `rip`.
    ///
    fn handle_exception(&self, record: &mut ExceptionRecord<'_>) -> Verdict;
}

/// Adapts a closure into an [`ExceptionHandler`].
struct FnHandler<F>(F);

impl<F> ExceptionHandler for FnHandler<F>
where
    F: Fn(&mut ExceptionRecord<'_>) -> Verdict + Send + Sync,
{
    fn handle_exception(&self, record: &mut ExceptionRecord<'_>) -> Verdict {
        (self.0)(record)
    }
}

/// Type for storing an installed handler.
#[derive(Clone)]
pub enum HandlerType {
    /// Handler is a C ABI routine returning a raw verdict.
    Routine(RawExceptionHandler),
    /// Handler is an implementation of the exception handler trait.
    Handler(Arc<dyn ExceptionHandler>),
}

impl fmt::Debug for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerType::Routine(routine) => f.debug_tuple("Routine").field(&(*routine as usize)).finish(),
            HandlerType::Handler(_) => f.debug_tuple("Handler").finish_non_exhaustive(),
        }
    }
}

/// Identity of one registration. Registering the same handler twice produces two distinct handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegistrationHandle(u64);

impl RegistrationHandle {
    /// Rebuilds a handle from the value previously returned by [`Self::as_raw`].
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// One installed handler.
#[derive(Debug)]
pub struct Registration {
    handle: RegistrationHandle,
    handler: HandlerType,
}

impl Registration {
    pub fn handle(&self) -> RegistrationHandle {
        self.handle
    }

    /// Runs the handler.
    ///
    /// Returns `Err` with the raw value when a C routine returns something that is not a verdict.
    pub(crate) fn invoke(&self, record: &mut ExceptionRecord<'_>) -> core::result::Result<Verdict, u64> {
        match &self.handler {
            HandlerType::Routine(routine) => {
                let raw = abi::invoke_routine(*routine, record);
                Verdict::from_raw(raw).ok_or(raw)
            }
            HandlerType::Handler(handler) => Ok(handler.handle_exception(record)),
        }
    }
}

/// The handlers installed when a dispatch started, in the order they are consulted.
#[derive(Debug, Clone, Default)]
pub struct HandlerSnapshot {
    entries: Vec<Arc<Registration>>,
}

impl HandlerSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Registration> {
        self.entries.get(index).map(|entry| entry.as_ref())
    }

    /// Handles in consultation order.
    pub fn handles(&self) -> impl Iterator<Item = RegistrationHandle> + '_ {
        self.entries.iter().map(|entry| entry.handle)
    }
}

/// Thread-safe ordered collection of installed exception handlers.
pub struct HandlerRegistry {
    // Kept in consultation order, most recent registration first.
    entries: RwLock<Vec<Arc<Registration>>>,
    next_handle: AtomicU64,
    capacity: usize,
}

impl HandlerRegistry {
    /// Creates an empty registry holding up to [`MAX_EXCEPTION_HANDLERS`] handlers.
    pub const fn new() -> Self {
        Self::with_capacity(MAX_EXCEPTION_HANDLERS)
    }

    pub const fn with_capacity(capacity: usize) -> Self {
        Self { entries: RwLock::new(Vec::new()), next_handle: AtomicU64::new(1), capacity }
    }

    /// Installs a handler ahead of every handler already installed.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfResources`](ExceptionError::OutOfResources) if the registry is full.
    ///
    pub fn register(&self, handler: HandlerType) -> Result<RegistrationHandle> {
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            log::warn!("Exception handler registry full ({} handlers).", self.capacity);
            return Err(ExceptionError::OutOfResources);
        }

        let handle = RegistrationHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        entries.insert(0, Arc::new(Registration { handle, handler }));
        log::debug!("Registered exception handler {:?} ({} installed).", handle, entries.len());
        Ok(handle)
    }

    /// Installs an [`ExceptionHandler`] implementation.
    pub fn register_handler(&self, handler: Arc<dyn ExceptionHandler>) -> Result<RegistrationHandle> {
        self.register(HandlerType::Handler(handler))
    }

    /// Installs a closure as a handler.
    pub fn register_fn<F>(&self, handler: F) -> Result<RegistrationHandle>
    where
        F: Fn(&mut ExceptionRecord<'_>) -> Verdict + Send + Sync + 'static,
    {
        self.register(HandlerType::Handler(Arc::new(FnHandler(handler))))
    }

    /// Removes a registration. Dispatches already in progress keep using their snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound`](ExceptionError::NotFound) if `handle` is not registered.
    ///
    pub fn unregister(&self, handle: RegistrationHandle) -> Result<()> {
        let mut entries = self.entries.write();
        let index = entries.iter().position(|entry| entry.handle == handle).ok_or(ExceptionError::NotFound)?;
        entries.remove(index);
        log::debug!("Unregistered exception handler {:?} ({} installed).", handle, entries.len());
        Ok(())
    }

    /// Returns the installed handlers in consultation order.
    pub fn snapshot(&self) -> HandlerSnapshot {
        HandlerSnapshot { entries: self.entries.read().clone() }
    }

    /// Like [`Self::snapshot`], but gives up after [`SNAPSHOT_ATTEMPTS`] tries to take the lock.
    ///
    /// Dispatch uses this so that an exception raised while the faulting thread itself holds the registry lock
    /// (for example a fault inside [`Self::register`]) fails closed instead of spinning forever.
    pub fn try_snapshot(&self) -> Option<HandlerSnapshot> {
        for _ in 0..SNAPSHOT_ATTEMPTS {
            if let Some(entries) = self.entries.try_read() {
                return Some(HandlerSnapshot { entries: entries.clone() });
            }
            core::hint::spin_loop();
        }
        log::error!("Exception handler registry lock unavailable.");
        None
    }

    #[cfg(test)]
    pub(crate) fn lock_for_test(&self) -> spin::rwlock::RwLockWriteGuard<'_, Vec<Arc<Registration>>> {
        self.entries.write()
    }

    /// Removes every registration.
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        log::debug!("Clearing {} exception handlers.", entries.len());
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
