//! Lock backend for the kernel critical section.
//!
//! `parking_lot::Mutex` is used by default. The `lock-free` feature switches
//! to `spin::Mutex`, which never parks the calling OS thread; processors then
//! busy-wait on the critical section the way a target port would.

pub use std::sync::Arc;

#[cfg(not(any(feature = "std", feature = "lock-free")))]
compile_error!("enable either the `std` or the `lock-free` feature");

#[cfg(feature = "lock-free")]
pub type MutexGuard<'a, T> = spin::MutexGuard<'a, T>;
#[cfg(all(feature = "std", not(feature = "lock-free")))]
pub type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;

/// Mutex wrapper selected by feature.
///
/// Neither backend poisons, so a task body that unwinds while the kernel is
/// unlocked never leaves the critical section unusable.
pub struct Mutex<T> {
    #[cfg(feature = "lock-free")]
    inner: spin::Mutex<T>,
    #[cfg(all(feature = "std", not(feature = "lock-free")))]
    inner: parking_lot::Mutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            #[cfg(feature = "lock-free")]
            inner: spin::Mutex::new(value),
            #[cfg(all(feature = "std", not(feature = "lock-free")))]
            inner: parking_lot::Mutex::new(value),
        }
    }

    /// Acquires the mutex, blocking until it becomes available.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}
