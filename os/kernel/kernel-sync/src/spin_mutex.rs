use crate::irq::IrqState;
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Spin lock whose guard masks interrupts until it is dropped.
///
/// Interrupts go off before the lock is taken and come back (if they were on)
/// after it is released, so an interrupt handler never finds the lock held by
/// the code it interrupted while that code still runs on the same CPU.
pub struct SpinMutex<T> {
    held: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is serialized by `held`.
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Mask interrupts and spin until the lock is ours.
    pub fn lock_irq(&self) -> SpinGuard<'_, T> {
        let irq = IrqState::save_and_disable();
        while self
            .held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        SpinGuard { mutex: self, _irq: irq }
    }

    /// One attempt at the lock; `None` if it is held.
    ///
    /// For handlers that may have interrupted the holder: spinning there
    /// would never finish.
    pub fn try_lock_irq(&self) -> Option<SpinGuard<'_, T>> {
        let irq = IrqState::save_and_disable();
        if self.held.swap(true, Ordering::Acquire) {
            return None;
        }
        Some(SpinGuard { mutex: self, _irq: irq })
    }

    /// Run `f` under [`lock_irq`](Self::lock_irq).
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock_irq();
        f(&mut guard)
    }

    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}

#[must_use = "the lock is released as soon as the guard drops"]
pub struct SpinGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
    // Dropped after `Drop::drop` releases the lock.
    _irq: IrqState,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.held.store(false, Ordering::Release);
    }
}
