use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const FULL: u8 = 2;

/// A cell written at most once, readable from any context afterwards.
///
/// Boot code fills these before interrupts are enabled; later readers only
/// ever see [`FULL`] and never wait.
pub struct SyncOnceCell<T> {
    state: AtomicU8,
    slot: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: the slot is written once by the thread that won `claim` and only
// read after `FULL` is published.
unsafe impl<T: Sync + Send> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncOnceCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            slot: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        // SAFETY: `FULL` is only stored after the slot is written.
        self.is_initialized().then(|| unsafe { self.read() })
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == FULL
    }

    /// Store `value` if nothing has been stored or is being stored.
    ///
    /// # Errors
    /// The value comes back if the cell was already claimed.
    pub fn set(&self, value: T) -> Result<(), T> {
        if !self.claim() {
            return Err(value);
        }
        self.publish(value);
        Ok(())
    }

    /// The stored value, running `init` first if the cell is empty. A caller
    /// that loses the race waits for the winner.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if self.claim() {
            self.publish(init());
        } else {
            while !self.is_initialized() {
                spin_loop();
            }
        }
        // SAFETY: `FULL` observed or just published.
        unsafe { self.read() }
    }

    fn claim(&self) -> bool {
        self.state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn publish(&self, value: T) {
        // SAFETY: only the claimant writes, and readers wait for `FULL`.
        unsafe { (*self.slot.get()).write(value) };
        self.state.store(FULL, Ordering::Release);
    }

    /// # Safety
    /// The state must be `FULL`.
    unsafe fn read(&self) -> &T {
        unsafe { (*self.slot.get()).assume_init_ref() }
    }
}

impl<T> Drop for SyncOnceCell<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == FULL {
            // SAFETY: the value was published and is dropped only here.
            unsafe { self.slot.get_mut().assume_init_drop() }
        }
    }
}
