use core::ops::{Deref, DerefMut};

use spin::Once;

/// Interrupt masking primitives supplied by the board support code.
///
/// `enter` masks interrupts and returns the previous mask state; `exit`
/// restores exactly that state.  On a Cortex-M target these wrap
/// `PRIMASK` save/`cpsid i` and restore.
#[derive(Clone, Copy)]
pub struct CriticalSectionHooks {
    pub enter: fn() -> u32,
    pub exit: fn(u32),
}

static HOOKS: Once<CriticalSectionHooks> = Once::new();

/// Install the interrupt masking hooks.  Only the first registration wins.
///
/// Returns `true` if these hooks were installed.  Without hooks (host builds,
/// tests) `IrqMutex` degrades to a plain spinlock.
pub fn register_critical_section(hooks: CriticalSectionHooks) -> bool {
    let mut installed = false;
    HOOKS.call_once(|| {
        installed = true;
        hooks
    });
    installed
}

struct IrqRestore {
    saved: Option<u32>,
}

impl IrqRestore {
    #[inline]
    fn save() -> Self {
        Self {
            saved: HOOKS.get().map(|h| (h.enter)()),
        }
    }
}

impl Drop for IrqRestore {
    #[inline]
    fn drop(&mut self) {
        if let (Some(saved), Some(hooks)) = (self.saved, HOOKS.get()) {
            (hooks.exit)(saved);
        }
    }
}

/// Mutex that masks interrupts while held.
/// Essential for stack state touched from both the frame-receive interrupt
/// and the main loop: masking keeps the interrupt handler from spinning on a
/// lock the interrupted main loop already holds.
pub struct IrqMutex<T> {
    inner: spin::Mutex<T>,
}

/// Field order matters: the spin guard is released before interrupts are
/// unmasked.
pub struct IrqMutexGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
    _irq: IrqRestore,
}

impl<T> IrqMutex<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            inner: spin::Mutex::new(data),
        }
    }

    /// Check if the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    #[inline]
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let irq = IrqRestore::save();
        IrqMutexGuard {
            guard: self.inner.lock(),
            _irq: irq,
        }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let irq = IrqRestore::save();
        // On failure `irq` drops here and restores the saved mask.
        self.inner
            .try_lock()
            .map(|guard| IrqMutexGuard { guard, _irq: irq })
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<'a, T> Deref for IrqMutexGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for IrqMutexGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
