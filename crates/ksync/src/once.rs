use core::cell::UnsafeCell;
use core::hint;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const INIT: u8 = 2;

pub struct OnceLock<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}
unsafe impl<T: Send> Send for OnceLock<T> {}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == INIT {
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    pub fn get_or_init(&self, f: impl FnOnce() -> T) -> &T {
        match self.state.compare_exchange(
            UNINIT,
            INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                unsafe { (*self.value.get()).write(f()) };
                self.state.store(INIT, Ordering::Release);
            }
            Err(INITIALIZING) => {
                while self.state.load(Ordering::Acquire) == INITIALIZING {
                    hint::spin_loop();
                }
            }
            Err(_) => {}
        }

        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

/// A value computed once, on first access, from a closure supplied at
/// construction time. Used for statics whose initializer needs allocation
/// or other work that can't run in `const` context.
pub struct LazyLock<T, F = fn() -> T> {
    once: OnceLock<T>,
    init: UnsafeCell<Option<F>>,
}

unsafe impl<T: Send + Sync, F: Send> Sync for LazyLock<T, F> {}

impl<T, F: FnOnce() -> T> LazyLock<T, F> {
    pub const fn new(init: F) -> Self {
        Self {
            once: OnceLock::new(),
            init: UnsafeCell::new(Some(init)),
        }
    }

    fn force(&self) -> &T {
        self.once.get_or_init(|| {
            let f = unsafe { (*self.init.get()).take() }.expect("LazyLock initialized twice");
            f()
        })
    }
}

impl<T, F: FnOnce() -> T> core::ops::Deref for LazyLock<T, F> {
    type Target = T;
    fn deref(&self) -> &T {
        self.force()
    }
}
