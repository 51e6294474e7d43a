use std::env::current_dir;
use std::io::{ErrorKind, Result as IoResult};
use std::num::NonZeroUsize;
use serde_json::Result as SerdeJsonResult;
use parking_lot::lock_api::{GetThreadId, RawReentrantMutex};
use parking_lot::{RawMutex, RawThreadId};
use crate::kern::thread::try_get_current_thread;
use crate::result;
use crate::result::*;

macro_rules! bit_enum {
    ($name:ident ($base:ty) { $( $entry_name:ident = $entry_value:expr ),* }) => {
        #[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
        #[repr(C)]
        pub struct $name($base);

        impl $name {
            pub const fn from(val: $base) -> Self {
                Self(val)
            }

            pub const fn contains(self, other: Self) -> bool {
                (self.0 & other.0) != 0
            }

            pub const fn contains_all(self, other: Self) -> bool {
                (self.0 & other.0) == other.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub const fn get(self) -> $base {
                self.0
            }

            $(
                pub const fn $entry_name() -> Self {
                    Self($entry_value as $base)
                }
            )*
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            #[inline]
            fn bitor(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }
        }

        impl std::ops::BitAnd for $name {
            type Output = Self;

            #[inline]
            fn bitand(self, other: Self) -> Self {
                Self(self.0 & other.0)
            }
        }

        impl std::ops::Not for $name {
            type Output = Self;

            #[inline]
            fn not(self) -> Self {
                Self(!self.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            #[inline]
            fn bitor_assign(&mut self, other: Self) {
                self.0 |= other.0
            }
        }

        impl std::ops::BitAndAssign for $name {
            #[inline]
            fn bitand_assign(&mut self, other: Self) {
                self.0 &= other.0
            }
        }
    };
}

macro_rules! bit_group {
    ($base:ty [ $( $val:ident ),* ]) => {
        <$base>::from( $( <$base>::$val().get() )|* )
    };
}

macro_rules! bit {
    ($val:expr) => {
        (1 << ($val))
    };
}

#[inline]
pub fn current_host_thread_id() -> NonZeroUsize {
    RawThreadId::INIT.nonzero_thread_id()
}

pub type RecursiveLock = RawReentrantMutex<RawMutex, RawThreadId>;

pub struct RecursiveLockGuard<'a> {
    lock: &'a RecursiveLock
}

impl<'a> RecursiveLockGuard<'a> {
    pub fn new(lock: &'a RecursiveLock) -> Self {
        lock.lock();

        Self {
            lock
        }
    }
}

impl<'a> Drop for RecursiveLockGuard<'a> {
    fn drop(&mut self) {
        unsafe {
            self.lock.unlock();
        }
    }
}

pub const fn new_recursive_lock() -> RecursiveLock {
    RecursiveLock::INIT
}

static G_LOG_LOCK: RecursiveLock = new_recursive_lock();

pub fn make_log_guard<'a>() -> RecursiveLockGuard<'a> {
    RecursiveLockGuard::new(&G_LOG_LOCK)
}

pub fn log_line_msg(msg: String) {
    let _guard = make_log_guard();

    let host_thread = std::thread::current();
    let host_thread_name = host_thread.name().unwrap_or("<unnamed>");

    let (process_name, thread_name) = match try_get_current_thread() {
        Some(thread) => {
            let process_name = match thread.get_owner_process() {
                Some(process) => process.name.clone(),
                None => String::from("Kernel")
            };
            (process_name, format!("{} (id {})", host_thread_name, thread.id))
        },
        None => (String::from("Host~kcore"), format!("Host~{}", host_thread_name))
    };

    println!("[{} -> {}] {}", process_name, thread_name, msg);
}

#[macro_export]
macro_rules! log_line {
    ($($arg:tt)*) => {{
        let log_msg = format!($($arg)*);
        $crate::util::log_line_msg(log_msg);
    }};
}

#[inline]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + (align - 1)) & !(align - 1)
}

#[inline]
pub const fn is_aligned(value: u64, align: u64) -> bool {
    (value & (align - 1)) == 0
}

pub fn get_path_relative_to_cwd(name: &str) -> Result<String> {
    let cwd = convert_io_result(current_dir())?;
    Ok(cwd.join(name).as_path().display().to_string())
}

pub fn convert_io_result<T>(r: IoResult<T>) -> Result<T> {
    r.map_err(|err| match err.kind() {
        ErrorKind::Unsupported => result::ResultNotSupported::make(),
        _ => result::ResultIoFailure::make()
    })
}

pub fn convert_serde_json_result<T>(r: SerdeJsonResult<T>) -> Result<T> {
    r.map_err(|_| result::ResultInvalidJson::make())
}

#[cfg(test)]
mod tests {
    use super::*;

    bit_enum! {
        TestFlags(u8) {
            None = 0,
            A = bit!(0),
            B = bit!(1),
            AB = bit_group!(Self [A, B]).get()
        }
    }

    #[test]
    fn flag_set_operations() {
        let mut flags = TestFlags::None();
        assert!(flags.is_empty());

        flags |= TestFlags::A();
        assert!(flags.contains(TestFlags::A()));
        assert!(!flags.contains(TestFlags::B()));
        assert!(!flags.contains_all(TestFlags::AB()));

        flags |= TestFlags::B();
        assert_eq!(flags, TestFlags::AB());

        flags &= !TestFlags::A();
        assert_eq!(flags, TestFlags::B());
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_up(0x2000, 0x1000), 0x2000);
        assert!(is_aligned(0x3000, 0x1000));
        assert!(!is_aligned(0x3001, 0x1000));
    }

    #[test]
    fn recursive_lock_reenters_on_same_thread() {
        let lock = new_recursive_lock();
        let _outer = RecursiveLockGuard::new(&lock);
        let _inner = RecursiveLockGuard::new(&lock);
        assert!(lock.is_locked());
    }
}
