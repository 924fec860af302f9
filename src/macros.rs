//! # Internal Macros
//!
//! ## `zerocopy_accessors!`
//!
//! Generates getter and setter methods for zerocopy struct fields that use
//! little-endian wrapper types (U32, U64).
//!
//! ```ignore
//! impl FileHeader {
//!     zerocopy_accessors! {
//!         number_of_pages: u64,
//!         flags: u64,
//!     }
//! }
//! ```
//!
//! ## `fail!` / `check!`
//!
//! Error-raising counterparts of `eyre::bail!`/`eyre::ensure!` that attach
//! an [`ErrorKind`](crate::ErrorKind) as the root of the report chain so
//! callers can recover the error taxonomy with `ErrorKind::of`.

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    ($($field:ident: $ty:tt),* $(,)?) => {
        $($crate::zerocopy_accessors!(@impl $field, $ty);)*
    };
}

/// Returns early with an error report rooted at the given [`ErrorKind`].
#[macro_export]
macro_rules! fail {
    ($kind:expr, $($arg:tt)*) => {
        return ::core::result::Result::Err(
            ::eyre::Report::new($kind).wrap_err(format!($($arg)*)),
        )
    };
}

/// Like `eyre::ensure!`, but the raised report carries an [`ErrorKind`].
#[macro_export]
macro_rules! check {
    ($cond:expr, $kind:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::fail!($kind, $($arg)*);
        }
    };
}
