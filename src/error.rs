//! Error codes recorded per cache, mirroring the integer codes surfaced
//! through `cache_error`.

/// Allocator error, stored on a [`crate::slab::Cache`] and returned by
/// `cache_error`. Carries the same three cases as the integer codes 1-3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Error {
    /// Buddy allocator could not produce a run to grow a cache (code 1).
    AllocationError = 1,
    /// Free of an unowned, double-freed, or misaligned address (code 2).
    DeallocationError = 2,
    /// A slab taken off `partial`/`empty` had no free bit (code 3). Always
    /// indicates a bug in the allocator itself.
    InconsistentSlab = 3,
}

impl Error {
    #[inline]
    pub const fn code(self) -> u32 {
        self as u32
    }
}

/// Per-cache last-error code. `0` means no error has been recorded since
/// the cache was created (or since whatever last cleared it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorCode(u32);

impl ErrorCode {
    pub const OK: ErrorCode = ErrorCode(0);

    #[inline]
    pub const fn from_raw(code: u32) -> Self {
        ErrorCode(code)
    }

    #[inline]
    pub const fn code(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }
}

impl From<Error> for ErrorCode {
    fn from(e: Error) -> Self {
        ErrorCode(e.code())
    }
}
