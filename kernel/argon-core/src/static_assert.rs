//! Compile-time static assertion macro.

/// Asserts a condition at compile time.
///
/// Used to pin down `repr(C)` layouts shared with assembly or firmware,
/// such as the AP handoff record.
#[macro_export]
macro_rules! static_assert {
    ($cond:expr $(,)?) => {
        const _: () = assert!($cond);
    };
    ($cond:expr, $msg:expr $(,)?) => {
        const _: () = assert!($cond, $msg);
    };
}
