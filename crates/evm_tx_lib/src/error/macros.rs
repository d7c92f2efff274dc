/// Wrap any error convertible into ErrorBag, capturing the call site.
/// Use as `.map_err(err_from!())?`.
#[macro_export]
macro_rules! err_from {
    () => {
        |err| $crate::error::EngineError {
            inner: err.into(),
            msg: None,
            file: file!(),
            line: line!(),
            column: column!(),
        }
    };
}

/// Create an EngineError from a preconstructed error value.
#[macro_export]
macro_rules! err_create {
    ($err:expr) => {
        $crate::error::EngineError {
            inner: $err.into(),
            msg: None,
            file: file!(),
            line: line!(),
            column: column!(),
        }
    };
}

/// Create an EngineError from a format string.
#[macro_export]
macro_rules! err_custom_create {
    ($($arg:tt)*) => {
        $crate::error::EngineError {
            inner: $crate::error::ErrorBag::CustomError(
                $crate::error::CustomError::new(&format!($($arg)*)),
            ),
            msg: None,
            file: file!(),
            line: line!(),
            column: column!(),
        }
    };
}
