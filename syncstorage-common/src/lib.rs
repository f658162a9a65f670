//! Error taxonomy and shared primitives used by every other crate in this
//! workspace: the [`SyncTimestamp`] monotonic clock and the [`DbError`]
//! family.

mod error;
mod timestamp;

pub use error::{DbError, DbErrorIntrospect, DbErrorKind};
pub use timestamp::SyncTimestamp;

use std::fmt;

#[macro_export]
macro_rules! from_error {
    ($from:ty, $to:ty, $to_kind:expr) => {
        impl From<$from> for $to {
            fn from(inner: $from) -> $to {
                $to_kind(inner).into()
            }
        }
    };
}

#[macro_export]
macro_rules! impl_fmt_display {
    ($error:ty, $kind:ty) => {
        impl fmt::Display for $error {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.kind, formatter)
            }
        }
    };
}

/// Implemented by error types that can report a captured backtrace, so that
/// logging call sites don't need to know the concrete error type.
pub trait ReportableError: fmt::Debug {
    fn error_backtrace(&self) -> String;
    fn is_sentry_event(&self) -> bool;
    fn metric_label(&self) -> Option<String>;
}

/// [HKDF](https://tools.ietf.org/html/rfc5869) expansion to a fixed 32-byte
/// key. Shared by the settings crate (deriving the signing secret) and the
/// token crate (deriving per-request MAC keys).
pub fn hkdf_expand_32(info: &[u8], salt: Option<&[u8]>, key: &[u8]) -> Result<[u8; 32], String> {
    use hkdf::Hkdf;
    use sha2::Sha256;

    let mut result = [0u8; 32];
    let hkdf = Hkdf::<Sha256>::new(salt, key);
    hkdf.expand(info, &mut result)
        .map_err(|e| format!("HKDF error: {:?}", e))?;
    Ok(result)
}
