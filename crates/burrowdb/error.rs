use std::os::raw::c_int;

use thiserror::Error;

use crate::engine::{self, ffi};

/// Failures reported by the collection layer or the underlying engine.
///
/// The write-with-flags family collapses `KeyExist`, `NotFound` and
/// `MultipleValues` into a `false` return instead of surfacing them here;
/// getters collapse `NotFound` into a nil [`Value`](crate::Value). Every
/// other failure propagates as one of these variants.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A no-overwrite flag forbade the write and the key (or exact
    /// key/value pair) already exists.
    #[error("key/value pair already exists")]
    KeyExist,
    /// The key (or exact key/value pair) is not present.
    #[error("no matching key/value pair found")]
    NotFound,
    /// The operation requires a single value but the key holds several.
    #[error("key holds multiple values")]
    MultipleValues,
    /// An append saw a key that is not greater than every existing key.
    #[error("key is out of order for append")]
    KeyMismatch,
    /// A fixed-width conversion or engine size constraint was violated.
    #[error("value has the wrong size")]
    BadValueSize,
    /// A collection was reopened with different key/value sort options
    /// than it was created with.
    #[error("collection reopened with incompatible sort options")]
    Incompatible,
    /// The database was closed while derived objects were still in use.
    #[error("database is closed")]
    Closed,
    /// A snapshot or transaction handle was used after it finished.
    #[error("snapshot or transaction is already finished")]
    UseAfterFinish,
    /// A string view conversion hit non-UTF-8 bytes.
    #[error("value is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
    /// A byte string failed to decode as a collatable tuple.
    #[error("malformed collatable encoding")]
    BadCollatable,
    /// Filesystem-level failure outside the engine proper.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Any other engine-reported failure, carrying the engine code.
    #[error("engine error {0}: {}", engine::error_message(*.0))]
    Engine(c_int),
    /// An operating-system error forwarded by the engine (positive codes).
    #[error("os error {0}: {}", engine::error_message(*.0))]
    Os(c_int),
}

impl Error {
    pub(crate) fn from_code(code: c_int) -> Self {
        match code {
            ffi::MDBX_KEYEXIST => Error::KeyExist,
            ffi::MDBX_NOTFOUND => Error::NotFound,
            ffi::MDBX_EMULTIVAL => Error::MultipleValues,
            ffi::MDBX_EKEYMISMATCH => Error::KeyMismatch,
            ffi::MDBX_INCOMPATIBLE => Error::Incompatible,
            ffi::MDBX_BAD_VALSIZE => Error::BadValueSize,
            code if code > 0 => Error::Os(code),
            code => Error::Engine(code),
        }
    }

    /// True when the error is the soft "key absent" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
