//! Zero-copy value views and write-side input shaping.

use std::fmt;

use crate::engine::{self, ffi};
use crate::error::{Error, Result};

/// A zero-copy view of a stored value (or key).
///
/// The bytes live inside the database's memory map; the lifetime parameter
/// ties the view to the snapshot or transaction it was read through, so the
/// borrow checker rejects any use after that snapshot/transaction ends.
///
/// A *nil* view stands for "no such entry" and is what getters return on a
/// miss.
#[derive(Clone, Copy)]
pub struct Value<'txn> {
    bytes: Option<&'txn [u8]>,
}

impl<'txn> Value<'txn> {
    /// The "no such entry" view.
    pub const fn nil() -> Self {
        Value { bytes: None }
    }

    pub(crate) const fn of(bytes: Option<&'txn [u8]>) -> Self {
        Value { bytes }
    }

    /// # Safety
    ///
    /// `val` must describe engine-owned memory valid for `'txn`.
    pub(crate) unsafe fn from_raw(val: ffi::MDBX_val) -> Self {
        Value {
            bytes: Some(unsafe { engine::from_val(val) }),
        }
    }

    /// False for the nil view, true for any stored value (even an empty one).
    pub fn exists(&self) -> bool {
        self.bytes.is_some()
    }

    pub fn len(&self) -> usize {
        self.bytes.map_or(0, <[u8]>::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The raw bytes, or `None` for the nil view.
    pub fn as_bytes(&self) -> Option<&'txn [u8]> {
        self.bytes
    }

    /// The raw bytes; the nil view yields an empty slice.
    pub fn as_slice(&self) -> &'txn [u8] {
        self.bytes.unwrap_or(&[])
    }

    /// Borrows the value as UTF-8 text.
    pub fn as_str(&self) -> Result<&'txn str> {
        Ok(std::str::from_utf8(self.as_slice())?)
    }

    /// Reads a native-endian 32-bit integer; the value must be exactly
    /// four bytes.
    pub fn as_i32(&self) -> Result<i32> {
        let bytes: [u8; 4] = self
            .as_slice()
            .try_into()
            .map_err(|_| Error::BadValueSize)?;
        Ok(i32::from_ne_bytes(bytes))
    }

    /// Reads a native-endian 64-bit integer; the value must be exactly
    /// eight bytes.
    pub fn as_i64(&self) -> Result<i64> {
        let bytes: [u8; 8] = self
            .as_slice()
            .try_into()
            .map_err(|_| Error::BadValueSize)?;
        Ok(i64::from_ne_bytes(bytes))
    }

    /// Copies the bytes out of the memory map.
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl fmt::Debug for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bytes {
            None => f.write_str("Value(nil)"),
            Some(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => write!(f, "Value({text:?})"),
                Err(_) => write!(f, "Value({bytes:02x?})"),
            },
        }
    }
}

impl PartialEq for Value<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Value<'_> {}

impl PartialEq<&[u8]> for Value<'_> {
    fn eq(&self, other: &&[u8]) -> bool {
        self.bytes == Some(*other)
    }
}

impl PartialEq<&str> for Value<'_> {
    fn eq(&self, other: &&str) -> bool {
        self.bytes == Some(other.as_bytes())
    }
}

impl<const N: usize> PartialEq<&[u8; N]> for Value<'_> {
    fn eq(&self, other: &&[u8; N]) -> bool {
        self.bytes == Some(&other[..])
    }
}

/// A key or value argument: borrowed bytes, a native-endian integer, or the
/// no-data sentinel.
///
/// Integer data is materialized inline in the engine's native byte order,
/// matching the layout integer-sorted collections require.
#[derive(Debug, Clone, Copy)]
pub enum Datum<'a> {
    /// The "no data" sentinel. As a value argument to `put` it means
    /// delete; as a key argument to a getter it yields a nil result.
    None,
    Bytes(&'a [u8]),
    Int32([u8; 4]),
    Int64([u8; 8]),
}

impl Datum<'_> {
    pub(crate) fn bytes(&self) -> Option<&[u8]> {
        match self {
            Datum::None => None,
            Datum::Bytes(bytes) => Some(bytes),
            Datum::Int32(bytes) => Some(&bytes[..]),
            Datum::Int64(bytes) => Some(&bytes[..]),
        }
    }

    /// Key arguments to mutating calls must carry data.
    pub(crate) fn key_bytes(&self) -> Result<&[u8]> {
        self.bytes().ok_or(Error::BadValueSize)
    }
}

impl<'a> From<&'a [u8]> for Datum<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        Datum::Bytes(bytes)
    }
}

impl<'a> From<&'a str> for Datum<'a> {
    fn from(text: &'a str) -> Self {
        Datum::Bytes(text.as_bytes())
    }
}

impl<'a> From<&'a String> for Datum<'a> {
    fn from(text: &'a String) -> Self {
        Datum::Bytes(text.as_bytes())
    }
}

impl<'a> From<&'a Vec<u8>> for Datum<'a> {
    fn from(bytes: &'a Vec<u8>) -> Self {
        Datum::Bytes(bytes)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for Datum<'a> {
    fn from(bytes: &'a [u8; N]) -> Self {
        Datum::Bytes(&bytes[..])
    }
}

impl From<i32> for Datum<'_> {
    fn from(v: i32) -> Self {
        Datum::Int32(v.to_ne_bytes())
    }
}

impl From<u32> for Datum<'_> {
    fn from(v: u32) -> Self {
        Datum::Int32(v.to_ne_bytes())
    }
}

impl From<i64> for Datum<'_> {
    fn from(v: i64) -> Self {
        Datum::Int64(v.to_ne_bytes())
    }
}

impl From<u64> for Datum<'_> {
    fn from(v: u64) -> Self {
        Datum::Int64(v.to_ne_bytes())
    }
}

impl From<()> for Datum<'_> {
    fn from((): ()) -> Self {
        Datum::None
    }
}

impl<'a> From<&'a crate::Collatable> for Datum<'a> {
    fn from(c: &'a crate::Collatable) -> Self {
        Datum::Bytes(c.as_bytes())
    }
}

impl<'a, 'txn> From<&'a Value<'txn>> for Datum<'a> {
    fn from(v: &'a Value<'txn>) -> Self {
        match v.as_bytes() {
            None => Datum::None,
            Some(bytes) => Datum::Bytes(bytes),
        }
    }
}
