//! An order-preserving binary encoding for heterogeneous tuples.
//!
//! A [`Collatable`] encodes a sequence of items — nulls, booleans, signed
//! 64-bit integers and byte strings — such that comparing two encodings
//! byte-for-byte gives the same ordering as comparing the tuples
//! semantically: item by item, shorter-prefix-first, with types ranked
//! `null < bool < int < string`. That lets the storage engine sort compound
//! index keys with its stock byte comparator, with no per-collection
//! comparator registration.
//!
//! Each item starts with a tag byte that carries the type and, for
//! integers, the payload length:
//!
//! | item            | encoding                                          |
//! |-----------------|---------------------------------------------------|
//! | null            | `00`                                              |
//! | false / true    | `01` / `02`                                       |
//! | int < 0         | `10 + (8 - n)`, n-byte big-endian payload with    |
//! |                 | leading `FF` bytes suppressed                     |
//! | int >= 0        | `20 + n`, n-byte big-endian payload with leading  |
//! |                 | `00` bytes suppressed (zero is the bare tag)      |
//! | string          | `30`, raw bytes, terminating `00`                 |
//!
//! Strings must not contain an embedded zero byte; this is a documented
//! precondition, checked in debug builds only.

use std::cmp::Ordering;
use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use smallvec::SmallVec;

const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_NEG_INT: u8 = 0x10;
const TAG_POS_INT: u8 = 0x20;
const TAG_STRING: u8 = 0x30;

/// An order-preserving encoding of a tuple of items.
///
/// Build one with the `add_*` methods, then use [`as_bytes`](Self::as_bytes)
/// as a key. `Ord` on `Collatable` is plain byte comparison, which by
/// construction matches the tuple ordering.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Collatable {
    buf: SmallVec<[u8; 32]>,
}

impl Collatable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the null item (sorts before everything else).
    pub fn add_null(&mut self) -> &mut Self {
        self.buf.push(TAG_NULL);
        self
    }

    pub fn add_bool(&mut self, v: bool) -> &mut Self {
        self.buf.push(if v { TAG_TRUE } else { TAG_FALSE });
        self
    }

    pub fn add_i64(&mut self, v: i64) -> &mut Self {
        let mut payload = [0u8; 8];
        BigEndian::write_i64(&mut payload, v);
        if v < 0 {
            // Suppress leading FF bytes; fewer suppressed bytes means a
            // smaller tag, and the tag ordering matches numeric ordering on
            // the negative side.
            let skip = payload.iter().take_while(|&&b| b == 0xFF).count().min(8);
            let len = 8 - skip;
            self.buf.push(TAG_NEG_INT + (8 - len as u8));
            self.buf.extend_from_slice(&payload[skip..]);
        } else {
            let skip = payload.iter().take_while(|&&b| b == 0x00).count().min(8);
            let len = 8 - skip;
            self.buf.push(TAG_POS_INT + len as u8);
            self.buf.extend_from_slice(&payload[skip..]);
        }
        self
    }

    pub fn add_string(&mut self, v: &str) -> &mut Self {
        self.add_bytes(v.as_bytes())
    }

    /// Appends a byte string item. `v` must not contain a zero byte.
    pub fn add_bytes(&mut self, v: &[u8]) -> &mut Self {
        debug_assert!(
            !v.contains(&0),
            "collatable strings must not contain embedded zero bytes"
        );
        self.buf.push(TAG_STRING);
        self.buf.extend_from_slice(v);
        self.buf.push(0x00);
        self
    }

    /// Appends every item of `other` after the items of `self`.
    pub fn concat(&mut self, other: &Collatable) -> &mut Self {
        self.buf.extend_from_slice(&other.buf);
        self
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Length of the encoding in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Byte-wise comparison; equal in sign to the semantic tuple compare.
    pub fn cmp_bytes(&self, other: &Collatable) -> Ordering {
        self.buf.cmp(&other.buf)
    }

    /// Lazily decodes the items of the encoding.
    pub fn iter(&self) -> Items<'_> {
        Items { rest: &self.buf }
    }

    /// The `i`-th item; past the end this yields the null sentinel.
    pub fn item(&self, i: usize) -> Item<'_> {
        self.iter().nth(i).unwrap_or(Item::Null)
    }

    /// Wraps an already-encoded byte string without validating it.
    pub(crate) fn from_encoded(bytes: &[u8]) -> Self {
        Collatable {
            buf: SmallVec::from_slice(bytes),
        }
    }
}

impl From<i64> for Collatable {
    fn from(v: i64) -> Self {
        let mut c = Collatable::new();
        c.add_i64(v);
        c
    }
}

impl From<bool> for Collatable {
    fn from(v: bool) -> Self {
        let mut c = Collatable::new();
        c.add_bool(v);
        c
    }
}

impl From<&str> for Collatable {
    fn from(v: &str) -> Self {
        let mut c = Collatable::new();
        c.add_string(v);
        c
    }
}

impl fmt::Debug for Collatable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Collatable")?;
        f.debug_list().entries(self.iter()).finish()
    }
}

/// A decoded collatable item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Item<'a> {
    Null,
    Bool(bool),
    Int(i64),
    String(&'a [u8]),
}

impl<'a> Item<'a> {
    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            Item::String(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }
}

/// Iterator over the decoded items of a [`Collatable`].
///
/// Decoding stops at the first malformed tag; encodings produced by this
/// module never contain one.
#[derive(Clone)]
pub struct Items<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Items<'a> {
    type Item = Item<'a>;

    fn next(&mut self) -> Option<Item<'a>> {
        let (&tag, rest) = self.rest.split_first()?;
        match tag {
            TAG_NULL => {
                self.rest = rest;
                Some(Item::Null)
            }
            TAG_FALSE | TAG_TRUE => {
                self.rest = rest;
                Some(Item::Bool(tag == TAG_TRUE))
            }
            t if (TAG_NEG_INT..=TAG_NEG_INT + 8).contains(&t) => {
                let len = 8 - (t - TAG_NEG_INT) as usize;
                if rest.len() < len {
                    self.rest = &[];
                    return None;
                }
                let mut payload = [0xFFu8; 8];
                payload[8 - len..].copy_from_slice(&rest[..len]);
                self.rest = &rest[len..];
                Some(Item::Int(BigEndian::read_i64(&payload)))
            }
            t if (TAG_POS_INT..=TAG_POS_INT + 8).contains(&t) => {
                let len = (t - TAG_POS_INT) as usize;
                if rest.len() < len {
                    self.rest = &[];
                    return None;
                }
                let mut payload = [0u8; 8];
                payload[8 - len..].copy_from_slice(&rest[..len]);
                self.rest = &rest[len..];
                Some(Item::Int(BigEndian::read_i64(&payload)))
            }
            TAG_STRING => {
                let end = rest.iter().position(|&b| b == 0x00)?;
                let item = Item::String(&rest[..end]);
                self.rest = &rest[end + 1..];
                Some(item)
            }
            _ => {
                debug_assert!(false, "malformed collatable tag {tag:#04x}");
                self.rest = &[];
                None
            }
        }
    }
}

impl<'a> IntoIterator for &'a Collatable {
    type Item = Item<'a>;
    type IntoIter = Items<'a>;

    fn into_iter(self) -> Items<'a> {
        self.iter()
    }
}
