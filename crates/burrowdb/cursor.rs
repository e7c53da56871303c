//! Ordered, optionally bounded iteration over a collection.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Bound, RangeBounds};
use std::os::raw::c_int;
use std::ptr;

use crate::engine::{self, ffi, EMPTY_VAL};
use crate::error::{Error, Result};
use crate::transaction::{CollectionSnapshot, Snapshot};
use crate::value::{Datum, Value};

/// A stateful iterator over one collection, read through one snapshot (or
/// transaction).
///
/// A cursor is *unpositioned* until the first movement call. `next()` from
/// unpositioned behaves like `first()`, `prev()` like `last()`. Inclusive
/// `min_key`/`max_key` bounds (made exclusive by `skip_min`/`skip_max`)
/// restrict every movement; stepping past a bound leaves the cursor
/// unpositioned again.
///
/// Keys are compared with the collection's own comparator, so bounds work
/// for reverse- and integer-sorted collections too.
pub struct Cursor<'s> {
    cursor: *mut ffi::MDBX_cursor,
    txn: *mut ffi::MDBX_txn,
    dbi: ffi::MDBX_dbi,
    dup: bool,
    key: ffi::MDBX_val,
    value: ffi::MDBX_val,
    positioned: bool,
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,
    skip_min: bool,
    skip_max: bool,
    _snap: PhantomData<&'s Snapshot>,
}

impl<'s> Cursor<'s> {
    /// Inclusive lower bound, if any.
    pub fn min_key(&self) -> Option<&[u8]> {
        self.min_key.as_deref()
    }

    /// Inclusive upper bound, if any.
    pub fn max_key(&self) -> Option<&[u8]> {
        self.max_key.as_deref()
    }

    pub fn skip_min(&self) -> bool {
        self.skip_min
    }

    pub fn skip_max(&self) -> bool {
        self.skip_max
    }

    /// Sets (or with the nil datum clears) the lower bound.
    pub fn set_min_key<'k>(&mut self, key: impl Into<Datum<'k>>) {
        self.min_key = key.into().bytes().map(<[u8]>::to_vec);
    }

    /// Sets (or with the nil datum clears) the upper bound.
    pub fn set_max_key<'k>(&mut self, key: impl Into<Datum<'k>>) {
        self.max_key = key.into().bytes().map(<[u8]>::to_vec);
    }

    /// Excludes the lower bound key itself.
    pub fn set_skip_min(&mut self, skip: bool) {
        self.skip_min = skip;
    }

    /// Excludes the upper bound key itself.
    pub fn set_skip_max(&mut self, skip: bool) {
        self.skip_max = skip;
    }

    fn clear_position(&mut self) {
        self.positioned = false;
        self.key = EMPTY_VAL;
        self.value = EMPTY_VAL;
    }

    fn op(&mut self, op: ffi::MDBX_cursor_op) -> Result<bool> {
        let rc = unsafe { ffi::mdbx_cursor_get(self.cursor, &mut self.key, &mut self.value, op) };
        match rc {
            ffi::MDBX_SUCCESS | ffi::MDBX_RESULT_TRUE => {
                self.positioned = true;
                Ok(true)
            }
            ffi::MDBX_NOTFOUND => {
                self.clear_position();
                Ok(false)
            }
            code => Err(Error::from_code(code)),
        }
    }

    /// Collection-aware comparison of two raw keys.
    fn cmp_raw(&self, a: &ffi::MDBX_val, b: &[u8]) -> c_int {
        unsafe { ffi::mdbx_cmp(self.txn, self.dbi, a, &engine::to_val(b)) }
    }

    fn current_equals(&self, key: &[u8]) -> bool {
        self.positioned && self.cmp_raw(&self.key, key) == 0
    }

    fn beyond_upper(&self) -> bool {
        match (&self.positioned, &self.max_key) {
            (true, Some(max)) => {
                let c = self.cmp_raw(&self.key, max);
                c > 0 || (c == 0 && self.skip_max)
            }
            _ => false,
        }
    }

    fn beyond_lower(&self) -> bool {
        match (&self.positioned, &self.min_key) {
            (true, Some(min)) => {
                let c = self.cmp_raw(&self.key, min);
                c < 0 || (c == 0 && self.skip_min)
            }
            _ => false,
        }
    }

    fn enforce_upper(&mut self) {
        if self.beyond_upper() {
            self.clear_position();
        }
    }

    fn enforce_lower(&mut self) {
        if self.beyond_lower() {
            self.clear_position();
        }
    }

    /// Moves to the first in-bounds entry.
    pub fn first(&mut self) -> Result<bool> {
        match self.min_key.clone() {
            None => {
                self.op(ffi::MDBX_FIRST)?;
            }
            Some(min) => {
                self.key = engine::to_val(&min);
                self.op(ffi::MDBX_SET_RANGE)?;
                if self.skip_min && self.current_equals(&min) {
                    let step = if self.dup {
                        ffi::MDBX_NEXT_NODUP
                    } else {
                        ffi::MDBX_NEXT
                    };
                    self.op(step)?;
                }
            }
        }
        self.enforce_upper();
        Ok(self.positioned)
    }

    /// Moves to the last in-bounds entry.
    pub fn last(&mut self) -> Result<bool> {
        match self.max_key.clone() {
            None => {
                self.op(ffi::MDBX_LAST)?;
            }
            Some(max) => {
                self.key = engine::to_val(&max);
                if self.op(ffi::MDBX_SET_RANGE)? {
                    let c = self.cmp_raw(&self.key, &max);
                    if c > 0 || (c == 0 && self.skip_max) {
                        // Overshot (or sitting on an excluded bound): the
                        // previous entry is the last one in range.
                        self.op(ffi::MDBX_PREV)?;
                    } else if c == 0 && self.dup {
                        self.op(ffi::MDBX_LAST_DUP)?;
                    }
                } else {
                    // Every key sorts below the bound.
                    self.op(ffi::MDBX_LAST)?;
                }
            }
        }
        self.enforce_lower();
        Ok(self.positioned)
    }

    /// Steps forward; from unpositioned this is `first()`.
    pub fn next(&mut self) -> Result<bool> {
        if !self.positioned {
            return self.first();
        }
        self.op(ffi::MDBX_NEXT)?;
        self.enforce_upper();
        Ok(self.positioned)
    }

    /// Steps backward; from unpositioned this is `last()`.
    pub fn prev(&mut self) -> Result<bool> {
        if !self.positioned {
            return self.last();
        }
        self.op(ffi::MDBX_PREV)?;
        self.enforce_lower();
        Ok(self.positioned)
    }

    /// Steps to the first value of the next distinct key.
    pub fn next_key(&mut self) -> Result<bool> {
        if !self.positioned {
            return self.first();
        }
        self.op(ffi::MDBX_NEXT_NODUP)?;
        self.enforce_upper();
        Ok(self.positioned)
    }

    /// Steps to the last value of the previous distinct key.
    pub fn prev_key(&mut self) -> Result<bool> {
        if !self.positioned {
            return self.last();
        }
        self.op(ffi::MDBX_PREV_NODUP)?;
        self.enforce_lower();
        Ok(self.positioned)
    }

    /// Steps to the next duplicate value of the current key; false at the
    /// last one (or when unpositioned).
    pub fn next_dup(&mut self) -> Result<bool> {
        if !self.positioned {
            return Ok(false);
        }
        self.op(ffi::MDBX_NEXT_DUP)
    }

    /// Steps to the previous duplicate value of the current key.
    pub fn prev_dup(&mut self) -> Result<bool> {
        if !self.positioned {
            return Ok(false);
        }
        self.op(ffi::MDBX_PREV_DUP)
    }

    /// Moves to the first duplicate value of the current key.
    pub fn first_dup(&mut self) -> Result<bool> {
        if !self.positioned {
            return Ok(false);
        }
        self.op(ffi::MDBX_FIRST_DUP)
    }

    /// Moves to the last duplicate value of the current key.
    pub fn last_dup(&mut self) -> Result<bool> {
        if !self.positioned {
            return Ok(false);
        }
        self.op(ffi::MDBX_LAST_DUP)
    }

    /// Moves to the exact `(key, value)` pair of a duplicate collection.
    pub fn seek_pair<'k, 'v>(
        &mut self,
        key: impl Into<Datum<'k>>,
        value: impl Into<Datum<'v>>,
    ) -> Result<bool> {
        let key = key.into();
        let value = value.into();
        self.key = engine::to_val(key.key_bytes()?);
        self.value = engine::to_val(value.key_bytes()?);
        self.op(ffi::MDBX_GET_BOTH)?;
        self.enforce_lower();
        self.enforce_upper();
        Ok(self.positioned)
    }

    /// Moves to `key` and its smallest duplicate value `>= value`.
    pub fn seek_pair_range<'k, 'v>(
        &mut self,
        key: impl Into<Datum<'k>>,
        value: impl Into<Datum<'v>>,
    ) -> Result<bool> {
        let key = key.into();
        let value = value.into();
        self.key = engine::to_val(key.key_bytes()?);
        self.value = engine::to_val(value.key_bytes()?);
        self.op(ffi::MDBX_GET_BOTH_RANGE)?;
        self.enforce_lower();
        self.enforce_upper();
        Ok(self.positioned)
    }

    /// Moves to the smallest in-bounds key `>= key`.
    pub fn seek<'k>(&mut self, key: impl Into<Datum<'k>>) -> Result<bool> {
        let key = key.into();
        let kb = key.key_bytes()?;
        let below_min = self
            .min_key
            .as_deref()
            .is_some_and(|min| self.cmp_raw(&engine::to_val(kb), min) < 0);
        if below_min {
            return self.first();
        }
        self.key = engine::to_val(kb);
        self.op(ffi::MDBX_SET_RANGE)?;
        self.enforce_upper();
        Ok(self.positioned)
    }

    /// Moves to exactly `key`; false (and unpositioned) if absent or out
    /// of bounds.
    pub fn seek_exact<'k>(&mut self, key: impl Into<Datum<'k>>) -> Result<bool> {
        let key = key.into();
        let kb = key.key_bytes()?;
        self.key = engine::to_val(kb);
        self.op(ffi::MDBX_SET_KEY)?;
        self.enforce_lower();
        self.enforce_upper();
        Ok(self.positioned)
    }

    /// The current key; nil when unpositioned.
    pub fn key(&self) -> Value<'s> {
        if self.positioned {
            unsafe { Value::from_raw(self.key) }
        } else {
            Value::nil()
        }
    }

    /// The current value; nil when unpositioned.
    pub fn value(&self) -> Value<'s> {
        if self.positioned {
            unsafe { Value::from_raw(self.value) }
        } else {
            Value::nil()
        }
    }

    pub fn value_len(&self) -> usize {
        if self.positioned {
            self.value.iov_len
        } else {
            0
        }
    }

    /// Number of values stored under the current key (1 unless the
    /// collection allows duplicates); 0 when unpositioned.
    pub fn value_count(&self) -> Result<usize> {
        if !self.positioned {
            return Ok(0);
        }
        let mut count: usize = 0;
        engine::mdbx_result(unsafe { ffi::mdbx_cursor_count(self.cursor, &mut count) })?;
        Ok(count)
    }

    pub fn has_value(&self) -> bool {
        self.positioned
    }

    /// Whether the cursor sits on the very first entry of the collection
    /// (bounds not considered).
    pub fn on_first(&self) -> Result<bool> {
        if !self.positioned {
            return Ok(false);
        }
        engine::mdbx_result(unsafe { ffi::mdbx_cursor_on_first(self.cursor) })
    }

    /// Whether the cursor sits on the very last entry of the collection.
    pub fn on_last(&self) -> Result<bool> {
        if !self.positioned {
            return Ok(false);
        }
        engine::mdbx_result(unsafe { ffi::mdbx_cursor_on_last(self.cursor) })
    }

    /// Compares the current key against `key` with the collection's own
    /// comparator. Fails with [`Error::NotFound`] when unpositioned.
    pub fn compare_key<'k>(&self, key: impl Into<Datum<'k>>) -> Result<CmpOrdering> {
        let key = key.into();
        let kb = key.key_bytes()?;
        if !self.positioned {
            return Err(Error::NotFound);
        }
        Ok(self.cmp_raw(&self.key, kb).cmp(&0))
    }

    /// Releases the engine cursor; equivalent to dropping it.
    pub fn close(self) {}

    /// Consumes the cursor into a forward iterator over its range.
    pub fn into_pairs(self) -> Pairs<'s> {
        Pairs {
            cursor: self,
            reverse: false,
            done: false,
        }
    }

    /// Consumes the cursor into a backward iterator over its range.
    pub fn into_pairs_reversed(self) -> Pairs<'s> {
        Pairs {
            cursor: self,
            reverse: true,
            done: false,
        }
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        unsafe {
            ffi::mdbx_cursor_close(self.cursor);
        }
    }
}

impl fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("positioned", &self.positioned)
            .field("min_key", &self.min_key)
            .field("max_key", &self.max_key)
            .field("skip_min", &self.skip_min)
            .field("skip_max", &self.skip_max)
            .finish()
    }
}

impl<'s> IntoIterator for Cursor<'s> {
    type Item = Result<(Value<'s>, Value<'s>)>;
    type IntoIter = Pairs<'s>;

    fn into_iter(self) -> Pairs<'s> {
        self.into_pairs()
    }
}

/// Iterator over the `(key, value)` pairs of a cursor's range.
///
/// Yielded views borrow from the snapshot, not the iterator, so they may be
/// collected and outlive the iteration.
pub struct Pairs<'s> {
    cursor: Cursor<'s>,
    reverse: bool,
    done: bool,
}

impl<'s> Iterator for Pairs<'s> {
    type Item = Result<(Value<'s>, Value<'s>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = if self.reverse {
            self.cursor.prev()
        } else {
            self.cursor.next()
        };
        match step {
            Ok(true) => Some(Ok((self.cursor.key(), self.cursor.value()))),
            Ok(false) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl<'s> CollectionSnapshot<'s> {
    /// Opens an unbounded cursor over this collection.
    pub fn make_cursor(&self) -> Result<Cursor<'s>> {
        self.coll.database()?.inner.env()?;
        let mut cursor: *mut ffi::MDBX_cursor = ptr::null_mut();
        engine::mdbx_result(unsafe {
            ffi::mdbx_cursor_open(self.snap.raw(), self.coll.dbi(), &mut cursor)
        })?;
        Ok(Cursor {
            cursor,
            txn: self.snap.raw(),
            dbi: self.coll.dbi(),
            dup: self.coll.allows_duplicates(),
            key: EMPTY_VAL,
            value: EMPTY_VAL,
            positioned: false,
            min_key: None,
            max_key: None,
            skip_min: false,
            skip_max: false,
            _snap: PhantomData,
        })
    }

    /// Opens a cursor pre-bounded to `bounds`; open range ends leave the
    /// corresponding side unbounded.
    pub fn range<K: AsRef<[u8]>>(&self, bounds: impl RangeBounds<K>) -> Result<Cursor<'s>> {
        let mut cursor = self.make_cursor()?;
        match bounds.start_bound() {
            Bound::Included(k) => cursor.min_key = Some(k.as_ref().to_vec()),
            Bound::Excluded(k) => {
                cursor.min_key = Some(k.as_ref().to_vec());
                cursor.skip_min = true;
            }
            Bound::Unbounded => {}
        }
        match bounds.end_bound() {
            Bound::Included(k) => cursor.max_key = Some(k.as_ref().to_vec()),
            Bound::Excluded(k) => {
                cursor.max_key = Some(k.as_ref().to_vec());
                cursor.skip_max = true;
            }
            Bound::Unbounded => {}
        }
        Ok(cursor)
    }

    /// Iterates every entry in ascending key order.
    pub fn pairs(&self) -> Result<Pairs<'s>> {
        Ok(self.make_cursor()?.into_pairs())
    }

    /// Iterates every entry in descending key order.
    pub fn pairs_reversed(&self) -> Result<Pairs<'s>> {
        Ok(self.make_cursor()?.into_pairs_reversed())
    }
}
