//! Read and mutate operations on scoped collection views.
//!
//! All writes funnel through [`RawView`], which also serves the index
//! subsystem: change hooks receive only a raw engine transaction handle and
//! rebuild a `RawView` from it to issue their own writes inside the same
//! transaction.
//!
//! When a collection has change hooks and does not allow duplicates, the
//! upsert/update paths switch from the engine's plain `put` to its atomic
//! `replace` primitive so the pre-existing value can be reported to the
//! hooks. Insert-only and append paths stay on plain `put`: the flag
//! guarantees there is no pre-existing value to report. Duplicate-key
//! collections always report a nil old value, since a plain put there adds
//! a value rather than replacing one.

use std::mem::MaybeUninit;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::Arc;

use crate::collection::{Change, Collection};
use crate::database::Stat;
use crate::engine::{self, ffi, EMPTY_VAL};
use crate::error::{Error, Result};
use crate::flags::WriteFlags;
use crate::transaction::{CollectionSnapshot, CollectionTransaction};
use crate::value::{Datum, Value};

/// Maps a write return code, collapsing the flag-conditioned soft failures
/// (`KeyExist`, `NotFound`, `MultipleValues`) to `false`.
fn soft_write(rc: c_int) -> Result<bool> {
    match rc {
        ffi::MDBX_SUCCESS | ffi::MDBX_RESULT_TRUE => Ok(true),
        ffi::MDBX_KEYEXIST | ffi::MDBX_NOTFOUND | ffi::MDBX_EMULTIVAL => Ok(false),
        code => Err(Error::from_code(code)),
    }
}

/// A collection bound to a raw engine transaction.
pub(crate) struct RawView<'a> {
    coll: &'a Arc<Collection>,
    txn: *mut ffi::MDBX_txn,
}

impl<'a> RawView<'a> {
    pub(crate) fn new(coll: &'a Arc<Collection>, txn: *mut ffi::MDBX_txn) -> Self {
        RawView { coll, txn }
    }

    fn dbi(&self) -> ffi::MDBX_dbi {
        self.coll.dbi()
    }

    fn dup(&self) -> bool {
        self.coll.allows_duplicates()
    }

    fn notify(&self, key: &[u8], old: Option<&[u8]>, new: Option<&[u8]>, flags: WriteFlags) {
        if !self.coll.has_change_hooks() {
            return;
        }
        let change = Change {
            raw_txn: self.txn,
            key,
            old_value: Value::of(old),
            new_value: Value::of(new),
            flags,
        };
        self.coll.dispatch_change(&change);
    }

    pub(crate) fn get_raw(&self, key: &[u8]) -> Result<Option<ffi::MDBX_val>> {
        let mut data = EMPTY_VAL;
        let rc = unsafe { ffi::mdbx_get(self.txn, self.dbi(), &engine::to_val(key), &mut data) };
        match rc {
            ffi::MDBX_SUCCESS => Ok(Some(data)),
            ffi::MDBX_NOTFOUND => Ok(None),
            code => Err(Error::from_code(code)),
        }
    }

    fn get_copy(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .get_raw(key)?
            .map(|val| unsafe { engine::from_val(val) }.to_vec()))
    }

    fn engine_put(&self, key: &[u8], value: &[u8], flags: WriteFlags) -> c_int {
        let mut data = engine::to_val(value);
        unsafe {
            ffi::mdbx_put(
                self.txn,
                self.dbi(),
                &engine::to_val(key),
                &mut data,
                flags.bits() as ffi::MDBX_put_flags_t,
            )
        }
    }

    /// `mdbx_replace_ex`: atomically writes (or, with `new == None`,
    /// deletes) and hands back the previous value.
    fn engine_replace(
        &self,
        key: &[u8],
        new: Option<&[u8]>,
        flags: WriteFlags,
    ) -> (c_int, Option<Vec<u8>>) {
        let mut old: Option<Vec<u8>> = None;
        let mut old_val = EMPTY_VAL;
        let mut new_val = new.map(engine::to_val);
        let new_ptr = new_val
            .as_mut()
            .map_or(ptr::null_mut(), |val| val as *mut ffi::MDBX_val);
        let rc = unsafe {
            ffi::mdbx_replace_ex(
                self.txn,
                self.dbi(),
                &engine::to_val(key),
                new_ptr,
                &mut old_val,
                flags.bits() as ffi::MDBX_put_flags_t,
                Some(engine::preserve_to_vec),
                &mut old as *mut Option<Vec<u8>> as *mut c_void,
            )
        };
        (rc, old)
    }

    /// Flag-aware write with hook dispatch; `Ok(false)` on a soft refusal.
    pub(crate) fn put_with_flags(
        &self,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> Result<bool> {
        let old_known_absent = flags.intersects(
            WriteFlags::NO_OVERWRITE
                | WriteFlags::NO_DUP_DATA
                | WriteFlags::APPEND
                | WriteFlags::APPEND_DUP,
        );
        if self.coll.has_change_hooks() && !self.dup() && !old_known_absent {
            let (rc, old) = self.engine_replace(key, Some(value), flags);
            let written = soft_write(rc)?;
            if written {
                self.notify(key, old.as_deref(), Some(value), flags);
            }
            Ok(written)
        } else {
            let written = soft_write(self.engine_put(key, value, flags))?;
            if written {
                self.notify(key, None, Some(value), flags);
            }
            Ok(written)
        }
    }

    pub(crate) fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with_flags(key, value, WriteFlags::UPSERT)?;
        Ok(())
    }

    pub(crate) fn insert(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let flag = if self.dup() {
            WriteFlags::NO_DUP_DATA
        } else {
            WriteFlags::NO_OVERWRITE
        };
        self.put_with_flags(key, value, flag)
    }

    pub(crate) fn update(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.put_with_flags(key, value, WriteFlags::UPDATE)
    }

    /// As [`update`](Self::update), additionally returning the replaced
    /// value (owned). `None` when the key was absent.
    pub(crate) fn update_and_get(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let (rc, old) = self.engine_replace(key, Some(value), WriteFlags::UPDATE);
        if !soft_write(rc)? {
            return Ok(None);
        }
        let old = old.unwrap_or_default();
        self.notify(key, Some(&old), Some(value), WriteFlags::UPDATE);
        Ok(Some(old))
    }

    pub(crate) fn append(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut flags = WriteFlags::APPEND;
        if self.dup() {
            flags |= WriteFlags::APPEND_DUP;
        }
        engine::mdbx_result(self.engine_put(key, value, flags))?;
        self.notify(key, None, Some(value), flags);
        Ok(())
    }

    pub(crate) fn put_reserve(
        &self,
        key: &[u8],
        len: usize,
        flags: WriteFlags,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<bool> {
        let old = if self.coll.has_change_hooks() && !self.dup() {
            self.get_copy(key)?
        } else {
            None
        };
        let mut data = ffi::MDBX_val {
            iov_base: ptr::null_mut(),
            iov_len: len,
        };
        let rc = unsafe {
            ffi::mdbx_put(
                self.txn,
                self.dbi(),
                &engine::to_val(key),
                &mut data,
                (flags | WriteFlags::RESERVE).bits() as ffi::MDBX_put_flags_t,
            )
        };
        if !soft_write(rc)? {
            return Ok(false);
        }
        if len == 0 {
            fill(&mut []);
            self.notify(key, old.as_deref(), Some(&[]), flags | WriteFlags::RESERVE);
            return Ok(true);
        }
        let buf = unsafe { std::slice::from_raw_parts_mut(data.iov_base as *mut u8, len) };
        fill(buf);
        self.notify(key, old.as_deref(), Some(&*buf), flags | WriteFlags::RESERVE);
        Ok(true)
    }

    /// Bulk insertion into a fixed-size duplicate collection. Returns the
    /// number of values actually stored.
    ///
    /// This path goes through the engine's multi-value put and does *not*
    /// fire change hooks; indexes over this collection go stale until
    /// rebuilt.
    pub(crate) fn put_duplicates(
        &self,
        key: &[u8],
        values: &[u8],
        count: usize,
        flags: WriteFlags,
    ) -> Result<usize> {
        if count == 0 || values.len() % count != 0 {
            return Err(Error::BadValueSize);
        }
        let each = values.len() / count;
        let mut pair = [
            ffi::MDBX_val {
                iov_base: values.as_ptr() as *mut c_void,
                iov_len: each,
            },
            ffi::MDBX_val {
                iov_base: ptr::null_mut(),
                iov_len: count,
            },
        ];
        let rc = unsafe {
            ffi::mdbx_put(
                self.txn,
                self.dbi(),
                &engine::to_val(key),
                pair.as_mut_ptr(),
                (flags | WriteFlags::MULTIPLE).bits() as ffi::MDBX_put_flags_t,
            )
        };
        if !soft_write(rc)? {
            return Ok(0);
        }
        Ok(pair[1].iov_len)
    }

    /// Deletes all values stored under `key`; false if it was absent.
    pub(crate) fn del(&self, key: &[u8]) -> Result<bool> {
        if self.coll.has_change_hooks() {
            if self.dup() {
                let old = self.get_copy(key)?;
                if old.is_none() {
                    return Ok(false);
                }
                let rc = unsafe {
                    ffi::mdbx_del(self.txn, self.dbi(), &engine::to_val(key), ptr::null())
                };
                match rc {
                    ffi::MDBX_SUCCESS => {
                        self.notify(key, old.as_deref(), None, WriteFlags::ALL_DUPS);
                        Ok(true)
                    }
                    ffi::MDBX_NOTFOUND => Ok(false),
                    code => Err(Error::from_code(code)),
                }
            } else {
                Ok(self.del_and_get(key)?.is_some())
            }
        } else {
            let rc =
                unsafe { ffi::mdbx_del(self.txn, self.dbi(), &engine::to_val(key), ptr::null()) };
            match rc {
                ffi::MDBX_SUCCESS => Ok(true),
                ffi::MDBX_NOTFOUND => Ok(false),
                code => Err(Error::from_code(code)),
            }
        }
    }

    /// Deletes only the exact `(key, value)` pair; false if absent.
    pub(crate) fn del_value(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let rc = unsafe {
            ffi::mdbx_del(
                self.txn,
                self.dbi(),
                &engine::to_val(key),
                &engine::to_val(value),
            )
        };
        match rc {
            ffi::MDBX_SUCCESS => {
                self.notify(key, Some(value), None, WriteFlags::empty());
                Ok(true)
            }
            ffi::MDBX_NOTFOUND => Ok(false),
            code => Err(Error::from_code(code)),
        }
    }

    /// As [`del`](Self::del), returning the removed value (owned).
    pub(crate) fn del_and_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut flags = WriteFlags::empty();
        if self.dup() {
            flags |= WriteFlags::ALL_DUPS;
        }
        let (rc, old) = self.engine_replace(key, None, flags);
        match rc {
            ffi::MDBX_SUCCESS | ffi::MDBX_RESULT_TRUE => {
                let old = old.unwrap_or_default();
                self.notify(key, Some(&old), None, flags);
                Ok(Some(old))
            }
            ffi::MDBX_NOTFOUND => Ok(None),
            code => Err(Error::from_code(code)),
        }
    }
}

impl<'s> CollectionSnapshot<'s> {
    fn raw(&self) -> Result<RawView<'_>> {
        // Catches use through a closed database; the transaction itself is
        // known live because `self` borrows it.
        self.coll.database()?.inner.env()?;
        Ok(RawView::new(&self.coll, self.snap.raw()))
    }

    /// The value stored under `key`, or the nil view.
    pub fn get<'k>(&self, key: impl Into<Datum<'k>>) -> Result<Value<'s>> {
        let key = key.into();
        let Some(kb) = key.bytes() else {
            return Ok(Value::nil());
        };
        match self.raw()?.get_raw(kb)? {
            Some(val) => Ok(unsafe { Value::from_raw(val) }),
            None => Ok(Value::nil()),
        }
    }

    /// The smallest entry whose key is `>= key`; `None` past the end.
    pub fn get_greater_or_equal<'k>(
        &self,
        key: impl Into<Datum<'k>>,
    ) -> Result<Option<(Value<'s>, Value<'s>)>> {
        let key = key.into();
        let Some(kb) = key.bytes() else {
            return Ok(None);
        };
        let raw = self.raw()?;
        let mut key_val = engine::to_val(kb);
        let mut data = EMPTY_VAL;
        let rc = unsafe {
            ffi::mdbx_get_equal_or_great(self.snap.raw(), raw.dbi(), &mut key_val, &mut data)
        };
        match rc {
            ffi::MDBX_SUCCESS | ffi::MDBX_RESULT_TRUE => Ok(Some(unsafe {
                (Value::from_raw(key_val), Value::from_raw(data))
            })),
            ffi::MDBX_NOTFOUND => Ok(None),
            code => Err(Error::from_code(code)),
        }
    }

    /// Runs `f` over the stored bytes without copying them out; `None` on
    /// a miss.
    pub fn get_with<'k, R>(
        &self,
        key: impl Into<Datum<'k>>,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<Option<R>> {
        let key = key.into();
        let Some(kb) = key.bytes() else {
            return Ok(None);
        };
        match self.raw()?.get_raw(kb)? {
            Some(val) => Ok(Some(f(unsafe { engine::from_val(val) }))),
            None => Ok(None),
        }
    }

    /// Number of entries (duplicates counted individually).
    pub fn entry_count(&self) -> Result<u64> {
        Ok(self.stats()?.entries())
    }

    /// Per-collection tree counters.
    pub fn stats(&self) -> Result<Stat> {
        let raw = self.raw()?;
        let mut stat = MaybeUninit::<ffi::MDBX_stat>::uninit();
        engine::mdbx_result(unsafe {
            ffi::mdbx_dbi_stat(
                self.snap.raw(),
                raw.dbi(),
                stat.as_mut_ptr(),
                std::mem::size_of::<ffi::MDBX_stat>(),
            )
        })?;
        Ok(Stat(unsafe { stat.assume_init() }))
    }

    /// Current value of the collection's persistent sequence counter.
    pub fn last_sequence(&self) -> Result<u64> {
        let raw = self.raw()?;
        let mut value: u64 = 0;
        engine::mdbx_result(unsafe {
            ffi::mdbx_dbi_sequence(self.snap.raw(), raw.dbi(), &mut value, 0)
        })?;
        Ok(value)
    }
}

impl<'t> CollectionTransaction<'t> {
    fn raw(&self) -> Result<RawView<'_>> {
        self.view.raw()
    }

    /// Upserts `key -> value`. The nil datum as a value deletes the key.
    pub fn put<'k, 'v>(
        &self,
        key: impl Into<Datum<'k>>,
        value: impl Into<Datum<'v>>,
    ) -> Result<()> {
        let key = key.into();
        let value = value.into();
        match value.bytes() {
            Some(vb) => self.raw()?.put(key.key_bytes()?, vb),
            None => {
                self.raw()?.del(key.key_bytes()?)?;
                Ok(())
            }
        }
    }

    /// Flag-aware write; `false` when a flag refused it (key exists, key
    /// absent, or multiple values in the way).
    pub fn put_with_flags<'k, 'v>(
        &self,
        key: impl Into<Datum<'k>>,
        value: impl Into<Datum<'v>>,
        flags: WriteFlags,
    ) -> Result<bool> {
        let key = key.into();
        let value = value.into();
        let vb = value.bytes().ok_or(Error::BadValueSize)?;
        self.raw()?.put_with_flags(key.key_bytes()?, vb, flags)
    }

    /// Inserts only if absent (for duplicate collections: only if the
    /// exact pair is absent). `false` if something was already there.
    pub fn insert<'k, 'v>(
        &self,
        key: impl Into<Datum<'k>>,
        value: impl Into<Datum<'v>>,
    ) -> Result<bool> {
        let key = key.into();
        let value = value.into();
        let vb = value.bytes().ok_or(Error::BadValueSize)?;
        self.raw()?.insert(key.key_bytes()?, vb)
    }

    /// Replaces only if present; `false` if the key was absent.
    pub fn update<'k, 'v>(
        &self,
        key: impl Into<Datum<'k>>,
        value: impl Into<Datum<'v>>,
    ) -> Result<bool> {
        let key = key.into();
        let value = value.into();
        let vb = value.bytes().ok_or(Error::BadValueSize)?;
        self.raw()?.update(key.key_bytes()?, vb)
    }

    /// As [`update`](Self::update), returning the replaced value.
    pub fn update_and_get<'k, 'v>(
        &self,
        key: impl Into<Datum<'k>>,
        value: impl Into<Datum<'v>>,
    ) -> Result<Option<Vec<u8>>> {
        let key = key.into();
        let value = value.into();
        let vb = value.bytes().ok_or(Error::BadValueSize)?;
        self.raw()?.update_and_get(key.key_bytes()?, vb)
    }

    /// Write-optimized insert of a key greater than every existing key;
    /// fails with [`Error::KeyMismatch`] otherwise.
    pub fn append<'k, 'v>(
        &self,
        key: impl Into<Datum<'k>>,
        value: impl Into<Datum<'v>>,
    ) -> Result<()> {
        let key = key.into();
        let value = value.into();
        let vb = value.bytes().ok_or(Error::BadValueSize)?;
        self.raw()?.append(key.key_bytes()?, vb)
    }

    /// Reserves `len` bytes under `key` and lets `fill` write them in
    /// place, saving one copy for large values.
    pub fn put_reserve<'k>(
        &self,
        key: impl Into<Datum<'k>>,
        len: usize,
        flags: WriteFlags,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<bool> {
        let key = key.into();
        self.raw()?.put_reserve(key.key_bytes()?, len, flags, fill)
    }

    /// Bulk-stores `count` equal-sized values from the concatenated
    /// `values` buffer under one key of a fixed-size duplicate collection.
    /// Returns how many were stored. Does not fire change hooks.
    pub fn put_duplicates<'k>(
        &self,
        key: impl Into<Datum<'k>>,
        values: &[u8],
        count: usize,
        flags: WriteFlags,
    ) -> Result<usize> {
        let key = key.into();
        self.raw()?.put_duplicates(key.key_bytes()?, values, count, flags)
    }

    /// Deletes `key` (all its values); `false` if it was absent.
    pub fn del<'k>(&self, key: impl Into<Datum<'k>>) -> Result<bool> {
        let key = key.into();
        self.raw()?.del(key.key_bytes()?)
    }

    /// Deletes the exact `(key, value)` pair; `false` if absent.
    pub fn del_value<'k, 'v>(
        &self,
        key: impl Into<Datum<'k>>,
        value: impl Into<Datum<'v>>,
    ) -> Result<bool> {
        let key = key.into();
        let value = value.into();
        let vb = value.bytes().ok_or(Error::BadValueSize)?;
        self.raw()?.del_value(key.key_bytes()?, vb)
    }

    /// As [`del`](Self::del), returning the removed value.
    pub fn del_and_get<'k>(&self, key: impl Into<Datum<'k>>) -> Result<Option<Vec<u8>>> {
        let key = key.into();
        self.raw()?.del_and_get(key.key_bytes()?)
    }

    /// Removes every entry, keeping the collection itself.
    ///
    /// A bulk operation: change hooks do not fire.
    pub fn del_all(&self) -> Result<()> {
        let raw = self.raw()?;
        engine::mdbx_result(unsafe { ffi::mdbx_drop(self.snap.raw(), raw.dbi(), false) })?;
        Ok(())
    }

    /// Removes the collection from the database entirely.
    pub fn delete_collection(&self) -> Result<()> {
        let raw = self.raw()?;
        engine::mdbx_result(unsafe { ffi::mdbx_drop(self.snap.raw(), raw.dbi(), true) })?;
        self.coll.forget();
        Ok(())
    }

    /// Atomically advances the sequence counter by `count`, returning the
    /// first value of the reserved range (`last_sequence() + 1`). Visible
    /// to others only after commit.
    pub fn next_sequence(&self, count: u64) -> Result<u64> {
        let raw = self.raw()?;
        let mut previous: u64 = 0;
        engine::mdbx_result(unsafe {
            ffi::mdbx_dbi_sequence(self.snap.raw(), raw.dbi(), &mut previous, count)
        })?;
        Ok(previous + 1)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{blob_collection, open_db};
    use crate::{KeySort, TxnOutcome, ValueSort};

    #[test]
    fn basic_round_trip() {
        let (_dir, db) = open_db();
        let stuff = blob_collection(&db, "stuff");

        let txn = db.begin_transaction().unwrap();
        {
            let view = stuff.with_txn(&txn);
            view.put("foo", "I am the value of foo").unwrap();
            view.put("splat", "I am splat's value").unwrap();
        }
        txn.commit().unwrap();

        let snap = db.begin_snapshot().unwrap();
        let view = stuff.with(&snap);
        assert_eq!(view.get("foo").unwrap(), "I am the value of foo");
        assert_eq!(view.get("splat").unwrap(), "I am splat's value");
        assert!(!view.get("bogus").unwrap().exists());
        assert_eq!(view.entry_count().unwrap(), 2);
    }

    #[test]
    fn put_nil_value_deletes() {
        let (_dir, db) = open_db();
        let stuff = blob_collection(&db, "stuff");
        stuff
            .in_transaction(|txn| {
                txn.put("k", "v")?;
                assert!(txn.get("k")?.exists());
                txn.put("k", ())?;
                assert!(!txn.get("k")?.exists());
                Ok(TxnOutcome::Commit)
            })
            .unwrap();
    }

    #[test]
    fn del_returns_true_exactly_once() {
        let (_dir, db) = open_db();
        let stuff = blob_collection(&db, "stuff");
        stuff
            .in_transaction(|txn| {
                txn.put("k", "v")?;
                assert!(txn.del("k")?);
                assert!(!txn.del("k")?);
                assert!(!txn.get("k")?.exists());
                Ok(TxnOutcome::Commit)
            })
            .unwrap();
    }

    #[test]
    fn insert_update_semantics() {
        let (_dir, db) = open_db();
        let stuff = blob_collection(&db, "stuff");
        stuff
            .in_transaction(|txn| {
                assert!(txn.insert("k", "first")?);
                assert!(!txn.insert("k", "second")?);
                assert_eq!(txn.get("k")?, "first");

                assert!(txn.update("k", "third")?);
                assert_eq!(txn.get("k")?, "third");
                assert!(!txn.update("absent", "nope")?);

                let old = txn.update_and_get("k", "fourth")?;
                assert_eq!(old.as_deref(), Some(&b"third"[..]));
                assert!(txn.update_and_get("absent", "nope")?.is_none());
                Ok(TxnOutcome::Commit)
            })
            .unwrap();
    }

    #[test]
    fn del_and_get_returns_old_value() {
        let (_dir, db) = open_db();
        let stuff = blob_collection(&db, "stuff");
        stuff
            .in_transaction(|txn| {
                txn.put("k", "v")?;
                assert_eq!(txn.del_and_get("k")?.as_deref(), Some(&b"v"[..]));
                assert!(txn.del_and_get("k")?.is_none());
                Ok(TxnOutcome::Commit)
            })
            .unwrap();
    }

    #[test]
    fn append_enforces_key_order() {
        let (_dir, db) = open_db();
        let stuff = blob_collection(&db, "stuff");
        stuff
            .in_transaction(|txn| {
                txn.append("a", "1")?;
                txn.append("b", "2")?;
                match txn.append("a", "3") {
                    Err(Error::KeyMismatch) => {}
                    other => panic!("expected KeyMismatch, got {other:?}"),
                }
                Ok(TxnOutcome::Commit)
            })
            .unwrap();
    }

    #[test]
    fn put_with_flags_soft_failures() {
        let (_dir, db) = open_db();
        let stuff = blob_collection(&db, "stuff");
        stuff
            .in_transaction(|txn| {
                assert!(txn.put_with_flags("k", "v", WriteFlags::INSERT)?);
                assert!(!txn.put_with_flags("k", "w", WriteFlags::INSERT)?);
                assert!(txn.put_with_flags("k", "w", WriteFlags::UPDATE)?);
                assert!(!txn.put_with_flags("absent", "w", WriteFlags::UPDATE)?);
                Ok(TxnOutcome::Commit)
            })
            .unwrap();
    }

    #[test]
    fn put_reserve_fills_in_place() {
        let (_dir, db) = open_db();
        let stuff = blob_collection(&db, "stuff");
        stuff
            .in_transaction(|txn| {
                let payload = b"filled in place";
                assert!(txn.put_reserve("k", payload.len(), WriteFlags::UPSERT, |buf| {
                    buf.copy_from_slice(payload);
                })?);
                assert_eq!(txn.get("k")?, &payload[..]);
                Ok(TxnOutcome::Commit)
            })
            .unwrap();
    }

    #[test]
    fn get_with_runs_zero_copy() {
        let (_dir, db) = open_db();
        let stuff = blob_collection(&db, "stuff");
        stuff
            .in_transaction(|txn| {
                txn.put("k", "some value")?;
                assert_eq!(txn.get_with("k", <[u8]>::len)?, Some(10));
                assert_eq!(txn.get_with("absent", <[u8]>::len)?, None);
                Ok(TxnOutcome::Commit)
            })
            .unwrap();
    }

    #[test]
    fn get_greater_or_equal_finds_successor() {
        let (_dir, db) = open_db();
        let stuff = blob_collection(&db, "stuff");
        let txn = db.begin_transaction().unwrap();
        {
            let view = stuff.with_txn(&txn);
            view.put("b", "1").unwrap();
            view.put("d", "2").unwrap();
            let (k, v) = view.get_greater_or_equal("c").unwrap().unwrap();
            assert_eq!(k, "d");
            assert_eq!(v, "2");
            let (k, _) = view.get_greater_or_equal("b").unwrap().unwrap();
            assert_eq!(k, "b");
            assert!(view.get_greater_or_equal("e").unwrap().is_none());
        }
        txn.commit().unwrap();
    }

    #[test]
    fn integer_keys_round_trip() {
        let (_dir, db) = open_db();
        let nums = db
            .create_collection("nums", KeySort::Integer, ValueSort::Blob)
            .unwrap();
        let txn = db.begin_transaction().unwrap();
        {
            let view = nums.with_txn(&txn);
            for i in [3u32, 1, 2, 40, 10] {
                view.put(i, &format!("#{i}")).unwrap();
            }
        }
        txn.commit().unwrap();

        let snap = db.begin_snapshot().unwrap();
        let view = nums.with(&snap);
        assert_eq!(view.get(40u32).unwrap(), "#40");
        // Numeric, not lexicographic, ordering.
        let keys: Vec<u32> = view
            .pairs()
            .unwrap()
            .map(|pair| pair.unwrap().0.as_i32().unwrap() as u32)
            .collect();
        assert_eq!(keys, vec![1, 2, 3, 10, 40]);
    }

    #[test]
    fn sequences_advance_and_isolate() {
        let (_dir, db) = open_db();
        let stuff = blob_collection(&db, "stuff");

        let outside = db.begin_snapshot().unwrap();
        assert_eq!(stuff.with(&outside).last_sequence().unwrap(), 0);

        let txn = db.begin_transaction().unwrap();
        {
            let view = stuff.with_txn(&txn);
            assert_eq!(view.last_sequence().unwrap(), 0);
            assert_eq!(view.next_sequence(1).unwrap(), 1);
            assert_eq!(view.last_sequence().unwrap(), 1);
            assert_eq!(view.next_sequence(5).unwrap(), 2);
            assert_eq!(view.last_sequence().unwrap(), 6);
        }
        // Uncommitted sequence movement is invisible to the snapshot.
        assert_eq!(stuff.with(&outside).last_sequence().unwrap(), 0);
        outside.finish().unwrap();
        txn.commit().unwrap();

        let snap = db.begin_snapshot().unwrap();
        assert_eq!(stuff.with(&snap).last_sequence().unwrap(), 6);
    }

    #[test]
    fn abort_discards_every_write() {
        let (_dir, db) = open_db();
        let stuff = blob_collection(&db, "stuff");
        stuff
            .in_transaction(|txn| {
                txn.put("keep", "me")?;
                Ok(TxnOutcome::Commit)
            })
            .unwrap();

        let txn = db.begin_transaction().unwrap();
        {
            let view = stuff.with_txn(&txn);
            view.put("gone", "soon").unwrap();
            view.del("keep").unwrap();
        }
        txn.abort().unwrap();

        let snap = db.begin_snapshot().unwrap();
        let view = stuff.with(&snap);
        assert_eq!(view.get("keep").unwrap(), "me");
        assert!(!view.get("gone").unwrap().exists());
    }

    #[test]
    fn del_all_empties_collection() {
        let (_dir, db) = open_db();
        let stuff = blob_collection(&db, "stuff");
        stuff
            .in_transaction(|txn| {
                txn.put("a", "1")?;
                txn.put("b", "2")?;
                txn.del_all()?;
                assert_eq!(txn.entry_count()?, 0);
                Ok(TxnOutcome::Commit)
            })
            .unwrap();
    }

    #[test]
    fn closed_database_is_detected() {
        let (_dir, db) = open_db();
        let stuff = blob_collection(&db, "stuff");
        db.close().unwrap();
        match db.begin_snapshot() {
            Err(Error::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
        match stuff.in_snapshot(|view| view.entry_count()) {
            Err(Error::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }
}

#[cfg(test)]
mod dup_test {
    use super::*;
    use crate::test_utils::open_db;
    use crate::{open_index, Collatable, KeySort, TxnOutcome, ValueSort};

    #[test]
    fn bulk_put_duplicates_fills_fixed_collection() {
        let (_dir, db) = open_db();
        let coll = db
            .create_collection("bulk", KeySort::Lexicographic, ValueSort::FixedSize)
            .unwrap();

        // Four 5-byte values, concatenated.
        let values = b"aaaaabbbbbcccccddddd";
        coll.in_transaction(|txn| {
            let written = txn.put_duplicates("k", values, 4, WriteFlags::empty())?;
            assert_eq!(written, 4);
            Ok(TxnOutcome::Commit)
        })
        .unwrap();

        let snap = db.begin_snapshot().unwrap();
        let view = coll.with(&snap);
        assert_eq!(view.entry_count().unwrap(), 4);
        let mut cursor = view.make_cursor().unwrap();
        assert!(cursor.seek_exact("k").unwrap());
        assert_eq!(cursor.value_count().unwrap(), 4);
        assert_eq!(cursor.value(), "aaaaa");
        assert!(cursor.last_dup().unwrap());
        assert_eq!(cursor.value(), "ddddd");
    }

    #[test]
    fn put_duplicates_rejects_ragged_input() {
        let (_dir, db) = open_db();
        let coll = db
            .create_collection("bulk", KeySort::Lexicographic, ValueSort::FixedSize)
            .unwrap();
        coll.in_transaction(|txn| {
            assert!(matches!(
                txn.put_duplicates("k", b"abcde", 2, WriteFlags::empty()),
                Err(Error::BadValueSize)
            ));
            Ok(TxnOutcome::Abort)
        })
        .unwrap();
    }

    #[test]
    fn bulk_path_bypasses_change_hooks() {
        let (_dir, db) = open_db();
        let coll = db
            .create_collection("bulk", KeySort::Lexicographic, ValueSort::FixedSize)
            .unwrap();
        let by_value = open_index(&coll, "by-value", |value, emit| {
            emit.emit(Collatable::from(
                std::str::from_utf8(value).unwrap_or(""),
            ));
        })
        .unwrap();

        coll.in_transaction(|txn| {
            txn.put_duplicates("k", b"aaaaabbbbb", 2, WriteFlags::empty())?;
            Ok(TxnOutcome::Commit)
        })
        .unwrap();

        // The index saw nothing; a rebuild brings it back in step.
        assert_eq!(by_value.update_count(), 0);
        assert_eq!(by_value.entry_count().unwrap(), 0);
        by_value.rebuild().unwrap();
        assert_eq!(by_value.entry_count().unwrap(), 2);
    }

    #[test]
    fn dup_collection_insert_and_pair_delete() {
        let (_dir, db) = open_db();
        let coll = db
            .create_collection("dups", KeySort::Lexicographic, ValueSort::Lexicographic)
            .unwrap();
        coll.in_transaction(|txn| {
            assert!(txn.insert("k", "alpha")?);
            assert!(txn.insert("k", "beta")?);
            // Exact pair already present.
            assert!(!txn.insert("k", "alpha")?);

            assert!(txn.del_value("k", "alpha")?);
            assert!(!txn.del_value("k", "alpha")?);
            assert_eq!(txn.get("k")?, "beta");

            // del removes the remaining values of the key.
            assert!(txn.del("k")?);
            assert!(!txn.get("k")?.exists());
            Ok(TxnOutcome::Commit)
        })
        .unwrap();
    }

    #[test]
    fn reverse_key_collections_scan_backwards() {
        let (_dir, db) = open_db();
        let coll = db
            .create_collection("rev", KeySort::ReverseLexicographic, ValueSort::Blob)
            .unwrap();
        coll.in_transaction(|txn| {
            txn.put("aaa", "1")?;
            txn.put("baa", "2")?;
            txn.put("aab", "3")?;
            Ok(TxnOutcome::Commit)
        })
        .unwrap();

        let snap = db.begin_snapshot().unwrap();
        let view = coll.with(&snap);
        // Reverse-lexicographic order compares bytes from the tail.
        let keys: Vec<Vec<u8>> = view
            .pairs()
            .unwrap()
            .map(|pair| pair.unwrap().0.to_vec())
            .collect();
        assert_eq!(keys, vec![b"aaa".to_vec(), b"baa".to_vec(), b"aab".to_vec()]);
    }
}
