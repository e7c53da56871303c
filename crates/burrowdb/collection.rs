//! Named collections and their change-hook chains.

use std::ffi::CString;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::database::{Database, DbInner};
use crate::engine::{self, ffi};
use crate::error::{Error, Result};
use crate::flags::{CollectionFlags, WriteFlags};
use crate::value::Value;

/// How keys of a collection are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeySort {
    /// Plain byte-wise ordering.
    #[default]
    Lexicographic,
    /// Byte-wise ordering, compared back to front.
    ReverseLexicographic,
    /// Native-endian 4- or 8-byte integers, ordered numerically.
    ///
    /// The on-disk representation is the machine's byte order and is not
    /// portable across architectures of different endianness.
    Integer,
}

impl KeySort {
    fn db_flags(self) -> CollectionFlags {
        match self {
            KeySort::Lexicographic => CollectionFlags::empty(),
            KeySort::ReverseLexicographic => CollectionFlags::REVERSE_KEY,
            KeySort::Integer => CollectionFlags::INTEGER_KEY,
        }
    }
}

/// How values of a collection are stored and ordered.
///
/// Anything other than [`ValueSort::Blob`] enables duplicate keys: the
/// collection then keeps a sorted set of values per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueSort {
    /// A single opaque value per key; no ordering among values.
    #[default]
    Blob,
    /// Duplicates allowed, byte-wise ordering.
    Lexicographic,
    /// Duplicates allowed, byte-wise ordering back to front.
    ReverseLexicographic,
    /// Duplicates allowed; all values of a key have the same size.
    FixedSize,
    /// Duplicates allowed; native-endian 4- or 8-byte integers.
    Integer,
}

impl ValueSort {
    fn db_flags(self) -> CollectionFlags {
        match self {
            ValueSort::Blob => CollectionFlags::empty(),
            ValueSort::Lexicographic => CollectionFlags::DUP_SORT,
            ValueSort::ReverseLexicographic => {
                CollectionFlags::DUP_SORT | CollectionFlags::REVERSE_DUP
            }
            ValueSort::FixedSize => CollectionFlags::DUP_SORT | CollectionFlags::DUP_FIXED,
            ValueSort::Integer => {
                CollectionFlags::DUP_SORT
                    | CollectionFlags::DUP_FIXED
                    | CollectionFlags::INTEGER_DUP
            }
        }
    }

    fn allows_duplicates(self) -> bool {
        self != ValueSort::Blob
    }
}

/// Typing and creation options for [`Database::open_collection`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionOptions {
    pub key_sort: KeySort,
    pub value_sort: ValueSort,
    /// Create the collection if it does not exist yet.
    pub create: bool,
}

impl CollectionOptions {
    pub fn new(key_sort: KeySort, value_sort: ValueSort) -> Self {
        CollectionOptions {
            key_sort,
            value_sort,
            create: false,
        }
    }

    pub fn create(mut self) -> Self {
        self.create = true;
        self
    }
}

/// One mutation of a collection, as seen by its change hooks.
///
/// `old_value` is nil for inserts, `new_value` is nil for deletes. The raw
/// transaction handle can be mapped back to scoped operations through the
/// index subsystem's recovery path.
pub struct Change<'a> {
    pub(crate) raw_txn: *mut ffi::MDBX_txn,
    pub key: &'a [u8],
    pub old_value: Value<'a>,
    pub new_value: Value<'a>,
    pub flags: WriteFlags,
}

impl Change<'_> {
    /// The raw engine transaction the mutation happened in.
    pub(crate) fn raw_txn(&self) -> *mut ffi::MDBX_txn {
        self.raw_txn
    }
}

impl fmt::Debug for Change<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Change")
            .field("key", &self.key)
            .field("old_value", &self.old_value)
            .field("new_value", &self.new_value)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Whether a change hook stays registered after an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Keep,
    /// Remove this hook from the chain; used by observers that have been
    /// deleted and only learn about it inside the hook.
    Unregister,
}

type HookFn = dyn Fn(&Change<'_>) -> Result<HookOutcome> + Send + Sync;

/// A named, typed key/value namespace inside a [`Database`].
///
/// At most one `Collection` instance exists per name and open database;
/// reopening returns the same `Arc`.
pub struct Collection {
    name: String,
    db: Weak<DbInner>,
    dbi: ffi::MDBX_dbi,
    key_sort: KeySort,
    value_sort: ValueSort,
    initialized: AtomicBool,
    hooks: Mutex<Vec<Arc<HookFn>>>,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_sort(&self) -> KeySort {
        self.key_sort
    }

    pub fn value_sort(&self) -> ValueSort {
        self.value_sort
    }

    pub fn allows_duplicates(&self) -> bool {
        self.value_sort.allows_duplicates()
    }

    /// False until the first write-bearing open: a collection freshly
    /// created by this open reports `false`, one that already existed on
    /// disk reports `true`. The index subsystem keys its initial rebuild
    /// off this.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// The owning database, if it is still open.
    pub fn database(&self) -> Result<Database> {
        self.db
            .upgrade()
            .map(|inner| Database { inner })
            .ok_or(Error::Closed)
    }

    pub(crate) fn dbi(&self) -> ffi::MDBX_dbi {
        self.dbi
    }

    /// Registers `hook` to run after every single-entry mutation of this
    /// collection, before earlier-registered hooks.
    pub fn add_change_hook(
        &self,
        hook: impl Fn(&Change<'_>) -> Result<HookOutcome> + Send + Sync + 'static,
    ) {
        self.hooks.lock().push(Arc::new(hook));
    }

    pub(crate) fn has_change_hooks(&self) -> bool {
        !self.hooks.lock().is_empty()
    }

    /// Runs the hook chain in reverse-registration order.
    ///
    /// Hooks may re-entrantly mutate this or any other collection: the
    /// chain is snapshotted before dispatch, so no lock is held while a
    /// hook runs. A failing hook is logged and kept; the mutation that
    /// triggered it is already applied and stays applied.
    pub(crate) fn dispatch_change(&self, change: &Change<'_>) {
        let snapshot: Vec<Arc<HookFn>> = {
            let hooks = self.hooks.lock();
            hooks.iter().rev().cloned().collect()
        };
        let mut dead: Vec<Arc<HookFn>> = Vec::new();
        for hook in &snapshot {
            match hook(change) {
                Ok(HookOutcome::Keep) => {}
                Ok(HookOutcome::Unregister) => dead.push(Arc::clone(hook)),
                Err(err) => {
                    error!(
                        collection = %self.name,
                        %err,
                        "change hook failed; mutation kept, hook kept"
                    );
                }
            }
        }
        if !dead.is_empty() {
            self.hooks
                .lock()
                .retain(|hook| !dead.iter().any(|d| Arc::ptr_eq(hook, d)));
        }
    }

    /// Drops this collection from the database-level table so a later open
    /// starts fresh. Called after the underlying tree is deleted.
    pub(crate) fn forget(&self) {
        if let Some(inner) = self.db.upgrade() {
            inner.collections.lock().shift_remove(&self.name);
        }
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("key_sort", &self.key_sort)
            .field("value_sort", &self.value_sort)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl Database {
    /// An already-open collection instance, if any.
    pub fn get_collection(&self, name: &str) -> Option<Arc<Collection>> {
        self.inner.collections.lock().get(name).cloned()
    }

    /// Opens `name` with the given typing, creating it when
    /// `options.create` is set.
    ///
    /// Returns the existing instance when the collection is already open;
    /// the requested sorts must then match or the call fails with
    /// [`Error::Incompatible`], as it does when the on-disk typing differs.
    ///
    /// The first open runs a short engine transaction of its own, so open
    /// collections before starting a write [`Transaction`](crate::Transaction)
    /// on the same thread.
    pub fn open_collection(
        &self,
        name: &str,
        options: CollectionOptions,
    ) -> Result<Arc<Collection>> {
        let mut table = self.inner.collections.lock();
        if let Some(existing) = table.get(name) {
            if existing.key_sort != options.key_sort || existing.value_sort != options.value_sort {
                return Err(Error::Incompatible);
            }
            return Ok(Arc::clone(existing));
        }

        let env = self.inner.env()?;
        let mut flags = options.key_sort.db_flags() | options.value_sort.db_flags();
        if options.create && !self.inner.read_only() {
            flags |= CollectionFlags::CREATE;
        }

        // The dbi handle is opened inside a short-lived transaction and
        // becomes env-global once it commits.
        let txn_flags = if self.inner.read_only() {
            ffi::MDBX_TXN_RDONLY
        } else {
            ffi::MDBX_TXN_READWRITE
        };
        let mut txn: *mut ffi::MDBX_txn = ptr::null_mut();
        engine::mdbx_result(unsafe {
            ffi::mdbx_txn_begin_ex(env, ptr::null_mut(), txn_flags, &mut txn, ptr::null_mut())
        })?;

        let open = || -> Result<(ffi::MDBX_dbi, bool)> {
            let c_name = CString::new(name).map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "collection name contains an interior NUL byte",
                ))
            })?;
            let mut dbi: ffi::MDBX_dbi = 0;
            engine::mdbx_result(unsafe {
                ffi::mdbx_dbi_open(
                    txn,
                    c_name.as_ptr(),
                    flags.bits() as ffi::MDBX_db_flags_t,
                    &mut dbi,
                )
            })?;
            let mut actual: std::os::raw::c_uint = 0;
            let mut state: std::os::raw::c_uint = 0;
            engine::mdbx_result(unsafe {
                ffi::mdbx_dbi_flags_ex(txn, dbi, &mut actual, &mut state)
            })?;
            let created_now = state & ffi::MDBX_DBI_CREAT != 0;
            Ok((dbi, created_now))
        };

        let (dbi, created_now) = match open() {
            Ok(result) => {
                engine::mdbx_result(unsafe { ffi::mdbx_txn_commit(txn) })?;
                result
            }
            Err(err) => {
                unsafe {
                    ffi::mdbx_txn_abort(txn);
                }
                return Err(err);
            }
        };

        debug!(collection = name, created = created_now, "opened collection");
        let collection = Arc::new(Collection {
            name: name.to_owned(),
            db: Arc::downgrade(&self.inner),
            dbi,
            key_sort: options.key_sort,
            value_sort: options.value_sort,
            initialized: AtomicBool::new(!created_now),
            hooks: Mutex::new(Vec::new()),
        });
        table.insert(name.to_owned(), Arc::clone(&collection));
        Ok(collection)
    }

    /// Opens `name`, creating it if needed.
    pub fn create_collection(
        &self,
        name: &str,
        key_sort: KeySort,
        value_sort: ValueSort,
    ) -> Result<Arc<Collection>> {
        self.open_collection(name, CollectionOptions::new(key_sort, value_sort).create())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn value_sort_implies_duplicates() {
        assert!(!ValueSort::Blob.allows_duplicates());
        for sort in [
            ValueSort::Lexicographic,
            ValueSort::ReverseLexicographic,
            ValueSort::FixedSize,
            ValueSort::Integer,
        ] {
            assert!(sort.allows_duplicates());
        }
    }
}
