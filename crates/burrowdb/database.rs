//! Opening, closing and file-level management of a database.

use std::ffi::CString;
use std::fmt;
use std::os::raw::{c_uint, c_void};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::collection::Collection;
use crate::engine::{self, ffi};
use crate::error::{Error, Result};
use crate::flags::{CopyFlags, DeleteMode, EnvFlags};

/// Whether a database is opened writeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    ReadWrite,
    ReadOnly,
}

/// Durability of commits, from fully synchronous to in-memory-until-flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Every commit is fsynced before it returns.
    #[default]
    Durable,
    /// Data is synced, metadata lazily; the last commit may be lost on
    /// crash but the file stays consistent.
    NoMetaSync,
    /// Syncing is left to the OS; a power failure may lose recent commits.
    SafeNoSync,
    /// No syncing at all; a crash may corrupt the database.
    UtterlyNoSync,
}

impl SyncMode {
    fn env_bits(self) -> u32 {
        match self {
            SyncMode::Durable => ffi::MDBX_SYNC_DURABLE,
            SyncMode::NoMetaSync => ffi::MDBX_NOMETASYNC,
            SyncMode::SafeNoSync => ffi::MDBX_SAFE_NOSYNC,
            SyncMode::UtterlyNoSync => ffi::MDBX_UTTERLY_NOSYNC,
        }
    }
}

/// Size and growth policy of the database file.
///
/// `None` fields keep the engine default. Sizes are in bytes; the engine
/// rounds them to its page granularity.
#[derive(Debug, Clone, Copy, Default)]
pub struct Geometry {
    /// Lower bound the file never shrinks below.
    pub size_lower: Option<usize>,
    /// Initial size.
    pub size_now: Option<usize>,
    /// Hard upper bound on file growth.
    pub size_upper: Option<usize>,
    /// Increment the file grows by when full.
    pub growth_step: Option<usize>,
    /// Unused-space threshold that triggers shrinking.
    pub shrink_threshold: Option<usize>,
    /// Page size; settable only at creation time.
    pub page_size: Option<usize>,
}

impl Geometry {
    fn field(v: Option<usize>) -> isize {
        v.map_or(-1, |v| v as isize)
    }
}

/// Everything configurable about [`Database::open_with_options`].
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub mode: Mode,
    pub sync: SyncMode,
    /// Cap on the number of named collections (index collections count).
    pub max_collections: u32,
    pub max_readers: Option<u32>,
    /// Unix permission bits for newly created files.
    pub file_mode: u32,
    pub geometry: Option<Geometry>,
    /// Extra engine flags (`NO_SUBDIR`, `EXCLUSIVE`, ...).
    pub flags: EnvFlags,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        DatabaseOptions {
            mode: Mode::default(),
            sync: SyncMode::default(),
            max_collections: 32,
            max_readers: None,
            file_mode: 0o644,
            geometry: None,
            flags: EnvFlags::empty(),
        }
    }
}

/// Counters describing the whole database or a single collection.
#[derive(Clone, Copy)]
pub struct Stat(pub(crate) ffi::MDBX_stat);

impl Stat {
    pub fn page_size(&self) -> u32 {
        self.0.ms_psize
    }

    /// Depth of the B+tree.
    pub fn depth(&self) -> u32 {
        self.0.ms_depth
    }

    pub fn branch_pages(&self) -> u64 {
        self.0.ms_branch_pages
    }

    pub fn leaf_pages(&self) -> u64 {
        self.0.ms_leaf_pages
    }

    pub fn overflow_pages(&self) -> u64 {
        self.0.ms_overflow_pages
    }

    /// Number of key/value entries (duplicates counted individually).
    pub fn entries(&self) -> u64 {
        self.0.ms_entries
    }

    /// Total bytes occupied by the counted pages.
    pub fn total_bytes(&self) -> u64 {
        (self.branch_pages() + self.leaf_pages() + self.overflow_pages())
            * u64::from(self.page_size())
    }
}

impl fmt::Debug for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stat")
            .field("page_size", &self.page_size())
            .field("depth", &self.depth())
            .field("branch_pages", &self.branch_pages())
            .field("leaf_pages", &self.leaf_pages())
            .field("overflow_pages", &self.overflow_pages())
            .field("entries", &self.entries())
            .finish()
    }
}

/// Runtime facts about an open environment: the geometry actually in
/// force and reader-table occupancy.
#[derive(Clone, Copy)]
pub struct Info(pub(crate) ffi::MDBX_envinfo);

impl Info {
    /// Current size of the datafile in bytes.
    pub fn size_current(&self) -> u64 {
        self.0.mi_geo.current
    }

    pub fn size_lower(&self) -> u64 {
        self.0.mi_geo.lower
    }

    pub fn size_upper(&self) -> u64 {
        self.0.mi_geo.upper
    }

    pub fn growth_step(&self) -> u64 {
        self.0.mi_geo.grow
    }

    pub fn shrink_threshold(&self) -> u64 {
        self.0.mi_geo.shrink
    }

    /// Transaction id of the most recent commit.
    pub fn recent_txn_id(&self) -> u64 {
        self.0.mi_recent_txnid
    }

    pub fn max_readers(&self) -> u32 {
        self.0.mi_maxreaders
    }

    pub fn num_readers(&self) -> u32 {
        self.0.mi_numreaders
    }
}

impl fmt::Debug for Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Info")
            .field("size_current", &self.size_current())
            .field("size_lower", &self.size_lower())
            .field("size_upper", &self.size_upper())
            .field("recent_txn_id", &self.recent_txn_id())
            .field("max_readers", &self.max_readers())
            .field("num_readers", &self.num_readers())
            .finish()
    }
}

pub(crate) struct DbInner {
    env: AtomicPtr<ffi::MDBX_env>,
    path: PathBuf,
    read_only: bool,
    pub(crate) collections: Mutex<IndexMap<String, Arc<Collection>>>,
}

// The engine handle is documented thread-safe; per-transaction state is
// confined to the (non-Send) Snapshot/Transaction objects.
unsafe impl Send for DbInner {}
unsafe impl Sync for DbInner {}

impl DbInner {
    /// The live engine handle, or `Closed` after `close()`.
    pub(crate) fn env(&self) -> Result<*mut ffi::MDBX_env> {
        let env = self.env.load(Ordering::Acquire);
        if env.is_null() {
            Err(Error::Closed)
        } else {
            Ok(env)
        }
    }

    pub(crate) fn read_only(&self) -> bool {
        self.read_only
    }
}

impl Drop for DbInner {
    fn drop(&mut self) {
        let env = self.env.swap(ptr::null_mut(), Ordering::AcqRel);
        if !env.is_null() {
            debug!(path = %self.path.display(), "closing database on drop");
            let rc = unsafe { ffi::mdbx_env_close_ex(env, false) };
            if rc != ffi::MDBX_SUCCESS {
                warn!(code = rc, "engine reported failure while closing database");
            }
        }
    }
}

/// An open database file: a set of named [`Collection`]s plus the engine
/// handle they all share.
///
/// Cloning is cheap and yields another handle to the same database.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DbInner>,
}

impl Database {
    /// Opens (creating if absent) a database at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Database> {
        Self::open_with_options(path, DatabaseOptions::default())
    }

    /// Opens a database with explicit geometry, mode and limits.
    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: DatabaseOptions,
    ) -> Result<Database> {
        let path = path.as_ref().to_path_buf();
        let read_only = options.mode == Mode::ReadOnly;
        if !read_only && !options.flags.contains(EnvFlags::NO_SUBDIR) {
            std::fs::create_dir_all(&path)?;
        }

        let mut env: *mut ffi::MDBX_env = ptr::null_mut();
        engine::mdbx_result(unsafe { ffi::mdbx_env_create(&mut env) })?;

        let guard = EnvGuard(env);
        engine::mdbx_result(unsafe {
            ffi::mdbx_env_set_maxdbs(env, options.max_collections as ffi::MDBX_dbi)
        })?;
        if let Some(readers) = options.max_readers {
            engine::mdbx_result(unsafe { ffi::mdbx_env_set_maxreaders(env, readers as c_uint) })?;
        }
        if let Some(geometry) = options.geometry {
            engine::mdbx_result(unsafe {
                ffi::mdbx_env_set_geometry(
                    env,
                    Geometry::field(geometry.size_lower),
                    Geometry::field(geometry.size_now),
                    Geometry::field(geometry.size_upper),
                    Geometry::field(geometry.growth_step),
                    Geometry::field(geometry.shrink_threshold),
                    Geometry::field(geometry.page_size),
                )
            })?;
        }

        let mut flags = options.flags.bits() | options.sync.env_bits();
        if read_only {
            flags |= ffi::MDBX_RDONLY;
        }
        let c_path = path_to_cstring(&path)?;
        engine::mdbx_result(unsafe {
            ffi::mdbx_env_open(
                env,
                c_path.as_ptr(),
                flags as ffi::MDBX_env_flags_t,
                options.file_mode as ffi::mdbx_mode_t,
            )
        })?;

        let inner = Arc::new(DbInner {
            env: AtomicPtr::new(env),
            path,
            read_only,
            collections: Mutex::new(IndexMap::new()),
        });
        // The engine's user-context slot lets callbacks holding only a raw
        // env find their way back to this object.
        unsafe {
            ffi::mdbx_env_set_userctx(env, Arc::as_ptr(&inner) as *mut c_void);
        }
        std::mem::forget(guard);

        debug!(path = %inner.path.display(), mode = ?options.mode, "opened database");
        Ok(Database { inner })
    }

    /// The path this database was opened at.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    /// Whole-database counters.
    pub fn stats(&self) -> Result<Stat> {
        let env = self.inner.env()?;
        let mut stat = std::mem::MaybeUninit::<ffi::MDBX_stat>::uninit();
        engine::mdbx_result(unsafe {
            ffi::mdbx_env_stat_ex(
                env,
                ptr::null(),
                stat.as_mut_ptr(),
                std::mem::size_of::<ffi::MDBX_stat>(),
            )
        })?;
        Ok(Stat(unsafe { stat.assume_init() }))
    }

    /// Geometry and reader bookkeeping of the running environment.
    pub fn info(&self) -> Result<Info> {
        let env = self.inner.env()?;
        let mut info = std::mem::MaybeUninit::<ffi::MDBX_envinfo>::uninit();
        engine::mdbx_result(unsafe {
            ffi::mdbx_env_info_ex(
                env,
                ptr::null(),
                info.as_mut_ptr(),
                std::mem::size_of::<ffi::MDBX_envinfo>(),
            )
        })?;
        Ok(Info(unsafe { info.assume_init() }))
    }

    /// Flushes buffered writes to disk; with `force`, fsyncs even under a
    /// relaxed [`SyncMode`].
    pub fn sync(&self, force: bool) -> Result<()> {
        let env = self.inner.env()?;
        engine::mdbx_result(unsafe { ffi::mdbx_env_sync_ex(env, force, false) })?;
        Ok(())
    }

    /// Writes a consistent copy of the database to `path`.
    pub fn copy_to(&self, path: impl AsRef<Path>, flags: CopyFlags) -> Result<()> {
        let env = self.inner.env()?;
        let c_path = path_to_cstring(path.as_ref())?;
        debug!(to = %path.as_ref().display(), ?flags, "copying database");
        engine::mdbx_result(unsafe {
            ffi::mdbx_env_copy(env, c_path.as_ptr(), flags.bits() as ffi::MDBX_copy_flags_t)
        })?;
        Ok(())
    }

    /// Releases the engine handle. Any later operation through this or a
    /// derived object fails with [`Error::Closed`]. Idempotent.
    pub fn close(&self) -> Result<()> {
        let env = self.inner.env.swap(ptr::null_mut(), Ordering::AcqRel);
        if env.is_null() {
            return Ok(());
        }
        self.inner.collections.lock().clear();
        debug!(path = %self.inner.path.display(), "closed database");
        engine::mdbx_result(unsafe { ffi::mdbx_env_close_ex(env, false) })?;
        Ok(())
    }

    /// Removes the data and lock files of the database at `path`, leaving
    /// the directory itself in place.
    pub fn erase(path: impl AsRef<Path>, mode: DeleteMode) -> Result<()> {
        let c_path = path_to_cstring(path.as_ref())?;
        debug!(path = %path.as_ref().display(), ?mode, "erasing database files");
        engine::mdbx_result(unsafe { ffi::mdbx_env_delete(c_path.as_ptr(), mode.to_engine()) })?;
        Ok(())
    }

    /// Removes the database at `path` entirely, directory included.
    pub fn delete(path: impl AsRef<Path>, mode: DeleteMode) -> Result<()> {
        let path = path.as_ref();
        Self::erase(path, mode)?;
        if path.is_dir() {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.path)
            .field("read_only", &self.inner.read_only)
            .field("open", &!self.inner.env.load(Ordering::Acquire).is_null())
            .finish()
    }
}

/// Closes a half-constructed env if `open_with_options` bails early.
struct EnvGuard(*mut ffi::MDBX_env);

impl Drop for EnvGuard {
    fn drop(&mut self) {
        unsafe {
            ffi::mdbx_env_close_ex(self.0, false);
        }
    }
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    let bytes = path.as_os_str().as_encoded_bytes();
    CString::new(bytes).map_err(|_| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path contains an interior NUL byte",
        ))
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{blob_collection, fill_numbered, open_db};
    use crate::{KeySort, ValueSort};

    #[test]
    fn open_reports_path_and_mode() {
        let (dir, db) = open_db();
        assert_eq!(db.path(), dir.path().join("db"));
        assert!(!db.is_read_only());
    }

    #[test]
    fn stats_count_entries() {
        let (_dir, db) = open_db();
        let coll = blob_collection(&db, "stuff");
        fill_numbered(&db, &coll, 10);
        let stat = db.stats().unwrap();
        assert!(stat.page_size() > 0);
        let snap = db.begin_snapshot().unwrap();
        assert_eq!(coll.with(&snap).stats().unwrap().entries(), 10);
    }

    #[test]
    fn info_reports_geometry_and_readers() {
        let (_dir, db) = open_db();
        let coll = blob_collection(&db, "stuff");
        fill_numbered(&db, &coll, 10);
        db.sync(true).unwrap();

        let info = db.info().unwrap();
        assert!(info.size_current() > 0);
        assert!(info.recent_txn_id() > 0);

        let snap = db.begin_snapshot().unwrap();
        assert!(db.info().unwrap().num_readers() >= 1);
        snap.finish().unwrap();
    }

    #[test]
    fn close_is_idempotent_and_detected() {
        let (_dir, db) = open_db();
        db.close().unwrap();
        db.close().unwrap();
        assert!(matches!(db.stats(), Err(Error::Closed)));
    }

    #[test]
    fn copy_to_produces_readable_database() {
        let (dir, db) = open_db();
        let coll = blob_collection(&db, "stuff");
        fill_numbered(&db, &coll, 25);

        let copy_path = dir.path().join("copy");
        std::fs::create_dir_all(&copy_path).unwrap();
        db.copy_to(&copy_path, CopyFlags::COMPACT).unwrap();

        let copy = Database::open(&copy_path).unwrap();
        let coll = copy
            .open_collection(
                "stuff",
                crate::CollectionOptions::new(KeySort::Lexicographic, ValueSort::Blob),
            )
            .unwrap();
        let snap = copy.begin_snapshot().unwrap();
        assert_eq!(coll.with(&snap).entry_count().unwrap(), 25);
        assert_eq!(coll.with(&snap).get("key-07").unwrap(), "the value is 7.");
    }

    #[test]
    fn geometry_and_limits_are_accepted() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut options = DatabaseOptions::default();
        options.max_collections = 4;
        options.geometry = Some(Geometry {
            size_upper: Some(16 << 20),
            growth_step: Some(1 << 20),
            ..Geometry::default()
        });
        let db = Database::open_with_options(dir.path().join("db"), options).unwrap();
        let _ = blob_collection(&db, "one");
    }

    #[test]
    fn read_only_reopen_rejects_writes() {
        let (dir, db) = open_db();
        let coll = blob_collection(&db, "stuff");
        fill_numbered(&db, &coll, 1);
        db.close().unwrap();
        drop(coll);
        drop(db);

        let mut options = DatabaseOptions::default();
        options.mode = Mode::ReadOnly;
        let db = Database::open_with_options(dir.path().join("db"), options).unwrap();
        assert!(db.is_read_only());
        let coll = db
            .open_collection(
                "stuff",
                crate::CollectionOptions::new(KeySort::Lexicographic, ValueSort::Blob),
            )
            .unwrap();
        let snap = db.begin_snapshot().unwrap();
        assert_eq!(coll.with(&snap).entry_count().unwrap(), 1);
        assert!(db.begin_transaction().is_err());
    }

    #[test]
    fn erase_and_delete_remove_files() {
        let (dir, db) = open_db();
        let coll = blob_collection(&db, "stuff");
        fill_numbered(&db, &coll, 1);
        let path = dir.path().join("db");
        db.close().unwrap();
        drop(coll);
        drop(db);

        Database::erase(&path, DeleteMode::Force).unwrap();
        assert!(path.is_dir());
        let db = Database::open(&path).unwrap();
        assert!(db
            .open_collection(
                "stuff",
                crate::CollectionOptions::new(KeySort::Lexicographic, ValueSort::Blob),
            )
            .is_err());
        db.close().unwrap();
        drop(db);

        Database::delete(&path, DeleteMode::Force).unwrap();
        assert!(!path.exists());
    }
}
