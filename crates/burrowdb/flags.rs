//! Typed flag sets over the engine's numeric option bits.

use bitflags::bitflags;

use crate::engine::ffi;

bitflags! {
    /// Environment-level open flags beyond what [`DatabaseOptions`] models
    /// as structured fields.
    ///
    /// [`DatabaseOptions`]: crate::DatabaseOptions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        /// Store the data and lock files directly at the given path instead
        /// of inside a subdirectory.
        const NO_SUBDIR = ffi::MDBX_NOSUBDIR;
        /// Refuse to share the database with any other process.
        const EXCLUSIVE = ffi::MDBX_EXCLUSIVE;
        /// Open an already-running database, adopting its mode flags.
        const ACCEDE = ffi::MDBX_ACCEDE;
        /// Map the file writeable; trades safety against stray writes for
        /// fewer copies.
        const WRITE_MAP = ffi::MDBX_WRITEMAP;
        /// Do not ask the OS to read ahead.
        const NO_READ_AHEAD = ffi::MDBX_NORDAHEAD;
        /// Skip zeroing freshly allocated pages.
        const NO_MEM_INIT = ffi::MDBX_NOMEMINIT;
        /// Coalesce freed pages while reclaiming.
        const COALESCE = ffi::MDBX_COALESCE;
        /// Reclaim garbage in LIFO order.
        const LIFO_RECLAIM = ffi::MDBX_LIFORECLAIM;
    }
}

bitflags! {
    /// Write-operation flags, mirroring the engine's put flag set.
    ///
    /// `INSERT` and `UPDATE` are the collection-layer names for the
    /// engine's no-overwrite and must-exist bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WriteFlags: u32 {
        /// Plain upsert.
        const UPSERT = ffi::MDBX_UPSERT;
        /// Fail (softly) if the key already exists.
        const NO_OVERWRITE = ffi::MDBX_NOOVERWRITE;
        /// Fail (softly) if the exact key/value pair already exists.
        const NO_DUP_DATA = ffi::MDBX_NODUPDATA;
        /// Replace the existing single value; fail (softly) if the key is
        /// absent or holds several values.
        const CURRENT = ffi::MDBX_CURRENT;
        /// Operate on every duplicate of the key at once.
        const ALL_DUPS = ffi::MDBX_ALLDUPS;
        /// Reserve space and let the caller fill it in place.
        const RESERVE = ffi::MDBX_RESERVE;
        /// The key is strictly greater than every existing key.
        const APPEND = ffi::MDBX_APPEND;
        /// The value sorts after every existing duplicate of the key.
        const APPEND_DUP = ffi::MDBX_APPENDDUP;
        /// Bulk insertion of equal-sized duplicates.
        const MULTIPLE = ffi::MDBX_MULTIPLE;

        /// Insert only if the key (or, with duplicates, the pair) is absent.
        const INSERT = ffi::MDBX_NOOVERWRITE;
        /// Replace only if the key is already present.
        const UPDATE = ffi::MDBX_CURRENT;
    }
}

bitflags! {
    /// Per-collection tree flags; derived from the declared sorts, never
    /// set directly by callers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct CollectionFlags: u32 {
        const REVERSE_KEY = ffi::MDBX_REVERSEKEY;
        const DUP_SORT = ffi::MDBX_DUPSORT;
        const INTEGER_KEY = ffi::MDBX_INTEGERKEY;
        const DUP_FIXED = ffi::MDBX_DUPFIXED;
        const INTEGER_DUP = ffi::MDBX_INTEGERDUP;
        const REVERSE_DUP = ffi::MDBX_REVERSEDUP;
        const CREATE = ffi::MDBX_CREATE;
    }
}

bitflags! {
    /// Options for [`Database::copy_to`](crate::Database::copy_to).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CopyFlags: u32 {
        /// Omit free pages and renumber the rest sequentially.
        const COMPACT = ffi::MDBX_CP_COMPACT;
        /// Write the copy with a dynamic (auto-shrinkable) geometry.
        const FORCE_DYNAMIC_SIZE = ffi::MDBX_CP_FORCE_DYNAMIC_SIZE;
    }
}

/// How eagerly [`Database::erase`]/[`Database::delete`] treat a database
/// that other processes may still have open.
///
/// [`Database::erase`]: crate::Database::erase
/// [`Database::delete`]: crate::Database::delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Delete without checking for other users.
    Force,
    /// Fail unless the database is verifiably unused.
    RequireUnused,
    /// Block until every other user is gone, then delete.
    WaitForUnused,
}

impl DeleteMode {
    pub(crate) fn to_engine(self) -> ffi::MDBX_env_delete_mode_t {
        match self {
            DeleteMode::Force => ffi::MDBX_ENV_JUST_DELETE,
            DeleteMode::RequireUnused => ffi::MDBX_ENV_ENSURE_UNUSED,
            DeleteMode::WaitForUnused => ffi::MDBX_ENV_WAIT_FOR_UNUSED,
        }
    }
}
