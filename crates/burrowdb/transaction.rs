//! Read-only snapshots, read-write transactions and the scoped views that
//! bind them to a collection.

use std::fmt;
use std::os::raw::c_void;
use std::ptr;
use std::sync::{Arc, Weak};

use derive_more::Deref;
use tracing::warn;

use crate::collection::Collection;
use crate::database::{Database, DbInner};
use crate::engine::{self, ffi};
use crate::error::{Error, Result};

/// A read-only, point-in-time view of a database.
///
/// While alive it pins the pages it reads, so every [`Value`](crate::Value)
/// obtained through it stays valid. Finishing (or dropping) the snapshot
/// releases the pages; the borrow checker keeps views from outliving it.
///
/// Snapshots are not shareable across threads.
pub struct Snapshot {
    db: Database,
    txn: *mut ffi::MDBX_txn,
}

impl Snapshot {
    pub(crate) fn begin(db: &Database) -> Result<Snapshot> {
        let env = db.inner.env()?;
        let mut txn: *mut ffi::MDBX_txn = ptr::null_mut();
        engine::mdbx_result(unsafe {
            ffi::mdbx_txn_begin_ex(
                env,
                ptr::null_mut(),
                ffi::MDBX_TXN_RDONLY,
                &mut txn,
                ptr::null_mut(),
            )
        })?;
        Ok(Snapshot {
            db: db.clone(),
            txn,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub(crate) fn raw(&self) -> *mut ffi::MDBX_txn {
        self.txn
    }

    /// Ends the snapshot, releasing its read lock and pinned pages.
    pub fn finish(mut self) -> Result<()> {
        self.end()
    }

    fn end(&mut self) -> Result<()> {
        let txn = std::mem::replace(&mut self.txn, ptr::null_mut());
        if txn.is_null() {
            return Err(Error::UseAfterFinish);
        }
        engine::mdbx_result(unsafe { ffi::mdbx_txn_abort(txn) })?;
        Ok(())
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        if !self.txn.is_null() {
            if let Err(err) = self.end() {
                warn!(%err, "failed to abort snapshot on drop");
            }
        }
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("db", &self.db).finish()
    }
}

/// The cell planted in the engine's per-transaction user slot.
///
/// Change hooks receive only a raw engine handle; reading this slot back is
/// how they prove the handle belongs to a live transaction of this layer
/// before issuing writes through it.
struct TxnCell {
    db: Weak<DbInner>,
}

/// A read-write view of a database.
///
/// At most one write transaction exists per database at a time, across
/// processes; [`Database::begin_transaction`] blocks until any concurrent
/// writer finishes. All writes become durable on [`commit`](Self::commit)
/// and are discarded on [`abort`](Self::abort) or drop.
///
/// Dereferences to [`Snapshot`] for the read operations.
#[derive(Deref)]
pub struct Transaction {
    #[deref]
    snap: Snapshot,
    cell: *mut TxnCell,
}

impl Transaction {
    pub(crate) fn begin(db: &Database) -> Result<Transaction> {
        let env = db.inner.env()?;
        let cell = Box::into_raw(Box::new(TxnCell {
            db: Arc::downgrade(&db.inner),
        }));
        let mut txn: *mut ffi::MDBX_txn = ptr::null_mut();
        let rc = unsafe {
            ffi::mdbx_txn_begin_ex(
                env,
                ptr::null_mut(),
                ffi::MDBX_TXN_READWRITE,
                &mut txn,
                cell as *mut c_void,
            )
        };
        if let Err(err) = engine::mdbx_result(rc) {
            drop(unsafe { Box::from_raw(cell) });
            return Err(err);
        }
        Ok(Transaction {
            snap: Snapshot {
                db: db.clone(),
                txn,
            },
            cell,
        })
    }

    /// Commits every write made through this transaction.
    pub fn commit(mut self) -> Result<()> {
        let txn = std::mem::replace(&mut self.snap.txn, ptr::null_mut());
        if txn.is_null() {
            return Err(Error::UseAfterFinish);
        }
        self.free_cell();
        engine::mdbx_result(unsafe { ffi::mdbx_txn_commit(txn) })?;
        Ok(())
    }

    /// Discards every write made through this transaction.
    pub fn abort(mut self) -> Result<()> {
        let txn = std::mem::replace(&mut self.snap.txn, ptr::null_mut());
        if txn.is_null() {
            return Err(Error::UseAfterFinish);
        }
        self.free_cell();
        engine::mdbx_result(unsafe { ffi::mdbx_txn_abort(txn) })?;
        Ok(())
    }

    fn free_cell(&mut self) {
        let cell = std::mem::replace(&mut self.cell, ptr::null_mut());
        if !cell.is_null() {
            drop(unsafe { Box::from_raw(cell) });
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // The inner Snapshot's drop aborts the engine txn if still active.
        self.free_cell();
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("db", &self.snap.db)
            .finish()
    }
}

/// A write transaction recovered from a raw engine handle inside a change
/// hook. Only handles carrying this layer's user-slot cell recover.
pub(crate) struct RecoveredTransaction {
    txn: *mut ffi::MDBX_txn,
}

impl RecoveredTransaction {
    pub(crate) fn from_raw(txn: *mut ffi::MDBX_txn) -> Result<RecoveredTransaction> {
        let cell = unsafe { ffi::mdbx_txn_get_userctx(txn) } as *mut TxnCell;
        if cell.is_null() {
            return Err(Error::UseAfterFinish);
        }
        if unsafe { &*cell }.db.upgrade().is_none() {
            return Err(Error::Closed);
        }
        Ok(RecoveredTransaction { txn })
    }

    pub(crate) fn raw(&self) -> *mut ffi::MDBX_txn {
        self.txn
    }
}

impl Database {
    /// Starts a read-only snapshot.
    pub fn begin_snapshot(&self) -> Result<Snapshot> {
        Snapshot::begin(self)
    }

    /// Starts a read-write transaction, blocking while another write
    /// transaction (in any process) is active.
    pub fn begin_transaction(&self) -> Result<Transaction> {
        Transaction::begin(self)
    }
}

/// Read operations on one collection through one snapshot (or transaction).
///
/// Borrow-tied to the snapshot: values read through it share the snapshot's
/// lifetime, not the view's.
#[derive(Clone)]
pub struct CollectionSnapshot<'s> {
    pub(crate) coll: Arc<Collection>,
    pub(crate) snap: &'s Snapshot,
}

impl<'s> CollectionSnapshot<'s> {
    pub fn collection(&self) -> &Arc<Collection> {
        &self.coll
    }

    pub fn snapshot(&self) -> &'s Snapshot {
        self.snap
    }
}

impl fmt::Debug for CollectionSnapshot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionSnapshot")
            .field("collection", &self.coll.name())
            .finish()
    }
}

/// Read and write operations on one collection through one transaction.
///
/// Dereferences to [`CollectionSnapshot`] for the read side.
#[derive(Deref)]
pub struct CollectionTransaction<'t> {
    #[deref]
    pub(crate) view: CollectionSnapshot<'t>,
    pub(crate) txn: &'t Transaction,
}

impl<'t> CollectionTransaction<'t> {
    pub fn transaction(&self) -> &'t Transaction {
        self.txn
    }
}

impl fmt::Debug for CollectionTransaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionTransaction")
            .field("collection", &self.view.coll.name())
            .finish()
    }
}

/// What [`Collection::in_transaction`] should do with the transaction once
/// the closure returns successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Commit,
    Abort,
}

impl Collection {
    /// Starts a snapshot on the owning database; bind it with
    /// [`with`](Self::with).
    pub fn begin_snapshot(&self) -> Result<Snapshot> {
        self.database()?.begin_snapshot()
    }

    /// Starts a write transaction on the owning database; bind it with
    /// [`with_txn`](Self::with_txn).
    pub fn begin_transaction(&self) -> Result<Transaction> {
        self.database()?.begin_transaction()
    }

    /// Binds this collection to `snap` for reading.
    pub fn with<'s>(self: &Arc<Self>, snap: &'s Snapshot) -> CollectionSnapshot<'s> {
        CollectionSnapshot {
            coll: Arc::clone(self),
            snap,
        }
    }

    /// Binds this collection to `txn` for reading and writing.
    pub fn with_txn<'t>(self: &Arc<Self>, txn: &'t Transaction) -> CollectionTransaction<'t> {
        CollectionTransaction {
            view: CollectionSnapshot {
                coll: Arc::clone(self),
                snap: &txn.snap,
            },
            txn,
        }
    }

    /// Runs `f` against a fresh snapshot of this collection and finishes
    /// the snapshot on the way out.
    pub fn in_snapshot<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&CollectionSnapshot<'_>) -> Result<R>,
    ) -> Result<R> {
        let db = self.database()?;
        let snap = db.begin_snapshot()?;
        let result = f(&self.with(&snap));
        snap.finish()?;
        result
    }

    /// Runs `f` against a fresh write transaction of this collection.
    ///
    /// There is no implicit commit: the closure decides by returning
    /// [`TxnOutcome::Commit`] or [`TxnOutcome::Abort`]; an error also
    /// aborts.
    pub fn in_transaction(
        self: &Arc<Self>,
        f: impl FnOnce(&CollectionTransaction<'_>) -> Result<TxnOutcome>,
    ) -> Result<()> {
        let db = self.database()?;
        let txn = db.begin_transaction()?;
        let outcome = f(&self.with_txn(&txn));
        match outcome {
            Ok(TxnOutcome::Commit) => txn.commit(),
            Ok(TxnOutcome::Abort) => txn.abort(),
            Err(err) => {
                let _ = txn.abort();
                Err(err)
            }
        }
    }
}
