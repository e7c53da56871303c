//! A typed, safe collection layer over the libmdbx B+tree engine.
//!
//! # Database and collections
//!
//! A [`Database`] is a memory-mapped, ACID key-value store backed by one
//! filesystem directory. It contains named [`Collection`]s: ordered
//! key→value namespaces that declare how their keys sort
//! ([`KeySort`]) and whether/how multiple values per key are kept
//! ([`ValueSort`]). The engine underneath (libmdbx, reached through the
//! `mdbx-sys` bindings) supplies the on-disk B+tree, MVCC, crash safety and
//! the cross-process writer lock; this crate supplies the typed surface,
//! the lifetime discipline that makes zero-copy reads safe, and the
//! change-hook pipeline that keeps secondary indexes consistent.
//!
//! # Snapshots and transactions
//!
//! Reads go through a [`Snapshot`], a stable point-in-time view; writes go
//! through a [`Transaction`], of which at most one exists per database at a
//! time (across processes). Binding a collection to one of them with
//! [`Collection::with`] / [`Collection::with_txn`] yields a
//! [`CollectionSnapshot`] or [`CollectionTransaction`], the scoped views
//! all CRUD and [`Cursor`] operations live on. Every [`Value`] read through
//! a view borrows from the snapshot/transaction, so the borrow checker
//! rejects use of a view or value after commit, abort or finish.
//!
//! # Collatables and indexes
//!
//! A [`Collatable`] encodes a tuple of nulls, booleans, integers and
//! strings into bytes whose byte-wise order equals the tuple order, which
//! is what lets compound index keys sort correctly under the engine's stock
//! comparator. [`open_index`] builds an [`Index`]: a derived collection
//! maintained through the source's change-hook chain, updated inside the
//! same transaction as every source write.
//!
//! ```no_run
//! use burrowdb::{Collatable, Database, KeySort, TxnOutcome, ValueSort};
//!
//! # fn main() -> burrowdb::Result<()> {
//! let db = Database::open("stuff.db")?;
//! let stuff = db.create_collection("stuff", KeySort::Lexicographic, ValueSort::Blob)?;
//!
//! stuff.in_transaction(|txn| {
//!     txn.put("foo", "I am the value of foo")?;
//!     txn.put("splat", "I am splat's value")?;
//!     Ok(TxnOutcome::Commit)
//! })?;
//!
//! let lengths = burrowdb::open_index(&stuff, "lengths", |value, emit| {
//!     emit.emit(Collatable::from(value.len() as i64));
//! })?;
//!
//! stuff.in_snapshot(|view| {
//!     assert_eq!(view.get("foo")?, "I am the value of foo");
//!     assert!(!view.get("bogus")?.exists());
//!     Ok(())
//! })?;
//! # let _ = lengths;
//! # Ok(())
//! # }
//! ```

mod collatable;
mod collection;
mod crud;
mod cursor;
mod database;
mod engine;
mod error;
mod flags;
mod index;
#[cfg(test)]
mod test_utils;
mod transaction;
mod value;

pub use self::{
    collatable::{Collatable, Item, Items},
    collection::{Change, Collection, CollectionOptions, HookOutcome, KeySort, ValueSort},
    cursor::{Cursor, Pairs},
    database::{Database, DatabaseOptions, Geometry, Info, Mode, Stat, SyncMode},
    error::{Error, Result},
    flags::{CopyFlags, DeleteMode, EnvFlags, WriteFlags},
    index::{open_index, Emitter, Index},
    transaction::{
        CollectionSnapshot, CollectionTransaction, Snapshot, Transaction, TxnOutcome,
    },
    value::{Datum, Value},
};
