//! Secondary indexes maintained through change hooks.
//!
//! An index is an ordinary collection with duplicate keys whose entries are
//! derived from a source collection: the *indexer* function inspects each
//! source value and emits zero or more [`Collatable`] keys; the index then
//! stores `emitted_key -> emitted_extra ++ encoded_source_key`. A change
//! hook on the source keeps the index in step with every single-entry
//! mutation, inside the same transaction, so committing or aborting the
//! source write commits or aborts the index maintenance with it.
//!
//! The bulk write paths (`put_duplicates`, `del_all`) bypass change hooks;
//! an index over a collection mutated that way is stale until
//! [`Index::rebuild`] runs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::collatable::Collatable;
use crate::collection::{Change, Collection, CollectionOptions, HookOutcome, KeySort, ValueSort};
use crate::crud::RawView;
use crate::error::{Error, Result};
use crate::transaction::{CollectionSnapshot, RecoveredTransaction, Snapshot};

/// Collects the emissions of one indexer invocation.
pub struct Emitter {
    entries: SmallVec<[(Collatable, Option<Collatable>); 4]>,
}

impl Emitter {
    /// Emits an index key for the value under inspection.
    pub fn emit(&mut self, key: Collatable) {
        self.entries.push((key, None));
    }

    /// Emits an index key together with extra payload stored ahead of the
    /// encoded source key in the index entry's value.
    pub fn emit_with(&mut self, key: Collatable, extra: Collatable) {
        self.entries.push((key, Some(extra)));
    }
}

type IndexerFn = dyn Fn(&[u8], &mut Emitter) + Send + Sync;

/// A secondary index over one source collection.
///
/// The indexer must be *repeatable*: the same source value must always
/// produce the same emissions, or index maintenance diverges beyond repair.
/// Source keys are embedded in index entries as collatable strings (or
/// collatable integers for integer-sorted sources), so string-keyed sources
/// must not use keys containing a zero byte if they are to be indexed.
pub struct Index {
    name: String,
    source: Arc<Collection>,
    coll: Arc<Collection>,
    indexer: RwLock<Option<Box<IndexerFn>>>,
    update_count: AtomicU64,
}

/// Opens (creating and building if needed) the index `name` over `source`.
///
/// The backing collection is named `index::<source>::<name>` and counts
/// toward the database's collection cap. If it already existed on disk its
/// contents are trusted; otherwise it is built from a full scan of the
/// source. The returned handle registers a change hook on the source; drop
/// the handle only after [`Index::delete_index`] or when done with the
/// database, as the hook unregisters itself lazily on the next mutation.
pub fn open_index(
    source: &Arc<Collection>,
    name: &str,
    indexer: impl Fn(&[u8], &mut Emitter) + Send + Sync + 'static,
) -> Result<Arc<Index>> {
    let db = source.database()?;
    let backing_name = format!("index::{}::{}", source.name(), name);
    let coll = db.open_collection(
        &backing_name,
        CollectionOptions::new(KeySort::Lexicographic, ValueSort::Lexicographic).create(),
    )?;

    let index = Arc::new(Index {
        name: name.to_owned(),
        source: Arc::clone(source),
        coll,
        indexer: RwLock::new(Some(Box::new(indexer))),
        update_count: AtomicU64::new(0),
    });

    if !index.coll.is_initialized() {
        index.rebuild()?;
        index.coll.mark_initialized();
    }

    let weak: Weak<Index> = Arc::downgrade(&index);
    source.add_change_hook(move |change| match weak.upgrade() {
        Some(index) => index.on_source_change(change),
        None => Ok(HookOutcome::Unregister),
    });

    Ok(index)
}

impl Index {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The collection this index derives from.
    pub fn source(&self) -> &Arc<Collection> {
        &self.source
    }

    /// The backing collection holding the index entries.
    pub fn collection(&self) -> &Arc<Collection> {
        &self.coll
    }

    /// Number of times a change hook has modified this index. Observable
    /// signal for "did that write affect the index".
    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Relaxed)
    }

    /// Queries the index like any collection: keys are the emitted
    /// collatables, values the composite `extra ++ source_key` encodings.
    pub fn with<'s>(&self, snap: &'s Snapshot) -> CollectionSnapshot<'s> {
        self.coll.with(snap)
    }

    /// Number of entries currently in the index.
    pub fn entry_count(&self) -> Result<u64> {
        self.coll.in_snapshot(|view| view.entry_count())
    }

    /// Starts a snapshot on the owning database; bind it with
    /// [`with`](Self::with).
    pub fn begin_snapshot(&self) -> Result<Snapshot> {
        self.coll.begin_snapshot()
    }

    /// Rebuilds the index from a full scan of the source, in one
    /// transaction.
    pub fn rebuild(&self) -> Result<()> {
        let db = self.coll.database()?;
        debug!(index = %self.name, source = %self.source.name(), "rebuilding index");
        let txn = db.begin_transaction()?;
        {
            let index_view = self.coll.with_txn(&txn);
            index_view.del_all()?;
            let guard = self.indexer.read();
            let indexer = guard.as_deref().ok_or(Error::UseAfterFinish)?;
            let source_view = self.source.with(&txn);
            let mut cursor = source_view.make_cursor()?;
            while cursor.next()? {
                let encoded = self.encode_source_key(cursor.key().as_slice())?;
                for (entry_key, entry_value) in
                    collect_emissions(indexer, cursor.value().as_bytes(), &encoded)
                {
                    index_view.insert(&entry_key, &entry_value)?;
                }
            }
        }
        txn.commit()
    }

    /// Unhooks the index from its source and drops its backing collection
    /// (in a fresh transaction). The handle is unusable afterwards.
    pub fn delete_index(&self) -> Result<()> {
        *self.indexer.write() = None;
        let db = self.coll.database()?;
        debug!(index = %self.name, "deleting index");
        let txn = db.begin_transaction()?;
        self.coll.with_txn(&txn).delete_collection()?;
        txn.commit()
    }

    /// Change-hook body: diffs the emissions of the old and new source
    /// value and applies the difference to the backing collection, through
    /// the transaction recovered from the raw handle.
    fn on_source_change(&self, change: &Change<'_>) -> Result<HookOutcome> {
        let guard = self.indexer.read();
        let Some(indexer) = guard.as_deref() else {
            // delete_index() ran; tell the chain to drop us.
            return Ok(HookOutcome::Unregister);
        };
        if change.old_value == change.new_value {
            return Ok(HookOutcome::Keep);
        }
        let encoded = self.encode_source_key(change.key)?;
        let mut old_entries = collect_emissions(indexer, change.old_value.as_bytes(), &encoded);
        let mut new_entries = collect_emissions(indexer, change.new_value.as_bytes(), &encoded);
        drop(guard);

        // Multiset symmetric difference; entries emitted by both sides are
        // left untouched.
        old_entries.sort_unstable();
        new_entries.sort_unstable();
        let (removed, added) = diff_sorted(old_entries, new_entries);
        if removed.is_empty() && added.is_empty() {
            return Ok(HookOutcome::Keep);
        }

        let recovered = RecoveredTransaction::from_raw(change.raw_txn())?;
        let view = RawView::new(&self.coll, recovered.raw());
        let mut modified = false;
        for (entry_key, entry_value) in &removed {
            modified |= view.del_value(entry_key, entry_value)?;
        }
        for (entry_key, entry_value) in &added {
            modified |= view.insert(entry_key, entry_value)?;
        }
        if modified {
            self.update_count.fetch_add(1, Ordering::Relaxed);
            trace!(
                index = %self.name,
                added = added.len(),
                removed = removed.len(),
                "index entries updated"
            );
        }
        Ok(HookOutcome::Keep)
    }

    /// Source keys ride inside index values as collatable items so the
    /// composite sorts (and decodes) deterministically.
    fn encode_source_key(&self, key: &[u8]) -> Result<Collatable> {
        let mut encoded = Collatable::new();
        match self.source.key_sort() {
            KeySort::Integer => match key.len() {
                4 => {
                    let raw: [u8; 4] = key.try_into().map_err(|_| Error::BadValueSize)?;
                    encoded.add_i64(i64::from(i32::from_ne_bytes(raw)));
                }
                8 => {
                    let raw: [u8; 8] = key.try_into().map_err(|_| Error::BadValueSize)?;
                    encoded.add_i64(i64::from_ne_bytes(raw));
                }
                _ => return Err(Error::BadValueSize),
            },
            _ => {
                encoded.add_bytes(key);
            }
        }
        Ok(encoded)
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.name)
            .field("source", &self.source.name())
            .field("update_count", &self.update_count())
            .field("deleted", &self.indexer.read().is_none())
            .finish()
    }
}

type Entries = Vec<(Vec<u8>, Vec<u8>)>;

fn collect_emissions(
    indexer: &IndexerFn,
    value: Option<&[u8]>,
    source_key: &Collatable,
) -> Entries {
    let Some(value) = value else {
        return Vec::new();
    };
    let mut emitter = Emitter {
        entries: SmallVec::new(),
    };
    indexer(value, &mut emitter);
    emitter
        .entries
        .into_iter()
        .map(|(key, extra)| {
            let mut composite = extra.unwrap_or_default();
            composite.concat(source_key);
            (key.as_bytes().to_vec(), composite.as_bytes().to_vec())
        })
        .collect()
}

/// Splits two sorted multisets into (only-in-left, only-in-right).
fn diff_sorted(old: Entries, new: Entries) -> (Entries, Entries) {
    let mut removed = Vec::new();
    let mut added = Vec::new();
    let mut old_iter = old.into_iter().peekable();
    let mut new_iter = new.into_iter().peekable();
    loop {
        let take_old = match (old_iter.peek(), new_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => Some(true),
            (None, Some(_)) => Some(false),
            (Some(o), Some(n)) => match o.cmp(n) {
                std::cmp::Ordering::Less => Some(true),
                std::cmp::Ordering::Greater => Some(false),
                std::cmp::Ordering::Equal => None,
            },
        };
        match take_old {
            Some(true) => removed.extend(old_iter.next()),
            Some(false) => added.extend(new_iter.next()),
            None => {
                old_iter.next();
                new_iter.next();
            }
        }
    }
    (removed, added)
}


#[cfg(test)]
mod integration_test {
    use super::*;
    use crate::test_utils::{blob_collection, open_db};
    use crate::{Database, Item, TxnOutcome};

    fn length_indexer(value: &[u8], emit: &mut Emitter) {
        emit.emit(Collatable::from(value.len() as i64));
    }

    /// Decodes the index into `(emitted_int, source_key)` pairs in index
    /// order.
    fn entries(db: &Database, index: &Index) -> Vec<(i64, String)> {
        let snap = db.begin_snapshot().unwrap();
        let view = index.with(&snap);
        view.pairs()
            .unwrap()
            .map(|pair| {
                let (key, value) = pair.unwrap();
                let key = Collatable::from_encoded(key.as_slice());
                let value = Collatable::from_encoded(value.as_slice());
                let Item::Int(emitted) = key.item(0) else {
                    panic!("index key is not an int: {key:?}");
                };
                (emitted, value.item(0).as_str().unwrap().to_owned())
            })
            .collect()
    }

    fn seeded_db() -> (tempfile::TempDir, Database, std::sync::Arc<Collection>) {
        let (dir, db) = open_db();
        let stuff = blob_collection(&db, "stuff");
        stuff
            .in_transaction(|txn| {
                txn.put("foo", "I am the value of foo")?;
                txn.put("splat", "I am splat's value")?;
                Ok(TxnOutcome::Commit)
            })
            .unwrap();
        (dir, db, stuff)
    }

    #[test]
    fn initial_build_from_existing_source() {
        let (_dir, db, stuff) = seeded_db();
        let lengths = open_index(&stuff, "lengths", length_indexer).unwrap();
        assert_eq!(
            entries(&db, &lengths),
            vec![(18, "splat".to_owned()), (21, "foo".to_owned())]
        );
        assert_eq!(lengths.entry_count().unwrap(), 2);
        // The rebuild is not hook-driven.
        assert_eq!(lengths.update_count(), 0);
    }

    #[test]
    fn writes_update_index_in_same_transaction() {
        let (_dir, db, stuff) = seeded_db();
        let lengths = open_index(&stuff, "lengths", length_indexer).unwrap();

        let txn = db.begin_transaction().unwrap();
        {
            let view = stuff.with_txn(&txn);
            assert!(view.update("foo", "bar").unwrap());
            view.put("longer", "I am the very model of a modern Major General.")
                .unwrap();
            assert!(view.del("splat").unwrap());
        }
        txn.commit().unwrap();

        assert_eq!(
            entries(&db, &lengths),
            vec![(3, "foo".to_owned()), (46, "longer".to_owned())]
        );
        assert!(lengths.update_count() > 0);
    }

    #[test]
    fn redundant_update_leaves_update_count_alone() {
        let (_dir, db, stuff) = seeded_db();
        let lengths = open_index(&stuff, "lengths", length_indexer).unwrap();

        stuff
            .in_transaction(|txn| {
                assert!(txn.update("foo", "bar")?);
                Ok(TxnOutcome::Commit)
            })
            .unwrap();
        let count = lengths.update_count();

        stuff
            .in_transaction(|txn| {
                assert!(txn.update("foo", "bar")?);
                Ok(TxnOutcome::Commit)
            })
            .unwrap();
        assert_eq!(lengths.update_count(), count);
        assert_eq!(
            entries(&db, &lengths),
            vec![(3, "foo".to_owned()), (18, "splat".to_owned())]
        );
    }

    #[test]
    fn aborted_transaction_leaves_index_untouched() {
        let (_dir, db, stuff) = seeded_db();
        let lengths = open_index(&stuff, "lengths", length_indexer).unwrap();
        let before = entries(&db, &lengths);

        let txn = db.begin_transaction().unwrap();
        {
            let view = stuff.with_txn(&txn);
            view.put("doomed", "this write never lands").unwrap();
            view.del("foo").unwrap();
        }
        txn.abort().unwrap();

        assert_eq!(entries(&db, &lengths), before);
    }

    #[test]
    fn emitted_extra_rides_ahead_of_source_key() {
        let (_dir, db, stuff) = seeded_db();
        let first_words = open_index(&stuff, "first-words", |value, emit| {
            let text = std::str::from_utf8(value).unwrap_or("");
            if let Some(word) = text.split(' ').next() {
                let mut extra = Collatable::new();
                extra.add_i64(text.len() as i64);
                emit.emit_with(Collatable::from(word), extra);
            }
        })
        .unwrap();

        let snap = db.begin_snapshot().unwrap();
        let view = first_words.with(&snap);
        let decoded: Vec<(String, i64, String)> = view
            .pairs()
            .unwrap()
            .map(|pair| {
                let (key, value) = pair.unwrap();
                let key = Collatable::from_encoded(key.as_slice());
                let value = Collatable::from_encoded(value.as_slice());
                let word = key.item(0).as_str().unwrap().to_owned();
                let Item::Int(len) = value.item(0) else {
                    panic!("missing extra payload");
                };
                (word, len, value.item(1).as_str().unwrap().to_owned())
            })
            .collect();
        assert_eq!(
            decoded,
            vec![
                ("I".to_owned(), 18, "splat".to_owned()),
                ("I".to_owned(), 21, "foo".to_owned()),
            ]
        );
    }

    #[test]
    fn rebuild_recovers_from_hookless_writes() {
        let (_dir, db, stuff) = seeded_db();
        let lengths = open_index(&stuff, "lengths", length_indexer).unwrap();

        // del_all is a bulk path: hooks do not fire, the index goes stale.
        stuff
            .in_transaction(|txn| {
                txn.del_all()?;
                txn.put("solo", "only one left")?;
                Ok(TxnOutcome::Commit)
            })
            .unwrap();

        lengths.rebuild().unwrap();
        assert_eq!(entries(&db, &lengths), vec![(13, "solo".to_owned())]);
    }

    #[test]
    fn delete_index_breaks_hook_and_drops_collection() {
        let (_dir, db, stuff) = seeded_db();
        let lengths = open_index(&stuff, "lengths", length_indexer).unwrap();
        let backing = lengths.collection().name().to_owned();
        assert!(db.get_collection(&backing).is_some());

        lengths.delete_index().unwrap();
        assert!(db.get_collection(&backing).is_none());

        // Source writes keep working; the dangling hook unregisters itself.
        stuff
            .in_transaction(|txn| {
                txn.put("after", "index is gone")?;
                Ok(TxnOutcome::Commit)
            })
            .unwrap();
        stuff
            .in_transaction(|txn| {
                txn.put("again", "still fine")?;
                Ok(TxnOutcome::Commit)
            })
            .unwrap();
    }

    #[test]
    fn reopening_initialized_index_skips_rebuild() {
        let (dir, db, stuff) = seeded_db();
        {
            let lengths = open_index(&stuff, "lengths", length_indexer).unwrap();
            assert_eq!(lengths.entry_count().unwrap(), 2);
        }
        db.close().unwrap();
        drop(stuff);
        drop(db);

        let db = Database::open(dir.path().join("db")).unwrap();
        let stuff = blob_collection(&db, "stuff");
        let lengths = open_index(&stuff, "lengths", length_indexer).unwrap();
        assert_eq!(
            entries(&db, &lengths),
            vec![(18, "splat".to_owned()), (21, "foo".to_owned())]
        );
    }
}
