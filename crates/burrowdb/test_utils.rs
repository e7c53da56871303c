use std::sync::Arc;

use tempfile::TempDir;

use crate::{Collection, Database, KeySort, ValueSort};

/// A throwaway database in a temp directory; keep the `TempDir` alive for
/// the duration of the test.
pub(crate) fn open_db() -> (TempDir, Database) {
    let dir = TempDir::new().expect("create temp dir");
    let db = Database::open(dir.path().join("db")).expect("open database");
    (dir, db)
}

pub(crate) fn blob_collection(db: &Database, name: &str) -> Arc<Collection> {
    db.create_collection(name, KeySort::Lexicographic, ValueSort::Blob)
        .expect("create collection")
}

/// Fills `coll` with `key-00 .. key-NN` and matching descriptive values.
pub(crate) fn fill_numbered(db: &Database, coll: &Arc<Collection>, count: usize) {
    let txn = db.begin_transaction().unwrap();
    {
        let view = coll.with_txn(&txn);
        for i in 0..count {
            view.put(&format!("key-{i:02}"), &format!("the value is {i}."))
                .unwrap();
        }
    }
    txn.commit().unwrap();
}
