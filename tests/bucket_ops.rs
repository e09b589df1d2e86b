//! # Bucket Operation Tests
//!
//! Bucket CRUD, nesting, sequences, and the argument-validation contract.

use burrowdb::{Database, Error};
use tempfile::TempDir;

fn create_test_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("test.db")).unwrap();
    (dir, db)
}

fn kind(err: &eyre::Report) -> Option<&Error> {
    err.downcast_ref::<Error>()
}

#[test]
fn create_put_commit_read_roundtrip() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        let widgets = tx.create_bucket(b"widgets")?;
        widgets.put(b"a", b"1")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        assert_eq!(tx.bucket(b"widgets")?.get(b"a")?, Some(b"1".to_vec()));
        // two metas + freelist + at least a root leaf and the new pages
        assert!(tx.size() / db.page_size() as u64 >= 5);
        Ok(())
    })
    .unwrap();
}

#[test]
fn get_missing_key_returns_none() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        assert_eq!(b.get(b"nope")?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn get_on_sub_bucket_name_returns_none() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        b.create_bucket(b"inner")?;
        assert_eq!(b.get(b"inner")?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn writer_sees_its_own_uncommitted_state() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        b.put(b"k", b"v1")?;
        assert_eq!(b.get(b"k")?, Some(b"v1".to_vec()));
        b.put(b"k", b"v2")?;
        assert_eq!(b.get(b"k")?, Some(b"v2".to_vec()));
        b.delete(b"k")?;
        assert_eq!(b.get(b"k")?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn put_validates_arguments() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;

        let err = b.put(b"", b"v").unwrap_err();
        assert_eq!(kind(&err), Some(&Error::KeyRequired));

        let err = b.put(&vec![0u8; burrowdb::MAX_KEY_SIZE + 1], b"v").unwrap_err();
        assert_eq!(kind(&err), Some(&Error::KeyTooLarge));

        b.put(&vec![7u8; burrowdb::MAX_KEY_SIZE], b"v")?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn put_on_read_transaction_fails() {
    let (_dir, db) = create_test_db();
    db.update(|tx| {
        tx.create_bucket(b"b").map(|_| ())
    })
    .unwrap();

    db.view(|tx| {
        let b = tx.bucket(b"b")?;
        let err = b.put(b"k", b"v").unwrap_err();
        assert_eq!(kind(&err), Some(&Error::TxReadOnly));
        let err = b.delete(b"k").unwrap_err();
        assert_eq!(kind(&err), Some(&Error::TxReadOnly));
        let err = tx.create_bucket(b"other").unwrap_err();
        assert_eq!(kind(&err), Some(&Error::TxReadOnly));
        Ok(())
    })
    .unwrap();
}

#[test]
fn try_put_respects_existing_keys() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        assert!(b.try_put(b"k", b"first")?);
        assert!(!b.try_put(b"k", b"second")?);
        assert_eq!(b.get(b"k")?, Some(b"first".to_vec()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn delete_missing_key_is_a_noop() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        b.delete(b"never-there")?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn delete_refuses_sub_bucket_entries() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        b.create_bucket(b"inner")?;
        let err = b.delete(b"inner").unwrap_err();
        assert_eq!(kind(&err), Some(&Error::IncompatibleValue));
        Ok(())
    })
    .unwrap();
}

#[test]
fn put_refuses_bucket_names() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        b.create_bucket(b"inner")?;
        let err = b.put(b"inner", b"v").unwrap_err();
        assert_eq!(kind(&err), Some(&Error::IncompatibleValue));
        Ok(())
    })
    .unwrap();
}

#[test]
fn create_bucket_error_kinds() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        tx.create_bucket(b"b")?;
        let err = tx.create_bucket(b"b").unwrap_err();
        assert_eq!(kind(&err), Some(&Error::BucketExists));

        let err = tx.create_bucket(b"").unwrap_err();
        assert_eq!(kind(&err), Some(&Error::BucketNameRequired));

        let b = tx.bucket(b"b")?;
        b.put(b"plain", b"v")?;
        let err = b.create_bucket(b"plain").unwrap_err();
        assert_eq!(kind(&err), Some(&Error::IncompatibleValue));

        let err = tx.bucket(b"missing").unwrap_err();
        assert_eq!(kind(&err), Some(&Error::BucketNotFound));
        Ok(())
    })
    .unwrap();
}

#[test]
fn create_bucket_if_not_exists_is_idempotent() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        tx.create_bucket_if_not_exists(b"b")?.put(b"k", b"v")?;
        let again = tx.create_bucket_if_not_exists(b"b")?;
        assert_eq!(again.get(b"k")?, Some(b"v".to_vec()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn nested_buckets_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let db = Database::open(&path).unwrap();
        db.update(|tx| {
            tx.create_bucket(b"a")?
                .create_bucket(b"b")?
                .put(b"k", b"v")
        })
        .unwrap();
    }

    let db = Database::open(&path).unwrap();
    db.view(|tx| {
        let v = tx.bucket(b"a")?.bucket(b"b")?.get(b"k")?;
        assert_eq!(v, Some(b"v".to_vec()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn delete_bucket_removes_recursively() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        let a = tx.create_bucket(b"a")?;
        a.put(b"k", b"v")?;
        let inner = a.create_bucket(b"inner")?;
        inner.put(b"deep", b"d")?;
        inner.create_bucket(b"deeper")?.put(b"deepest", b"x")?;
        Ok(())
    })
    .unwrap();

    db.update(|tx| tx.delete_bucket(b"a")).unwrap();

    db.view(|tx| {
        let err = tx.bucket(b"a").unwrap_err();
        assert_eq!(kind(&err), Some(&Error::BucketNotFound));
        Ok(())
    })
    .unwrap();
}

#[test]
fn delete_bucket_error_kinds() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        b.put(b"plain", b"v")?;

        let err = tx.delete_bucket(b"missing").unwrap_err();
        assert_eq!(kind(&err), Some(&Error::BucketNotFound));

        let err = b.delete_bucket(b"plain").unwrap_err();
        assert_eq!(kind(&err), Some(&Error::IncompatibleValue));
        Ok(())
    })
    .unwrap();
}

#[test]
fn bucket_can_be_recreated_after_delete_in_same_tx() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        tx.create_bucket(b"b")?.put(b"old", b"1")?;
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        tx.delete_bucket(b"b")?;
        tx.create_bucket(b"b")?.put(b"new", b"2")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let b = tx.bucket(b"b")?;
        assert_eq!(b.get(b"old")?, None);
        assert_eq!(b.get(b"new")?, Some(b"2".to_vec()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn sequences_increment_and_persist() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let db = Database::open(&path).unwrap();
        db.update(|tx| {
            let b = tx.create_bucket(b"b")?;
            assert_eq!(b.sequence(), 0);
            assert_eq!(b.next_sequence()?, 1);
            assert_eq!(b.next_sequence()?, 2);
            Ok(())
        })
        .unwrap();
    }

    let db = Database::open(&path).unwrap();
    db.update(|tx| {
        let b = tx.bucket(b"b")?;
        assert_eq!(b.sequence(), 2);
        assert_eq!(b.next_sequence()?, 3);
        b.set_sequence(100)?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        assert_eq!(tx.bucket(b"b")?.sequence(), 100);
        Ok(())
    })
    .unwrap();
}

#[test]
fn delete_all_keys_leaves_a_usable_empty_bucket() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        for i in 0..50 {
            b.put(format!("k{:03}", i).as_bytes(), b"v")?;
        }
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        let b = tx.bucket(b"b")?;
        for i in 0..50 {
            b.delete(format!("k{:03}", i).as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        let b = tx.bucket(b"b")?;
        let mut cursor = b.cursor();
        assert_eq!(cursor.first()?, None);
        // still writable after emptying
        b.put(b"again", b"v")?;
        assert_eq!(b.get(b"again")?, Some(b"v".to_vec()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn for_each_visits_pairs_in_order() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        b.put(b"c", b"3")?;
        b.put(b"a", b"1")?;
        b.put(b"b", b"2")?;
        b.create_bucket(b"sub")?;

        let mut seen = Vec::new();
        b.for_each(|k, v| {
            seen.push((k.to_vec(), v.to_vec()));
            Ok(())
        })?;
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );

        let mut names = Vec::new();
        b.for_each_bucket(|name| {
            names.push(name.to_vec());
            Ok(())
        })?;
        assert_eq!(names, vec![b"sub".to_vec()]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn empty_values_are_stored() {
    let (_dir, db) = create_test_db();

    db.update(|tx| {
        let b = tx.create_bucket(b"b")?;
        b.put(b"k", b"")?;
        assert_eq!(b.get(b"k")?, Some(Vec::new()));
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        assert_eq!(tx.bucket(b"b")?.get(b"k")?, Some(Vec::new()));
        Ok(())
    })
    .unwrap();
}
