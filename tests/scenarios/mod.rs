//! End-to-end scenarios on a single-node cluster, via the in-process API.

use super::testcluster::{opts, TestCluster};

use agency::agency::{Operation, Outcome, Precondition, Transaction, Value};
use agency::error::{Error, Result};

use pretty_assertions::assert_eq;
use std::time::Duration;

#[test]
/// A plain set is visible to subsequent reads.
fn set_read() -> Result<()> {
    let c = TestCluster::single(opts())?;
    let agency = c.agency(1);

    agency.write(vec![Transaction::new().set("/a/b", 5)], true)?;
    assert_eq!(agency.read(vec!["/a/b".into()])?, vec![Some(Value::Integer(5))]);
    assert_eq!(agency.read(vec!["/a".into()])?, vec![Some(Value::from_json(r#"{"b": 5}"#)?)]);
    Ok(())
}

#[test]
/// Retrying a tagged write doesn't apply it twice.
fn idempotent_retry() -> Result<()> {
    let c = TestCluster::single(opts())?;
    let agency = c.agency(1);

    let increment = |seq| Transaction::new().client("client", seq).increment("/c", 1);
    let mut outcomes = Vec::new();
    for seq in 1..=3 {
        outcomes.extend(agency.write(vec![increment(seq)], true)?.results);
    }
    assert_eq!(agency.read(vec!["/c".into()])?, vec![Some(Value::Integer(3))]);

    // The retry returns the original outcome, and consumes a log index of its
    // own without changing the tree.
    let retry = agency.write(vec![increment(2)], true)?;
    assert_eq!(retry.results, vec![outcomes[1].clone()]);
    assert_eq!(agency.read(vec!["/c".into()])?, vec![Some(Value::Integer(3))]);

    let log = agency.status()?.log;
    assert_eq!(log.len(), 5);
    assert_eq!(log.iter().filter(|e| e.client_id.as_deref() == Some("client")).count(), 4);
    Ok(())
}

#[test]
/// Retrying a tagged batch returns the original outcomes, and applies none of
/// it twice.
fn batch_retry() -> Result<()> {
    let c = TestCluster::single(opts())?;
    let agency = c.agency(1);

    let batch: Vec<_> =
        (1..=3).map(|seq| Transaction::new().client("client", seq).increment("/c", 1)).collect();
    let first = agency.write(batch.clone(), true)?;
    assert_eq!(first.results.iter().filter_map(Outcome::index).collect::<Vec<_>>(), vec![2, 3, 4]);
    let retry = agency.write(batch, true)?;
    assert_eq!(retry.results, first.results);
    assert_eq!(agency.read(vec!["/c".into()])?, vec![Some(Value::Integer(3))]);
    Ok(())
}

#[test]
/// Erasing from or replacing in a missing array leaves the tree empty.
fn erase_missing() -> Result<()> {
    let c = TestCluster::single(opts())?;
    let agency = c.agency(1);

    let erase = Transaction::new().operation("/a", Operation::Erase(Value::Integer(1)));
    let replace = Transaction::new()
        .operation("/a", Operation::Replace(Value::Integer(1), Value::Integer(2)));
    agency.write(vec![erase, replace], true)?;
    assert_eq!(agency.dump()?, Value::from_json("{}")?);

    let guarded = Transaction::new().set("/a", "a").missing("/a");
    let result = agency.write(vec![guarded.clone(), guarded], true)?;
    assert!(matches!(
        result.results[..],
        [Outcome::Applied { .. }, Outcome::Rejected { .. }]
    ));
    Ok(())
}

#[test]
/// A set guarded by a missing precondition succeeds once. An identical
/// untagged retry is rejected, leaving the value in place.
fn precondition_retry() -> Result<()> {
    let c = TestCluster::single(opts())?;
    let agency = c.agency(1);

    let txn = Transaction::new().missing("/x").set("/x", 1);
    let first = agency.write(vec![txn.clone()], true)?.results;
    assert!(matches!(first[..], [Outcome::Applied { .. }]));
    let second = agency.write(vec![txn], true)?.results;
    assert!(matches!(&second[..], [Outcome::Rejected { path, .. }] if path.to_string() == "/x"));
    assert_eq!(
        second[0].clone().into_result(),
        Err(Error::PreconditionFailed("/x".into()))
    );
    assert_eq!(agency.read(vec!["/x".into()])?, vec![Some(Value::Integer(1))]);
    Ok(())
}

#[test]
/// A transaction with a failing precondition applies none of its operations,
/// even when other preconditions hold.
fn precondition_atomicity() -> Result<()> {
    let c = TestCluster::single(opts())?;
    let agency = c.agency(1);

    agency.write(vec![Transaction::new().set("/list", vec![1, 2]).set("/n", 1)], true)?;
    let txn = Transaction::new()
        .equals("/n", 1)
        .precondition("/list", Precondition::Contains(Value::Integer(3)))
        .set("/n", 2)
        .push("/list", 3)
        .delete("/list");
    let result = agency.write(vec![txn], true)?;
    assert!(matches!(&result.results[..], [Outcome::Rejected { path, .. }] if path.to_string() == "/list"));

    let before = Value::from_json(r#"{"list": [1, 2], "n": 1}"#)?;
    assert_eq!(agency.dump()?, before);

    let txn = Transaction::new()
        .precondition("/list", Precondition::NotContains(Value::Integer(3)))
        .operation("/list", Operation::Replace(Value::Integer(1), Value::Integer(7)))
        .operation("/list", Operation::Prepend(Value::Integer(0)))
        .increment("/n", 2);
    agency.write(vec![txn], true)?;
    assert_eq!(agency.dump()?, Value::from_json(r#"{"list": [0, 7, 2], "n": 3}"#)?);
    Ok(())
}

#[test]
/// With compaction disabled the log retains every entry. Once enabled, the log
/// is truncated without affecting reads.
fn compaction_transparency() -> Result<()> {
    const WRITES: usize = 50_000;
    const BATCH: usize = 1000;

    let mut o = opts();
    o.compaction_keep = 100;
    let c = TestCluster::single(o)?;
    let agency = c.agency(1);

    let mut index = 0;
    for batch in 0..WRITES / BATCH {
        let txns = (0..BATCH)
            .map(|i| {
                let n = (batch * BATCH + i) as i64;
                Transaction::new().set(format!("/keys/{}", n % 100), n).increment("/count", 1)
            })
            .collect();
        index = agency.write(txns, false)?.index;
    }
    // The leader's noop is at index 1.
    assert_eq!(index, WRITES as u64 + 1);

    let paths = vec!["/count".into(), "/keys/0".into(), "/keys/99".into()];
    let expect = vec![
        Some(Value::Integer(WRITES as i64)),
        Some(Value::Integer(WRITES as i64 - 100)),
        Some(Value::Integer(WRITES as i64 - 1)),
    ];
    assert_eq!(agency.read(paths.clone())?, expect);

    let status = agency.status()?;
    assert_eq!(status.log.len(), WRITES + 1);
    assert_eq!(status.log[0].index, 1);
    assert_eq!(status.raft.first_index, 1);

    // Enabling compaction takes a snapshot right away.
    assert!(agency.set_compaction(true)?.enabled);
    let mut first_index = 1;
    for _ in 0..100 {
        first_index = agency.head(1)?.first_index;
        if first_index > 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    assert_eq!(first_index, index - 100 + 1);
    assert_eq!(agency.status()?.log.len(), 100);
    assert_eq!(agency.read(paths)?, expect);
    Ok(())
}
