//! Tests a three-node cluster over TCP.

use super::testcluster::{opts, TestCluster};

use agency::agency::{Outcome, Transaction, Value};
use agency::error::{Error, Result};
use agency::raft::RoleKind;

use pretty_assertions::assert_eq;

#[test]
/// Writes submitted to any node are replicated, and all nodes agree on the
/// log and the tree.
fn agreement() -> Result<()> {
    let c = TestCluster::run(3, opts())?;
    let leader = c.leader()?;

    let mut index = 0;
    for id in 1..=3 {
        let txn = Transaction::new().set(format!("/nodes/{id}"), id as i64).increment("/count", 1);
        let result = c.agency(id).write(vec![txn], true)?;
        assert!(matches!(result.results[..], [Outcome::Applied { .. }]));
        assert!(result.index > index);
        index = result.index;
    }
    c.wait_applied(index)?;

    let expect = Value::from_json(r#"{"count": 3, "nodes": {"1": 1, "2": 2, "3": 3}}"#)?;
    for id in 1..=3 {
        // Reads are forwarded to the leader, and see all acknowledged writes.
        assert_eq!(c.agency(id).read(vec!["/count".into()])?, vec![Some(Value::Integer(3))]);
        assert_eq!(c.agency(id).dump()?, expect);
    }

    let logs = (1..=3).map(|id| Ok(c.agency(id).status()?.log)).collect::<Result<Vec<_>>>()?;
    assert_eq!(logs[0], logs[1]);
    assert_eq!(logs[0], logs[2]);
    assert_eq!(logs[0].last().map(|e| e.index), Some(index));

    let status = c.agency(leader).status()?.raft;
    assert_eq!(status.role, RoleKind::Leader);
    assert_eq!(status.progress.values().min(), Some(&index));
    Ok(())
}

#[test]
/// The TCP client exposes the full Agency API.
fn client() -> Result<()> {
    let c = TestCluster::run(3, opts())?;
    let leader = c.leader()?;
    let follower = (1..=3).find(|id| *id != leader).unwrap_or(1);
    let mut client = c.connect(follower)?;

    let result = client.write(
        vec![
            Transaction::new().client("cli", 1).set("/a/b", 5),
            Transaction::new().client("cli", 2).missing("/a/b").set("/a/b", 6),
        ],
        true,
    )?;
    let [Outcome::Applied { index: first }, Outcome::Rejected { index: last, ref path }] =
        result.results[..]
    else {
        panic!("unexpected outcomes {:?}", result.results);
    };
    assert_eq!(path.to_string(), "/a/b");
    assert_eq!(last, first + 1);
    assert_eq!(result.index, last);
    assert_eq!(
        result.results[1].clone().into_result(),
        Err(Error::PreconditionFailed("/a/b".into()))
    );

    assert_eq!(client.read(vec!["/a/b".into(), "/x".into()])?, vec![Some(Value::Integer(5)), None]);

    // Sessions record the outcomes.
    let sessions = client.inquire(vec!["cli".into(), "other".into()])?;
    assert_eq!(sessions[0].as_ref().map(|s| s.seq), Some(2));
    assert_eq!(sessions[1], None);

    // Unsynced writes are accepted once appended, and show up in the session.
    let result = client.write(vec![Transaction::new().client("cli", 3).set("/c", 1)], false)?;
    let [Outcome::Accepted { index }] = result.results[..] else {
        panic!("unexpected outcomes {:?}", result.results);
    };
    c.wait_applied(index)?;
    let session = client.inquire(vec!["cli".into()])?.remove(0);
    assert_eq!(session.and_then(|s| s.outcome(3).cloned()), Some(Outcome::Applied { index }));

    // Log access, on the follower.
    c.wait_applied(index)?;
    let head = client.head(2)?;
    assert_eq!(head.first_index, 1);
    assert_eq!(head.entries.len(), 2);
    assert_eq!(head.entries[0].transaction, None);
    let tail = client.tail(1)?;
    assert_eq!(tail.entries.iter().map(|e| e.index).collect::<Vec<_>>(), vec![index]);
    let slice = client.slice(first, last + 1)?;
    assert_eq!(slice.entries.iter().map(|e| e.index).collect::<Vec<_>>(), vec![first, last]);
    assert_eq!(slice.entries[0].client_id.as_deref(), Some("cli"));
    let at = client.at(first)?;
    assert_eq!(at.entries, slice.entries[..1]);

    // Polls return committed entries, or nothing on timeout.
    let poll = client.poll(index, 10)?;
    assert_eq!(poll.entries.len(), 1);
    assert_eq!(client.poll(index + 1, 10)?.entries, Vec::new());

    // Release hints and compaction are node-local.
    client.release("observer", first)?;
    assert!(client.set_compaction(true)?.enabled);
    let status = client.status()?;
    assert_eq!(status.raft.id, follower);
    assert_eq!(status.raft.leader, Some(leader));
    assert_eq!(status.log.last().map(|e| e.index), Some(index));
    Ok(())
}

#[test]
/// Compaction on a node truncates its log up to the release hints, without
/// affecting the tree or other nodes.
fn compaction() -> Result<()> {
    let mut o = opts();
    o.compaction_keep = 0;
    let c = TestCluster::run(3, o)?;
    let leader = c.leader()?;
    let agency = c.agency(leader);

    let txns = (0..20).map(|i| Transaction::new().set(format!("/k/{i}"), i as i64)).collect();
    let index = agency.write(txns, true)?.index;
    c.wait_applied(index)?;

    agency.release("observer", 10)?;
    assert_eq!(agency.compact()?, index);

    // Truncation stops at the release hint, until the observer moves on.
    let wait = |first_index| -> Result<()> {
        for _ in 0..50 {
            if agency.status()?.raft.first_index == first_index {
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        Err(Error::Timeout)
    };
    wait(11)?;
    agency.release("observer", index)?;
    wait(index + 1)?;

    let head = agency.head(10)?;
    assert_eq!((head.first_index, head.entries.len()), (index + 1, 0));
    assert_eq!(agency.read(vec!["/k/19".into()])?, vec![Some(Value::Integer(19))]);
    for id in (1..=3).filter(|id| *id != leader) {
        assert_eq!(c.agency(id).status()?.raft.first_index, 1);
    }
    Ok(())
}
