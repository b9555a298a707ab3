// Single-node durability and recovery: mutations survive a restart via
// AOF replay, log addresses stay monotone, and replay is idempotent.

mod common;

use common::{bulk, cmd, open_node};
use ferrite_db::protocol::Reply;
use ferrite_db::replication::apply_entry;
use ferrite_db::storage::FIRST_VALID_ADDRESS;

#[tokio::test(flavor = "multi_thread")]
async fn set_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let node = open_node(dir.path(), 6400, false);
        let mut session = node.new_session();
        assert_eq!(cmd(&node, &mut session, &["SET", "foo", "bar"]), Reply::ok());
    }

    let node = open_node(dir.path(), 6400, false);
    let mut session = node.new_session();
    let reply = cmd(&node, &mut session, &["GET", "foo"]);
    assert_eq!(reply, bulk("bar"));
    assert_eq!(reply.to_resp2_bytes(), b"$3\r\nbar\r\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn deletes_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let node = open_node(dir.path(), 6401, false);
        let mut session = node.new_session();
        cmd(&node, &mut session, &["SET", "keep", "1"]);
        cmd(&node, &mut session, &["SET", "drop", "2"]);
        assert_eq!(
            cmd(&node, &mut session, &["DEL", "drop"]),
            Reply::Integer(1)
        );
    }

    let node = open_node(dir.path(), 6401, false);
    let mut session = node.new_session();
    assert_eq!(cmd(&node, &mut session, &["GET", "keep"]), bulk("1"));
    assert_eq!(cmd(&node, &mut session, &["GET", "drop"]), Reply::Nil);
}

#[tokio::test(flavor = "multi_thread")]
async fn aof_addresses_are_monotone_across_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let node = open_node(dir.path(), 6402, false);
    let mut session = node.new_session();
    let aof = node.aof().unwrap();

    let mut last = 0;
    for i in 0..50 {
        cmd(&node, &mut session, &["SET", &format!("k{i}"), "v"]);
        let tail = aof.tail();
        assert!(tail > last);
        last = tail;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn aof_replay_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let node = open_node(dir.path(), 6403, false);
    let mut session = node.new_session();
    for i in 0..20 {
        cmd(&node, &mut session, &["SET", &format!("k{i}"), &format!("v{i}")]);
    }
    cmd(&node, &mut session, &["DEL", "k3"]);

    let aof = node.aof().unwrap();
    let entries: Vec<_> = aof
        .iterate(FIRST_VALID_ADDRESS, aof.tail())
        .map(|e| e.unwrap())
        .collect();

    // A fresh node replaying the log once, then a second time, lands in
    // the same state.
    let replay_dir = tempfile::tempdir().unwrap();
    let replayed = open_node(replay_dir.path(), 6404, false);
    for _pass in 0..2 {
        for entry in &entries {
            apply_entry(replayed.main_store(), replayed.object_store(), entry).unwrap();
        }
    }

    let mut check = replayed.new_session();
    assert_eq!(cmd(&replayed, &mut check, &["GET", "k5"]), bulk("v5"));
    assert_eq!(cmd(&replayed, &mut check, &["GET", "k3"]), Reply::Nil);
    assert_eq!(cmd(&replayed, &mut check, &["GET", "k19"]), bulk("v19"));
}

#[tokio::test(flavor = "multi_thread")]
async fn values_evicted_to_disk_remain_readable() {
    let dir = tempfile::tempdir().unwrap();
    let node = open_node(dir.path(), 6405, false);
    let mut session = node.new_session();

    cmd(&node, &mut session, &["SET", "first", "alpha"]);
    // Push enough data to run the first page out of the memory ring.
    let filler = "x".repeat(512);
    for i in 0..200 {
        cmd(&node, &mut session, &["SET", &format!("fill{i}"), &filler]);
    }
    assert_eq!(cmd(&node, &mut session, &["GET", "first"]), bulk("alpha"));
}
