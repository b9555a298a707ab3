// Three-node slot ownership, MOVED/ASK redirection during migration, and
// post-migration convergence.

mod common;

use common::{bulk, cmd, gossip, open_node};
use ferrite_db::cluster::MigrateOptions;
use ferrite_db::common::SLOT_COUNT;
use ferrite_db::protocol::Reply;
use ferrite_db::FerriteNode;
use std::sync::Arc;

fn three_nodes(
    dirs: &[tempfile::TempDir; 3],
) -> (Arc<FerriteNode>, Arc<FerriteNode>, Arc<FerriteNode>) {
    let a = open_node(dirs[0].path(), 7000, true);
    let b = open_node(dirs[1].path(), 7001, true);
    let c = open_node(dirs[2].path(), 7002, true);
    for (node, peers) in [(&a, [&b, &c]), (&b, [&a, &c]), (&c, [&a, &b])] {
        for peer in peers {
            node.link_peer(peer);
        }
    }

    let ranges: [(u16, u16); 3] = [(0, 5460), (5461, 10922), (10923, 16383)];
    for (node, (start, end)) in [&a, &b, &c].iter().zip(ranges) {
        let slots: Vec<u16> = (start..=end).collect();
        node.topology().unwrap().add_slots(&slots).unwrap();
    }
    gossip(&[&a, &b, &c]);
    (a, b, c)
}

#[tokio::test(flavor = "multi_thread")]
async fn hash_slot_of_abc_tag_is_7638() {
    let dirs = [
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    ];
    let (a, _b, _c) = three_nodes(&dirs);
    let mut session = a.new_session();
    assert_eq!(
        cmd(&a, &mut session, &["CLUSTER", "KEYSLOT", "{abc}0"]),
        Reply::Integer(7638)
    );
    assert_eq!(
        cmd(&a, &mut session, &["CLUSTER", "KEYSLOT", "{abc}1"]),
        Reply::Integer(7638)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn slot_migration_moves_ownership_and_data() {
    let dirs = [
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    ];
    let (a, b, c) = three_nodes(&dirs);
    let mut sa = a.new_session();
    let mut sb = b.new_session();
    let mut sc = c.new_session();

    // Slot 7638 lives on B.
    assert_eq!(cmd(&b, &mut sb, &["SET", "{abc}0", "hello"]), Reply::ok());
    assert_eq!(
        cmd(&a, &mut sa, &["GET", "{abc}0"]),
        Reply::Error("MOVED 7638 127.0.0.1:7001".to_string())
    );

    // Stage the migration markers, as SETSLOT does.
    let b_id = b.node_id().to_string();
    let c_id = c.node_id().to_string();
    assert_eq!(
        cmd(&b, &mut sb, &["CLUSTER", "SETSLOT", "7638", "MIGRATING", &c_id]),
        Reply::ok()
    );
    assert_eq!(
        cmd(&c, &mut sc, &["CLUSTER", "SETSLOT", "7638", "IMPORTING", &b_id]),
        Reply::ok()
    );

    // MIGRATING/IMPORTING redirection (existing key on B, absent key
    // everywhere).
    assert_eq!(cmd(&b, &mut sb, &["GET", "{abc}0"]), bulk("hello"));
    assert_eq!(
        cmd(&b, &mut sb, &["GET", "{abc}1"]),
        Reply::Error("ASK 7638 127.0.0.1:7002".to_string())
    );
    assert_eq!(
        cmd(&c, &mut sc, &["GET", "{abc}1"]),
        Reply::Error("MOVED 7638 127.0.0.1:7001".to_string())
    );
    assert_eq!(cmd(&c, &mut sc, &["ASKING"]), Reply::ok());
    let reply = cmd(&c, &mut sc, &["GET", "{abc}1"]);
    assert_eq!(reply, Reply::Nil);
    assert_eq!(reply.to_resp2_bytes(), b"$-1\r\n");

    // Complete the migration and converge.
    b.migrate_slots_to(&c, &[7638], &MigrateOptions::default())
        .unwrap();
    gossip(&[&a, &b, &c]);

    assert_eq!(cmd(&c, &mut sc, &["GET", "{abc}0"]), bulk("hello"));
    assert_eq!(
        cmd(&b, &mut sb, &["GET", "{abc}0"]),
        Reply::Error("MOVED 7638 127.0.0.1:7002".to_string())
    );
    assert_eq!(
        cmd(&a, &mut sa, &["GET", "{abc}0"]),
        Reply::Error("MOVED 7638 127.0.0.1:7002".to_string())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn every_slot_has_exactly_one_owner_after_convergence() {
    let dirs = [
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    ];
    let (a, b, c) = three_nodes(&dirs);
    b.migrate_slots_to(&c, &[6000, 6001], &MigrateOptions::default())
        .unwrap();
    gossip(&[&a, &b, &c]);

    for slot in 0..SLOT_COUNT {
        let owners: Vec<Option<String>> = [&a, &b, &c]
            .iter()
            .map(|node| node.topology().unwrap().owner_of(slot))
            .collect();
        assert!(owners[0].is_some(), "slot {slot} unassigned");
        assert_eq!(owners[0], owners[1], "slot {slot} owner disagreement");
        assert_eq!(owners[1], owners[2], "slot {slot} owner disagreement");
    }
    assert_eq!(
        a.topology().unwrap().owner_of(6000),
        Some(c.node_id().to_string())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn cross_slot_requests_are_rejected() {
    let dirs = [
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    ];
    let (a, _b, _c) = three_nodes(&dirs);
    let mut session = a.new_session();
    assert_eq!(
        cmd(&a, &mut session, &["MSET", "{x}1", "v", "{y}2", "v"]),
        Reply::Error("CROSSSLOT Keys in request don't hash to the same slot".to_string())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn countkeysinslot_tracks_the_secondary_index() {
    let dirs = [
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    ];
    let (_a, b, _c) = three_nodes(&dirs);
    let mut sb = b.new_session();
    cmd(&b, &mut sb, &["SET", "{abc}0", "1"]);
    cmd(&b, &mut sb, &["SET", "{abc}1", "2"]);
    assert_eq!(
        cmd(&b, &mut sb, &["CLUSTER", "COUNTKEYSINSLOT", "7638"]),
        Reply::Integer(2)
    );
    let keys = cmd(&b, &mut sb, &["CLUSTER", "GETKEYSINSLOT", "7638", "10"]);
    match keys {
        Reply::Array(items) => assert_eq!(items.len(), 2),
        other => panic!("unexpected reply {other:?}"),
    }
}
