// Checkpoint plus AOF-replay recovery: a checkpoint covers an AOF
// prefix; restarting restores the checkpoint image and replays only the
// uncovered tail.

mod common;

use common::{bulk, cmd, open_node};
use ferrite_db::protocol::Reply;

#[tokio::test(flavor = "multi_thread")]
async fn checkpoint_then_aof_tail_recovers_exact_state() {
    let dir = tempfile::tempdir().unwrap();
    {
        let node = open_node(dir.path(), 6410, false);
        let mut session = node.new_session();
        assert_eq!(
            cmd(&node, &mut session, &["MSET", "k1", "v1", "k2", "v2"]),
            Reply::ok()
        );
        assert_eq!(cmd(&node, &mut session, &["SAVE"]), Reply::ok());
        // Mutation after the checkpoint, then crash before the next one.
        assert_eq!(cmd(&node, &mut session, &["SET", "k1", "v1b"]), Reply::ok());
    }

    let node = open_node(dir.path(), 6410, false);
    let mut session = node.new_session();
    assert_eq!(cmd(&node, &mut session, &["GET", "k1"]), bulk("v1b"));
    assert_eq!(cmd(&node, &mut session, &["GET", "k2"]), bulk("v2"));
}

#[tokio::test(flavor = "multi_thread")]
async fn save_truncates_the_covered_aof_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let node = open_node(dir.path(), 6411, false);
    let mut session = node.new_session();
    for i in 0..50 {
        cmd(&node, &mut session, &["SET", &format!("k{i}"), "v"]);
    }
    let aof = node.aof().unwrap();
    let before = aof.begin_address();
    assert_eq!(cmd(&node, &mut session, &["SAVE"]), Reply::ok());
    assert!(aof.begin_address() > before);

    // The store remains fully readable after truncation.
    assert_eq!(cmd(&node, &mut session, &["GET", "k49"]), bulk("v"));
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_checkpoints_respect_the_version_barrier() {
    let dir = tempfile::tempdir().unwrap();
    let node = open_node(dir.path(), 6412, false);
    let mut session = node.new_session();

    for round in 0..3 {
        cmd(&node, &mut session, &["SET", "counter", &round.to_string()]);
        assert_eq!(cmd(&node, &mut session, &["SAVE"]), Reply::ok());
    }

    drop(session);
    drop(node);
    let node = open_node(dir.path(), 6412, false);
    let mut session = node.new_session();
    assert_eq!(cmd(&node, &mut session, &["GET", "counter"]), bulk("2"));
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_with_no_checkpoint_replays_the_whole_log() {
    let dir = tempfile::tempdir().unwrap();
    {
        let node = open_node(dir.path(), 6413, false);
        let mut session = node.new_session();
        for i in 0..10 {
            cmd(&node, &mut session, &["SET", &format!("n{i}"), &i.to_string()]);
        }
    }
    let node = open_node(dir.path(), 6413, false);
    let mut session = node.new_session();
    for i in 0..10 {
        assert_eq!(
            cmd(&node, &mut session, &["GET", &format!("n{i}")]),
            bulk(&i.to_string())
        );
    }
}
