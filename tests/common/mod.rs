// Shared harness for the integration suites: small store geometry over
// tempdirs, plus argv/reply helpers.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ferrite_db::protocol::Reply;
use ferrite_db::{FerriteNode, ServerOptions, Session};

pub fn test_options(dir: &Path, port: u16, cluster: bool) -> ServerOptions {
    ServerOptions {
        port,
        bind: "127.0.0.1".to_string(),
        checkpoint_dir: dir.join("checkpoints"),
        log_dir: dir.join("log"),
        enable_aof: true,
        commit_frequency_ms: 0,
        aof_memory_size: 1 << 20,
        memory_size: 4096 * 16,
        page_size: 4096,
        segment_size: 1 << 20,
        index_size: 1 << 10,
        cluster,
        ..ServerOptions::default()
    }
}

pub fn open_node(dir: &Path, port: u16, cluster: bool) -> Arc<FerriteNode> {
    FerriteNode::open(test_options(dir, port, cluster), true).unwrap()
}

pub fn argv(parts: &[&str]) -> Vec<Vec<u8>> {
    parts.iter().map(|p| p.as_bytes().to_vec()).collect()
}

pub fn cmd(node: &FerriteNode, session: &mut Session, parts: &[&str]) -> Reply {
    node.execute(session, &argv(parts))
}

pub fn bulk(text: &str) -> Reply {
    Reply::Bulk(text.as_bytes().to_vec())
}

/// Exchange slot claims and node tables between every pair, the way the
/// gossip bus converges ownership.
pub fn gossip(nodes: &[&Arc<FerriteNode>]) {
    for _round in 0..2 {
        for source in nodes {
            let source_topology = source.topology().unwrap();
            let infos: Vec<_> = source_topology.known_nodes();
            let claims = source_topology.slot_claims();
            for destination in nodes {
                if Arc::ptr_eq(source, destination) {
                    continue;
                }
                let destination_topology = destination.topology().unwrap();
                for info in &infos {
                    destination_topology.merge_node(info.clone());
                }
                for (slot, owner, epoch) in &claims {
                    destination_topology.merge_slot_claim(*slot, owner, *epoch);
                }
            }
        }
    }
}

/// Poll until `check` passes or the deadline lapses.
pub async fn wait_until(check: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
