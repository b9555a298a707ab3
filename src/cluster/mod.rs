// # Cluster Control Plane
//
// Slot ownership and redirection, per-slot migration state machines, and
// primary/replica failover. Gossip merges follow epoch arithmetic: the
// higher config epoch always wins.

pub mod failover;
pub mod migration;
pub mod slots;
pub mod topology;

pub use failover::{
    FailoverConfig, FailoverOption, FailoverSession, FailoverStage, PeerNotifier, SilentNotifier,
};
pub use migration::{
    KeyTracker, LocalMigrationTarget, MigrateOptions, MigrationEngine, MigrationSource,
    MigrationTarget,
};
pub use slots::{parse_slot, route, RouteContext, SlotVerdict};
pub use topology::{ClusterTopology, NodeInfo, NodeRole, SetSlotCommand, SlotState};
