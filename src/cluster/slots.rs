// Keyed-command routing against the slot map: LOCAL / MOVED / ASK /
// TRYAGAIN / CLUSTERDOWN / CROSSSLOT decisions, evaluated before every
// keyed operation.

use crate::common::{key_hash_slot, SLOT_COUNT};
use crate::error::{FerriteError, Result};

use super::topology::{ClusterTopology, SlotState};

/// Routing decision for one keyed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotVerdict {
    Local,
    Moved { slot: u16, endpoint: String },
    Ask { slot: u16, endpoint: String },
    TryAgain,
    ClusterDown,
    CrossSlot,
}

impl SlotVerdict {
    /// Exact wire text for redirection errors.
    pub fn to_error_message(&self) -> Option<String> {
        match self {
            SlotVerdict::Local => None,
            SlotVerdict::Moved { slot, endpoint } => Some(format!("MOVED {slot} {endpoint}")),
            SlotVerdict::Ask { slot, endpoint } => Some(format!("ASK {slot} {endpoint}")),
            SlotVerdict::TryAgain => {
                Some("TRYAGAIN Multiple keys request during rehashing of slot".to_string())
            }
            SlotVerdict::ClusterDown => Some("CLUSTERDOWN Hash slot not served".to_string()),
            SlotVerdict::CrossSlot => {
                Some("CROSSSLOT Keys in request don't hash to the same slot".to_string())
            }
        }
    }
}

/// Parse a client-supplied slot number, range-checked.
pub fn parse_slot(raw: &str) -> Result<u16> {
    let value: i64 = raw.parse().map_err(|_| FerriteError::ValueNotInteger)?;
    if !(0..SLOT_COUNT as i64).contains(&value) {
        return Err(FerriteError::SlotOutOfRange);
    }
    Ok(value as u16)
}

/// Context a routing decision needs from the executing node.
pub struct RouteContext<'a> {
    pub topology: &'a ClusterTopology,
    /// Does the key currently exist on this node?
    pub key_exists: &'a dyn Fn(&[u8]) -> bool,
    /// Is the key mid-transfer by the migration engine?
    pub key_in_flight: &'a dyn Fn(&[u8]) -> bool,
    /// Session issued ASKING before this request.
    pub asking: bool,
    pub is_write: bool,
}

/// Route a keyed command. Multi-key requests must hash to one slot.
pub fn route(keys: &[&[u8]], ctx: &RouteContext<'_>) -> SlotVerdict {
    debug_assert!(!keys.is_empty());
    let slot = key_hash_slot(keys[0]);
    if keys.iter().any(|key| key_hash_slot(key) != slot) {
        return SlotVerdict::CrossSlot;
    }

    let endpoint_of = |node_id: &str| {
        ctx.topology
            .node(node_id)
            .map(|info| info.endpoint())
            .unwrap_or_default()
    };

    match ctx.topology.slot_state(slot) {
        SlotState::Unassigned => SlotVerdict::ClusterDown,
        SlotState::Stable { owner } => {
            if owner == ctx.topology.local_id() {
                SlotVerdict::Local
            } else {
                SlotVerdict::Moved {
                    slot,
                    endpoint: endpoint_of(&owner),
                }
            }
        }
        SlotState::Migrating { from, to } => {
            debug_assert_eq!(from, ctx.topology.local_id());
            if keys.iter().all(|key| (ctx.key_exists)(key)) {
                if ctx.is_write && keys.iter().any(|key| (ctx.key_in_flight)(key)) {
                    SlotVerdict::TryAgain
                } else {
                    SlotVerdict::Local
                }
            } else {
                SlotVerdict::Ask {
                    slot,
                    endpoint: endpoint_of(&to),
                }
            }
        }
        SlotState::Importing { from, .. } => {
            if ctx.asking {
                SlotVerdict::Local
            } else {
                // Until the final NODE transition, the source remains the
                // authoritative owner everyone is redirected to.
                let owner = ctx.topology.owner_of(slot).unwrap_or(from);
                SlotVerdict::Moved {
                    slot,
                    endpoint: endpoint_of(&owner),
                }
            }
        }
    }
}
