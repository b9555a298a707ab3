// # Storage Engine
//
// The hybrid log-structured engine: a circular in-memory page ring over a
// segmented device, a hash index of logical addresses, and the keyed
// operation surface shared by the main (byte-value) and object
// (collection-value) stores.

pub mod address;
pub mod allocator;
pub mod device;
pub mod epoch;
pub mod index;
pub mod object;
pub mod pending;
pub mod record;
pub mod store;

pub use address::{Address, AddressLayout, FIRST_VALID_ADDRESS, INVALID_ADDRESS};
pub use allocator::LogAllocator;
pub use device::{SegmentedFileDevice, StorageDevice};
pub use epoch::EpochManager;
pub use object::{ObjectStore, ObjectValue};
pub use pending::{PendingOutcome, RmwResult, SessionPending};
pub use store::{
    DeleteOutcome, KvStore, MutationObserver, PendingCompletion, ReadOutcome, RmwOutcome,
    StoreConfig,
};
