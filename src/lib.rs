pub mod core;

pub use crate::core::{
    Buffer, Checkpoint, CleanupManager, CleanupOptions, CleanupTarget, ExchangeProvider, FileVolume, Key,
    JournalManager, JournalOptions, MemoryTransactionIndex, MemoryVolume, PageNode, TimestampAllocator,
    TransactionIndex, TransactionMapItem, TransactionPlayer, TreeDescriptor, TreeExchange, Volume,
    VolumeSpecification,
};
pub use crate::core::errors::{Error, Result};
pub use crate::core::metrics::JournalMetricsSnapshot;
