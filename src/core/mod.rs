
pub mod alert;
pub mod buffer;
pub mod cleanup;
pub mod constants;
pub mod copier;
pub mod endian;
pub mod errors;
pub mod exchange;
pub mod fast_index;
pub mod flusher;
pub mod journal;
pub mod journal_record;
pub mod key;
pub mod metrics;
pub mod mvv;
pub mod page_node;
pub mod page_source;
pub mod player;
pub mod policy;
pub mod recovery;
pub mod task;
pub mod transaction_index;
pub mod value;
pub mod volume;

pub use alert::{AlertLevel, AlertMonitor, Event};
pub use buffer::{Buffer, FoundAt, JoinOutcome, PruneContext, SplitSide};
pub use cleanup::{CleanupAction, CleanupManager, CleanupOptions, CleanupStats, CleanupTarget};
pub use constants::*;
pub use copier::JournalCopier;
pub use exchange::{ExchangeProvider, TreeExchange};
pub use flusher::{FlushClock, JournalFlusher};
pub use journal::{JournalManager, JournalOptions};
pub use journal_record::{RecordType, Update};
pub use key::Key;
pub use metrics::{JournalMetrics, JournalMetricsSnapshot};
pub use page_node::{Checkpoint, PageChain, PageKey, PageNode, TransactionMapItem, TreeDescriptor};
pub use page_source::{FixedPageSource, PageSource};
pub use player::{
    PlayerStats, ProactiveRollbackListener, PruneCommittedListener, ReplayListener, TransactionPlayer,
    TransactionPlayerListener, TransactionPlayerSupport,
};
pub use recovery::RecoveryReport;
pub use task::{Pollable, PollableTask};
pub use transaction_index::{MemoryTransactionIndex, TimestampAllocator, TransactionIndex, TransactionStatus};
pub use volume::{FileVolume, MemoryVolume, Volume, VolumeSpecification};
