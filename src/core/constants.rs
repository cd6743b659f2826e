// Page geometry

pub const MIN_BUFFER_SIZE: usize = 1024;
pub const MAX_BUFFER_SIZE: usize = 16384;

pub const HEADER_SIZE: usize = 32;
pub const KEY_BLOCK_START: usize = HEADER_SIZE;
pub const KEYBLOCK_LENGTH: usize = 4;

pub const TYPE_OFFSET: usize = 0;
pub const BUFFER_LENGTH_OFFSET: usize = 1;
pub const KEY_BLOCK_END_OFFSET: usize = 2;
pub const FREE_OFFSET: usize = 4;
pub const SLACK_OFFSET: usize = 6;
pub const PAGE_ADDRESS_OFFSET: usize = 8;
pub const RIGHT_SIBLING_OFFSET: usize = 16;
pub const TIMESTAMP_OFFSET: usize = 24;

pub const TAILBLOCK_HDR_SIZE_DATA: usize = 4;
pub const TAILBLOCK_HDR_SIZE_INDEX: usize = 8;
pub const TAILBLOCK_POINTER: usize = 4;
pub const TAILBLOCK_FACTOR: usize = 4;

// Key block bit fields

pub const DB_MASK: u32 = 0x0000_00FF;
pub const EBC_MASK: u32 = 0x000F_FF00;
pub const EBC_SHIFT: u32 = 8;
pub const TAIL_MASK: u32 = 0xFFF0_0000;
pub const TAIL_SHIFT: u32 = 18;

// Tail block header bit fields

pub const TAILBLOCK_SIZE_MASK: u32 = 0x0000_FFFF;
pub const TAILBLOCK_KLENGTH_MASK: u32 = 0x0FFF_0000;
pub const TAILBLOCK_KLENGTH_SHIFT: u32 = 16;
pub const TAILBLOCK_INUSE_MASK: u32 = 0x1000_0000;

// Packed search result

pub const EXACT_MASK: u32 = 0x0000_0001;
pub const P_MASK: u32 = 0x0000_FFFC;
pub const DEPTH_MASK: u32 = 0x0FFF_0000;
pub const DEPTH_SHIFT: u32 = 16;
pub const FIXUP_MASK: u32 = 0x4000_0000;

pub const BINARY_SEARCH_THRESHOLD: i32 = 6;

// Page types

pub const PAGE_TYPE_UNALLOCATED: u8 = 0;
pub const PAGE_TYPE_DATA: u8 = 1;
pub const PAGE_TYPE_INDEX_MIN: u8 = 2;
pub const PAGE_TYPE_INDEX_MAX: u8 = 21;
pub const PAGE_TYPE_GARBAGE: u8 = 30;
pub const PAGE_TYPE_LONG_RECORD: u8 = 31;
pub const PAGE_TYPE_HEAD: u8 = 32;

// Keys and values

pub const MAX_KEY_LENGTH: usize = 2047;

pub const LONGREC_TYPE: u8 = 255;
pub const LONGREC_SIZE: usize = 120;
pub const LONGREC_SIZE_OFFSET: usize = 4;
pub const LONGREC_PAGE_OFFSET: usize = 12;
pub const LONGREC_PREFIX_OFFSET: usize = 20;
pub const LONGREC_PREFIX_SIZE: usize = LONGREC_SIZE - LONGREC_PREFIX_OFFSET;

pub const TYPE_MVV: u8 = 0xFE;
pub const TYPE_ANTIVALUE: u8 = 0xFD;

/// Commit timestamp recorded for a transaction that rolled back.
pub const ABORTED: u64 = u64::MAX;
pub const UNCOMMITTED: u64 = 0;

// Journal

pub const JOURNAL_VERSION: u32 = 2;
pub const DEFAULT_BLOCK_SIZE: u64 = 1_000_000_000;
pub const MINIMUM_BLOCK_SIZE: u64 = 1_000_000;
pub const MAXIMUM_BLOCK_SIZE: u64 = 10_000_000_000;
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4 * 1024 * 1024;
pub const MINIMUM_WRITE_BUFFER_SIZE: usize = 96 * 1024;
pub const ROLLOVER_THRESHOLD: u64 = 4 * 1024 * 1024;
pub const JOURNAL_GENERATION_DIGITS: usize = 12;

pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;
pub const DEFAULT_COPIER_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_COPIES_PER_CYCLE: usize = 1000;
pub const DEFAULT_URGENT_FILE_COUNT_THRESHOLD: usize = 15;
pub const DEFAULT_SLOW_IO_ALERT_THRESHOLD_MS: u64 = 200;
pub const IO_MEASUREMENT_CYCLES: usize = 8;

pub const TOO_MANY_WARN_THRESHOLD: usize = 5;
pub const TOO_MANY_ERROR_THRESHOLD: usize = 10;

// Copier urgency and commit throttling

pub const PAGE_COPIER_URGENT: u32 = 5;
pub const URGENT: u32 = 10;
pub const ALMOST_URGENT: u32 = 8;
pub const URGENT_COMMIT_DELAY_MILLIS: u64 = 50;
pub const GENTLE_COMMIT_DELAY_MILLIS: u64 = 12;

// Cleanup manager

pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_CLEANUP_QUEUE_SIZE: usize = 100_000;
pub const CLEANUP_WORKLIST_LENGTH: usize = 2_000;
pub const MINIMUM_PRUNE_OBSOLETE_TRANSACTIONS_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_MINIMUM_PRUNING_DELAY_MS: u64 = 1_000;

/// Largest transaction buffer a single TX record may carry.
pub const TRANSACTION_BUFFER_SIZE: usize = 65_536;

pub type PageAddress = u64;

pub type JournalAddress = u64;
