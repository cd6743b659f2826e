use crate::core::alert::{AlertLevel, AlertMonitor, Event, CLEANUP_CATEGORY};
use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::exchange::{ExchangeProvider, TreeExchange};
use crate::core::page_node::TreeDescriptor;
use crate::core::task::{Pollable, PollableTask};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Deferred structural repair on one page of one tree.
///
/// Actions order by tree handle, then page, so a work list visits each tree
/// in page order. Two actions of the same kind on the same page are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CleanupAction {
    /// Remove an anti-value stranded at the first key of a page.
    PruneAntiValue { tree_handle: u32, page: PageAddress },
    Prune { tree_handle: u32, page: PageAddress },
    FixIndexHole { tree_handle: u32, page: PageAddress, level: u32 },
}

impl CleanupAction {
    pub fn tree_handle(&self) -> u32 {
        match *self {
            CleanupAction::PruneAntiValue { tree_handle, .. }
            | CleanupAction::Prune { tree_handle, .. }
            | CleanupAction::FixIndexHole { tree_handle, .. } => tree_handle,
        }
    }

    pub fn page(&self) -> PageAddress {
        match *self {
            CleanupAction::PruneAntiValue { page, .. }
            | CleanupAction::Prune { page, .. }
            | CleanupAction::FixIndexHole { page, .. } => page,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            CleanupAction::PruneAntiValue { .. } => 0,
            CleanupAction::Prune { .. } => 1,
            CleanupAction::FixIndexHole { .. } => 2,
        }
    }

    fn perform(&self, exchange: &mut dyn TreeExchange, consequent: &mut Vec<CleanupAction>) -> Result<()> {
        match *self {
            CleanupAction::PruneAntiValue { page, .. } => {
                exchange.prune_left_edge_value(page, consequent)?;
            }
            CleanupAction::Prune { page, .. } => {
                exchange.prune_page(page, consequent)?;
            }
            CleanupAction::FixIndexHole { page, level, .. } => exchange.fix_index_hole(page, level)?,
        }
        Ok(())
    }
}

impl Ord for CleanupAction {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.tree_handle()
            .cmp(&other.tree_handle())
            .then(self.page().cmp(&other.page()))
            .then(self.kind().cmp(&other.kind()))
            .then_with(|| match (self, other) {
                (
                    CleanupAction::FixIndexHole { level: a, .. },
                    CleanupAction::FixIndexHole { level: b, .. },
                ) => a.cmp(b),
                _ => std::cmp::Ordering::Equal,
            })
    }
}

impl PartialOrd for CleanupAction {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CleanupAction::PruneAntiValue { .. } => "PruneAntiValue",
            CleanupAction::Prune { .. } => "Prune",
            CleanupAction::FixIndexHole { .. } => "FixIndexHole",
        };
        write!(f, "{} on page {} tree handle [{}]", name, self.page(), self.tree_handle())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupOptions {
    pub poll_interval_ms: u64,
    pub queue_capacity: usize,
    pub worklist_length: usize,
    /// Least time between two prune actions offered for the same page. Zero
    /// disables page pruning through the queue.
    pub minimum_pruning_delay_ms: u64,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
            queue_capacity: DEFAULT_CLEANUP_QUEUE_SIZE,
            worklist_length: CLEANUP_WORKLIST_LENGTH,
            minimum_pruning_delay_ms: DEFAULT_MINIMUM_PRUNING_DELAY_MS,
        }
    }
}

impl CleanupOptions {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig {
                field: "queue_capacity".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.worklist_length == 0 {
            return Err(Error::InvalidConfig {
                field: "worklist_length".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// What the cleanup poller works against.
pub trait CleanupTarget: Send + Sync {
    fn tree_for_handle(&self, handle: u32) -> Option<TreeDescriptor>;

    fn exchange_provider(&self) -> Option<Arc<dyn ExchangeProvider>>;

    /// Periodic housekeeping run from the poller.
    fn prune_obsolete_transactions(&self) -> Result<()> {
        Ok(())
    }

    fn alert_monitor(&self) -> Option<&AlertMonitor> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub accepted: u64,
    pub refused: u64,
    pub performed: u64,
    pub errors: u64,
    pub enqueued: usize,
}


/// Bounded queue of deferred page repairs, drained by a background poller.
pub struct CleanupManager {
    options: CleanupOptions,
    queue: Mutex<BTreeSet<CleanupAction>>,
    accepted: AtomicU64,
    refused: AtomicU64,
    performed: AtomicU64,
    errors: AtomicU64,
    minimum_pruning_delay_ms: AtomicU64,
    last_prune_obsolete_transactions: Mutex<Instant>,
    task: Mutex<Option<PollableTask>>,
}

impl CleanupManager {
    pub fn new(options: CleanupOptions) -> Self {
        Self {
            minimum_pruning_delay_ms: AtomicU64::new(options.minimum_pruning_delay_ms),
            options,
            queue: Mutex::new(BTreeSet::new()),
            accepted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
            performed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_prune_obsolete_transactions: Mutex::new(Instant::now()),
            task: Mutex::new(None),
        }
    }

    /// Starts the background poller. It stops on its own once either the
    /// manager or the target is dropped.
    pub fn start(self: &Arc<Self>, target: Weak<dyn CleanupTarget>) -> Result<()> {
        self.options.validate()?;
        let mut task = self.task.lock().recover_poison();
        if task.is_some() {
            return Ok(());
        }
        let poller = Arc::new(CleanupPoller {
            manager: Arc::downgrade(self),
            target,
        });
        *task = Some(PollableTask::start(
            "CLEANUP_MANAGER",
            Duration::from_millis(self.options.poll_interval_ms),
            poller,
        )?);
        Ok(())
    }

    pub fn close(&self) {
        let task = self.task.lock().recover_poison().take();
        if let Some(task) = task {
            task.stop();
        }
    }

    /// Queues `action` without blocking. An action already queued counts as
    /// accepted. When the queue is full the action is dropped and the poller
    /// is woken.
    pub fn offer(&self, action: CleanupAction) -> bool {
        let accepted = {
            let mut queue = self.queue.lock().recover_poison();
            if queue.contains(&action) {
                true
            } else if queue.len() >= self.options.queue_capacity {
                false
            } else {
                queue.insert(action);
                true
            }
        };
        if accepted {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.refused.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(action = %action, "cleanup queue full, action dropped");
            self.kick();
        }
        accepted
    }

    pub fn kick(&self) {
        if let Some(task) = self.task.lock().recover_poison().as_ref() {
            task.kick();
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().recover_poison().len()
    }

    pub fn clear(&self) {
        self.queue.lock().recover_poison().clear();
    }

    pub fn minimum_pruning_delay_millis(&self) -> u64 {
        self.minimum_pruning_delay_ms.load(Ordering::Relaxed)
    }

    pub fn set_minimum_pruning_delay_millis(&self, delay: u64) {
        self.minimum_pruning_delay_ms.store(delay, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CleanupStats {
        CleanupStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            performed: self.performed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            enqueued: self.queued(),
        }
    }

    /// Runs one cycle: obsolete transaction pruning when due, then up to
    /// `worklist_length` queued actions in (tree, page) order.
    pub fn poll(&self, target: &dyn CleanupTarget) -> Result<()> {
        let now = Instant::now();
        let prune_transactions = {
            let mut last = self.last_prune_obsolete_transactions.lock().recover_poison();
            let due = now.duration_since(*last) > Duration::from_millis(MINIMUM_PRUNE_OBSOLETE_TRANSACTIONS_INTERVAL_MS);
            if due {
                *last = now;
            }
            due
        };
        if prune_transactions {
            if let Err(e) = target.prune_obsolete_transactions() {
                tracing::warn!(error = %e, "pruning obsolete transactions failed");
            }
        }

        let work_list: Vec<CleanupAction> = {
            let mut queue = self.queue.lock().recover_poison();
            let mut work = Vec::with_capacity(self.options.worklist_length.min(queue.len()));
            while work.len() < self.options.worklist_length {
                match queue.pop_first() {
                    Some(action) => work.push(action),
                    None => break,
                }
            }
            work
        };
        if work_list.is_empty() {
            return Ok(());
        }

        let provider = target.exchange_provider();
        // One exchange per tree for the length of this cycle
        let mut exchanges: HashMap<u32, Option<Box<dyn TreeExchange>>> = HashMap::new();
        let mut consequent = Vec::new();
        for action in work_list {
            let result = Self::exchange_for(&mut exchanges, provider.as_deref(), target, action.tree_handle())
                .and_then(|exchange| match exchange {
                    Some(exchange) => action.perform(&mut **exchange, &mut consequent),
                    None => Ok(()),
                });
            match result {
                Ok(()) => {
                    self.performed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    let message = format!("cleanup action {} failed: {}", action, e);
                    match target.alert_monitor() {
                        Some(alerts) => alerts.post(Event::new(AlertLevel::Error, message), CLEANUP_CATEGORY),
                        None => tracing::error!(action = %action, error = %e, "cleanup action failed"),
                    }
                }
            }
        }
        for action in consequent {
            self.offer(action);
        }
        Ok(())
    }

    fn exchange_for<'a>(
        exchanges: &'a mut HashMap<u32, Option<Box<dyn TreeExchange>>>,
        provider: Option<&dyn ExchangeProvider>,
        target: &dyn CleanupTarget,
        tree_handle: u32,
    ) -> Result<Option<&'a mut Box<dyn TreeExchange>>> {
        if !exchanges.contains_key(&tree_handle) {
            let exchange = match (provider, target.tree_for_handle(tree_handle)) {
                (Some(provider), Some(tree)) => provider.exchange(&tree, false)?,
                _ => None,
            };
            exchanges.insert(tree_handle, exchange);
        }
        Ok(exchanges.get_mut(&tree_handle).and_then(|e| e.as_mut()))
    }

    fn poll_interval(&self, configured: Duration) -> Duration {
        if self.queued() < self.options.queue_capacity / 4 {
            configured
        } else {
            Duration::ZERO
        }
    }
}

impl fmt::Debug for CleanupManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupManager")
            .field("options", &self.options)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for CleanupManager {
    fn drop(&mut self) {
        self.close();
    }
}

struct CleanupPoller {
    manager: Weak<CleanupManager>,
    target: Weak<dyn CleanupTarget>,
}

impl Pollable for CleanupPoller {
    fn run_task(&self) -> Result<()> {
        match (self.manager.upgrade(), self.target.upgrade()) {
            (Some(manager), Some(target)) => manager.poll(target.as_ref()),
            _ => Ok(()),
        }
    }

    fn poll_interval(&self, configured: Duration) -> Duration {
        match self.manager.upgrade() {
            Some(manager) => manager.poll_interval(configured),
            None => configured,
        }
    }

    fn should_stop(&self) -> bool {
        self.manager.strong_count() == 0 || self.target.strong_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key::Key;

    #[derive(Default)]
    struct Log {
        calls: Mutex<Vec<String>>,
    }

    struct LoggingExchange {
        tree: TreeDescriptor,
        log: Arc<Log>,
    }

    impl TreeExchange for LoggingExchange {
        fn tree(&self) -> &TreeDescriptor {
            &self.tree
        }
        fn store(&mut self, _key: &Key, _value: &[u8]) -> Result<()> {
            Ok(())
        }
        fn remove_key_range(&mut self, _from: &Key, _to: &Key) -> Result<bool> {
            Ok(false)
        }
        fn remove_tree(&mut self) -> Result<()> {
            Ok(())
        }
        fn prune(&mut self, _key: &Key) -> Result<bool> {
            Ok(false)
        }
        fn prune_range(&mut self, _from: &Key, _to: &Key) -> Result<bool> {
            Ok(false)
        }
        fn prune_page(&mut self, page: PageAddress, consequent: &mut Vec<CleanupAction>) -> Result<bool> {
            self.log.calls.lock().unwrap().push(format!("prune {}:{}", self.tree.tree_name, page));
            if page == 13 {
                return Err(Error::corrupt_page(13, "bad tail"));
            }
            if page == 20 {
                consequent.push(CleanupAction::PruneAntiValue { tree_handle: 1, page: 21 });
            }
            Ok(true)
        }
        fn prune_left_edge_value(&mut self, page: PageAddress, _consequent: &mut Vec<CleanupAction>) -> Result<bool> {
            self.log.calls.lock().unwrap().push(format!("anti {}:{}", self.tree.tree_name, page));
            Ok(true)
        }
        fn fix_index_hole(&mut self, page: PageAddress, level: u32) -> Result<()> {
            self.log.calls.lock().unwrap().push(format!("hole {}:{}@{}", self.tree.tree_name, page, level));
            Ok(())
        }
    }

    struct Target {
        log: Arc<Log>,
        alerts: AlertMonitor,
    }

    impl ExchangeProvider for Target {
        fn exchange(&self, tree: &TreeDescriptor, _create: bool) -> Result<Option<Box<dyn TreeExchange>>> {
            Ok(Some(Box::new(LoggingExchange { tree: tree.clone(), log: self.log.clone() })))
        }
    }

    struct Holder(Arc<Target>);

    impl CleanupTarget for Holder {
        fn tree_for_handle(&self, handle: u32) -> Option<TreeDescriptor> {
            match handle {
                1 => Some(TreeDescriptor::new(1, "a")),
                2 => Some(TreeDescriptor::new(1, "b")),
                _ => None,
            }
        }
        fn exchange_provider(&self) -> Option<Arc<dyn ExchangeProvider>> {
            Some(self.0.clone())
        }
        fn alert_monitor(&self) -> Option<&AlertMonitor> {
            Some(&self.0.alerts)
        }
    }

    fn target() -> (Holder, Arc<Log>) {
        let log = Arc::new(Log::default());
        (Holder(Arc::new(Target { log: log.clone(), alerts: AlertMonitor::new() })), log)
    }

    #[test]
    fn test_offer_is_duplicate_safe() {
        let cm = CleanupManager::new(CleanupOptions::default());
        assert!(cm.offer(CleanupAction::Prune { tree_handle: 1, page: 5 }));
        assert!(cm.offer(CleanupAction::Prune { tree_handle: 1, page: 5 }));
        assert!(cm.offer(CleanupAction::PruneAntiValue { tree_handle: 1, page: 5 }));
        assert_eq!(cm.queued(), 2);
        assert_eq!(cm.stats().accepted, 3);
    }

    #[test]
    fn test_full_queue_refuses_without_blocking() {
        let cm = CleanupManager::new(CleanupOptions { queue_capacity: 2, ..CleanupOptions::default() });
        assert!(cm.offer(CleanupAction::Prune { tree_handle: 1, page: 1 }));
        assert!(cm.offer(CleanupAction::Prune { tree_handle: 1, page: 2 }));
        assert!(!cm.offer(CleanupAction::Prune { tree_handle: 1, page: 3 }));
        let stats = cm.stats();
        assert_eq!(stats.refused, 1);
        assert_eq!(stats.enqueued, 2);
    }

    #[test]
    fn test_poll_performs_in_tree_page_order() {
        let (target, log) = target();
        let cm = CleanupManager::new(CleanupOptions::default());
        cm.offer(CleanupAction::Prune { tree_handle: 2, page: 4 });
        cm.offer(CleanupAction::FixIndexHole { tree_handle: 1, page: 9, level: 1 });
        cm.offer(CleanupAction::PruneAntiValue { tree_handle: 1, page: 3 });
        cm.offer(CleanupAction::Prune { tree_handle: 7, page: 1 });

        cm.poll(&target).unwrap();
        let calls = log.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["anti a:3", "hole a:9@1", "prune b:4"]);
        // The unknown tree is skipped quietly
        assert_eq!(cm.stats().performed, 4);
        assert_eq!(cm.queued(), 0);
    }

    #[test]
    fn test_errors_are_counted_and_alerted() {
        let (target, _log) = target();
        let cm = CleanupManager::new(CleanupOptions::default());
        cm.offer(CleanupAction::Prune { tree_handle: 1, page: 13 });
        cm.offer(CleanupAction::Prune { tree_handle: 1, page: 20 });
        cm.poll(&target).unwrap();

        let stats = cm.stats();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.performed, 1);
        assert_eq!(target.0.alerts.level(), AlertLevel::Error);
        // Follow-up from page 20 is queued for the next cycle
        assert_eq!(cm.queued(), 1);
    }

    #[test]
    fn test_worklist_length_bounds_a_cycle() {
        let (target, _log) = target();
        let cm = CleanupManager::new(CleanupOptions { worklist_length: 2, ..CleanupOptions::default() });
        for page in 30..35 {
            cm.offer(CleanupAction::Prune { tree_handle: 1, page });
        }
        cm.poll(&target).unwrap();
        assert_eq!(cm.queued(), 3);
    }

    #[test]
    fn test_options_serde_defaults() {
        let options: CleanupOptions = serde_json::from_str(r#"{"queue_capacity": 10}"#).unwrap();
        assert_eq!(options.queue_capacity, 10);
        assert_eq!(options.worklist_length, CLEANUP_WORKLIST_LENGTH);
        assert!(CleanupOptions { worklist_length: 0, ..options }.validate().is_err());
    }
}
