//! Reclaiming nodes no retained version can reach
//!
//! Every commit records a stale marker `(since, node)` for each node it
//! supersedes: the node belongs to the trees of versions `node.version ..
//! since` and to none after. Once the oldest retained version is at or past
//! `since`, nothing retained can reach the node and it may be deleted.
//!
//! Two strategies share that rule:
//! - [`MarkSweep`] additionally marks every commitment reachable from the
//!   retained roots and never deletes a marked node
//! - [`Incremental`] sweeps markers only, in small cancellable batches

mod incremental;
mod mark_sweep;
pub mod refs;

pub use incremental::Incremental;
pub use mark_sweep::MarkSweep;
pub use refs::{child_refs, ArrayRefParser, NodeRefParser};

use crate::model::Hash;
use crate::store::{Durability, NodeStore, RootsIndex, StaleNode};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Which versions must stay readable. The latest version always does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// The newest `n` committed versions
    KeepLatest(u64),
    /// Every version readable at or after this one
    KeepFrom(u64),
    KeepAll,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::KeepLatest(16)
    }
}

impl RetentionPolicy {
    /// Oldest committed version whose tree must survive, given every
    /// committed root. `None` when nothing is committed.
    pub fn oldest_retained(&self, roots: &BTreeMap<u64, Hash>) -> Option<u64> {
        let (&latest, _) = roots.last_key_value()?;
        let oldest = match *self {
            RetentionPolicy::KeepAll => roots.keys().next().copied(),
            RetentionPolicy::KeepLatest(n) => {
                let n = n.max(1) as usize;
                roots.keys().rev().take(n).last().copied()
            }
            // reading `v` reads the tree committed at or below it
            RetentionPolicy::KeepFrom(v) => roots
                .range(..=v)
                .next_back()
                .map(|(&version, _)| version)
                .or_else(|| roots.keys().next().copied()),
        };
        oldest.map(|v| v.min(latest))
    }

    /// Committed versions at or above the oldest retained one
    pub fn retained(&self, roots: &BTreeMap<u64, Hash>) -> Vec<u64> {
        match self.oldest_retained(roots) {
            Some(oldest) => roots.range(oldest..).map(|(&v, _)| v).collect(),
            None => Vec::new(),
        }
    }
}

/// Knobs for one collection run
#[derive(Clone, Debug)]
pub struct GcOptions {
    /// Stale markers examined (and deleted atomically) per batch
    pub batch_size: usize,
    pub durability: Durability,
    /// Checked between batches; a set flag ends the run early
    pub cancel: Option<Arc<AtomicBool>>,
    /// Count what would be removed without deleting anything
    pub dry_run: bool,
}

impl Default for GcOptions {
    fn default() -> Self {
        GcOptions {
            batch_size: 512,
            durability: Durability::Sync,
            cancel: None,
            dry_run: false,
        }
    }
}

impl GcOptions {
    pub(crate) fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub strategy: String,
    pub retained_versions: usize,
    pub oldest_retained: Option<u64>,
    /// Commitments reached while marking (mark-sweep only)
    pub nodes_marked: u64,
    /// Stale markers examined
    pub nodes_scanned: u64,
    pub nodes_removed: u64,
    pub bytes_reclaimed: u64,
    /// Anomalies skipped during the run
    pub errors: Vec<String>,
    pub cancelled: bool,
    pub dry_run: bool,
}

impl GcReport {
    pub(crate) fn new(strategy: &str, options: &GcOptions) -> Self {
        GcReport {
            strategy: strategy.to_string(),
            dry_run: options.dry_run,
            ..GcReport::default()
        }
    }
}

pub trait GcStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Collect garbage in `store`. Never deletes a node reachable from a
    /// version `policy` retains.
    fn run(
        &self,
        store: &dyn NodeStore,
        roots: &dyn RootsIndex,
        policy: &RetentionPolicy,
        options: &GcOptions,
    ) -> Result<GcReport>;
}

/// Strategy selector used by configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcStrategyKind {
    #[default]
    MarkSweep,
    Incremental,
}

impl GcStrategyKind {
    pub fn strategy(self) -> Box<dyn GcStrategy> {
        match self {
            GcStrategyKind::MarkSweep => Box::new(MarkSweep::default()),
            GcStrategyKind::Incremental => Box::new(Incremental),
        }
    }
}

impl std::str::FromStr for GcStrategyKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mark_sweep" | "mark-sweep" => Ok(GcStrategyKind::MarkSweep),
            "incremental" => Ok(GcStrategyKind::Incremental),
            other => Err(crate::Error::Config(format!("unknown gc strategy '{}'", other))),
        }
    }
}

/// Bytes a removal would free, for dry runs
fn stored_size(store: &dyn NodeStore, stale: &StaleNode) -> Result<Option<u64>> {
    Ok(store
        .get_node(&stale.node_key)?
        .map(|node| (Hash::LEN + node.bytes.len()) as u64))
}

/// Walk stale markers with `stale_since <= oldest` in batches and remove
/// whatever `select` returns from each batch. Each removal is one atomic write.
pub(crate) fn sweep<F>(
    store: &dyn NodeStore,
    oldest: u64,
    options: &GcOptions,
    report: &mut GcReport,
    mut select: F,
) -> Result<()>
where
    F: FnMut(&[StaleNode], &mut GcReport) -> Result<Vec<StaleNode>>,
{
    let before = oldest.saturating_add(1);
    let batch_size = options.batch_size();
    let mut cursor: Option<StaleNode> = None;
    loop {
        if options.cancelled() {
            report.cancelled = true;
            tracing::info!(strategy = %report.strategy, "gc cancelled");
            return Ok(());
        }
        let page = store.stale_nodes(before, cursor.as_ref(), batch_size)?;
        let Some(last) = page.last() else {
            return Ok(());
        };
        cursor = Some(last.clone());
        report.nodes_scanned += page.len() as u64;

        let victims = select(&page, report)?;
        if options.dry_run {
            for stale in &victims {
                if let Some(bytes) = stored_size(store, stale)? {
                    report.nodes_removed += 1;
                    report.bytes_reclaimed += bytes;
                }
            }
        } else if !victims.is_empty() {
            let stats = store.remove_stale(&victims, options.durability)?;
            report.nodes_removed += stats.removed;
            report.bytes_reclaimed += stats.bytes;
        }
        tracing::debug!(
            scanned = page.len(),
            removed = victims.len(),
            dry_run = options.dry_run,
            "gc batch"
        );
        if page.len() < batch_size {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots(versions: &[u64]) -> BTreeMap<u64, Hash> {
        versions.iter().map(|&v| (v, Hash::from_bytes([v as u8; 32]))).collect()
    }

    #[test]
    fn test_keep_latest() {
        let r = roots(&[1, 2, 5, 9]);
        assert_eq!(RetentionPolicy::KeepLatest(2).oldest_retained(&r), Some(5));
        assert_eq!(RetentionPolicy::KeepLatest(0).retained(&r), vec![9]);
        assert_eq!(RetentionPolicy::KeepLatest(10).oldest_retained(&r), Some(1));
    }

    #[test]
    fn test_keep_from_uses_floor() {
        let r = roots(&[1, 2, 5, 9]);
        assert_eq!(RetentionPolicy::KeepFrom(4).oldest_retained(&r), Some(2));
        assert_eq!(RetentionPolicy::KeepFrom(5).retained(&r), vec![5, 9]);
        assert_eq!(RetentionPolicy::KeepFrom(0).oldest_retained(&r), Some(1));
        // the latest version is always kept
        assert_eq!(RetentionPolicy::KeepFrom(100).retained(&r), vec![9]);
    }

    #[test]
    fn test_keep_all_and_empty() {
        assert_eq!(RetentionPolicy::KeepAll.retained(&roots(&[3, 4])), vec![3, 4]);
        assert_eq!(RetentionPolicy::KeepAll.oldest_retained(&BTreeMap::new()), None);
    }

    #[test]
    fn test_policy_json() {
        let json = serde_json::to_string(&RetentionPolicy::KeepLatest(3)).unwrap();
        assert_eq!(json, r#"{"keep_latest":3}"#);
        let all: RetentionPolicy = serde_json::from_str(r#""keep_all""#).unwrap();
        assert_eq!(all, RetentionPolicy::KeepAll);
        assert_eq!("incremental".parse::<GcStrategyKind>().unwrap(), GcStrategyKind::Incremental);
    }
}
