use super::refs::{ArrayRefParser, NodeRefParser};
use super::{sweep, GcOptions, GcReport, GcStrategy, RetentionPolicy};
use crate::model::{Hash, JmtNode, NodeKey};
use crate::store::{NodeStore, RootsIndex, StaleNode};
use crate::Result;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Mark every commitment reachable from the retained roots, then sweep
/// expired stale markers, skipping any marked node that still sits on a
/// retained path.
pub struct MarkSweep {
    parser: Arc<dyn NodeRefParser>,
}

impl Default for MarkSweep {
    fn default() -> Self {
        MarkSweep {
            parser: Arc::new(ArrayRefParser),
        }
    }
}

impl MarkSweep {
    pub fn with_parser(parser: Arc<dyn NodeRefParser>) -> Self {
        MarkSweep { parser }
    }
}

/// Reachability state carried across sweep batches
struct Marker<'a> {
    store: &'a dyn NodeStore,
    parser: &'a dyn NodeRefParser,
    marked: HashSet<Hash>,
    /// Root versions already walked
    walked: BTreeMap<u64, Hash>,
}

impl Marker<'_> {
    fn mark_root(&mut self, version: u64, root: Hash, report: &mut GcReport) -> Result<()> {
        if self.walked.insert(version, root).is_some() {
            return Ok(());
        }
        // an empty tree has no root node
        let Some(node) = self.store.get_node(&NodeKey::root(version))? else {
            return Ok(());
        };
        if node.hash != root {
            let msg = format!("root node of version {} does not match its recorded hash", version);
            warn!("{}", msg);
            report.errors.push(msg);
        }
        let mut pending = vec![(node.hash, node.bytes)];
        while let Some((hash, bytes)) = pending.pop() {
            if !self.marked.insert(hash) {
                continue;
            }
            report.nodes_marked += 1;
            let children = match self.parser.child_refs(&bytes) {
                Ok(children) => children,
                Err(e) => {
                    let msg = format!("skipping references of node {}: {}", hash.short(), e);
                    warn!("{}", msg);
                    report.errors.push(msg);
                    continue;
                }
            };
            for child in children {
                if self.marked.contains(&child) {
                    continue;
                }
                match self.store.find_node_by_hash(&child)? {
                    Some((_, stored)) => pending.push((child, stored.bytes)),
                    None => {
                        let msg = format!("node {} references missing {}", hash.short(), child.short());
                        warn!("{}", msg);
                        report.errors.push(msg);
                    }
                }
            }
        }
        Ok(())
    }

    fn mark_from(&mut self, roots: &BTreeMap<u64, Hash>, oldest: u64, report: &mut GcReport) -> Result<()> {
        for (&version, &root) in roots.range(oldest..) {
            self.mark_root(version, root, report)?;
        }
        Ok(())
    }

    /// Whether some retained root reaches exactly `key` when walking its path.
    ///
    /// A stale node can share its commitment with a live one at another key
    /// (an old root copy, a leaf re-put with the same value); only the key
    /// on a retained path has to survive.
    fn on_retained_path(&self, key: &NodeKey) -> Result<bool> {
        let target = key.path();
        for &version in self.walked.keys() {
            let mut at = NodeKey::root(version);
            for depth in 0..=target.len() {
                if at == *key {
                    return Ok(true);
                }
                if depth == target.len() {
                    break;
                }
                let Some(stored) = self.store.get_node(&at)? else {
                    break;
                };
                let node = match stored.decode() {
                    Ok(JmtNode::Internal(node)) => node,
                    Ok(JmtNode::Leaf(_)) => break,
                    // unreadable path: keep the candidate
                    Err(_) => return Ok(true),
                };
                let nibble = target.get(depth);
                let Some(child) = node.child(nibble) else {
                    break;
                };
                at = NodeKey::new(at.path().child(nibble), child.version);
            }
        }
        Ok(false)
    }

    fn unmarked(&self, page: &[StaleNode]) -> Result<Vec<StaleNode>> {
        let mut victims = Vec::with_capacity(page.len());
        for stale in page {
            let keep = match self.store.get_node(&stale.node_key)? {
                Some(node) if self.marked.contains(&node.hash) => {
                    self.on_retained_path(&stale.node_key)?
                }
                _ => false,
            };
            if !keep {
                victims.push(stale.clone());
            }
        }
        Ok(victims)
    }
}

impl GcStrategy for MarkSweep {
    fn name(&self) -> &'static str {
        "mark_sweep"
    }

    fn run(
        &self,
        store: &dyn NodeStore,
        roots: &dyn RootsIndex,
        policy: &RetentionPolicy,
        options: &GcOptions,
    ) -> Result<GcReport> {
        let mut report = GcReport::new(self.name(), options);
        let snapshot = roots.snapshot()?;
        let Some(oldest) = policy.oldest_retained(&snapshot) else {
            return Ok(report);
        };
        report.oldest_retained = Some(oldest);
        report.retained_versions = snapshot.range(oldest..).count();

        let mut marker = Marker {
            store,
            parser: self.parser.as_ref(),
            marked: HashSet::new(),
            walked: BTreeMap::new(),
        };
        marker.mark_from(&snapshot, oldest, &mut report)?;
        info!(
            namespace = store.namespace(),
            oldest,
            retained = report.retained_versions,
            marked = report.nodes_marked,
            "mark phase finished"
        );

        sweep(store, oldest, options, &mut report, |page, report| {
            // commits that landed since the snapshot are marked before deleting
            let latest = roots.snapshot()?;
            marker.mark_from(&latest, oldest, report)?;
            marker.unmarked(page)
        })?;

        info!(
            namespace = store.namespace(),
            scanned = report.nodes_scanned,
            removed = report.nodes_removed,
            bytes = report.bytes_reclaimed,
            errors = report.errors.len(),
            "sweep phase finished"
        );
        Ok(report)
    }
}
