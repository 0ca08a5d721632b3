use super::{sweep, GcOptions, GcReport, GcStrategy, RetentionPolicy};
use crate::store::{NodeStore, RootsIndex};
use crate::Result;
use tracing::info;

/// Marker-driven collection without a mark phase.
///
/// Cost is proportional to the number of expired markers, so it suits
/// frequent small runs with a low `batch_size`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Incremental;

impl GcStrategy for Incremental {
    fn name(&self) -> &'static str {
        "incremental"
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

        sweep(store, oldest, options, &mut report, |page, _| Ok(page.to_vec()))?;

        info!(
            namespace = store.namespace(),
            oldest,
            removed = report.nodes_removed,
            bytes = report.bytes_reclaimed,
            "incremental gc finished"
        );
        Ok(report)
    }
}
