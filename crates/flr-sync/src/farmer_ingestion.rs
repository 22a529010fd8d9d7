//! Farmer stage: pull every source, drop repeats, store the rest.

use std::collections::HashSet;

use flr_adapters::{SourceEndpoint, UpstreamApi};
use flr_core::NewFarmer;
use flr_storage::Datastore;
use tracing::{info, warn};

use crate::{StageOutcome, StageReport};

pub const STAGE: &str = "farmers";

/// Unique farmers across all sources, with what was left out on the way.
#[derive(Debug, Clone, Default)]
pub struct FetchedFarmers {
    pub farmers: Vec<NewFarmer>,
    pub sources_skipped: usize,
    pub duplicates_dropped: usize,
}

/// Identity is `(external id, source)`: the same external id under another
/// source is a different farmer.
pub async fn fetch_all_unique(
    upstream: &dyn UpstreamApi,
    sources: &[SourceEndpoint],
) -> FetchedFarmers {
    let mut fetched = FetchedFarmers::default();
    let mut seen: HashSet<(i64, String)> = HashSet::new();

    for source in sources {
        let payloads = match upstream.fetch_farmers(source).await {
            Some(payloads) if !payloads.is_empty() => payloads,
            _ => {
                warn!(source = %source.name, "no farmer data; skipping source");
                fetched.sources_skipped += 1;
                continue;
            }
        };

        let mut kept = 0usize;
        for payload in payloads {
            if !seen.insert((payload.farmer_id, source.name.clone())) {
                fetched.duplicates_dropped += 1;
                continue;
            }
            fetched.farmers.push(payload.into_new_farmer(&source.name));
            kept += 1;
        }
        info!(source = %source.name, kept, "source processed");
    }

    info!(
        unique = fetched.farmers.len(),
        duplicates_dropped = fetched.duplicates_dropped,
        "farmer fetch finished"
    );
    fetched
}

pub async fn store_all(datastore: &Datastore, fetched: FetchedFarmers) -> StageReport {
    let mut report = StageReport::new(STAGE);
    store_into(datastore, fetched, &mut report).await;
    report
}

/// Same as [`store_all`] but accumulates into a caller-owned report, so counts
/// survive when the surrounding future is dropped.
pub async fn store_into(datastore: &Datastore, fetched: FetchedFarmers, report: &mut StageReport) {
    report.duplicates_dropped += fetched.duplicates_dropped;
    for _ in 0..fetched.sources_skipped {
        report.record(StageOutcome::Skipped("source returned no data"));
    }

    let total = fetched.farmers.len();
    for (index, farmer) in fetched.farmers.iter().enumerate() {
        let outcome = match datastore.store_farmer(farmer).await {
            Ok(pk) => {
                info!(
                    farmer_id = farmer.farmer_id,
                    source = %farmer.source_api,
                    id = pk,
                    name = %farmer.farmer_name,
                    "farmer stored"
                );
                report.written += 1;
                StageOutcome::Succeeded
            }
            Err(err) => StageOutcome::Failed(format!(
                "farmer {} ({}): {err}",
                farmer.farmer_id, farmer.source_api
            )),
        };
        report.record(outcome);
        report.log_progress(index + 1, total);
    }
}
