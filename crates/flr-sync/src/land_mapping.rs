//! Land-mapping stage: one single-attempt fetch and one bulk insert per farmer.

use flr_adapters::UpstreamApi;
use flr_core::{FarmerKey, NewLandRecord};
use flr_storage::Datastore;
use tracing::info;

use crate::{persisted_farmers, StageOutcome, StageReport};

pub const STAGE: &str = "lands";

pub async fn process_all(datastore: &Datastore, upstream: &dyn UpstreamApi) -> StageReport {
    let mut report = StageReport::new(STAGE);
    process_into(datastore, upstream, &mut report).await;
    report
}

pub async fn process_into(
    datastore: &Datastore,
    upstream: &dyn UpstreamApi,
    report: &mut StageReport,
) {
    let farmers = persisted_farmers(datastore, report).await;
    let total = farmers.len();
    for (index, farmer) in farmers.iter().enumerate() {
        let outcome = process_farmer(datastore, upstream, farmer, report).await;
        report.record(outcome);
        report.log_progress(index + 1, total);
    }
}

async fn process_farmer(
    datastore: &Datastore,
    upstream: &dyn UpstreamApi,
    farmer: &FarmerKey,
    report: &mut StageReport,
) -> StageOutcome {
    let payloads = match upstream.fetch_land_mapping(farmer.farmer_id).await {
        Ok(Some(payloads)) if !payloads.is_empty() => payloads,
        Ok(_) => return StageOutcome::Skipped("no land mapping data"),
        Err(err) => {
            return StageOutcome::Failed(format!(
                "land mapping for farmer {}: {err}",
                farmer.farmer_id
            ))
        }
    };

    let records = payloads.into_iter().map(NewLandRecord::from).collect::<Vec<_>>();
    match datastore.store_land_records_bulk(&records, farmer.id).await {
        Ok(count) => {
            info!(farmer_id = farmer.farmer_id, id = farmer.id, count, "land records stored");
            report.written += count;
            StageOutcome::Succeeded
        }
        Err(err) => StageOutcome::Failed(format!(
            "saving land records for farmer {}: {err}",
            farmer.farmer_id
        )),
    }
}
