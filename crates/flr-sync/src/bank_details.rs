//! Bank-detail stage: fetch payment options and upsert one row per farmer.

use flr_adapters::UpstreamApi;
use flr_core::{FarmerKey, NewBankDetail};
use flr_storage::{BankUpsert, Datastore};
use tracing::info;

use crate::{persisted_farmers, StageOutcome, StageReport};

pub const STAGE: &str = "bank_details";

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
    let Some(payload) = upstream.fetch_bank_details(farmer.farmer_id).await else {
        return StageOutcome::Skipped("no bank details");
    };

    let detail = NewBankDetail::from(payload);
    match datastore.upsert_bank_detail(&detail, farmer.id).await {
        Ok(upsert) => {
            let action = match upsert {
                BankUpsert::Inserted => "added",
                BankUpsert::Updated => "updated",
            };
            info!(farmer_id = farmer.farmer_id, id = farmer.id, action, "bank details saved");
            report.written += 1;
            StageOutcome::Succeeded
        }
        Err(err) => StageOutcome::Failed(format!(
            "saving bank details for farmer {}: {err}",
            farmer.farmer_id
        )),
    }
}
