//! Upstream source table, wire payloads, and the `UpstreamApi` seam.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use flr_core::{NewBankDetail, NewFarmer, NewLandRecord};
use flr_storage::{FetchError, HttpFetcher};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "flr-adapters";

pub use flr_storage::UPSTREAM_ORIGIN;
pub const FARMER_DETAIL_BASE_URL: &str = "https://apifarmerlandmapping.emandikaran-pb.in/api/EMandiKaranIntegrationApi/getFarmerDetailWithLicense";
pub const MAPPING_DETAIL_BASE_URL: &str = "https://apifarmerlandmapping.emandikaran-pb.in/api/EMandiKaranIntegrationApi/getFarmermappingDetail";
pub const PAYMENT_OPTIONS_BASE_URL: &str = "https://farmerregistrationapi.anaajkharid.in/api/FarmerRegistrationApi/GetFarmerPaymentOptionsDetails";

/// Source name and its license path under [`FARMER_DETAIL_BASE_URL`].
const BUILTIN_SOURCES: &[(&str, &str)] = &[
    ("PNC", "159/20185"),
    ("PM", "159/20186"),
    ("ATC", "159/8030"),
    ("BTC", "159/120637"),
    ("STC-RPP", "159/20181"),
    ("STC-BHU", "61/20174"),
];

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEndpoint {
    pub name: String,
    pub url: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl SourceEndpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEndpoint>,
}

impl SourceRegistry {
    pub fn builtin() -> Self {
        Self {
            sources: BUILTIN_SOURCES
                .iter()
                .map(|(name, license)| {
                    SourceEndpoint::new(*name, format!("{FARMER_DETAIL_BASE_URL}/{license}"))
                })
                .collect(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry yaml")
    }

    /// Built-in table unless an override file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::builtin());
        };
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Enabled sources in table order.
    pub fn enabled(&self) -> Vec<SourceEndpoint> {
        self.sources.iter().filter(|s| s.enabled).cloned().collect()
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// `{ "success": .., "responseData": .. }` wrapper shared by every endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(rename = "responseData", default)]
    pub response_data: Option<JsonValue>,
}

impl ApiEnvelope {
    pub fn from_value(value: JsonValue) -> Option<Self> {
        match serde_json::from_value(value) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                warn!(error = %err, "response is not an api envelope");
                None
            }
        }
    }

    /// Payload only when `success` is true and data is present.
    pub fn into_payload(self) -> Option<JsonValue> {
        if self.success != Some(true) {
            return None;
        }
        self.response_data.filter(|data| !data.is_null())
    }
}

/// Tolerant scalar decoding: upstream sends numbers as strings and back.
mod lenient {
    use super::*;

    pub fn as_i64(value: &JsonValue) -> Option<i64> {
        match value {
            JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            JsonValue::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
            }
            JsonValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_f64(value: &JsonValue) -> Option<f64> {
        match value {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_string(value: &JsonValue) -> Option<String> {
        match value {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn i64_required<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        let value = JsonValue::deserialize(d)?;
        as_i64(&value).ok_or_else(|| serde::de::Error::custom(format!("expected an integer, got {value}")))
    }

    pub fn i64_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        Ok(Option::<JsonValue>::deserialize(d)?.as_ref().and_then(as_i64))
    }

    pub fn f64_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(Option::<JsonValue>::deserialize(d)?.as_ref().and_then(as_f64))
    }

    pub fn string_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(Option::<JsonValue>::deserialize(d)?.as_ref().and_then(as_string))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FarmerPayload {
    #[serde(rename = "FarmerId", deserialize_with = "lenient::i64_required")]
    pub farmer_id: i64,
    #[serde(rename = "FarmerName", default, deserialize_with = "lenient::string_opt")]
    pub farmer_name: Option<String>,
    #[serde(rename = "FatherName", default, deserialize_with = "lenient::string_opt")]
    pub father_name: Option<String>,
    #[serde(rename = "GrandFatherName", default, deserialize_with = "lenient::string_opt")]
    pub grandfather_name: Option<String>,
    #[serde(rename = "DistrictName", default, deserialize_with = "lenient::string_opt")]
    pub district_name: Option<String>,
    #[serde(rename = "CityName", default, deserialize_with = "lenient::string_opt")]
    pub city_name: Option<String>,
    #[serde(rename = "VillageName", default, deserialize_with = "lenient::string_opt")]
    pub village_name: Option<String>,
    #[serde(rename = "Owner_Area", default, deserialize_with = "lenient::string_opt")]
    pub owner_area: Option<String>,
    #[serde(rename = "finalOwner_Area", default, deserialize_with = "lenient::string_opt")]
    pub final_owner_area: Option<String>,
    #[serde(rename = "updateOwner_Area", default, deserialize_with = "lenient::string_opt")]
    pub update_owner_area: Option<String>,
    #[serde(rename = "AadharNumber", default, deserialize_with = "lenient::string_opt")]
    pub aadhar_number: Option<String>,
    #[serde(rename = "MobileNumber", default, deserialize_with = "lenient::string_opt")]
    pub mobile_number: Option<String>,
    #[serde(rename = "ownertype", default, deserialize_with = "lenient::i64_opt")]
    pub owner_type: Option<i64>,
    #[serde(rename = "verifystatus", default, deserialize_with = "lenient::string_opt")]
    pub verify_status: Option<String>,
    #[serde(rename = "auction", default, deserialize_with = "lenient::i64_opt")]
    pub auction: Option<i64>,
}

impl FarmerPayload {
    pub fn into_new_farmer(self, source_api: &str) -> NewFarmer {
        NewFarmer {
            farmer_id: self.farmer_id,
            farmer_name: self.farmer_name.unwrap_or_default(),
            father_name: self.father_name.unwrap_or_default(),
            grandfather_name: self.grandfather_name.unwrap_or_default(),
            district_name: self.district_name.unwrap_or_default(),
            city_name: self.city_name.unwrap_or_default(),
            village_name: self.village_name.unwrap_or_default(),
            owner_area: self.owner_area,
            final_owner_area: self.final_owner_area,
            update_owner_area: self.update_owner_area,
            aadhar_number: self.aadhar_number,
            mobile_number: self.mobile_number,
            owner_type: self.owner_type.unwrap_or(0),
            verify_status: self
                .verify_status
                .map(|s| s.to_lowercase())
                .unwrap_or_else(|| "false".to_string()),
            auction: self.auction.unwrap_or(0),
            source_api: source_api.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LandPayload {
    #[serde(rename = "Id", default, deserialize_with = "lenient::i64_opt")]
    pub id: Option<i64>,
    #[serde(rename = "Srno", default, deserialize_with = "lenient::string_opt")]
    pub sr_no: Option<String>,
    #[serde(rename = "OwnerId", default, deserialize_with = "lenient::i64_opt")]
    pub owner_id: Option<i64>,
    #[serde(rename = "OwnerName", default, deserialize_with = "lenient::string_opt")]
    pub owner_name: Option<String>,
    #[serde(rename = "Revenue_VillageId", default, deserialize_with = "lenient::i64_opt")]
    pub revenue_village_id: Option<i64>,
    #[serde(rename = "VillageName", default, deserialize_with = "lenient::string_opt")]
    pub village_name: Option<String>,
    #[serde(rename = "CityName", default, deserialize_with = "lenient::string_opt")]
    pub city_name: Option<String>,
    #[serde(rename = "DistrictName", default, deserialize_with = "lenient::string_opt")]
    pub district_name: Option<String>,
    #[serde(rename = "AreaType", default, deserialize_with = "lenient::string_opt")]
    pub area_type: Option<String>,
    #[serde(rename = "Owner_Area", default, deserialize_with = "lenient::string_opt")]
    pub owner_area: Option<String>,
    #[serde(rename = "LandOwner_Area_K", default, deserialize_with = "lenient::f64_opt")]
    pub land_owner_area_k: Option<f64>,
    #[serde(rename = "LandOwner_Area_M", default, deserialize_with = "lenient::f64_opt")]
    pub land_owner_area_m: Option<f64>,
    #[serde(rename = "LandOwner_Area_Sarsai", default, deserialize_with = "lenient::f64_opt")]
    pub land_owner_area_sarsai: Option<f64>,
    #[serde(rename = "ownertype", default, deserialize_with = "lenient::string_opt")]
    pub owner_type: Option<String>,
    #[serde(rename = "Khewat_No", default, deserialize_with = "lenient::string_opt")]
    pub khewat_no: Option<String>,
    #[serde(rename = "Khasra_No", default, deserialize_with = "lenient::string_opt")]
    pub khasra_no: Option<String>,
    #[serde(rename = "period", default, deserialize_with = "lenient::string_opt")]
    pub period: Option<String>,
    #[serde(rename = "Type", default, deserialize_with = "lenient::string_opt")]
    pub land_type: Option<String>,
    #[serde(rename = "Kanal", default, deserialize_with = "lenient::f64_opt")]
    pub kanal: Option<f64>,
    #[serde(rename = "Marle", default, deserialize_with = "lenient::f64_opt")]
    pub marle: Option<f64>,
    #[serde(rename = "Sarsai", default, deserialize_with = "lenient::f64_opt")]
    pub sarsai: Option<f64>,
    #[serde(rename = "Mappedarea", default, deserialize_with = "lenient::f64_opt")]
    pub mapped_area: Option<f64>,
    #[serde(rename = "LicenseId", default, deserialize_with = "lenient::i64_opt")]
    pub license_id: Option<i64>,
    #[serde(rename = "VerifyStatus", default, deserialize_with = "lenient::i64_opt")]
    pub verify_status: Option<i64>,
    #[serde(rename = "Kanal1", default, deserialize_with = "lenient::f64_opt")]
    pub kanal1: Option<f64>,
    #[serde(rename = "Marle1", default, deserialize_with = "lenient::f64_opt")]
    pub marle1: Option<f64>,
    #[serde(rename = "Sarsai1", default, deserialize_with = "lenient::f64_opt")]
    pub sarsai1: Option<f64>,
    #[serde(rename = "CommodityId", default, deserialize_with = "lenient::i64_opt")]
    pub commodity_id: Option<i64>,
    #[serde(rename = "minland", default, deserialize_with = "lenient::f64_opt")]
    pub min_land: Option<f64>,
    #[serde(rename = "auction", default, deserialize_with = "lenient::i64_opt")]
    pub auction: Option<i64>,
}

impl From<LandPayload> for NewLandRecord {
    fn from(p: LandPayload) -> Self {
        Self {
            upstream_id: p.id,
            sr_no: p.sr_no,
            owner_id: p.owner_id,
            owner_name: p.owner_name.unwrap_or_default(),
            revenue_village_id: p.revenue_village_id,
            village_name: p.village_name.unwrap_or_default(),
            city_name: p.city_name.unwrap_or_default(),
            district_name: p.district_name.unwrap_or_default(),
            area_type: p.area_type.unwrap_or_default(),
            owner_area: p.owner_area.unwrap_or_default(),
            land_owner_area_k: p.land_owner_area_k,
            land_owner_area_m: p.land_owner_area_m,
            land_owner_area_sarsai: p.land_owner_area_sarsai,
            owner_type: p.owner_type,
            khewat_no: p.khewat_no.unwrap_or_default(),
            khasra_no: p.khasra_no.unwrap_or_default(),
            period: p.period.unwrap_or_default(),
            land_type: p.land_type,
            kanal: p.kanal,
            marle: p.marle,
            sarsai: p.sarsai,
            mapped_area: p.mapped_area,
            license_id: p.license_id,
            verify_status: p.verify_status,
            kanal1: p.kanal1,
            marle1: p.marle1,
            sarsai1: p.sarsai1,
            commodity_id: p.commodity_id,
            min_land: p.min_land,
            auction: p.auction.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BankPayload {
    #[serde(rename = "BankId", default, deserialize_with = "lenient::i64_opt")]
    pub bank_id: Option<i64>,
    #[serde(rename = "AccountHolderName", default, deserialize_with = "lenient::string_opt")]
    pub account_holder_name: Option<String>,
    /// Base64 ciphertext, stored as received.
    #[serde(rename = "AccountNo", default, deserialize_with = "lenient::string_opt")]
    pub account_no: Option<String>,
    #[serde(rename = "IFSCCode", default, deserialize_with = "lenient::string_opt")]
    pub ifsc_code: Option<String>,
    #[serde(rename = "BranchName", default, deserialize_with = "lenient::string_opt")]
    pub branch_name: Option<String>,
}

impl From<BankPayload> for NewBankDetail {
    fn from(p: BankPayload) -> Self {
        Self {
            bank_id: p.bank_id,
            account_holder_name: p.account_holder_name.unwrap_or_default(),
            account_no_encrypted: p.account_no.unwrap_or_default(),
            ifsc_code: p.ifsc_code.unwrap_or_default(),
            branch_name: p.branch_name.unwrap_or_default(),
        }
    }
}

/// Decode each element of a list payload on its own, dropping the ones that
/// do not fit `T`. A single object counts as a one-element list.
fn decode_records<T: DeserializeOwned>(payload: JsonValue, kind: &'static str) -> Option<Vec<T>> {
    let items = match payload {
        JsonValue::Array(items) => items,
        object @ JsonValue::Object(_) => vec![object],
        other => {
            warn!(kind, payload = %other, "unexpected payload shape");
            return None;
        }
    };
    let mut records = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<T>(item) {
            Ok(record) => records.push(record),
            Err(err) => warn!(kind, index, error = %err, "skipping malformed record"),
        }
    }
    Some(records)
}

pub fn parse_farmers(response: JsonValue) -> Option<Vec<FarmerPayload>> {
    let payload = ApiEnvelope::from_value(response)?.into_payload()?;
    decode_records(payload, "farmer")
}

pub fn parse_land_records(response: JsonValue) -> Option<Vec<LandPayload>> {
    let payload = ApiEnvelope::from_value(response)?.into_payload()?;
    decode_records(payload, "land")
}

/// Bank payloads come either as an object or as a list; the first entry wins.
pub fn parse_bank_detail(response: JsonValue) -> Option<BankPayload> {
    let payload = ApiEnvelope::from_value(response)?.into_payload()?;
    decode_records::<BankPayload>(payload, "bank")?.into_iter().next()
}

/// Everything the ingestion stages need from the outside world.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// All farmer records of one source; `None` when the source had no usable data.
    async fn fetch_farmers(&self, source: &SourceEndpoint) -> Option<Vec<FarmerPayload>>;

    /// Land mapping for an external farmer id. Transport failure is an error;
    /// a well-formed "no data" answer is `Ok(None)`.
    async fn fetch_land_mapping(
        &self,
        farmer_id: i64,
    ) -> Result<Option<Vec<LandPayload>>, AdapterError>;

    async fn fetch_bank_details(&self, farmer_id: i64) -> Option<BankPayload>;
}

#[derive(Debug, Clone)]
pub struct UpstreamEndpoints {
    pub mapping_base_url: String,
    pub payment_options_base_url: String,
    pub mapping_timeout: Duration,
}

impl Default for UpstreamEndpoints {
    fn default() -> Self {
        Self {
            mapping_base_url: MAPPING_DETAIL_BASE_URL.to_string(),
            payment_options_base_url: PAYMENT_OPTIONS_BASE_URL.to_string(),
            mapping_timeout: Duration::from_secs(30),
        }
    }
}

fn id_url(base: &str, farmer_id: i64) -> String {
    format!("{}/{farmer_id}", base.trim_end_matches('/'))
}

/// [`UpstreamApi`] over real HTTP.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    fetcher: HttpFetcher,
    endpoints: UpstreamEndpoints,
}

impl HttpUpstream {
    pub fn new(fetcher: HttpFetcher, endpoints: UpstreamEndpoints) -> Self {
        Self { fetcher, endpoints }
    }
}

#[async_trait]
impl UpstreamApi for HttpUpstream {
    async fn fetch_farmers(&self, source: &SourceEndpoint) -> Option<Vec<FarmerPayload>> {
        info!(source = %source.name, url = %source.url, "fetching farmers");
        let response = self.fetcher.fetch_json(&source.url).await?;
        let farmers = parse_farmers(response);
        match &farmers {
            Some(list) => info!(source = %source.name, count = list.len(), "farmers received"),
            None => warn!(source = %source.name, "source returned no farmer data"),
        }
        farmers
    }

    async fn fetch_land_mapping(
        &self,
        farmer_id: i64,
    ) -> Result<Option<Vec<LandPayload>>, AdapterError> {
        let url = id_url(&self.endpoints.mapping_base_url, farmer_id);
        let response = self
            .fetcher
            .fetch_once_with_timeout(&url, self.endpoints.mapping_timeout)
            .await?;
        Ok(parse_land_records(response))
    }

    async fn fetch_bank_details(&self, farmer_id: i64) -> Option<BankPayload> {
        let url = id_url(&self.endpoints.payment_options_base_url, farmer_id);
        parse_bank_detail(self.fetcher.fetch_json(&url).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flr_storage::{BackoffPolicy, HttpClientConfig};
    use serde_json::json;

    #[test]
    fn builtin_registry_lists_six_sources_in_order() {
        let registry = SourceRegistry::builtin();
        let names = registry.sources.iter().map(|s| s.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["PNC", "PM", "ATC", "BTC", "STC-RPP", "STC-BHU"]);
        assert!(registry.sources[5].url.ends_with("getFarmerDetailWithLicense/61/20174"));
        assert_eq!(registry.enabled().len(), 6);
    }

    #[test]
    fn yaml_override_respects_enabled_flag() {
        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - name: PNC
    url: http://localhost:9000/pnc
  - name: PM
    url: http://localhost:9000/pm
    enabled: false
"#,
        )
        .expect("yaml");
        let enabled = registry.enabled();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "PNC");
    }

    #[test]
    fn registry_load_reads_override_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sources.yaml");
        fs::write(&path, "sources:\n  - name: ATC\n    url: http://x/atc\n").expect("write");
        let registry = SourceRegistry::load(Some(path.as_path())).expect("load");
        assert_eq!(registry.sources, vec![SourceEndpoint::new("ATC", "http://x/atc")]);
        assert_eq!(SourceRegistry::load(None).expect("builtin"), SourceRegistry::builtin());
        assert!(SourceRegistry::load(Some(dir.path().join("missing.yaml").as_path())).is_err());
    }

    #[test]
    fn envelope_requires_success_and_payload() {
        assert!(parse_farmers(json!({"success": false, "responseData": [{"FarmerId": 1}]})).is_none());
        assert!(parse_farmers(json!({"success": true})).is_none());
        assert!(parse_farmers(json!({"responseData": [{"FarmerId": 1}]})).is_none());
        assert!(parse_farmers(json!({"success": true, "responseData": null})).is_none());
        assert!(parse_farmers(json!(["not", "an", "envelope"])).is_none());
        assert_eq!(
            parse_farmers(json!({"success": true, "responseData": []})).map(|v| v.len()),
            Some(0)
        );
    }

    #[test]
    fn farmer_payload_tolerates_string_numbers_and_skips_bad_rows() {
        let farmers = parse_farmers(json!({
            "success": true,
            "responseData": [
                {"FarmerId": "100", "FarmerName": "Gurpreet", "ownertype": "2", "verifystatus": true, "MobileNumber": 9814000001u64},
                {"FarmerName": "no id"},
                {"FarmerId": 101, "auction": 1}
            ]
        }))
        .expect("payload");
        assert_eq!(farmers.len(), 2);

        let first = farmers[0].clone().into_new_farmer("PNC");
        assert_eq!(first.farmer_id, 100);
        assert_eq!(first.owner_type, 2);
        assert_eq!(first.verify_status, "true");
        assert_eq!(first.mobile_number.as_deref(), Some("9814000001"));
        assert_eq!(first.source_api, "PNC");

        let second = farmers[1].clone().into_new_farmer("PM");
        assert_eq!(second.farmer_name, "");
        assert_eq!(second.verify_status, "false");
        assert_eq!(second.auction, 1);
    }

    #[test]
    fn land_payload_maps_every_area_convention() {
        let lands = parse_land_records(json!({
            "success": true,
            "responseData": [{
                "Id": 9, "Srno": 3, "OwnerName": "Harjit", "Kanal": "4", "Marle": 10.5, "Sarsai": null,
                "LandOwner_Area_K": 1, "Kanal1": "2", "Type": "Owned", "minland": "0.5", "VerifyStatus": "1"
            }]
        }))
        .expect("payload");
        let record = NewLandRecord::from(lands[0].clone());
        assert_eq!(record.upstream_id, Some(9));
        assert_eq!(record.sr_no.as_deref(), Some("3"));
        assert_eq!(record.kanal, Some(4.0));
        assert_eq!(record.marle, Some(10.5));
        assert_eq!(record.sarsai, None);
        assert_eq!(record.land_owner_area_k, Some(1.0));
        assert_eq!(record.kanal1, Some(2.0));
        assert_eq!(record.land_type.as_deref(), Some("Owned"));
        assert_eq!(record.min_land, Some(0.5));
        assert_eq!(record.verify_status, Some(1));
        assert_eq!(record.khewat_no, "");
    }

    #[test]
    fn bank_payload_accepts_object_or_list() {
        let as_object = parse_bank_detail(json!({
            "success": true,
            "responseData": {"BankId": 4, "AccountNo": "VMuCjezrE0TBj6CpHSDqcw==", "IFSCCode": "PUNB0001"}
        }))
        .expect("object");
        let as_list = parse_bank_detail(json!({
            "success": true,
            "responseData": [{"BankId": "4", "AccountNo": "VMuCjezrE0TBj6CpHSDqcw==", "IFSCCode": "PUNB0001"}]
        }))
        .expect("list");
        assert_eq!(as_object, as_list);

        let detail = NewBankDetail::from(as_object);
        assert_eq!(detail.bank_id, Some(4));
        assert_eq!(detail.account_no_encrypted, "VMuCjezrE0TBj6CpHSDqcw==");
        assert_eq!(detail.branch_name, "");

        assert!(parse_bank_detail(json!({"success": true, "responseData": []})).is_none());
    }

    #[tokio::test]
    async fn http_upstream_reports_unreachable_mapping_as_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let base = format!("http://{}", listener.local_addr().expect("addr"));
        drop(listener);

        let fetcher = HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_attempts: 1,
                base_delay: Duration::ZERO,
                max_jitter: Duration::ZERO,
            },
            ..Default::default()
        })
        .expect("fetcher");
        let upstream = HttpUpstream::new(
            fetcher,
            UpstreamEndpoints {
                mapping_base_url: format!("{base}/mapping/"),
                payment_options_base_url: format!("{base}/payment"),
                mapping_timeout: Duration::from_secs(2),
            },
        );

        assert!(matches!(
            upstream.fetch_land_mapping(100).await,
            Err(AdapterError::Fetch(_))
        ));
        assert!(upstream.fetch_bank_details(100).await.is_none());
        assert!(upstream
            .fetch_farmers(&SourceEndpoint::new("PNC", format!("{base}/farmers")))
            .await
            .is_none());
    }

    #[test]
    fn id_urls_join_without_double_slash() {
        assert_eq!(id_url("http://h/api/", 7), "http://h/api/7");
        assert_eq!(id_url("http://h/api", 7), "http://h/api/7");
    }
}
