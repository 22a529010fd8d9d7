//! Core domain model for FLR: farmers, land records, bank details, and the
//! upstream account-number cipher.

use std::ops::AddAssign;

use aes::Aes128;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "flr-core";

/// Farmer as received from one source API, ready to be inserted.
///
/// Area fields stay free text because the upstream mixes numeric and textual
/// encodings for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFarmer {
    pub farmer_id: i64,
    pub farmer_name: String,
    pub father_name: String,
    pub grandfather_name: String,
    pub district_name: String,
    pub city_name: String,
    pub village_name: String,
    pub owner_area: Option<String>,
    pub final_owner_area: Option<String>,
    pub update_owner_area: Option<String>,
    pub aadhar_number: Option<String>,
    pub mobile_number: Option<String>,
    pub owner_type: i64,
    pub verify_status: String,
    pub auction: i64,
    pub source_api: String,
}

/// One land mapping row. The three area conventions (`kanal/marle/sarsai`,
/// `land_owner_area_*`, `kanal1/marle1/sarsai1`) are stored as sent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NewLandRecord {
    pub upstream_id: Option<i64>,
    pub sr_no: Option<String>,
    pub owner_id: Option<i64>,
    pub owner_name: String,
    pub revenue_village_id: Option<i64>,
    pub village_name: String,
    pub city_name: String,
    pub district_name: String,
    pub area_type: String,
    pub owner_area: String,
    pub land_owner_area_k: Option<f64>,
    pub land_owner_area_m: Option<f64>,
    pub land_owner_area_sarsai: Option<f64>,
    pub owner_type: Option<String>,
    pub khewat_no: String,
    pub khasra_no: String,
    pub period: String,
    pub land_type: Option<String>,
    pub kanal: Option<f64>,
    pub marle: Option<f64>,
    pub sarsai: Option<f64>,
    pub mapped_area: Option<f64>,
    pub license_id: Option<i64>,
    pub verify_status: Option<i64>,
    pub kanal1: Option<f64>,
    pub marle1: Option<f64>,
    pub sarsai1: Option<f64>,
    pub commodity_id: Option<i64>,
    pub min_land: Option<f64>,
    pub auction: i64,
}

/// Bank detail for one farmer. Only the ciphertext is ever persisted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NewBankDetail {
    pub bank_id: Option<i64>,
    pub account_holder_name: String,
    pub account_no_encrypted: String,
    pub ifsc_code: String,
    pub branch_name: String,
}

/// A persisted farmer row as seen by the per-farmer ingestion stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmerKey {
    /// Surrogate row id; land and bank rows link here.
    pub id: i64,
    /// External id, only unique within `source_api`.
    pub farmer_id: i64,
    pub source_api: String,
}

pub const MARLE_PER_KANAL: f64 = 20.0;
pub const SARSAI_PER_MARLA: f64 = 9.0;
pub const SARSAI_PER_ACRE: f64 = 1440.0;

/// Running total of a kanal/marla/sarsai measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LandArea {
    pub kanal: f64,
    pub marle: f64,
    pub sarsai: f64,
}

impl LandArea {
    pub fn new(kanal: f64, marle: f64, sarsai: f64) -> Self {
        Self {
            kanal,
            marle,
            sarsai,
        }
    }

    pub fn total_sarsai(&self) -> f64 {
        self.kanal * MARLE_PER_KANAL * SARSAI_PER_MARLA + self.marle * SARSAI_PER_MARLA + self.sarsai
    }

    pub fn to_acres(&self) -> f64 {
        self.total_sarsai() / SARSAI_PER_ACRE
    }
}

impl AddAssign for LandArea {
    fn add_assign(&mut self, rhs: Self) {
        self.kanal += rhs.kanal;
        self.marle += rhs.marle;
        self.sarsai += rhs.sarsai;
    }
}

/// AES-128 key shared with the upstream's browser-side encryption code.
///
/// This is a publicly known static key and must be treated as obfuscation, not
/// protection. It exists only so stored account numbers can be read back.
pub const ACCOUNT_NO_KEY: [u8; 16] = *b"8080808080808080";
/// Static CBC IV paired with [`ACCOUNT_NO_KEY`].
pub const ACCOUNT_NO_IV: [u8; 16] = *b"8080808080808080";

const AES_BLOCK_LEN: usize = 16;

type AccountNoEncryptor = cbc::Encryptor<Aes128>;
type AccountNoDecryptor = cbc::Decryptor<Aes128>;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("ciphertext length {0} is not a positive multiple of the block size")]
    BlockSize(usize),
    #[error("invalid PKCS#7 padding")]
    Padding,
    #[error("plaintext is not utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Encrypt an account number the way the upstream client does.
pub fn encrypt_account_no(plaintext: &str) -> String {
    let ciphertext = AccountNoEncryptor::new(&ACCOUNT_NO_KEY.into(), &ACCOUNT_NO_IV.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    STANDARD.encode(ciphertext)
}

pub fn try_decrypt_account_no(ciphertext: &str) -> Result<String, CipherError> {
    let bytes = STANDARD.decode(ciphertext.trim())?;
    if bytes.is_empty() || bytes.len() % AES_BLOCK_LEN != 0 {
        return Err(CipherError::BlockSize(bytes.len()));
    }
    let plaintext = AccountNoDecryptor::new(&ACCOUNT_NO_KEY.into(), &ACCOUNT_NO_IV.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&bytes)
        .map_err(|_| CipherError::Padding)?;
    Ok(String::from_utf8(plaintext)?)
}

/// Decrypt a base64 account number. Failures are logged and yield `None`.
pub fn decrypt_account_no(ciphertext: &str) -> Option<String> {
    match try_decrypt_account_no(ciphertext) {
        Ok(plaintext) => Some(plaintext),
        Err(err) => {
            warn!(error = %err, "failed to decrypt account number");
            None
        }
    }
}
