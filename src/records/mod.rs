//! Persisted shipping records.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use schemars::JsonSchema;
use uuid::Uuid;

use crate::{contents::ContentItem, ocr::fields::ConfidenceMap, prelude::*};

pub mod assemble;
pub mod store;

/// Who sent the shipment.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Sender {
    pub name: String,
    pub address: String,
    pub phone: String,
    /// Lower-cased.
    pub email: String,
}

/// Who receives the shipment.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Recipient {
    pub name: String,
    pub address: String,
    pub phone: String,
}

/// Tracking identifiers. Unknown values are kept as the literal `UNKNOWN`.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tracking {
    pub barcode_number: String,
    pub internal_number: String,
    pub distribution_code: String,
    /// Every known barcode number for this shipment.
    #[serde(default)]
    pub barcode_numbers: Vec<String>,
    /// Every known internal number for this shipment.
    #[serde(default)]
    pub internal_numbers: Vec<String>,
}

/// Dates and totals. Values we could not parse are absent.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_date: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub total_weight: Option<Decimal>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_pieces: Option<u32>,

    /// Number of distinct content items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,

    /// Total price of the contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub price: Option<Decimal>,
}

/// What kind of invoice a record belongs on.
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvoiceType {
    #[default]
    IndividualInvoice,
    BusinessInvoice,
}

/// A shipping record, as saved.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingRecord {
    /// The client this shipment belongs to.
    pub client_name: String,

    pub sender: Sender,
    pub recipient: Recipient,
    pub tracking: Tracking,
    pub additional: AdditionalDetails,

    /// Line items. Never empty in a saved record.
    pub contents: Vec<ContentItem>,

    /// Order type information, like `Dropship Order, Normal`.
    pub additional_info: String,

    #[serde(default)]
    pub invoice_type: InvoiceType,

    /// Per-field model confidence for the image this record came from.
    #[serde(default)]
    pub confidence_scores: ConfidenceMap,

    /// Where the label image was stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,

    /// Every image stored so far in the batch this record was saved with.
    #[serde(default)]
    pub cumulative_image_urls: Vec<String>,
}

/// A [`ShippingRecord`] plus the metadata the store assigns.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    #[schemars(with = "String")]
    pub id: Uuid,

    #[schemars(with = "String")]
    pub created_at: DateTime<Utc>,

    #[schemars(with = "String")]
    pub updated_at: DateTime<Utc>,

    #[serde(flatten)]
    pub record: ShippingRecord,
}
