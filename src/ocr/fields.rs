//! The fixed field set we extract from each shipping label.
//!
//! Every field is always present. Fields we could not determine hold the
//! literal string [`UNKNOWN`], never an empty string or `null`.

use std::{collections::BTreeMap, fmt, str::FromStr};

use schemars::JsonSchema;
use serde_json::Map;

use crate::prelude::*;

/// Sentinel used for any field we could not determine.
pub const UNKNOWN: &str = "UNKNOWN";

/// Overall confidence used when a reply contains no positive scores.
pub const DEFAULT_CONFIDENCE: f64 = 0.85;

/// The names of the fields in [`ExtractedFields`], in prompt order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldName {
    BarcodeNumber,
    InternalNumber,
    DistributionCode,
    ShippingDate,
    SenderName,
    SenderAddress,
    SenderPhone,
    SenderEmail,
    RecipientName,
    RecipientAddress,
    RecipientPhone,
    TotalWeight,
    TotalPieces,
    Quantity,
    Price,
    Contents,
    AdditionalInfo,
}

impl FieldName {
    /// Every field, in the order the prompt lists them.
    pub const ALL: [FieldName; 17] = [
        FieldName::BarcodeNumber,
        FieldName::InternalNumber,
        FieldName::DistributionCode,
        FieldName::ShippingDate,
        FieldName::SenderName,
        FieldName::SenderAddress,
        FieldName::SenderPhone,
        FieldName::SenderEmail,
        FieldName::RecipientName,
        FieldName::RecipientAddress,
        FieldName::RecipientPhone,
        FieldName::TotalWeight,
        FieldName::TotalPieces,
        FieldName::Quantity,
        FieldName::Price,
        FieldName::Contents,
        FieldName::AdditionalInfo,
    ];

    /// The JSON key for this field.
    pub fn as_str(self) -> &'static str {
        match self {
            FieldName::BarcodeNumber => "barcodeNumber",
            FieldName::InternalNumber => "internalNumber",
            FieldName::DistributionCode => "distributionCode",
            FieldName::ShippingDate => "shippingDate",
            FieldName::SenderName => "senderName",
            FieldName::SenderAddress => "senderAddress",
            FieldName::SenderPhone => "senderPhone",
            FieldName::SenderEmail => "senderEmail",
            FieldName::RecipientName => "recipientName",
            FieldName::RecipientAddress => "recipientAddress",
            FieldName::RecipientPhone => "recipientPhone",
            FieldName::TotalWeight => "totalWeight",
            FieldName::TotalPieces => "totalPieces",
            FieldName::Quantity => "quantity",
            FieldName::Price => "price",
            FieldName::Contents => "contents",
            FieldName::AdditionalInfo => "additionalInfo",
        }
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        FieldName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| anyhow!("unknown field name: {:?}", s))
    }
}

/// Per-field confidence scores reported by the model, each in `[0, 1]`.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ConfidenceMap(pub BTreeMap<String, f64>);

impl ConfidenceMap {
    /// Build a confidence map from a loosely-typed JSON value.
    ///
    /// Models sometimes return scores as strings, or return `null` for fields
    /// they skipped. We keep anything that looks like a finite number and clamp
    /// it into `[0, 1]`.
    pub fn from_json_value(value: &Value) -> Self {
        let mut scores = BTreeMap::new();
        if let Value::Object(map) = value {
            for (key, score) in map {
                let score = match score {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                if let Some(score) = score.filter(|s| s.is_finite()) {
                    scores.insert(key.to_owned(), score.clamp(0.0, 1.0));
                }
            }
        }
        Self(scores)
    }

    /// Record a score for a field.
    pub fn set(&mut self, field: FieldName, score: f64) {
        self.0.insert(field.as_str().to_owned(), score);
    }

    /// The overall confidence: the mean of all strictly positive scores, or
    /// [`DEFAULT_CONFIDENCE`] if there are none.
    pub fn overall(&self) -> f64 {
        let positive = self.0.values().copied().filter(|s| *s > 0.0);
        let (sum, count) = positive.fold((0.0, 0usize), |(sum, count), s| (sum + s, count + 1));
        if count == 0 {
            DEFAULT_CONFIDENCE
        } else {
            sum / count as f64
        }
    }
}

/// The fields extracted from one shipping label image.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractedFields {
    pub barcode_number: String,
    pub internal_number: String,
    pub distribution_code: String,
    /// `YYYY-MM-DD` once normalized.
    pub shipping_date: String,
    pub sender_name: String,
    pub sender_address: String,
    pub sender_phone: String,
    pub sender_email: String,
    pub recipient_name: String,
    pub recipient_address: String,
    pub recipient_phone: String,
    pub total_weight: String,
    pub total_pieces: String,
    pub quantity: String,
    pub price: String,
    /// Comma-separated `Name*Qty` entries.
    pub contents: String,
    pub additional_info: String,

    /// Per-field confidence scores.
    pub confidence_scores: ConfidenceMap,

    /// The full unstructured text of the label.
    pub raw_text: String,
}

impl Default for ExtractedFields {
    fn default() -> Self {
        Self::unknown(String::new())
    }
}

impl ExtractedFields {
    /// A field set where every field is [`UNKNOWN`].
    pub fn unknown(raw_text: String) -> Self {
        let u = || UNKNOWN.to_owned();
        Self {
            barcode_number: u(),
            internal_number: u(),
            distribution_code: u(),
            shipping_date: u(),
            sender_name: u(),
            sender_address: u(),
            sender_phone: u(),
            sender_email: u(),
            recipient_name: u(),
            recipient_address: u(),
            recipient_phone: u(),
            total_weight: u(),
            total_pieces: u(),
            quantity: u(),
            price: u(),
            contents: u(),
            additional_info: u(),
            confidence_scores: ConfidenceMap::default(),
            raw_text,
        }
    }

    /// Build a field set from a JSON object returned by the model.
    ///
    /// Missing keys, `null` and blank strings become [`UNKNOWN`]. Numbers and
    /// booleans are kept in their string form. Arrays of strings are joined
    /// with `", "`, which is what models tend to do with `contents`.
    pub fn from_json_object(object: &Map<String, Value>) -> Self {
        let raw_text = object
            .get("rawText")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let mut fields = Self::unknown(raw_text);
        for name in FieldName::ALL {
            if let Some(value) = object.get(name.as_str()).and_then(coerce_field_value) {
                fields.set(name, value);
            }
        }
        if let Some(scores) = object.get("confidenceScores") {
            fields.confidence_scores = ConfidenceMap::from_json_value(scores);
        }
        fields
    }

    /// Get a field by name.
    pub fn get(&self, name: FieldName) -> &str {
        match name {
            FieldName::BarcodeNumber => &self.barcode_number,
            FieldName::InternalNumber => &self.internal_number,
            FieldName::DistributionCode => &self.distribution_code,
            FieldName::ShippingDate => &self.shipping_date,
            FieldName::SenderName => &self.sender_name,
            FieldName::SenderAddress => &self.sender_address,
            FieldName::SenderPhone => &self.sender_phone,
            FieldName::SenderEmail => &self.sender_email,
            FieldName::RecipientName => &self.recipient_name,
            FieldName::RecipientAddress => &self.recipient_address,
            FieldName::RecipientPhone => &self.recipient_phone,
            FieldName::TotalWeight => &self.total_weight,
            FieldName::TotalPieces => &self.total_pieces,
            FieldName::Quantity => &self.quantity,
            FieldName::Price => &self.price,
            FieldName::Contents => &self.contents,
            FieldName::AdditionalInfo => &self.additional_info,
        }
    }

    /// Set a field by name. Blank values are stored as [`UNKNOWN`].
    pub fn set(&mut self, name: FieldName, value: impl Into<String>) {
        let mut value = value.into();
        if value.trim().is_empty() {
            value = UNKNOWN.to_owned();
        }
        let slot = match name {
            FieldName::BarcodeNumber => &mut self.barcode_number,
            FieldName::InternalNumber => &mut self.internal_number,
            FieldName::DistributionCode => &mut self.distribution_code,
            FieldName::ShippingDate => &mut self.shipping_date,
            FieldName::SenderName => &mut self.sender_name,
            FieldName::SenderAddress => &mut self.sender_address,
            FieldName::SenderPhone => &mut self.sender_phone,
            FieldName::SenderEmail => &mut self.sender_email,
            FieldName::RecipientName => &mut self.recipient_name,
            FieldName::RecipientAddress => &mut self.recipient_address,
            FieldName::RecipientPhone => &mut self.recipient_phone,
            FieldName::TotalWeight => &mut self.total_weight,
            FieldName::TotalPieces => &mut self.total_pieces,
            FieldName::Quantity => &mut self.quantity,
            FieldName::Price => &mut self.price,
            FieldName::Contents => &mut self.contents,
            FieldName::AdditionalInfo => &mut self.additional_info,
        };
        *slot = value;
    }

    /// Is this field known?
    pub fn is_known(&self, name: FieldName) -> bool {
        is_known(self.get(name))
    }

    /// The fields which are still [`UNKNOWN`].
    pub fn unknown_fields(&self) -> Vec<FieldName> {
        FieldName::ALL
            .into_iter()
            .filter(|name| !self.is_known(*name))
            .collect()
    }

    /// Rewrite `shippingDate` as `YYYY-MM-DD` if it looks like a `DD-MM-YY`
    /// date. See [`normalize_shipping_date`].
    pub fn normalize_shipping_date(&mut self) {
        if self.is_known(FieldName::ShippingDate) {
            self.shipping_date = normalize_shipping_date(&self.shipping_date);
        }
    }
}

/// Is `value` a real value rather than the [`UNKNOWN`] sentinel?
pub fn is_known(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty() && value != UNKNOWN
}

/// Convert a loosely-typed JSON field value to a string.
fn coerce_field_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.trim().to_owned()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => {
            let parts = items
                .iter()
                .filter_map(coerce_field_value)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>();
            Some(parts.join(", "))
        }
        Value::Object(_) => Some(value.to_string()),
    }
}

/// Normalize a shipping date to `YYYY-MM-DD`.
///
/// Dates which split into three numeric `-`-separated segments are rewritten.
/// If the first segment is a 4-digit year in `[1900, 2100]`, the date is kept
/// in year-first order and only padded. Otherwise it is read as `DD-MM-YY`,
/// and a 2-digit year is expanded with a pivot: `> 50` means 1900s, `<= 50`
/// means 2000s. Anything else is returned unchanged.
///
/// Applying this to an already-normalized date is a no-op.
pub fn normalize_shipping_date(date: &str) -> String {
    let trimmed = date.trim();
    let parts = trimmed.split('-').collect::<Vec<_>>();
    if parts.len() != 3
        || parts
            .iter()
            .any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()))
    {
        return trimmed.to_owned();
    }

    let plausible_year = parts[0].len() == 4
        && parts[0]
            .parse::<u32>()
            .map(|y| (1900..=2100).contains(&y))
            .unwrap_or(false);
    let (year, month, day) = if plausible_year {
        (parts[0].to_owned(), parts[1], parts[2])
    } else {
        let year = match parts[2].len() {
            4 => parts[2].to_owned(),
            _ => {
                let yy = parts[2].parse::<u32>().unwrap_or(0) % 100;
                let century = if yy > 50 { 19 } else { 20 };
                format!("{century}{yy:02}")
            }
        };
        (year, parts[1], parts[0])
    };
    format!("{year}-{month:0>2}-{day:0>2}")
}
