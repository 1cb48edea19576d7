//! Mapping extracted fields onto a [`ShippingRecord`], and checking the result.

use std::fmt;

use rust_decimal::Decimal;
use schemars::JsonSchema;

use super::{
    AdditionalDetails, InvoiceType, Recipient, Sender, ShippingRecord, Tracking,
};
use crate::{
    contents::{ContentItem, parse_record_items, placeholder_price},
    ocr::fields::{ExtractedFields, UNKNOWN, is_known},
    prelude::*,
};

/// The client name we record when none is configured.
pub const DEFAULT_CLIENT_NAME: &str = "default-client";

/// The item we record when a label's contents could not be read.
pub const UNKNOWN_ITEM_NAME: &str = "Unknown Item";

/// Where the image behind a record was stored.
#[derive(Clone, Debug, Default)]
pub struct ImageUrls {
    /// This record's own image.
    pub image_url: Option<String>,
    /// Every image stored so far in this batch.
    pub cumulative: Vec<String>,
}

/// A trimmed field value, or `UNKNOWN`.
fn text_or_unknown(value: &str) -> String {
    if is_known(value) {
        value.trim().to_owned()
    } else {
        UNKNOWN.to_owned()
    }
}

/// Parse a leading decimal number, ignoring any units after it:
/// `"1.25 kg"` is 1.25. Zero and unparseable values are `None`.
pub fn parse_leading_decimal(value: &str) -> Option<Decimal> {
    let value = value.trim();
    let end = value
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
        .map(|(i, _)| i)
        .unwrap_or(value.len());
    value[..end]
        .parse::<Decimal>()
        .ok()
        .filter(|d| *d > Decimal::ZERO)
}

/// Parse a leading whole number. Zero and unparseable values are `None`.
pub fn parse_leading_count(value: &str) -> Option<u32> {
    let value = value.trim();
    let end = value
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(value.len());
    value[..end].parse::<u32>().ok().filter(|n| *n > 0)
}

/// Build a record from one image's extracted fields.
///
/// Tracking fields keep `UNKNOWN` as a literal value, while numbers we can't
/// parse are left out. Totals the label doesn't state are derived from the
/// contents. Unreadable contents become a single placeholder item.
#[instrument(level = "debug", skip_all)]
pub fn assemble_record(fields: &ExtractedFields, urls: ImageUrls) -> ShippingRecord {
    let stated_price = parse_leading_decimal(&fields.price);
    let unit_price = stated_price.unwrap_or_else(placeholder_price);
    let contents = if is_known(&fields.contents) {
        parse_record_items(&fields.contents, unit_price)
    } else {
        vec![ContentItem {
            name: UNKNOWN_ITEM_NAME.to_owned(),
            qty: 1,
            price: placeholder_price(),
        }]
    };

    let barcode_number = text_or_unknown(&fields.barcode_number);
    let internal_number = text_or_unknown(&fields.internal_number);
    let known_list = |value: &str| {
        if value == UNKNOWN {
            vec![]
        } else {
            vec![value.to_owned()]
        }
    };

    let email = text_or_unknown(&fields.sender_email);
    let email = if email == UNKNOWN {
        email
    } else {
        email.to_lowercase()
    };

    let additional = AdditionalDetails {
        shipping_date: is_known(&fields.shipping_date)
            .then(|| fields.shipping_date.trim().to_owned()),
        total_weight: parse_leading_decimal(&fields.total_weight),
        total_pieces: parse_leading_count(&fields.total_pieces)
            .or_else(|| Some(contents.iter().map(|item| item.qty).sum())),
        quantity: parse_leading_count(&fields.quantity)
            .or_else(|| u32::try_from(contents.len()).ok()),
        price: stated_price
            .or_else(|| Some(contents.iter().map(ContentItem::line_total).sum())),
    };

    ShippingRecord {
        client_name: DEFAULT_CLIENT_NAME.to_owned(),
        sender: Sender {
            name: text_or_unknown(&fields.sender_name),
            address: text_or_unknown(&fields.sender_address),
            phone: text_or_unknown(&fields.sender_phone),
            email,
        },
        recipient: Recipient {
            name: text_or_unknown(&fields.recipient_name),
            address: text_or_unknown(&fields.recipient_address),
            phone: text_or_unknown(&fields.recipient_phone),
        },
        tracking: Tracking {
            barcode_numbers: known_list(&barcode_number),
            internal_numbers: known_list(&internal_number),
            barcode_number,
            internal_number,
            distribution_code: text_or_unknown(&fields.distribution_code),
        },
        additional,
        contents,
        additional_info: text_or_unknown(&fields.additional_info),
        invoice_type: InvoiceType::IndividualInvoice,
        confidence_scores: fields.confidence_scores.clone(),
        image_url: urls.image_url,
        cumulative_image_urls: urls.cumulative,
    }
}

/// One problem with one field.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    /// Dotted path to the field, like `additional.quantity`.
    pub field: String,
    pub message: String,
}

impl FieldIssue {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_owned(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// A record which must not be saved.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid record: {}", display_issues(.issues))]
pub struct ValidationError {
    pub issues: Vec<FieldIssue>,
}

fn display_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(|issue| issue.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Check a record before saving it.
///
/// Returns non-fatal warnings on success. Totals which disagree with the
/// contents are reported, not corrected.
pub fn validate_record(record: &ShippingRecord) -> Result<Vec<FieldIssue>, ValidationError> {
    let mut errors = vec![];
    let mut warnings = vec![];

    if record.contents.is_empty() {
        errors.push(FieldIssue::new("contents", "at least one item is required"));
    }
    for (i, item) in record.contents.iter().enumerate() {
        if item.name.trim().is_empty() {
            errors.push(FieldIssue::new(&format!("contents[{i}].name"), "must not be empty"));
        }
        if item.qty == 0 {
            errors.push(FieldIssue::new(&format!("contents[{i}].qty"), "must be at least 1"));
        }
        if item.price < placeholder_price() {
            errors.push(FieldIssue::new(
                &format!("contents[{i}].price"),
                "must be at least 0.01",
            ));
        }
    }
    if !errors.is_empty() {
        return Err(ValidationError { issues: errors });
    }

    let item_count = record.contents.len();
    let piece_count = record.contents.iter().map(|item| u64::from(item.qty)).sum::<u64>();
    if let Some(quantity) = record.additional.quantity {
        if quantity as usize != item_count {
            warnings.push(FieldIssue::new(
                "additional.quantity",
                format!("{quantity} does not match the {item_count} content item(s)"),
            ));
        }
    }
    if let Some(pieces) = record.additional.total_pieces {
        if u64::from(pieces) != piece_count {
            warnings.push(FieldIssue::new(
                "additional.totalPieces",
                format!("{pieces} does not match the {piece_count} piece(s) in contents"),
            ));
        }
    }
    if record.tracking.barcode_number == UNKNOWN {
        warnings.push(FieldIssue::new("tracking.barcodeNumber", "is UNKNOWN"));
    }
    if record.tracking.internal_number == UNKNOWN {
        warnings.push(FieldIssue::new("tracking.internalNumber", "is UNKNOWN"));
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::fields::FieldName;

    fn fields(pairs: &[(FieldName, &str)]) -> ExtractedFields {
        let mut fields = ExtractedFields::unknown(String::new());
        for (name, value) in pairs {
            fields.set(*name, *value);
        }
        fields
    }

    #[test]
    fn derives_totals_from_contents() {
        let f = fields(&[
            (FieldName::BarcodeNumber, " 123456789012 "),
            (FieldName::SenderEmail, "Shop@Example.COM"),
            (FieldName::Contents, "Shirt*2, Hat*3"),
            (FieldName::TotalWeight, "1.5 kg"),
        ]);
        let record = assemble_record(&f, ImageUrls::default());
        assert_eq!(record.client_name, DEFAULT_CLIENT_NAME);
        assert_eq!(record.tracking.barcode_number, "123456789012");
        assert_eq!(record.tracking.barcode_numbers, ["123456789012"]);
        assert_eq!(record.tracking.internal_number, UNKNOWN);
        assert!(record.tracking.internal_numbers.is_empty());
        assert_eq!(record.sender.email, "shop@example.com");
        assert_eq!(record.sender.name, UNKNOWN);
        assert_eq!(record.additional.total_pieces, Some(5));
        assert_eq!(record.additional.quantity, Some(2));
        assert_eq!(record.additional.price, Some(Decimal::new(5, 2)));
        assert_eq!(record.additional.total_weight, Some(Decimal::new(15, 1)));
        assert_eq!(record.additional.shipping_date, None);
        assert_eq!(record.invoice_type, InvoiceType::IndividualInvoice);
    }

    #[test]
    fn unknown_contents_become_placeholder() {
        let record = assemble_record(&fields(&[]), ImageUrls::default());
        assert_eq!(record.contents.len(), 1);
        assert_eq!(record.contents[0].name, UNKNOWN_ITEM_NAME);
        assert_eq!(record.contents[0].price, placeholder_price());
        assert_eq!(record.additional.total_pieces, Some(1));
    }

    #[test]
    fn stated_totals_are_kept_and_flagged() {
        let f = fields(&[
            (FieldName::Contents, "Shirt*2"),
            (FieldName::Quantity, "3"),
            (FieldName::TotalPieces, "2"),
            (FieldName::Price, "12.5"),
            (FieldName::BarcodeNumber, "1"),
            (FieldName::InternalNumber, "2"),
        ]);
        let record = assemble_record(&f, ImageUrls::default());
        assert_eq!(record.additional.quantity, Some(3));
        assert_eq!(record.additional.price, Some(Decimal::new(125, 1)));
        assert_eq!(record.contents[0].price, Decimal::new(125, 1));
        let warnings = validate_record(&record).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "additional.quantity");
    }

    #[test]
    fn empty_contents_are_rejected() {
        let f = fields(&[(FieldName::Contents, "*2, ")]);
        let record = assemble_record(&f, ImageUrls::default());
        assert!(record.contents.is_empty());
        let err = validate_record(&record).unwrap_err();
        assert_eq!(err.issues[0].field, "contents");
        assert!(err.to_string().contains("at least one item"));
    }

    #[test]
    fn image_urls_are_recorded() {
        let urls = ImageUrls {
            image_url: Some("file:///tmp/a.jpg".to_owned()),
            cumulative: vec!["file:///tmp/a.jpg".to_owned()],
        };
        let record = assemble_record(&fields(&[(FieldName::Contents, "x*1")]), urls);
        assert_eq!(record.image_url.as_deref(), Some("file:///tmp/a.jpg"));
        assert_eq!(record.cumulative_image_urls.len(), 1);
    }

    #[test]
    fn leading_numbers() {
        assert_eq!(parse_leading_decimal("12.500 KWD"), Some(Decimal::new(12500, 3)));
        assert_eq!(parse_leading_decimal("0"), None);
        assert_eq!(parse_leading_decimal("kg"), None);
        assert_eq!(parse_leading_count("3 pcs"), Some(3));
        assert_eq!(parse_leading_count(UNKNOWN), None);
    }
}
