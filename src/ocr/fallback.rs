//! Heuristic field extraction from raw label text.
//!
//! Used when the model gave us text we could not turn into structured fields.
//! We scan the text line by line against label-anchored patterns. Each match
//! assigns a fixed confidence for its field; these are hand-tuned constants,
//! not computed scores. Later lines win over earlier ones.

use std::sync::LazyLock;

use regex::Regex;

use super::fields::{ExtractedFields, FieldName};
use crate::prelude::*;

/// Compile a regex known at build time.
fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("failed to compile regex")
}

static TRACKING_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| re(r"Tracking Number:\s*(\d+)"));
static LONG_DIGIT_RUN: LazyLock<Regex> = LazyLock::new(|| re(r"\d{12,}"));
static REFERENCE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| re(r"Reference Number:\s*(\w+)"));
static REF_NO: LazyLock<Regex> = LazyLock::new(|| re(r"Ref No\.?\s*:?\s*(\w+)"));
static ORDER_NUMBER: LazyLock<Regex> = LazyLock::new(|| re(r"Order Number:\s*(\w+)"));
static KWT_CODE: LazyLock<Regex> = LazyLock::new(|| re(r"KWT\s*\w+\s*\w+"));
static SHIP_DATE: LazyLock<Regex> =
    LazyLock::new(|| re(r"Ship ?Date:\s*(\d{4}-\d{2}-\d{2})"));
static SHIPPER: LazyLock<Regex> = LazyLock::new(|| re(r"Shipper:\s*([^,]+)"));
static SHEIN_SENDER: LazyLock<Regex> = LazyLock::new(|| re(r"SHEIN-\w+"));
static SHIPPER_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| re(r"Shipper Address:\s*(.+)"));
static PROLOGIS_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| re(r"Prologis.*?(?:CHN|Kuwait)"));
static PHONE: LazyLock<Regex> = LazyLock::new(|| re(r"Phone:\s*(\+?\d+)"));
static CALL: LazyLock<Regex> = LazyLock::new(|| re(r"Call:\s*(\+\d+)"));
static EMAIL: LazyLock<Regex> = LazyLock::new(|| re(r"Email:\s*(\S+@\S+)"));
static RECIPIENT: LazyLock<Regex> = LazyLock::new(|| re(r"Recipient:\s*([^(]+)"));
static ARABIC_NAME: LazyLock<Regex> =
    LazyLock::new(|| re(r"\p{Arabic}+(?:\s+\p{Arabic}+)*"));
static INTL_PHONE: LazyLock<Regex> = LazyLock::new(|| re(r"\+\d+"));
static RECIPIENT_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| re(r"Recipient Address:\s*(.+)"));
static FARWANIYAH_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| re(r"Al Farwaniyah.*?(?:Kuwait|منزل \d+)"));
static GROSS_WEIGHT: LazyLock<Regex> =
    LazyLock::new(|| re(r"Gross Weight[^:]*:\s*([\d.]+)"));
static GW: LazyLock<Regex> = LazyLock::new(|| re(r"(?i)G\.W\.?\s*:?\s*([\d.]+)\s*kg"));
static TOTAL_QUANTITY: LazyLock<Regex> =
    LazyLock::new(|| re(r"Total Quantity:\s*(\d+)"));
static QTY: LazyLock<Regex> = LazyLock::new(|| re(r"Qty\s*:?\s*(\d+)"));
static PRICE_PAID: LazyLock<Regex> =
    LazyLock::new(|| re(r"Price Paid[^:]*:\s*([\d.]+)\s*KWD"));
static PPD: LazyLock<Regex> = LazyLock::new(|| re(r"PPD\s*([\d.]+)\s*\(KWD\)"));
static ITEMS: LazyLock<Regex> = LazyLock::new(|| re(r"Items:\s*(.+)"));
static WOMENS_ITEMS: LazyLock<Regex> =
    LazyLock::new(|| re(r"(Women's.*?\*\d+(?:,\s*Women's.*?\*\d+)*)"));
static ORDER_TYPE: LazyLock<Regex> = LazyLock::new(|| re(r"Order Type:\s*(.+)"));
static DROPSHIP: LazyLock<Regex> = LazyLock::new(|| re(r"Dropship\s*(?:Normal|Kuwait)"));
static CONTACT_LABEL: LazyLock<Regex> = LazyLock::new(|| re(r"(?:Email|Call)\s*:"));

/// An item ending in a bare number, like `Socks 3`.
pub(crate) static TRAILING_QTY: LazyLock<Regex> =
    LazyLock::new(|| re(r"^(.*?)\s+(\d+)$"));
/// An item ending in a parenthesized number, like `Socks (3)`.
pub(crate) static PAREN_QTY: LazyLock<Regex> =
    LazyLock::new(|| re(r"^(.*?)\s*\((\d+)\)$"));

/// A label-anchored rule for a single field.
struct LabelRule {
    /// The field we populate.
    field: FieldName,
    /// The confidence we assign when we find a value.
    confidence: f64,
    /// Patterns to try, in order. We use the first capture group if there is
    /// one, and the whole match otherwise.
    patterns: &'static [&'static LazyLock<Regex>],
}

/// Simple one-value rules, in the order they are applied to each line.
static RULES: &[LabelRule] = &[
    LabelRule {
        field: FieldName::BarcodeNumber,
        confidence: 0.95,
        patterns: &[&TRACKING_NUMBER, &LONG_DIGIT_RUN],
    },
    LabelRule {
        field: FieldName::InternalNumber,
        confidence: 0.9,
        patterns: &[&REFERENCE_NUMBER, &REF_NO],
    },
    LabelRule {
        field: FieldName::DistributionCode,
        confidence: 0.85,
        patterns: &[&ORDER_NUMBER, &KWT_CODE],
    },
    LabelRule {
        field: FieldName::ShippingDate,
        confidence: 0.8,
        patterns: &[&SHIP_DATE],
    },
    LabelRule {
        field: FieldName::SenderName,
        confidence: 0.9,
        patterns: &[&SHIPPER, &SHEIN_SENDER],
    },
    LabelRule {
        field: FieldName::SenderAddress,
        confidence: 0.85,
        patterns: &[&SHIPPER_ADDRESS, &PROLOGIS_ADDRESS],
    },
    LabelRule {
        field: FieldName::SenderPhone,
        confidence: 0.95,
        patterns: &[&PHONE, &CALL],
    },
    LabelRule {
        field: FieldName::SenderEmail,
        confidence: 0.95,
        patterns: &[&EMAIL],
    },
    LabelRule {
        field: FieldName::RecipientAddress,
        confidence: 0.85,
        patterns: &[&RECIPIENT_ADDRESS, &FARWANIYAH_ADDRESS],
    },
    LabelRule {
        field: FieldName::TotalWeight,
        confidence: 0.9,
        patterns: &[&GROSS_WEIGHT, &GW],
    },
    LabelRule {
        field: FieldName::Quantity,
        confidence: 0.85,
        patterns: &[&TOTAL_QUANTITY, &QTY],
    },
    LabelRule {
        field: FieldName::Price,
        confidence: 0.9,
        patterns: &[&PRICE_PAID, &PPD],
    },
];

impl LabelRule {
    /// Find this rule's value in a line, if present.
    fn find<'a>(&self, line: &'a str) -> Option<&'a str> {
        self.patterns.iter().find_map(|pattern| first_capture(pattern, line))
    }
}

/// Return capture group 1 if the regex has one, or the whole match.
fn first_capture<'a>(pattern: &Regex, line: &'a str) -> Option<&'a str> {
    let caps = pattern.captures(line)?;
    let m = caps.get(1).or_else(|| caps.get(0))?;
    let value = m.as_str().trim();
    (!value.is_empty()).then_some(value)
}

/// Extract what we can from raw label text.
///
/// Fields no line matched stay `UNKNOWN` and get no confidence entry.
#[instrument(level = "debug", skip_all)]
pub fn parse_label_text(text: &str) -> ExtractedFields {
    let mut fields = ExtractedFields::unknown(text.to_owned());
    let assign = |fields: &mut ExtractedFields, name: FieldName, value: &str, confidence: f64| {
        fields.set(name, value);
        fields.confidence_scores.set(name, confidence);
    };

    for line in text.lines() {
        for rule in RULES {
            if let Some(value) = rule.find(line) {
                assign(&mut fields, rule.field, value, rule.confidence);
            }
        }

        // Recipient names come from an explicit label or from Arabic script,
        // and phone numbers on the same line belong to the recipient.
        let recipient = first_capture(&RECIPIENT, line)
            .or_else(|| first_capture(&ARABIC_NAME, line));
        if let Some(name) = recipient {
            assign(&mut fields, FieldName::RecipientName, name, 0.9);
            let phones = INTL_PHONE
                .find_iter(line)
                .map(|m| m.as_str())
                .collect::<Vec<_>>();
            if !phones.is_empty() {
                assign(
                    &mut fields,
                    FieldName::RecipientPhone,
                    &phones.join(","),
                    0.95,
                );
            }
        }

        let items = first_capture(&ITEMS, line).or_else(|| first_capture(&WOMENS_ITEMS, line));
        if let Some(items) = items {
            let contents = normalize_item_list(items);
            if !contents.is_empty() {
                assign(&mut fields, FieldName::Contents, &contents, 0.8);
            }
        }

        if !CONTACT_LABEL.is_match(line) {
            let info = first_capture(&ORDER_TYPE, line)
                .or_else(|| first_capture(&DROPSHIP, line));
            if let Some(info) = info {
                assign(&mut fields, FieldName::AdditionalInfo, info, 0.85);
            }
        }
    }

    debug!(
        unknown = fields.unknown_fields().len(),
        "Parsed label text heuristically"
    );
    fields
}

/// Rewrite a raw item list as comma-separated `Name*Qty` entries.
///
/// A trailing bare or parenthesized number is read as the quantity. Items
/// without one get `*1`. Items which already carry `*N` are kept as they are.
fn normalize_item_list(items: &str) -> String {
    items
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            if item.contains('*') {
                item.to_owned()
            } else if let Some(caps) = TRAILING_QTY.captures(item) {
                format!("{}*{}", caps[1].trim(), &caps[2])
            } else if let Some(caps) = PAREN_QTY.captures(item) {
                format!("{}*{}", caps[1].trim(), &caps[2])
            } else {
                format!("{item}*1")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}
