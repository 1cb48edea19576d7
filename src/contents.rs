//! Itemized shipment contents.
//!
//! Labels list contents as `"Name*Qty, Name*Qty, ..."`. A shipment may be
//! photographed several times, so we merge the lists from all its images by
//! normalized item name, summing quantities.

use std::collections::HashMap;

use rust_decimal::Decimal;
use schemars::JsonSchema;

use crate::{
    ocr::{
        fallback::{PAREN_QTY, TRAILING_QTY},
        fields::is_known,
    },
    prelude::*,
};

/// The unit price we use when we don't know better: 0.01.
pub fn placeholder_price() -> Decimal {
    Decimal::new(1, 2)
}

/// One line of a shipment's contents.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct ContentItem {
    /// The item name. Never empty.
    pub name: String,
    /// How many. Always at least 1.
    pub qty: u32,
    /// Unit price, serialized as a decimal string like `"0.01"`.
    #[schemars(with = "String")]
    pub price: Decimal,
}

impl ContentItem {
    /// The total price of this line.
    pub fn line_total(&self) -> Decimal {
        Decimal::from(self.qty) * self.price
    }
}

/// Parse a leading integer the way labels tend to write them: `"3"`,
/// `" 3 pcs"`. Zero and non-numbers give `None`.
fn parse_leading_qty(s: &str) -> Option<u32> {
    let s = s.trim();
    let digits = s
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, c)| &s[..i + c.len_utf8()])?;
    digits.parse::<u32>().ok().filter(|qty| *qty > 0)
}

/// Split a `Name*Qty` entry. A missing or unreadable quantity is 1.
fn split_entry(entry: &str) -> (&str, u32) {
    let mut parts = entry.trim().splitn(2, '*');
    let name = parts.next().unwrap_or_default().trim();
    let qty = parts.next().and_then(parse_leading_qty).unwrap_or(1);
    (name, qty)
}

/// Parse one entry for aggregation.
///
/// The name is lower-cased and trimmed. A trailing bare number (`"socks 3"`)
/// or parenthesized number (`"socks (3)"`) replaces the quantity and is
/// stripped from the name. Returns `None` if the name ends up empty.
pub fn parse_aggregate_entry(entry: &str) -> Option<ContentItem> {
    let (name, mut qty) = split_entry(entry);
    let mut name = name.to_lowercase().trim().to_owned();
    let explicit = TRAILING_QTY
        .captures(&name)
        .or_else(|| PAREN_QTY.captures(&name))
        .map(|caps| (caps[1].trim().to_owned(), parse_leading_qty(&caps[2])));
    if let Some((stripped, explicit_qty)) = explicit {
        name = stripped;
        qty = explicit_qty.unwrap_or(qty);
    }
    if name.is_empty() {
        return None;
    }
    Some(ContentItem {
        name,
        qty,
        price: placeholder_price(),
    })
}

/// Parse a label's contents into record line items.
///
/// Unlike [`parse_aggregate_entry`], names keep their case. Every item gets
/// `unit_price`. Entries with empty names are skipped with a warning.
pub fn parse_record_items(contents: &str, unit_price: Decimal) -> Vec<ContentItem> {
    if !is_known(contents) {
        return vec![];
    }
    contents
        .split(',')
        .filter_map(|entry| {
            let (name, qty) = split_entry(entry);
            if name.is_empty() {
                if !entry.trim().is_empty() {
                    warn!(entry = %entry.trim(), "Skipping content item with no name");
                }
                return None;
            }
            Some(ContentItem {
                name: name.to_owned(),
                qty,
                price: unit_price,
            })
        })
        .collect()
}

/// Merges contents lists by normalized item name.
///
/// Items are kept in first-seen order.
#[derive(Clone, Debug, Default)]
pub struct ContentAggregator {
    items: Vec<ContentItem>,
    index: HashMap<String, usize>,
}

impl ContentAggregator {
    /// Create an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single item.
    pub fn add_item(&mut self, item: ContentItem) {
        match self.index.get(&item.name) {
            Some(&i) => self.items[i].qty += item.qty,
            None => {
                self.index.insert(item.name.clone(), self.items.len());
                self.items.push(item);
            }
        }
    }

    /// Add every entry of a `"Name*Qty, ..."` contents string. `UNKNOWN` and
    /// blank strings add nothing.
    pub fn add_contents(&mut self, contents: &str) {
        if !is_known(contents) {
            return;
        }
        for item in contents.split(',').filter_map(parse_aggregate_entry) {
            self.add_item(item);
        }
    }

    /// Consume the aggregator, returning the merged items.
    pub fn finish(self) -> Vec<ContentItem> {
        self.items
    }
}

/// Aggregate several contents strings into one item list.
pub fn aggregate_contents<'a>(contents: impl IntoIterator<Item = &'a str>) -> Vec<ContentItem> {
    let mut aggregator = ContentAggregator::new();
    for c in contents {
        aggregator.add_contents(c);
    }
    aggregator.finish()
}
