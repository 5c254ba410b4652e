//! Read-only country/region reference data.
//!
//! The identity subsystem itself only consumes this as a lookup interface
//! (a visitor's billing country lives in metadata as an id or ISO code).
//! The table is built once by the host at startup from whatever source it
//! ships (a bundled JSON file, a database table) and injected where
//! needed. There is deliberately no global static: process-wide lifetime is
//! the host's explicit choice, not a hidden `static mut`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One country record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryRecord {
    pub id: u32,
    /// ISO 3166-1 alpha-2, uppercase.
    pub iso_code: String,
    pub name: String,
    /// ISO 4217 currency code.
    pub currency_code: String,
    /// Whether region-level data (states, provinces) exists for it.
    pub has_regions: bool,
}

impl CountryRecord {
    /// Build a record from raw field values, e.g. freshly deserialized
    /// fixture data. The one unambiguous construction path: no guessing
    /// whether a bare argument meant an id or a code.
    pub fn from_new_data(
        id: u32,
        iso_code: impl Into<String>,
        name: impl Into<String>,
        currency_code: impl Into<String>,
        has_regions: bool,
    ) -> Self {
        Self {
            id,
            iso_code: iso_code.into().to_uppercase(),
            name: name.into(),
            currency_code: currency_code.into(),
            has_regions,
        }
    }
}

/// Immutable lookup table over country records.
pub struct CountryTable {
    records: Vec<CountryRecord>,
    by_id: HashMap<u32, usize>,
    by_code: HashMap<String, usize>,
}

impl CountryTable {
    /// Build the table. Later duplicates of an id or code shadow earlier
    /// ones, matching "last write wins" reference-data refreshes.
    pub fn new(records: Vec<CountryRecord>) -> Self {
        let mut by_id = HashMap::with_capacity(records.len());
        let mut by_code = HashMap::with_capacity(records.len());
        for (idx, record) in records.iter().enumerate() {
            by_id.insert(record.id, idx);
            by_code.insert(record.iso_code.clone(), idx);
        }
        Self {
            records,
            by_id,
            by_code,
        }
    }

    /// Look up by numeric id.
    pub fn from_id(&self, id: u32) -> Option<&CountryRecord> {
        self.by_id.get(&id).map(|&idx| &self.records[idx])
    }

    /// Look up by ISO code, case-insensitive.
    pub fn from_code(&self, code: &str) -> Option<&CountryRecord> {
        self.by_code
            .get(&code.to_uppercase())
            .map(|&idx| &self.records[idx])
    }

    /// Convenience lookup taking either form: an all-digit key is treated
    /// as an id, anything else as an ISO code.
    pub fn lookup(&self, id_or_code: &str) -> Option<&CountryRecord> {
        if !id_or_code.is_empty() && id_or_code.bytes().all(|b| b.is_ascii_digit()) {
            self.from_id(id_or_code.parse().ok()?)
        } else {
            self.from_code(id_or_code)
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
