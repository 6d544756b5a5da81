//! Attribute join: merges a keyed table onto the county geometries.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::types::{AttrValue, AttributeRow, AttributeTable, FeatureCollection};

/// Which rows survive the join.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Features whose key is present on both sides.
    #[default]
    Inner,
    /// Every feature; unmatched features get `Missing` values.
    Left,
    /// Every feature, plus table rows without geometry returned as orphans.
    Outer,
}

/// What to do when the attribute table repeats a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKeys {
    #[default]
    Error,
    KeepFirst,
    KeepLast,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JoinOptions {
    pub policy: JoinPolicy,
    pub duplicates: DuplicateKeys,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinReport {
    pub matched: usize,
    /// Keys of features with no attribute row.
    pub unmatched_features: Vec<String>,
    /// Keys of attribute rows with no geometry.
    pub unmatched_rows: Vec<String>,
    /// Keys repeated in the attribute table.
    pub duplicate_keys: Vec<String>,
}

impl JoinReport {
    /// Number of features removed from the map by the join.
    pub fn dropped_features(&self, policy: JoinPolicy) -> usize {
        match policy {
            JoinPolicy::Inner => self.unmatched_features.len(),
            JoinPolicy::Left | JoinPolicy::Outer => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Joined {
    pub collection: FeatureCollection,
    pub report: JoinReport,
    /// Table rows without geometry; only filled under `JoinPolicy::Outer`.
    pub orphan_rows: Vec<AttributeRow>,
}

pub fn join(
    collection: FeatureCollection,
    table: AttributeTable,
    options: &JoinOptions,
) -> Result<Joined, PipelineError> {
    let columns = table.columns.clone();
    let rows = index_rows(table, options.duplicates)?;
    let mut report = JoinReport { duplicate_keys: rows.duplicates, ..JoinReport::default() };
    let mut by_key = rows.by_key;

    let mut seen: HashSet<String> = HashSet::with_capacity(collection.len());
    let mut features = Vec::with_capacity(collection.len());
    for mut county in collection.features {
        if !seen.insert(county.id.clone()) {
            return Err(PipelineError::DuplicateKey { key: county.id, source_name: "geometry source".into() });
        }
        match by_key.remove(&county.id) {
            Some(row) => {
                county.attributes.extend(row.values);
                report.matched += 1;
                features.push(county);
            }
            None => {
                report.unmatched_features.push(county.id.clone());
                if options.policy != JoinPolicy::Inner {
                    for column in &columns {
                        county.attributes.entry(column.clone()).or_insert(AttrValue::Missing);
                    }
                    features.push(county);
                }
            }
        }
    }

    // Remaining rows had no geometry; keep table order for the report.
    let mut orphan_rows = Vec::new();
    for key in rows.order {
        if let Some(row) = by_key.remove(&key) {
            report.unmatched_rows.push(key);
            if options.policy == JoinPolicy::Outer {
                orphan_rows.push(row);
            }
        }
    }

    info!(
        matched = report.matched,
        features = features.len(),
        policy = ?options.policy,
        "joined attributes onto geometry"
    );
    if !report.unmatched_features.is_empty() {
        warn!(
            count = report.unmatched_features.len(),
            dropped = report.dropped_features(options.policy),
            "features without attribute rows"
        );
    }
    if !report.unmatched_rows.is_empty() {
        warn!(count = report.unmatched_rows.len(), "attribute rows without geometry");
    }
    if !report.duplicate_keys.is_empty() {
        warn!(count = report.duplicate_keys.len(), policy = ?options.duplicates, "duplicate attribute keys");
    }

    Ok(Joined { collection: FeatureCollection::new(features), report, orphan_rows })
}

struct IndexedRows {
    by_key: HashMap<String, AttributeRow>,
    order: Vec<String>,
    duplicates: Vec<String>,
}

fn index_rows(table: AttributeTable, policy: DuplicateKeys) -> Result<IndexedRows, PipelineError> {
    let mut by_key: HashMap<String, AttributeRow> = HashMap::with_capacity(table.rows.len());
    let mut order = Vec::with_capacity(table.rows.len());
    let mut duplicates = BTreeSet::new();

    for row in table.rows {
        if by_key.contains_key(&row.key) {
            match policy {
                DuplicateKeys::Error => {
                    return Err(PipelineError::DuplicateKey { key: row.key, source_name: "attribute table".into() });
                }
                DuplicateKeys::KeepFirst => {
                    duplicates.insert(row.key);
                }
                DuplicateKeys::KeepLast => {
                    duplicates.insert(row.key.clone());
                    by_key.insert(row.key.clone(), row);
                }
            }
            continue;
        }
        order.push(row.key.clone());
        by_key.insert(row.key.clone(), row);
    }

    Ok(IndexedRows { by_key, order, duplicates: duplicates.into_iter().collect() })
}
