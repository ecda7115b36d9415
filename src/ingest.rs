use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde_json::Value;

use crate::models::{ClinicalRow, IdentifierRow};

pub fn read_identifier_csv(path: &Path) -> Result<Vec<IdentifierRow>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    parse_identifier_csv(file)
}

pub fn parse_identifier_csv<R: Read>(reader: R) -> Result<Vec<IdentifierRow>> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut rows = Vec::new();
    for record in reader.deserialize::<HashMap<String, String>>() {
        let record = record.context("malformed csv record")?;
        rows.push(identifier_row(|key| cell(&record, key)));
    }
    Ok(rows)
}

pub fn read_identifier_json(path: &Path) -> Result<Vec<IdentifierRow>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    parse_identifier_json(file)
}

pub fn parse_identifier_json<R: Read>(reader: R) -> Result<Vec<IdentifierRow>> {
    let records: Vec<serde_json::Map<String, Value>> =
        serde_json::from_reader(reader).context("expected a json array of objects")?;
    Ok(records
        .iter()
        .map(|object| identifier_row(|key| json_cell(object, key)))
        .collect())
}

pub fn read_clinical_csv(path: &Path) -> Result<Vec<ClinicalRow>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    parse_clinical_csv(file)
}

pub fn parse_clinical_csv<R: Read>(reader: R) -> Result<Vec<ClinicalRow>> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut rows = Vec::new();
    for record in reader.deserialize::<HashMap<String, String>>() {
        let record = record.context("malformed csv record")?;
        rows.push(clinical_row(|key| cell(&record, key)));
    }
    Ok(rows)
}

pub fn read_clinical_json(path: &Path) -> Result<Vec<ClinicalRow>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    parse_clinical_json(file)
}

pub fn parse_clinical_json<R: Read>(reader: R) -> Result<Vec<ClinicalRow>> {
    let records: Vec<serde_json::Map<String, Value>> =
        serde_json::from_reader(reader).context("expected a json array of objects")?;
    Ok(records
        .iter()
        .map(|object| clinical_row(|key| json_cell(object, key)))
        .collect())
}

fn identifier_row(field: impl Fn(&str) -> Option<String>) -> IdentifierRow {
    IdentifierRow {
        study_id: field("study_id"),
        study_name: field("study_name"),
        study_center: field("study_center"),
        study_group: field("study_group"),
        sex: field("sex"),
        age: field("age"),
        genotype_data_available: field("genotype_data_available"),
        nod2_mutation_present: field("nod2_mutation_present"),
        il23r_mutation_present: field("il23r_mutation_present"),
    }
}

fn clinical_row(field: impl Fn(&str) -> Option<String>) -> ClinicalRow {
    ClinicalRow {
        study_id: field("study_id"),
        sample_date: field("sample_date"),
        music_timepoint: field("music_timepoint"),
        crp: field("crp"),
        calprotectin: field("calprotectin"),
        endoscopic_mucosal_healing_at_3_6_months: field("endoscopic_mucosal_healing_at_3_6_months"),
        endoscopic_mucosal_healing_at_12_months: field("endoscopic_mucosal_healing_at_12_months"),
    }
}

// Absent columns and empty (or whitespace-only) cells both come out as None,
// which the reconciler treats as "not supplied", never "clear this field".
fn cell(record: &HashMap<String, String>, key: &str) -> Option<String> {
    let value = record.get(key)?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn json_cell(object: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::Null => None,
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        other => {
            tracing::warn!(%key, ?other, "ignoring non-scalar json value");
            None
        }
    }
}

// "42.0" style values are accepted and truncated; anything else fails the row.
pub(crate) fn coerce_age(raw: &str) -> Result<i64> {
    let trimmed = raw.trim();
    if let Ok(value) = trimmed.parse::<i64>() {
        return Ok(value);
    }
    if let Ok(value) = trimmed.parse::<f64>() {
        if value.is_finite() {
            return Ok(value as i64);
        }
    }
    bail!("cannot coerce {raw:?} to an age")
}

// Unrecognized spellings are false, like a missing flag.
pub(crate) fn coerce_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "true" | "t" | "yes" | "y" | "1"
    )
}

pub(crate) fn coerce_number(raw: &str) -> Result<f64> {
    raw.trim()
        .parse::<f64>()
        .with_context(|| format!("cannot coerce {raw:?} to a number"))
}

pub(crate) fn coerce_date(raw: &str) -> Result<NaiveDate> {
    let trimmed = raw.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%d/%m/%Y"))
        .with_context(|| format!("cannot coerce {raw:?} to a date"))
}
