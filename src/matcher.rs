use chrono::NaiveDate;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::db;
use crate::error::MatchError;
use crate::models::{AnnotatedSample, ClinicalData, CohortCategory, Sample};

const CLINICAL_COLUMNS: &str =
    "id, identifier_id, sample_date, music_timepoint, crp, calprotectin, \
     endoscopic_mucosal_healing_at_3_6_months, endoscopic_mucosal_healing_at_12_months";

// The join key depends on the cohort: gidamps and unrecognized cohorts key on
// (identifier, calendar date of collection), the music family on (identifier,
// timepoint). Anything absent means "no match"; only a key matching more than
// one stored row is an error.
pub async fn clinical_data_for_sample(
    pool: &SqlitePool,
    sample: &Sample,
) -> Result<Option<ClinicalData>, MatchError> {
    let Some(identifier_id) = sample.identifier_id else {
        return Ok(None);
    };

    match CohortCategory::from_cohort(&sample.cohort) {
        CohortCategory::Gidamps | CohortCategory::Default => match sample.collected_at {
            Some(collected_at) => fetch_by_date(pool, identifier_id, collected_at.date()).await,
            None => Ok(None),
        },
        CohortCategory::Music => {
            if let Some(timepoint) = &sample.music_timepoint {
                fetch_by_timepoint(pool, identifier_id, timepoint).await
            } else if let Some(collected_at) = sample.collected_at {
                // Music samples without a recorded timepoint fall back to the
                // calendar date. The batch path below has no such fallback.
                fetch_by_date(pool, identifier_id, collected_at.date()).await
            } else {
                Ok(None)
            }
        }
    }
}

async fn fetch_by_date(
    pool: &SqlitePool,
    identifier_id: Uuid,
    date: NaiveDate,
) -> Result<Option<ClinicalData>, MatchError> {
    let query = format!(
        "SELECT {CLINICAL_COLUMNS} FROM clinical_data \
         WHERE identifier_id = ? AND sample_date = ?"
    );
    let rows = sqlx::query(&query)
        .bind(identifier_id.to_string())
        .bind(date)
        .fetch_all(pool)
        .await?;
    exactly_one(rows, identifier_id, format!("sample_date={date}"))
}

async fn fetch_by_timepoint(
    pool: &SqlitePool,
    identifier_id: Uuid,
    timepoint: &str,
) -> Result<Option<ClinicalData>, MatchError> {
    let query = format!(
        "SELECT {CLINICAL_COLUMNS} FROM clinical_data \
         WHERE identifier_id = ? AND music_timepoint = ?"
    );
    let rows = sqlx::query(&query)
        .bind(identifier_id.to_string())
        .bind(timepoint)
        .fetch_all(pool)
        .await?;
    exactly_one(rows, identifier_id, format!("music_timepoint={timepoint}"))
}

fn exactly_one(
    rows: Vec<sqlx::sqlite::SqliteRow>,
    identifier_id: Uuid,
    key: String,
) -> Result<Option<ClinicalData>, MatchError> {
    match rows.len() {
        0 => Ok(None),
        1 => Ok(Some(db::clinical_from_row(&rows[0])?)),
        count => Err(MatchError::MultipleClinicalRows {
            identifier_id,
            key,
            count,
        }),
    }
}

fn date_keyed(field: &str) -> String {
    format!(
        "(SELECT c.{field} FROM clinical_data c \
         WHERE c.identifier_id = s.identifier_id AND c.sample_date = date(s.collected_at))"
    )
}

fn timepoint_keyed(field: &str) -> String {
    format!(
        "(SELECT c.{field} FROM clinical_data c \
         WHERE c.identifier_id = s.identifier_id AND c.music_timepoint = s.music_timepoint)"
    )
}

// Same precedence order as CohortCategory::from_cohort.
fn dispatch_by_category(gidamps: &str, music: &str, default: &str) -> String {
    format!(
        "CASE \
         WHEN instr(lower(s.cohort), 'gidamps') > 0 THEN {gidamps} \
         WHEN instr(lower(s.cohort), 'music') > 0 THEN {music} \
         ELSE {default} END"
    )
}

// One query over all samples: a left join plus one correlated sub-select per
// field and category. The two healing outcomes resolve only for the music
// family, and a music sample without a timepoint gets no date fallback here.
// Both differ from the single-sample path; the divergence is known and kept
// as-is.
pub async fn annotate_samples(
    pool: &SqlitePool,
    cohort: Option<&str>,
) -> Result<Vec<AnnotatedSample>, MatchError> {
    let crp = dispatch_by_category(&date_keyed("crp"), &timepoint_keyed("crp"), &date_keyed("crp"));
    let calprotectin = dispatch_by_category(
        &date_keyed("calprotectin"),
        &timepoint_keyed("calprotectin"),
        &date_keyed("calprotectin"),
    );
    let healing_3_6 = dispatch_by_category(
        "NULL",
        &timepoint_keyed("endoscopic_mucosal_healing_at_3_6_months"),
        "NULL",
    );
    let healing_12 = dispatch_by_category(
        "NULL",
        &timepoint_keyed("endoscopic_mucosal_healing_at_12_months"),
        "NULL",
    );

    let mut query = format!(
        "SELECT s.sample_id, s.cohort, s.collected_at, s.music_timepoint, \
         i.name AS identifier_name, \
         {crp} AS crp, \
         {calprotectin} AS calprotectin, \
         {healing_3_6} AS endoscopic_mucosal_healing_at_3_6_months, \
         {healing_12} AS endoscopic_mucosal_healing_at_12_months \
         FROM samples s \
         LEFT JOIN study_identifiers i ON i.id = s.identifier_id"
    );
    if cohort.is_some() {
        query.push_str(" WHERE instr(lower(s.cohort), lower(?)) > 0");
    }
    query.push_str(" ORDER BY s.sample_id");

    let mut fetch = sqlx::query(&query);
    if let Some(value) = cohort {
        fetch = fetch.bind(value);
    }
    let rows = fetch.fetch_all(pool).await?;
    debug!(samples = rows.len(), "annotated sample batch");

    Ok(rows
        .iter()
        .map(|row| AnnotatedSample {
            sample_id: row.get("sample_id"),
            cohort: row.get("cohort"),
            identifier_name: row.get("identifier_name"),
            collected_at: row.get("collected_at"),
            music_timepoint: row.get("music_timepoint"),
            crp: row.get("crp"),
            calprotectin: row.get("calprotectin"),
            endoscopic_mucosal_healing_at_3_6_months: row
                .get("endoscopic_mucosal_healing_at_3_6_months"),
            endoscopic_mucosal_healing_at_12_months: row
                .get("endoscopic_mucosal_healing_at_12_months"),
        })
        .collect())
}
