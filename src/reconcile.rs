use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::NaiveDate;
use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db;
use crate::ingest::{coerce_age, coerce_date, coerce_flag, coerce_number};
use crate::models::{ClinicalData, ClinicalRow, IdentifierRow, ReconcileOutcome, StudyIdentifier};

const ALIAS_SUFFIXES: [&str; 2] = ["-P", "-HC"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handle {
    Stored(usize),
    Pending(usize),
}

fn normalize_study_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_uppercase())
    }
}

// One pass over stored identifiers, in insertion order. Exact names always
// register; a stripped-suffix alias only claims its base name when nothing
// has claimed it yet, so the first record wins a contested alias and an exact
// name beats an alias.
fn build_alias_map(existing: &[StudyIdentifier]) -> HashMap<String, Handle> {
    let mut lookup = HashMap::new();
    for (idx, ident) in existing.iter().enumerate() {
        lookup.insert(ident.name.clone(), Handle::Stored(idx));
        for suffix in ALIAS_SUFFIXES {
            if let Some(base) = ident.name.strip_suffix(suffix) {
                lookup
                    .entry(base.to_string())
                    .or_insert(Handle::Stored(idx));
            }
        }
    }
    lookup
}

fn stage_text(current: &mut Option<String>, incoming: &Option<String>, changed: &mut bool) {
    if let Some(value) = incoming {
        if current.as_deref() != Some(value.as_str()) {
            *current = Some(value.clone());
            *changed = true;
        }
    }
}

fn stage_flag(current: &mut bool, incoming: &Option<String>, changed: &mut bool) {
    if let Some(raw) = incoming {
        let flag = coerce_flag(raw);
        if *current != flag {
            *current = flag;
            *changed = true;
        }
    }
}

// A value that will not coerce fails the whole row before any of it is kept;
// callers work on a clone.
fn apply_row(candidate: &mut StudyIdentifier, row: &IdentifierRow) -> Result<bool> {
    let mut changed = false;
    stage_text(&mut candidate.study_name, &row.study_name, &mut changed);
    stage_text(&mut candidate.study_center, &row.study_center, &mut changed);
    stage_text(&mut candidate.study_group, &row.study_group, &mut changed);
    stage_text(&mut candidate.sex, &row.sex, &mut changed);
    if let Some(raw) = &row.age {
        let age = Some(coerce_age(raw)?);
        if candidate.age != age {
            candidate.age = age;
            changed = true;
        }
    }
    stage_flag(
        &mut candidate.genotype_data_available,
        &row.genotype_data_available,
        &mut changed,
    );
    stage_flag(
        &mut candidate.nod2_mutation_present,
        &row.nod2_mutation_present,
        &mut changed,
    );
    stage_flag(
        &mut candidate.il23r_mutation_present,
        &row.il23r_mutation_present,
        &mut changed,
    );
    Ok(changed)
}

fn new_identifier(name: String, row: &IdentifierRow) -> Result<StudyIdentifier> {
    let age = match &row.age {
        Some(raw) => Some(coerce_age(raw)?),
        None => None,
    };
    Ok(StudyIdentifier {
        id: Uuid::new_v4(),
        name,
        study_name: row.study_name.clone(),
        study_center: row.study_center.clone(),
        study_group: row.study_group.clone(),
        sex: row.sex.clone(),
        age,
        genotype_data_available: row.genotype_data_available.as_deref().is_some_and(coerce_flag),
        nod2_mutation_present: row.nod2_mutation_present.as_deref().is_some_and(coerce_flag),
        il23r_mutation_present: row.il23r_mutation_present.as_deref().is_some_and(coerce_flag),
    })
}

// Blank keys count toward `total` only. A key queued earlier in the same
// batch merges instead of inserting twice. Every update and the batch insert
// commit in one transaction.
pub async fn reconcile_identifiers(
    pool: &SqlitePool,
    rows: &[IdentifierRow],
) -> Result<ReconcileOutcome> {
    let mut existing = db::fetch_identifiers(pool).await?;
    let mut lookup = build_alias_map(&existing);
    let mut pending: Vec<StudyIdentifier> = Vec::new();
    let mut dirty: HashSet<usize> = HashSet::new();
    let mut dirty_order: Vec<usize> = Vec::new();
    let mut outcome = ReconcileOutcome {
        total: rows.len(),
        ..Default::default()
    };

    for row in rows {
        let Some(key) = row.study_id.as_deref().and_then(normalize_study_id) else {
            continue;
        };

        match lookup.get(&key).copied() {
            Some(Handle::Stored(idx)) => {
                let mut candidate = existing[idx].clone();
                match apply_row(&mut candidate, row) {
                    Ok(true) => {
                        existing[idx] = candidate;
                        if dirty.insert(idx) {
                            dirty_order.push(idx);
                        }
                        outcome.updated += 1;
                    }
                    Ok(false) => outcome.skipped += 1,
                    Err(err) => {
                        warn!(study_id = %key, error = %err, "skipping identifier row");
                        outcome.skipped += 1;
                    }
                }
            }
            Some(Handle::Pending(idx)) => {
                let mut candidate = pending[idx].clone();
                match apply_row(&mut candidate, row) {
                    Ok(true) => {
                        pending[idx] = candidate;
                        outcome.updated += 1;
                    }
                    Ok(false) => outcome.skipped += 1,
                    Err(err) => {
                        warn!(study_id = %key, error = %err, "skipping identifier row");
                        outcome.skipped += 1;
                    }
                }
            }
            None => match new_identifier(key.clone(), row) {
                Ok(record) => {
                    lookup.insert(key, Handle::Pending(pending.len()));
                    pending.push(record);
                }
                Err(err) => {
                    warn!(study_id = %key, error = %err, "skipping identifier row");
                    outcome.skipped += 1;
                }
            },
        }
    }

    let mut tx = pool.begin().await?;
    for idx in dirty_order {
        db::update_identifier(&mut *tx, &existing[idx]).await?;
    }
    db::bulk_insert_identifiers(&mut *tx, &pending).await?;
    tx.commit().await?;

    outcome.created = pending.len();
    debug!(
        total = outcome.total,
        created = outcome.created,
        updated = outcome.updated,
        skipped = outcome.skipped,
        "identifier reconciliation finished"
    );
    Ok(outcome)
}

enum JoinKey {
    Date(NaiveDate),
    Timepoint(String),
}

fn stage_number(current: &mut Option<f64>, incoming: &Option<String>, changed: &mut bool) -> Result<()> {
    if let Some(raw) = incoming {
        let value = Some(coerce_number(raw)?);
        if *current != value {
            *current = value;
            *changed = true;
        }
    }
    Ok(())
}

fn stage_nullable_flag(current: &mut Option<bool>, incoming: &Option<String>, changed: &mut bool) {
    if let Some(raw) = incoming {
        let value = Some(coerce_flag(raw));
        if *current != value {
            *current = value;
            *changed = true;
        }
    }
}

fn apply_clinical_row(candidate: &mut ClinicalData, row: &ClinicalRow) -> Result<bool> {
    let mut changed = false;
    stage_number(&mut candidate.crp, &row.crp, &mut changed)?;
    stage_number(&mut candidate.calprotectin, &row.calprotectin, &mut changed)?;
    stage_nullable_flag(
        &mut candidate.endoscopic_mucosal_healing_at_3_6_months,
        &row.endoscopic_mucosal_healing_at_3_6_months,
        &mut changed,
    );
    stage_nullable_flag(
        &mut candidate.endoscopic_mucosal_healing_at_12_months,
        &row.endoscopic_mucosal_healing_at_12_months,
        &mut changed,
    );
    Ok(changed)
}

// Get-or-create on the row's join key: `sample_date` when present, else
// `music_timepoint`.
pub async fn import_clinical(pool: &SqlitePool, rows: &[ClinicalRow]) -> Result<ReconcileOutcome> {
    let existing = db::fetch_identifiers(pool).await?;
    let lookup = build_alias_map(&existing);
    let mut outcome = ReconcileOutcome {
        total: rows.len(),
        ..Default::default()
    };

    let mut tx = pool.begin().await?;
    for row in rows {
        let Some(key) = row.study_id.as_deref().and_then(normalize_study_id) else {
            continue;
        };
        let Some(&Handle::Stored(idx)) = lookup.get(&key) else {
            warn!(study_id = %key, "no stored identifier for clinical row");
            outcome.skipped += 1;
            continue;
        };
        let identifier_id = existing[idx].id;

        let sample_date = match &row.sample_date {
            Some(raw) => match coerce_date(raw) {
                Ok(date) => Some(date),
                Err(err) => {
                    warn!(study_id = %key, error = %err, "skipping clinical row");
                    outcome.skipped += 1;
                    continue;
                }
            },
            None => None,
        };
        let join = match (&sample_date, &row.music_timepoint) {
            (Some(date), _) => JoinKey::Date(*date),
            (None, Some(timepoint)) => JoinKey::Timepoint(timepoint.clone()),
            (None, None) => {
                warn!(study_id = %key, "clinical row has neither date nor timepoint");
                outcome.skipped += 1;
                continue;
            }
        };

        let query = match &join {
            JoinKey::Date(_) => {
                "SELECT id, identifier_id, sample_date, music_timepoint, crp, calprotectin, \
                 endoscopic_mucosal_healing_at_3_6_months, endoscopic_mucosal_healing_at_12_months \
                 FROM clinical_data WHERE identifier_id = ? AND sample_date = ?"
            }
            JoinKey::Timepoint(_) => {
                "SELECT id, identifier_id, sample_date, music_timepoint, crp, calprotectin, \
                 endoscopic_mucosal_healing_at_3_6_months, endoscopic_mucosal_healing_at_12_months \
                 FROM clinical_data WHERE identifier_id = ? AND music_timepoint = ?"
            }
        };
        let mut fetch = sqlx::query(query).bind(identifier_id.to_string());
        fetch = match &join {
            JoinKey::Date(date) => fetch.bind(*date),
            JoinKey::Timepoint(timepoint) => fetch.bind(timepoint.clone()),
        };
        let found = fetch.fetch_optional(&mut *tx).await?;

        match found {
            Some(stored) => {
                let mut candidate = db::clinical_from_row(&stored)?;
                match apply_clinical_row(&mut candidate, row) {
                    Ok(true) => {
                        db::update_clinical_observations(&mut *tx, &candidate).await?;
                        outcome.updated += 1;
                    }
                    Ok(false) => outcome.skipped += 1,
                    Err(err) => {
                        warn!(study_id = %key, error = %err, "skipping clinical row");
                        outcome.skipped += 1;
                    }
                }
            }
            None => {
                let mut record = ClinicalData {
                    id: Uuid::new_v4(),
                    identifier_id,
                    sample_date,
                    music_timepoint: row.music_timepoint.clone(),
                    crp: None,
                    calprotectin: None,
                    endoscopic_mucosal_healing_at_3_6_months: None,
                    endoscopic_mucosal_healing_at_12_months: None,
                };
                match apply_clinical_row(&mut record, row) {
                    Ok(_) => {
                        db::insert_clinical(&mut *tx, &record).await?;
                        outcome.created += 1;
                    }
                    Err(err) => {
                        warn!(study_id = %key, error = %err, "skipping clinical row");
                        outcome.skipped += 1;
                    }
                }
            }
        }
    }
    tx.commit().await?;

    debug!(
        total = outcome.total,
        created = outcome.created,
        updated = outcome.updated,
        skipped = outcome.skipped,
        "clinical import finished"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn stored(name: &str) -> StudyIdentifier {
        StudyIdentifier {
            id: Uuid::new_v4(),
            name: name.to_string(),
            study_name: None,
            study_center: None,
            study_group: None,
            sex: None,
            age: None,
            genotype_data_available: false,
            nod2_mutation_present: false,
            il23r_mutation_present: false,
        }
    }

    fn row(study_id: &str) -> IdentifierRow {
        IdentifierRow {
            study_id: Some(study_id.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn normalize_trims_and_upper_cases() {
        assert_eq!(normalize_study_id("  gid-101 "), Some("GID-101".to_string()));
        assert_eq!(normalize_study_id("   "), None);
        assert_eq!(normalize_study_id(""), None);
    }

    #[test]
    fn alias_map_registers_stripped_suffixes() {
        let existing = vec![stored("GID-102-P"), stored("IBD-55-HC")];
        let lookup = build_alias_map(&existing);
        assert_eq!(lookup.get("GID-102-P"), Some(&Handle::Stored(0)));
        assert_eq!(lookup.get("GID-102"), Some(&Handle::Stored(0)));
        assert_eq!(lookup.get("IBD-55"), Some(&Handle::Stored(1)));
        assert_eq!(lookup.get("IBD-55-HC"), Some(&Handle::Stored(1)));
    }

    #[test]
    fn first_registered_alias_wins() {
        let existing = vec![stored("GID-1-P"), stored("GID-1-HC")];
        let lookup = build_alias_map(&existing);
        assert_eq!(lookup.get("GID-1"), Some(&Handle::Stored(0)));
    }

    #[test]
    fn exact_name_beats_stripped_alias() {
        let existing = vec![stored("GID-9-P"), stored("GID-9")];
        let lookup = build_alias_map(&existing);
        assert_eq!(lookup.get("GID-9"), Some(&Handle::Stored(1)));
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let pool = test_pool().await;
        let outcome = reconcile_identifiers(&pool, &[]).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::default());
        assert_eq!(db::count_identifiers(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn creates_new_identifiers_upper_cased() {
        let pool = test_pool().await;
        let batch = vec![IdentifierRow {
            study_id: Some("gid-101".to_string()),
            study_name: Some("GI-DAMPs".to_string()),
            age: Some("42".to_string()),
            genotype_data_available: Some("yes".to_string()),
            ..Default::default()
        }];

        let outcome = reconcile_identifiers(&pool, &batch).await.unwrap();
        assert_eq!(outcome.total, 1);
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.updated, 0);

        let all = db::fetch_identifiers(&pool).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "GID-101");
        assert_eq!(all[0].study_name.as_deref(), Some("GI-DAMPs"));
        assert_eq!(all[0].age, Some(42));
        assert!(all[0].genotype_data_available);
        assert!(!all[0].nod2_mutation_present);
    }

    #[tokio::test]
    async fn second_pass_skips_everything() {
        let pool = test_pool().await;
        let batch = vec![
            IdentifierRow {
                study_id: Some("gid-101".to_string()),
                study_name: Some("GI-DAMPs".to_string()),
                ..Default::default()
            },
            IdentifierRow {
                study_id: Some("music-010".to_string()),
                age: Some("35".to_string()),
                ..Default::default()
            },
        ];

        let first = reconcile_identifiers(&pool, &batch).await.unwrap();
        assert_eq!(first.created, 2);

        let second = reconcile_identifiers(&pool, &batch).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.skipped, 2);
    }

    #[tokio::test]
    async fn suffixed_name_is_updated_not_duplicated() {
        let pool = test_pool().await;
        db::insert_identifier(&pool, &stored("GID-102-P")).await.unwrap();

        let batch = vec![IdentifierRow {
            study_id: Some("gid-102".to_string()),
            study_name: Some("New Study B".to_string()),
            ..Default::default()
        }];
        let outcome = reconcile_identifiers(&pool, &batch).await.unwrap();
        assert_eq!(outcome.total, 1);
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.skipped, 0);

        let all = db::fetch_identifiers(&pool).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "GID-102-P");
        assert_eq!(all[0].study_name.as_deref(), Some("New Study B"));
    }

    #[tokio::test]
    async fn case_insensitive_keys_resolve_to_one_record() {
        let pool = test_pool().await;
        let first = reconcile_identifiers(&pool, &[row("gid-101")]).await.unwrap();
        assert_eq!(first.created, 1);

        let second = reconcile_identifiers(&pool, &[row("GID-101")]).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(db::count_identifiers(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn matching_values_are_skipped_without_update() {
        let pool = test_pool().await;
        let mut ident = stored("GID-500");
        ident.study_center = Some("Edinburgh".to_string());
        ident.age = Some(42);
        db::insert_identifier(&pool, &ident).await.unwrap();

        let batch = vec![IdentifierRow {
            study_id: Some("GID-500".to_string()),
            study_center: Some("Edinburgh".to_string()),
            age: Some("42".to_string()),
            ..Default::default()
        }];
        let outcome = reconcile_identifiers(&pool, &batch).await.unwrap();
        assert_eq!(outcome.updated, 0);
        assert_eq!(outcome.skipped, 1);
    }

    #[tokio::test]
    async fn blank_study_ids_count_toward_total_only() {
        let pool = test_pool().await;
        let batch = vec![row("  "), IdentifierRow::default(), row("gid-1")];
        let outcome = reconcile_identifiers(&pool, &batch).await.unwrap();
        assert_eq!(outcome.total, 3);
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.updated, 0);
        assert_eq!(outcome.skipped, 0);
    }

    #[tokio::test]
    async fn absent_fields_never_clear_stored_values() {
        let pool = test_pool().await;
        let mut ident = stored("GID-600");
        ident.study_name = Some("Original".to_string());
        db::insert_identifier(&pool, &ident).await.unwrap();

        let batch = vec![IdentifierRow {
            study_id: Some("GID-600".to_string()),
            study_center: Some("Dundee".to_string()),
            ..Default::default()
        }];
        let outcome = reconcile_identifiers(&pool, &batch).await.unwrap();
        assert_eq!(outcome.updated, 1);

        let all = db::fetch_identifiers(&pool).await.unwrap();
        assert_eq!(all[0].study_name.as_deref(), Some("Original"));
        assert_eq!(all[0].study_center.as_deref(), Some("Dundee"));
    }

    #[tokio::test]
    async fn bad_age_skips_the_row_and_keeps_other_fields_unchanged() {
        let pool = test_pool().await;
        let mut ident = stored("GID-700");
        ident.study_center = Some("Edinburgh".to_string());
        db::insert_identifier(&pool, &ident).await.unwrap();

        let batch = vec![
            IdentifierRow {
                study_id: Some("GID-700".to_string()),
                study_center: Some("Glasgow".to_string()),
                age: Some("forty".to_string()),
                ..Default::default()
            },
            row("gid-701"),
        ];
        let outcome = reconcile_identifiers(&pool, &batch).await.unwrap();
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.created, 1);

        let all = db::fetch_identifiers(&pool).await.unwrap();
        assert_eq!(all[0].study_center.as_deref(), Some("Edinburgh"));
    }

    #[tokio::test]
    async fn repeated_new_key_merges_into_one_pending_record() {
        let pool = test_pool().await;
        let batch = vec![
            IdentifierRow {
                study_id: Some("NEW-1".to_string()),
                study_name: Some("First".to_string()),
                ..Default::default()
            },
            IdentifierRow {
                study_id: Some("new-1".to_string()),
                study_name: Some("Second".to_string()),
                ..Default::default()
            },
        ];
        let outcome = reconcile_identifiers(&pool, &batch).await.unwrap();
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.updated, 1);

        let all = db::fetch_identifiers(&pool).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].study_name.as_deref(), Some("Second"));
    }

    // A pending record registers only its exact name; stripped-suffix aliases
    // come from stored identifiers alone, so a new suffixed name does not
    // absorb its base within the same batch.
    #[tokio::test]
    async fn new_suffixed_name_does_not_alias_its_base_within_the_batch() {
        let pool = test_pool().await;
        let batch = vec![
            IdentifierRow {
                study_id: Some("GID-5-P".to_string()),
                ..Default::default()
            },
            IdentifierRow {
                study_id: Some("GID-5".to_string()),
                ..Default::default()
            },
        ];
        let outcome = reconcile_identifiers(&pool, &batch).await.unwrap();
        assert_eq!(outcome.created, 2);

        let names: Vec<_> = db::fetch_identifiers(&pool)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["GID-5-P".to_string(), "GID-5".to_string()]);
    }

    #[tokio::test]
    async fn clinical_rows_get_or_create_on_date_key() {
        let pool = test_pool().await;
        db::insert_identifier(&pool, &stored("GID-101")).await.unwrap();

        let batch = vec![ClinicalRow {
            study_id: Some("gid-101".to_string()),
            sample_date: Some("2024-03-14".to_string()),
            crp: Some("4.2".to_string()),
            calprotectin: Some("180".to_string()),
            ..Default::default()
        }];

        let first = import_clinical(&pool, &batch).await.unwrap();
        assert_eq!(first.created, 1);

        let second = import_clinical(&pool, &batch).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped, 1);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM clinical_data")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn clinical_update_stages_changed_observations_only() {
        let pool = test_pool().await;
        db::insert_identifier(&pool, &stored("MUSIC-010")).await.unwrap();

        let create = vec![ClinicalRow {
            study_id: Some("MUSIC-010".to_string()),
            music_timepoint: Some("baseline".to_string()),
            crp: Some("7.4".to_string()),
            ..Default::default()
        }];
        import_clinical(&pool, &create).await.unwrap();

        let update = vec![ClinicalRow {
            study_id: Some("MUSIC-010".to_string()),
            music_timepoint: Some("baseline".to_string()),
            crp: Some("3.0".to_string()),
            endoscopic_mucosal_healing_at_3_6_months: Some("true".to_string()),
            ..Default::default()
        }];
        let outcome = import_clinical(&pool, &update).await.unwrap();
        assert_eq!(outcome.updated, 1);

        let crp: Option<f64> = sqlx::query_scalar(
            "SELECT crp FROM clinical_data WHERE music_timepoint = 'baseline'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(crp, Some(3.0));
    }

    #[tokio::test]
    async fn clinical_rows_without_identifier_or_key_are_skipped() {
        let pool = test_pool().await;
        db::insert_identifier(&pool, &stored("GID-101")).await.unwrap();

        let batch = vec![
            ClinicalRow {
                study_id: Some("UNKNOWN-9".to_string()),
                sample_date: Some("2024-01-01".to_string()),
                ..Default::default()
            },
            ClinicalRow {
                study_id: Some("GID-101".to_string()),
                ..Default::default()
            },
            ClinicalRow::default(),
        ];
        let outcome = import_clinical(&pool, &batch).await.unwrap();
        assert_eq!(outcome.total, 3);
        assert_eq!(outcome.skipped, 2);
        assert_eq!(outcome.created, 0);
    }

    #[tokio::test]
    async fn clinical_rows_resolve_suffixed_aliases() {
        let pool = test_pool().await;
        db::insert_identifier(&pool, &stored("GID-102-P")).await.unwrap();

        let batch = vec![ClinicalRow {
            study_id: Some("gid-102".to_string()),
            sample_date: Some("2024-04-09".to_string()),
            crp: Some("11.8".to_string()),
            ..Default::default()
        }];
        let outcome = import_clinical(&pool, &batch).await.unwrap();
        assert_eq!(outcome.created, 1);
    }
}
