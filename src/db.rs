use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::models::{ClinicalData, Sample, StudyIdentifier};

pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid database url {database_url}"))?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("failed to open the sample database")?;

    Ok(pool)
}

// Idempotent, safe to run against an existing store.
pub async fn init_db(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS study_identifiers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            study_name TEXT,
            study_center TEXT,
            study_group TEXT,
            sex TEXT,
            age INTEGER,
            genotype_data_available INTEGER NOT NULL DEFAULT 0,
            nod2_mutation_present INTEGER NOT NULL DEFAULT 0,
            il23r_mutation_present INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS clinical_data (
            id TEXT PRIMARY KEY,
            identifier_id TEXT NOT NULL REFERENCES study_identifiers(id),
            sample_date TEXT,
            music_timepoint TEXT,
            crp REAL,
            calprotectin REAL,
            endoscopic_mucosal_healing_at_3_6_months INTEGER,
            endoscopic_mucosal_healing_at_12_months INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_clinical_by_date \
         ON clinical_data(identifier_id, sample_date)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_clinical_by_timepoint \
         ON clinical_data(identifier_id, music_timepoint)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS samples (
            id TEXT PRIMARY KEY,
            sample_id TEXT NOT NULL UNIQUE,
            cohort TEXT NOT NULL,
            sample_type TEXT,
            collected_at TEXT,
            music_timepoint TEXT,
            identifier_id TEXT REFERENCES study_identifiers(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    info!("schema ready");
    Ok(())
}

// Insertion order matters: the reconciler builds its alias map from this
// scan, and the order decides which record claims a contested alias.
pub async fn fetch_identifiers(pool: &SqlitePool) -> Result<Vec<StudyIdentifier>> {
    let rows = sqlx::query(
        "SELECT id, name, study_name, study_center, study_group, sex, age, \
         genotype_data_available, nod2_mutation_present, il23r_mutation_present \
         FROM study_identifiers ORDER BY rowid",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(identifier_from_row).collect()
}

pub async fn count_identifiers(pool: &SqlitePool) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM study_identifiers")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub fn identifier_from_row(row: &SqliteRow) -> Result<StudyIdentifier> {
    Ok(StudyIdentifier {
        id: parse_id(row.get("id"))?,
        name: row.get("name"),
        study_name: row.get("study_name"),
        study_center: row.get("study_center"),
        study_group: row.get("study_group"),
        sex: row.get("sex"),
        age: row.get("age"),
        genotype_data_available: row.get("genotype_data_available"),
        nod2_mutation_present: row.get("nod2_mutation_present"),
        il23r_mutation_present: row.get("il23r_mutation_present"),
    })
}

pub async fn insert_identifier<'e, E>(executor: E, ident: &StudyIdentifier) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO study_identifiers
        (id, name, study_name, study_center, study_group, sex, age,
         genotype_data_available, nod2_mutation_present, il23r_mutation_present)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(ident.id.to_string())
    .bind(&ident.name)
    .bind(&ident.study_name)
    .bind(&ident.study_center)
    .bind(&ident.study_group)
    .bind(&ident.sex)
    .bind(ident.age)
    .bind(ident.genotype_data_available)
    .bind(ident.nod2_mutation_present)
    .bind(ident.il23r_mutation_present)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn bulk_insert_identifiers<'e, E>(executor: E, idents: &[StudyIdentifier]) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    if idents.is_empty() {
        return Ok(());
    }

    let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
        "INSERT INTO study_identifiers \
         (id, name, study_name, study_center, study_group, sex, age, \
          genotype_data_available, nod2_mutation_present, il23r_mutation_present) ",
    );
    builder.push_values(idents, |mut row, ident| {
        row.push_bind(ident.id.to_string())
            .push_bind(&ident.name)
            .push_bind(&ident.study_name)
            .push_bind(&ident.study_center)
            .push_bind(&ident.study_group)
            .push_bind(&ident.sex)
            .push_bind(ident.age)
            .push_bind(ident.genotype_data_available)
            .push_bind(ident.nod2_mutation_present)
            .push_bind(ident.il23r_mutation_present);
    });
    builder.build().execute(executor).await?;

    Ok(())
}

pub async fn update_identifier<'e, E>(executor: E, ident: &StudyIdentifier) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        UPDATE study_identifiers
        SET study_name = ?, study_center = ?, study_group = ?, sex = ?, age = ?,
            genotype_data_available = ?, nod2_mutation_present = ?, il23r_mutation_present = ?
        WHERE id = ?
        "#,
    )
    .bind(&ident.study_name)
    .bind(&ident.study_center)
    .bind(&ident.study_group)
    .bind(&ident.sex)
    .bind(ident.age)
    .bind(ident.genotype_data_available)
    .bind(ident.nod2_mutation_present)
    .bind(ident.il23r_mutation_present)
    .bind(ident.id.to_string())
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn insert_clinical<'e, E>(executor: E, record: &ClinicalData) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO clinical_data
        (id, identifier_id, sample_date, music_timepoint, crp, calprotectin,
         endoscopic_mucosal_healing_at_3_6_months, endoscopic_mucosal_healing_at_12_months)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.id.to_string())
    .bind(record.identifier_id.to_string())
    .bind(record.sample_date)
    .bind(&record.music_timepoint)
    .bind(record.crp)
    .bind(record.calprotectin)
    .bind(record.endoscopic_mucosal_healing_at_3_6_months)
    .bind(record.endoscopic_mucosal_healing_at_12_months)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn update_clinical_observations<'e, E>(executor: E, record: &ClinicalData) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        UPDATE clinical_data
        SET crp = ?, calprotectin = ?,
            endoscopic_mucosal_healing_at_3_6_months = ?,
            endoscopic_mucosal_healing_at_12_months = ?
        WHERE id = ?
        "#,
    )
    .bind(record.crp)
    .bind(record.calprotectin)
    .bind(record.endoscopic_mucosal_healing_at_3_6_months)
    .bind(record.endoscopic_mucosal_healing_at_12_months)
    .bind(record.id.to_string())
    .execute(executor)
    .await?;

    Ok(())
}

pub fn clinical_from_row(row: &SqliteRow) -> Result<ClinicalData> {
    Ok(ClinicalData {
        id: parse_id(row.get("id"))?,
        identifier_id: parse_id(row.get("identifier_id"))?,
        sample_date: row.get("sample_date"),
        music_timepoint: row.get("music_timepoint"),
        crp: row.get("crp"),
        calprotectin: row.get("calprotectin"),
        endoscopic_mucosal_healing_at_3_6_months: row
            .get("endoscopic_mucosal_healing_at_3_6_months"),
        endoscopic_mucosal_healing_at_12_months: row
            .get("endoscopic_mucosal_healing_at_12_months"),
    })
}

pub async fn insert_sample<'e, E>(executor: E, sample: &Sample) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO samples
        (id, sample_id, cohort, sample_type, collected_at, music_timepoint, identifier_id)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (sample_id) DO NOTHING
        "#,
    )
    .bind(sample.id.to_string())
    .bind(&sample.sample_id)
    .bind(&sample.cohort)
    .bind(&sample.sample_type)
    .bind(sample.collected_at)
    .bind(&sample.music_timepoint)
    .bind(sample.identifier_id.map(|id| id.to_string()))
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn fetch_sample(pool: &SqlitePool, sample_id: &str) -> Result<Option<Sample>> {
    let row = sqlx::query(
        "SELECT id, sample_id, cohort, sample_type, collected_at, music_timepoint, identifier_id \
         FROM samples WHERE sample_id = ?",
    )
    .bind(sample_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(sample_from_row).transpose()
}

pub async fn fetch_samples(pool: &SqlitePool, cohort: Option<&str>) -> Result<Vec<Sample>> {
    let mut query = String::from(
        "SELECT id, sample_id, cohort, sample_type, collected_at, music_timepoint, identifier_id \
         FROM samples",
    );
    if cohort.is_some() {
        query.push_str(" WHERE instr(lower(cohort), lower(?)) > 0");
    }
    query.push_str(" ORDER BY sample_id");

    let mut rows = sqlx::query(&query);
    if let Some(value) = cohort {
        rows = rows.bind(value);
    }

    let records = rows.fetch_all(pool).await?;
    records.iter().map(sample_from_row).collect()
}

pub fn sample_from_row(row: &SqliteRow) -> Result<Sample> {
    let identifier_id: Option<String> = row.get("identifier_id");
    Ok(Sample {
        id: parse_id(row.get("id"))?,
        sample_id: row.get("sample_id"),
        cohort: row.get("cohort"),
        sample_type: row.get("sample_type"),
        collected_at: row.get("collected_at"),
        music_timepoint: row.get("music_timepoint"),
        identifier_id: identifier_id.map(|raw| parse_id(raw)).transpose()?,
    })
}

fn parse_id(raw: String) -> Result<Uuid> {
    Uuid::parse_str(&raw).with_context(|| format!("stored id {raw} is not a valid uuid"))
}

// Fixtures cover all three cohort categories, a suffixed identifier name, and
// an orphan sample.
pub async fn seed(pool: &SqlitePool) -> Result<()> {
    let identifiers = vec![
        ("GID-101", "gidamps", Some("GI-DAMPs"), Some("Edinburgh"), Some("IBD"), Some("M"), Some(42), true),
        ("GID-102-P", "gidamps", Some("GI-DAMPs"), Some("Glasgow"), Some("IBD"), Some("F"), Some(57), false),
        ("MUSIC-010", "music", Some("MUSIC"), Some("Edinburgh"), Some("CD"), Some("F"), Some(35), true),
        ("MINI-205", "mini_music", Some("Mini-MUSIC"), Some("Dundee"), Some("UC"), Some("M"), Some(13), false),
        ("MARVEL-301", "marvel", Some("MARVEL"), Some("Aberdeen"), None, Some("M"), Some(61), false),
    ];

    let mut ids = std::collections::HashMap::new();
    for (name, _cohort, study_name, center, group, sex, age, genotype) in &identifiers {
        let id: String = sqlx::query(
            r#"
            INSERT INTO study_identifiers
            (id, name, study_name, study_center, study_group, sex, age,
             genotype_data_available, nod2_mutation_present, il23r_mutation_present)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0)
            ON CONFLICT (name) DO UPDATE SET study_center = excluded.study_center
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(name)
        .bind(study_name)
        .bind(center)
        .bind(group)
        .bind(sex)
        .bind(age)
        .bind(genotype)
        .fetch_one(pool)
        .await?
        .get("id");
        ids.insert(name.to_string(), parse_id(id)?);
    }

    let date = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).context("invalid seed date");
    let clinical: Vec<(&str, Option<NaiveDate>, Option<&str>, Option<f64>, Option<f64>, Option<bool>, Option<bool>)> = vec![
        ("GID-101", Some(date(2024, 3, 14)?), None, Some(4.2), Some(180.0), None, None),
        ("GID-101", Some(date(2024, 6, 2)?), None, Some(2.1), Some(95.5), None, None),
        ("GID-102-P", Some(date(2024, 4, 9)?), None, Some(11.8), Some(420.0), None, None),
        ("MUSIC-010", None, Some("baseline"), Some(7.4), Some(310.0), Some(false), None),
        ("MUSIC-010", None, Some("12_weeks"), Some(3.0), Some(120.0), Some(true), Some(true)),
        ("MINI-205", None, Some("baseline"), Some(5.5), Some(260.0), Some(false), None),
        ("MARVEL-301", Some(date(2024, 5, 20)?), None, Some(1.2), Some(40.0), None, None),
    ];

    for (name, sample_date, timepoint, crp, calprotectin, ehm36, ehm12) in clinical {
        let identifier_id = ids[name];
        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM clinical_data \
             WHERE identifier_id = ? \
               AND (sample_date IS ? AND music_timepoint IS ?)",
        )
        .bind(identifier_id.to_string())
        .bind(sample_date)
        .bind(timepoint)
        .fetch_one(pool)
        .await?;
        if existing > 0 {
            continue;
        }

        insert_clinical(
            pool,
            &ClinicalData {
                id: Uuid::new_v4(),
                identifier_id,
                sample_date,
                music_timepoint: timepoint.map(str::to_string),
                crp,
                calprotectin,
                endoscopic_mucosal_healing_at_3_6_months: ehm36,
                endoscopic_mucosal_healing_at_12_months: ehm12,
            },
        )
        .await?;
    }

    let at = |y, m, d, h, min| -> Result<NaiveDateTime> {
        Ok(date(y, m, d)?
            .and_hms_opt(h, min, 0)
            .context("invalid seed time")?)
    };
    let samples: Vec<(&str, &str, &str, Option<NaiveDateTime>, Option<&str>, Option<&str>)> = vec![
        ("EDIN-0001", "gidamps", "serum", Some(at(2024, 3, 14, 10, 30)?), None, Some("GID-101")),
        ("EDIN-0002", "gidamps", "biopsy", Some(at(2024, 6, 2, 9, 15)?), None, Some("GID-101")),
        ("GLAS-0003", "gidamps", "stool", Some(at(2024, 4, 9, 14, 0)?), None, Some("GID-102-P")),
        ("EDIN-0004", "music", "serum", Some(at(2024, 2, 1, 8, 45)?), Some("baseline"), Some("MUSIC-010")),
        ("EDIN-0005", "music", "serum", Some(at(2024, 4, 25, 9, 0)?), Some("12_weeks"), Some("MUSIC-010")),
        ("DUND-0006", "mini_music", "stool", Some(at(2024, 7, 3, 13, 20)?), Some("baseline"), Some("MINI-205")),
        ("ABER-0007", "marvel", "serum", Some(at(2024, 5, 20, 11, 10)?), None, Some("MARVEL-301")),
        ("ABER-0008", "marvel", "serum", Some(at(2024, 5, 21, 11, 10)?), None, None),
    ];

    for (sample_id, cohort, sample_type, collected_at, timepoint, identifier) in samples {
        insert_sample(
            pool,
            &Sample {
                id: Uuid::new_v4(),
                sample_id: sample_id.to_string(),
                cohort: cohort.to_string(),
                sample_type: Some(sample_type.to_string()),
                collected_at,
                music_timepoint: timepoint.map(str::to_string),
                identifier_id: identifier.map(|name| ids[name]),
            },
        )
        .await?;
    }

    info!("seed data inserted");
    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    // A single connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    init_db(&pool).await.expect("schema");
    pool
}
