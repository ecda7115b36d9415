use chrono::{NaiveDate, NaiveDateTime};
use uuid::Uuid;

// `name` is unique and stored upper-cased; records are created or mutated by
// the reconciler, never deleted.
#[derive(Debug, Clone)]
pub struct StudyIdentifier {
    pub id: Uuid,
    pub name: String,
    pub study_name: Option<String>,
    pub study_center: Option<String>,
    pub study_group: Option<String>,
    pub sex: Option<String>,
    pub age: Option<i64>,
    pub genotype_data_available: bool,
    pub nod2_mutation_present: bool,
    pub il23r_mutation_present: bool,
}

#[derive(Debug, Clone)]
pub struct ClinicalData {
    pub id: Uuid,
    pub identifier_id: Uuid,
    pub sample_date: Option<NaiveDate>,
    pub music_timepoint: Option<String>,
    pub crp: Option<f64>,
    pub calprotectin: Option<f64>,
    pub endoscopic_mucosal_healing_at_3_6_months: Option<bool>,
    pub endoscopic_mucosal_healing_at_12_months: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub id: Uuid,
    pub sample_id: String,
    pub cohort: String,
    pub sample_type: Option<String>,
    pub collected_at: Option<NaiveDateTime>,
    pub music_timepoint: Option<String>,
    pub identifier_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct AnnotatedSample {
    pub sample_id: String,
    pub cohort: String,
    pub identifier_name: Option<String>,
    pub collected_at: Option<NaiveDateTime>,
    pub music_timepoint: Option<String>,
    pub crp: Option<f64>,
    pub calprotectin: Option<f64>,
    pub endoscopic_mucosal_healing_at_3_6_months: Option<bool>,
    pub endoscopic_mucosal_healing_at_12_months: Option<bool>,
}

// `total` includes blank rows, so created + updated + skipped <= total.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

// `None` covers both an absent column and an empty cell; such fields are
// never considered for update. `age` and the flags stay raw strings so a bad
// value fails that row alone, at merge time.
#[derive(Debug, Clone, Default)]
pub struct IdentifierRow {
    pub study_id: Option<String>,
    pub study_name: Option<String>,
    pub study_center: Option<String>,
    pub study_group: Option<String>,
    pub sex: Option<String>,
    pub age: Option<String>,
    pub genotype_data_available: Option<String>,
    pub nod2_mutation_present: Option<String>,
    pub il23r_mutation_present: Option<String>,
}

// Same optional-field convention as IdentifierRow.
#[derive(Debug, Clone, Default)]
pub struct ClinicalRow {
    pub study_id: Option<String>,
    pub sample_date: Option<String>,
    pub music_timepoint: Option<String>,
    pub crp: Option<String>,
    pub calprotectin: Option<String>,
    pub endoscopic_mucosal_healing_at_3_6_months: Option<String>,
    pub endoscopic_mucosal_healing_at_12_months: Option<String>,
}

// Cohort names are matched by case-insensitive substring containment;
// "gidamps" is checked before "music" so a name matching both lands in the
// same bucket on every path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CohortCategory {
    Gidamps,
    Music,
    Default,
}

impl CohortCategory {
    pub fn from_cohort(name: &str) -> Self {
        let lowered = name.to_lowercase();
        if lowered.contains("gidamps") {
            CohortCategory::Gidamps
        } else if lowered.contains("music") {
            CohortCategory::Music
        } else {
            CohortCategory::Default
        }
    }
}
