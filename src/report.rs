use std::collections::HashMap;
use std::fmt::Write;

use chrono::NaiveDate;

use crate::models::AnnotatedSample;

#[derive(Debug, Clone)]
pub struct CohortCoverage {
    pub cohort: String,
    pub samples: usize,
    pub matched: usize,
}

fn has_clinical_values(entry: &AnnotatedSample) -> bool {
    entry.crp.is_some()
        || entry.calprotectin.is_some()
        || entry.endoscopic_mucosal_healing_at_3_6_months.is_some()
        || entry.endoscopic_mucosal_healing_at_12_months.is_some()
}

pub fn summarize_coverage(annotated: &[AnnotatedSample]) -> Vec<CohortCoverage> {
    let mut map: HashMap<String, (usize, usize)> = HashMap::new();
    for entry in annotated {
        let slot = map.entry(entry.cohort.clone()).or_insert((0, 0));
        slot.0 += 1;
        if has_clinical_values(entry) {
            slot.1 += 1;
        }
    }

    let mut coverage: Vec<CohortCoverage> = map
        .into_iter()
        .map(|(cohort, (samples, matched))| CohortCoverage {
            cohort,
            samples,
            matched,
        })
        .collect();
    coverage.sort_by(|a, b| b.samples.cmp(&a.samples).then(a.cohort.cmp(&b.cohort)));
    coverage
}

pub fn build_report(
    scope: Option<&str>,
    generated_on: NaiveDate,
    identifier_count: i64,
    annotated: &[AnnotatedSample],
) -> String {
    let coverage = summarize_coverage(annotated);
    let scope_label = scope.unwrap_or("all cohorts");

    let mut output = String::new();
    let _ = writeln!(output, "# Biobank Clinical Coverage Report");
    let _ = writeln!(
        output,
        "Generated for {} on {} ({} stored identifiers)",
        scope_label, generated_on, identifier_count
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Cohort Coverage");

    if coverage.is_empty() {
        let _ = writeln!(output, "No samples recorded.");
    } else {
        for entry in coverage.iter() {
            let _ = writeln!(
                output,
                "- {}: {}/{} samples with clinical data",
                entry.cohort, entry.matched, entry.samples
            );
        }
    }

    let unmatched: Vec<&AnnotatedSample> = annotated
        .iter()
        .filter(|entry| !has_clinical_values(entry))
        .collect();
    let _ = writeln!(output);
    let _ = writeln!(output, "## Samples Without Clinical Data");

    if unmatched.is_empty() {
        let _ = writeln!(output, "Every sample matched a clinical record.");
    } else {
        for entry in unmatched.iter().take(10) {
            let identifier = entry.identifier_name.as_deref().unwrap_or("no identifier");
            let _ = writeln!(output, "- {} ({}, {})", entry.sample_id, entry.cohort, identifier);
        }
        if unmatched.len() > 10 {
            let _ = writeln!(output, "- ... and {} more", unmatched.len() - 10);
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sample_id: &str, cohort: &str, crp: Option<f64>) -> AnnotatedSample {
        AnnotatedSample {
            sample_id: sample_id.to_string(),
            cohort: cohort.to_string(),
            identifier_name: Some("GID-101".to_string()),
            collected_at: None,
            music_timepoint: None,
            crp,
            calprotectin: None,
            endoscopic_mucosal_healing_at_3_6_months: None,
            endoscopic_mucosal_healing_at_12_months: None,
        }
    }

    #[test]
    fn coverage_counts_matched_samples_per_cohort() {
        let annotated = vec![
            entry("A-1", "gidamps", Some(4.2)),
            entry("A-2", "gidamps", None),
            entry("B-1", "music", Some(7.4)),
        ];
        let coverage = summarize_coverage(&annotated);
        assert_eq!(coverage.len(), 2);
        assert_eq!(coverage[0].cohort, "gidamps");
        assert_eq!(coverage[0].samples, 2);
        assert_eq!(coverage[0].matched, 1);
        assert_eq!(coverage[1].cohort, "music");
        assert_eq!(coverage[1].matched, 1);
    }

    #[test]
    fn report_lists_unmatched_samples() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 25).unwrap();
        let annotated = vec![entry("A-1", "gidamps", Some(4.2)), entry("A-2", "gidamps", None)];
        let report = build_report(Some("gidamps"), date, 5, &annotated);

        assert!(report.contains("# Biobank Clinical Coverage Report"));
        assert!(report.contains("Generated for gidamps"));
        assert!(report.contains("- gidamps: 1/2 samples with clinical data"));
        assert!(report.contains("- A-2 (gidamps, GID-101)"));
        assert!(!report.contains("- A-1 (gidamps"));
    }

    #[test]
    fn empty_report_has_placeholder_sections() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 25).unwrap();
        let report = build_report(None, date, 0, &[]);
        assert!(report.contains("Generated for all cohorts"));
        assert!(report.contains("No samples recorded."));
        assert!(report.contains("Every sample matched a clinical record."));
    }
}
