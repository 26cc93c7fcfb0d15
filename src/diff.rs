use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::models::{ChangeKind, ChangeSet, CourseKey, GradeChange, GradeRecord, GradeSnapshot};

/// How records of a snapshot pair are identified. The strongest identity that
/// every record on both sides carries is used, so a snapshot written by an older
/// schema still lines up with a newer one. `Name` collides on retaken courses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScheme {
    Name,
    NameTerm,
    Code,
}

impl KeyScheme {
    pub fn for_pair(current: &GradeSnapshot, baseline: &GradeSnapshot) -> Self {
        Self::for_records(current.records().iter().chain(baseline.records()))
    }

    /// Strongest identity that every record carries. Name when there are no records.
    pub fn for_records<'a, I>(records: I) -> Self
    where
        I: Iterator<Item = &'a GradeRecord> + Clone,
    {
        let has = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());

        if records.clone().next().is_none() {
            Self::Name
        } else if records.clone().all(|r| has(&r.code)) {
            Self::Code
        } else if records.clone().all(|r| has(&r.term)) {
            Self::NameTerm
        } else {
            Self::Name
        }
    }

    pub fn key(self, record: &GradeRecord) -> CourseKey {
        match (self, &record.code, &record.term) {
            (Self::Code, Some(code), _) => CourseKey::Code(code.clone()),
            (Self::NameTerm, _, Some(term)) => CourseKey::NameTerm(record.course.clone(), term.clone()),
            _ => CourseKey::Name(record.course.clone()),
        }
    }
}

/// Compares a fresh snapshot with the stored baseline. A record is reported when its
/// key is missing from the baseline or its result differs as a string ("90" != "90.0").
pub fn detect(current: &GradeSnapshot, baseline: &GradeSnapshot) -> ChangeSet {
    let scheme = KeyScheme::for_pair(current, baseline);

    // Later duplicates win, matching the last row the portal rendered.
    let baseline_map: HashMap<CourseKey, &GradeRecord> = baseline
        .records()
        .iter()
        .map(|r| (scheme.key(r), r))
        .collect();

    let changes = current
        .records()
        .iter()
        .filter_map(|record| match baseline_map.get(&scheme.key(record)) {
            None => Some(GradeChange {
                kind: ChangeKind::New,
                record: record.clone(),
            }),
            Some(old) if old.result != record.result => Some(GradeChange {
                kind: ChangeKind::Changed {
                    previous: old.result.clone(),
                },
                record: record.clone(),
            }),
            Some(_) => None,
        })
        .collect();

    ChangeSet {
        changes,
        bootstrap: baseline.is_empty(),
    }
}

/// True when every current record has an identical stored counterpart, so a commit
/// would add nothing. Order and courses missing from `current` do not matter.
pub fn is_covered(current: &GradeSnapshot, baseline: &GradeSnapshot) -> bool {
    let scheme = KeyScheme::for_pair(current, baseline);
    let stored: HashMap<CourseKey, &GradeRecord> = baseline
        .records()
        .iter()
        .map(|r| (scheme.key(r), r))
        .collect();

    current
        .records()
        .iter()
        .all(|record| stored.get(&scheme.key(record)).is_some_and(|old| *old == record))
}

fn integer_score() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+$").expect("valid score pattern"))
}

/// Credit-weighted average over rows with a plain integer result. Pass/fail and
/// letter grades are skipped, as are rows whose credit is not a non-negative number.
pub fn weighted_average(snapshot: &GradeSnapshot) -> f64 {
    let (weighted, credits) = snapshot
        .records()
        .iter()
        .filter_map(|r| {
            let result = r.result.as_deref()?.trim();
            if !integer_score().is_match(result) {
                return None;
            }
            let score: f64 = result.parse().ok()?;
            let credit: f64 = r.credit.as_deref()?.trim().parse().ok()?;
            (credit.is_finite() && credit >= 0.0).then_some((score, credit))
        })
        .fold((0.0, 0.0), |(sum, total), (score, credit)| {
            (sum + score * credit, total + credit)
        });

    if credits > 0.0 {
        (weighted / credits * 100.0).round() / 100.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn snapshot(rows: &[(&str, &str)]) -> GradeSnapshot {
        GradeSnapshot::new(
            rows.iter().map(|(c, r)| GradeRecord::new(*c, *r)).collect(),
            Vec::new(),
        )
    }

    fn courses(changes: &ChangeSet) -> Vec<(&str, &str)> {
        changes
            .records()
            .map(|r| (r.course.as_str(), r.result_text()))
            .collect()
    }

    #[test]
    fn identical_snapshots_yield_nothing() {
        let s = snapshot(&[("Calculus", "88"), ("Physics", "91"), ("体育", "P")]);
        assert!(detect(&s, &s).is_empty());
        assert!(detect(&GradeSnapshot::empty(), &GradeSnapshot::empty()).is_empty());
    }

    #[test]
    fn new_course_is_reported_alone() {
        let baseline = snapshot(&[("Calculus", "88")]);
        let current = snapshot(&[("Calculus", "88"), ("Physics", "91")]);

        let changes = detect(&current, &baseline);
        assert_eq!(courses(&changes), vec![("Physics", "91")]);
        assert_eq!(changes.changes[0].kind, ChangeKind::New);
        assert!(!changes.bootstrap);
    }

    #[test]
    fn changed_result_is_reported_with_previous_value() {
        let baseline = snapshot(&[("Calculus", "88"), ("Physics", "")]);
        let mut rows = vec![GradeRecord::new("Calculus", "88"), GradeRecord::new("Physics", "91")];
        rows[1].teacher = Some("李四".into());
        let current = GradeSnapshot::new(rows, Vec::new());

        let changes = detect(&current, &baseline);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.changes[0].record.course, "Physics");
        assert_eq!(
            changes.changes[0].kind,
            ChangeKind::Changed {
                previous: Some(String::new())
            }
        );
    }

    #[test]
    fn other_field_changes_are_ignored() {
        let baseline = snapshot(&[("Calculus", "88")]);
        let mut record = GradeRecord::new("Calculus", "88");
        record.grade_point = Some("3.7".into());
        let current = GradeSnapshot::new(vec![record], Vec::new());
        assert!(detect(&current, &baseline).is_empty());
    }

    #[test]
    fn comparison_is_string_exact() {
        let changes = detect(&snapshot(&[("Calculus", "90.0")]), &snapshot(&[("Calculus", "90")]));
        assert_eq!(courses(&changes), vec![("Calculus", "90.0")]);
    }

    #[test]
    fn keys_are_case_sensitive() {
        let changes = detect(&snapshot(&[("physics", "91")]), &snapshot(&[("Physics", "91")]));
        assert_eq!(changes.changes[0].kind, ChangeKind::New);
    }

    #[test]
    fn output_follows_current_order() {
        let baseline = snapshot(&[("D", "1"), ("C", "1"), ("B", "1"), ("A", "1")]);
        let current = snapshot(&[("A", "2"), ("E", "9"), ("B", "1"), ("C", "3")]);

        let changes = detect(&current, &baseline);
        assert_eq!(courses(&changes), vec![("A", "2"), ("E", "9"), ("C", "3")]);
    }

    #[test]
    fn empty_baseline_announces_everything() {
        let current = snapshot(&[("X", "75")]);
        let changes = detect(&current, &GradeSnapshot::empty());
        assert_eq!(courses(&changes), vec![("X", "75")]);
        assert!(changes.bootstrap);
    }

    #[test]
    fn term_keys_separate_retaken_courses() {
        let mut first = GradeRecord::new("Calculus", "55");
        first.term = Some("2022-1".into());
        let mut retake = GradeRecord::new("Calculus", "80");
        retake.term = Some("2023-1".into());

        let baseline = GradeSnapshot::new(vec![first.clone()], Vec::new());
        let current = GradeSnapshot::new(vec![first, retake.clone()], Vec::new());

        assert_eq!(KeyScheme::for_pair(&current, &baseline), KeyScheme::NameTerm);
        let changes = detect(&current, &baseline);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.changes[0].record, retake);
        assert_eq!(changes.changes[0].kind, ChangeKind::New);
    }

    #[test]
    fn old_schema_baseline_falls_back_to_names() {
        let baseline = snapshot(&[("Calculus", "88")]);
        let mut record = GradeRecord::new("Calculus", "88");
        record.code = Some("MATH101".into());
        record.term = Some("2023-1".into());
        let current = GradeSnapshot::new(vec![record], Vec::new());

        assert_eq!(KeyScheme::for_pair(&current, &baseline), KeyScheme::Name);
        assert!(detect(&current, &baseline).is_empty());
    }

    #[test]
    fn coverage_ignores_order_and_dropped_rows() {
        let baseline = snapshot(&[("Calculus", "88"), ("Physics", "91"), ("Chemistry", "77")]);
        assert!(is_covered(&snapshot(&[("Physics", "91"), ("Calculus", "88")]), &baseline));
        assert!(!is_covered(&snapshot(&[("Biology", "60"), ("Calculus", "88")]), &baseline));

        let mut refreshed = GradeRecord::new("Calculus", "88");
        refreshed.grade_point = Some("3.7".into());
        assert!(!is_covered(&GradeSnapshot::new(vec![refreshed], Vec::new()), &baseline));
    }

    #[test]
    fn weighted_average_skips_pass_fail() {
        let mut rows = vec![
            GradeRecord::new("A", "80"),
            GradeRecord::new("B", "90"),
            GradeRecord::new("C", "P"),
        ];
        for (row, credit) in rows.iter_mut().zip(["3", "2", "1"]) {
            row.credit = Some(credit.into());
        }
        let average = weighted_average(&GradeSnapshot::new(rows, Vec::new()));
        assert!((average - 84.0).abs() < f64::EPSILON);
    }

    #[test]
    fn weighted_average_without_credits_is_zero() {
        assert_eq!(weighted_average(&GradeSnapshot::empty()), 0.0);

        let mut row = GradeRecord::new("A", "95");
        row.credit = Some("0".into());
        assert_eq!(weighted_average(&GradeSnapshot::new(vec![row], Vec::new())), 0.0);
    }

    #[test]
    fn weighted_average_rounds_to_two_places() {
        let mut rows = vec![GradeRecord::new("A", "85"), GradeRecord::new("B", "90"), GradeRecord::new("C", "-5")];
        rows[0].credit = Some("2".into());
        rows[1].credit = Some("1".into());
        rows[2].credit = Some("4".into());
        // (170 + 90) / 3 = 86.666…
        assert_eq!(weighted_average(&GradeSnapshot::new(rows, Vec::new())), 86.67);
    }
}
