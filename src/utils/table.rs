use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::models::{GradeRecord, GradeSnapshot};

/// Columns written by `save`, in the order `show` displays them.
pub const COLUMNS: &[&str] = &[
    "课程名称", "课程号", "学期", "教师", "学分", "课程类别", "最终成绩", "绩点", "备注",
];

pub fn row(record: &GradeRecord) -> Vec<String> {
    GradeRow::from(record).fields().into_iter().map(|c| c.into_owned()).collect()
}

pub fn rows(snapshot: &GradeSnapshot) -> Vec<Vec<String>> {
    snapshot.records().iter().map(row).collect()
}

#[derive(Tabled)]
struct GradeRow<'a> {
    #[tabled(rename = "课程名称")]
    course: &'a str,
    #[tabled(rename = "课程号")]
    code: &'a str,
    #[tabled(rename = "学期")]
    term: &'a str,
    #[tabled(rename = "教师")]
    teacher: &'a str,
    #[tabled(rename = "学分")]
    credit: &'a str,
    #[tabled(rename = "课程类别")]
    course_type: &'a str,
    #[tabled(rename = "最终成绩")]
    result: &'a str,
    #[tabled(rename = "绩点")]
    grade_point: &'a str,
    #[tabled(rename = "备注")]
    note: &'a str,
}

impl<'a> From<&'a GradeRecord> for GradeRow<'a> {
    fn from(record: &'a GradeRecord) -> Self {
        let cell = |value: &'a Option<String>| value.as_deref().unwrap_or("");
        Self {
            course: &record.course,
            code: cell(&record.code),
            term: cell(&record.term),
            teacher: cell(&record.teacher),
            credit: cell(&record.credit),
            course_type: cell(&record.course_type),
            result: cell(&record.result),
            grade_point: cell(&record.grade_point),
            note: cell(&record.note),
        }
    }
}

/// Renders the grades for the terminal. Cell widths follow the terminal's
/// notion of character width, so CJK course names line up.
#[must_use]
pub fn render(snapshot: &GradeSnapshot) -> String {
    Table::new(snapshot.records().iter().map(GradeRow::from))
        .with(Style::modern())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn snapshot() -> GradeSnapshot {
        let mut calculus = GradeRecord::new("高等数学", "92");
        calculus.credit = Some("4".into());
        GradeSnapshot::new(vec![calculus, GradeRecord::new("Physics 📚", "A")], Vec::new())
    }

    #[test]
    fn headers_match_export_columns() {
        assert_eq!(GradeRow::headers().len(), COLUMNS.len());
        for (header, column) in GradeRow::headers().iter().zip(COLUMNS) {
            assert_eq!(&**header, *column);
        }
    }

    #[test]
    fn table_lists_every_record() {
        let table = render(&snapshot());
        assert!(table.starts_with('┌'));
        assert!(table.contains("高等数学"));
        assert!(table.contains("Physics 📚"));
        assert!(table.contains("最终成绩"));
    }

    #[test]
    fn grade_rows_follow_columns() {
        let mut record = GradeRecord::new("Calculus", "88");
        record.credit = Some("4".into());
        let cells = row(&record);
        assert_eq!(cells.len(), COLUMNS.len());
        assert_eq!(cells[0], "Calculus");
        assert_eq!(cells[4], "4");
        assert_eq!(cells[6], "88");
    }
}
