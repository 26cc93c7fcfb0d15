use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// One cookie-style token of an authenticated portal session.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub name: String,
    pub value: String,
    /// Host that issued the token. `None` for pasted headers, which apply to every portal host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Opaque session credential bound to the portal origin.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Credential {
    pub origin: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
    pub tokens: Vec<SessionToken>,
}

impl Credential {
    pub fn new(origin: Url, tokens: Vec<SessionToken>) -> Self {
        Self {
            origin,
            issued_at: Some(Utc::now()),
            tokens,
        }
    }

    /// Parses a browser `Cookie` header (`a=1; b=2`). Pairs without `=` or with
    /// an empty name are skipped; returns `None` when nothing usable is left.
    pub fn from_cookie_header(origin: Url, header: &str) -> Option<Self> {
        let tokens: Vec<SessionToken> = header
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some(SessionToken {
                    name: name.to_string(),
                    value: value.trim().to_string(),
                    host: None,
                })
            })
            .collect();

        if tokens.is_empty() {
            None
        } else {
            Some(Self::new(origin, tokens))
        }
    }

    pub fn cookie_header(&self) -> String {
        self.tokens
            .iter()
            .map(|t| format!("{}={}", t.name, t.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn is_usable(&self) -> bool {
        !self.tokens.is_empty() && self.tokens.iter().all(|t| !t.name.is_empty())
    }
}

/// Renders a token value for logs without leaking it.
pub fn redact(value: &str) -> String {
    let prefix: String = value.chars().take(4).collect();
    if prefix.len() == value.len() {
        "…".to_string()
    } else {
        format!("{prefix}…")
    }
}

/// One row of the grade table. Known columns are lifted into typed fields; anything
/// else is kept verbatim in `raw` so newer portal columns survive a round trip.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct GradeRecord {
    #[serde(alias = "course_name")]
    pub course: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, alias = "semester", skip_serializing_if = "Option::is_none")]
    pub term: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teacher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usual_score: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub midterm_score: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exam_score: Option<String>,
    #[serde(default, alias = "grade", skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade_point: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub raw: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Course,
    Code,
    Term,
    Teacher,
    Credit,
    CourseType,
    Module,
    UsualScore,
    MidtermScore,
    ExamScore,
    Result,
    GradePoint,
    Note,
}

// Column headers seen across portal revisions, plus the keys of the old JSON export.
const HEADER_ALIASES: &[(&str, Field)] = &[
    ("course", Field::Course),
    ("course_name", Field::Course),
    ("课程名称", Field::Course),
    ("课程名", Field::Course),
    ("课程号", Field::Code),
    ("课程代码", Field::Code),
    ("课程编号", Field::Code),
    ("semester", Field::Term),
    ("学期", Field::Term),
    ("学年学期", Field::Term),
    ("教师", Field::Teacher),
    ("任课教师", Field::Teacher),
    ("credit", Field::Credit),
    ("学分", Field::Credit),
    ("course_type", Field::CourseType),
    ("课程类型", Field::CourseType),
    ("课程类别", Field::CourseType),
    ("课程性质", Field::CourseType),
    ("模块", Field::Module),
    ("课程模块", Field::Module),
    ("平时成绩", Field::UsualScore),
    ("期中成绩", Field::MidtermScore),
    ("期末成绩", Field::ExamScore),
    ("result", Field::Result),
    ("grade", Field::Result),
    ("最终成绩", Field::Result),
    ("总评成绩", Field::Result),
    ("总成绩", Field::Result),
    ("成绩", Field::Result),
    ("学分绩点", Field::GradePoint),
    ("绩点", Field::GradePoint),
    ("备注", Field::Note),
];

fn field_for(header: &str) -> Option<Field> {
    let header = header.trim();
    HEADER_ALIASES
        .iter()
        .find(|(alias, _)| *alias == header)
        .map(|(_, field)| *field)
}

impl GradeRecord {
    pub fn new(course: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            course: course.into(),
            result: Some(result.into()),
            ..Self::default()
        }
    }

    /// Builds a record from one table row. Returns `None` when the row has no
    /// course name, since the course is the record's identity.
    pub fn from_row<H: AsRef<str>, C: AsRef<str>>(headers: &[H], cells: &[C]) -> Option<Self> {
        let mut record = Self::default();

        for (header, cell) in headers.iter().zip(cells.iter()) {
            let header = header.as_ref().trim();
            let value = cell.as_ref().trim().to_string();
            let slot = match field_for(header) {
                Some(Field::Course) => {
                    if record.course.is_empty() {
                        record.course = value;
                    }
                    continue;
                }
                Some(Field::Code) => &mut record.code,
                Some(Field::Term) => &mut record.term,
                Some(Field::Teacher) => &mut record.teacher,
                Some(Field::Credit) => &mut record.credit,
                Some(Field::CourseType) => &mut record.course_type,
                Some(Field::Module) => &mut record.module,
                Some(Field::UsualScore) => &mut record.usual_score,
                Some(Field::MidtermScore) => &mut record.midterm_score,
                Some(Field::ExamScore) => &mut record.exam_score,
                Some(Field::Result) => &mut record.result,
                Some(Field::GradePoint) => &mut record.grade_point,
                Some(Field::Note) => &mut record.note,
                None => {
                    if !header.is_empty() {
                        record.raw.insert(header.to_string(), value);
                    }
                    continue;
                }
            };
            // First matching column wins when two aliases appear in one header row.
            if slot.is_none() && !value.is_empty() {
                *slot = Some(value);
            }
        }

        if record.course.is_empty() {
            None
        } else {
            Some(record)
        }
    }

    pub fn result_text(&self) -> &str {
        self.result.as_deref().unwrap_or("-")
    }
}

/// Grades as observed at one point in time.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct GradeSnapshot {
    #[serde(rename = "grades")]
    records: Vec<GradeRecord>,
    #[serde(default)]
    summary: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    captured_at: Option<DateTime<Utc>>,
}

impl GradeSnapshot {
    pub fn new(records: Vec<GradeRecord>, summary: Vec<String>) -> Self {
        Self {
            records,
            summary,
            captured_at: Some(Utc::now()),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn restore(
        records: Vec<GradeRecord>,
        summary: Vec<String>,
        captured_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            records,
            summary,
            captured_at,
        }
    }

    pub fn records(&self) -> &[GradeRecord] {
        &self.records
    }

    pub fn summary(&self) -> &[String] {
        &self.summary
    }

    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        self.captured_at
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Identity of a course inside a snapshot pair, see `diff::KeyScheme`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CourseKey {
    Name(String),
    NameTerm(String, String),
    Code(String),
}

impl fmt::Display for CourseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{name}"),
            Self::NameTerm(name, term) => write!(f, "{name} ({term})"),
            Self::Code(code) => write!(f, "#{code}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    New,
    Changed { previous: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradeChange {
    pub kind: ChangeKind,
    pub record: GradeRecord,
}

/// New or changed grades, in the order they appear in the current snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub changes: Vec<GradeChange>,
    /// The baseline was empty, so every entry is a first-run announcement.
    pub bootstrap: bool,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn records(&self) -> impl Iterator<Item = &GradeRecord> {
        self.changes.iter().map(|c| &c.record)
    }
}
