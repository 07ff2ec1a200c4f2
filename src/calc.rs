use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

impl AttendanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            "late" => Some(Self::Late),
            "excused" => Some(Self::Excused),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Late => "late",
            Self::Excused => "excused",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttendanceCounts {
    pub present: u32,
    pub absent: u32,
    pub late: u32,
    pub excused: u32,
}

impl AttendanceCounts {
    pub fn tally<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = AttendanceStatus>,
    {
        let mut counts = Self::default();
        for s in statuses {
            match s {
                AttendanceStatus::Present => counts.present += 1,
                AttendanceStatus::Absent => counts.absent += 1,
                AttendanceStatus::Late => counts.late += 1,
                AttendanceStatus::Excused => counts.excused += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> u32 {
        self.present + self.absent + self.late + self.excused
    }

    /// Present and late both count as attended.
    pub fn attended(&self) -> u32 {
        self.present + self.late
    }

    /// attended/total*100; zero sessions is defined as 0.0, not an error.
    pub fn percentage(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (self.attended() as f64 / total as f64) * 100.0
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub student_id: String,
    pub section_id: String,
    pub total_sessions: i64,
    pub present_count: i64,
    pub absent_count: i64,
    pub late_count: i64,
    pub excused_count: i64,
    pub attendance_percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Rebuild the (student, section) summary from scratch: scan every attendance
/// row for that student across the section's sessions, tally per status, and
/// replace the stored row in one upsert. Re-running against unchanged records
/// reproduces identical values.
pub fn recompute_attendance_summary(
    conn: &Connection,
    student_id: &str,
    section_id: &str,
    now: &str,
) -> Result<AttendanceSummary, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT a.status
             FROM attendance a
             JOIN attendance_sessions s ON s.id = a.session_id
             WHERE a.student_id = ? AND s.section_id = ?",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let statuses: Vec<String> = stmt
        .query_map((student_id, section_id), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    // Unrecognized status text would mean a corrupted row; count it as absent
    // rather than dropping it from the total.
    let counts = AttendanceCounts::tally(
        statuses
            .iter()
            .map(|s| AttendanceStatus::parse(s).unwrap_or(AttendanceStatus::Absent)),
    );

    let summary = AttendanceSummary {
        student_id: student_id.to_string(),
        section_id: section_id.to_string(),
        total_sessions: counts.total() as i64,
        present_count: counts.present as i64,
        absent_count: counts.absent as i64,
        late_count: counts.late as i64,
        excused_count: counts.excused as i64,
        attendance_percentage: counts.percentage(),
    };

    conn.execute(
        "INSERT INTO attendance_summaries(
            student_id, section_id, total_sessions, present_count, absent_count,
            late_count, excused_count, attendance_percentage, last_updated)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, section_id) DO UPDATE SET
           total_sessions = excluded.total_sessions,
           present_count = excluded.present_count,
           absent_count = excluded.absent_count,
           late_count = excluded.late_count,
           excused_count = excluded.excused_count,
           attendance_percentage = excluded.attendance_percentage,
           last_updated = excluded.last_updated",
        (
            &summary.student_id,
            &summary.section_id,
            summary.total_sessions,
            summary.present_count,
            summary.absent_count,
            summary.late_count,
            summary.excused_count,
            summary.attendance_percentage,
            now,
        ),
    )
    .map_err(|e| CalcError::new("db_update_failed", e.to_string()))?;

    Ok(summary)
}

/// Read the stored summary. A student with no marked sessions answers zeros,
/// matching the zero-sessions-defined behavior of the aggregator itself.
pub fn load_attendance_summary(
    conn: &Connection,
    student_id: &str,
    section_id: &str,
) -> Result<AttendanceSummary, CalcError> {
    let row = conn
        .query_row(
            "SELECT total_sessions, present_count, absent_count, late_count,
                    excused_count, attendance_percentage
             FROM attendance_summaries
             WHERE student_id = ? AND section_id = ?",
            (student_id, section_id),
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, f64>(5)?,
                ))
            },
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let (total, present, absent, late, excused, percentage) =
        row.unwrap_or((0, 0, 0, 0, 0, 0.0));
    Ok(AttendanceSummary {
        student_id: student_id.to_string(),
        section_id: section_id.to_string(),
        total_sessions: total,
        present_count: present,
        absent_count: absent,
        late_count: late,
        excused_count: excused,
        attendance_percentage: percentage,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LetterGrade {
    APlus,
    A,
    AMinus,
    BPlus,
    B,
    BMinus,
    CPlus,
    C,
    CMinus,
    D,
    F,
    Incomplete,
    Withdrawn,
}

/// Descending breakpoints; first band whose minimum is <= the score wins.
const GRADE_BANDS: [(f64, LetterGrade); 11] = [
    (95.0, LetterGrade::APlus),
    (90.0, LetterGrade::A),
    (85.0, LetterGrade::AMinus),
    (80.0, LetterGrade::BPlus),
    (75.0, LetterGrade::B),
    (70.0, LetterGrade::BMinus),
    (65.0, LetterGrade::CPlus),
    (60.0, LetterGrade::C),
    (55.0, LetterGrade::CMinus),
    (50.0, LetterGrade::D),
    (0.0, LetterGrade::F),
];

impl LetterGrade {
    /// Map a numerical grade onto the breakpoint table. Incomplete and
    /// Withdrawn are registrar-entered states; nothing maps a score to them.
    pub fn classify(numerical_grade: f64) -> Self {
        for (min, letter) in GRADE_BANDS {
            if numerical_grade >= min {
                return letter;
            }
        }
        LetterGrade::F
    }

    /// None for Incomplete/Withdrawn: they carry no grade-point weight.
    pub fn gpa_points(self) -> Option<f64> {
        match self {
            Self::APlus | Self::A => Some(4.0),
            Self::AMinus => Some(3.7),
            Self::BPlus => Some(3.3),
            Self::B => Some(3.0),
            Self::BMinus => Some(2.7),
            Self::CPlus => Some(2.3),
            Self::C => Some(2.0),
            Self::CMinus => Some(1.7),
            Self::D => Some(1.0),
            Self::F => Some(0.0),
            Self::Incomplete | Self::Withdrawn => None,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "A+" => Some(Self::APlus),
            "A" => Some(Self::A),
            "A-" => Some(Self::AMinus),
            "B+" => Some(Self::BPlus),
            "B" => Some(Self::B),
            "B-" => Some(Self::BMinus),
            "C+" => Some(Self::CPlus),
            "C" => Some(Self::C),
            "C-" => Some(Self::CMinus),
            "D" => Some(Self::D),
            "F" => Some(Self::F),
            "I" => Some(Self::Incomplete),
            "W" => Some(Self::Withdrawn),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::APlus => "A+",
            Self::A => "A",
            Self::AMinus => "A-",
            Self::BPlus => "B+",
            Self::B => "B",
            Self::BMinus => "B-",
            Self::CPlus => "C+",
            Self::C => "C",
            Self::CMinus => "C-",
            Self::D => "D",
            Self::F => "F",
            Self::Incomplete => "I",
            Self::Withdrawn => "W",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GpaEntry {
    pub letter: LetterGrade,
    pub credits: i64,
}

/// Credit-weighted GPA over a student's final grades. Incomplete and Withdrawn
/// rows drop out of both numerator and denominator; no graded credits => 0.0.
pub fn credit_weighted_gpa<I>(entries: I) -> f64
where
    I: IntoIterator<Item = GpaEntry>,
{
    let mut weighted = 0.0_f64;
    let mut credits = 0.0_f64;
    for e in entries {
        let Some(points) = e.letter.gpa_points() else {
            continue;
        };
        weighted += points * e.credits as f64;
        credits += e.credits as f64;
    }
    if credits > 0.0 {
        weighted / credits
    } else {
        0.0
    }
}
