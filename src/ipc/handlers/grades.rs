use crate::calc::{self, LetterGrade};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn get_required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    conn.query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })
}

fn not_found(what: &str) -> HandlerErr {
    HandlerErr {
        code: "not_found",
        message: format!("{} not found", what),
        details: None,
    }
}

fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn percentage_of(points: f64, max_points: f64) -> f64 {
    if max_points > 0.0 {
        (points / max_points) * 100.0
    } else {
        0.0
    }
}

fn components_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = get_required_str(params, "sectionId")?;
    let name = {
        let raw = get_required_str(params, "name")?;
        let t = raw.trim().to_string();
        if t.is_empty() {
            return Err(HandlerErr {
                code: "bad_params",
                message: "name must not be empty".to_string(),
                details: None,
            });
        }
        t
    };
    let weight_percentage = get_required_f64(params, "weightPercentage")?;
    if !(0.0..=100.0).contains(&weight_percentage) {
        return Err(HandlerErr {
            code: "bad_params",
            message: "weightPercentage must be between 0 and 100".to_string(),
            details: None,
        });
    }
    let max_points = match params.get("maxPoints") {
        None => 100.0,
        Some(v) => match v.as_f64() {
            Some(n) if n > 0.0 => n,
            _ => {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "maxPoints must be positive".to_string(),
                    details: None,
                })
            }
        },
    };

    if !row_exists(conn, "sections", &section_id)? {
        return Err(not_found("section"));
    }

    let dup: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM grade_components WHERE section_id = ? AND name = ?",
            (&section_id, &name),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    if dup.is_some() {
        return Err(HandlerErr {
            code: "conflict",
            message: "component with that name already exists in this section".to_string(),
            details: None,
        });
    }

    let component_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grade_components(id, section_id, name, weight_percentage, max_points)
         VALUES(?, ?, ?, ?, ?)",
        (
            &component_id,
            &section_id,
            &name,
            weight_percentage,
            max_points,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "grade_components" })),
    })?;

    Ok(json!({ "componentId": component_id, "name": name }))
}

fn components_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = get_required_str(params, "sectionId")?;
    if !row_exists(conn, "sections", &section_id)? {
        return Err(not_found("section"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, name, weight_percentage, max_points
             FROM grade_components
             WHERE section_id = ?
             ORDER BY name",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([&section_id], |r| {
            Ok(json!({
                "componentId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "weightPercentage": r.get::<_, f64>(2)?,
                "maxPoints": r.get::<_, f64>(3)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "sectionId": section_id, "components": rows }))
}

fn grades_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let component_id = get_required_str(params, "componentId")?;
    let points_earned = get_required_f64(params, "pointsEarned")?;
    if points_earned < 0.0 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "pointsEarned must be >= 0".to_string(),
            details: None,
        });
    }
    let comments = params
        .get("comments")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if !row_exists(conn, "students", &student_id)? {
        return Err(not_found("student"));
    }
    let max_points: Option<f64> = conn
        .query_row(
            "SELECT max_points FROM grade_components WHERE id = ?",
            [&component_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some(max_points) = max_points else {
        return Err(not_found("grade component"));
    };

    conn.execute(
        "INSERT INTO grades(id, student_id, component_id, points_earned, comments, recorded_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, component_id) DO UPDATE SET
           points_earned = excluded.points_earned,
           comments = excluded.comments,
           recorded_at = excluded.recorded_at",
        (
            Uuid::new_v4().to_string(),
            &student_id,
            &component_id,
            points_earned,
            &comments,
            &now_ts(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "grades" })),
    })?;

    Ok(json!({
        "studentId": student_id,
        "componentId": component_id,
        "pointsEarned": points_earned,
        "percentage": percentage_of(points_earned, max_points)
    }))
}

fn grades_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = get_required_str(params, "sectionId")?;
    let student_filter = params
        .get("studentId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if !row_exists(conn, "sections", &section_id)? {
        return Err(not_found("section"));
    }

    let mut sql = String::from(
        "SELECT g.id, g.student_id, g.points_earned, g.comments, g.recorded_at,
                gc.id, gc.name, gc.weight_percentage, gc.max_points
         FROM grades g
         JOIN grade_components gc ON gc.id = g.component_id
         WHERE gc.section_id = ?",
    );
    let mut binds: Vec<String> = vec![section_id.clone()];
    if let Some(sid) = student_filter {
        sql.push_str(" AND g.student_id = ?");
        binds.push(sid);
    }
    sql.push_str(" ORDER BY gc.name, g.student_id");

    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            let points: f64 = r.get(2)?;
            let max_points: f64 = r.get(8)?;
            Ok(json!({
                "gradeId": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "pointsEarned": points,
                "comments": r.get::<_, Option<String>>(3)?,
                "recordedAt": r.get::<_, Option<String>>(4)?,
                "componentId": r.get::<_, String>(5)?,
                "componentName": r.get::<_, String>(6)?,
                "weightPercentage": r.get::<_, f64>(7)?,
                "maxPoints": max_points,
                "percentage": percentage_of(points, max_points)
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "sectionId": section_id, "grades": rows }))
}

/// Persist a final grade. letter/gpa are always derived from numericalGrade
/// here; any letterGrade or gpaPoints in the params is ignored outright.
fn final_grades_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let section_id = get_required_str(params, "sectionId")?;
    let numerical_grade = get_required_f64(params, "numericalGrade")?;
    if !(0.0..=100.0).contains(&numerical_grade) {
        return Err(HandlerErr {
            code: "bad_params",
            message: "numericalGrade must be between 0 and 100".to_string(),
            details: None,
        });
    }
    let comments = params
        .get("comments")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if !row_exists(conn, "students", &student_id)? {
        return Err(not_found("student"));
    }
    if !row_exists(conn, "sections", &section_id)? {
        return Err(not_found("section"));
    }

    let letter = LetterGrade::classify(numerical_grade);
    let gpa_points = letter.gpa_points().unwrap_or(0.0);

    conn.execute(
        "INSERT INTO final_grades(id, student_id, section_id, numerical_grade, letter_grade,
                                  gpa_points, comments, recorded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, section_id) DO UPDATE SET
           numerical_grade = excluded.numerical_grade,
           letter_grade = excluded.letter_grade,
           gpa_points = excluded.gpa_points,
           comments = excluded.comments,
           recorded_at = excluded.recorded_at",
        (
            Uuid::new_v4().to_string(),
            &student_id,
            &section_id,
            numerical_grade,
            letter.as_str(),
            gpa_points,
            &comments,
            &now_ts(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "final_grades" })),
    })?;

    Ok(json!({
        "studentId": student_id,
        "sectionId": section_id,
        "numericalGrade": numerical_grade,
        "letterGrade": letter.as_str(),
        "gpaPoints": gpa_points
    }))
}

fn final_grades_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = get_required_str(params, "sectionId")?;
    if !row_exists(conn, "sections", &section_id)? {
        return Err(not_found("section"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT fg.student_id, s.student_no, p.full_name,
                    fg.numerical_grade, fg.letter_grade, fg.gpa_points, fg.recorded_at
             FROM final_grades fg
             JOIN students s ON s.id = fg.student_id
             JOIN profiles p ON p.id = s.profile_id
             WHERE fg.section_id = ?
             ORDER BY s.student_no",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([&section_id], |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "studentNo": r.get::<_, String>(1)?,
                "fullName": r.get::<_, String>(2)?,
                "numericalGrade": r.get::<_, f64>(3)?,
                "letterGrade": r.get::<_, String>(4)?,
                "gpaPoints": r.get::<_, f64>(5)?,
                "recordedAt": r.get::<_, Option<String>>(6)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "sectionId": section_id, "finalGrades": rows }))
}

fn transcript(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !row_exists(conn, "students", &student_id)? {
        return Err(not_found("student"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT c.code, c.name, c.credits, sec.section_no, sem.name,
                    fg.numerical_grade, fg.letter_grade, fg.gpa_points
             FROM final_grades fg
             JOIN sections sec ON sec.id = fg.section_id
             JOIN courses c ON c.id = sec.course_id
             JOIN semesters sem ON sem.id = sec.semester_id
             WHERE fg.student_id = ?
             ORDER BY sem.start_date, c.code",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows: Vec<(String, String, i64, String, String, f64, String, f64)> = stmt
        .query_map([&student_id], |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
                r.get(7)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let gpa = calc::credit_weighted_gpa(rows.iter().filter_map(|row| {
        LetterGrade::parse(&row.6).map(|letter| calc::GpaEntry {
            letter,
            credits: row.2,
        })
    }));

    let entries: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            json!({
                "courseCode": row.0,
                "courseName": row.1,
                "credits": row.2,
                "sectionNo": row.3,
                "semesterName": row.4,
                "numericalGrade": row.5,
                "letterGrade": row.6,
                "gpaPoints": row.7
            })
        })
        .collect();

    Ok(json!({
        "studentId": student_id,
        "entries": entries,
        "gpa": gpa
    }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "gradeComponents.create" => Some(with_conn(state, req, components_create)),
        "gradeComponents.list" => Some(with_conn(state, req, components_list)),
        "grades.record" => Some(with_conn(state, req, grades_record)),
        "grades.list" => Some(with_conn(state, req, grades_list)),
        "finalGrades.record" => Some(with_conn(state, req, final_grades_record)),
        "finalGrades.list" => Some(with_conn(state, req, final_grades_list)),
        "transcript" => Some(with_conn(state, req, transcript)),
        _ => None,
    }
}
