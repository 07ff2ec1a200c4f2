use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{NaiveDate, NaiveTime};
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

fn calc_err(e: calc::CalcError) -> HandlerErr {
    let code = match e.code.as_str() {
        "db_update_failed" => "db_update_failed",
        _ => "db_query_failed",
    };
    HandlerErr {
        code,
        message: e.message,
        details: None,
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

fn parse_date_param(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let raw = get_required_str(params, key)?;
    let t = raw.trim();
    if NaiveDate::parse_from_str(t, "%Y-%m-%d").is_err() {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("{} must be YYYY-MM-DD", key),
            details: None,
        });
    }
    Ok(t.to_string())
}

fn parse_time_param(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let raw = get_required_str(params, key)?;
    let t = raw.trim();
    if NaiveTime::parse_from_str(t, "%H:%M").is_err() {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("{} must be HH:MM", key),
            details: None,
        });
    }
    Ok(t.to_string())
}

fn parse_optional_time(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    let Some(v) = params.get(key) else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    let Some(s) = v.as_str() else {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("{} must be string or null", key),
            details: None,
        });
    };
    let t = s.trim();
    if t.is_empty() {
        return Ok(None);
    }
    if NaiveTime::parse_from_str(t, "%H:%M").is_err() {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("{} must be HH:MM", key),
            details: None,
        });
    }
    Ok(Some(t.to_string()))
}

fn parse_status(params: &serde_json::Value) -> Result<calc::AttendanceStatus, HandlerErr> {
    let raw = get_required_str(params, "status")?;
    calc::AttendanceStatus::parse(raw.trim()).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "status must be present, absent, late or excused".to_string(),
        details: None,
    })
}

fn section_exists(conn: &Connection, section_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM sections WHERE id = ?", [section_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn session_section(conn: &Connection, session_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT section_id FROM attendance_sessions WHERE id = ?",
        [session_id],
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn session_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = get_required_str(params, "sectionId")?;
    let date = parse_date_param(params, "date")?;
    let start_time = parse_time_param(params, "startTime")?;
    let end_time = parse_time_param(params, "endTime")?;
    let topic = params
        .get("topic")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());
    let notes = params
        .get("notes")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if !section_exists(conn, &section_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "section not found".to_string(),
            details: None,
        });
    }

    let dup: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM attendance_sessions
             WHERE section_id = ? AND date = ? AND start_time = ?",
            (&section_id, &date, &start_time),
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
            message: "a session already exists at that date and time".to_string(),
            details: None,
        });
    }

    let session_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO attendance_sessions(id, section_id, date, start_time, end_time, topic, notes, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &session_id,
            &section_id,
            &date,
            &start_time,
            &end_time,
            &topic,
            &notes,
            &now_ts(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance_sessions" })),
    })?;

    Ok(json!({ "sessionId": session_id, "date": date }))
}

fn session_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = get_required_str(params, "sectionId")?;
    if !section_exists(conn, &section_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "section not found".to_string(),
            details: None,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, date, start_time, end_time, topic,
                    (SELECT COUNT(*) FROM attendance a WHERE a.session_id = attendance_sessions.id)
             FROM attendance_sessions
             WHERE section_id = ?
             ORDER BY date, start_time",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([&section_id], |r| {
            Ok(json!({
                "sessionId": r.get::<_, String>(0)?,
                "date": r.get::<_, String>(1)?,
                "startTime": r.get::<_, String>(2)?,
                "endTime": r.get::<_, String>(3)?,
                "topic": r.get::<_, Option<String>>(4)?,
                "markedCount": r.get::<_, i64>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "sectionId": section_id, "sessions": rows }))
}

fn upsert_record(
    conn: &Connection,
    student_id: &str,
    session_id: &str,
    status: calc::AttendanceStatus,
    arrival_time: Option<&str>,
    notes: Option<&str>,
    marked_by: &str,
    now: &str,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO attendance(id, student_id, session_id, status, arrival_time, notes, marked_by, marked_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, session_id) DO UPDATE SET
           status = excluded.status,
           arrival_time = excluded.arrival_time,
           notes = excluded.notes,
           marked_by = excluded.marked_by,
           marked_at = excluded.marked_at",
        (
            Uuid::new_v4().to_string(),
            student_id,
            session_id,
            status.as_str(),
            arrival_time,
            notes,
            marked_by,
            now,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance" })),
    })?;
    Ok(())
}

/// Mark one student for one session, then rebuild that student's summary for
/// the owning section. Record and summary land in the same transaction.
fn attendance_mark(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let student_id = get_required_str(params, "studentId")?;
    let marked_by = get_required_str(params, "markedBy")?;
    let status = parse_status(params)?;
    let arrival_time = parse_optional_time(params, "arrivalTime")?;
    let notes = params
        .get("notes")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let Some(section_id) = session_section(conn, &session_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "session not found".to_string(),
            details: None,
        });
    };
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let now = now_ts();
    upsert_record(
        &tx,
        &student_id,
        &session_id,
        status,
        arrival_time.as_deref(),
        notes.as_deref(),
        &marked_by,
        &now,
    )?;
    let summary = calc::recompute_attendance_summary(&tx, &student_id, &section_id, &now)
        .map_err(calc_err)?;
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "summary": summary }))
}

/// One record per listed student inside a single transaction; every affected
/// (student, section) summary is rebuilt before the commit. Unknown student
/// ids are skipped, mirroring roster drift between client and workspace.
fn attendance_bulk_mark(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let marked_by = get_required_str(params, "markedBy")?;
    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing entries".to_string(),
            details: None,
        });
    };

    let Some(section_id) = session_section(conn, &session_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "session not found".to_string(),
            details: None,
        });
    };

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let now = now_ts();
    let mut marked: Vec<String> = Vec::new();
    for entry in entries {
        let student_id = get_required_str(entry, "studentId")?;
        let status = parse_status(entry)?;
        let arrival_time = parse_optional_time(entry, "arrivalTime")?;
        if !student_exists(&tx, &student_id)? {
            continue;
        }
        upsert_record(
            &tx,
            &student_id,
            &session_id,
            status,
            arrival_time.as_deref(),
            None,
            &marked_by,
            &now,
        )?;
        marked.push(student_id);
    }
    for student_id in &marked {
        calc::recompute_attendance_summary(&tx, student_id, &section_id, &now)
            .map_err(calc_err)?;
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "markedCount": marked.len() }))
}

/// Remove one record entirely (unmark), then rebuild the summary so the
/// session stops counting toward the student's totals.
fn attendance_clear(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let student_id = get_required_str(params, "studentId")?;

    let Some(section_id) = session_section(conn, &session_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "session not found".to_string(),
            details: None,
        });
    };

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let removed = tx
        .execute(
            "DELETE FROM attendance WHERE student_id = ? AND session_id = ?",
            (&student_id, &session_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance" })),
        })?;
    if removed == 0 {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "not_found",
            message: "attendance record not found".to_string(),
            details: None,
        });
    }
    let summary = calc::recompute_attendance_summary(&tx, &student_id, &section_id, &now_ts())
        .map_err(calc_err)?;
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "summary": summary }))
}

fn attendance_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let section_id = get_required_str(params, "sectionId")?;

    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }
    if !section_exists(conn, &section_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "section not found".to_string(),
            details: None,
        });
    }

    let summary =
        calc::load_attendance_summary(conn, &student_id, &section_id).map_err(calc_err)?;
    Ok(json!({ "summary": summary }))
}

fn attendance_section_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = get_required_str(params, "sectionId")?;
    if !section_exists(conn, &section_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "section not found".to_string(),
            details: None,
        });
    }

    // Dropped students keep their stored summary but fall off this view.
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.student_no, p.full_name, e.status
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             JOIN profiles p ON p.id = s.profile_id
             WHERE e.section_id = ? AND e.status IN ('enrolled', 'completed')
             ORDER BY s.student_no",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let members: Vec<(String, String, String, String)> = stmt
        .query_map([&section_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let mut rows: Vec<serde_json::Value> = Vec::with_capacity(members.len());
    for (student_id, student_no, full_name, enrollment_status) in members {
        let summary =
            calc::load_attendance_summary(conn, &student_id, &section_id).map_err(calc_err)?;
        rows.push(json!({
            "studentId": student_id,
            "studentNo": student_no,
            "fullName": full_name,
            "enrollmentStatus": enrollment_status,
            "summary": summary
        }));
    }

    Ok(json!({ "sectionId": section_id, "students": rows }))
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
        "attendance.sessionCreate" => Some(with_conn(state, req, session_create)),
        "attendance.sessionList" => Some(with_conn(state, req, session_list)),
        "attendance.mark" => Some(with_conn(state, req, attendance_mark)),
        "attendance.bulkMark" => Some(with_conn(state, req, attendance_bulk_mark)),
        "attendance.clear" => Some(with_conn(state, req, attendance_clear)),
        "attendance.summary" => Some(with_conn(state, req, attendance_summary)),
        "attendance.sectionSummary" => Some(with_conn(state, req, attendance_section_summary)),
        _ => None,
    }
}
