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

fn section_capacity(conn: &Connection, section_id: &str) -> Result<Option<i64>, HandlerErr> {
    conn.query_row(
        "SELECT max_capacity FROM sections WHERE id = ?",
        [section_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn enrolled_count(conn: &Connection, section_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM enrollments WHERE section_id = ? AND status = 'enrolled'",
        [section_id],
        |r| r.get(0),
    )
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn existing_enrollment(
    conn: &Connection,
    student_id: &str,
    section_id: &str,
) -> Result<Option<(String, String)>, HandlerErr> {
    conn.query_row(
        "SELECT id, status FROM enrollments WHERE student_id = ? AND section_id = ?",
        (student_id, section_id),
        |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
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

fn enrollment_enroll(
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
    let Some(max_capacity) = section_capacity(conn, &section_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "section not found".to_string(),
            details: None,
        });
    };

    // Only active enrollments occupy seats; dropped and completed do not.
    let taken = enrolled_count(conn, &section_id)?;
    if taken >= max_capacity {
        return Err(HandlerErr {
            code: "conflict",
            message: "section is full".to_string(),
            details: Some(json!({ "maxCapacity": max_capacity, "enrolled": taken })),
        });
    }

    match existing_enrollment(conn, &student_id, &section_id)? {
        Some((_, status)) if status == "enrolled" => Err(HandlerErr {
            code: "conflict",
            message: "student is already enrolled in this section".to_string(),
            details: None,
        }),
        Some((_, status)) if status == "completed" => Err(HandlerErr {
            code: "conflict",
            message: "student already completed this section".to_string(),
            details: None,
        }),
        Some((enrollment_id, _)) => {
            // Dropped row: reactivate instead of inserting a duplicate pair.
            conn.execute(
                "UPDATE enrollments SET status = 'enrolled', enrolled_at = ? WHERE id = ?",
                (&now_ts(), &enrollment_id),
            )
            .map_err(|e| HandlerErr {
                code: "db_update_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "enrollments" })),
            })?;
            Ok(json!({ "enrollmentId": enrollment_id, "status": "enrolled", "reactivated": true }))
        }
        None => {
            let enrollment_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO enrollments(id, student_id, section_id, status, enrolled_at)
                 VALUES(?, ?, ?, 'enrolled', ?)",
                (&enrollment_id, &student_id, &section_id, &now_ts()),
            )
            .map_err(|e| HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "enrollments" })),
            })?;
            Ok(json!({ "enrollmentId": enrollment_id, "status": "enrolled", "reactivated": false }))
        }
    }
}

fn set_enrollment_status(
    conn: &Connection,
    params: &serde_json::Value,
    from: &str,
    to: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let section_id = get_required_str(params, "sectionId")?;

    let Some((enrollment_id, status)) = existing_enrollment(conn, &student_id, &section_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "enrollment not found".to_string(),
            details: None,
        });
    };
    if status != from {
        return Err(HandlerErr {
            code: "conflict",
            message: format!("enrollment is {}, expected {}", status, from),
            details: None,
        });
    }

    conn.execute(
        "UPDATE enrollments SET status = ? WHERE id = ?",
        (to, &enrollment_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "enrollments" })),
    })?;

    Ok(json!({ "enrollmentId": enrollment_id, "status": to }))
}

fn enrollment_roster(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = get_required_str(params, "sectionId")?;

    let section_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM sections WHERE id = ?", [&section_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    if section_exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "section not found".to_string(),
            details: None,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT e.id, e.status, e.enrolled_at, s.id, s.student_no, p.full_name
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             JOIN profiles p ON p.id = s.profile_id
             WHERE e.section_id = ?
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
                "enrollmentId": r.get::<_, String>(0)?,
                "status": r.get::<_, String>(1)?,
                "enrolledAt": r.get::<_, Option<String>>(2)?,
                "studentId": r.get::<_, String>(3)?,
                "studentNo": r.get::<_, String>(4)?,
                "fullName": r.get::<_, String>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "sectionId": section_id, "roster": rows }))
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
        "enrollment.enroll" => Some(with_conn(state, req, enrollment_enroll)),
        "enrollment.drop" => Some(with_conn(state, req, |c, p| {
            set_enrollment_status(c, p, "enrolled", "dropped")
        })),
        "enrollment.complete" => Some(with_conn(state, req, |c, p| {
            set_enrollment_status(c, p, "enrolled", "completed")
        })),
        "enrollment.roster" => Some(with_conn(state, req, enrollment_roster)),
        _ => None,
    }
}
