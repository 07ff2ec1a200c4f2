use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn parse_date(params: &serde_json::Value, key: &str) -> Result<String, String> {
    let Some(raw) = params.get(key).and_then(|v| v.as_str()) else {
        return Err(format!("missing {}", key));
    };
    let t = raw.trim();
    if NaiveDate::parse_from_str(t, "%Y-%m-%d").is_err() {
        return Err(format!("{} must be YYYY-MM-DD", key));
    }
    Ok(t.to_string())
}

fn handle_academic_years_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let params = &req.params;

    let name = match params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let start_date = match parse_date(params, "startDate") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let end_date = match parse_date(params, "endDate") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let is_current = params
        .get("isCurrent")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // At most one current year: demote the previous one in the same commit.
    if is_current {
        if let Err(e) = tx.execute("UPDATE academic_years SET is_current = 0 WHERE is_current = 1", []) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    let year_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO academic_years(id, name, start_date, end_date, is_current)
         VALUES(?, ?, ?, ?, ?)",
        (&year_id, &name, &start_date, &end_date, is_current as i64),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "academic_years" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "academicYearId": year_id, "name": name }))
}

fn handle_semesters_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let params = &req.params;

    let academic_year_id = match params.get("academicYearId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing academicYearId", None),
    };
    let name = match params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let start_date = match parse_date(params, "startDate") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let end_date = match parse_date(params, "endDate") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let is_current = params
        .get("isCurrent")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let year_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM academic_years WHERE id = ?",
            [&academic_year_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if year_exists.is_none() {
        return err(&req.id, "not_found", "academic year not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if is_current {
        if let Err(e) = tx.execute("UPDATE semesters SET is_current = 0 WHERE is_current = 1", []) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    let semester_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO semesters(id, academic_year_id, name, start_date, end_date, is_current)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &semester_id,
            &academic_year_id,
            &name,
            &start_date,
            &end_date,
            is_current as i64,
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "semesters" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "semesterId": semester_id, "name": name }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "academicYears.create" => Some(handle_academic_years_create(state, req)),
        "semesters.create" => Some(handle_semesters_create(state, req)),
        _ => None,
    }
}
