use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDateTime;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const EVENT_TYPES: [&str; 10] = [
    "assignment",
    "exam",
    "class",
    "holiday",
    "meeting",
    "deadline",
    "orientation",
    "graduation",
    "registration",
    "other",
];

const PRIORITIES: [&str; 4] = ["low", "medium", "high", "urgent"];

fn parse_datetime(params: &serde_json::Value, key: &str) -> Result<NaiveDateTime, String> {
    let Some(raw) = params.get(key).and_then(|v| v.as_str()) else {
        return Err(format!("missing {}", key));
    };
    NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%dT%H:%M")
        .map_err(|_| format!("{} must be YYYY-MM-DDTHH:MM", key))
}

fn handle_event_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let params = &req.params;

    let title = match params.get("title").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing title", None),
    };
    let event_type = params
        .get("eventType")
        .and_then(|v| v.as_str())
        .unwrap_or("other");
    if !EVENT_TYPES.contains(&event_type) {
        return err(&req.id, "bad_params", "unknown eventType", None);
    }
    let priority = params
        .get("priority")
        .and_then(|v| v.as_str())
        .unwrap_or("medium");
    if !PRIORITIES.contains(&priority) {
        return err(&req.id, "bad_params", "unknown priority", None);
    }
    let start = match parse_datetime(params, "startAt") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let end = match parse_datetime(params, "endAt") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    if end < start {
        return err(&req.id, "bad_params", "endAt must not precede startAt", None);
    }
    let all_day = params
        .get("allDay")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let created_by = match params.get("createdBy").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing createdBy", None),
    };
    let description = params
        .get("description")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let section_id = params
        .get("sectionId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if let Some(sid) = section_id.as_deref() {
        let exists: Option<i64> = match conn
            .query_row("SELECT 1 FROM sections WHERE id = ?", [sid], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if exists.is_none() {
            return err(&req.id, "not_found", "section not found", None);
        }
    }

    let event_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO calendar_events(id, title, description, event_type, priority,
                                     start_at, end_at, all_day, section_id, created_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &event_id,
            &title,
            &description,
            event_type,
            priority,
            start.format("%Y-%m-%dT%H:%M").to_string(),
            end.format("%Y-%m-%dT%H:%M").to_string(),
            all_day as i64,
            &section_id,
            &created_by,
            chrono::Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "calendar_events" })),
        );
    }

    ok(&req.id, json!({ "eventId": event_id, "title": title }))
}

fn handle_event_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "events": [] }));
    };

    let section_filter = req
        .params
        .get("sectionId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut sql = String::from(
        "SELECT id, title, description, event_type, priority, start_at, end_at,
                all_day, section_id, created_by
         FROM calendar_events",
    );
    let mut binds: Vec<String> = Vec::new();
    if let Some(sid) = section_filter {
        sql.push_str(" WHERE section_id = ?");
        binds.push(sid);
    }
    sql.push_str(" ORDER BY start_at");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            Ok(json!({
                "eventId": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
                "eventType": r.get::<_, String>(3)?,
                "priority": r.get::<_, String>(4)?,
                "startAt": r.get::<_, String>(5)?,
                "endAt": r.get::<_, String>(6)?,
                "allDay": r.get::<_, i64>(7)? != 0,
                "sectionId": r.get::<_, Option<String>>(8)?,
                "createdBy": r.get::<_, String>(9)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(events) => ok(&req.id, json!({ "events": events })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "calendar.eventCreate" => Some(handle_event_create(state, req)),
        "calendar.eventList" => Some(handle_event_list(state, req)),
        _ => None,
    }
}
