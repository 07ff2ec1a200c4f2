use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let params = &req.params;

    let code = match params.get("code").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_uppercase(),
        _ => return err(&req.id, "bad_params", "missing code", None),
    };
    let name = match params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let credits = match params.get("credits").and_then(|v| v.as_i64()) {
        Some(v) if v > 0 => v,
        Some(_) => return err(&req.id, "bad_params", "credits must be positive", None),
        None => return err(&req.id, "bad_params", "missing credits", None),
    };
    let description = params
        .get("description")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let department = params
        .get("department")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());

    let code_taken: Option<i64> = match conn
        .query_row("SELECT 1 FROM courses WHERE code = ?", [&code], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if code_taken.is_some() {
        return err(
            &req.id,
            "conflict",
            format!("course code {} already exists", code),
            None,
        );
    }

    let course_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, code, name, description, credits, department, active)
         VALUES(?, ?, ?, ?, ?, ?, 1)",
        (&course_id, &code, &name, &description, credits, &department),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    ok(&req.id, json!({ "courseId": course_id, "code": code }))
}

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "courses": [] }));
    };

    // Correlated subquery keeps the count honest if sections ever joins fan out.
    let mut stmt = match conn.prepare(
        "SELECT c.id, c.code, c.name, c.description, c.credits, c.department, c.active,
                (SELECT COUNT(*) FROM sections s WHERE s.course_id = c.id) AS section_count
         FROM courses c
         ORDER BY c.code",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "courseId": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "description": r.get::<_, Option<String>>(3)?,
                "credits": r.get::<_, i64>(4)?,
                "department": r.get::<_, Option<String>>(5)?,
                "active": r.get::<_, i64>(6)? != 0,
                "sectionCount": r.get::<_, i64>(7)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_sections_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let params = &req.params;

    let course_id = match params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };
    let semester_id = match params.get("semesterId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing semesterId", None),
    };
    let teacher_id = match params.get("teacherId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing teacherId", None),
    };
    let section_no = match params.get("sectionNo").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing sectionNo", None),
    };
    let max_capacity = match params.get("maxCapacity") {
        None => 30,
        Some(v) => match v.as_i64() {
            Some(n) if n > 0 => n,
            _ => return err(&req.id, "bad_params", "maxCapacity must be positive", None),
        },
    };
    let schedule = params
        .get("schedule")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let classroom = params
        .get("classroom")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());

    for (table, id, label) in [
        ("courses", &course_id, "course"),
        ("semesters", &semester_id, "semester"),
        ("teachers", &teacher_id, "teacher"),
    ] {
        let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
        let exists: Option<i64> = match conn.query_row(&sql, [id], |r| r.get(0)).optional() {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if exists.is_none() {
            return err(&req.id, "not_found", format!("{} not found", label), None);
        }
    }

    let dup: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM sections WHERE course_id = ? AND semester_id = ? AND section_no = ?",
            (&course_id, &semester_id, &section_no),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if dup.is_some() {
        return err(
            &req.id,
            "conflict",
            "section already exists for that course and semester",
            None,
        );
    }

    let section_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO sections(id, course_id, semester_id, teacher_id, section_no,
                              max_capacity, schedule, classroom)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &section_id,
            &course_id,
            &semester_id,
            &teacher_id,
            &section_no,
            max_capacity,
            &schedule,
            &classroom,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "sections" })),
        );
    }

    ok(
        &req.id,
        json!({ "sectionId": section_id, "sectionNo": section_no }),
    )
}

fn handle_sections_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "sections": [] }));
    };
    let params = &req.params;

    let course_filter = params
        .get("courseId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let semester_filter = params
        .get("semesterId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut sql = String::from(
        "SELECT s.id, s.section_no, s.max_capacity, s.schedule, s.classroom,
                c.code, c.name, sem.name, p.full_name,
                (SELECT COUNT(*) FROM enrollments e
                 WHERE e.section_id = s.id AND e.status = 'enrolled') AS enrolled_count
         FROM sections s
         JOIN courses c ON c.id = s.course_id
         JOIN semesters sem ON sem.id = s.semester_id
         JOIN teachers t ON t.id = s.teacher_id
         JOIN profiles p ON p.id = t.profile_id",
    );
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<String> = Vec::new();
    if let Some(cid) = course_filter {
        clauses.push("s.course_id = ?");
        binds.push(cid);
    }
    if let Some(sid) = semester_filter {
        clauses.push("s.semester_id = ?");
        binds.push(sid);
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY c.code, s.section_no");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            Ok(json!({
                "sectionId": r.get::<_, String>(0)?,
                "sectionNo": r.get::<_, String>(1)?,
                "maxCapacity": r.get::<_, i64>(2)?,
                "schedule": r.get::<_, Option<String>>(3)?,
                "classroom": r.get::<_, Option<String>>(4)?,
                "courseCode": r.get::<_, String>(5)?,
                "courseName": r.get::<_, String>(6)?,
                "semesterName": r.get::<_, String>(7)?,
                "teacherName": r.get::<_, String>(8)?,
                "enrolledCount": r.get::<_, i64>(9)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(sections) => ok(&req.id, json!({ "sections": sections })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.create" => Some(handle_courses_create(state, req)),
        "courses.list" => Some(handle_courses_list(state, req)),
        "sections.create" => Some(handle_sections_create(state, req)),
        "sections.list" => Some(handle_sections_list(state, req)),
        _ => None,
    }
}
