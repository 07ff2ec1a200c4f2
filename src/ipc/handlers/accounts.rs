use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

#[derive(Clone, Copy, PartialEq)]
enum Role {
    Admin,
    Teacher,
    Student,
}

impl Role {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Self::Admin),
            "teacher" => Some(Self::Teacher),
            "student" => Some(Self::Student),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Teacher => "teacher",
            Self::Student => "student",
        }
    }
}

fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn valid_date(s: &str) -> bool {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

fn handle_profiles_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let params = &req.params;

    let role = match params.get("role").and_then(|v| v.as_str()).and_then(Role::parse) {
        Some(r) => r,
        None => {
            return err(
                &req.id,
                "bad_params",
                "role must be admin, teacher or student",
                None,
            )
        }
    };
    let full_name = match params.get("fullName").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing fullName", None),
    };
    let email = match params.get("email").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing email", None),
    };
    let phone = params
        .get("phone")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());
    let date_of_birth = params
        .get("dateOfBirth")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());
    if let Some(dob) = date_of_birth.as_deref() {
        if !valid_date(dob) {
            return err(&req.id, "bad_params", "dateOfBirth must be YYYY-MM-DD", None);
        }
    }
    let bio = params
        .get("bio")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let email_taken: Option<i64> = match conn
        .query_row("SELECT 1 FROM profiles WHERE email = ?", [&email], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if email_taken.is_some() {
        return err(
            &req.id,
            "conflict",
            "a profile with that email already exists",
            None,
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let profile_id = Uuid::new_v4().to_string();
    let ts = now_ts();
    if let Err(e) = tx.execute(
        "INSERT INTO profiles(id, role, full_name, email, phone, date_of_birth, bio, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &profile_id,
            role.as_str(),
            &full_name,
            &email,
            &phone,
            &date_of_birth,
            &bio,
            &ts,
            &ts,
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "profiles" })),
        );
    }

    let mut result = json!({ "profileId": profile_id, "role": role.as_str() });

    match role {
        Role::Student => {
            let student_no = match params.get("studentNo").and_then(|v| v.as_str()) {
                Some(v) if !v.trim().is_empty() => v.trim().to_string(),
                _ => {
                    let _ = tx.rollback();
                    return err(&req.id, "bad_params", "missing studentNo", None);
                }
            };
            let registration_no = match params.get("registrationNo").and_then(|v| v.as_str()) {
                Some(v) if !v.trim().is_empty() => v.trim().to_string(),
                _ => {
                    let _ = tx.rollback();
                    return err(&req.id, "bad_params", "missing registrationNo", None);
                }
            };
            let admission_date = match params.get("admissionDate").and_then(|v| v.as_str()) {
                Some(v) if valid_date(v.trim()) => v.trim().to_string(),
                _ => {
                    let _ = tx.rollback();
                    return err(
                        &req.id,
                        "bad_params",
                        "admissionDate must be YYYY-MM-DD",
                        None,
                    );
                }
            };
            let guardian_name = params
                .get("guardianName")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string());
            let guardian_phone = params
                .get("guardianPhone")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string());

            let student_id = Uuid::new_v4().to_string();
            if let Err(e) = tx.execute(
                "INSERT INTO students(id, profile_id, student_no, registration_no, admission_date,
                                      graduation_date, active, guardian_name, guardian_phone)
                 VALUES(?, ?, ?, ?, ?, NULL, 1, ?, ?)",
                (
                    &student_id,
                    &profile_id,
                    &student_no,
                    &registration_no,
                    &admission_date,
                    &guardian_name,
                    &guardian_phone,
                ),
            ) {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "students" })),
                );
            }
            result["studentId"] = json!(student_id);
        }
        Role::Teacher => {
            let employee_no = match params.get("employeeNo").and_then(|v| v.as_str()) {
                Some(v) if !v.trim().is_empty() => v.trim().to_string(),
                _ => {
                    let _ = tx.rollback();
                    return err(&req.id, "bad_params", "missing employeeNo", None);
                }
            };
            let department = match params.get("department").and_then(|v| v.as_str()) {
                Some(v) if !v.trim().is_empty() => v.trim().to_string(),
                _ => {
                    let _ = tx.rollback();
                    return err(&req.id, "bad_params", "missing department", None);
                }
            };
            let join_date = match params.get("joinDate").and_then(|v| v.as_str()) {
                Some(v) if valid_date(v.trim()) => v.trim().to_string(),
                _ => {
                    let _ = tx.rollback();
                    return err(&req.id, "bad_params", "joinDate must be YYYY-MM-DD", None);
                }
            };
            let qualification = params
                .get("qualification")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string());
            let experience_years = params
                .get("experienceYears")
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            if experience_years < 0 {
                let _ = tx.rollback();
                return err(&req.id, "bad_params", "experienceYears must be >= 0", None);
            }

            let teacher_id = Uuid::new_v4().to_string();
            if let Err(e) = tx.execute(
                "INSERT INTO teachers(id, profile_id, employee_no, department, qualification,
                                      experience_years, join_date, active)
                 VALUES(?, ?, ?, ?, ?, ?, ?, 1)",
                (
                    &teacher_id,
                    &profile_id,
                    &employee_no,
                    &department,
                    &qualification,
                    experience_years,
                    &join_date,
                ),
            ) {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "teachers" })),
                );
            }
            result["teacherId"] = json!(teacher_id);
        }
        Role::Admin => {}
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, result)
}

fn handle_profiles_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let profile_id = match req.params.get("profileId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing profileId", None),
    };

    let row = conn
        .query_row(
            "SELECT role, full_name, email, phone, date_of_birth, bio, created_at, updated_at
             FROM profiles WHERE id = ?",
            [&profile_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, Option<String>>(6)?,
                    r.get::<_, Option<String>>(7)?,
                ))
            },
        )
        .optional();
    let row = match row {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((role, full_name, email, phone, dob, bio, created_at, updated_at)) = row else {
        return err(&req.id, "not_found", "profile not found", None);
    };

    let mut result = json!({
        "profileId": profile_id,
        "role": role,
        "fullName": full_name,
        "email": email,
        "phone": phone,
        "dateOfBirth": dob,
        "bio": bio,
        "createdAt": created_at,
        "updatedAt": updated_at
    });

    if role == "student" {
        let student = conn
            .query_row(
                "SELECT id, student_no, registration_no, admission_date, graduation_date, active,
                        guardian_name, guardian_phone
                 FROM students WHERE profile_id = ?",
                [&profile_id],
                |r| {
                    Ok(json!({
                        "studentId": r.get::<_, String>(0)?,
                        "studentNo": r.get::<_, String>(1)?,
                        "registrationNo": r.get::<_, String>(2)?,
                        "admissionDate": r.get::<_, String>(3)?,
                        "graduationDate": r.get::<_, Option<String>>(4)?,
                        "active": r.get::<_, i64>(5)? != 0,
                        "guardianName": r.get::<_, Option<String>>(6)?,
                        "guardianPhone": r.get::<_, Option<String>>(7)?
                    }))
                },
            )
            .optional();
        match student {
            Ok(Some(v)) => result["student"] = v,
            Ok(None) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    } else if role == "teacher" {
        let teacher = conn
            .query_row(
                "SELECT id, employee_no, department, qualification, experience_years, join_date, active
                 FROM teachers WHERE profile_id = ?",
                [&profile_id],
                |r| {
                    Ok(json!({
                        "teacherId": r.get::<_, String>(0)?,
                        "employeeNo": r.get::<_, String>(1)?,
                        "department": r.get::<_, String>(2)?,
                        "qualification": r.get::<_, Option<String>>(3)?,
                        "experienceYears": r.get::<_, i64>(4)?,
                        "joinDate": r.get::<_, String>(5)?,
                        "active": r.get::<_, i64>(6)? != 0
                    }))
                },
            )
            .optional();
        match teacher {
            Ok(Some(v)) => result["teacher"] = v,
            Ok(None) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    ok(&req.id, result)
}

fn handle_profiles_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let params = &req.params;
    let profile_id = match params.get("profileId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing profileId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM profiles WHERE id = ?", [&profile_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "profile not found", None);
    }

    // Patch semantics: only keys present in params are written.
    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(v) = params.get("fullName").and_then(|v| v.as_str()) {
        let t = v.trim();
        if t.is_empty() {
            return err(&req.id, "bad_params", "fullName must not be empty", None);
        }
        sets.push("full_name = ?");
        values.push(rusqlite::types::Value::Text(t.to_string()));
    }
    if let Some(v) = params.get("phone") {
        if v.is_null() {
            sets.push("phone = NULL");
        } else if let Some(s) = v.as_str() {
            sets.push("phone = ?");
            values.push(rusqlite::types::Value::Text(s.trim().to_string()));
        } else {
            return err(&req.id, "bad_params", "phone must be string or null", None);
        }
    }
    if let Some(v) = params.get("dateOfBirth") {
        if v.is_null() {
            sets.push("date_of_birth = NULL");
        } else if let Some(s) = v.as_str() {
            if !valid_date(s.trim()) {
                return err(&req.id, "bad_params", "dateOfBirth must be YYYY-MM-DD", None);
            }
            sets.push("date_of_birth = ?");
            values.push(rusqlite::types::Value::Text(s.trim().to_string()));
        } else {
            return err(
                &req.id,
                "bad_params",
                "dateOfBirth must be string or null",
                None,
            );
        }
    }
    if let Some(v) = params.get("bio") {
        if v.is_null() {
            sets.push("bio = NULL");
        } else if let Some(s) = v.as_str() {
            sets.push("bio = ?");
            values.push(rusqlite::types::Value::Text(s.to_string()));
        } else {
            return err(&req.id, "bad_params", "bio must be string or null", None);
        }
    }

    if sets.is_empty() {
        return err(&req.id, "bad_params", "nothing to update", None);
    }

    sets.push("updated_at = ?");
    values.push(rusqlite::types::Value::Text(now_ts()));
    values.push(rusqlite::types::Value::Text(profile_id.clone()));

    let sql = format!("UPDATE profiles SET {} WHERE id = ?", sets.join(", "));
    if let Err(e) = conn.execute(&sql, rusqlite::params_from_iter(values)) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "profiles" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT s.id, s.student_no, s.registration_no, s.admission_date, s.active,
                p.id, p.full_name, p.email
         FROM students s
         JOIN profiles p ON p.id = s.profile_id
         ORDER BY s.student_no",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "studentNo": r.get::<_, String>(1)?,
                "registrationNo": r.get::<_, String>(2)?,
                "admissionDate": r.get::<_, String>(3)?,
                "active": r.get::<_, i64>(4)? != 0,
                "profileId": r.get::<_, String>(5)?,
                "fullName": r.get::<_, String>(6)?,
                "email": r.get::<_, String>(7)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_teachers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "teachers": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT t.id, t.employee_no, t.department, t.experience_years, t.active,
                p.id, p.full_name, p.email,
                (SELECT COUNT(*) FROM sections sec WHERE sec.teacher_id = t.id) AS section_count
         FROM teachers t
         JOIN profiles p ON p.id = t.profile_id
         ORDER BY t.employee_no",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "teacherId": r.get::<_, String>(0)?,
                "employeeNo": r.get::<_, String>(1)?,
                "department": r.get::<_, String>(2)?,
                "experienceYears": r.get::<_, i64>(3)?,
                "active": r.get::<_, i64>(4)? != 0,
                "profileId": r.get::<_, String>(5)?,
                "fullName": r.get::<_, String>(6)?,
                "email": r.get::<_, String>(7)?,
                "sectionCount": r.get::<_, i64>(8)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(teachers) => ok(&req.id, json!({ "teachers": teachers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "profiles.create" => Some(handle_profiles_create(state, req)),
        "profiles.get" => Some(handle_profiles_get(state, req)),
        "profiles.update" => Some(handle_profiles_update(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "teachers.list" => Some(handle_teachers_list(state, req)),
        _ => None,
    }
}
