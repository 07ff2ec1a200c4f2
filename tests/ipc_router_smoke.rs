use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_registrard");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn registrard");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn str_field(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, value))
        .to_string()
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("registrar-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("version").is_some());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "profiles.create",
        json!({
            "role": "teacher",
            "fullName": "Rivera, Ana",
            "email": "ana@school.test",
            "employeeNo": "EMP-1",
            "department": "Mathematics",
            "joinDate": "2019-09-01",
            "experienceYears": 6
        }),
    );
    let teacher_id = str_field(&teacher, "teacherId");

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "profiles.create",
        json!({
            "role": "student",
            "fullName": "Okafor, Ben",
            "email": "ben@school.test",
            "studentNo": "STU-001",
            "registrationNo": "REG-001",
            "admissionDate": "2024-09-01",
            "guardianName": "Okafor, Sam"
        }),
    );
    let student_id = str_field(&student, "studentId");
    let student_profile_id = str_field(&student, "profileId");

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "profiles.get",
        json!({ "profileId": student_profile_id }),
    );
    assert_eq!(fetched["role"].as_str(), Some("student"));
    assert_eq!(fetched["student"]["studentNo"].as_str(), Some("STU-001"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "profiles.update",
        json!({ "profileId": student_profile_id, "phone": "+15550100", "bio": "Chess club." }),
    );

    let students = request_ok(&mut stdin, &mut reader, "7", "students.list", json!({}));
    assert_eq!(students["students"].as_array().map(|v| v.len()), Some(1));
    let teachers = request_ok(&mut stdin, &mut reader, "8", "teachers.list", json!({}));
    assert_eq!(teachers["teachers"].as_array().map(|v| v.len()), Some(1));

    let year = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "academicYears.create",
        json!({ "name": "2025-2026", "startDate": "2025-09-01", "endDate": "2026-06-30", "isCurrent": true }),
    );
    let year_id = str_field(&year, "academicYearId");

    let semester = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "semesters.create",
        json!({
            "academicYearId": year_id,
            "name": "Fall 2025",
            "startDate": "2025-09-01",
            "endDate": "2026-01-20",
            "isCurrent": true
        }),
    );
    let semester_id = str_field(&semester, "semesterId");

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "courses.create",
        json!({ "code": "mat101", "name": "Algebra I", "credits": 3, "department": "Mathematics" }),
    );
    let course_id = str_field(&course, "courseId");
    // Codes normalize to upper case on the way in.
    assert_eq!(course["code"].as_str(), Some("MAT101"));

    let courses = request_ok(&mut stdin, &mut reader, "12", "courses.list", json!({}));
    assert_eq!(courses["courses"].as_array().map(|v| v.len()), Some(1));

    let section = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "sections.create",
        json!({
            "courseId": course_id,
            "semesterId": semester_id,
            "teacherId": teacher_id,
            "sectionNo": "A",
            "maxCapacity": 25,
            "schedule": "MWF 09:00-10:00",
            "classroom": "B-204"
        }),
    );
    let section_id = str_field(&section, "sectionId");

    let sections = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "sections.list",
        json!({ "courseId": course_id }),
    );
    assert_eq!(sections["sections"].as_array().map(|v| v.len()), Some(1));
    assert_eq!(
        sections["sections"][0]["teacherName"].as_str(),
        Some("Rivera, Ana")
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "enrollment.enroll",
        json!({ "studentId": student_id, "sectionId": section_id }),
    );
    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "enrollment.roster",
        json!({ "sectionId": section_id }),
    );
    assert_eq!(roster["roster"].as_array().map(|v| v.len()), Some(1));

    let session = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "attendance.sessionCreate",
        json!({
            "sectionId": section_id,
            "date": "2025-09-01",
            "startTime": "09:00",
            "endTime": "10:00",
            "topic": "Linear equations"
        }),
    );
    let session_id = str_field(&session, "sessionId");

    let sessions = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "attendance.sessionList",
        json!({ "sectionId": section_id }),
    );
    assert_eq!(sessions["sessions"].as_array().map(|v| v.len()), Some(1));

    let marked = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "attendance.mark",
        json!({
            "sessionId": session_id,
            "studentId": student_id,
            "status": "late",
            "arrivalTime": "09:12",
            "markedBy": "Rivera, Ana"
        }),
    );
    assert_eq!(marked["summary"]["totalSessions"].as_i64(), Some(1));
    assert_eq!(marked["summary"]["lateCount"].as_i64(), Some(1));

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "attendance.summary",
        json!({ "studentId": student_id, "sectionId": section_id }),
    );
    assert!(
        (summary["summary"]["attendancePercentage"]
            .as_f64()
            .expect("percentage")
            - 100.0)
            .abs()
            < 1e-9
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "21",
        "attendance.sectionSummary",
        json!({ "sectionId": section_id }),
    );

    let component = request_ok(
        &mut stdin,
        &mut reader,
        "22",
        "gradeComponents.create",
        json!({ "sectionId": section_id, "name": "Final Exam", "weightPercentage": 60.0, "maxPoints": 100.0 }),
    );
    let component_id = str_field(&component, "componentId");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "23",
        "gradeComponents.list",
        json!({ "sectionId": section_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "24",
        "grades.record",
        json!({ "studentId": student_id, "componentId": component_id, "pointsEarned": 88.0 }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "25",
        "grades.list",
        json!({ "sectionId": section_id }),
    );

    let final_grade = request_ok(
        &mut stdin,
        &mut reader,
        "26",
        "finalGrades.record",
        json!({ "studentId": student_id, "sectionId": section_id, "numericalGrade": 88.0 }),
    );
    assert_eq!(final_grade["letterGrade"].as_str(), Some("A-"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "27",
        "finalGrades.list",
        json!({ "sectionId": section_id }),
    );
    let transcript = request_ok(
        &mut stdin,
        &mut reader,
        "28",
        "transcript",
        json!({ "studentId": student_id }),
    );
    assert!((transcript["gpa"].as_f64().expect("gpa") - 3.7).abs() < 1e-9);

    let event = request_ok(
        &mut stdin,
        &mut reader,
        "29",
        "calendar.eventCreate",
        json!({
            "title": "Final Exam",
            "eventType": "exam",
            "priority": "high",
            "startAt": "2026-01-12T09:00",
            "endAt": "2026-01-12T11:00",
            "sectionId": section_id,
            "createdBy": "Rivera, Ana"
        }),
    );
    assert!(event["eventId"].as_str().is_some());

    let events = request_ok(
        &mut stdin,
        &mut reader,
        "30",
        "calendar.eventList",
        json!({ "sectionId": section_id }),
    );
    assert_eq!(events["events"].as_array().map(|v| v.len()), Some(1));

    let unknown = request(&mut stdin, &mut reader, "31", "seatingPlans.list", json!({}));
    assert_eq!(unknown["ok"].as_bool(), Some(false));
    assert_eq!(
        unknown["error"]["code"].as_str(),
        Some("not_implemented"),
        "unknown methods must fall through: {}",
        unknown
    );

    let _ = child.kill();
}

#[test]
fn requests_before_workspace_selection_are_refused() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let refused = request(
        &mut stdin,
        &mut reader,
        "1",
        "courses.create",
        json!({ "code": "MAT101", "name": "Algebra I", "credits": 3 }),
    );
    assert_eq!(refused["ok"].as_bool(), Some(false));
    assert_eq!(refused["error"]["code"].as_str(), Some("no_workspace"));

    // Read-only lists degrade to empty rather than erroring.
    let empty = request(&mut stdin, &mut reader, "2", "students.list", json!({}));
    assert_eq!(empty["ok"].as_bool(), Some(true));
    assert_eq!(
        empty["result"]["students"].as_array().map(|v| v.len()),
        Some(0)
    );

    let _ = child.kill();
}
