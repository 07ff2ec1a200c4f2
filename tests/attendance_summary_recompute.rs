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

fn request_ok(
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
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn db_path(workspace: &PathBuf) -> PathBuf {
    workspace.join("registrar.sqlite3")
}

// One teacher, two students, one section with five dated sessions.
fn seed_section_with_sessions(workspace: &PathBuf) {
    use rusqlite::Connection;
    let conn = Connection::open(db_path(workspace)).expect("open db");
    conn.execute_batch(
        "INSERT INTO profiles(id, role, full_name, email) VALUES
           ('pt1','teacher','Rivera, Ana','ana@school.test'),
           ('ps1','student','Okafor, Ben','ben@school.test'),
           ('ps2','student','Haas, Cleo','cleo@school.test');
         INSERT INTO teachers(id, profile_id, employee_no, department, join_date, active)
           VALUES('t1','pt1','EMP-1','Mathematics','2019-09-01',1);
         INSERT INTO students(id, profile_id, student_no, registration_no, admission_date, active)
           VALUES('s1','ps1','STU-001','REG-001','2024-09-01',1),
                 ('s2','ps2','STU-002','REG-002','2024-09-01',1);
         INSERT INTO academic_years(id, name, start_date, end_date, is_current)
           VALUES('y1','2025-2026','2025-09-01','2026-06-30',1);
         INSERT INTO semesters(id, academic_year_id, name, start_date, end_date, is_current)
           VALUES('sem1','y1','Fall 2025','2025-09-01','2026-01-20',1);
         INSERT INTO courses(id, code, name, credits, active)
           VALUES('c1','MAT101','Algebra I',3,1);
         INSERT INTO sections(id, course_id, semester_id, teacher_id, section_no, max_capacity)
           VALUES('sec1','c1','sem1','t1','A',30);
         INSERT INTO enrollments(id, student_id, section_id, status, enrolled_at)
           VALUES('e1','s1','sec1','enrolled','2025-09-01T00:00:00Z'),
                 ('e2','s2','sec1','enrolled','2025-09-01T00:00:00Z');
         INSERT INTO attendance_sessions(id, section_id, date, start_time, end_time)
           VALUES('sess1','sec1','2025-09-01','09:00','10:00'),
                 ('sess2','sec1','2025-09-02','09:00','10:00'),
                 ('sess3','sec1','2025-09-03','09:00','10:00'),
                 ('sess4','sec1','2025-09-04','09:00','10:00'),
                 ('sess5','sec1','2025-09-05','09:00','10:00');",
    )
    .expect("seed rows");
}

fn summary_counts(result: &serde_json::Value) -> (i64, i64, i64, i64, i64, f64) {
    let s = &result["summary"];
    (
        s["totalSessions"].as_i64().expect("totalSessions"),
        s["presentCount"].as_i64().expect("presentCount"),
        s["absentCount"].as_i64().expect("absentCount"),
        s["lateCount"].as_i64().expect("lateCount"),
        s["excusedCount"].as_i64().expect("excusedCount"),
        s["attendancePercentage"].as_f64().expect("percentage"),
    )
}

#[test]
fn marking_five_sessions_yields_sixty_percent() {
    let workspace = temp_dir("registrar-summary-scenario");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_section_with_sessions(&workspace);

    let statuses = ["present", "present", "late", "absent", "excused"];
    let mut last = json!({});
    for (i, status) in statuses.iter().enumerate() {
        last = request_ok(
            &mut stdin,
            &mut reader,
            &format!("m{}", i),
            "attendance.mark",
            json!({
                "sessionId": format!("sess{}", i + 1),
                "studentId": "s1",
                "status": status,
                "markedBy": "Rivera, Ana"
            }),
        );
    }

    let (total, present, absent, late, excused, pct) = summary_counts(&last);
    assert_eq!(total, 5);
    assert_eq!(present, 2);
    assert_eq!(late, 1);
    assert_eq!(absent, 1);
    assert_eq!(excused, 1);
    assert!((pct - 60.0).abs() < 1e-9, "expected 60.0 got {}", pct);
    assert_eq!(present + absent + late + excused, total);

    // The stored row matches what the mark response reported.
    {
        use rusqlite::Connection;
        let conn = Connection::open(db_path(&workspace)).expect("open db");
        let (db_total, db_pct): (i64, f64) = conn
            .query_row(
                "SELECT total_sessions, attendance_percentage
                 FROM attendance_summaries WHERE student_id = 's1' AND section_id = 'sec1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("summary row");
        assert_eq!(db_total, 5);
        assert!((db_pct - 60.0).abs() < 1e-9);
    }

    let _ = child.kill();
}

#[test]
fn remarking_unchanged_record_reproduces_identical_summary() {
    let workspace = temp_dir("registrar-summary-idempotent");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_section_with_sessions(&workspace);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.mark",
        json!({ "sessionId": "sess1", "studentId": "s1", "status": "late", "markedBy": "Rivera, Ana" }),
    );
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.mark",
        json!({ "sessionId": "sess1", "studentId": "s1", "status": "late", "markedBy": "Rivera, Ana" }),
    );
    assert_eq!(summary_counts(&first), summary_counts(&second));
    // Still one record for the (student, session) pair after the re-mark.
    assert_eq!(summary_counts(&second).0, 1);

    let _ = child.kill();
}

#[test]
fn changing_a_record_recomputes_from_scratch() {
    let workspace = temp_dir("registrar-summary-recompute");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_section_with_sessions(&workspace);

    for (i, status) in ["present", "absent"].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("m{}", i),
            "attendance.mark",
            json!({
                "sessionId": format!("sess{}", i + 1),
                "studentId": "s1",
                "status": status,
                "markedBy": "Rivera, Ana"
            }),
        );
    }

    // Flip the absence to present; the summary must reflect a full rebuild,
    // not an increment on top of stale counts.
    let flipped = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.mark",
        json!({ "sessionId": "sess2", "studentId": "s1", "status": "present", "markedBy": "Rivera, Ana" }),
    );
    let (total, present, absent, _, _, pct) = summary_counts(&flipped);
    assert_eq!(total, 2);
    assert_eq!(present, 2);
    assert_eq!(absent, 0);
    assert!((pct - 100.0).abs() < 1e-9);

    let _ = child.kill();
}

#[test]
fn clearing_a_record_drops_the_session_from_totals() {
    let workspace = temp_dir("registrar-summary-clear");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_section_with_sessions(&workspace);

    for (i, status) in ["present", "absent"].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("m{}", i),
            "attendance.mark",
            json!({
                "sessionId": format!("sess{}", i + 1),
                "studentId": "s1",
                "status": status,
                "markedBy": "Rivera, Ana"
            }),
        );
    }

    let cleared = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.clear",
        json!({ "sessionId": "sess2", "studentId": "s1" }),
    );
    let (total, present, absent, _, _, pct) = summary_counts(&cleared);
    assert_eq!(total, 1);
    assert_eq!(present, 1);
    assert_eq!(absent, 0);
    assert!((pct - 100.0).abs() < 1e-9);

    let _ = child.kill();
}

#[test]
fn unmarked_student_reads_zero_summary() {
    let workspace = temp_dir("registrar-summary-zeros");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_section_with_sessions(&workspace);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.summary",
        json!({ "studentId": "s2", "sectionId": "sec1" }),
    );
    let (total, present, absent, late, excused, pct) = summary_counts(&result);
    assert_eq!((total, present, absent, late, excused), (0, 0, 0, 0, 0));
    assert_eq!(pct, 0.0);

    let _ = child.kill();
}

#[test]
fn bulk_mark_updates_every_listed_student_in_one_pass() {
    let workspace = temp_dir("registrar-summary-bulk");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_section_with_sessions(&workspace);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.bulkMark",
        json!({
            "sessionId": "sess1",
            "markedBy": "Rivera, Ana",
            "entries": [
                { "studentId": "s1", "status": "present" },
                { "studentId": "s2", "status": "late", "arrivalTime": "09:10" },
                { "studentId": "ghost", "status": "absent" }
            ]
        }),
    );
    // Unknown ids are skipped, not fatal.
    assert_eq!(result["markedCount"].as_i64(), Some(2));

    let section = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.sectionSummary",
        json!({ "sectionId": "sec1" }),
    );
    let students = section["students"].as_array().expect("students");
    assert_eq!(students.len(), 2);
    for row in students {
        assert_eq!(row["summary"]["totalSessions"].as_i64(), Some(1));
        assert!(
            (row["summary"]["attendancePercentage"].as_f64().expect("pct") - 100.0).abs() < 1e-9
        );
    }

    let _ = child.kill();
}
