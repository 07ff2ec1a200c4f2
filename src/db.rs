use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("registrar.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS profiles(
            id TEXT PRIMARY KEY,
            role TEXT NOT NULL,
            full_name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            phone TEXT,
            date_of_birth TEXT,
            bio TEXT,
            created_at TEXT,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            profile_id TEXT NOT NULL UNIQUE,
            student_no TEXT NOT NULL UNIQUE,
            registration_no TEXT NOT NULL UNIQUE,
            admission_date TEXT NOT NULL,
            graduation_date TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            guardian_name TEXT,
            guardian_phone TEXT,
            FOREIGN KEY(profile_id) REFERENCES profiles(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_profile ON students(profile_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            profile_id TEXT NOT NULL UNIQUE,
            employee_no TEXT NOT NULL UNIQUE,
            department TEXT NOT NULL,
            qualification TEXT,
            experience_years INTEGER NOT NULL DEFAULT 0,
            join_date TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(profile_id) REFERENCES profiles(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teachers_profile ON teachers(profile_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            is_current INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS semesters(
            id TEXT PRIMARY KEY,
            academic_year_id TEXT NOT NULL,
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            is_current INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_semesters_year ON semesters(academic_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            description TEXT,
            credits INTEGER NOT NULL,
            department TEXT,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            semester_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            section_no TEXT NOT NULL,
            max_capacity INTEGER NOT NULL DEFAULT 30,
            schedule TEXT,
            classroom TEXT,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            UNIQUE(course_id, semester_id, section_no)
        )",
        [],
    )?;
    ensure_sections_classroom(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_course ON sections(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_semester ON sections(semester_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_teacher ON sections(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'enrolled',
            enrolled_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            UNIQUE(student_id, section_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_section ON enrollments(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_sessions(
            id TEXT PRIMARY KEY,
            section_id TEXT NOT NULL,
            date TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            topic TEXT,
            notes TEXT,
            created_at TEXT,
            FOREIGN KEY(section_id) REFERENCES sections(id),
            UNIQUE(section_id, date, start_time)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_sessions_section ON attendance_sessions(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'absent',
            arrival_time TEXT,
            notes TEXT,
            marked_by TEXT NOT NULL,
            marked_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(session_id) REFERENCES attendance_sessions(id),
            UNIQUE(student_id, session_id)
        )",
        [],
    )?;
    ensure_attendance_arrival_time(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_session ON attendance(session_id)",
        [],
    )?;

    // Derived cache, one row per (student, section). Always replaced by a full
    // recompute from attendance rows; never patched incrementally.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_summaries(
            student_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            total_sessions INTEGER NOT NULL DEFAULT 0,
            present_count INTEGER NOT NULL DEFAULT 0,
            absent_count INTEGER NOT NULL DEFAULT 0,
            late_count INTEGER NOT NULL DEFAULT 0,
            excused_count INTEGER NOT NULL DEFAULT 0,
            attendance_percentage REAL NOT NULL DEFAULT 0,
            last_updated TEXT,
            PRIMARY KEY(student_id, section_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_summaries_section ON attendance_summaries(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_components(
            id TEXT PRIMARY KEY,
            section_id TEXT NOT NULL,
            name TEXT NOT NULL,
            weight_percentage REAL NOT NULL,
            max_points REAL NOT NULL DEFAULT 100,
            FOREIGN KEY(section_id) REFERENCES sections(id),
            UNIQUE(section_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_components_section ON grade_components(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            component_id TEXT NOT NULL,
            points_earned REAL NOT NULL,
            comments TEXT,
            recorded_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(component_id) REFERENCES grade_components(id),
            UNIQUE(student_id, component_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_component ON grades(component_id)",
        [],
    )?;

    // letter_grade and gpa_points are classifier outputs; handlers never write
    // caller-supplied values into them.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS final_grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            numerical_grade REAL NOT NULL,
            letter_grade TEXT NOT NULL,
            gpa_points REAL NOT NULL,
            comments TEXT,
            recorded_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            UNIQUE(student_id, section_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_final_grades_student ON final_grades(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_final_grades_section ON final_grades(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS calendar_events(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            event_type TEXT NOT NULL DEFAULT 'other',
            priority TEXT NOT NULL DEFAULT 'medium',
            start_at TEXT NOT NULL,
            end_at TEXT NOT NULL,
            all_day INTEGER NOT NULL DEFAULT 0,
            section_id TEXT,
            created_by TEXT NOT NULL,
            created_at TEXT,
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_calendar_events_section ON calendar_events(section_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_sections_classroom(conn: &Connection) -> anyhow::Result<()> {
    // Early workspaces predate the classroom column.
    if table_has_column(conn, "sections", "classroom")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE sections ADD COLUMN classroom TEXT", [])?;
    Ok(())
}

fn ensure_attendance_arrival_time(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "attendance", "arrival_time")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE attendance ADD COLUMN arrival_time TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
