use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("timetabled.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            role TEXT NOT NULL,
            max_per_day INTEGER NOT NULL DEFAULT 6,
            max_per_week INTEGER NOT NULL DEFAULT 30
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teachers_tenant_role ON teachers(tenant_id, role)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classrooms(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            section TEXT NOT NULL DEFAULT 'A'
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classrooms_tenant ON classrooms(tenant_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            classroom_id TEXT NOT NULL,
            name TEXT NOT NULL,
            code TEXT NOT NULL,
            teacher_id TEXT,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            UNIQUE(tenant_id, classroom_id, code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_classroom ON subjects(classroom_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_teacher ON subjects(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetables(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            classroom_id TEXT NOT NULL,
            week_start TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'draft',
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id),
            UNIQUE(tenant_id, classroom_id, week_start)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetables_tenant_week ON timetables(tenant_id, week_start)",
        [],
    )?;

    // One conceptual entry per (day, periodKey) within a timetable; the
    // primary key enforces it.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_entries(
            timetable_id TEXT NOT NULL,
            day TEXT NOT NULL,
            period_key TEXT NOT NULL,
            subject_id TEXT,
            teacher_id TEXT,
            absent_teacher_id TEXT,
            is_break INTEGER NOT NULL DEFAULT 0,
            is_substitution INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(timetable_id, day, period_key),
            FOREIGN KEY(timetable_id) REFERENCES timetables(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entries_teacher ON timetable_entries(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entries_day_period ON timetable_entries(day, period_key)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS leaves(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            reason TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'PENDING',
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_leaves_teacher ON leaves(teacher_id, start_date, end_date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_leaves_tenant_status ON leaves(tenant_id, status)",
        [],
    )?;

    // Affected-slot snapshot captured at leave creation, in planning order.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS leave_periods(
            leave_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            date TEXT NOT NULL,
            day TEXT NOT NULL,
            period_key TEXT NOT NULL,
            subject_id TEXT,
            classroom_id TEXT NOT NULL,
            PRIMARY KEY(leave_id, seq),
            FOREIGN KEY(leave_id) REFERENCES leaves(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS substitutions(
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            date TEXT NOT NULL,
            classroom_id TEXT NOT NULL,
            period_key TEXT NOT NULL,
            subject_id TEXT,
            absent_teacher_id TEXT NOT NULL,
            substitute_teacher_id TEXT,
            mode TEXT NOT NULL DEFAULT 'SUBJECT',
            note TEXT,
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id),
            UNIQUE(tenant_id, date, classroom_id, period_key)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_substitutions_date ON substitutions(tenant_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_substitutions_substitute ON substitutions(substitute_teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_substitutions_absent ON substitutions(absent_teacher_id)",
        [],
    )?;

    Ok(conn)
}
