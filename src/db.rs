use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("tutorhub.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Idempotent schema creation, shared with in-memory test databases.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            role TEXT NOT NULL,
            full_name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            grade_level TEXT,
            parent_email TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_accounts_role ON accounts(role)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_accounts_parent_email ON accounts(parent_email)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            color_code TEXT NOT NULL DEFAULT '#007bff'
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS materials(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            material_type TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            difficulty TEXT NOT NULL,
            file_name TEXT,
            external_link TEXT,
            grade_level TEXT NOT NULL,
            estimated_time_minutes INTEGER NOT NULL DEFAULT 0,
            uploaded_by TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(uploaded_by) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_materials_subject ON materials(subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_materials_uploader ON materials(uploaded_by)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            material_id TEXT NOT NULL,
            due_date TEXT NOT NULL,
            priority TEXT NOT NULL DEFAULT 'medium',
            max_score REAL NOT NULL DEFAULT 100,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(material_id) REFERENCES materials(id),
            FOREIGN KEY(created_by) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_creator ON assignments(created_by)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignment_students(
            assignment_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            PRIMARY KEY(assignment_id, account_id),
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            FOREIGN KEY(account_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignment_students_account
         ON assignment_students(account_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS submissions(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            submission_text TEXT,
            file_name TEXT,
            notes TEXT,
            status TEXT NOT NULL,
            score REAL,
            letter_grade TEXT,
            feedback TEXT,
            revision_requested INTEGER NOT NULL DEFAULT 0,
            submitted_at TEXT NOT NULL,
            graded_at TEXT,
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            FOREIGN KEY(student_id) REFERENCES accounts(id),
            UNIQUE(assignment_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submissions_assignment ON submissions(assignment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submissions_student ON submissions(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS progress(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            material_id TEXT NOT NULL,
            assignment_id TEXT,
            status TEXT NOT NULL,
            score INTEGER,
            time_spent_minutes INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            teacher_notes TEXT NOT NULL DEFAULT '',
            student_notes TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(student_id) REFERENCES accounts(id),
            FOREIGN KEY(material_id) REFERENCES materials(id),
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            UNIQUE(student_id, material_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_progress_student ON progress(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS chat_rooms(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            is_group_chat INTEGER NOT NULL DEFAULT 0,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(created_by) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS chat_participants(
            room_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            PRIMARY KEY(room_id, account_id),
            FOREIGN KEY(room_id) REFERENCES chat_rooms(id),
            FOREIGN KEY(account_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_chat_participants_account
         ON chat_participants(account_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS messages(
            id TEXT PRIMARY KEY,
            room_id TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            message_type TEXT NOT NULL DEFAULT 'text',
            content TEXT NOT NULL DEFAULT '',
            file_name TEXT,
            created_at TEXT NOT NULL,
            edited_at TEXT,
            FOREIGN KEY(room_id) REFERENCES chat_rooms(id),
            FOREIGN KEY(sender_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_room ON messages(room_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS message_reads(
            message_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            read_at TEXT NOT NULL,
            PRIMARY KEY(message_id, account_id),
            FOREIGN KEY(message_id) REFERENCES messages(id),
            FOREIGN KEY(account_id) REFERENCES accounts(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS push_tokens(
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            token TEXT NOT NULL,
            device_info TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(account_id, token),
            FOREIGN KEY(account_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_push_tokens_account ON push_tokens(account_id)",
        [],
    )?;

    // Workspaces created before messages grew edit tracking lack the column.
    ensure_messages_edited_at(conn)?;
    ensure_push_tokens_device_info(conn)?;

    Ok(())
}

fn ensure_messages_edited_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "messages", "edited_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE messages ADD COLUMN edited_at TEXT", [])?;
    Ok(())
}

fn ensure_push_tokens_device_info(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "push_tokens", "device_info")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE push_tokens ADD COLUMN device_info TEXT", [])?;
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
