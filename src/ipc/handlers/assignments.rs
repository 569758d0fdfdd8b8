use crate::calc::{self, fmt_ts, parse_ts};
use crate::domain::{Priority, Role, SubmissionStatus};
use crate::ipc::error::{err, ok, HandlerError};
use crate::ipc::helpers::{
    account_display_name, get_opt_f64, get_opt_str, get_required_str, get_required_ts,
    get_str_array, load_role, now_param, require_teacher,
};
use crate::ipc::types::{AppState, Request};
use crate::notify;
use crate::push::PushDispatcher;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct AssignmentRow {
    id: String,
    title: String,
    description: String,
    material_id: String,
    due_date: String,
    priority: String,
    max_score: f64,
    created_by: String,
    created_at: String,
}

fn load_assignment(conn: &Connection, assignment_id: &str) -> Result<AssignmentRow, HandlerError> {
    conn.query_row(
        "SELECT id, title, description, material_id, due_date, priority,
             max_score, created_by, created_at
         FROM assignments WHERE id = ?",
        [assignment_id],
        |r| {
            Ok(AssignmentRow {
                id: r.get(0)?,
                title: r.get(1)?,
                description: r.get(2)?,
                material_id: r.get(3)?,
                due_date: r.get(4)?,
                priority: r.get(5)?,
                max_score: r.get(6)?,
                created_by: r.get(7)?,
                created_at: r.get(8)?,
            })
        },
    )
    .optional()
    .map_err(HandlerError::db_query)?
    .ok_or_else(|| HandlerError::not_found("assignment not found"))
}

fn assigned_students(conn: &Connection, assignment_id: &str) -> Result<Vec<String>, HandlerError> {
    let mut stmt = conn
        .prepare(
            "SELECT account_id FROM assignment_students
             WHERE assignment_id = ? ORDER BY account_id",
        )
        .map_err(HandlerError::db_query)?;
    stmt.query_map([assignment_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerError::db_query)
}

fn assignment_json(
    conn: &Connection,
    row: &AssignmentRow,
    now: DateTime<Utc>,
) -> Result<serde_json::Value, HandlerError> {
    let due = parse_ts(&row.due_date)
        .ok_or_else(|| HandlerError::new("db_query_failed", "stored due date is malformed"))?;
    Ok(json!({
        "id": row.id,
        "title": row.title,
        "description": row.description,
        "materialId": row.material_id,
        "dueDate": row.due_date,
        "priority": row.priority,
        "maxScore": row.max_score,
        "createdBy": row.created_by,
        "createdAt": row.created_at,
        "assignedTo": assigned_students(conn, &row.id)?,
        "isOverdue": calc::is_overdue(due, now),
        "daysUntilDue": calc::days_until_due(due, now),
    }))
}

struct SubmissionRow {
    id: String,
    assignment_id: String,
    student_id: String,
    submission_text: Option<String>,
    file_name: Option<String>,
    notes: Option<String>,
    status: String,
    score: Option<f64>,
    letter_grade: Option<String>,
    feedback: Option<String>,
    revision_requested: bool,
    submitted_at: String,
    graded_at: Option<String>,
}

fn load_submission(conn: &Connection, submission_id: &str) -> Result<SubmissionRow, HandlerError> {
    conn.query_row(
        "SELECT id, assignment_id, student_id, submission_text, file_name, notes,
             status, score, letter_grade, feedback, revision_requested,
             submitted_at, graded_at
         FROM submissions WHERE id = ?",
        [submission_id],
        map_submission,
    )
    .optional()
    .map_err(HandlerError::db_query)?
    .ok_or_else(|| HandlerError::not_found("submission not found"))
}

fn map_submission(r: &rusqlite::Row) -> rusqlite::Result<SubmissionRow> {
    Ok(SubmissionRow {
        id: r.get(0)?,
        assignment_id: r.get(1)?,
        student_id: r.get(2)?,
        submission_text: r.get(3)?,
        file_name: r.get(4)?,
        notes: r.get(5)?,
        status: r.get(6)?,
        score: r.get(7)?,
        letter_grade: r.get(8)?,
        feedback: r.get(9)?,
        revision_requested: r.get::<_, i64>(10)? != 0,
        submitted_at: r.get(11)?,
        graded_at: r.get(12)?,
    })
}

fn submission_json(
    row: &SubmissionRow,
    due_date: DateTime<Utc>,
) -> Result<serde_json::Value, HandlerError> {
    let submitted = parse_ts(&row.submitted_at).ok_or_else(|| {
        HandlerError::new("db_query_failed", "stored submission timestamp is malformed")
    })?;
    Ok(json!({
        "id": row.id,
        "assignmentId": row.assignment_id,
        "studentId": row.student_id,
        "text": row.submission_text,
        "fileName": row.file_name,
        "notes": row.notes,
        "status": row.status,
        "score": row.score,
        "letterGrade": row.letter_grade,
        "feedback": row.feedback,
        "revisionRequested": row.revision_requested,
        "submittedAt": row.submitted_at,
        "gradedAt": row.graded_at,
        "isLate": calc::is_late(submitted, due_date),
        "daysLate": calc::days_late(submitted, due_date),
    }))
}

fn assignments_create(
    conn: &Connection,
    push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let actor_id = get_required_str(params, "actorId")?;
    require_teacher(conn, &actor_id)?;

    let title = get_required_str(params, "title")?;
    let description = get_opt_str(params, "description")?.unwrap_or_default();
    let material_id = get_required_str(params, "materialId")?;
    let due_date = get_required_ts(params, "dueDate")?;
    let priority_raw = get_opt_str(params, "priority")?.unwrap_or_else(|| "medium".to_string());
    let max_score = get_opt_f64(params, "maxScore")?.unwrap_or(100.0);
    let assigned_to = get_str_array(params, "assignedTo")?;
    let now = now_param(params)?;

    let Some(priority) = Priority::parse(&priority_raw) else {
        return Err(HandlerError::bad_params(format!(
            "unknown priority: {}",
            priority_raw
        )));
    };
    if due_date <= now {
        return Err(HandlerError::validation("due date must be in the future"));
    }
    if max_score <= 0.0 {
        return Err(HandlerError::validation("maxScore must be positive"));
    }
    if assigned_to.is_empty() {
        return Err(HandlerError::validation(
            "assignment needs at least one student",
        ));
    }

    let material_exists = conn
        .query_row("SELECT 1 FROM materials WHERE id = ?", [&material_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(HandlerError::db_query)?
        .is_some();
    if !material_exists {
        return Err(HandlerError::not_found("material not found"));
    }
    for account_id in &assigned_to {
        match load_role(conn, account_id)? {
            Role::Student => {}
            Role::Parent | Role::Teacher => {
                return Err(HandlerError::validation(format!(
                    "assignee {} is not a student",
                    account_id
                )));
            }
        }
    }

    let id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerError::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO assignments(id, title, description, material_id, due_date,
             priority, max_score, created_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &title,
            &description,
            &material_id,
            fmt_ts(due_date),
            priority.as_str(),
            max_score,
            &actor_id,
            fmt_ts(now),
        ),
    )
    .map_err(HandlerError::db_update)?;
    for account_id in &assigned_to {
        tx.execute(
            "INSERT OR IGNORE INTO assignment_students(assignment_id, account_id) VALUES(?, ?)",
            (&id, account_id),
        )
        .map_err(HandlerError::db_update)?;
    }
    tx.commit()
        .map_err(|e| HandlerError::new("db_commit_failed", e.to_string()))?;

    push.to_accounts(
        conn,
        &assigned_to,
        None,
        &notify::assignment_created(&id, &title),
    );

    let row = load_assignment(conn, &id)?;
    assignment_json(conn, &row, now)
}

fn assignments_get(
    conn: &Connection,
    _push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let now = now_param(params)?;
    let row = load_assignment(conn, &assignment_id)?;
    assignment_json(conn, &row, now)
}

fn assignments_list(
    conn: &Connection,
    _push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let actor_id = get_required_str(params, "actorId")?;
    let now = now_param(params)?;

    let sql_base = "SELECT id, title, description, material_id, due_date, priority,
             max_score, created_by, created_at FROM assignments";
    let mut stmt;
    let rows = match load_role(conn, &actor_id)? {
        Role::Teacher => {
            stmt = conn
                .prepare(&format!(
                    "{} WHERE created_by = ? ORDER BY due_date",
                    sql_base
                ))
                .map_err(HandlerError::db_query)?;
            stmt.query_map([&actor_id], map_assignment)
        }
        Role::Student => {
            stmt = conn
                .prepare(&format!(
                    "{} WHERE id IN (SELECT assignment_id FROM assignment_students
                         WHERE account_id = ?)
                     ORDER BY due_date",
                    sql_base
                ))
                .map_err(HandlerError::db_query)?;
            stmt.query_map([&actor_id], map_assignment)
        }
        // Parents see their children's assignments, matched on parent email.
        Role::Parent => {
            stmt = conn
                .prepare(&format!(
                    "{} WHERE id IN (
                         SELECT s.assignment_id FROM assignment_students s
                         JOIN accounts child ON child.id = s.account_id
                         JOIN accounts parent ON parent.email = child.parent_email
                         WHERE parent.id = ? AND parent.email IS NOT NULL)
                     ORDER BY due_date",
                    sql_base
                ))
                .map_err(HandlerError::db_query)?;
            stmt.query_map([&actor_id], map_assignment)
        }
    }
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerError::db_query)?;

    let assignments = rows
        .iter()
        .map(|row| assignment_json(conn, row, now))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "assignments": assignments }))
}

fn map_assignment(r: &rusqlite::Row) -> rusqlite::Result<AssignmentRow> {
    Ok(AssignmentRow {
        id: r.get(0)?,
        title: r.get(1)?,
        description: r.get(2)?,
        material_id: r.get(3)?,
        due_date: r.get(4)?,
        priority: r.get(5)?,
        max_score: r.get(6)?,
        created_by: r.get(7)?,
        created_at: r.get(8)?,
    })
}

fn assignments_submit(
    conn: &Connection,
    push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let actor_id = get_required_str(params, "actorId")?;
    let text = get_opt_str(params, "text")?;
    let file_name = get_opt_str(params, "fileName")?;
    let notes = get_opt_str(params, "notes")?;
    let now = now_param(params)?;

    let assignment = load_assignment(conn, &assignment_id)?;

    let has_text = text.as_deref().is_some_and(|s| !s.trim().is_empty());
    let has_file = file_name.as_deref().is_some_and(|s| !s.trim().is_empty());
    if !has_text && !has_file {
        return Err(HandlerError::validation(
            "submission requires text or a file",
        ));
    }

    match load_role(conn, &actor_id)? {
        Role::Student => {}
        Role::Parent | Role::Teacher => {
            return Err(HandlerError::forbidden("only students submit assignments"));
        }
    }
    let assigned = conn
        .query_row(
            "SELECT 1 FROM assignment_students WHERE assignment_id = ? AND account_id = ?",
            (&assignment_id, &actor_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(HandlerError::db_query)?
        .is_some();
    if !assigned {
        return Err(HandlerError::forbidden(
            "student is not assigned to this assignment",
        ));
    }

    // Resubmission overwrites the unique row and wipes prior grading.
    conn.execute(
        "INSERT INTO submissions(id, assignment_id, student_id, submission_text,
             file_name, notes, status, revision_requested, submitted_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 0, ?)
         ON CONFLICT(assignment_id, student_id) DO UPDATE SET
             submission_text = excluded.submission_text,
             file_name = excluded.file_name,
             notes = excluded.notes,
             status = excluded.status,
             score = NULL,
             letter_grade = NULL,
             feedback = NULL,
             revision_requested = 0,
             submitted_at = excluded.submitted_at,
             graded_at = NULL",
        (
            Uuid::new_v4().to_string(),
            &assignment_id,
            &actor_id,
            &text,
            &file_name,
            &notes,
            SubmissionStatus::Submitted.as_str(),
            fmt_ts(now),
        ),
    )
    .map_err(HandlerError::db_update)?;

    let student_name = account_display_name(conn, &actor_id)?;
    push.to_account(
        conn,
        &assignment.created_by,
        &notify::assignment_submitted(&assignment_id, &assignment.title, &student_name),
    );

    let row = conn
        .query_row(
            "SELECT id, assignment_id, student_id, submission_text, file_name, notes,
                 status, score, letter_grade, feedback, revision_requested,
                 submitted_at, graded_at
             FROM submissions WHERE assignment_id = ? AND student_id = ?",
            (&assignment_id, &actor_id),
            map_submission,
        )
        .map_err(HandlerError::db_query)?;
    let due = parse_ts(&assignment.due_date)
        .ok_or_else(|| HandlerError::new("db_query_failed", "stored due date is malformed"))?;
    submission_json(&row, due)
}

fn assignments_grade(
    conn: &Connection,
    push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let submission_id = get_required_str(params, "submissionId")?;
    let actor_id = get_required_str(params, "actorId")?;
    require_teacher(conn, &actor_id)?;
    let score = get_opt_f64(params, "score")?
        .ok_or_else(|| HandlerError::bad_params("missing score"))?;
    let feedback = get_opt_str(params, "feedback")?;
    let explicit_letter = get_opt_str(params, "letterGrade")?;
    let now = now_param(params)?;

    let submission = load_submission(conn, &submission_id)?;
    let assignment = load_assignment(conn, &submission.assignment_id)?;

    if score < 0.0 || score > assignment.max_score {
        return Err(HandlerError::validation(format!(
            "score must be between 0 and {}",
            assignment.max_score
        )));
    }
    let letter = match explicit_letter {
        Some(l) => l,
        None => calc::letter_grade(100.0 * score / assignment.max_score).to_string(),
    };

    conn.execute(
        "UPDATE submissions SET score = ?, letter_grade = ?, feedback = ?,
             status = ?, graded_at = COALESCE(graded_at, ?)
         WHERE id = ?",
        (
            score,
            &letter,
            &feedback,
            SubmissionStatus::Graded.as_str(),
            fmt_ts(now),
            &submission_id,
        ),
    )
    .map_err(HandlerError::db_update)?;

    push.to_account(
        conn,
        &submission.student_id,
        &notify::assignment_graded(&assignment.id, &assignment.title),
    );

    let row = load_submission(conn, &submission_id)?;
    let due = parse_ts(&assignment.due_date)
        .ok_or_else(|| HandlerError::new("db_query_failed", "stored due date is malformed"))?;
    submission_json(&row, due)
}

fn assignments_request_revision(
    conn: &Connection,
    push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let submission_id = get_required_str(params, "submissionId")?;
    let actor_id = get_required_str(params, "actorId")?;
    require_teacher(conn, &actor_id)?;
    let notes = get_required_str(params, "notes")?;

    let submission = load_submission(conn, &submission_id)?;
    let assignment = load_assignment(conn, &submission.assignment_id)?;

    // Returned is reachable from any prior state.
    conn.execute(
        "UPDATE submissions SET revision_requested = 1, status = ?, feedback = ?
         WHERE id = ?",
        (SubmissionStatus::Returned.as_str(), &notes, &submission_id),
    )
    .map_err(HandlerError::db_update)?;

    push.to_account(
        conn,
        &submission.student_id,
        &notify::revision_requested(&assignment.id, &assignment.title),
    );

    let row = load_submission(conn, &submission_id)?;
    let due = parse_ts(&assignment.due_date)
        .ok_or_else(|| HandlerError::new("db_query_failed", "stored due date is malformed"))?;
    submission_json(&row, due)
}

fn assignments_start_review(
    conn: &Connection,
    _push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let submission_id = get_required_str(params, "submissionId")?;
    let actor_id = get_required_str(params, "actorId")?;
    require_teacher(conn, &actor_id)?;

    let submission = load_submission(conn, &submission_id)?;
    match SubmissionStatus::parse(&submission.status) {
        Some(SubmissionStatus::Submitted) => {}
        Some(_) => {
            return Err(HandlerError::validation(
                "only a freshly submitted submission can enter review",
            ));
        }
        None => {
            return Err(HandlerError::new(
                "db_query_failed",
                format!("unknown submission status: {}", submission.status),
            ));
        }
    }

    conn.execute(
        "UPDATE submissions SET status = ? WHERE id = ?",
        (SubmissionStatus::UnderReview.as_str(), &submission_id),
    )
    .map_err(HandlerError::db_update)?;

    let assignment = load_assignment(conn, &submission.assignment_id)?;
    let row = load_submission(conn, &submission_id)?;
    let due = parse_ts(&assignment.due_date)
        .ok_or_else(|| HandlerError::new("db_query_failed", "stored due date is malformed"))?;
    submission_json(&row, due)
}

fn assignments_list_submissions(
    conn: &Connection,
    _push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let actor_id = get_required_str(params, "actorId")?;
    require_teacher(conn, &actor_id)?;

    let assignment = load_assignment(conn, &assignment_id)?;
    let due = parse_ts(&assignment.due_date)
        .ok_or_else(|| HandlerError::new("db_query_failed", "stored due date is malformed"))?;

    let mut stmt = conn
        .prepare(
            "SELECT id, assignment_id, student_id, submission_text, file_name, notes,
                 status, score, letter_grade, feedback, revision_requested,
                 submitted_at, graded_at
             FROM submissions WHERE assignment_id = ? ORDER BY submitted_at",
        )
        .map_err(HandlerError::db_query)?;
    let rows = stmt
        .query_map([&assignment_id], map_submission)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerError::db_query)?;

    let submissions = rows
        .iter()
        .map(|row| submission_json(row, due))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "submissions": submissions }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: fn(
        &Connection,
        &PushDispatcher,
        &serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &state.push, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.create" => Some(with_conn(state, req, assignments_create)),
        "assignments.get" => Some(with_conn(state, req, assignments_get)),
        "assignments.list" => Some(with_conn(state, req, assignments_list)),
        "assignments.submit" => Some(with_conn(state, req, assignments_submit)),
        "assignments.grade" => Some(with_conn(state, req, assignments_grade)),
        "assignments.requestRevision" => Some(with_conn(state, req, assignments_request_revision)),
        "assignments.startReview" => Some(with_conn(state, req, assignments_start_review)),
        "assignments.listSubmissions" => Some(with_conn(state, req, assignments_list_submissions)),
        _ => None,
    }
}
