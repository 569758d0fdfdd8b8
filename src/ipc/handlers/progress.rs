use crate::calc::{self, fmt_ts, parse_ts};
use crate::domain::{ProgressStatus, Role};
use crate::ipc::error::{err, ok, HandlerError};
use crate::ipc::helpers::{
    get_opt_i64, get_opt_str, get_required_str, load_role, now_param, today_param,
};
use crate::ipc::types::{AppState, Request};
use crate::notify;
use crate::push::PushDispatcher;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

struct ProgressRow {
    id: String,
    status: String,
    score: Option<i64>,
    time_spent_minutes: i64,
    started_at: String,
    completed_at: Option<String>,
    teacher_notes: String,
    student_notes: String,
    assignment_id: Option<String>,
}

fn load_row(
    conn: &Connection,
    student_id: &str,
    material_id: &str,
) -> Result<Option<ProgressRow>, HandlerError> {
    conn.query_row(
        "SELECT id, status, score, time_spent_minutes, started_at, completed_at,
             teacher_notes, student_notes, assignment_id
         FROM progress WHERE student_id = ? AND material_id = ?",
        (student_id, material_id),
        |r| {
            Ok(ProgressRow {
                id: r.get(0)?,
                status: r.get(1)?,
                score: r.get(2)?,
                time_spent_minutes: r.get(3)?,
                started_at: r.get(4)?,
                completed_at: r.get(5)?,
                teacher_notes: r.get(6)?,
                student_notes: r.get(7)?,
                assignment_id: r.get(8)?,
            })
        },
    )
    .optional()
    .map_err(HandlerError::db_query)
}

fn row_json(student_id: &str, material_id: &str, row: &ProgressRow) -> serde_json::Value {
    json!({
        "id": row.id,
        "studentId": student_id,
        "materialId": material_id,
        "assignmentId": row.assignment_id,
        "status": row.status,
        "score": row.score,
        "timeSpentMinutes": row.time_spent_minutes,
        "startedAt": row.started_at,
        "completedAt": row.completed_at,
        "teacherNotes": row.teacher_notes,
        "studentNotes": row.student_notes,
    })
}

fn progress_record(
    conn: &Connection,
    push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let student_id = get_required_str(params, "studentId")?;
    let material_id = get_required_str(params, "materialId")?;
    let now = now_param(params)?;

    match load_role(conn, &student_id)? {
        Role::Student => {}
        Role::Parent | Role::Teacher => {
            return Err(HandlerError::validation(
                "progress is tracked for student accounts only",
            ));
        }
    }
    let material_title: Option<String> = conn
        .query_row(
            "SELECT title FROM materials WHERE id = ?",
            [&material_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerError::db_query)?;
    let Some(material_title) = material_title else {
        return Err(HandlerError::not_found("material not found"));
    };

    if let Some(score) = get_opt_i64(params, "score")? {
        if !(0..=100).contains(&score) {
            return Err(HandlerError::validation("score must be between 0 and 100"));
        }
    }

    let existing = load_row(conn, &student_id, &material_id)?;
    let previous_status = existing
        .as_ref()
        .and_then(|r| ProgressStatus::parse(&r.status));

    let status_raw = match get_opt_str(params, "status")? {
        Some(raw) => raw,
        None => existing
            .as_ref()
            .map(|r| r.status.clone())
            .unwrap_or_else(|| ProgressStatus::NotStarted.as_str().to_string()),
    };
    let Some(requested_status) = ProgressStatus::parse(&status_raw) else {
        return Err(HandlerError::bad_params(format!(
            "unknown status: {}",
            status_raw
        )));
    };

    let score = match get_opt_i64(params, "score")? {
        Some(s) => Some(s),
        None => existing.as_ref().and_then(|r| r.score),
    };
    let time_spent = match get_opt_i64(params, "timeSpentMinutes")? {
        Some(t) => t,
        None => existing.as_ref().map(|r| r.time_spent_minutes).unwrap_or(0),
    };
    let assignment_id = match get_opt_str(params, "assignmentId")? {
        Some(a) => Some(a),
        None => existing.as_ref().and_then(|r| r.assignment_id.clone()),
    };
    let teacher_notes = get_opt_str(params, "teacherNotes")?
        .or_else(|| existing.as_ref().map(|r| r.teacher_notes.clone()))
        .unwrap_or_default();
    let student_notes = get_opt_str(params, "studentNotes")?
        .or_else(|| existing.as_ref().map(|r| r.student_notes.clone()))
        .unwrap_or_default();

    let started_at = existing
        .as_ref()
        .and_then(|r| parse_ts(&r.started_at))
        .unwrap_or(now);
    let mut completed_at = existing.as_ref().and_then(|r| {
        r.completed_at.as_deref().and_then(parse_ts)
    });
    // A requested completion stamps the timestamp before normalization,
    // so the repair rules only fire on inconsistent stored input.
    if requested_status == ProgressStatus::Completed && completed_at.is_none() {
        completed_at = Some(now);
    }
    let (status, completed_at) = calc::normalize_progress(requested_status, completed_at);
    if let Some(done) = completed_at {
        if done < started_at {
            return Err(HandlerError::validation(
                "completion cannot precede the start of work",
            ));
        }
    }

    conn.execute(
        "INSERT INTO progress(id, student_id, material_id, assignment_id, status,
             score, time_spent_minutes, started_at, completed_at,
             teacher_notes, student_notes)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, material_id) DO UPDATE SET
             assignment_id = excluded.assignment_id,
             status = excluded.status,
             score = excluded.score,
             time_spent_minutes = excluded.time_spent_minutes,
             completed_at = excluded.completed_at,
             teacher_notes = excluded.teacher_notes,
             student_notes = excluded.student_notes",
        (
            Uuid::new_v4().to_string(),
            &student_id,
            &material_id,
            &assignment_id,
            status.as_str(),
            score,
            time_spent,
            fmt_ts(started_at),
            completed_at.map(fmt_ts),
            &teacher_notes,
            &student_notes,
        ),
    )
    .map_err(HandlerError::db_update)?;

    if status == ProgressStatus::Completed && previous_status != Some(ProgressStatus::Completed) {
        push.to_account(
            conn,
            &student_id,
            &notify::achievement(&format!("completed {}", material_title)),
        );
    }

    let row = load_row(conn, &student_id, &material_id)?
        .ok_or_else(|| HandlerError::new("db_query_failed", "progress row vanished"))?;
    Ok(row_json(&student_id, &material_id, &row))
}

fn progress_list(
    conn: &Connection,
    _push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let student_id = get_required_str(params, "studentId")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, student_id, material_id, assignment_id, status, score,
                 time_spent_minutes, started_at, completed_at,
                 teacher_notes, student_notes
             FROM progress WHERE student_id = ? ORDER BY started_at DESC",
        )
        .map_err(HandlerError::db_query)?;
    let rows = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "materialId": r.get::<_, String>(2)?,
                "assignmentId": r.get::<_, Option<String>>(3)?,
                "status": r.get::<_, String>(4)?,
                "score": r.get::<_, Option<i64>>(5)?,
                "timeSpentMinutes": r.get::<_, i64>(6)?,
                "startedAt": r.get::<_, String>(7)?,
                "completedAt": r.get::<_, Option<String>>(8)?,
                "teacherNotes": r.get::<_, String>(9)?,
                "studentNotes": r.get::<_, String>(10)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerError::db_query)?;
    Ok(json!({ "progress": rows }))
}

fn progress_summary(
    conn: &Connection,
    _push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let student_id = get_required_str(params, "studentId")?;
    let today = today_param(params)?;

    let mut stmt = conn
        .prepare(
            "SELECT status, score, time_spent_minutes, started_at, completed_at
             FROM progress WHERE student_id = ?",
        )
        .map_err(HandlerError::db_query)?;
    let raw_rows = stmt
        .query_map([&student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<i64>>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, Option<String>>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerError::db_query)?;

    let mut rollup_rows = Vec::with_capacity(raw_rows.len());
    let mut active_days: HashSet<NaiveDate> = HashSet::new();
    for (status_raw, score, time, started_at, completed_at) in &raw_rows {
        let status = ProgressStatus::parse(status_raw).ok_or_else(|| {
            HandlerError::new(
                "db_query_failed",
                format!("unknown progress status: {}", status_raw),
            )
        })?;
        rollup_rows.push((status, *score, *time));
        if let Some(t) = parse_ts(started_at) {
            active_days.insert(t.date_naive());
        }
        if let Some(t) = completed_at.as_deref().and_then(parse_ts) {
            active_days.insert(t.date_naive());
        }
    }

    let rollup = calc::progress_rollup(&rollup_rows);
    let streak = calc::study_streak(&active_days, today);

    Ok(json!({
        "studentId": student_id,
        "totalMaterials": rollup.total,
        "completedMaterials": rollup.completed,
        "completionRate": rollup.completion_rate,
        "averageScore": rollup.average_score,
        "bestScore": rollup.best_score,
        "totalTimeMinutes": rollup.total_time_minutes,
        "studyStreakDays": streak,
    }))
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
        "progress.record" => Some(with_conn(state, req, progress_record)),
        "progress.list" => Some(with_conn(state, req, progress_list)),
        "progress.summary" => Some(with_conn(state, req, progress_summary)),
        _ => None,
    }
}
