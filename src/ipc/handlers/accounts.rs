use crate::calc::fmt_ts;
use crate::domain::Role;
use crate::ipc::error::{err, ok, HandlerError};
use crate::ipc::helpers::{get_opt_bool, get_opt_str, get_required_str};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;
use uuid::Uuid;

fn account_json(row: &Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "username": row.get::<_, String>(1)?,
        "role": row.get::<_, String>(2)?,
        "fullName": row.get::<_, String>(3)?,
        "email": row.get::<_, Option<String>>(4)?,
        "phone": row.get::<_, Option<String>>(5)?,
        "gradeLevel": row.get::<_, Option<String>>(6)?,
        "parentEmail": row.get::<_, Option<String>>(7)?,
        "active": row.get::<_, i64>(8)? != 0,
        "createdAt": row.get::<_, String>(9)?,
        "updatedAt": row.get::<_, Option<String>>(10)?,
    }))
}

const ACCOUNT_COLUMNS: &str = "id, username, role, full_name, email, phone, grade_level,
     parent_email, active, created_at, updated_at";

fn load_account(conn: &Connection, account_id: &str) -> Result<serde_json::Value, HandlerError> {
    conn.query_row(
        &format!("SELECT {} FROM accounts WHERE id = ?", ACCOUNT_COLUMNS),
        [account_id],
        account_json,
    )
    .optional()
    .map_err(HandlerError::db_query)?
    .ok_or_else(|| HandlerError::not_found("account not found"))
}

/// Students must carry both a grade level and a parent email.
fn check_student_rule(
    role: Role,
    grade_level: &Option<String>,
    parent_email: &Option<String>,
) -> Result<(), HandlerError> {
    if role != Role::Student {
        return Ok(());
    }
    let has_grade = grade_level.as_deref().is_some_and(|s| !s.trim().is_empty());
    let has_parent = parent_email.as_deref().is_some_and(|s| !s.trim().is_empty());
    if has_grade && has_parent {
        Ok(())
    } else {
        Err(HandlerError::validation(
            "student accounts require gradeLevel and parentEmail",
        ))
    }
}

fn accounts_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let username = get_required_str(params, "username")?;
    let role_raw = get_required_str(params, "role")?;
    let full_name = get_required_str(params, "fullName")?;
    let email = get_opt_str(params, "email")?;
    let phone = get_opt_str(params, "phone")?;
    let grade_level = get_opt_str(params, "gradeLevel")?;
    let parent_email = get_opt_str(params, "parentEmail")?;

    let Some(role) = Role::parse(&role_raw) else {
        return Err(HandlerError::bad_params(format!(
            "unknown role: {}",
            role_raw
        )));
    };
    if username.trim().is_empty() {
        return Err(HandlerError::validation("username must not be empty"));
    }
    check_student_rule(role, &grade_level, &parent_email)?;

    let taken = conn
        .query_row(
            "SELECT 1 FROM accounts WHERE username = ?",
            [&username],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(HandlerError::db_query)?
        .is_some();
    if taken {
        return Err(HandlerError::validation("username already taken"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO accounts(id, username, role, full_name, email, phone,
             grade_level, parent_email, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &id,
            &username,
            role.as_str(),
            &full_name,
            &email,
            &phone,
            &grade_level,
            &parent_email,
            fmt_ts(Utc::now()),
        ),
    )
    .map_err(HandlerError::db_update)?;

    load_account(conn, &id)
}

fn accounts_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let account_id = get_required_str(params, "accountId")?;

    struct Existing {
        role: String,
        full_name: String,
        email: Option<String>,
        phone: Option<String>,
        grade_level: Option<String>,
        parent_email: Option<String>,
        active: bool,
    }
    let existing = conn
        .query_row(
            "SELECT role, full_name, email, phone, grade_level, parent_email, active
             FROM accounts WHERE id = ?",
            [&account_id],
            |r| {
                Ok(Existing {
                    role: r.get(0)?,
                    full_name: r.get(1)?,
                    email: r.get(2)?,
                    phone: r.get(3)?,
                    grade_level: r.get(4)?,
                    parent_email: r.get(5)?,
                    active: r.get::<_, i64>(6)? != 0,
                })
            },
        )
        .optional()
        .map_err(HandlerError::db_query)?
        .ok_or_else(|| HandlerError::not_found("account not found"))?;

    let role_raw = get_opt_str(params, "role")?.unwrap_or(existing.role);
    let Some(role) = Role::parse(&role_raw) else {
        return Err(HandlerError::bad_params(format!(
            "unknown role: {}",
            role_raw
        )));
    };
    let full_name = get_opt_str(params, "fullName")?.unwrap_or(existing.full_name);
    let email = get_opt_str(params, "email")?.or(existing.email);
    let phone = get_opt_str(params, "phone")?.or(existing.phone);
    let grade_level = get_opt_str(params, "gradeLevel")?.or(existing.grade_level);
    let parent_email = get_opt_str(params, "parentEmail")?.or(existing.parent_email);
    let active = get_opt_bool(params, "active")?.unwrap_or(existing.active);

    // The merged record must still satisfy the student rule.
    check_student_rule(role, &grade_level, &parent_email)?;

    conn.execute(
        "UPDATE accounts SET role = ?, full_name = ?, email = ?, phone = ?,
             grade_level = ?, parent_email = ?, active = ?, updated_at = ?
         WHERE id = ?",
        (
            role.as_str(),
            &full_name,
            &email,
            &phone,
            &grade_level,
            &parent_email,
            active as i64,
            fmt_ts(Utc::now()),
            &account_id,
        ),
    )
    .map_err(HandlerError::db_update)?;

    load_account(conn, &account_id)
}

fn accounts_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let account_id = get_required_str(params, "accountId")?;
    load_account(conn, &account_id)
}

fn accounts_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let role = match get_opt_str(params, "role")? {
        None => None,
        Some(raw) => Some(
            Role::parse(&raw)
                .ok_or_else(|| HandlerError::bad_params(format!("unknown role: {}", raw)))?,
        ),
    };

    let sql = match role {
        Some(_) => format!(
            "SELECT {} FROM accounts WHERE role = ? ORDER BY username",
            ACCOUNT_COLUMNS
        ),
        None => format!("SELECT {} FROM accounts ORDER BY username", ACCOUNT_COLUMNS),
    };
    let mut stmt = conn.prepare(&sql).map_err(HandlerError::db_query)?;
    let rows = match role {
        Some(role) => stmt.query_map([role.as_str()], account_json),
        None => stmt.query_map([], account_json),
    }
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerError::db_query)?;

    Ok(json!({ "accounts": rows }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerError>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "accounts.create" => Some(with_conn(state, req, accounts_create)),
        "accounts.update" => Some(with_conn(state, req, accounts_update)),
        "accounts.get" => Some(with_conn(state, req, accounts_get)),
        "accounts.list" => Some(with_conn(state, req, accounts_list)),
        _ => None,
    }
}
