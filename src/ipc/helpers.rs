use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

use super::error::HandlerError;
use crate::calc::parse_ts;
use crate::domain::Role;

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerError::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str(params: &Value, key: &str) -> Result<Option<String>, HandlerError> {
    match params.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(HandlerError::bad_params(format!(
            "{} must be a string",
            key
        ))),
    }
}

pub fn get_opt_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerError> {
    match params.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerError::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn get_opt_f64(params: &Value, key: &str) -> Result<Option<f64>, HandlerError> {
    match params.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| HandlerError::bad_params(format!("{} must be a number", key))),
    }
}

pub fn get_opt_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerError> {
    match params.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerError::bad_params(format!("{} must be a boolean", key))),
    }
}

pub fn get_str_array(params: &Value, key: &str) -> Result<Vec<String>, HandlerError> {
    let Some(values) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerError::bad_params(format!("missing {}", key)));
    };
    values
        .iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| HandlerError::bad_params(format!("{} must contain strings", key)))
        })
        .collect()
}

pub fn get_required_ts(params: &Value, key: &str) -> Result<DateTime<Utc>, HandlerError> {
    let raw = get_required_str(params, key)?;
    parse_ts(&raw)
        .ok_or_else(|| HandlerError::bad_params(format!("{} must be an RFC 3339 timestamp", key)))
}

pub fn get_opt_ts(params: &Value, key: &str) -> Result<Option<DateTime<Utc>>, HandlerError> {
    match get_opt_str(params, key)? {
        None => Ok(None),
        Some(raw) => parse_ts(&raw).map(Some).ok_or_else(|| {
            HandlerError::bad_params(format!("{} must be an RFC 3339 timestamp", key))
        }),
    }
}

/// Clock override for deterministic tests; production callers omit it.
pub fn now_param(params: &Value) -> Result<DateTime<Utc>, HandlerError> {
    Ok(get_opt_ts(params, "now")?.unwrap_or_else(Utc::now))
}

pub fn today_param(params: &Value) -> Result<NaiveDate, HandlerError> {
    match get_opt_str(params, "today")? {
        None => Ok(Utc::now().date_naive()),
        Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map_err(|_| HandlerError::bad_params("today must be YYYY-MM-DD")),
    }
}

pub fn load_role(conn: &Connection, account_id: &str) -> Result<Role, HandlerError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT role FROM accounts WHERE id = ?",
            [account_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerError::db_query)?;
    let Some(raw) = raw else {
        return Err(HandlerError::not_found("account not found"));
    };
    Role::parse(&raw)
        .ok_or_else(|| HandlerError::new("db_query_failed", format!("unknown role: {}", raw)))
}

pub fn require_teacher(conn: &Connection, account_id: &str) -> Result<(), HandlerError> {
    match load_role(conn, account_id)? {
        Role::Teacher => Ok(()),
        Role::Student | Role::Parent => {
            Err(HandlerError::forbidden("teacher access required"))
        }
    }
}

/// Display name for notifications: full name, falling back to username.
pub fn account_display_name(conn: &Connection, account_id: &str) -> Result<String, HandlerError> {
    conn.query_row(
        "SELECT CASE WHEN full_name <> '' THEN full_name ELSE username END
         FROM accounts WHERE id = ?",
        [account_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerError::db_query)?
    .ok_or_else(|| HandlerError::not_found("account not found"))
}
