use crate::calc::fmt_ts;
use crate::ipc::error::{err, ok, HandlerError};
use crate::ipc::helpers::{get_opt_bool, get_opt_str, get_required_str, load_role, now_param};
use crate::ipc::types::{AppState, Request};
use crate::notify;
use crate::push::{self, PushDispatcher};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn push_register_token(
    conn: &Connection,
    _push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let account_id = get_required_str(params, "accountId")?;
    load_role(conn, &account_id)?;
    let token = get_required_str(params, "token")?;
    let device_info = get_opt_str(params, "deviceInfo")?;
    let now = now_param(params)?;

    if token.trim().is_empty() {
        return Err(HandlerError::validation("token must not be empty"));
    }

    // Re-registering a known token reactivates it and refreshes its age.
    conn.execute(
        "INSERT INTO push_tokens(id, account_id, token, device_info, is_active,
             created_at, updated_at)
         VALUES(?, ?, ?, ?, 1, ?, ?)
         ON CONFLICT(account_id, token) DO UPDATE SET
             device_info = excluded.device_info,
             is_active = 1,
             updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &account_id,
            &token,
            &device_info,
            fmt_ts(now),
            fmt_ts(now),
        ),
    )
    .map_err(HandlerError::db_update)?;

    conn.query_row(
        "SELECT id, account_id, token, device_info, is_active, created_at, updated_at
         FROM push_tokens WHERE account_id = ? AND token = ?",
        (&account_id, &token),
        token_json,
    )
    .map_err(HandlerError::db_query)
}

fn token_json(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "accountId": r.get::<_, String>(1)?,
        "token": r.get::<_, String>(2)?,
        "deviceInfo": r.get::<_, Option<String>>(3)?,
        "isActive": r.get::<_, i64>(4)? != 0,
        "createdAt": r.get::<_, String>(5)?,
        "updatedAt": r.get::<_, String>(6)?,
    }))
}

fn push_revoke_token(
    conn: &Connection,
    _push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let account_id = get_required_str(params, "accountId")?;
    let token = get_required_str(params, "token")?;
    let now = now_param(params)?;

    let changed = conn
        .execute(
            "UPDATE push_tokens SET is_active = 0, updated_at = ?
             WHERE account_id = ? AND token = ?",
            (fmt_ts(now), &account_id, &token),
        )
        .map_err(HandlerError::db_update)?;
    if changed == 0 {
        return Err(HandlerError::not_found("token not registered"));
    }
    Ok(json!({ "revoked": true }))
}

fn push_list_tokens(
    conn: &Connection,
    _push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let account_id = get_required_str(params, "accountId")?;
    let active_only = get_opt_bool(params, "activeOnly")?.unwrap_or(false);

    let sql = if active_only {
        "SELECT id, account_id, token, device_info, is_active, created_at, updated_at
         FROM push_tokens WHERE account_id = ? AND is_active = 1 ORDER BY created_at"
    } else {
        "SELECT id, account_id, token, device_info, is_active, created_at, updated_at
         FROM push_tokens WHERE account_id = ? ORDER BY created_at"
    };
    let mut stmt = conn.prepare(sql).map_err(HandlerError::db_query)?;
    let rows = stmt
        .query_map([&account_id], token_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerError::db_query)?;
    Ok(json!({ "tokens": rows }))
}

fn push_send_test(
    conn: &Connection,
    push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let account_id = get_required_str(params, "accountId")?;
    load_role(conn, &account_id)?;

    let delivered = push.to_account(conn, &account_id, &notify::test_message());
    Ok(json!({ "delivered": delivered }))
}

fn push_cleanup_stale_tokens(
    conn: &Connection,
    _push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let now = now_param(params)?;
    let purged = push::cleanup_stale_tokens(conn, now).map_err(HandlerError::db_update)?;
    Ok(json!({ "purged": purged }))
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
        "push.registerToken" => Some(with_conn(state, req, push_register_token)),
        "push.revokeToken" => Some(with_conn(state, req, push_revoke_token)),
        "push.listTokens" => Some(with_conn(state, req, push_list_tokens)),
        "push.sendTest" => Some(with_conn(state, req, push_send_test)),
        "push.cleanupStaleTokens" => Some(with_conn(state, req, push_cleanup_stale_tokens)),
        _ => None,
    }
}
