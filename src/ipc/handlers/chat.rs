use crate::calc::fmt_ts;
use crate::domain::{MessageType, Role};
use crate::ipc::error::{err, ok, HandlerError};
use crate::ipc::helpers::{
    account_display_name, get_opt_bool, get_opt_str, get_required_str, get_str_array, load_role,
    now_param, require_teacher,
};
use crate::ipc::types::{AppState, Request};
use crate::notify;
use crate::push::PushDispatcher;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn is_participant(
    conn: &Connection,
    room_id: &str,
    account_id: &str,
) -> Result<bool, HandlerError> {
    conn.query_row(
        "SELECT 1 FROM chat_participants WHERE room_id = ? AND account_id = ?",
        (room_id, account_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerError::db_query)
}

fn participants(conn: &Connection, room_id: &str) -> Result<Vec<String>, HandlerError> {
    let mut stmt = conn
        .prepare(
            "SELECT account_id FROM chat_participants WHERE room_id = ? ORDER BY account_id",
        )
        .map_err(HandlerError::db_query)?;
    stmt.query_map([room_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerError::db_query)
}

fn room_json(conn: &Connection, room_id: &str) -> Result<serde_json::Value, HandlerError> {
    let row = conn
        .query_row(
            "SELECT id, name, is_group_chat, created_by, created_at
             FROM chat_rooms WHERE id = ?",
            [room_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "isGroupChat": r.get::<_, i64>(2)? != 0,
                    "createdBy": r.get::<_, String>(3)?,
                    "createdAt": r.get::<_, String>(4)?,
                }))
            },
        )
        .optional()
        .map_err(HandlerError::db_query)?;
    let Some(mut room) = row else {
        return Err(HandlerError::not_found("room not found"));
    };
    room["participantIds"] = json!(participants(conn, room_id)?);
    Ok(room)
}

fn insert_message(
    conn: &Connection,
    room_id: &str,
    sender_id: &str,
    message_type: MessageType,
    content: &str,
    file_name: &Option<String>,
    at: &str,
) -> Result<String, HandlerError> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO messages(id, room_id, sender_id, message_type, content,
             file_name, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            room_id,
            sender_id,
            message_type.as_str(),
            content,
            file_name,
            at,
        ),
    )
    .map_err(HandlerError::db_update)?;
    Ok(id)
}

fn chat_create_room(
    conn: &Connection,
    _push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let actor_id = get_required_str(params, "actorId")?;
    load_role(conn, &actor_id)?;
    let name = get_required_str(params, "name")?;
    let participant_ids = get_str_array(params, "participantIds")?;
    let is_group = get_opt_bool(params, "isGroupChat")?.unwrap_or(false);
    let now = now_param(params)?;

    for account_id in &participant_ids {
        load_role(conn, account_id)?;
    }

    let id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerError::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO chat_rooms(id, name, is_group_chat, created_by, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&id, &name, is_group as i64, &actor_id, fmt_ts(now)),
    )
    .map_err(HandlerError::db_update)?;
    // The creator is always in the room, whether or not they were listed.
    tx.execute(
        "INSERT OR IGNORE INTO chat_participants(room_id, account_id) VALUES(?, ?)",
        (&id, &actor_id),
    )
    .map_err(HandlerError::db_update)?;
    for account_id in &participant_ids {
        tx.execute(
            "INSERT OR IGNORE INTO chat_participants(room_id, account_id) VALUES(?, ?)",
            (&id, account_id),
        )
        .map_err(HandlerError::db_update)?;
    }
    tx.commit()
        .map_err(|e| HandlerError::new("db_commit_failed", e.to_string()))?;

    room_json(conn, &id)
}

fn chat_list_rooms(
    conn: &Connection,
    _push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let actor_id = get_required_str(params, "actorId")?;
    load_role(conn, &actor_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT r.id FROM chat_rooms r
             JOIN chat_participants p ON p.room_id = r.id
             WHERE p.account_id = ?
             ORDER BY r.created_at DESC",
        )
        .map_err(HandlerError::db_query)?;
    let room_ids = stmt
        .query_map([&actor_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerError::db_query)?;

    let mut rooms = Vec::with_capacity(room_ids.len());
    for room_id in &room_ids {
        let mut room = room_json(conn, room_id)?;
        let latest = conn
            .query_row(
                "SELECT id, sender_id, message_type, content, created_at
                 FROM messages WHERE room_id = ?
                 ORDER BY created_at DESC, id LIMIT 1",
                [room_id],
                |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "senderId": r.get::<_, String>(1)?,
                        "messageType": r.get::<_, String>(2)?,
                        "content": r.get::<_, String>(3)?,
                        "createdAt": r.get::<_, String>(4)?,
                    }))
                },
            )
            .optional()
            .map_err(HandlerError::db_query)?;
        room["latestMessage"] = latest.unwrap_or(serde_json::Value::Null);
        rooms.push(room);
    }
    Ok(json!({ "rooms": rooms }))
}

fn chat_post_message(
    conn: &Connection,
    push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let room_id = get_required_str(params, "roomId")?;
    let actor_id = get_required_str(params, "actorId")?;
    let content = get_opt_str(params, "content")?.unwrap_or_default();
    let type_raw = get_opt_str(params, "messageType")?.unwrap_or_else(|| "text".to_string());
    let file_name = get_opt_str(params, "fileName")?;
    let now = now_param(params)?;

    let Some(message_type) = MessageType::parse(&type_raw) else {
        return Err(HandlerError::bad_params(format!(
            "unknown message type: {}",
            type_raw
        )));
    };
    let room_name: Option<String> = conn
        .query_row("SELECT name FROM chat_rooms WHERE id = ?", [&room_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerError::db_query)?;
    let Some(room_name) = room_name else {
        return Err(HandlerError::not_found("room not found"));
    };
    if !is_participant(conn, &room_id, &actor_id)? {
        return Err(HandlerError::forbidden("not a participant of this room"));
    }
    if message_type == MessageType::Text && content.trim().is_empty() {
        return Err(HandlerError::validation("text messages require content"));
    }

    let message_id = insert_message(
        conn,
        &room_id,
        &actor_id,
        message_type,
        &content,
        &file_name,
        &fmt_ts(now),
    )?;

    let sender_name = account_display_name(conn, &actor_id)?;
    let recipients = participants(conn, &room_id)?;
    let delivered = push.to_accounts(
        conn,
        &recipients,
        Some(&actor_id),
        &notify::chat_message(&room_id, &room_name, &sender_name, &content),
    );

    Ok(json!({
        "id": message_id,
        "roomId": room_id,
        "senderId": actor_id,
        "messageType": message_type.as_str(),
        "content": content,
        "fileName": file_name,
        "createdAt": fmt_ts(now),
        "notified": delivered,
    }))
}

fn chat_list_messages(
    conn: &Connection,
    _push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let room_id = get_required_str(params, "roomId")?;
    let actor_id = get_required_str(params, "actorId")?;
    let order = get_opt_str(params, "order")?.unwrap_or_else(|| "desc".to_string());

    let direction = match order.as_str() {
        "desc" => "DESC",
        "asc" => "ASC",
        _ => return Err(HandlerError::bad_params("order must be asc or desc")),
    };
    let room_exists = conn
        .query_row("SELECT 1 FROM chat_rooms WHERE id = ?", [&room_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(HandlerError::db_query)?
        .is_some();
    if !room_exists {
        return Err(HandlerError::not_found("room not found"));
    }
    if !is_participant(conn, &room_id, &actor_id)? {
        return Err(HandlerError::forbidden("not a participant of this room"));
    }

    let sql = format!(
        "SELECT id, sender_id, message_type, content, file_name, created_at, edited_at
         FROM messages WHERE room_id = ?
         ORDER BY created_at {}, id {}",
        direction, direction
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerError::db_query)?;
    let rows = stmt
        .query_map([&room_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "senderId": r.get::<_, String>(1)?,
                "messageType": r.get::<_, String>(2)?,
                "content": r.get::<_, String>(3)?,
                "fileName": r.get::<_, Option<String>>(4)?,
                "createdAt": r.get::<_, String>(5)?,
                "editedAt": r.get::<_, Option<String>>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerError::db_query)?;
    Ok(json!({ "messages": rows }))
}

fn chat_mark_read(
    conn: &Connection,
    _push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let message_id = get_required_str(params, "messageId")?;
    let actor_id = get_required_str(params, "actorId")?;
    let now = now_param(params)?;

    let room_id: Option<String> = conn
        .query_row(
            "SELECT room_id FROM messages WHERE id = ?",
            [&message_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerError::db_query)?;
    let Some(room_id) = room_id else {
        return Err(HandlerError::not_found("message not found"));
    };
    if !is_participant(conn, &room_id, &actor_id)? {
        return Err(HandlerError::forbidden("not a participant of this room"));
    }

    // Idempotent: repeat reads keep the original timestamp.
    conn.execute(
        "INSERT OR IGNORE INTO message_reads(message_id, account_id, read_at)
         VALUES(?, ?, ?)",
        (&message_id, &actor_id, fmt_ts(now)),
    )
    .map_err(HandlerError::db_update)?;

    let read_at: String = conn
        .query_row(
            "SELECT read_at FROM message_reads WHERE message_id = ? AND account_id = ?",
            (&message_id, &actor_id),
            |r| r.get(0),
        )
        .map_err(HandlerError::db_query)?;
    Ok(json!({
        "messageId": message_id,
        "accountId": actor_id,
        "readAt": read_at,
    }))
}

fn chat_announce(
    conn: &Connection,
    push: &PushDispatcher,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let actor_id = get_required_str(params, "actorId")?;
    require_teacher(conn, &actor_id)?;
    let content = get_required_str(params, "content")?;
    let group_raw = get_required_str(params, "recipientGroup")?;
    let now = now_param(params)?;

    if content.trim().is_empty() {
        return Err(HandlerError::validation("announcement requires content"));
    }
    let recipient_role = match group_raw.as_str() {
        "students" => Role::Student,
        "parents" => Role::Parent,
        _ => {
            return Err(HandlerError::bad_params(
                "recipientGroup must be students or parents",
            ));
        }
    };

    let mut stmt = conn
        .prepare("SELECT id FROM accounts WHERE role = ? AND active = 1 ORDER BY username")
        .map_err(HandlerError::db_query)?;
    let recipients = stmt
        .query_map([recipient_role.as_str()], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerError::db_query)?;

    let username: String = conn
        .query_row(
            "SELECT username FROM accounts WHERE id = ?",
            [&actor_id],
            |r| r.get(0),
        )
        .map_err(HandlerError::db_query)?;
    let room_name = format!("Announcement by {}", username);

    let room_id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerError::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO chat_rooms(id, name, is_group_chat, created_by, created_at)
         VALUES(?, ?, 1, ?, ?)",
        (&room_id, &room_name, &actor_id, fmt_ts(now)),
    )
    .map_err(HandlerError::db_update)?;
    tx.execute(
        "INSERT OR IGNORE INTO chat_participants(room_id, account_id) VALUES(?, ?)",
        (&room_id, &actor_id),
    )
    .map_err(HandlerError::db_update)?;
    for account_id in &recipients {
        tx.execute(
            "INSERT OR IGNORE INTO chat_participants(room_id, account_id) VALUES(?, ?)",
            (&room_id, account_id),
        )
        .map_err(HandlerError::db_update)?;
    }
    let message_id = insert_message(
        &tx,
        &room_id,
        &actor_id,
        MessageType::Text,
        &content,
        &None,
        &fmt_ts(now),
    )?;
    tx.commit()
        .map_err(|e| HandlerError::new("db_commit_failed", e.to_string()))?;

    let sender_name = account_display_name(conn, &actor_id)?;
    let delivered = push.to_accounts(
        conn,
        &recipients,
        Some(&actor_id),
        &notify::chat_message(&room_id, &room_name, &sender_name, &content),
    );

    Ok(json!({
        "roomId": room_id,
        "messageId": message_id,
        "recipients": recipients.len(),
        "notified": delivered,
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
        "chat.createRoom" => Some(with_conn(state, req, chat_create_room)),
        "chat.listRooms" => Some(with_conn(state, req, chat_list_rooms)),
        "chat.postMessage" => Some(with_conn(state, req, chat_post_message)),
        "chat.listMessages" => Some(with_conn(state, req, chat_list_messages)),
        "chat.markRead" => Some(with_conn(state, req, chat_mark_read)),
        "chat.announce" => Some(with_conn(state, req, chat_announce)),
        _ => None,
    }
}
