use crate::calc::fmt_ts;
use crate::domain::{Difficulty, MaterialType};
use crate::ipc::error::{err, ok, HandlerError};
use crate::ipc::helpers::{
    get_opt_bool, get_opt_i64, get_opt_str, get_required_str, require_teacher,
};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;
use uuid::Uuid;

const MATERIAL_COLUMNS: &str = "id, title, description, material_type, subject_id, difficulty,
     file_name, external_link, grade_level, estimated_time_minutes,
     uploaded_by, is_active, created_at, updated_at";

fn material_json(row: &Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "title": row.get::<_, String>(1)?,
        "description": row.get::<_, String>(2)?,
        "materialType": row.get::<_, String>(3)?,
        "subjectId": row.get::<_, String>(4)?,
        "difficulty": row.get::<_, String>(5)?,
        "fileName": row.get::<_, Option<String>>(6)?,
        "externalLink": row.get::<_, Option<String>>(7)?,
        "gradeLevel": row.get::<_, String>(8)?,
        "estimatedTimeMinutes": row.get::<_, i64>(9)?,
        "uploadedBy": row.get::<_, String>(10)?,
        "isActive": row.get::<_, i64>(11)? != 0,
        "createdAt": row.get::<_, String>(12)?,
        "updatedAt": row.get::<_, Option<String>>(13)?,
    }))
}

fn load_material(conn: &Connection, material_id: &str) -> Result<serde_json::Value, HandlerError> {
    conn.query_row(
        &format!("SELECT {} FROM materials WHERE id = ?", MATERIAL_COLUMNS),
        [material_id],
        material_json,
    )
    .optional()
    .map_err(HandlerError::db_query)?
    .ok_or_else(|| HandlerError::not_found("material not found"))
}

fn check_single_source(
    file_name: &Option<String>,
    external_link: &Option<String>,
) -> Result<(), HandlerError> {
    let has_file = file_name.as_deref().is_some_and(|s| !s.trim().is_empty());
    let has_link = external_link
        .as_deref()
        .is_some_and(|s| !s.trim().is_empty());
    match (has_file, has_link) {
        (true, false) | (false, true) => Ok(()),
        (true, true) => Err(HandlerError::validation(
            "material takes a file or an external link, not both",
        )),
        (false, false) => Err(HandlerError::validation(
            "material requires a file or an external link",
        )),
    }
}

fn subjects_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let name = get_required_str(params, "name")?;
    let description = get_opt_str(params, "description")?.unwrap_or_default();
    let color_code = get_opt_str(params, "colorCode")?.unwrap_or_else(|| "#007bff".to_string());

    if name.trim().is_empty() {
        return Err(HandlerError::validation("subject name must not be empty"));
    }
    let taken = conn
        .query_row("SELECT 1 FROM subjects WHERE name = ?", [&name], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(HandlerError::db_query)?
        .is_some();
    if taken {
        return Err(HandlerError::validation("subject already exists"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, description, color_code) VALUES(?, ?, ?, ?)",
        (&id, &name, &description, &color_code),
    )
    .map_err(HandlerError::db_update)?;

    Ok(json!({
        "id": id,
        "name": name,
        "description": description,
        "colorCode": color_code
    }))
}

fn subjects_list(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let mut stmt = conn
        .prepare("SELECT id, name, description, color_code FROM subjects ORDER BY name")
        .map_err(HandlerError::db_query)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "description": r.get::<_, String>(2)?,
                "colorCode": r.get::<_, String>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerError::db_query)?;
    Ok(json!({ "subjects": rows }))
}

fn materials_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let actor_id = get_required_str(params, "actorId")?;
    require_teacher(conn, &actor_id)?;

    let title = get_required_str(params, "title")?;
    let description = get_opt_str(params, "description")?.unwrap_or_default();
    let type_raw = get_required_str(params, "materialType")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let difficulty_raw = get_required_str(params, "difficulty")?;
    let file_name = get_opt_str(params, "fileName")?;
    let external_link = get_opt_str(params, "externalLink")?;
    let grade_level = get_required_str(params, "gradeLevel")?;
    let estimated_time = get_opt_i64(params, "estimatedTimeMinutes")?.unwrap_or(0);

    let Some(material_type) = MaterialType::parse(&type_raw) else {
        return Err(HandlerError::bad_params(format!(
            "unknown material type: {}",
            type_raw
        )));
    };
    let Some(difficulty) = Difficulty::parse(&difficulty_raw) else {
        return Err(HandlerError::bad_params(format!(
            "unknown difficulty: {}",
            difficulty_raw
        )));
    };
    check_single_source(&file_name, &external_link)?;

    let subject_exists = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(HandlerError::db_query)?
        .is_some();
    if !subject_exists {
        return Err(HandlerError::not_found("subject not found"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO materials(id, title, description, material_type, subject_id,
             difficulty, file_name, external_link, grade_level,
             estimated_time_minutes, uploaded_by, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &id,
            &title,
            &description,
            material_type.as_str(),
            &subject_id,
            difficulty.as_str(),
            &file_name,
            &external_link,
            &grade_level,
            estimated_time,
            &actor_id,
            fmt_ts(Utc::now()),
        ),
    )
    .map_err(HandlerError::db_update)?;

    load_material(conn, &id)
}

fn materials_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let actor_id = get_required_str(params, "actorId")?;
    require_teacher(conn, &actor_id)?;
    let material_id = get_required_str(params, "materialId")?;

    struct Existing {
        title: String,
        description: String,
        material_type: String,
        subject_id: String,
        difficulty: String,
        file_name: Option<String>,
        external_link: Option<String>,
        grade_level: String,
        estimated_time: i64,
    }
    let existing = conn
        .query_row(
            "SELECT title, description, material_type, subject_id, difficulty,
                 file_name, external_link, grade_level, estimated_time_minutes
             FROM materials WHERE id = ?",
            [&material_id],
            |r| {
                Ok(Existing {
                    title: r.get(0)?,
                    description: r.get(1)?,
                    material_type: r.get(2)?,
                    subject_id: r.get(3)?,
                    difficulty: r.get(4)?,
                    file_name: r.get(5)?,
                    external_link: r.get(6)?,
                    grade_level: r.get(7)?,
                    estimated_time: r.get(8)?,
                })
            },
        )
        .optional()
        .map_err(HandlerError::db_query)?
        .ok_or_else(|| HandlerError::not_found("material not found"))?;

    let title = get_opt_str(params, "title")?.unwrap_or(existing.title);
    let description = get_opt_str(params, "description")?.unwrap_or(existing.description);
    let type_raw = get_opt_str(params, "materialType")?.unwrap_or(existing.material_type);
    let subject_id = get_opt_str(params, "subjectId")?.unwrap_or(existing.subject_id);
    let difficulty_raw = get_opt_str(params, "difficulty")?.unwrap_or(existing.difficulty);
    let grade_level = get_opt_str(params, "gradeLevel")?.unwrap_or(existing.grade_level);
    let estimated_time =
        get_opt_i64(params, "estimatedTimeMinutes")?.unwrap_or(existing.estimated_time);

    // Switching to a link clears the file and vice versa.
    let (file_name, external_link) = match (
        get_opt_str(params, "fileName")?,
        get_opt_str(params, "externalLink")?,
    ) {
        (Some(f), None) => (Some(f), None),
        (None, Some(l)) => (None, Some(l)),
        (Some(_), Some(_)) => {
            return Err(HandlerError::validation(
                "material takes a file or an external link, not both",
            ))
        }
        (None, None) => (existing.file_name, existing.external_link),
    };
    check_single_source(&file_name, &external_link)?;

    let Some(material_type) = MaterialType::parse(&type_raw) else {
        return Err(HandlerError::bad_params(format!(
            "unknown material type: {}",
            type_raw
        )));
    };
    let Some(difficulty) = Difficulty::parse(&difficulty_raw) else {
        return Err(HandlerError::bad_params(format!(
            "unknown difficulty: {}",
            difficulty_raw
        )));
    };

    conn.execute(
        "UPDATE materials SET title = ?, description = ?, material_type = ?,
             subject_id = ?, difficulty = ?, file_name = ?, external_link = ?,
             grade_level = ?, estimated_time_minutes = ?, updated_at = ?
         WHERE id = ?",
        (
            &title,
            &description,
            material_type.as_str(),
            &subject_id,
            difficulty.as_str(),
            &file_name,
            &external_link,
            &grade_level,
            estimated_time,
            fmt_ts(Utc::now()),
            &material_id,
        ),
    )
    .map_err(HandlerError::db_update)?;

    load_material(conn, &material_id)
}

fn materials_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let material_id = get_required_str(params, "materialId")?;
    load_material(conn, &material_id)
}

fn materials_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let subject_id = get_opt_str(params, "subjectId")?;
    let active_only = get_opt_bool(params, "activeOnly")?.unwrap_or(false);

    let mut sql = format!("SELECT {} FROM materials WHERE 1=1", MATERIAL_COLUMNS);
    let mut binds: Vec<String> = Vec::new();
    if let Some(subject_id) = subject_id {
        sql.push_str(" AND subject_id = ?");
        binds.push(subject_id);
    }
    if active_only {
        sql.push_str(" AND is_active = 1");
    }
    sql.push_str(" ORDER BY created_at DESC, title");

    let mut stmt = conn.prepare(&sql).map_err(HandlerError::db_query)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), material_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerError::db_query)?;
    Ok(json!({ "materials": rows }))
}

fn materials_deactivate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let actor_id = get_required_str(params, "actorId")?;
    require_teacher(conn, &actor_id)?;
    let material_id = get_required_str(params, "materialId")?;

    let changed = conn
        .execute(
            "UPDATE materials SET is_active = 0, updated_at = ? WHERE id = ?",
            (fmt_ts(Utc::now()), &material_id),
        )
        .map_err(HandlerError::db_update)?;
    if changed == 0 {
        return Err(HandlerError::not_found("material not found"));
    }
    load_material(conn, &material_id)
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
        "subjects.create" => Some(with_conn(state, req, subjects_create)),
        "subjects.list" => Some(with_conn(state, req, subjects_list)),
        "materials.create" => Some(with_conn(state, req, materials_create)),
        "materials.update" => Some(with_conn(state, req, materials_update)),
        "materials.get" => Some(with_conn(state, req, materials_get)),
        "materials.list" => Some(with_conn(state, req, materials_list)),
        "materials.deactivate" => Some(with_conn(state, req, materials_deactivate)),
        _ => None,
    }
}
