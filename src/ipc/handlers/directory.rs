use crate::ipc::error::ok;
use crate::ipc::helpers::{db_conn, optional_str, required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn teachers_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tenant_id = required_str(params, "tenantId")?;
    let name = required_str(params, "name")?;
    let role = optional_str(params, "role").unwrap_or_else(|| "TEACHER".to_string());
    let max_per_day = params
        .get("maxPerDay")
        .and_then(|v| v.as_i64())
        .unwrap_or(6);
    let max_per_week = params
        .get("maxPerWeek")
        .and_then(|v| v.as_i64())
        .unwrap_or(30);

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, tenant_id, name, role, max_per_day, max_per_week)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, &tenant_id, &name, &role, max_per_day, max_per_week),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({ "id": id }))
}

fn teachers_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tenant_id = required_str(params, "tenantId")?;
    let mut stmt = conn.prepare(
        "SELECT id, name, role, max_per_day, max_per_week
         FROM teachers WHERE tenant_id = ? ORDER BY name, id",
    )?;
    let rows = stmt
        .query_map([&tenant_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "role": r.get::<_, String>(2)?,
                "maxPerDay": r.get::<_, i64>(3)?,
                "maxPerWeek": r.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(json!({ "teachers": rows }))
}

fn classrooms_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tenant_id = required_str(params, "tenantId")?;
    let name = required_str(params, "name")?;
    let section = optional_str(params, "section").unwrap_or_else(|| "A".to_string());

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classrooms(id, tenant_id, name, section) VALUES(?, ?, ?, ?)",
        (&id, &tenant_id, &name, &section),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({ "id": id }))
}

fn classrooms_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tenant_id = required_str(params, "tenantId")?;
    let mut stmt = conn.prepare(
        "SELECT id, name, section FROM classrooms WHERE tenant_id = ? ORDER BY name, section",
    )?;
    let rows = stmt
        .query_map([&tenant_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "section": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(json!({ "classrooms": rows }))
}

fn classroom_exists(conn: &Connection, tenant_id: &str, classroom_id: &str) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM classrooms WHERE tenant_id = ? AND id = ?",
            (tenant_id, classroom_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

fn subjects_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tenant_id = required_str(params, "tenantId")?;
    let classroom_id = required_str(params, "classroomId")?;
    let name = required_str(params, "name")?;
    let code = required_str(params, "code")?;
    let teacher_id = optional_str(params, "teacherId");

    if !classroom_exists(conn, &tenant_id, &classroom_id)? {
        return Err(HandlerErr::new("not_found", "classroom not found"));
    }

    // Creation order is the round-robin order draft generation cycles over.
    let next_order: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM subjects
         WHERE tenant_id = ? AND classroom_id = ?",
        (&tenant_id, &classroom_id),
        |r| r.get(0),
    )?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, tenant_id, classroom_id, name, code, teacher_id, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &tenant_id,
            &classroom_id,
            &name,
            &code,
            &teacher_id,
            next_order,
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({ "id": id }))
}

fn subjects_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tenant_id = required_str(params, "tenantId")?;
    let classroom_id = required_str(params, "classroomId")?;
    let mut stmt = conn.prepare(
        "SELECT id, name, code, teacher_id FROM subjects
         WHERE tenant_id = ? AND classroom_id = ? ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map((&tenant_id, &classroom_id), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
                "teacherId": r.get::<_, Option<String>>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(json!({ "subjects": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !matches!(
        req.method.as_str(),
        "teachers.create"
            | "teachers.list"
            | "classrooms.create"
            | "classrooms.list"
            | "subjects.create"
            | "subjects.list"
    ) {
        return None;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return Some(resp),
    };
    let result = match req.method.as_str() {
        "teachers.create" => teachers_create(conn, &req.params),
        "teachers.list" => teachers_list(conn, &req.params),
        "classrooms.create" => classrooms_create(conn, &req.params),
        "classrooms.list" => classrooms_list(conn, &req.params),
        "subjects.create" => subjects_create(conn, &req.params),
        _ => subjects_list(conn, &req.params),
    };
    Some(match result {
        Ok(value) => ok(&req.id, value),
        Err(error) => error.response(&req.id),
    })
}
