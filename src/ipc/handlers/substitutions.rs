use crate::ipc::error::ok;
use crate::ipc::helpers::{db_conn, fmt_date, optional_date, optional_str, required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

/// Filtered read of substitution records; `from`/`to` bound `date`
/// inclusively.
fn substitutions_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tenant_id = required_str(params, "tenantId")?;
    let classroom_id = optional_str(params, "classroomId");
    let from = optional_date(params, "from")?;
    let to = optional_date(params, "to")?;

    let mut sql = String::from(
        "SELECT id, date, classroom_id, period_key, subject_id,
                absent_teacher_id, substitute_teacher_id, mode, note
         FROM substitutions WHERE tenant_id = ?",
    );
    let mut binds: Vec<String> = vec![tenant_id];
    if let Some(c) = classroom_id {
        sql.push_str(" AND classroom_id = ?");
        binds.push(c);
    }
    if let Some(f) = from {
        sql.push_str(" AND date >= ?");
        binds.push(fmt_date(f));
    }
    if let Some(t) = to {
        sql.push_str(" AND date <= ?");
        binds.push(fmt_date(t));
    }
    sql.push_str(" ORDER BY date, classroom_id, period_key");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "date": r.get::<_, String>(1)?,
                "classroomId": r.get::<_, String>(2)?,
                "periodKey": r.get::<_, String>(3)?,
                "subjectId": r.get::<_, Option<String>>(4)?,
                "absentTeacherId": r.get::<_, String>(5)?,
                "substituteTeacherId": r.get::<_, Option<String>>(6)?,
                "mode": r.get::<_, String>(7)?,
                "note": r.get::<_, Option<String>>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(json!({ "substitutions": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if req.method.as_str() != "substitutions.list" {
        return None;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return Some(resp),
    };
    Some(match substitutions_list(conn, &req.params) {
        Ok(value) => ok(&req.id, value),
        Err(error) => error.response(&req.id),
    })
}
