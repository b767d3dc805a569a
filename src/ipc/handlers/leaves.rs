use crate::ipc::error::ok;
use crate::ipc::helpers::{
    db_conn, fmt_date, optional_date, optional_str, required_date, required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::planner::{self, LeaveRef};
use crate::schedule;
use chrono::{Duration, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct LeaveRow {
    id: String,
    teacher_id: String,
    start_date: String,
    end_date: String,
    reason: String,
    status: String,
}

fn load_leave(
    conn: &Connection,
    tenant_id: &str,
    leave_id: &str,
) -> Result<Option<LeaveRow>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT id, teacher_id, start_date, end_date, reason, status
             FROM leaves WHERE tenant_id = ? AND id = ?",
            (tenant_id, leave_id),
            |r| {
                Ok(LeaveRow {
                    id: r.get(0)?,
                    teacher_id: r.get(1)?,
                    start_date: r.get(2)?,
                    end_date: r.get(3)?,
                    reason: r.get(4)?,
                    status: r.get(5)?,
                })
            },
        )
        .optional()?)
}

fn leave_json(row: &LeaveRow) -> serde_json::Value {
    json!({
        "id": row.id,
        "teacherId": row.teacher_id,
        "startDate": row.start_date,
        "endDate": row.end_date,
        "reason": row.reason,
        "status": row.status,
    })
}

fn load_periods(conn: &Connection, leave_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT date, day, period_key, subject_id, classroom_id
         FROM leave_periods WHERE leave_id = ? ORDER BY seq",
    )?;
    let rows = stmt
        .query_map([leave_id], |r| {
            Ok(json!({
                "date": r.get::<_, String>(0)?,
                "day": r.get::<_, String>(1)?,
                "periodKey": r.get::<_, String>(2)?,
                "subjectId": r.get::<_, Option<String>>(3)?,
                "classroomId": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

/// Creates a PENDING leave and snapshots every slot the teacher would have
/// taught, scanning the published timetable of each day in the range. The
/// snapshot is what planning later consumes, so the approver and the planner
/// see the same slots even if timetables change in between.
fn leave_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tenant_id = required_str(params, "tenantId")?;
    let teacher_id = required_str(params, "teacherId")?;
    let start = required_date(params, "startDate")?;
    let end = required_date(params, "endDate")?;
    let reason = optional_str(params, "reason").unwrap_or_default();

    if end < start {
        return Err(HandlerErr::new("bad_params", "endDate before startDate"));
    }
    let teacher_exists: bool = conn
        .query_row(
            "SELECT 1 FROM teachers WHERE tenant_id = ? AND id = ?",
            (&tenant_id, &teacher_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if !teacher_exists {
        return Err(HandlerErr::new("not_found", "teacher not found"));
    }

    let mut periods: Vec<(NaiveDate, String, String, Option<String>, String)> = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let day = schedule::weekday_abbrev(cursor);
        let week_s = fmt_date(schedule::week_start(cursor));
        let mut stmt = conn.prepare(
            "SELECT t.classroom_id, e.period_key, e.subject_id
             FROM timetable_entries e
             JOIN timetables t ON t.id = e.timetable_id
             WHERE t.tenant_id = ? AND t.status = 'published' AND t.week_start = ?
               AND e.day = ? AND e.teacher_id = ?
             ORDER BY t.classroom_id, e.period_key",
        )?;
        let hits: Vec<(String, String, Option<String>)> = stmt
            .query_map((&tenant_id, &week_s, day, &teacher_id), |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
        for (classroom_id, period_key, subject_id) in hits {
            periods.push((cursor, day.to_string(), period_key, subject_id, classroom_id));
        }
        cursor += Duration::days(1);
    }

    let leave_id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO leaves(id, tenant_id, teacher_id, start_date, end_date, reason, status)
         VALUES(?, ?, ?, ?, ?, ?, 'PENDING')",
        (
            &leave_id,
            &tenant_id,
            &teacher_id,
            &fmt_date(start),
            &fmt_date(end),
            &reason,
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    for (seq, (date, day, period_key, subject_id, classroom_id)) in periods.iter().enumerate() {
        tx.execute(
            "INSERT INTO leave_periods(leave_id, seq, date, day, period_key, subject_id, classroom_id)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &leave_id,
                seq as i64,
                &fmt_date(*date),
                day,
                period_key,
                subject_id,
                classroom_id,
            ),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    Ok(json!({
        "leaveId": leave_id,
        "status": "PENDING",
        "periods": load_periods(conn, &leave_id)?,
    }))
}

fn leave_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tenant_id = required_str(params, "tenantId")?;
    let status = optional_str(params, "status").filter(|s| s != "ALL");
    let from = optional_date(params, "from")?;
    let to = optional_date(params, "to")?;

    let mut sql = String::from(
        "SELECT id, teacher_id, start_date, end_date, reason, status
         FROM leaves WHERE tenant_id = ?",
    );
    let mut binds: Vec<String> = vec![tenant_id];
    if let Some(s) = status {
        sql.push_str(" AND status = ?");
        binds.push(s);
    }
    if let Some(f) = from {
        sql.push_str(" AND start_date >= ?");
        binds.push(fmt_date(f));
    }
    if let Some(t) = to {
        sql.push_str(" AND start_date <= ?");
        binds.push(fmt_date(t));
    }
    sql.push_str(" ORDER BY start_date, id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            Ok(LeaveRow {
                id: r.get(0)?,
                teacher_id: r.get(1)?,
                start_date: r.get(2)?,
                end_date: r.get(3)?,
                reason: r.get(4)?,
                status: r.get(5)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(json!({ "leaves": rows.iter().map(leave_json).collect::<Vec<_>>() }))
}

fn leave_list_by_teacher(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tenant_id = required_str(params, "tenantId")?;
    let teacher_id = required_str(params, "teacherId")?;

    let mut stmt = conn.prepare(
        "SELECT id, teacher_id, start_date, end_date, reason, status
         FROM leaves WHERE tenant_id = ? AND teacher_id = ?
         ORDER BY start_date, id",
    )?;
    let rows = stmt
        .query_map((&tenant_id, &teacher_id), |r| {
            Ok(LeaveRow {
                id: r.get(0)?,
                teacher_id: r.get(1)?,
                start_date: r.get(2)?,
                end_date: r.get(3)?,
                reason: r.get(4)?,
                status: r.get(5)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    let mut leaves = Vec::new();
    for row in &rows {
        let mut value = leave_json(row);
        value["periods"] = serde_json::Value::Array(load_periods(conn, &row.id)?);
        leaves.push(value);
    }
    Ok(json!({ "leaves": leaves }))
}

fn leave_reject(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tenant_id = required_str(params, "tenantId")?;
    let leave_id = required_str(params, "leaveId")?;
    let remark = optional_str(params, "remark");

    let Some(row) = load_leave(conn, &tenant_id, &leave_id)? else {
        return Err(HandlerErr::new("not_found", "leave not found"));
    };
    if row.status != "PENDING" {
        return Err(HandlerErr::new(
            "leave_state_invalid",
            "Only pending leaves can be rejected",
        ));
    }
    let reason = match remark {
        Some(r) => format!("{}\n[Rejection Remark] {}", row.reason, r),
        None => row.reason.clone(),
    };
    conn.execute(
        "UPDATE leaves SET status = 'REJECTED', reason = ? WHERE id = ?",
        (&reason, &leave_id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let updated = load_leave(conn, &tenant_id, &leave_id)?
        .ok_or_else(|| HandlerErr::new("not_found", "leave not found"))?;
    Ok(json!({ "leave": leave_json(&updated) }))
}

fn leave_cancel(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tenant_id = required_str(params, "tenantId")?;
    let leave_id = required_str(params, "leaveId")?;

    let Some(row) = load_leave(conn, &tenant_id, &leave_id)? else {
        return Err(HandlerErr::new("not_found", "leave not found"));
    };
    if row.status == "CANCELLED" {
        return Ok(json!({ "leave": leave_json(&row) }));
    }
    if row.status != "PENDING" {
        return Err(HandlerErr::new(
            "leave_state_invalid",
            "Only pending leaves can be cancelled",
        ));
    }
    conn.execute(
        "UPDATE leaves SET status = 'CANCELLED' WHERE id = ?",
        [&leave_id],
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let updated = load_leave(conn, &tenant_id, &leave_id)?
        .ok_or_else(|| HandlerErr::new("not_found", "leave not found"))?;
    Ok(json!({ "leave": leave_json(&updated) }))
}

/// Approves the leave (PENDING -> APPROVED; an APPROVED leave replans
/// idempotently) and runs the substitution planner over its snapshot.
fn leave_approve_and_schedule(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tenant_id = required_str(params, "tenantId")?;
    let leave_id = required_str(params, "leaveId")?;

    let Some(row) = load_leave(conn, &tenant_id, &leave_id)? else {
        return Err(HandlerErr::new("not_found", "leave not found"));
    };
    match row.status.as_str() {
        "PENDING" => {
            conn.execute(
                "UPDATE leaves SET status = 'APPROVED' WHERE id = ?",
                [&leave_id],
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        }
        "APPROVED" => {}
        other => {
            return Err(HandlerErr::new(
                "leave_state_invalid",
                format!("leave is {}; only pending or approved leaves can be scheduled", other),
            ));
        }
    }

    let start_date = chrono::NaiveDate::parse_from_str(&row.start_date, "%Y-%m-%d")
        .map_err(|e| HandlerErr::new("db_query_failed", format!("leave start date: {}", e)))?;
    let leave = LeaveRef {
        id: row.id.clone(),
        teacher_id: row.teacher_id.clone(),
        start_date,
    };
    let outcome = planner::plan_for_approved_leave(conn, &tenant_id, &leave)?;

    Ok(json!({
        "leaveId": row.id,
        "status": "APPROVED",
        "substitutions": serde_json::to_value(&outcome.substitutions)
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?,
        "warnings": outcome.warnings,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !matches!(
        req.method.as_str(),
        "leave.create"
            | "leave.list"
            | "leave.listByTeacher"
            | "leave.reject"
            | "leave.cancel"
            | "leave.approveAndSchedule"
    ) {
        return None;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return Some(resp),
    };
    let result = match req.method.as_str() {
        "leave.create" => leave_create(conn, &req.params),
        "leave.list" => leave_list(conn, &req.params),
        "leave.listByTeacher" => leave_list_by_teacher(conn, &req.params),
        "leave.reject" => leave_reject(conn, &req.params),
        "leave.cancel" => leave_cancel(conn, &req.params),
        _ => leave_approve_and_schedule(conn, &req.params),
    };
    Some(match result {
        Ok(value) => ok(&req.id, value),
        Err(error) => error.response(&req.id),
    })
}
