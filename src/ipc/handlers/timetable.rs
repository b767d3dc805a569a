use crate::ipc::error::ok;
use crate::ipc::helpers::{
    db_conn, fmt_date, optional_str, required_date, required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{self, EntryDraft, SubjectRef};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn entry_json(e: &EntryDraft, absent_teacher_id: Option<&str>, is_substitution: bool) -> serde_json::Value {
    json!({
        "day": e.day,
        "periodKey": e.period_key,
        "subjectId": e.subject_id,
        "teacherId": e.teacher_id,
        "absentTeacherId": absent_teacher_id,
        "isBreak": e.is_break,
        "isSubstitution": is_substitution,
    })
}

struct StoredEntry {
    draft: EntryDraft,
    absent_teacher_id: Option<String>,
    is_substitution: bool,
}

fn load_entries(
    conn: &Connection,
    timetable_id: &str,
) -> Result<Vec<StoredEntry>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT day, period_key, subject_id, teacher_id, absent_teacher_id,
                is_break, is_substitution
         FROM timetable_entries WHERE timetable_id = ?
         ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([timetable_id], |r| {
            Ok(StoredEntry {
                draft: EntryDraft {
                    day: r.get(0)?,
                    period_key: r.get(1)?,
                    subject_id: r.get(2)?,
                    teacher_id: r.get(3)?,
                    is_break: r.get::<_, i64>(5)? != 0,
                },
                absent_teacher_id: r.get(4)?,
                is_substitution: r.get::<_, i64>(6)? != 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

fn find_timetable(
    conn: &Connection,
    tenant_id: &str,
    classroom_id: &str,
    week_start: NaiveDate,
) -> Result<Option<(String, String)>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT id, status FROM timetables
             WHERE tenant_id = ? AND classroom_id = ? AND week_start = ?",
            (tenant_id, classroom_id, &fmt_date(week_start)),
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
        )
        .optional()?)
}

/// Replaces the timetable for (tenant, classroom, week) with the given
/// entries and status, creating the row if needed. One transaction.
fn upsert_timetable(
    conn: &Connection,
    tenant_id: &str,
    classroom_id: &str,
    week_start: NaiveDate,
    status: &str,
    entries: &[EntryDraft],
) -> Result<String, HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM timetables
             WHERE tenant_id = ? AND classroom_id = ? AND week_start = ?",
            (tenant_id, classroom_id, &fmt_date(week_start)),
            |r| r.get(0),
        )
        .optional()?;
    let timetable_id = match existing {
        Some(id) => {
            tx.execute(
                "UPDATE timetables SET status = ? WHERE id = ?",
                (status, &id),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            tx.execute(
                "DELETE FROM timetable_entries WHERE timetable_id = ?",
                [&id],
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO timetables(id, tenant_id, classroom_id, week_start, status)
                 VALUES(?, ?, ?, ?, ?)",
                (&id, tenant_id, classroom_id, &fmt_date(week_start), status),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            id
        }
    };

    for e in entries {
        tx.execute(
            "INSERT INTO timetable_entries(
                timetable_id, day, period_key, subject_id, teacher_id,
                absent_teacher_id, is_break, is_substitution)
             VALUES(?, ?, ?, ?, ?, NULL, ?, 0)",
            (
                &timetable_id,
                &e.day,
                &e.period_key,
                &e.subject_id,
                &e.teacher_id,
                e.effective_break() as i64,
            ),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    Ok(timetable_id)
}

fn parse_entries(params: &serde_json::Value) -> Result<Vec<EntryDraft>, HandlerErr> {
    let raw = params
        .get("entries")
        .cloned()
        .ok_or_else(|| HandlerErr::new("bad_params", "missing entries"))?;
    serde_json::from_value::<Vec<EntryDraft>>(raw)
        .map_err(|e| HandlerErr::new("bad_params", format!("entries: {}", e)))
}

fn timetable_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tenant_id = required_str(params, "tenantId")?;
    let classroom_id = required_str(params, "classroomId")?;
    let week_start = schedule::week_start(required_date(params, "weekStart")?);

    let Some((timetable_id, status)) = find_timetable(conn, &tenant_id, &classroom_id, week_start)?
    else {
        return Ok(json!({
            "weekStart": fmt_date(week_start),
            "status": serde_json::Value::Null,
            "entries": [],
        }));
    };
    let entries = load_entries(conn, &timetable_id)?;
    Ok(json!({
        "weekStart": fmt_date(week_start),
        "status": status,
        "entries": entries
            .iter()
            .map(|s| entry_json(&s.draft, s.absent_teacher_id.as_deref(), s.is_substitution))
            .collect::<Vec<_>>(),
    }))
}

fn timetable_generate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tenant_id = required_str(params, "tenantId")?;
    let classroom_id = required_str(params, "classroomId")?;
    let week_start = schedule::week_start(required_date(params, "weekStart")?);

    let classroom: Option<String> = conn
        .query_row(
            "SELECT id FROM classrooms WHERE tenant_id = ? AND id = ?",
            (&tenant_id, &classroom_id),
            |r| r.get(0),
        )
        .optional()?;
    if classroom.is_none() {
        return Err(HandlerErr::new("not_found", "classroom not found"));
    }

    let mut stmt = conn.prepare(
        "SELECT id, teacher_id FROM subjects
         WHERE tenant_id = ? AND classroom_id = ? ORDER BY sort_order",
    )?;
    let subjects = stmt
        .query_map((&tenant_id, &classroom_id), |r| {
            Ok(SubjectRef {
                id: r.get(0)?,
                teacher_id: r.get(1)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    if subjects.is_empty() {
        return Err(HandlerErr::new(
            "validation_failed",
            "No subjects defined for this class",
        ));
    }

    let entries = schedule::round_robin_entries(&subjects);
    upsert_timetable(conn, &tenant_id, &classroom_id, week_start, "draft", &entries)?;

    Ok(json!({
        "weekStart": fmt_date(week_start),
        "status": "draft",
        "entries": entries
            .iter()
            .map(|e| entry_json(e, None, false))
            .collect::<Vec<_>>(),
    }))
}

fn timetable_validate(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let entries = parse_entries(params)?;
    let conflicts = schedule::validate_entries(&entries);
    Ok(json!({ "conflicts": conflicts }))
}

fn timetable_publish(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tenant_id = required_str(params, "tenantId")?;
    let classroom_id = required_str(params, "classroomId")?;
    let week_start = schedule::week_start(required_date(params, "weekStart")?);
    let entries = parse_entries(params)?;

    let conflicts = schedule::validate_entries(&entries);
    if !conflicts.is_empty() {
        return Err(HandlerErr::with_details(
            "validation_failed",
            "entries have conflicts",
            json!({ "conflicts": conflicts }),
        ));
    }

    upsert_timetable(
        conn,
        &tenant_id,
        &classroom_id,
        week_start,
        "published",
        &entries,
    )?;
    Ok(json!({
        "weekStart": fmt_date(week_start),
        "status": "published",
        "entryCount": entries.len(),
    }))
}

fn slot_datetimes(
    week_start: NaiveDate,
    day: &str,
    period_key: &str,
) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let offset = schedule::day_index(day)?;
    let (start, end) = schedule::period_times(period_key)?;
    let date = week_start + chrono::Duration::days(offset);
    let parse = |s: &str| NaiveTime::parse_from_str(s, "%H:%M").ok();
    Some((date.and_time(parse(start)?), date.and_time(parse(end)?)))
}

/// A teacher's slots for one weekday of the current week, with clock times
/// and a live status derived from leaves and covering substitutions.
fn timetable_teacher_day(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tenant_id = required_str(params, "tenantId")?;
    let teacher_id = required_str(params, "teacherId")?;

    let today = Utc::now().date_naive();
    let week_start = schedule::week_start(today);
    let target_date = match optional_str(params, "day") {
        Some(label) => {
            let Some(offset) = schedule::day_index(&label) else {
                return Err(HandlerErr::new("bad_params", "Invalid day (use Mon/Tue/...)"));
            };
            week_start + chrono::Duration::days(offset)
        }
        None => today,
    };
    let day_label = schedule::weekday_abbrev(target_date);
    let date_s = fmt_date(target_date);

    let has_leave: bool = conn
        .query_row(
            "SELECT 1 FROM leaves
             WHERE tenant_id = ? AND teacher_id = ? AND status = 'APPROVED'
               AND start_date <= ? AND end_date >= ?
             LIMIT 1",
            (&tenant_id, &teacher_id, &date_s, &date_s),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();

    // Covering substitutions for the day, keyed by classroom+period.
    let mut stmt = conn.prepare(
        "SELECT s.classroom_id, s.period_key, s.substitute_teacher_id, t.name
         FROM substitutions s
         LEFT JOIN teachers t ON t.id = s.substitute_teacher_id
         WHERE s.tenant_id = ? AND s.date = ? AND s.absent_teacher_id = ?",
    )?;
    let covering: Vec<(String, String, Option<String>, Option<String>)> = stmt
        .query_map((&tenant_id, &date_s, &teacher_id), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    let mut stmt = conn.prepare(
        "SELECT c.name, c.section, t.classroom_id, e.period_key, e.subject_id, sub.name
         FROM timetable_entries e
         JOIN timetables t ON t.id = e.timetable_id
         JOIN classrooms c ON c.id = t.classroom_id
         LEFT JOIN subjects sub ON sub.id = e.subject_id
         WHERE t.tenant_id = ? AND t.week_start = ?
           AND e.day = ? AND e.is_break = 0
           AND (e.teacher_id = ? OR e.absent_teacher_id = ?)
         ORDER BY e.period_key",
    )?;
    let slots: Vec<(String, String, String, String, Option<String>, Option<String>)> = stmt
        .query_map(
            (
                &tenant_id,
                &fmt_date(week_start),
                day_label,
                &teacher_id,
                &teacher_id,
            ),
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    let now = Utc::now().naive_utc();
    let mut items = Vec::new();
    for (class_name, section, classroom_id, period_key, subject_id, subject_name) in slots {
        let times = slot_datetimes(week_start, day_label, &period_key);
        let (start, end) = match times {
            Some((s, e)) => (Some(s), Some(e)),
            None => (None, None),
        };
        let duration_min = match (start, end) {
            (Some(s), Some(e)) => Some((e - s).num_minutes().max(0)),
            _ => None,
        };

        let substitution = covering
            .iter()
            .find(|(c, p, _, _)| *c == classroom_id && *p == period_key);

        // An uncovered (supervision) row reads as a cancelled period.
        let covered = substitution.is_some_and(|(_, _, sub_id, _)| sub_id.is_some());
        let status = if has_leave {
            if covered {
                "Substitutes"
            } else {
                "Cancelled"
            }
        } else {
            match (start, end) {
                (Some(s), _) if now < s => "Upcoming",
                (Some(s), Some(e)) if now >= s && now <= e => "Live",
                (Some(_), Some(_)) => "Completed",
                _ => "Upcoming",
            }
        };

        items.push(json!({
            "classroom": format!("{}-{}", class_name, section),
            "day": day_label,
            "periodKey": period_key,
            "subjectId": subject_id,
            "subjectName": subject_name,
            "start": start.map(|s| s.format("%Y-%m-%dT%H:%M:%S").to_string()),
            "end": end.map(|e| e.format("%Y-%m-%dT%H:%M:%S").to_string()),
            "durationMin": duration_min,
            "status": status,
            "substitute": substitution.and_then(|(_, _, sub_id, sub_name)| {
                sub_id.as_ref().map(|id| json!({ "id": id, "name": sub_name }))
            }),
        }));
    }

    Ok(json!({ "day": day_label, "date": date_s, "items": items }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if req.method.as_str() == "timetable.validate" {
        // Pure check over the supplied entries; needs no workspace.
        return Some(match timetable_validate(&req.params) {
            Ok(value) => ok(&req.id, value),
            Err(error) => error.response(&req.id),
        });
    }
    if !matches!(
        req.method.as_str(),
        "timetable.get" | "timetable.generate" | "timetable.publish" | "timetable.teacherDay"
    ) {
        return None;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return Some(resp),
    };
    let result = match req.method.as_str() {
        "timetable.get" => timetable_get(conn, &req.params),
        "timetable.generate" => timetable_generate(conn, &req.params),
        "timetable.publish" => timetable_publish(conn, &req.params),
        _ => timetable_teacher_day(conn, &req.params),
    };
    Some(match result {
        Ok(value) => ok(&req.id, value),
        Err(error) => error.response(&req.id),
    })
}
