use crate::schedule::{
    self, CandidateFacts, ANY_POOL_BASE, SUBJECT_POOL_BASE,
};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct PlanError {
    pub code: String,
    pub message: String,
}

impl PlanError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

fn qerr(e: rusqlite::Error) -> PlanError {
    PlanError::new("db_query_failed", e.to_string())
}

fn uerr(e: rusqlite::Error) -> PlanError {
    PlanError::new("db_update_failed", e.to_string())
}

/// One (date, classroom, period) teaching unit, built once at the leave
/// boundary and handed unchanged through filter, scorer, and commit.
#[derive(Debug, Clone)]
pub struct Slot {
    pub date: NaiveDate,
    pub day: String,
    pub period_key: String,
    pub classroom_id: String,
    pub subject_id: Option<String>,
}

/// How a slot ends up covered. Supervision is the uncovered terminal
/// outcome and carries no teacher.
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Subject { teacher_id: String },
    AltSubject { teacher_id: String },
    Supervision,
}

impl Assignment {
    pub fn mode(&self) -> &'static str {
        match self {
            Assignment::Subject { .. } => "SUBJECT",
            Assignment::AltSubject { .. } => "ALT_SUBJECT",
            Assignment::Supervision => "SUPERVISION",
        }
    }

    pub fn teacher_id(&self) -> Option<&str> {
        match self {
            Assignment::Subject { teacher_id } | Assignment::AltSubject { teacher_id } => {
                Some(teacher_id)
            }
            Assignment::Supervision => None,
        }
    }
}

pub const SUPERVISION_NOTE: &str = "No teacher available; mark as self-study/supervision.";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubstitutionRow {
    pub id: String,
    pub date: String,
    pub classroom_id: String,
    pub period_key: String,
    pub subject_id: Option<String>,
    pub absent_teacher_id: String,
    pub substitute_teacher_id: Option<String>,
    pub mode: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOutcome {
    pub substitutions: Vec<SubstitutionRow>,
    pub warnings: Vec<String>,
}

/// Leave fields the planner consumes. The caller owns the status transition.
#[derive(Debug, Clone)]
pub struct LeaveRef {
    pub id: String,
    pub teacher_id: String,
    pub start_date: NaiveDate,
}

/// Runs the full assignment pipeline for one approved leave: snapshot slots
/// in stored order, fairness counters for the leave week, per-slot
/// filter/score/commit with in-run counter updates, then a post-patch
/// overlap re-check of every touched timetable.
pub fn plan_for_approved_leave(
    conn: &Connection,
    tenant_id: &str,
    leave: &LeaveRef,
) -> Result<PlanOutcome, PlanError> {
    let slots = load_leave_slots(conn, &leave.id)?;
    let mut weekly_counts = weekly_sub_counts(conn, tenant_id, leave.start_date)?;

    let mut substitutions = Vec::new();
    let mut warnings = Vec::new();
    let mut touched: Vec<(String, NaiveDate)> = Vec::new();

    for slot in &slots {
        let assignment = pick_best_sub(conn, tenant_id, slot, &leave.teacher_id, &weekly_counts)?;
        let (row, warning) = commit_slot(conn, tenant_id, slot, &leave.teacher_id, &assignment)?;
        substitutions.push(row);
        if let Some(w) = warning {
            warnings.push(w);
        }
        if let Some(winner) = assignment.teacher_id() {
            *weekly_counts.entry(winner.to_string()).or_insert(0) += 1;
        }
        let week = schedule::week_start(slot.date);
        if !touched.iter().any(|(c, w)| *c == slot.classroom_id && *w == week) {
            touched.push((slot.classroom_id.clone(), week));
        }
    }

    for (classroom_id, week) in touched {
        warnings.extend(revalidate_timetable(conn, tenant_id, &classroom_id, week)?);
    }

    Ok(PlanOutcome {
        substitutions,
        warnings,
    })
}

fn load_leave_slots(conn: &Connection, leave_id: &str) -> Result<Vec<Slot>, PlanError> {
    let mut stmt = conn
        .prepare(
            "SELECT date, day, period_key, subject_id, classroom_id
             FROM leave_periods
             WHERE leave_id = ?
             ORDER BY seq",
        )
        .map_err(qerr)?;
    let rows = stmt
        .query_map([leave_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, String>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(qerr)?;

    let mut slots = Vec::with_capacity(rows.len());
    for (date, day, period_key, subject_id, classroom_id) in rows {
        let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .map_err(|e| PlanError::new("bad_date", format!("leave period date: {}", e)))?;
        slots.push(Slot {
            date,
            day,
            period_key,
            classroom_id,
            subject_id,
        });
    }
    Ok(slots)
}

/// Substitutions already assigned per teacher within the ISO week containing
/// `anchor`, used as the starting fairness counters for a planning run.
pub fn weekly_sub_counts(
    conn: &Connection,
    tenant_id: &str,
    anchor: NaiveDate,
) -> Result<HashMap<String, i64>, PlanError> {
    let start = schedule::week_start(anchor).format("%Y-%m-%d").to_string();
    let end = schedule::week_end(anchor).format("%Y-%m-%d").to_string();
    let mut stmt = conn
        .prepare(
            "SELECT substitute_teacher_id, COUNT(*)
             FROM substitutions
             WHERE tenant_id = ? AND date >= ? AND date <= ?
               AND substitute_teacher_id IS NOT NULL
             GROUP BY substitute_teacher_id",
        )
        .map_err(qerr)?;
    let rows = stmt
        .query_map((tenant_id, &start, &end), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(qerr)?;
    Ok(rows.into_iter().collect())
}

/// Tries the subject-match pool, then every role=TEACHER fallback, then
/// gives up with Supervision. Candidate lists keep a stable id order so
/// score ties resolve to the first-seen teacher.
fn pick_best_sub(
    conn: &Connection,
    tenant_id: &str,
    slot: &Slot,
    absent_teacher_id: &str,
    weekly_counts: &HashMap<String, i64>,
) -> Result<Assignment, PlanError> {
    let mut subject_pool = Vec::new();
    if let Some(subject_id) = &slot.subject_id {
        let regular: Option<Option<String>> = conn
            .query_row(
                "SELECT teacher_id FROM subjects WHERE tenant_id = ? AND id = ?",
                (tenant_id, subject_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(qerr)?;
        if let Some(Some(teacher_id)) = regular {
            if teacher_id != absent_teacher_id {
                subject_pool.push(teacher_id);
            }
        }
    }

    let free = filter_free_teachers(conn, tenant_id, slot, absent_teacher_id, subject_pool)?;
    if let Some(teacher_id) =
        best_scoring(conn, tenant_id, slot, &free, weekly_counts, SUBJECT_POOL_BASE)?
    {
        return Ok(Assignment::Subject { teacher_id });
    }

    let mut stmt = conn
        .prepare("SELECT id FROM teachers WHERE tenant_id = ? AND role = 'TEACHER' ORDER BY id")
        .map_err(qerr)?;
    let all_ids = stmt
        .query_map([tenant_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(qerr)?;

    let free_any = filter_free_teachers(conn, tenant_id, slot, absent_teacher_id, all_ids)?;
    if let Some(teacher_id) =
        best_scoring(conn, tenant_id, slot, &free_any, weekly_counts, ANY_POOL_BASE)?
    {
        return Ok(Assignment::AltSubject { teacher_id });
    }

    Ok(Assignment::Supervision)
}

fn best_scoring(
    conn: &Connection,
    tenant_id: &str,
    slot: &Slot,
    candidates: &[String],
    weekly_counts: &HashMap<String, i64>,
    base: f64,
) -> Result<Option<String>, PlanError> {
    let mut best: Option<(String, f64)> = None;
    for teacher_id in candidates {
        let facts = gather_facts(conn, tenant_id, slot, teacher_id, weekly_counts)?;
        let Some(score) = schedule::candidate_score(base, &facts) else {
            continue;
        };
        let better = match &best {
            Some((_, top)) => score > *top,
            None => true,
        };
        if better {
            best = Some((teacher_id.clone(), score));
        }
    }
    Ok(best.map(|(id, _)| id))
}

/// Removes every candidate who is busy at the slot's (day, periodKey):
/// teaching in the week's published timetable for any classroom, already
/// covering another substitution that date+period, or on approved leave
/// covering the date. The absent teacher never survives the filter.
/// Substitution-patched entries are skipped in the base-timetable check
/// (the substitutions table tracks those) so re-planning a leave reaches
/// the same picks.
pub fn filter_free_teachers(
    conn: &Connection,
    tenant_id: &str,
    slot: &Slot,
    absent_teacher_id: &str,
    candidates: Vec<String>,
) -> Result<Vec<String>, PlanError> {
    let mut pool: Vec<String> = Vec::new();
    for id in candidates {
        if id != absent_teacher_id && !pool.contains(&id) {
            pool.push(id);
        }
    }
    if pool.is_empty() {
        return Ok(pool);
    }

    let date_s = slot.date.format("%Y-%m-%d").to_string();
    let week_s = schedule::week_start(slot.date).format("%Y-%m-%d").to_string();
    let mut busy: HashSet<String> = HashSet::new();

    let mut stmt = conn
        .prepare(
            "SELECT e.teacher_id
             FROM timetable_entries e
             JOIN timetables t ON t.id = e.timetable_id
             WHERE t.tenant_id = ? AND t.status = 'published' AND t.week_start = ?
               AND e.day = ? AND e.period_key = ? AND e.teacher_id IS NOT NULL
               AND e.is_substitution = 0",
        )
        .map_err(qerr)?;
    let teaching = stmt
        .query_map(
            (tenant_id, &week_s, &slot.day, &slot.period_key),
            |r| r.get::<_, String>(0),
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(qerr)?;
    busy.extend(teaching);

    // A teacher's own row for this exact slot key does not make them busy,
    // so re-planning the same leave can keep its previous pick.
    let mut stmt = conn
        .prepare(
            "SELECT substitute_teacher_id
             FROM substitutions
             WHERE tenant_id = ? AND date = ? AND period_key = ?
               AND classroom_id != ?
               AND substitute_teacher_id IS NOT NULL",
        )
        .map_err(qerr)?;
    let substituting = stmt
        .query_map(
            (tenant_id, &date_s, &slot.period_key, &slot.classroom_id),
            |r| r.get::<_, String>(0),
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(qerr)?;
    busy.extend(substituting);

    let mut stmt = conn
        .prepare(
            "SELECT teacher_id
             FROM leaves
             WHERE tenant_id = ? AND status = 'APPROVED'
               AND start_date <= ? AND end_date >= ?",
        )
        .map_err(qerr)?;
    let on_leave = stmt
        .query_map((tenant_id, &date_s, &date_s), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(qerr)?;
    busy.extend(on_leave);

    pool.retain(|id| !busy.contains(id));
    Ok(pool)
}

/// Familiarity and adjacency look at regular teaching rows only; entries a
/// planner run already patched are covered by the substitutions table.
fn gather_facts(
    conn: &Connection,
    tenant_id: &str,
    slot: &Slot,
    teacher_id: &str,
    weekly_counts: &HashMap<String, i64>,
) -> Result<CandidateFacts, PlanError> {
    let date_s = slot.date.format("%Y-%m-%d").to_string();
    let week_s = schedule::week_start(slot.date).format("%Y-%m-%d").to_string();

    let subs_today: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM substitutions
             WHERE tenant_id = ? AND substitute_teacher_id = ? AND date = ?",
            (tenant_id, teacher_id, &date_s),
            |r| r.get(0),
        )
        .map_err(qerr)?;

    let caps: Option<(i64, i64)> = conn
        .query_row(
            "SELECT max_per_day, max_per_week FROM teachers WHERE tenant_id = ? AND id = ?",
            (tenant_id, teacher_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(qerr)?;
    let (max_per_day, max_per_week) = caps.unwrap_or((6, 30));

    let taught_this_classroom: bool = conn
        .query_row(
            "SELECT 1 FROM timetable_entries e
             JOIN timetables t ON t.id = e.timetable_id
             WHERE t.tenant_id = ? AND t.classroom_id = ? AND e.teacher_id = ?
               AND e.is_substitution = 0
             LIMIT 1",
            (tenant_id, &slot.classroom_id, teacher_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(qerr)?
        .is_some();

    let mut adjacent_count = 0i64;
    for neighbor in schedule::neighbor_periods(&slot.period_key) {
        let hit: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM timetable_entries e
                 JOIN timetables t ON t.id = e.timetable_id
                 WHERE t.tenant_id = ? AND t.classroom_id = ? AND t.week_start = ?
                   AND t.status = 'published'
                   AND e.day = ? AND e.period_key = ? AND e.teacher_id = ?
                   AND e.is_substitution = 0
                 LIMIT 1",
                (
                    tenant_id,
                    &slot.classroom_id,
                    &week_s,
                    &slot.day,
                    neighbor,
                    teacher_id,
                ),
                |r| r.get(0),
            )
            .optional()
            .map_err(qerr)?;
        if hit.is_some() {
            adjacent_count += 1;
        }
    }

    Ok(CandidateFacts {
        taught_this_classroom,
        adjacent_count,
        subs_this_week: weekly_counts.get(teacher_id).copied().unwrap_or(0),
        subs_today,
        max_per_day,
        max_per_week,
    })
}

/// Per-slot unit of work: substitution upsert plus timetable entry patch in
/// one transaction. A missing or ambiguous entry match is reported as a
/// warning, not a failure; the substitution row stands either way.
fn commit_slot(
    conn: &Connection,
    tenant_id: &str,
    slot: &Slot,
    absent_teacher_id: &str,
    assignment: &Assignment,
) -> Result<(SubstitutionRow, Option<String>), PlanError> {
    let date_s = slot.date.format("%Y-%m-%d").to_string();
    let week_s = schedule::week_start(slot.date).format("%Y-%m-%d").to_string();
    let note = match assignment {
        Assignment::Supervision => Some(SUPERVISION_NOTE.to_string()),
        _ => None,
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| PlanError::new("db_tx_failed", e.to_string()))?;

    tx.execute(
        "INSERT INTO substitutions(
            id, tenant_id, date, classroom_id, period_key,
            subject_id, absent_teacher_id, substitute_teacher_id, mode, note)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(tenant_id, date, classroom_id, period_key) DO UPDATE SET
           subject_id = excluded.subject_id,
           absent_teacher_id = excluded.absent_teacher_id,
           substitute_teacher_id = excluded.substitute_teacher_id,
           mode = excluded.mode,
           note = excluded.note",
        (
            Uuid::new_v4().to_string(),
            tenant_id,
            &date_s,
            &slot.classroom_id,
            &slot.period_key,
            &slot.subject_id,
            absent_teacher_id,
            assignment.teacher_id(),
            assignment.mode(),
            &note,
        ),
    )
    .map_err(uerr)?;

    // Re-read so a re-run returns the row id of the original insert.
    let id: String = tx
        .query_row(
            "SELECT id FROM substitutions
             WHERE tenant_id = ? AND date = ? AND classroom_id = ? AND period_key = ?",
            (tenant_id, &date_s, &slot.classroom_id, &slot.period_key),
            |r| r.get(0),
        )
        .map_err(qerr)?;

    let patched = tx
        .execute(
            "UPDATE timetable_entries
             SET absent_teacher_id = ?, teacher_id = ?, is_substitution = 1
             WHERE day = ? AND period_key = ?
               AND timetable_id IN (
                 SELECT id FROM timetables
                 WHERE tenant_id = ? AND classroom_id = ? AND week_start = ?
                   AND status IN ('draft', 'published'))",
            (
                absent_teacher_id,
                assignment.teacher_id(),
                &slot.day,
                &slot.period_key,
                tenant_id,
                &slot.classroom_id,
                &week_s,
            ),
        )
        .map_err(uerr)?;

    tx.commit()
        .map_err(|e| PlanError::new("db_tx_failed", e.to_string()))?;

    let warning = match patched {
        1 => None,
        0 => Some(format!(
            "timetable entry not patched for {} {} {} in classroom {}",
            date_s, slot.day, slot.period_key, slot.classroom_id
        )),
        n => Some(format!(
            "timetable patch matched {} entries for {} {} {} in classroom {}",
            n, date_s, slot.day, slot.period_key, slot.classroom_id
        )),
    };

    Ok((
        SubstitutionRow {
            id,
            date: date_s,
            classroom_id: slot.classroom_id.clone(),
            period_key: slot.period_key.clone(),
            subject_id: slot.subject_id.clone(),
            absent_teacher_id: absent_teacher_id.to_string(),
            substitute_teacher_id: assignment.teacher_id().map(|s| s.to_string()),
            mode: assignment.mode().to_string(),
            note,
        },
        warning,
    ))
}

/// Re-checks a patched timetable for teacher double-bookings the patches may
/// have introduced. Missing-field findings are skipped: an uncovered
/// supervision slot deliberately has no teacher.
fn revalidate_timetable(
    conn: &Connection,
    tenant_id: &str,
    classroom_id: &str,
    week: NaiveDate,
) -> Result<Vec<String>, PlanError> {
    let week_s = week.format("%Y-%m-%d").to_string();
    let mut stmt = conn
        .prepare(
            "SELECT e.day, e.period_key, e.subject_id, e.teacher_id, e.is_break
             FROM timetable_entries e
             JOIN timetables t ON t.id = e.timetable_id
             WHERE t.tenant_id = ? AND t.classroom_id = ? AND t.week_start = ?",
        )
        .map_err(qerr)?;
    let entries = stmt
        .query_map((tenant_id, classroom_id, &week_s), |r| {
            Ok(schedule::EntryDraft {
                day: r.get(0)?,
                period_key: r.get(1)?,
                subject_id: r.get(2)?,
                teacher_id: r.get(3)?,
                is_break: r.get::<_, i64>(4)? != 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(qerr)?;

    Ok(schedule::validate_entries(&entries)
        .into_iter()
        .filter(|c| c.starts_with("Teacher overlap"))
        .map(|c| format!("post-substitution check, classroom {}: {}", classroom_id, c))
        .collect())
}
