use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

/// Canonical period ordering within a day. Adjacency lookups walk this list.
pub const PERIOD_ORDER: [&str; 9] = [
    "P1", "P2", "P3", "BREAK", "P4", "P5", "P6", "P7", "P8",
];

/// Days a generated draft covers, in timetable order.
pub const WORKING_DAYS: [&str; 6] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Per-day template used by draft generation. BREAK is inserted verbatim.
pub const DAY_TEMPLATE: [&str; 7] = ["P1", "P2", "P3", "BREAK", "P4", "P5", "P6"];

pub const BREAK_KEYS: [&str; 3] = ["BREAK", "LUNCH", "RECESS"];

pub fn is_break_key(period_key: &str) -> bool {
    let upper = period_key.to_ascii_uppercase();
    BREAK_KEYS.iter().any(|k| *k == upper)
}

/// Clock times for teaching periods ("HH:MM" 24h). Breaks have no slot.
pub fn period_times(period_key: &str) -> Option<(&'static str, &'static str)> {
    match period_key {
        "P1" => Some(("09:00", "09:45")),
        "P2" => Some(("09:45", "10:30")),
        "P3" => Some(("10:30", "11:30")),
        "P4" => Some(("11:30", "12:15")),
        "P5" => Some(("12:45", "13:30")),
        "P6" => Some(("14:30", "15:15")),
        "P7" => Some(("15:15", "16:00")),
        _ => None,
    }
}

/// Monday 00:00 of the ISO week containing `date`. Every component that needs
/// to agree on which weekly timetable a date belongs to goes through here.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

pub fn week_end(date: NaiveDate) -> NaiveDate {
    week_start(date) + Duration::days(6)
}

/// Three-letter day code matching TimetableEntry.day values.
pub fn weekday_abbrev(date: NaiveDate) -> &'static str {
    match date.weekday() {
        Weekday::Mon => "Mon",
        Weekday::Tue => "Tue",
        Weekday::Wed => "Wed",
        Weekday::Thu => "Thu",
        Weekday::Fri => "Fri",
        Weekday::Sat => "Sat",
        Weekday::Sun => "Sun",
    }
}

pub fn day_index(day: &str) -> Option<i64> {
    let key: String = day.chars().take(3).collect();
    let idx = match key.as_str() {
        "Mon" => 0,
        "Tue" => 1,
        "Wed" => 2,
        "Thu" => 3,
        "Fri" => 4,
        "Sat" => 5,
        "Sun" => 6,
        _ => return None,
    };
    Some(idx)
}

/// The immediately preceding/following non-break period keys, if any.
pub fn neighbor_periods(period_key: &str) -> Vec<&'static str> {
    let Some(idx) = PERIOD_ORDER.iter().position(|p| *p == period_key) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    if idx > 0 && !is_break_key(PERIOD_ORDER[idx - 1]) {
        out.push(PERIOD_ORDER[idx - 1]);
    }
    if idx + 1 < PERIOD_ORDER.len() && !is_break_key(PERIOD_ORDER[idx + 1]) {
        out.push(PERIOD_ORDER[idx + 1]);
    }
    out
}

/// Facts about one candidate, gathered by the planner from the store.
#[derive(Debug, Clone, Copy)]
pub struct CandidateFacts {
    pub taught_this_classroom: bool,
    /// Entries the candidate teaches in the neighboring periods of the same
    /// classroom/day (0..=2).
    pub adjacent_count: i64,
    pub subs_this_week: i64,
    pub subs_today: i64,
    pub max_per_day: i64,
    pub max_per_week: i64,
}

/// Fairness/suitability score. Returns None when taking the slot would push
/// the candidate past a daily or weekly cap.
pub fn candidate_score(base: f64, facts: &CandidateFacts) -> Option<f64> {
    if facts.subs_today >= facts.max_per_day {
        return None;
    }
    if facts.subs_this_week >= facts.max_per_week {
        return None;
    }
    let mut s = base;
    if facts.taught_this_classroom {
        s += 10.0;
    }
    s += 4.0 * facts.adjacent_count as f64;
    s += -0.5 * facts.subs_this_week as f64;
    s += -1.0 * facts.subs_today as f64;
    Some(s)
}

pub const SUBJECT_POOL_BASE: f64 = 50.0;
pub const ANY_POOL_BASE: f64 = 5.0;

/// One proposed timetable entry as seen by the validator and publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryDraft {
    pub day: String,
    #[serde(default)]
    pub period_key: String,
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub teacher_id: Option<String>,
    #[serde(default)]
    pub is_break: bool,
}

impl EntryDraft {
    pub fn effective_break(&self) -> bool {
        self.is_break || is_break_key(&self.period_key)
    }
}

/// Flags missing fields on non-break entries and same-slot teacher overlaps.
/// Returns human-readable conflict strings; empty means valid.
pub fn validate_entries(entries: &[EntryDraft]) -> Vec<String> {
    let mut conflicts = Vec::new();
    let mut slot_teachers: Vec<(String, Vec<String>)> = Vec::new();

    for e in entries {
        if e.effective_break() {
            continue;
        }
        if e.period_key.is_empty() {
            conflicts.push(format!("Missing periodKey on {}", e.day));
        }
        if e.subject_id.is_none() {
            conflicts.push(format!("Missing subject on {} {}", e.day, e.period_key));
        }
        if e.teacher_id.is_none() {
            conflicts.push(format!("Missing teacher on {} {}", e.day, e.period_key));
        }
        if let Some(teacher) = &e.teacher_id {
            let key = format!("{}_{}", e.day, e.period_key);
            match slot_teachers.iter_mut().find(|(k, _)| *k == key) {
                Some((_, seen)) => {
                    if seen.iter().any(|t| t == teacher) {
                        conflicts.push(format!("Teacher overlap at {}", key));
                    } else {
                        seen.push(teacher.clone());
                    }
                }
                None => slot_teachers.push((key, vec![teacher.clone()])),
            }
        }
    }
    conflicts
}

/// Subject reference as draft generation needs it.
#[derive(Debug, Clone)]
pub struct SubjectRef {
    pub id: String,
    pub teacher_id: Option<String>,
}

/// Seed draft: WORKING_DAYS x DAY_TEMPLATE, breaks verbatim, teaching periods
/// round-robin over the classroom's subjects. Not a solver; the caller
/// refines and validates before publishing.
pub fn round_robin_entries(subjects: &[SubjectRef]) -> Vec<EntryDraft> {
    let mut entries = Vec::new();
    let mut idx = 0usize;
    for day in WORKING_DAYS {
        for period in DAY_TEMPLATE {
            if is_break_key(period) {
                entries.push(EntryDraft {
                    day: day.to_string(),
                    period_key: period.to_string(),
                    subject_id: None,
                    teacher_id: None,
                    is_break: true,
                });
                continue;
            }
            let subj = &subjects[idx % subjects.len()];
            entries.push(EntryDraft {
                day: day.to_string(),
                period_key: period.to_string(),
                subject_id: Some(subj.id.clone()),
                teacher_id: subj.teacher_id.clone(),
                is_break: false,
            });
            idx += 1;
        }
    }
    entries
}
