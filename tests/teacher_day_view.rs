use chrono::{Datelike, Duration, Utc};
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    fn start(workspace: &PathBuf) -> Self {
        let exe = env!("CARGO_BIN_EXE_timetabled");
        let mut child = Command::new(exe)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn timetabled");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        let mut sidecar = Sidecar {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 1,
        };
        let resp = sidecar.request(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        assert_eq!(resp["ok"].as_bool(), Some(true), "workspace.select failed");
        sidecar
    }

    fn request(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = format!("t{}", self.next_id);
        self.next_id += 1;
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response");
        let value: serde_json::Value =
            serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value["id"].as_str(), Some(id.as_str()));
        value
    }

    fn request_ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let resp = self.request(method, params);
        assert_eq!(
            resp["ok"].as_bool(),
            Some(true),
            "{} failed: {}",
            method,
            resp["error"]
        );
        resp["result"].clone()
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

const TENANT: &str = "school-1";

/// The view always works on the current week, so fixtures are anchored to it.
fn this_monday() -> String {
    let today = Utc::now().date_naive();
    let monday = today - Duration::days(today.weekday().num_days_from_monday() as i64);
    monday.format("%Y-%m-%d").to_string()
}

fn setup_monday_slot(s: &mut Sidecar, subject_teacher: &str, slot_teacher: &str) -> String {
    let classroom = s.request_ok(
        "classrooms.create",
        json!({ "tenantId": TENANT, "name": "Grade 6" }),
    )["id"]
        .as_str()
        .expect("classroom id")
        .to_string();
    let subject = s.request_ok(
        "subjects.create",
        json!({
            "tenantId": TENANT,
            "classroomId": classroom,
            "name": "Mathematics",
            "code": "MATH",
            "teacherId": subject_teacher,
        }),
    )["id"]
        .as_str()
        .expect("subject id")
        .to_string();
    s.request_ok(
        "timetable.publish",
        json!({
            "tenantId": TENANT,
            "classroomId": classroom,
            "weekStart": this_monday(),
            "entries": [
                { "day": "Mon", "periodKey": "P1", "subjectId": subject, "teacherId": slot_teacher },
            ],
        }),
    );
    classroom
}

#[test]
fn day_view_lists_slots_with_clock_times() {
    let workspace = temp_dir("timetabled-day-view");
    let mut s = Sidecar::start(&workspace);

    let t1 = s.request_ok(
        "teachers.create",
        json!({ "tenantId": TENANT, "name": "Asha" }),
    )["id"]
        .as_str()
        .expect("teacher id")
        .to_string();
    setup_monday_slot(&mut s, &t1, &t1);

    let view = s.request_ok(
        "timetable.teacherDay",
        json!({ "tenantId": TENANT, "teacherId": t1, "day": "Mon" }),
    );
    assert_eq!(view["day"].as_str(), Some("Mon"));
    assert_eq!(view["date"].as_str(), Some(this_monday().as_str()));
    let items = view["items"].as_array().expect("items");
    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item["periodKey"].as_str(), Some("P1"));
    assert_eq!(item["classroom"].as_str(), Some("Grade 6-A"));
    assert_eq!(item["subjectName"].as_str(), Some("Mathematics"));
    assert_eq!(item["durationMin"].as_i64(), Some(45));
    assert!(item["start"].as_str().expect("start").ends_with("T09:00:00"));
    assert!(item["end"].as_str().expect("end").ends_with("T09:45:00"));
    assert!(matches!(
        item["status"].as_str(),
        Some("Upcoming") | Some("Live") | Some("Completed")
    ));
    assert!(item["substitute"].is_null());

    let bad_day = s.request(
        "timetable.teacherDay",
        json!({ "tenantId": TENANT, "teacherId": t1, "day": "Monday" }),
    );
    assert_eq!(bad_day["ok"].as_bool(), Some(false));
    assert_eq!(bad_day["error"]["code"].as_str(), Some("bad_params"));
}

#[test]
fn covered_absence_shows_substitutes_and_the_cover_teacher_sees_the_slot() {
    let workspace = temp_dir("timetabled-day-covered");
    let mut s = Sidecar::start(&workspace);

    let t1 = s.request_ok(
        "teachers.create",
        json!({ "tenantId": TENANT, "name": "Asha" }),
    )["id"]
        .as_str()
        .expect("teacher id")
        .to_string();
    let t2 = s.request_ok(
        "teachers.create",
        json!({ "tenantId": TENANT, "name": "Bela" }),
    )["id"]
        .as_str()
        .expect("teacher id")
        .to_string();
    setup_monday_slot(&mut s, &t2, &t1);

    let monday = this_monday();
    let leave = s.request_ok(
        "leave.create",
        json!({ "tenantId": TENANT, "teacherId": t1, "startDate": monday, "endDate": monday }),
    );
    let leave_id = leave["leaveId"].as_str().expect("leave id").to_string();
    s.request_ok(
        "leave.approveAndSchedule",
        json!({ "tenantId": TENANT, "leaveId": leave_id }),
    );

    // The absent teacher sees the period handed over.
    let view = s.request_ok(
        "timetable.teacherDay",
        json!({ "tenantId": TENANT, "teacherId": t1, "day": "Mon" }),
    );
    let items = view["items"].as_array().expect("items");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["status"].as_str(), Some("Substitutes"));
    assert_eq!(items[0]["substitute"]["id"].as_str(), Some(t2.as_str()));
    assert_eq!(items[0]["substitute"]["name"].as_str(), Some("Bela"));

    // The covering teacher now owns the slot in their own day view.
    let cover_view = s.request_ok(
        "timetable.teacherDay",
        json!({ "tenantId": TENANT, "teacherId": t2, "day": "Mon" }),
    );
    let cover_items = cover_view["items"].as_array().expect("items");
    assert_eq!(cover_items.len(), 1);
    assert_eq!(cover_items[0]["periodKey"].as_str(), Some("P1"));
}

#[test]
fn uncovered_absence_reads_as_cancelled() {
    let workspace = temp_dir("timetabled-day-cancelled");
    let mut s = Sidecar::start(&workspace);

    // Only one teacher exists, so the absence cannot be covered.
    let t1 = s.request_ok(
        "teachers.create",
        json!({ "tenantId": TENANT, "name": "Asha" }),
    )["id"]
        .as_str()
        .expect("teacher id")
        .to_string();
    setup_monday_slot(&mut s, &t1, &t1);

    let monday = this_monday();
    let leave = s.request_ok(
        "leave.create",
        json!({ "tenantId": TENANT, "teacherId": t1, "startDate": monday, "endDate": monday }),
    );
    let leave_id = leave["leaveId"].as_str().expect("leave id").to_string();
    let approved = s.request_ok(
        "leave.approveAndSchedule",
        json!({ "tenantId": TENANT, "leaveId": leave_id }),
    );
    assert_eq!(
        approved["substitutions"][0]["mode"].as_str(),
        Some("SUPERVISION")
    );

    let view = s.request_ok(
        "timetable.teacherDay",
        json!({ "tenantId": TENANT, "teacherId": t1, "day": "Mon" }),
    );
    let items = view["items"].as_array().expect("items");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["status"].as_str(), Some("Cancelled"));
    assert!(items[0]["substitute"].is_null());
}
