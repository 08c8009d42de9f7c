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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_marklistd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn marklistd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("marklist-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("workspacePath").expect("field").is_null());
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let subjects = request_ok(&mut stdin, &mut reader, "3", "subjects.get", json!({}));
    assert_eq!(
        subjects.get("subjects").and_then(|v| v.as_array()).map(|v| v.len()),
        Some(9)
    );
    let upper = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "subjects.set",
        json!({ "preset": "upper" }),
    );
    assert_eq!(
        upper.get("subjects").and_then(|v| v.as_array()).map(|v| v.len()),
        Some(8)
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "classes.create",
        json!({ "name": "8_north", "grade": 8, "streamLabel": "North" }),
    );
    request_ok(&mut stdin, &mut reader, "6", "classes.list", json!({}));
    let stream = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "classes.stream",
        json!({ "grade": 8 }),
    );
    assert_eq!(stream.get("key").and_then(|v| v.as_str()), Some("stream:8"));

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.create",
        json!({ "name": "Kamau", "class": "8_north", "admissionNo": "A-100" }),
    );
    let student_id = created
        .get("studentId")
        .and_then(|v| v.as_i64())
        .expect("studentId");
    request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.update",
        json!({ "studentId": student_id, "patch": { "name": "Kamau J." } }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.list",
        json!({ "class": "8_north" }),
    );
    assert_eq!(
        listed.pointer("/students/0/name").and_then(|v| v.as_str()),
        Some("Kamau J.")
    );

    let exam = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "exams.create",
        json!({ "examName": "Term 2 Opener", "examType": "opener", "term": 2 }),
    );
    assert_eq!(exam.get("examType").and_then(|v| v.as_str()), Some("Opener"));
    request_ok(&mut stdin, &mut reader, "12", "exams.list", json!({}));
    request_ok(&mut stdin, &mut reader, "13", "exams.get", json!({ "examId": 1 }));
    request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "results.enter",
        json!({ "examId": 1, "entries": [{ "studentId": student_id, "marks": { "english": 66 } }] }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "boundaries.list",
        json!({ "kind": "subject" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "marklist.generate",
        json!({ "examId": 1, "class": "8_north" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "meanScores.get",
        json!({ "examId": 1, "class": "8_north" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "reports.smsMessages",
        json!({ "examId": 1, "class": "8_north" }),
    );

    let _ = child.kill();
}

/// Two 7_east students with english/mathematics only; returns their ids.
fn seed_reports(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> (i64, i64) {
    request_ok(
        stdin,
        reader,
        "r1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        stdin,
        reader,
        "r2",
        "subjects.set",
        json!({ "subjects": [
            { "code": "english", "name": "English" },
            { "code": "mathematics", "name": "Mathematics" }
        ] }),
    );
    request_ok(
        stdin,
        reader,
        "r3",
        "boundaries.replace",
        json!({
            "kind": "subject",
            "boundaries": [
                { "minMarks": 0, "maxMarks": 49, "pl": "Below Expectation", "ab": "BE" },
                { "minMarks": 50, "maxMarks": 100, "pl": "Meeting Expectation", "ab": "ME" }
            ]
        }),
    );
    request_ok(
        stdin,
        reader,
        "r4",
        "classes.create",
        json!({ "name": "7_east", "grade": 7 }),
    );
    let mut ids = Vec::new();
    for name in ["Achieng", "Baraka"] {
        let created = request_ok(
            stdin,
            reader,
            "r5",
            "students.create",
            json!({ "name": name, "class": "7_east" }),
        );
        ids.push(
            created
                .get("studentId")
                .and_then(|v| v.as_i64())
                .expect("studentId"),
        );
    }
    request_ok(
        stdin,
        reader,
        "r6",
        "exams.create",
        json!({ "examName": "Term 1 Final", "examType": "End-Term", "term": 1 }),
    );
    request_ok(
        stdin,
        reader,
        "r7",
        "results.enter",
        json!({ "examId": 1, "entries": [
            { "studentId": ids[0], "marks": { "english": 70, "mathematics": 70 } },
            { "studentId": ids[1], "marks": { "english": 60, "mathematics": null } }
        ] }),
    );
    (ids[0], ids[1])
}

#[test]
fn report_card_and_sms_follow_class_mark_list() {
    let workspace = temp_dir("marklist-reports");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (_, baraka) = seed_reports(&mut stdin, &mut reader, &workspace);

    let card = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "reports.studentCard",
        json!({ "examId": 1, "studentId": baraka }),
    );
    assert_eq!(card.get("position").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(card.get("classSize").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(card.get("totalMarks").and_then(|v| v.as_i64()), Some(60));
    assert_eq!(
        card.pointer("/lines/0/classMean").and_then(|v| v.as_f64()),
        Some(65.0)
    );
    assert!(card.pointer("/lines/1/mark").expect("mark").is_null());
    assert_eq!(
        card.pointer("/lines/1/level").and_then(|v| v.as_str()),
        Some("-")
    );

    let sms = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.smsMessages",
        json!({ "examId": 1, "class": "7_east" }),
    );
    let texts: Vec<&str> = sms
        .get("messages")
        .and_then(|v| v.as_array())
        .expect("messages")
        .iter()
        .filter_map(|m| m.get("text").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(texts.len(), 2);
    assert!(texts[1].starts_with("Baraka: Term 1 Final (End-Term) ENGLISH 60, MATHEMATICS -"));
    assert!(texts[1].ends_with("Pos 2/2"));

    let missing = request(
        &mut stdin,
        &mut reader,
        "3",
        "reports.studentCard",
        json!({ "examId": 1, "studentId": 999 }),
    );
    assert_eq!(
        missing.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_found")
    );

    let _ = child.kill();
}

#[test]
fn mark_list_csv_export_writes_ranked_rows() {
    let workspace = temp_dir("marklist-csv");
    let out = workspace.join("exports/7_east.csv");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    seed_reports(&mut stdin, &mut reader, &workspace);

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "exchange.exportMarkListCsv",
        json!({ "examId": 1, "class": "7_east", "outPath": out.to_string_lossy() }),
    );
    assert_eq!(res.get("rowsExported").and_then(|v| v.as_i64()), Some(2));

    let text = std::fs::read_to_string(&out).expect("read csv");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines[0],
        "student_id,name,class,english,mathematics,total_marks,position,PL_total"
    );
    assert!(lines[1].contains(",Achieng,7_east,70,70,140,1,"));
    assert!(lines[2].contains(",Baraka,7_east,60,,60,2,"));
    assert!(lines[3].starts_with(",MEAN,,65,70,100,"));

    let _ = child.kill();
}

#[test]
fn backup_bundle_round_trip_restores_workspace() {
    let workspace = temp_dir("marklist-backup");
    let bundle = workspace.join("backups/term1.zip");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    seed_reports(&mut stdin, &mut reader, &workspace);

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        exported.get("bundleFormat").and_then(|v| v.as_str()),
        Some("marklist-workspace-v1")
    );
    assert_eq!(exported.get("entryCount").and_then(|v| v.as_i64()), Some(2));

    // Diverge after the export; the import must bring the old state back.
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "7_west", "grade": 7 }),
    );
    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        imported.get("dbSha256").and_then(|v| v.as_str()),
        exported.get("dbSha256").and_then(|v| v.as_str())
    );

    let classes = request_ok(&mut stdin, &mut reader, "4", "classes.list", json!({}));
    let names: Vec<&str> = classes
        .get("classes")
        .and_then(|v| v.as_array())
        .expect("classes")
        .iter()
        .filter_map(|c| c.get("name").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(names, vec!["7_east"]);

    let missing = request(
        &mut stdin,
        &mut reader,
        "5",
        "backup.importWorkspaceBundle",
        json!({ "inPath": workspace.join("nope.zip").to_string_lossy() }),
    );
    assert_eq!(
        missing.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_found")
    );

    let _ = child.kill();
}
