mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{request_err, request_ok, result_str, spawn_sidecar, temp_dir};

fn seed_material(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    teacher_id: &str,
    id_prefix: &str,
    title: &str,
) -> String {
    let subject = request_ok(
        stdin,
        reader,
        &format!("{}-subj", id_prefix),
        "subjects.create",
        json!({ "name": format!("Subject {}", title) }),
    );
    let material = request_ok(
        stdin,
        reader,
        &format!("{}-mat", id_prefix),
        "materials.create",
        json!({
            "actorId": teacher_id,
            "title": title,
            "materialType": "worksheet",
            "subjectId": result_str(&subject, "id"),
            "difficulty": "beginner",
            "fileName": format!("{}.pdf", id_prefix),
            "gradeLevel": "7"
        }),
    );
    result_str(&material, "id")
}

fn seed(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> (String, String) {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request_ok(
        stdin,
        reader,
        "s2",
        "accounts.create",
        json!({ "username": "mr-ross", "role": "teacher", "fullName": "Dan Ross" }),
    );
    let student = request_ok(
        stdin,
        reader,
        "s3",
        "accounts.create",
        json!({
            "username": "sam",
            "role": "student",
            "fullName": "Sam Lee",
            "gradeLevel": "7",
            "parentEmail": "lee@example.com"
        }),
    );
    (result_str(&teacher, "id"), result_str(&student, "id"))
}

#[test]
fn record_upserts_and_normalizes_completion() {
    let workspace = temp_dir("tutorhub-progress-record");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (teacher_id, student_id) = seed(&mut stdin, &mut reader, &workspace);
    let material_id = seed_material(&mut stdin, &mut reader, &teacher_id, "m1", "Fractions");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "progress.record",
        json!({
            "studentId": student_id,
            "materialId": material_id,
            "score": 120
        }),
    );
    assert_eq!(code, "validation_error");

    let started = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "progress.record",
        json!({
            "studentId": student_id,
            "materialId": material_id,
            "status": "in_progress",
            "timeSpentMinutes": 20,
            "now": "2026-08-23T15:00:00Z"
        }),
    );
    assert_eq!(
        started.get("startedAt").and_then(|v| v.as_str()),
        Some("2026-08-23T15:00:00Z")
    );
    assert!(started
        .get("completedAt")
        .map(|v| v.is_null())
        .unwrap_or(false));

    // Completion without a timestamp stamps one from the clock.
    let completed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "progress.record",
        json!({
            "studentId": student_id,
            "materialId": material_id,
            "status": "completed",
            "score": 90,
            "timeSpentMinutes": 45,
            "now": "2026-08-24T16:00:00Z"
        }),
    );
    assert_eq!(
        completed.get("status").and_then(|v| v.as_str()),
        Some("completed")
    );
    assert_eq!(
        completed.get("completedAt").and_then(|v| v.as_str()),
        Some("2026-08-24T16:00:00Z")
    );
    // The upsert kept the original start.
    assert_eq!(
        completed.get("startedAt").and_then(|v| v.as_str()),
        Some("2026-08-23T15:00:00Z")
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "progress.list",
        json!({ "studentId": student_id }),
    );
    assert_eq!(
        listed
            .get("progress")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1),
        "repeat records must not duplicate the row"
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn summary_rolls_up_scores_and_the_study_streak() {
    let workspace = temp_dir("tutorhub-progress-summary");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (teacher_id, student_id) = seed(&mut stdin, &mut reader, &workspace);

    // No rows at all: everything zeroes out.
    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "progress.summary",
        json!({ "studentId": student_id, "today": "2026-08-25" }),
    );
    assert_eq!(
        empty.get("completionRate").and_then(|v| v.as_f64()),
        Some(0.0)
    );
    assert!(empty
        .get("averageScore")
        .map(|v| v.is_null())
        .unwrap_or(false));
    assert_eq!(
        empty.get("studyStreakDays").and_then(|v| v.as_u64()),
        Some(0)
    );

    let m1 = seed_material(&mut stdin, &mut reader, &teacher_id, "m1", "Fractions");
    let m2 = seed_material(&mut stdin, &mut reader, &teacher_id, "m2", "Decimals");
    let m3 = seed_material(&mut stdin, &mut reader, &teacher_id, "m3", "Ratios");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "progress.record",
        json!({
            "studentId": student_id,
            "materialId": m1,
            "status": "completed",
            "score": 80,
            "timeSpentMinutes": 30,
            "now": "2026-08-24T10:00:00Z"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "progress.record",
        json!({
            "studentId": student_id,
            "materialId": m2,
            "status": "completed",
            "score": 90,
            "timeSpentMinutes": 45,
            "now": "2026-08-23T11:00:00Z"
        }),
    );
    // Activity today, in progress, no score yet.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "progress.record",
        json!({
            "studentId": student_id,
            "materialId": m3,
            "status": "in_progress",
            "timeSpentMinutes": 15,
            "now": "2026-08-25T09:00:00Z"
        }),
    );

    // Active on the 25th (today), 24th and 23rd; the 22nd is a gap, so
    // the streak counts two days back from yesterday.
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "progress.summary",
        json!({ "studentId": student_id, "today": "2026-08-25" }),
    );
    assert_eq!(summary.get("totalMaterials").and_then(|v| v.as_u64()), Some(3));
    assert_eq!(
        summary.get("completedMaterials").and_then(|v| v.as_u64()),
        Some(2)
    );
    let rate = summary
        .get("completionRate")
        .and_then(|v| v.as_f64())
        .expect("completionRate");
    assert!((rate - 66.666).abs() < 0.01, "rate was {}", rate);
    assert_eq!(
        summary.get("averageScore").and_then(|v| v.as_f64()),
        Some(85.0)
    );
    assert_eq!(summary.get("bestScore").and_then(|v| v.as_i64()), Some(90));
    assert_eq!(
        summary.get("totalTimeMinutes").and_then(|v| v.as_i64()),
        Some(90)
    );
    assert_eq!(
        summary.get("studyStreakDays").and_then(|v| v.as_u64()),
        Some(2)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
