mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{request_err, request_ok, result_str, spawn_sidecar, temp_dir};

struct Fixture {
    teacher_id: String,
    student_id: String,
    other_student_id: String,
    material_id: String,
}

fn seed(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> Fixture {
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
    let other = request_ok(
        stdin,
        reader,
        "s4",
        "accounts.create",
        json!({
            "username": "kim",
            "role": "student",
            "fullName": "Kim Park",
            "gradeLevel": "7",
            "parentEmail": "park@example.com"
        }),
    );
    let subject = request_ok(
        stdin,
        reader,
        "s5",
        "subjects.create",
        json!({ "name": "Mathematics" }),
    );
    let teacher_id = result_str(&teacher, "id");
    let material = request_ok(
        stdin,
        reader,
        "s6",
        "materials.create",
        json!({
            "actorId": teacher_id,
            "title": "Fractions Worksheet",
            "materialType": "worksheet",
            "subjectId": result_str(&subject, "id"),
            "difficulty": "beginner",
            "fileName": "fractions.pdf",
            "gradeLevel": "7"
        }),
    );
    Fixture {
        teacher_id,
        student_id: result_str(&student, "id"),
        other_student_id: result_str(&other, "id"),
        material_id: result_str(&material, "id"),
    }
}

#[test]
fn creation_rejects_past_due_dates_and_non_student_assignees() {
    let workspace = temp_dir("tutorhub-assign-create");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed(&mut stdin, &mut reader, &workspace);

    let code = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "assignments.create",
        json!({
            "actorId": fx.teacher_id,
            "title": "Fractions Homework",
            "materialId": fx.material_id,
            "dueDate": "2026-03-05T17:00:00Z",
            "assignedTo": [fx.student_id],
            "now": "2026-03-06T00:00:00Z"
        }),
    );
    assert_eq!(code, "validation_error");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "assignments.create",
        json!({
            "actorId": fx.teacher_id,
            "title": "Fractions Homework",
            "materialId": fx.material_id,
            "dueDate": "2026-03-05T17:00:00Z",
            "assignedTo": [fx.teacher_id],
            "now": "2026-03-01T10:00:00Z"
        }),
    );
    assert_eq!(code, "validation_error");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "assignments.create",
        json!({
            "actorId": fx.student_id,
            "title": "Fractions Homework",
            "materialId": fx.material_id,
            "dueDate": "2026-03-05T17:00:00Z",
            "assignedTo": [fx.student_id],
            "now": "2026-03-01T10:00:00Z"
        }),
    );
    assert_eq!(code, "forbidden");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn submission_flow_overwrites_grades_and_returns() {
    let workspace = temp_dir("tutorhub-assign-flow");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed(&mut stdin, &mut reader, &workspace);

    let assignment = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "assignments.create",
        json!({
            "actorId": fx.teacher_id,
            "title": "Fractions Homework",
            "materialId": fx.material_id,
            "dueDate": "2026-03-05T17:00:00Z",
            "priority": "high",
            "maxScore": 100,
            "assignedTo": [fx.student_id],
            "now": "2026-03-01T10:00:00Z"
        }),
    );
    let assignment_id = result_str(&assignment, "id");
    assert_eq!(
        assignment.get("daysUntilDue").and_then(|v| v.as_i64()),
        Some(4)
    );
    assert_eq!(
        assignment.get("isOverdue").and_then(|v| v.as_bool()),
        Some(false)
    );

    // Neither text nor file.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "assignments.submit",
        json!({
            "assignmentId": assignment_id,
            "actorId": fx.student_id,
            "now": "2026-03-04T09:00:00Z"
        }),
    );
    assert_eq!(code, "validation_error");

    // Not in the assigned set.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "assignments.submit",
        json!({
            "assignmentId": assignment_id,
            "actorId": fx.other_student_id,
            "text": "my answers",
            "now": "2026-03-04T09:00:00Z"
        }),
    );
    assert_eq!(code, "forbidden");

    let submission = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assignments.submit",
        json!({
            "assignmentId": assignment_id,
            "actorId": fx.student_id,
            "text": "first try",
            "now": "2026-03-04T09:00:00Z"
        }),
    );
    let submission_id = result_str(&submission, "id");
    assert_eq!(
        submission.get("status").and_then(|v| v.as_str()),
        Some("submitted")
    );
    assert_eq!(submission.get("isLate").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(submission.get("daysLate").and_then(|v| v.as_i64()), Some(0));

    let reviewing = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.startReview",
        json!({ "submissionId": submission_id, "actorId": fx.teacher_id }),
    );
    assert_eq!(
        reviewing.get("status").and_then(|v| v.as_str()),
        Some("under_review")
    );

    // 95/100 derives an A without an explicit letter.
    let graded = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "assignments.grade",
        json!({
            "submissionId": submission_id,
            "actorId": fx.teacher_id,
            "score": 95,
            "feedback": "Solid work",
            "now": "2026-03-05T12:00:00Z"
        }),
    );
    assert_eq!(graded.get("status").and_then(|v| v.as_str()), Some("graded"));
    assert_eq!(
        graded.get("letterGrade").and_then(|v| v.as_str()),
        Some("A")
    );
    assert_eq!(
        graded.get("gradedAt").and_then(|v| v.as_str()),
        Some("2026-03-05T12:00:00Z")
    );

    let code = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "assignments.grade",
        json!({
            "submissionId": submission_id,
            "actorId": fx.teacher_id,
            "score": 150
        }),
    );
    assert_eq!(code, "validation_error");

    let returned = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "assignments.requestRevision",
        json!({
            "submissionId": submission_id,
            "actorId": fx.teacher_id,
            "notes": "Show your steps on question 3"
        }),
    );
    assert_eq!(
        returned.get("status").and_then(|v| v.as_str()),
        Some("returned")
    );
    assert_eq!(
        returned.get("revisionRequested").and_then(|v| v.as_bool()),
        Some(true)
    );

    // A late resubmission overwrites the same row and wipes the grade.
    let resubmitted = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "assignments.submit",
        json!({
            "assignmentId": assignment_id,
            "actorId": fx.student_id,
            "text": "second try",
            "now": "2026-03-08T09:00:00Z"
        }),
    );
    assert_eq!(
        resubmitted.get("status").and_then(|v| v.as_str()),
        Some("submitted")
    );
    assert!(resubmitted.get("score").map(|v| v.is_null()).unwrap_or(false));
    assert!(resubmitted
        .get("gradedAt")
        .map(|v| v.is_null())
        .unwrap_or(false));
    assert_eq!(
        resubmitted.get("isLate").and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(
        resubmitted.get("daysLate").and_then(|v| v.as_i64()),
        Some(2)
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "assignments.listSubmissions",
        json!({ "assignmentId": assignment_id, "actorId": fx.teacher_id }),
    );
    let rows = listed
        .get("submissions")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(rows.len(), 1, "resubmission must not duplicate the row");
    assert_eq!(
        rows[0].get("text").and_then(|v| v.as_str()),
        Some("second try")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn listing_is_scoped_by_role_including_parents() {
    let workspace = temp_dir("tutorhub-assign-list");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed(&mut stdin, &mut reader, &workspace);

    let parent = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "accounts.create",
        json!({
            "username": "lee-sr",
            "role": "parent",
            "fullName": "Jordan Lee",
            "email": "lee@example.com"
        }),
    );
    let parent_id = result_str(&parent, "id");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "assignments.create",
        json!({
            "actorId": fx.teacher_id,
            "title": "Fractions Homework",
            "materialId": fx.material_id,
            "dueDate": "2026-03-05T17:00:00Z",
            "assignedTo": [fx.student_id],
            "now": "2026-03-01T10:00:00Z"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "assignments.create",
        json!({
            "actorId": fx.teacher_id,
            "title": "Decimals Homework",
            "materialId": fx.material_id,
            "dueDate": "2026-03-09T17:00:00Z",
            "assignedTo": [fx.other_student_id],
            "now": "2026-03-01T10:00:00Z"
        }),
    );

    let count = |result: &serde_json::Value| {
        result
            .get("assignments")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0)
    };

    let teacher_view = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assignments.list",
        json!({ "actorId": fx.teacher_id }),
    );
    assert_eq!(count(&teacher_view), 2);

    let student_view = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.list",
        json!({ "actorId": fx.student_id }),
    );
    assert_eq!(count(&student_view), 1);
    assert_eq!(
        student_view["assignments"][0]
            .get("title")
            .and_then(|v| v.as_str()),
        Some("Fractions Homework")
    );

    // The parent's email matches sam's parentEmail, not kim's.
    let parent_view = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "assignments.list",
        json!({ "actorId": parent_id }),
    );
    assert_eq!(count(&parent_view), 1);
    assert_eq!(
        parent_view["assignments"][0]
            .get("title")
            .and_then(|v| v.as_str()),
        Some("Fractions Homework")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
