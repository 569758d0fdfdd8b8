//! Push message builders for each portal event.

use std::collections::BTreeMap;

use crate::push::PushMessage;

fn data_pairs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn assignment_created(assignment_id: &str, title: &str) -> PushMessage {
    PushMessage {
        title: "New Assignment".to_string(),
        body: format!("You have a new assignment: {}", title),
        data: data_pairs(&[
            ("type", "assignment"),
            ("assignment_id", assignment_id),
            ("action", "created"),
        ]),
    }
}

pub fn assignment_submitted(assignment_id: &str, title: &str, student_name: &str) -> PushMessage {
    PushMessage {
        title: "Assignment Submitted".to_string(),
        body: format!("{} submitted '{}'", student_name, title),
        data: data_pairs(&[
            ("type", "assignment"),
            ("assignment_id", assignment_id),
            ("action", "submitted"),
        ]),
    }
}

pub fn assignment_graded(assignment_id: &str, title: &str) -> PushMessage {
    PushMessage {
        title: "Assignment Graded".to_string(),
        body: format!("Your assignment '{}' has been graded", title),
        data: data_pairs(&[
            ("type", "assignment"),
            ("assignment_id", assignment_id),
            ("action", "graded"),
        ]),
    }
}

pub fn revision_requested(assignment_id: &str, title: &str) -> PushMessage {
    PushMessage {
        title: "Revision Requested".to_string(),
        body: format!("Your assignment '{}' was returned for revision", title),
        data: data_pairs(&[
            ("type", "assignment"),
            ("assignment_id", assignment_id),
            ("action", "returned"),
        ]),
    }
}

/// Chat preview truncates long content the way the portal's web UI does.
pub fn chat_message(room_id: &str, room_name: &str, sender_name: &str, content: &str) -> PushMessage {
    let preview: String = content.chars().take(50).collect();
    PushMessage {
        title: format!("New message in {}", room_name),
        body: format!("{}: {}", sender_name, preview),
        data: data_pairs(&[("type", "chat"), ("room_id", room_id)]),
    }
}

pub fn achievement(achievement_text: &str) -> PushMessage {
    PushMessage {
        title: "Achievement Unlocked!".to_string(),
        body: format!("Congratulations! You've {}", achievement_text),
        data: data_pairs(&[("type", "achievement"), ("achievement", achievement_text)]),
    }
}

pub fn test_message() -> PushMessage {
    PushMessage {
        title: "Test Notification".to_string(),
        body: "This is a test notification from Tutoring Hub".to_string(),
        data: data_pairs(&[("type", "test")]),
    }
}
