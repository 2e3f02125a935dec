//! Defensive normalization of externally sourced documents.
//!
//! A document is repaired rather than rejected: entries that do not match the
//! expected shape are dropped one by one at the innermost level, missing
//! collections become empty.

use crate::models::{
    ActionItem, AppNotification, AppState, AuditEntry, LlmConfig, Meeting, Project, ProjectMember,
    SmartTodo, SystemMessage, Task, Team, Theme, User, WeeklyReport, WorkingGroup,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub fn sanitize_app_state(raw: Value) -> AppState {
    let Value::Object(mut map) = raw else {
        tracing::warn!("document is not a JSON object; using an empty document");
        return with_defaults(AppState::default());
    };

    if let Ok(state) = serde_json::from_value::<AppState>(Value::Object(map.clone())) {
        return with_defaults(state);
    }

    repair_teams(&mut map);
    repair_meetings(&mut map);
    retain_valid_entries::<User>(&mut map, "users");
    retain_valid_entries::<Team>(&mut map, "teams");
    retain_valid_entries::<Meeting>(&mut map, "meetings");
    retain_valid_entries::<WeeklyReport>(&mut map, "weeklyReports");
    retain_valid_entries::<WorkingGroup>(&mut map, "workingGroups");
    retain_valid_entries::<SmartTodo>(&mut map, "smartTodos");
    retain_valid_entries::<AppNotification>(&mut map, "notifications");
    retain_if_valid::<BTreeMap<String, String>>(&mut map, "dismissedAlerts");
    retain_if_valid::<BTreeMap<String, String>>(&mut map, "prompts");
    retain_if_valid::<SystemMessage>(&mut map, "systemMessage");
    retain_if_valid::<Option<User>>(&mut map, "currentUser");
    retain_if_valid::<Option<LlmConfig>>(&mut map, "llmConfig");
    retain_if_valid::<Theme>(&mut map, "theme");
    normalize_clock(&mut map);

    match serde_json::from_value::<AppState>(Value::Object(map)) {
        Ok(state) => with_defaults(state),
        Err(error) => {
            tracing::warn!(error = %error, "document could not be repaired; using an empty document");
            with_defaults(AppState::default())
        }
    }
}

/// Fills the optional parts of a document that serde defaults cannot express
/// and drops stored copies of derived notifications.
pub fn with_defaults(mut state: AppState) -> AppState {
    if state.llm_config.is_none() {
        state.llm_config = Some(LlmConfig::default());
    }
    state
        .notifications
        .retain(|notification| !notification.r#type.is_dynamic());
    state
}

/// Prunes bad tasks, members and audit entries inside each project, then bad
/// projects inside each team, so one broken task never costs its team.
fn repair_teams(map: &mut Map<String, Value>) {
    let Some(Value::Array(teams)) = map.get_mut("teams") else {
        return;
    };
    for team in teams.iter_mut() {
        let Value::Object(team) = team else {
            continue;
        };
        if let Some(Value::Array(projects)) = team.get_mut("projects") {
            for project in projects.iter_mut().filter_map(Value::as_object_mut) {
                retain_valid_entries::<ProjectMember>(project, "members");
                retain_valid_entries::<Task>(project, "tasks");
                retain_valid_entries::<AuditEntry>(project, "auditLog");
                retain_valid_entries::<String>(project, "sharedWith");
            }
        }
        retain_valid_entries::<Project>(team, "projects");
    }
}

fn repair_meetings(map: &mut Map<String, Value>) {
    let Some(Value::Array(meetings)) = map.get_mut("meetings") else {
        return;
    };
    for meeting in meetings.iter_mut().filter_map(Value::as_object_mut) {
        retain_valid_entries::<ActionItem>(meeting, "actionItems");
        retain_valid_entries::<String>(meeting, "attendees");
    }
}

fn retain_valid_entries<T: DeserializeOwned>(map: &mut Map<String, Value>, key: &str) {
    match map.get(key) {
        None => return,
        Some(Value::Array(_)) => {}
        Some(_) => {
            tracing::warn!(field = key, "collection is not an array; treating it as empty");
            map.remove(key);
            return;
        }
    }
    let Some(Value::Array(entries)) = map.get_mut(key) else {
        return;
    };

    let before = entries.len();
    entries.retain(|entry| serde_json::from_value::<T>(entry.clone()).is_ok());
    let dropped = before - entries.len();
    if dropped > 0 {
        tracing::warn!(field = key, dropped, "dropped malformed entries");
    }
}

fn retain_if_valid<T: DeserializeOwned>(map: &mut Map<String, Value>, key: &str) {
    let valid = match map.get(key) {
        Some(value) => serde_json::from_value::<T>(value.clone()).is_ok(),
        None => return,
    };
    if !valid {
        tracing::warn!(field = key, "malformed field replaced by its default");
        map.remove(key);
    }
}

fn normalize_clock(map: &mut Map<String, Value>) {
    let normalized = match map.get("lastUpdated") {
        None | Some(Value::Null) => None,
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|value| value as i64)),
        Some(Value::String(raw)) => raw.trim().parse::<i64>().ok(),
        Some(_) => None,
    };

    match normalized {
        Some(clock) => {
            map.insert("lastUpdated".to_string(), Value::from(clock));
        }
        None => {
            map.remove("lastUpdated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sanitize_app_state;
    use crate::models::{LlmProvider, MessageLevel, Theme};
    use serde_json::json;

    #[test]
    fn missing_collections_become_empty() {
        let state = sanitize_app_state(json!({
            "users": [{ "id": "u1", "role": "Admin" }],
            "lastUpdated": 42
        }));

        assert_eq!(state.users.len(), 1);
        assert!(state.teams.is_empty());
        assert!(state.notifications.is_empty());
        assert!(state.dismissed_alerts.is_empty());
        assert!(state.working_groups.is_empty());
        assert!(state.smart_todos.is_empty());
        assert!(!state.system_message.active);
        assert_eq!(state.system_message.level, MessageLevel::Info);
        assert_eq!(state.theme, Theme::Light);
        assert_eq!(state.last_updated, 42);
        assert_eq!(
            state.llm_config.map(|config| config.provider),
            Some(LlmProvider::Ollama)
        );
    }

    #[test]
    fn malformed_entries_are_dropped_individually() {
        let state = sanitize_app_state(json!({
            "users": [
                { "id": "u1", "role": "Admin" },
                { "id": "u2", "role": "Overlord" },
                "not-a-user"
            ],
            "teams": "oops",
            "dismissedAlerts": [1, 2, 3],
            "lastUpdated": "1700"
        }));

        assert_eq!(state.users.len(), 1);
        assert_eq!(state.users[0].id, "u1");
        assert!(state.teams.is_empty());
        assert!(state.dismissed_alerts.is_empty());
        assert_eq!(state.last_updated, 1700);
    }

    #[test]
    fn broken_task_is_pruned_without_losing_its_team() {
        let state = sanitize_app_state(json!({
            "teams": [{
                "id": "t1", "name": "Platform", "managerId": "c",
                "projects": [
                    { "id": "p1", "name": "Billing", "status": "Active" },
                    {
                        "id": "p2", "name": "Search", "status": "Active",
                        "members": [{ "userId": "d", "role": "Contributor" }, { "userId": "e" }],
                        "tasks": [
                            { "id": "k1", "title": "Index", "status": "To Do", "eta": null },
                            { "id": "k2", "title": "Rank", "status": "Sideways" }
                        ]
                    }
                ]
            }],
            "meetings": [{
                "id": "m1", "date": "2026-10-01", "title": "Sync",
                "actionItems": [{ "id": "x1", "ownerId": "d", "status": "Ongoing" }, { "id": "x2" }]
            }],
            "weeklyReports": [{ "id": "r1", "userId": "d", "weekOf": "2026-10-05" }],
            "lastUpdated": 9
        }));

        assert_eq!(state.teams.len(), 1);
        let projects = &state.teams[0].projects;
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[1].members.len(), 1);
        assert_eq!(projects[1].tasks.len(), 1);
        assert_eq!(projects[1].tasks[0].id, "k1");
        assert_eq!(projects[1].tasks[0].eta, "");
        assert_eq!(state.meetings[0].action_items.len(), 1);
        assert_eq!(state.weekly_reports.len(), 1);
        assert_eq!(state.weekly_reports[0].updated_at, "");
        assert_eq!(state.last_updated, 9);
    }

    #[test]
    fn null_fields_read_as_defaults() {
        let state = sanitize_app_state(json!({
            "users": [{ "id": "u1", "role": "Admin", "firstName": null }],
            "smartTodos": null,
            "lastUpdated": 3
        }));
        assert_eq!(state.users.len(), 1);
        assert_eq!(state.users[0].first_name, "");
        assert!(state.smart_todos.is_empty());
    }

    #[test]
    fn derived_notifications_are_never_kept() {
        let state = sanitize_app_state(json!({
            "notifications": [
                { "id": "n1", "type": "task_created", "message": "m", "targetRole": "admin", "createdAt": "2026-10-01" },
                { "id": "stale_p1", "type": "stale_project", "message": "m", "targetRole": "user", "createdAt": "2026-10-01" }
            ]
        }));
        assert_eq!(state.notifications.len(), 1);
        assert_eq!(state.notifications[0].id, "n1");
    }

    #[test]
    fn non_object_document_yields_empty_state() {
        let state = sanitize_app_state(json!([1, 2, 3]));
        assert!(state.users.is_empty());
        assert_eq!(state.last_updated, 0);
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let state = sanitize_app_state(json!({
            "users": [],
            "oneOffQueries": [{ "id": "q1" }],
            "lastUpdated": 5
        }));
        let encoded = serde_json::to_value(&state).expect("encode");
        assert_eq!(encoded["oneOffQueries"][0]["id"], "q1");
    }
}
