//! State-mutating operations.
//!
//! Every handler reads the current document and returns its replacement;
//! none of them fail. A command whose target no longer exists yields the
//! document unchanged.

use crate::merge::overlay_session;
use crate::models::{
    AppState, AuditEntry, LlmConfig, Meeting, Project, ProjectStatus, SmartTodo, SystemMessage,
    Team, Theme, User, WeeklyReport, WorkingGroup,
};
use crate::notifications::{
    append_capped, mark_all_seen, mark_seen, report_notification, team_change_notifications,
};
use crate::sanitize::sanitize_app_state;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const AUDIT_LOG_CAP: usize = 20;
const UNKNOWN_ACTOR: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Command {
    AddUser(User),
    UpdateUser(User),
    DeleteUser {
        user_id: String,
    },
    SetUserPassword {
        user_id: String,
        password: String,
    },
    AddTeam(Team),
    /// `team` may be a filtered view: projects it lacks are kept.
    UpdateTeam(Team),
    DeleteTeam {
        team_id: String,
    },
    DeleteProject {
        team_id: String,
        project_id: String,
    },
    TransferProject {
        from_team_id: String,
        project_id: String,
        to_team_id: String,
    },
    ArchiveProject {
        team_id: String,
        project_id: String,
    },
    RestoreProject {
        team_id: String,
        project_id: String,
    },
    UpsertReport(WeeklyReport),
    DeleteReport {
        report_id: String,
    },
    UpsertMeeting(Meeting),
    DeleteMeeting {
        meeting_id: String,
    },
    UpsertWorkingGroup(WorkingGroup),
    DeleteWorkingGroup {
        group_id: String,
    },
    UpsertSmartTodo(SmartTodo),
    DeleteSmartTodo {
        todo_id: String,
    },
    UpdateLlmConfig {
        config: LlmConfig,
        #[serde(default)]
        prompts: Option<BTreeMap<String, String>>,
    },
    SetSystemMessage(SystemMessage),
    SetTheme(Theme),
    ToggleTheme,
    MarkNotificationSeen {
        notification_id: String,
    },
    MarkAllNotificationsSeen,
    ImportState(Value),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddUser(_) => "addUser",
            Self::UpdateUser(_) => "updateUser",
            Self::DeleteUser { .. } => "deleteUser",
            Self::SetUserPassword { .. } => "setUserPassword",
            Self::AddTeam(_) => "addTeam",
            Self::UpdateTeam(_) => "updateTeam",
            Self::DeleteTeam { .. } => "deleteTeam",
            Self::DeleteProject { .. } => "deleteProject",
            Self::TransferProject { .. } => "transferProject",
            Self::ArchiveProject { .. } => "archiveProject",
            Self::RestoreProject { .. } => "restoreProject",
            Self::UpsertReport(_) => "upsertReport",
            Self::DeleteReport { .. } => "deleteReport",
            Self::UpsertMeeting(_) => "upsertMeeting",
            Self::DeleteMeeting { .. } => "deleteMeeting",
            Self::UpsertWorkingGroup(_) => "upsertWorkingGroup",
            Self::DeleteWorkingGroup { .. } => "deleteWorkingGroup",
            Self::UpsertSmartTodo(_) => "upsertSmartTodo",
            Self::DeleteSmartTodo { .. } => "deleteSmartTodo",
            Self::UpdateLlmConfig { .. } => "updateLlmConfig",
            Self::SetSystemMessage(_) => "setSystemMessage",
            Self::SetTheme(_) => "setTheme",
            Self::ToggleTheme => "toggleTheme",
            Self::MarkNotificationSeen { .. } => "markNotificationSeen",
            Self::MarkAllNotificationsSeen => "markAllNotificationsSeen",
            Self::ImportState(_) => "importState",
        }
    }

    /// Commands that only touch session-local fields are never pushed.
    pub fn is_local_only(&self) -> bool {
        matches!(self, Self::SetTheme(_) | Self::ToggleTheme)
    }
}

pub fn apply_command(state: &AppState, command: Command, now: DateTime<Utc>) -> AppState {
    let mut next = state.clone();
    match command {
        Command::AddUser(user) => {
            if state.find_user(&user.id).is_none() {
                next.users.push(user);
            }
        }
        Command::UpdateUser(user) => {
            replace_by_id(&mut next.users, user, |u| &u.id, false);
        }
        Command::DeleteUser { user_id } => next.users.retain(|user| user.id != user_id),
        Command::SetUserPassword { user_id, password } => {
            if let Some(user) = next.users.iter_mut().find(|user| user.id == user_id) {
                user.password = Some(password);
            }
        }
        Command::AddTeam(team) => {
            if state.find_team(&team.id).is_none() {
                let events = team_change_notifications(None, &team, &actor_name(state), now);
                next.notifications = append_capped(&next.notifications, events);
                next.teams.push(team);
            }
        }
        Command::UpdateTeam(team) => return update_team(state, team, now),
        Command::DeleteTeam { team_id } => next.teams.retain(|team| team.id != team_id),
        Command::DeleteProject {
            team_id,
            project_id,
        } => {
            if let Some(team) = next.teams.iter_mut().find(|team| team.id == team_id) {
                team.projects.retain(|project| project.id != project_id);
            }
        }
        Command::TransferProject {
            from_team_id,
            project_id,
            to_team_id,
        } => return transfer_project(state, &from_team_id, &project_id, &to_team_id, now),
        Command::ArchiveProject {
            team_id,
            project_id,
        } => {
            let actor = actor_name(state);
            if let Some(project) = find_project_mut(&mut next, &team_id, &project_id) {
                project.is_archived = true;
                project.status = ProjectStatus::Done;
                project.completed_at = Some(now.date_naive().to_string());
                record_audit(
                    project,
                    &actor,
                    "Archived",
                    Some("Project marked as completed and archived".to_string()),
                    now,
                );
            }
        }
        Command::RestoreProject {
            team_id,
            project_id,
        } => {
            let actor = actor_name(state);
            if let Some(project) = find_project_mut(&mut next, &team_id, &project_id) {
                project.is_archived = false;
                project.completed_at = None;
                if project.status == ProjectStatus::Done {
                    project.status = ProjectStatus::Active;
                }
                record_audit(
                    project,
                    &actor,
                    "Restored",
                    Some("Project restored from archive".to_string()),
                    now,
                );
            }
        }
        Command::UpsertReport(report) => {
            let previous = state
                .weekly_reports
                .iter()
                .find(|existing| existing.id == report.id);
            let event = report_notification(previous, &report, &actor_name(state), now);
            next.notifications = append_capped(&next.notifications, vec![event]);
            replace_by_id(&mut next.weekly_reports, report, |r| &r.id, true);
        }
        Command::DeleteReport { report_id } => {
            next.weekly_reports.retain(|report| report.id != report_id)
        }
        Command::UpsertMeeting(meeting) => {
            replace_by_id(&mut next.meetings, meeting, |m| &m.id, true);
        }
        Command::DeleteMeeting { meeting_id } => {
            next.meetings.retain(|meeting| meeting.id != meeting_id)
        }
        Command::UpsertWorkingGroup(group) => {
            replace_by_id(&mut next.working_groups, group, |g| &g.id, true);
        }
        Command::DeleteWorkingGroup { group_id } => {
            next.working_groups.retain(|group| group.id != group_id)
        }
        Command::UpsertSmartTodo(todo) => {
            replace_by_id(&mut next.smart_todos, todo, |t| &t.id, true);
        }
        Command::DeleteSmartTodo { todo_id } => next.smart_todos.retain(|todo| todo.id != todo_id),
        Command::UpdateLlmConfig { config, prompts } => {
            next.llm_config = Some(config);
            if let Some(prompts) = prompts {
                next.prompts = prompts;
            }
        }
        Command::SetSystemMessage(message) => next.system_message = message,
        Command::SetTheme(theme) => next.theme = theme,
        Command::ToggleTheme => next.theme = state.theme.toggled(),
        Command::MarkNotificationSeen { notification_id } => {
            return mark_seen(state, &notification_id, now)
        }
        Command::MarkAllNotificationsSeen => return mark_all_seen(state, now),
        Command::ImportState(raw) => {
            let mut imported = overlay_session(sanitize_app_state(raw), state);
            imported.last_updated = state.last_updated;
            return imported;
        }
    }
    next
}

fn actor_name(state: &AppState) -> String {
    state
        .current_user
        .as_ref()
        .map(User::display_name)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| UNKNOWN_ACTOR.to_string())
}

/// Replaces the entry sharing `item`'s id, appending it when `insert` is set
/// and no such entry exists.
fn replace_by_id<T>(items: &mut Vec<T>, item: T, id: impl Fn(&T) -> &String, insert: bool) {
    match items.iter().position(|existing| id(existing) == id(&item)) {
        Some(index) => items[index] = item,
        None if insert => items.push(item),
        None => {}
    }
}

fn find_project_mut<'a>(
    state: &'a mut AppState,
    team_id: &str,
    project_id: &str,
) -> Option<&'a mut Project> {
    state
        .teams
        .iter_mut()
        .find(|team| team.id == team_id)?
        .projects
        .iter_mut()
        .find(|project| project.id == project_id)
}

/// Prepends an audit entry, keeping the newest `AUDIT_LOG_CAP`.
pub fn record_audit(
    project: &mut Project,
    actor: &str,
    action: &str,
    details: Option<String>,
    now: DateTime<Utc>,
) {
    project.audit_log.insert(
        0,
        AuditEntry {
            id: Uuid::new_v4().to_string(),
            date: now.to_rfc3339(),
            user_name: actor.to_string(),
            action: action.to_string(),
            details,
        },
    );
    project.audit_log.truncate(AUDIT_LOG_CAP);
}

fn update_team(state: &AppState, team: Team, now: DateTime<Utc>) -> AppState {
    let mut next = state.clone();
    let actor = actor_name(state);

    let Some(index) = state.teams.iter().position(|existing| existing.id == team.id) else {
        let events = team_change_notifications(None, &team, &actor, now);
        next.notifications = append_capped(&next.notifications, events);
        next.teams.push(team);
        return next;
    };

    let original = &state.teams[index];
    let hidden: Vec<Project> = original
        .projects
        .iter()
        .filter(|project| !team.projects.iter().any(|visible| visible.id == project.id))
        .cloned()
        .collect();

    let events = team_change_notifications(Some(original), &team, &actor, now);
    next.notifications = append_capped(&next.notifications, events);

    let mut merged = team;
    merged.projects.extend(hidden);
    next.teams[index] = merged;
    next
}

fn transfer_project(
    state: &AppState,
    from_team_id: &str,
    project_id: &str,
    to_team_id: &str,
    now: DateTime<Utc>,
) -> AppState {
    if from_team_id == to_team_id || state.find_team(to_team_id).is_none() {
        return state.clone();
    }
    let Some(from_team) = state.find_team(from_team_id) else {
        return state.clone();
    };
    let Some(project) = from_team.projects.iter().find(|p| p.id == project_id) else {
        return state.clone();
    };

    let mut moved = project.clone();
    record_audit(
        &mut moved,
        &actor_name(state),
        "Transferred",
        Some(format!("Moved from team {from_team_id} to team {to_team_id}")),
        now,
    );

    let mut next = state.clone();
    for team in next.teams.iter_mut() {
        if team.id == from_team_id {
            team.projects.retain(|p| p.id != project_id);
        } else if team.id == to_team_id {
            team.projects.push(moved.clone());
        }
    }
    next
}

#[cfg(test)]
mod tests {
    use super::{apply_command, Command, AUDIT_LOG_CAP};
    use crate::db::default_state;
    use crate::models::{
        AppState, NotificationType, Project, ProjectStatus, Task, TaskPriority, TaskStatus, Team,
        Theme, User, UserRole, WeeklyReport,
    };
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 8, 0, 0).single().expect("valid date")
    }

    fn project(id: &str, manager_id: &str) -> Project {
        Project {
            id: id.to_string(),
            name: id.to_uppercase(),
            description: String::new(),
            status: ProjectStatus::Active,
            manager_id: Some(manager_id.to_string()),
            deadline: String::new(),
            members: Vec::new(),
            tasks: Vec::new(),
            is_important: false,
            is_archived: false,
            completed_at: None,
            audit_log: Vec::new(),
            shared_with: Vec::new(),
            extra: Default::default(),
        }
    }

    fn team(id: &str, projects: Vec<Project>) -> Team {
        Team {
            id: id.to_string(),
            name: id.to_uppercase(),
            manager_id: "u1".to_string(),
            projects,
        }
    }

    fn signed_in() -> AppState {
        let mut state = default_state(100);
        state.current_user = state.users.first().cloned();
        state.teams = vec![
            team("t1", vec![project("p1", "u1"), project("p2", "u9")]),
            team("t2", Vec::new()),
        ];
        state
    }

    fn employee(id: &str) -> User {
        User {
            id: id.to_string(),
            uid: id.to_string(),
            first_name: "New".to_string(),
            last_name: "Hire".to_string(),
            function_title: String::new(),
            role: UserRole::Employee,
            manager_id: Some("u1".to_string()),
            avatar_url: None,
            password: None,
            location: None,
            extra: Default::default(),
        }
    }

    #[test]
    fn user_commands_add_update_and_delete() {
        let state = signed_in();
        let added = apply_command(&state, Command::AddUser(employee("u2")), now());
        assert_eq!(added.users.len(), 2);

        let duplicate = apply_command(&added, Command::AddUser(employee("u2")), now());
        assert_eq!(duplicate.users.len(), 2);

        let mut renamed = employee("u2");
        renamed.first_name = "Renamed".to_string();
        let updated = apply_command(&added, Command::UpdateUser(renamed), now());
        assert_eq!(updated.users[1].first_name, "Renamed");

        let with_password = apply_command(
            &updated,
            Command::SetUserPassword {
                user_id: "u2".to_string(),
                password: "hunter2".to_string(),
            },
            now(),
        );
        assert_eq!(with_password.users[1].password.as_deref(), Some("hunter2"));

        let removed = apply_command(
            &with_password,
            Command::DeleteUser {
                user_id: "u2".to_string(),
            },
            now(),
        );
        assert_eq!(removed.users.len(), 1);
    }

    #[test]
    fn missing_targets_are_no_ops() {
        let state = signed_in();
        let commands = vec![
            Command::UpdateUser(employee("ghost")),
            Command::DeleteTeam {
                team_id: "nope".to_string(),
            },
            Command::ArchiveProject {
                team_id: "t1".to_string(),
                project_id: "nope".to_string(),
            },
            Command::TransferProject {
                from_team_id: "nope".to_string(),
                project_id: "p1".to_string(),
                to_team_id: "t2".to_string(),
            },
            Command::TransferProject {
                from_team_id: "t1".to_string(),
                project_id: "p1".to_string(),
                to_team_id: "nope".to_string(),
            },
            Command::MarkNotificationSeen {
                notification_id: "nope".to_string(),
            },
        ];
        for command in commands {
            let name = command.name();
            assert_eq!(apply_command(&state, command, now()), state, "{name} changed state");
        }
    }

    #[test]
    fn update_team_keeps_projects_hidden_from_the_caller() {
        let state = signed_in();
        let mut visible = team("t1", vec![project("p1", "u1")]);
        visible.name = "Renamed".to_string();
        visible.projects[0].status = ProjectStatus::Paused;

        let next = apply_command(&state, Command::UpdateTeam(visible), now());
        let updated = &next.teams[0];
        assert_eq!(updated.name, "Renamed");
        let ids: Vec<&str> = updated.projects.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);
        assert_eq!(updated.projects[0].status, ProjectStatus::Paused);

        assert_eq!(next.notifications.len(), 1);
        assert_eq!(next.notifications[0].r#type, NotificationType::ProjectUpdated);
        assert_eq!(next.notifications[0].triggered_by.as_deref(), Some("System Admin"));
    }

    #[test]
    fn update_team_notifies_about_new_tasks() {
        let state = signed_in();
        let mut visible = state.teams[0].clone();
        visible.projects[1].tasks.push(Task {
            id: "task-1".to_string(),
            title: "Write docs".to_string(),
            description: String::new(),
            status: TaskStatus::Todo,
            priority: TaskPriority::High,
            assignee_id: None,
            eta: String::new(),
            weight: 1.0,
            is_important: false,
            extra: Default::default(),
        });

        let next = apply_command(&state, Command::UpdateTeam(visible), now());
        assert_eq!(next.notifications.len(), 1);
        assert_eq!(next.notifications[0].r#type, NotificationType::TaskCreated);
        assert_eq!(next.notifications[0].related_id.as_deref(), Some("task-1"));
    }

    #[test]
    fn unknown_team_update_appends_it() {
        let state = signed_in();
        let next = apply_command(&state, Command::UpdateTeam(team("t3", vec![project("p3", "u1")])), now());
        assert_eq!(next.teams.len(), 3);
        assert_eq!(next.notifications[0].r#type, NotificationType::ProjectCreated);
    }

    #[test]
    fn archive_and_restore_record_audit_entries() {
        let state = signed_in();
        let archived = apply_command(
            &state,
            Command::ArchiveProject {
                team_id: "t1".to_string(),
                project_id: "p1".to_string(),
            },
            now(),
        );
        let project = &archived.teams[0].projects[0];
        assert!(project.is_archived);
        assert_eq!(project.status, ProjectStatus::Done);
        assert_eq!(project.completed_at.as_deref(), Some("2026-10-16"));
        assert_eq!(project.audit_log[0].action, "Archived");

        let restored = apply_command(
            &archived,
            Command::RestoreProject {
                team_id: "t1".to_string(),
                project_id: "p1".to_string(),
            },
            now(),
        );
        let project = &restored.teams[0].projects[0];
        assert!(!project.is_archived);
        assert_eq!(project.status, ProjectStatus::Active);
        assert!(project.completed_at.is_none());
        assert_eq!(project.audit_log[0].action, "Restored");
        assert_eq!(project.audit_log[1].action, "Archived");
    }

    #[test]
    fn audit_log_is_capped_newest_first() {
        let mut state = signed_in();
        for _ in 0..(AUDIT_LOG_CAP + 5) {
            state = apply_command(
                &state,
                Command::ArchiveProject {
                    team_id: "t1".to_string(),
                    project_id: "p1".to_string(),
                },
                now(),
            );
        }
        state = apply_command(
            &state,
            Command::RestoreProject {
                team_id: "t1".to_string(),
                project_id: "p1".to_string(),
            },
            now(),
        );
        let log = &state.teams[0].projects[0].audit_log;
        assert_eq!(log.len(), AUDIT_LOG_CAP);
        assert_eq!(log[0].action, "Restored");
    }

    #[test]
    fn transfer_and_delete_project() {
        let state = signed_in();
        let moved = apply_command(
            &state,
            Command::TransferProject {
                from_team_id: "t1".to_string(),
                project_id: "p2".to_string(),
                to_team_id: "t2".to_string(),
            },
            now(),
        );
        assert_eq!(moved.teams[0].projects.len(), 1);
        assert_eq!(moved.teams[1].projects[0].id, "p2");
        assert_eq!(moved.teams[1].projects[0].audit_log[0].action, "Transferred");

        let deleted = apply_command(
            &moved,
            Command::DeleteProject {
                team_id: "t2".to_string(),
                project_id: "p2".to_string(),
            },
            now(),
        );
        assert!(deleted.teams[1].projects.is_empty());
    }

    #[test]
    fn report_upsert_notifies_admins() {
        let state = signed_in();
        let report = WeeklyReport {
            id: "r1".to_string(),
            user_id: "u1".to_string(),
            week_of: "2026-10-12".to_string(),
            main_success: "Shipped".to_string(),
            main_issue: String::new(),
            incident: String::new(),
            orga_point: String::new(),
            updated_at: now().to_rfc3339(),
            is_archived: false,
            extra: Default::default(),
        };

        let created = apply_command(&state, Command::UpsertReport(report.clone()), now());
        assert_eq!(created.weekly_reports.len(), 1);
        assert_eq!(created.notifications[0].r#type, NotificationType::ReportCreated);

        let updated = apply_command(&created, Command::UpsertReport(report), now());
        assert_eq!(updated.weekly_reports.len(), 1);
        assert_eq!(updated.notifications[1].r#type, NotificationType::ReportUpdated);
    }

    #[test]
    fn theme_commands_are_local_only() {
        let state = signed_in();
        assert!(Command::ToggleTheme.is_local_only());
        assert!(!Command::DeleteTeam { team_id: "t1".to_string() }.is_local_only());

        let toggled = apply_command(&state, Command::ToggleTheme, now());
        assert_eq!(toggled.theme, Theme::Dark);
        let set = apply_command(&toggled, Command::SetTheme(Theme::Light), now());
        assert_eq!(set.theme, Theme::Light);
    }

    #[test]
    fn import_sanitizes_and_keeps_session() {
        let state = signed_in();
        let imported = apply_command(
            &state,
            Command::ImportState(json!({
                "users": [{ "id": "x1", "role": "Manager" }, { "id": 7 }],
                "teams": [],
                "lastUpdated": 1
            })),
            now(),
        );
        assert_eq!(imported.users.len(), 1);
        assert!(imported.teams.is_empty());
        assert_eq!(imported.current_user, state.current_user);
        assert_eq!(imported.last_updated, state.last_updated);
    }

    #[test]
    fn commands_use_tagged_camel_case_json() {
        let command: Command = serde_json::from_value(json!({
            "type": "transferProject",
            "payload": { "fromTeamId": "t1", "projectId": "p1", "toTeamId": "t2" }
        }))
        .expect("decode");
        assert_eq!(
            command,
            Command::TransferProject {
                from_team_id: "t1".to_string(),
                project_id: "p1".to_string(),
                to_team_id: "t2".to_string(),
            }
        );

        let encoded = serde_json::to_value(Command::ToggleTheme).expect("encode");
        assert_eq!(encoded, json!({ "type": "toggleTheme" }));
    }
}
