//! Persisted and dynamically derived notifications.
//!
//! Dynamic notifications are recomputed from the document and never stored.
//! Their ids are deterministic so dismissals recorded in `dismissedAlerts`
//! stay attached across recomputation. A dismissal only holds for the
//! calendar day (UTC) on which it was recorded.

use crate::models::{
    AppNotification, AppState, NotificationType, ProjectStatus, TargetRole, Team, User,
    WeeklyReport,
};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use uuid::Uuid;

pub const NOTIFICATION_CAP: usize = 100;
const STALE_PROJECT_DAYS: i64 = 10;
const REPORT_OVERDUE_DAYS: i64 = 8;
const REPORT_REMINDER_DAYS: i64 = 6;

/// Calendar date used for dismissals, e.g. `2026-10-16`.
pub fn today(now: DateTime<Utc>) -> String {
    now.date_naive().to_string()
}

/// Accepts RFC 3339 timestamps, naive `YYYY-MM-DDTHH:MM:SS` and bare dates.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(parsed.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
}

pub fn stale_project_key(project_id: &str, user_id: &str) -> String {
    format!("stale_project_{project_id}_{user_id}")
}

pub fn report_overdue_key(user_id: &str) -> String {
    format!("report_overdue_{user_id}")
}

/// The `dismissedAlerts` key of a dynamic notification, `None` for persisted
/// notification types.
pub fn dismissal_key(notification: &AppNotification, user_id: &str) -> Option<String> {
    match notification.r#type {
        NotificationType::StaleProject => notification
            .related_id
            .as_deref()
            .map(|project_id| stale_project_key(project_id, user_id)),
        NotificationType::ReportOverdue => Some(report_overdue_key(user_id)),
        _ => None,
    }
}

fn dismissed_today(state: &AppState, key: &str, today: &str) -> bool {
    state
        .dismissed_alerts
        .get(key)
        .is_some_and(|date| date == today)
}

/// Stale-project and overdue-report alerts for the signed-in non-admin user.
pub fn compute_dynamic_notifications(state: &AppState, now: DateTime<Utc>) -> Vec<AppNotification> {
    let Some(user) = state.current_user.as_ref().filter(|user| !user.is_admin()) else {
        return Vec::new();
    };
    let today = today(now);
    let mut alerts = stale_project_alerts(state, user, now, &today);
    alerts.extend(report_overdue_alert(state, user, now, &today));
    alerts
}

fn stale_project_alerts(
    state: &AppState,
    user: &User,
    now: DateTime<Utc>,
    today: &str,
) -> Vec<AppNotification> {
    let mut alerts = Vec::new();
    for team in &state.teams {
        for project in &team.projects {
            if project.is_archived || project.status == ProjectStatus::Done {
                continue;
            }
            let follows = project.has_member(&user.id)
                || project.manager_id.as_deref() == Some(user.id.as_str())
                || team.manager_id == user.id;
            if !follows {
                continue;
            }

            let latest = project
                .audit_log
                .iter()
                .filter_map(|entry| parse_timestamp(&entry.date))
                .max();
            let message = match latest {
                Some(latest) if now - latest <= Duration::days(STALE_PROJECT_DAYS) => continue,
                Some(latest) => format!(
                    "Project \"{}\" has had no activity for {} days",
                    project.name,
                    (now - latest).num_days()
                ),
                None => format!("Project \"{}\" has no recorded activity", project.name),
            };

            if dismissed_today(state, &stale_project_key(&project.id, &user.id), today) {
                continue;
            }
            alerts.push(dynamic_notification(
                format!("stale_{}", project.id),
                NotificationType::StaleProject,
                message,
                Some(project.id.clone()),
                user,
                now,
            ));
        }
    }
    alerts
}

fn report_overdue_alert(
    state: &AppState,
    user: &User,
    now: DateTime<Utc>,
    today: &str,
) -> Option<AppNotification> {
    let key = report_overdue_key(&user.id);
    if dismissed_today(state, &key, today) {
        return None;
    }

    let message = match latest_report_age(&state.weekly_reports, &user.id, now) {
        None => "No weekly report submitted yet".to_string(),
        Some(age) if age > Duration::days(REPORT_OVERDUE_DAYS) => format!(
            "Last weekly report was updated {} days ago",
            age.num_days()
        ),
        Some(_) => return None,
    };
    Some(dynamic_notification(
        key,
        NotificationType::ReportOverdue,
        message,
        None,
        user,
        now,
    ))
}

/// Age of the user's most recently updated report; `None` when they have none.
/// A report whose timestamp does not parse counts as infinitely old.
fn latest_report_age(reports: &[WeeklyReport], user_id: &str, now: DateTime<Utc>) -> Option<Duration> {
    let mut own = reports.iter().filter(|report| report.user_id == user_id).peekable();
    own.peek()?;
    let latest = own.filter_map(|report| parse_timestamp(&report.updated_at)).max();
    Some(latest.map_or(Duration::MAX, |latest| now - latest))
}

/// Bell-badge reminder, looser than the overdue alert and never dismissible.
pub fn show_report_reminder(state: &AppState, now: DateTime<Utc>) -> bool {
    let Some(user) = state.current_user.as_ref() else {
        return false;
    };
    match latest_report_age(&state.weekly_reports, &user.id, now) {
        None => true,
        Some(age) => age > Duration::days(REPORT_REMINDER_DAYS),
    }
}

fn dynamic_notification(
    id: String,
    kind: NotificationType,
    message: String,
    related_id: Option<String>,
    user: &User,
    now: DateTime<Utc>,
) -> AppNotification {
    AppNotification {
        id,
        r#type: kind,
        message,
        details: None,
        related_id,
        triggered_by: None,
        target_role: TargetRole::User,
        target_user_id: Some(user.id.clone()),
        created_at: now.to_rfc3339(),
        seen_by: Vec::new(),
    }
}

fn is_addressed_to(notification: &AppNotification, user: &User) -> bool {
    match notification.target_role {
        TargetRole::Admin => user.is_admin(),
        TargetRole::User => notification.target_user_id.as_deref() == Some(user.id.as_str()),
    }
}

/// Persisted notifications addressed to the signed-in user and not yet seen.
pub fn unseen_persisted(state: &AppState) -> Vec<&AppNotification> {
    let Some(user) = state.current_user.as_ref() else {
        return Vec::new();
    };
    state
        .notifications
        .iter()
        .filter(|notification| is_addressed_to(notification, user))
        .filter(|notification| !notification.seen_by.contains(&user.id))
        .collect()
}

pub fn unseen_count(state: &AppState, dynamic: &[AppNotification]) -> usize {
    unseen_persisted(state).len() + dynamic.len()
}

/// Marks one notification seen by the signed-in user. Persisted ones record
/// the user in `seenBy`; dynamic ones are dismissed for today.
pub fn mark_seen(state: &AppState, notification_id: &str, now: DateTime<Utc>) -> AppState {
    let Some(user) = state.current_user.clone() else {
        return state.clone();
    };
    let mut next = state.clone();

    if let Some(notification) = next
        .notifications
        .iter_mut()
        .find(|notification| notification.id == notification_id)
    {
        if !notification.seen_by.contains(&user.id) {
            notification.seen_by.push(user.id.clone());
        }
        return next;
    }

    let dismissal = compute_dynamic_notifications(state, now)
        .into_iter()
        .find(|notification| notification.id == notification_id)
        .and_then(|notification| dismissal_key(&notification, &user.id));
    if let Some(key) = dismissal {
        next.dismissed_alerts.insert(key, today(now));
    }
    next
}

pub fn mark_all_seen(state: &AppState, now: DateTime<Utc>) -> AppState {
    let Some(user) = state.current_user.clone() else {
        return state.clone();
    };
    let mut next = state.clone();

    for notification in next.notifications.iter_mut() {
        if is_addressed_to(notification, &user) && !notification.seen_by.contains(&user.id) {
            notification.seen_by.push(user.id.clone());
        }
    }
    for notification in compute_dynamic_notifications(state, now) {
        if let Some(key) = dismissal_key(&notification, &user.id) {
            next.dismissed_alerts.insert(key, today(now));
        }
    }
    next
}

/// Appends `fresh` and keeps the most recent `NOTIFICATION_CAP` entries.
pub fn append_capped(existing: &[AppNotification], fresh: Vec<AppNotification>) -> Vec<AppNotification> {
    let mut all: Vec<AppNotification> = existing.iter().cloned().chain(fresh).collect();
    if all.len() > NOTIFICATION_CAP {
        all.drain(..all.len() - NOTIFICATION_CAP);
    }
    all
}

fn admin_notification(
    kind: NotificationType,
    message: String,
    details: Option<String>,
    related_id: &str,
    actor: &str,
    now: DateTime<Utc>,
) -> AppNotification {
    AppNotification {
        id: Uuid::new_v4().to_string(),
        r#type: kind,
        message,
        details,
        related_id: Some(related_id.to_string()),
        triggered_by: Some(actor.to_string()),
        target_role: TargetRole::Admin,
        target_user_id: None,
        created_at: now.to_rfc3339(),
        seen_by: Vec::new(),
    }
}

/// One notification per new project, project status change, new task and
/// task status change between `original` and `updated`.
pub fn team_change_notifications(
    original: Option<&Team>,
    updated: &Team,
    actor: &str,
    now: DateTime<Utc>,
) -> Vec<AppNotification> {
    let mut events = Vec::new();
    for project in &updated.projects {
        let previous = original.and_then(|team| team.projects.iter().find(|p| p.id == project.id));
        let Some(previous) = previous else {
            events.push(admin_notification(
                NotificationType::ProjectCreated,
                format!("New project \"{}\" in team {}", project.name, updated.name),
                None,
                &project.id,
                actor,
                now,
            ));
            continue;
        };

        if previous.status != project.status {
            events.push(admin_notification(
                NotificationType::ProjectUpdated,
                format!("Project \"{}\" is now {}", project.name, project.status.as_str()),
                Some(format!(
                    "{} -> {}",
                    previous.status.as_str(),
                    project.status.as_str()
                )),
                &project.id,
                actor,
                now,
            ));
        }

        for task in &project.tasks {
            match previous.tasks.iter().find(|t| t.id == task.id) {
                None => events.push(admin_notification(
                    NotificationType::TaskCreated,
                    format!("New task \"{}\" in project \"{}\"", task.title, project.name),
                    None,
                    &task.id,
                    actor,
                    now,
                )),
                Some(before) if before.status != task.status => events.push(admin_notification(
                    NotificationType::TaskUpdated,
                    format!("Task \"{}\" is now {}", task.title, task.status.as_str()),
                    Some(format!("{} -> {}", before.status.as_str(), task.status.as_str())),
                    &task.id,
                    actor,
                    now,
                )),
                Some(_) => {}
            }
        }
    }
    events
}

pub fn report_notification(
    previous: Option<&WeeklyReport>,
    report: &WeeklyReport,
    actor: &str,
    now: DateTime<Utc>,
) -> AppNotification {
    let (kind, verb) = if previous.is_some() {
        (NotificationType::ReportUpdated, "updated")
    } else {
        (NotificationType::ReportCreated, "submitted")
    };
    admin_notification(
        kind,
        format!("{actor} {verb} the weekly report for {}", report.week_of),
        None,
        &report.id,
        actor,
        now,
    )
}
