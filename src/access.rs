use crate::models::{AppState, Meeting, Project, Team, User, WorkingGroup};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Every user reachable from `root_id` by following `managerId` edges
/// downward, excluding `root_id` itself. Terminates on cyclic hierarchies.
pub fn subordinate_ids(root_id: &str, users: &[User]) -> BTreeSet<String> {
    let mut reports: HashMap<&str, Vec<&str>> = HashMap::new();
    for user in users {
        if let Some(manager_id) = user.manager_id.as_deref() {
            reports.entry(manager_id).or_default().push(user.id.as_str());
        }
    }

    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::from([root_id]);
    while let Some(current) = queue.pop_front() {
        let Some(direct) = reports.get(current) else {
            continue;
        };
        for report in direct {
            if *report != root_id && visited.insert(report.to_string()) {
                queue.push_back(*report);
            }
        }
    }
    visited
}

/// The set of users whose data a non-admin viewer may see.
#[derive(Debug, Clone)]
pub struct AccessScope {
    viewer_id: String,
    accessible: BTreeSet<String>,
}

impl AccessScope {
    pub fn new(viewer_id: &str, users: &[User]) -> Self {
        let mut accessible = subordinate_ids(viewer_id, users);
        accessible.insert(viewer_id.to_string());
        Self {
            viewer_id: viewer_id.to_string(),
            accessible,
        }
    }

    pub fn includes(&self, user_id: &str) -> bool {
        self.accessible.contains(user_id)
    }

    pub fn sees_team_in_full(&self, team: &Team) -> bool {
        self.includes(&team.manager_id)
    }

    pub fn sees_project(&self, project: &Project) -> bool {
        let manages = project
            .manager_id
            .as_deref()
            .is_some_and(|manager_id| self.includes(manager_id));
        manages
            || project.members.iter().any(|member| self.includes(&member.user_id))
            || project.shared_with.iter().any(|id| id == &self.viewer_id)
    }

    fn sees_meeting(&self, meeting: &Meeting) -> bool {
        meeting.attendees.iter().any(|id| self.includes(id))
            || meeting
                .action_items
                .iter()
                .any(|item| self.includes(&item.owner_id))
    }

    fn sees_working_group(&self, group: &WorkingGroup, teams: &[Team]) -> bool {
        if group.member_ids.iter().any(|id| id == &self.viewer_id) {
            return true;
        }
        let Some(project_id) = group.project_id.as_deref() else {
            return false;
        };
        teams.iter().any(|team| {
            team.projects.iter().any(|project| {
                project.id == project_id
                    && (project.manager_id.as_deref() == Some(self.viewer_id.as_str())
                        || project.has_member(&self.viewer_id)
                        || team.manager_id == self.viewer_id)
            })
        })
    }

    fn filter_team(&self, team: &Team) -> Option<Team> {
        if self.sees_team_in_full(team) {
            return Some(team.clone());
        }
        let projects: Vec<Project> = team
            .projects
            .iter()
            .filter(|project| self.sees_project(project))
            .cloned()
            .collect();
        if projects.is_empty() {
            return None;
        }
        Some(Team {
            projects,
            ..team.clone()
        })
    }
}

/// The subset of `state` visible to its `current_user`.
///
/// Admins and anonymous sessions see the full document. Smart todos are
/// always narrowed to the viewer's own, for every role.
pub fn filter_state(state: &AppState) -> AppState {
    let viewer = state.current_user.as_ref();
    let viewer_id = viewer.map(|user| user.id.as_str());

    let smart_todos = state
        .smart_todos
        .iter()
        .filter(|todo| Some(todo.user_id.as_str()) == viewer_id)
        .cloned()
        .collect();

    let Some(viewer) = viewer.filter(|user| !user.is_admin()) else {
        return AppState {
            smart_todos,
            ..state.clone()
        };
    };

    let scope = AccessScope::new(&viewer.id, &state.users);

    AppState {
        users: state
            .users
            .iter()
            .filter(|user| scope.includes(&user.id))
            .cloned()
            .collect(),
        teams: state
            .teams
            .iter()
            .filter_map(|team| scope.filter_team(team))
            .collect(),
        weekly_reports: state
            .weekly_reports
            .iter()
            .filter(|report| scope.includes(&report.user_id))
            .cloned()
            .collect(),
        meetings: state
            .meetings
            .iter()
            .filter(|meeting| scope.sees_meeting(meeting))
            .cloned()
            .collect(),
        working_groups: state
            .working_groups
            .iter()
            .filter(|group| scope.sees_working_group(group, &state.teams))
            .cloned()
            .collect(),
        smart_todos,
        ..state.clone()
    }
}
