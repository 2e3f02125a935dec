//! Whole-document last-writer-wins on `last_updated`.
//!
//! The session fields (`current_user`, `theme`, and `llm_config` when the
//! local copy has one) always come from the local side. Disjoint concurrent
//! edits are not reconciled: the older document loses entirely.

use crate::models::AppState;

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Replaced(AppState),
    KeptLocal,
}

/// Newer-wins merge used for polls and write conflicts. Ties keep local.
pub fn merge_newer(local: &AppState, incoming: AppState) -> MergeOutcome {
    if incoming.last_updated > local.last_updated {
        MergeOutcome::Replaced(overlay_session(incoming, local))
    } else {
        MergeOutcome::KeptLocal
    }
}

/// First-load adoption: the remote copy wins regardless of clocks.
pub fn adopt_remote(local: &AppState, incoming: AppState) -> AppState {
    overlay_session(incoming, local)
}

pub fn overlay_session(incoming: AppState, local: &AppState) -> AppState {
    let mut merged = incoming;
    merged.current_user = local.current_user.clone();
    merged.theme = local.theme;
    merged.llm_config = local.llm_config.clone().or(merged.llm_config.take());
    merged
}

#[cfg(test)]
mod tests {
    use super::{adopt_remote, merge_newer, MergeOutcome};
    use crate::db::default_state;
    use crate::models::{LlmConfig, LlmProvider, Theme};

    fn signed_in(last_updated: i64) -> crate::models::AppState {
        let mut state = default_state(last_updated);
        state.current_user = state.users.first().cloned();
        state.theme = Theme::Dark;
        state
    }

    #[test]
    fn newer_document_replaces_and_keeps_session() {
        let local = signed_in(100);
        let mut remote = default_state(150);
        remote.system_message.content = "maintenance tonight".to_string();

        let MergeOutcome::Replaced(merged) = merge_newer(&local, remote) else {
            panic!("newer remote should replace local");
        };
        assert_eq!(merged.last_updated, 150);
        assert_eq!(merged.current_user, local.current_user);
        assert_eq!(merged.theme, Theme::Dark);
        assert_eq!(merged.system_message.content, "maintenance tonight");
    }

    #[test]
    fn equal_or_older_document_is_discarded() {
        let local = signed_in(150);
        assert_eq!(merge_newer(&local, default_state(150)), MergeOutcome::KeptLocal);
        assert_eq!(merge_newer(&local, default_state(140)), MergeOutcome::KeptLocal);
    }

    #[test]
    fn llm_config_falls_back_to_remote_only_when_local_has_none() {
        let mut local = signed_in(100);
        local.llm_config = None;
        let mut remote = default_state(200);
        remote.llm_config = Some(LlmConfig {
            provider: LlmProvider::N8n,
            base_url: None,
            api_key: None,
            model: "flow".to_string(),
        });

        let merged = adopt_remote(&local, remote.clone());
        assert_eq!(merged.llm_config, remote.llm_config);

        local.llm_config = Some(LlmConfig::default());
        let merged = adopt_remote(&local, remote);
        assert_eq!(merged.llm_config, Some(LlmConfig::default()));
    }

    #[test]
    fn first_load_adopts_older_remote() {
        let local = signed_in(500);
        let merged = adopt_remote(&local, default_state(100));
        assert_eq!(merged.last_updated, 100);
        assert_eq!(merged.current_user, local.current_user);
    }
}
