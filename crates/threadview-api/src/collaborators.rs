use anyhow::Result;
use async_trait::async_trait;
use threadview_core::{
    ActorInfoMap, ActorViewerState, FeedRow, HydrationBundle, PostRecord, ProfileViewBasic,
    RelevantIds, ThreadgateRecord,
};

/// Handle shown for actors whose handle could not be verified.
pub const INVALID_HANDLE: &str = "handle.invalid";

/// Bounded reads over the denormalized post rows.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// The anchor plus up to `max_height` reply-parent hops above it.
    async fn fetch_ancestors(&self, uri: &str, max_height: u32) -> Result<Vec<FeedRow>>;

    /// Replies up to `max_depth` levels below `uri`, newest first.
    async fn fetch_descendants(&self, uri: &str, max_depth: u32) -> Result<Vec<FeedRow>>;
}

#[async_trait]
pub trait EntityHydrator: Send + Sync {
    async fn hydrate(&self, ids: &RelevantIds, viewer: Option<&str>) -> Result<HydrationBundle>;
}

#[async_trait]
pub trait GatePolicy: Send + Sync {
    /// Whether `viewer` replying to `owner`'s thread would break its reply-gate.
    async fn violates_gate(
        &self,
        viewer: &str,
        owner: &str,
        root: Option<&PostRecord>,
        gate: Option<&ThreadgateRecord>,
    ) -> Result<bool>;
}

pub trait ActorPresenter: Send + Sync {
    fn present(
        &self,
        dids: &[String],
        bundle: &HydrationBundle,
        viewer: Option<&str>,
    ) -> ActorInfoMap;
}

#[async_trait]
pub trait RevisionSource: Send + Sync {
    /// Best-effort revision of the viewer's repository.
    async fn repo_revision(&self, viewer: Option<&str>) -> Result<Option<String>>;
}

/// Formats hydrated profiles into basic actor views.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicActorPresenter;

impl ActorPresenter for BasicActorPresenter {
    fn present(
        &self,
        dids: &[String],
        bundle: &HydrationBundle,
        viewer: Option<&str>,
    ) -> ActorInfoMap {
        dids.iter()
            .filter_map(|did| bundle.profiles.get(did))
            .map(|profile| {
                let view = ProfileViewBasic {
                    did: profile.did.clone(),
                    handle: profile.handle.clone().unwrap_or_else(|| INVALID_HANDLE.to_string()),
                    display_name: profile.display_name.clone(),
                    avatar: profile.avatar.clone(),
                    viewer: viewer.map(|_| ActorViewerState {
                        muted: profile.viewer_muted,
                        blocked_by: profile.viewer_blocked_by,
                        blocking: profile.viewer_blocking.clone(),
                    }),
                    labels: bundle.labels_for(&profile.did),
                };
                (profile.did.clone(), view)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use threadview_core::{Label, ProfileInfo};

    use super::*;

    // Test IDs: TACT-001
    #[test]
    fn presenter_fills_viewer_state_only_for_viewers() {
        let mut bundle = HydrationBundle::default();
        bundle.profiles.insert(
            "did:plc:alice".to_string(),
            ProfileInfo {
                did: "did:plc:alice".to_string(),
                handle: None,
                display_name: Some("Alice".to_string()),
                avatar: None,
                viewer_muted: true,
                viewer_blocking: None,
                viewer_blocked_by: true,
            },
        );
        bundle.labels.insert(
            "did:plc:alice".to_string(),
            vec![Label {
                src: "did:plc:labeler".to_string(),
                uri: "did:plc:alice".to_string(),
                cid: None,
                val: "impersonation".to_string(),
                neg: false,
                cts: "2024-01-01T00:00:00Z".to_string(),
            }],
        );
        let dids = vec!["did:plc:alice".to_string(), "did:plc:missing".to_string()];

        let anonymous = BasicActorPresenter.present(&dids, &bundle, None);
        assert_eq!(anonymous.len(), 1);
        let alice = &anonymous["did:plc:alice"];
        assert_eq!(alice.handle, INVALID_HANDLE);
        assert!(alice.viewer.is_none());
        assert_eq!(alice.labels.len(), 1);

        let viewed = BasicActorPresenter.present(&dids, &bundle, Some("did:plc:viewer"));
        let alice = &viewed["did:plc:alice"];
        assert!(alice.is_blocked());
        assert_eq!(
            alice.viewer,
            Some(ActorViewerState { muted: true, blocked_by: true, blocking: None })
        );
    }
}
