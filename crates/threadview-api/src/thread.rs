use std::future::{ready, Ready};
use std::sync::Arc;

use anyhow::anyhow;
use serde::Serialize;
use threadview_core::{
    build_thread, create_pipeline, finalize_thread, no_rules, uri_host, Composer, HydrationBundle,
    PostInfo, PostThread, RelevantIds, ThreadError, ThreadParams, ThreadView, ThreadgateInfo,
};
use tracing::{debug, warn};

use crate::collaborators::{ActorPresenter, EntityHydrator, GatePolicy, RevisionSource, RowStore};

/// Collaborators shared read-only by every stage of one request.
#[derive(Clone)]
pub struct ThreadContext {
    pub rows: Arc<dyn RowStore>,
    pub hydrator: Arc<dyn EntityHydrator>,
    pub gate_policy: Arc<dyn GatePolicy>,
    pub actors: Arc<dyn ActorPresenter>,
    pub revisions: Arc<dyn RevisionSource>,
}

#[derive(Debug, Clone)]
pub struct SkeletonState {
    pub params: ThreadParams,
    pub thread: PostThread,
}

#[derive(Debug, Clone)]
pub struct HydrationState {
    pub params: ThreadParams,
    pub thread: PostThread,
    pub bundle: HydrationBundle,
    pub viewer_can_reply: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ThreadOutput {
    pub thread: ThreadView,
}

/// Composed thread plus the viewer's repo revision when it could be read.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ThreadResponse {
    pub thread: ThreadView,
    #[serde(skip)]
    pub repo_rev: Option<String>,
}

/// Fetch the thread around `params.uri` and render it for the viewer.
///
/// The revision lookup runs alongside the whole pipeline; its failure is
/// dropped while a pipeline failure is returned unchanged.
///
/// # Errors
/// Returns [`ThreadError::NotFound`] when the anchor is missing or
/// unrenderable, and [`ThreadError::Collaborator`] when a store, hydration or
/// gate-policy call fails.
pub async fn get_post_thread(
    ctx: &ThreadContext,
    params: ThreadParams,
) -> Result<ThreadResponse, ThreadError> {
    let pipeline = create_pipeline(
        skeleton,
        hydration,
        no_rules::<HydrationState, ThreadContext, ThreadError>,
        presentation,
    );
    let uri = params.uri.clone();
    let viewer = params.viewer.clone();

    let (result, repo_rev) = tokio::join!(
        pipeline.run(params, ctx),
        ctx.revisions.repo_revision(viewer.as_deref()),
    );

    let repo_rev = repo_rev.unwrap_or_else(|err| {
        debug!(error = %err, "repo revision lookup failed; omitting");
        None
    });
    match result {
        Ok(output) => Ok(ThreadResponse { thread: output.thread, repo_rev }),
        Err(err) => {
            if matches!(err, ThreadError::NotFound(_)) {
                debug!(uri = %uri, "thread anchor not found");
            } else {
                warn!(uri = %uri, error = %err, "post thread pipeline failed");
            }
            Err(err)
        }
    }
}

async fn skeleton(params: ThreadParams, ctx: &ThreadContext) -> Result<SkeletonState, ThreadError> {
    let (ancestors, descendants) = tokio::try_join!(
        ctx.rows.fetch_ancestors(&params.uri, params.parent_height),
        ctx.rows.fetch_descendants(&params.uri, params.depth),
    )?;
    let thread = build_thread(
        &params.uri,
        &ancestors,
        &descendants,
        params.parent_height,
        params.depth,
    )
    .ok_or_else(|| ThreadError::NotFound(params.uri.clone()))?;
    debug!(uri = %params.uri, nodes = thread.node_count(), "thread skeleton built");
    Ok(SkeletonState { params, thread })
}

async fn hydration(
    state: SkeletonState,
    ctx: &ThreadContext,
) -> Result<HydrationState, ThreadError> {
    let SkeletonState { params, thread } = state;
    let relevant = RelevantIds::collect(&thread);
    let bundle = ctx.hydrator.hydrate(&relevant, params.viewer.as_deref()).await?;
    let viewer_can_reply = check_viewer_can_reply(
        ctx.gate_policy.as_ref(),
        &bundle,
        params.viewer.as_deref(),
        &thread,
    )
    .await?;
    Ok(HydrationState { params, thread, bundle, viewer_can_reply })
}

/// Whether the viewer may reply to the anchor, judged once against the root.
async fn check_viewer_can_reply(
    gate_policy: &dyn GatePolicy,
    bundle: &HydrationBundle,
    viewer: Option<&str>,
    thread: &PostThread,
) -> Result<bool, ThreadError> {
    let Some(viewer) = viewer else {
        return Ok(false);
    };
    if bundle.posts.get(thread.uri()).is_some_and(PostInfo::is_bad_reply) {
        return Ok(false);
    }
    let root_uri = thread.post.root_uri();
    let owner = uri_host(root_uri)
        .ok_or_else(|| ThreadError::Collaborator(anyhow!("thread root has no owner: {root_uri}")))?;
    let root = bundle.posts.get(root_uri).and_then(PostInfo::post_record);
    let gate = bundle.threadgates.get(root_uri).and_then(ThreadgateInfo::gate_record);
    let violates = gate_policy.violates_gate(viewer, owner, root.as_ref(), gate.as_ref()).await?;
    Ok(!violates)
}

fn presentation(
    state: HydrationState,
    ctx: &ThreadContext,
) -> Ready<Result<ThreadOutput, ThreadError>> {
    let viewer = state.params.viewer.as_deref();
    let dids = state.bundle.profiles.keys().cloned().collect::<Vec<_>>();
    let actors = ctx.actors.present(&dids, &state.bundle, viewer);
    let composer = Composer { anchor_uri: state.thread.uri(), bundle: &state.bundle, actors: &actors };
    let thread = composer.compose(&state.thread);
    ready(
        finalize_thread(thread, &state.params.uri, viewer, state.viewer_can_reply)
            .map(|thread| ThreadOutput { thread }),
    )
}
