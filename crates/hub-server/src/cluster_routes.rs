use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};

use hub_cluster::component_update::ComponentUpdateOperation;
use hub_cluster::instruction::{CursorSnapshot, InstructionStats};
use hub_cluster::operation::OperationRecord;
use hub_cluster::status::{ClusterSnapshot, FollowerExecutionStatus};
use hub_cluster::{ClusterContext, LocalEngine};
use hub_store::CoordinationStore;
use hub_types::{NodeId, ProjectStatus};

use crate::convert::{ns_to_rfc3339, ApiError};

const DEFAULT_HISTORY: usize = 20;

type Ctx<S, E> = State<Arc<ClusterContext<S, E>>>;

pub fn router<S: CoordinationStore, E: LocalEngine>(ctx: Arc<ClusterContext<S, E>>) -> Router {
    Router::new()
        .route("/cluster/status", get(cluster_status::<S, E>))
        .route("/cluster/project-states", get(project_states::<S, E>))
        .route("/cluster/instructions/stats", get(instruction_stats::<S, E>))
        .route("/cluster/followers/execution", get(follower_execution::<S, E>))
        .route("/cluster/updates", get(updates::<S, E>))
        .with_state(ctx)
}

#[derive(serde::Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    snapshot: ClusterSnapshot,
    cursor: CursorSnapshot,
}

async fn cluster_status<S: CoordinationStore, E: LocalEngine>(
    State(ctx): Ctx<S, E>,
) -> Result<Json<StatusResponse>, ApiError> {
    let snapshot = ctx.status().snapshot().await?;
    let cursor = ctx.instructions().cursor().await;
    Ok(Json(StatusResponse { snapshot, cursor }))
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ProjectStateEntry {
    pub project: String,
    pub status: Option<ProjectStatus>,
    /// RFC3339, when the project entered its current status.
    pub status_changed_at: Option<String>,
    pub expected_running: bool,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ProjectStatesResponse {
    pub self_id: NodeId,
    pub nodes: BTreeMap<NodeId, Vec<ProjectStateEntry>>,
}

async fn project_states<S: CoordinationStore, E: LocalEngine>(
    State(ctx): Ctx<S, E>,
) -> Result<Json<ProjectStatesResponse>, ApiError> {
    let snapshot = ctx.status().snapshot().await?;
    let nodes = snapshot
        .nodes
        .into_iter()
        .map(|node| {
            let entries = node
                .projects
                .into_iter()
                .map(|p| ProjectStateEntry {
                    project: p.id,
                    status: p.status,
                    status_changed_at: p.status_changed_at_ns.and_then(ns_to_rfc3339),
                    expected_running: p.expected_running,
                })
                .collect();
            (node.id, entries)
        })
        .collect();
    Ok(Json(ProjectStatesResponse { self_id: snapshot.self_id, nodes }))
}

async fn instruction_stats<S: CoordinationStore, E: LocalEngine>(
    State(ctx): Ctx<S, E>,
) -> Result<Json<InstructionStats>, ApiError> {
    ctx.status().require_leader().await?;
    Ok(Json(ctx.instructions().stats().await?))
}

async fn follower_execution<S: CoordinationStore, E: LocalEngine>(
    State(ctx): Ctx<S, E>,
) -> Result<Json<FollowerExecutionStatus>, ApiError> {
    Ok(Json(ctx.status().follower_execution().await?))
}

#[derive(Debug, serde::Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(serde::Serialize)]
struct UpdatesResponse {
    active: Vec<ComponentUpdateOperation>,
    recent: Vec<OperationRecord>,
}

async fn updates<S: CoordinationStore, E: LocalEngine>(
    State(ctx): Ctx<S, E>,
    Query(query): Query<HistoryQuery>,
) -> Json<UpdatesResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY);
    Json(UpdatesResponse {
        active: ctx.updates().active_operations().await,
        recent: ctx.updates().archive().recent(limit).await,
    })
}
