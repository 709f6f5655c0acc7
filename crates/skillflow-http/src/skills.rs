//! Skill catalog endpoints: list the workspace view and upsert database
//! skills. Names are immutable after creation; duplicate `(workspace, name)`
//! pairs conflict.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use skillflow_core::Skill;
use skillflow_engine::SaveSkillRequest;

use crate::error::ApiError;
use crate::identity::Caller;
use crate::runs::WorkspaceQuery;
use crate::state::AppState;

pub async fn list_skills(
    State(app): State<Arc<AppState>>,
    Query(query): Query<WorkspaceQuery>,
    caller: Caller,
) -> Result<Json<Value>, ApiError> {
    let workspace = app
        .workspaces
        .resolve(&caller.id, query.workspace_id.as_deref())
        .await?;
    let skills = app
        .ctx()
        .registry
        .list(workspace.as_ref().map(|ws| ws.id.as_str()));
    Ok(Json(json!({"skills": skills, "count": skills.len()})))
}

#[derive(Debug, Deserialize)]
pub struct SkillUpsertRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub action_code: Option<String>,
    #[serde(default)]
    pub action_functions: Option<String>,
    #[serde(flatten)]
    pub skill: Skill,
}

pub async fn save_skill(
    State(app): State<Arc<AppState>>,
    caller: Caller,
    Json(req): Json<SkillUpsertRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut skill = req.skill;
    if skill.workspace_id.is_none() {
        let workspace = app.workspaces.resolve(&caller.id, None).await?;
        skill.workspace_id = workspace.map(|ws| ws.id);
    }
    skill.owner_id.get_or_insert_with(|| caller.id.clone());

    let saved = app
        .ctx()
        .registry
        .save(
            SaveSkillRequest {
                id: req.id,
                skill,
                action_code: req.action_code,
                action_functions: req.action_functions,
            },
            &app.workspaces,
        )
        .await?;
    Ok(Json(json!({"status": "saved", "skill": saved})))
}
