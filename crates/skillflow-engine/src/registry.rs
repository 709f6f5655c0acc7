//! The merged skill catalog.
//!
//! Two sources, loaded in order: filesystem manifests (public, immutable at
//! runtime) and rows from the `dynamic_skills` table. Both land in one map
//! keyed by module name (`fs.{name}` for filesystem entries,
//! `{workspace_code}.{slug}` for persistent entries), so the sources never
//! collide. The catalog publishes via copy-on-write: reads are lock-free
//! snapshots, writes swap the whole map.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use skillflow_core::{slug, ActionType, ExecutorKind, Skill, SkillSource};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::actions::ActionRegistry;
use crate::errors::{EngineError, Result};
use crate::manifest::load_skill_dir;
use crate::workspaces::WorkspaceDirectory;

/// Payload for creating or updating a database skill.
#[derive(Debug, Clone)]
pub struct SaveSkillRequest {
    /// Present for updates; name is immutable once created.
    pub id: Option<String>,
    pub skill: Skill,
    /// Inline action function source (compiled at save and load).
    pub action_code: Option<String>,
    /// Pipeline helper functions source.
    pub action_functions: Option<String>,
}

pub struct SkillRegistry {
    skills_dir: Option<PathBuf>,
    db: Option<SqlitePool>,
    actions: Arc<ActionRegistry>,
    catalog: RwLock<Arc<BTreeMap<String, Skill>>>,
}

impl SkillRegistry {
    pub fn new(skills_dir: Option<PathBuf>, db: Option<SqlitePool>, actions: Arc<ActionRegistry>) -> Self {
        Self { skills_dir, db, actions, catalog: RwLock::new(Arc::new(BTreeMap::new())) }
    }

    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    /// Compile UI-authored action source into a callable registered under
    /// `{module}.{function}`.
    pub fn register_inline_code(&self, module: &str, function: &str, code: &str) -> Result<()> {
        self.actions.register_inline_code(module, function, code)
    }

    /// Compile pipeline helper source; every top-level function becomes
    /// callable from `transform` steps.
    pub fn register_pipeline_helpers(&self, module: &str, code: &str) -> Result<usize> {
        self.actions.register_pipeline_helpers(module, code)
    }

    pub async fn setup(&self) -> Result<()> {
        if let Some(pool) = &self.db {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS dynamic_skills (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    module_name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    requires TEXT NOT NULL DEFAULT '[]',
                    produces TEXT NOT NULL DEFAULT '[]',
                    optional_produces TEXT NOT NULL DEFAULT '[]',
                    executor TEXT NOT NULL DEFAULT 'llm',
                    hitl_enabled INTEGER NOT NULL DEFAULT 0,
                    prompt TEXT,
                    system_prompt TEXT,
                    llm_model TEXT,
                    rest_config TEXT,
                    action_config TEXT,
                    action_code TEXT,
                    action_functions TEXT,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    workspace_id TEXT NOT NULL,
                    owner_id TEXT,
                    is_public INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE (workspace_id, name),
                    UNIQUE (workspace_id, module_name)
                )
                "#,
            )
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    /// Atomically rebuild the catalog from both sources. A single malformed
    /// skill is logged and skipped; inline-code compile failures leave the
    /// skill present in a degraded state.
    pub async fn reload(&self) -> Result<()> {
        let mut catalog: BTreeMap<String, Skill> = BTreeMap::new();

        if let Some(dir) = &self.skills_dir {
            for skill in self.load_filesystem(dir) {
                if catalog.contains_key(&skill.module_name) {
                    tracing::warn!(name = %skill.name, "duplicate filesystem skill name; skipped");
                    continue;
                }
                catalog.insert(skill.module_name.clone(), skill);
            }
        }

        for skill in self.load_database().await? {
            catalog.insert(skill.module_name.clone(), skill);
        }

        tracing::info!(count = catalog.len(), "skill catalog loaded");
        *self.catalog.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(catalog);
        Ok(())
    }

    fn load_filesystem(&self, base_dir: &Path) -> Vec<Skill> {
        let mut skills = Vec::new();
        let entries = match std::fs::read_dir(base_dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(dir = %base_dir.display(), error = %err, "skills directory not readable");
                return skills;
            }
        };
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() || !dir.join("skill.md").exists() {
                continue;
            }
            match load_skill_dir(&dir) {
                Ok((mut skill, siblings)) => {
                    skill.module_name = format!("fs.{}", skill.name);
                    self.absolutize_action_paths(&mut skill, &dir);
                    self.register_skill_code(
                        &mut skill,
                        siblings.action_code.as_deref(),
                        siblings.transforms_code.as_deref(),
                    );
                    skills.push(skill);
                }
                Err(err) => {
                    tracing::warn!(dir = %dir.display(), error = %err, "skipping malformed skill");
                }
            }
        }
        skills
    }

    fn absolutize_action_paths(&self, skill: &mut Skill, dir: &Path) {
        if let Some(action) = skill.action.as_mut() {
            if let Some(script) = action.script_path.as_mut() {
                if !Path::new(script.as_str()).is_absolute() {
                    *script = dir.join(script.as_str()).to_string_lossy().into_owned();
                }
            }
            if let Some(config) = action.db_config_file.as_mut() {
                if !Path::new(config.as_str()).is_absolute() {
                    *config = dir.join(config.as_str()).to_string_lossy().into_owned();
                }
            }
        }
    }

    /// Compile attached source into the action registry. Failures degrade the
    /// skill instead of dropping it, so it stays visible and editable.
    fn register_skill_code(&self, skill: &mut Skill, action_code: Option<&str>, helpers: Option<&str>) {
        let module = skill.module_name.clone();
        if let Some(code) = action_code {
            let function = skill
                .action
                .as_mut()
                .filter(|a| a.kind == ActionType::Function)
                .map(|action| {
                    if action.module.is_none() {
                        action.module = Some(module.clone());
                    }
                    action.function.clone().unwrap_or_else(|| "run".to_string())
                });
            if let Some(function) = function {
                if let Err(err) = self.actions.register_inline_code(&module, &function, code) {
                    tracing::warn!(skill = %skill.name, error = %err, "inline action failed to compile");
                    skill.compile_error = Some(err.to_string());
                }
            }
        }
        if let Some(code) = helpers {
            if let Err(err) = self.actions.register_pipeline_helpers(&module, code) {
                tracing::warn!(skill = %skill.name, error = %err, "pipeline helpers failed to compile");
                skill.compile_error.get_or_insert_with(|| err.to_string());
            }
        }
    }

    async fn load_database(&self) -> Result<Vec<Skill>> {
        let Some(pool) = &self.db else { return Ok(Vec::new()) };
        let rows = sqlx::query("SELECT * FROM dynamic_skills WHERE enabled = 1")
            .fetch_all(pool)
            .await?;
        let mut skills = Vec::new();
        for row in rows {
            match self.row_to_skill(&row) {
                Ok(skill) => skills.push(skill),
                Err(err) => {
                    let name: String = row.get("name");
                    tracing::warn!(name = %name, error = %err, "skipping invalid database skill");
                }
            }
        }
        Ok(skills)
    }

    fn row_to_skill(&self, row: &sqlx::sqlite::SqliteRow) -> Result<Skill> {
        let executor: String = row.get("executor");
        let executor = match executor.as_str() {
            "llm" => ExecutorKind::Llm,
            "rest" => ExecutorKind::Rest,
            "action" => ExecutorKind::Action,
            other => return Err(EngineError::InvalidSkill(format!("unknown executor '{other}'"))),
        };
        let parse_set = |raw: String| -> Result<std::collections::BTreeSet<String>> {
            serde_json::from_str(&raw).map_err(EngineError::from)
        };
        let rest_config: Option<String> = row.get("rest_config");
        let action_config: Option<String> = row.get("action_config");

        let mut skill = Skill {
            name: row.get("name"),
            description: row.get("description"),
            requires: parse_set(row.get("requires"))?,
            produces: parse_set(row.get("produces"))?,
            optional_produces: parse_set(row.get("optional_produces"))?,
            hitl_enabled: row.get::<i32, _>("hitl_enabled") != 0,
            enabled: row.get::<i32, _>("enabled") != 0,
            prompt: row.get("prompt"),
            system_prompt: row.get("system_prompt"),
            llm_model: row.get("llm_model"),
            executor,
            rest: rest_config.as_deref().map(serde_json::from_str).transpose()?,
            action: action_config.as_deref().map(serde_json::from_str).transpose()?,
            workspace_id: Some(row.get("workspace_id")),
            owner_id: row.get("owner_id"),
            is_public: row.get::<i32, _>("is_public") != 0,
            source: SkillSource::Database,
            module_name: row.get("module_name"),
            compile_error: None,
        };
        skill.validate().map_err(|e| EngineError::InvalidSkill(e.to_string()))?;

        let action_code: Option<String> = row.get("action_code");
        let action_functions: Option<String> = row.get("action_functions");
        self.register_skill_code(&mut skill, action_code.as_deref(), action_functions.as_deref());
        Ok(skill)
    }

    /// Install an in-memory catalog directly, bypassing both sources.
    #[cfg(test)]
    pub(crate) fn install(&self, skills: Vec<Skill>) {
        let mut map = BTreeMap::new();
        for mut skill in skills {
            if skill.module_name.is_empty() {
                skill.module_name = format!("fs.{}", skill.name);
            }
            map.insert(skill.module_name.clone(), skill);
        }
        *self.catalog.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(map);
    }

    fn snapshot(&self) -> Arc<BTreeMap<String, Skill>> {
        self.catalog.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Skills visible to a workspace: its own, filesystem (null workspace)
    /// and public skills. A null workspace sees everything.
    pub fn list(&self, workspace_id: Option<&str>) -> Vec<Skill> {
        let snapshot = self.snapshot();
        snapshot
            .values()
            .filter(|skill| match workspace_id {
                None => true,
                Some(ws) => {
                    skill.workspace_id.is_none()
                        || skill.workspace_id.as_deref() == Some(ws)
                        || skill.is_public
                }
            })
            .cloned()
            .collect()
    }

    /// Find a skill by name within a workspace's visible set, preferring the
    /// workspace's own definition over shared ones.
    pub fn get(&self, name: &str, workspace_id: Option<&str>) -> Option<Skill> {
        let visible = self.list(workspace_id);
        visible
            .iter()
            .find(|s| s.name == name && s.workspace_id.is_some() && s.workspace_id.as_deref() == workspace_id)
            .or_else(|| visible.iter().find(|s| s.name == name))
            .cloned()
    }

    /// Upsert a database skill. Inserts fail on duplicate
    /// `(workspace_id, name)`; updates may change anything except `name`.
    /// Inline-code syntax errors are surfaced here with line and column.
    pub async fn save(&self, request: SaveSkillRequest, directory: &WorkspaceDirectory) -> Result<Skill> {
        let Some(pool) = &self.db else {
            return Err(EngineError::InvalidSkill("skill store not configured".into()));
        };
        let mut skill = request.skill;
        skill.validate().map_err(|e| EngineError::InvalidSkill(e.to_string()))?;
        let workspace_id = skill
            .workspace_id
            .clone()
            .ok_or_else(|| EngineError::InvalidSkill("workspace_id is required for database skills".into()))?;
        let workspace = directory
            .get(&workspace_id)
            .await?
            .ok_or_else(|| EngineError::InvalidSkill(format!("workspace not found: {workspace_id}")))?;

        let (id, module_name) = match &request.id {
            Some(id) => {
                let existing = sqlx::query("SELECT name, module_name FROM dynamic_skills WHERE id = ?")
                    .bind(id)
                    .fetch_optional(pool)
                    .await?
                    .ok_or_else(|| EngineError::SkillNotFound(id.clone()))?;
                let existing_name: String = existing.get("name");
                if existing_name != skill.name {
                    return Err(EngineError::InvalidSkill(format!(
                        "skill name is immutable: cannot rename '{existing_name}' to '{}'",
                        skill.name
                    )));
                }
                (id.clone(), existing.get::<String, _>("module_name"))
            }
            None => {
                let duplicate = sqlx::query("SELECT id FROM dynamic_skills WHERE workspace_id = ? AND name = ?")
                    .bind(&workspace_id)
                    .bind(&skill.name)
                    .fetch_optional(pool)
                    .await?;
                if duplicate.is_some() {
                    return Err(EngineError::Conflict(format!(
                        "skill '{}' already exists in workspace {workspace_id}",
                        skill.name
                    )));
                }
                let module_name = format!("{}.{}", workspace.code, slug(&skill.name)?);
                (Uuid::new_v4().to_string(), module_name)
            }
        };
        skill.module_name = module_name.clone();
        skill.source = SkillSource::Database;

        // Surface syntax errors at save time, before anything is stored.
        if let Some(code) = &request.action_code {
            if let Some(action) = skill.action.as_mut().filter(|a| a.kind == ActionType::Function) {
                if action.module.is_none() {
                    action.module = Some(module_name.clone());
                }
                let function = action.function.clone().unwrap_or_else(|| "run".to_string());
                self.actions.register_inline_code(&module_name, &function, code)?;
            }
        }
        if let Some(code) = &request.action_functions {
            self.actions.register_pipeline_helpers(&module_name, code)?;
        }

        if request.id.is_some() {
            sqlx::query(
                r#"
                UPDATE dynamic_skills SET
                    description = ?, requires = ?, produces = ?, optional_produces = ?,
                    executor = ?, hitl_enabled = ?, prompt = ?, system_prompt = ?, llm_model = ?,
                    rest_config = ?, action_config = ?, action_code = ?, action_functions = ?,
                    enabled = ?, owner_id = ?, is_public = ?
                WHERE id = ?
                "#,
            )
            .bind(&skill.description)
            .bind(serde_json::to_string(&skill.requires)?)
            .bind(serde_json::to_string(&skill.produces)?)
            .bind(serde_json::to_string(&skill.optional_produces)?)
            .bind(skill.executor.to_string())
            .bind(skill.hitl_enabled as i32)
            .bind(&skill.prompt)
            .bind(&skill.system_prompt)
            .bind(&skill.llm_model)
            .bind(skill.rest.as_ref().map(serde_json::to_string).transpose()?)
            .bind(skill.action.as_ref().map(serde_json::to_string).transpose()?)
            .bind(&request.action_code)
            .bind(&request.action_functions)
            .bind(skill.enabled as i32)
            .bind(&skill.owner_id)
            .bind(skill.is_public as i32)
            .bind(&id)
            .execute(pool)
            .await?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO dynamic_skills
                    (id, name, module_name, description, requires, produces, optional_produces,
                     executor, hitl_enabled, prompt, system_prompt, llm_model,
                     rest_config, action_config, action_code, action_functions,
                     enabled, workspace_id, owner_id, is_public)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(&skill.name)
            .bind(&module_name)
            .bind(&skill.description)
            .bind(serde_json::to_string(&skill.requires)?)
            .bind(serde_json::to_string(&skill.produces)?)
            .bind(serde_json::to_string(&skill.optional_produces)?)
            .bind(skill.executor.to_string())
            .bind(skill.hitl_enabled as i32)
            .bind(&skill.prompt)
            .bind(&skill.system_prompt)
            .bind(&skill.llm_model)
            .bind(skill.rest.as_ref().map(serde_json::to_string).transpose()?)
            .bind(skill.action.as_ref().map(serde_json::to_string).transpose()?)
            .bind(&request.action_code)
            .bind(&request.action_functions)
            .bind(skill.enabled as i32)
            .bind(&workspace_id)
            .bind(&skill.owner_id)
            .bind(skill.is_public as i32)
            .execute(pool)
            .await?;
        }

        self.reload().await?;
        Ok(skill)
    }
}
