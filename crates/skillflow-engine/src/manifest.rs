//! Skill manifest parsing.
//!
//! A filesystem skill is a directory containing `skill.md`: YAML front-matter
//! delimited by `---` lines, followed by an optional Markdown body used as
//! the default system prompt. Optional siblings: `prompt.md` overrides the
//! user prompt, `action.rhai` holds an inline action function and
//! `transforms.rhai` holds pipeline helper functions.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use skillflow_core::{ActionConfig, ExecutorKind, RestConfig, Skill, SkillSource};

use crate::errors::{EngineError, Result};

/// Raw front-matter of a `skill.md` manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestFrontmatter {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub requires: BTreeSet<String>,
    #[serde(default)]
    pub produces: BTreeSet<String>,
    #[serde(default)]
    pub optional_produces: BTreeSet<String>,
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(default)]
    pub hitl_enabled: bool,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub llm_model: Option<String>,
    #[serde(default)]
    pub rest: Option<RestConfig>,
    #[serde(default)]
    pub action: Option<ActionConfig>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_yaml::Value>,
}

/// A parsed manifest: front-matter plus the Markdown body.
#[derive(Debug, Clone)]
pub struct SkillManifest {
    pub frontmatter: ManifestFrontmatter,
    pub body: String,
    pub dir: PathBuf,
}

/// Split front-matter and body. The file must start with a `---` line and
/// carry a matching closing delimiter.
pub fn extract_frontmatter(content: &str) -> Result<(&str, &str)> {
    let content = content.trim_start_matches('\u{feff}');
    let mut lines = content.lines();
    if lines.next().map(str::trim) != Some("---") {
        return Err(EngineError::Manifest(
            "skill manifest must start with front-matter delimited by '---'".into(),
        ));
    }
    let after_first = &content[content.find('\n').map(|i| i + 1).unwrap_or(content.len())..];
    let mut offset = 0usize;
    for line in after_first.split_inclusive('\n') {
        if line.trim() == "---" {
            let yaml = &after_first[..offset];
            let body = &after_first[offset + line.len()..];
            return Ok((yaml, body));
        }
        offset += line.len();
    }
    Err(EngineError::Manifest(
        "skill manifest front-matter must be closed with '---'".into(),
    ))
}

/// Parse a `skill.md` file from a string.
pub fn parse_manifest(content: &str, dir: &Path) -> Result<SkillManifest> {
    let (yaml, body) = extract_frontmatter(content)?;
    let frontmatter: ManifestFrontmatter = serde_yaml::from_str(yaml)
        .map_err(|e| EngineError::Manifest(format!("invalid front-matter in {}: {e}", dir.display())))?;
    Ok(SkillManifest {
        frontmatter,
        body: body.trim().to_string(),
        dir: dir.to_path_buf(),
    })
}

/// Load a skill directory into a [`Skill`], applying sibling-file overrides.
pub fn load_skill_dir(dir: &Path) -> Result<(Skill, ManifestSiblings)> {
    let manifest_path = dir.join("skill.md");
    let raw = std::fs::read_to_string(&manifest_path)
        .map_err(|e| EngineError::Manifest(format!("failed to read {}: {e}", manifest_path.display())))?;
    let manifest = parse_manifest(&raw, dir)?;
    let fm = manifest.frontmatter;

    let executor = match fm.executor.as_deref().map(str::to_lowercase).as_deref() {
        None | Some("llm") => ExecutorKind::Llm,
        Some("rest") => ExecutorKind::Rest,
        Some("action") => ExecutorKind::Action,
        Some(other) => {
            return Err(EngineError::Manifest(format!(
                "skill '{}': unknown executor '{other}'",
                fm.name
            )))
        }
    };

    let mut prompt = fm.prompt;
    let prompt_file = dir.join("prompt.md");
    if prompt_file.exists() {
        let candidate = std::fs::read_to_string(&prompt_file)?;
        let candidate = candidate.trim();
        if !candidate.is_empty() {
            prompt = Some(candidate.to_string());
        }
    }

    let mut system_prompt = fm.system_prompt.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    if system_prompt.is_none() && !manifest.body.is_empty() {
        // The manifest body is the default system prompt / SOP text.
        system_prompt = Some(manifest.body.clone());
    }

    let siblings = ManifestSiblings {
        action_code: read_optional(&dir.join("action.rhai"))?,
        transforms_code: read_optional(&dir.join("transforms.rhai"))?,
    };

    let skill = Skill {
        name: fm.name,
        description: fm.description,
        requires: fm.requires,
        produces: fm.produces,
        optional_produces: fm.optional_produces,
        hitl_enabled: fm.hitl_enabled,
        enabled: fm.enabled.unwrap_or(true),
        prompt,
        system_prompt,
        llm_model: fm.llm_model,
        executor,
        rest: fm.rest,
        action: fm.action,
        workspace_id: None,
        owner_id: None,
        is_public: true,
        source: SkillSource::Filesystem,
        module_name: String::new(),
        compile_error: None,
    };
    skill.validate().map_err(|e| EngineError::Manifest(e.to_string()))?;
    Ok((skill, siblings))
}

/// Optional code files next to a manifest.
#[derive(Debug, Clone, Default)]
pub struct ManifestSiblings {
    pub action_code: Option<String>,
    pub transforms_code: Option<String>,
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    if path.exists() {
        Ok(Some(std::fs::read_to_string(path)?))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"---
name: sum
description: Add two numbers
requires: [x, y]
produces: [sum]
---

Add the inputs carefully and return only the total.
"#;

    #[test]
    fn test_parse_frontmatter_and_body() {
        let manifest = parse_manifest(MANIFEST, Path::new("/tmp/sum")).unwrap();
        assert_eq!(manifest.frontmatter.name, "sum");
        assert_eq!(manifest.frontmatter.requires.len(), 2);
        assert!(manifest.body.contains("Add the inputs"));
    }

    #[test]
    fn test_missing_opening_delimiter() {
        let err = parse_manifest("name: broken\n", Path::new("/tmp/x")).unwrap_err();
        assert!(err.to_string().contains("must start with front-matter"));
    }

    #[test]
    fn test_missing_closing_delimiter() {
        let err = parse_manifest("---\nname: broken\n", Path::new("/tmp/x")).unwrap_err();
        assert!(err.to_string().contains("closed with"));
    }

    #[test]
    fn test_load_skill_dir_with_siblings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("skill.md"), MANIFEST).unwrap();
        std::fs::write(dir.path().join("prompt.md"), "Compute x + y.\n").unwrap();
        let (skill, siblings) = load_skill_dir(dir.path()).unwrap();
        assert_eq!(skill.prompt.as_deref(), Some("Compute x + y."));
        assert_eq!(skill.system_prompt.as_deref(), Some("Add the inputs carefully and return only the total."));
        assert!(siblings.action_code.is_none());
        assert!(skill.is_public);
    }

    #[test]
    fn test_rest_manifest() {
        let raw = r#"---
name: validate
description: Remote validation
requires: [order_id]
produces: [approved]
executor: rest
rest:
  url: "http://partner/validate/{order_id}"
  timeout: 5.0
---
"#;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("skill.md"), raw).unwrap();
        let (skill, _) = load_skill_dir(dir.path()).unwrap();
        assert_eq!(skill.executor, ExecutorKind::Rest);
        assert_eq!(skill.rest.as_ref().unwrap().method, "POST");
        assert_eq!(skill.rest.as_ref().unwrap().timeout, 5.0);
    }

    #[test]
    fn test_executor_config_mismatch_is_rejected() {
        let raw = "---\nname: broken\ndescription: d\nexecutor: rest\n---\n";
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("skill.md"), raw).unwrap();
        assert!(load_skill_dir(dir.path()).is_err());
    }
}
