//! Skills: `<dir>/<name>/SKILL.md` files whose YAML front matter names and
//! describes a reusable instruction set. Invoking a skill returns its body.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use super::{tool_name, ToolDescriptor, ToolKind, ToolOutput};

const SKILL_FILE: &str = "SKILL.md";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub file_path: PathBuf,
    pub base_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum SkillError {
    #[error("failed to read skill file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid skill file {path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

#[derive(Debug, Deserialize)]
struct SkillFrontmatter {
    name: Option<String>,
    description: Option<String>,
}

impl Skill {
    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: tool_name("skill", &[&self.name]),
            description: format!(
                "Load the `{}` skill instructions. {}",
                self.name, self.description
            ),
            parameters: json!({"type": "object", "properties": {}, "required": []}),
            kind: ToolKind::Skill,
            source_id: self.name.clone(),
            enabled: true,
        }
    }

    /// Re-reads the skill file so edits apply without a restart.
    pub async fn load_instructions(&self) -> Result<ToolOutput, SkillError> {
        let content = tokio::fs::read_to_string(&self.file_path)
            .await
            .map_err(|source| SkillError::Read {
                path: self.file_path.clone(),
                source,
            })?;
        let body = split_frontmatter(&content)
            .map(|(_, body)| body)
            .map_err(|message| SkillError::Invalid {
                path: self.file_path.clone(),
                message,
            })?;
        Ok(ToolOutput::text(format!(
            "Skill `{}` (base directory: {})\n\n{}",
            self.name,
            self.base_dir.display(),
            body.trim()
        )))
    }
}

/// Loads every skill one level below `dir`. Invalid skills are logged and skipped.
pub fn load_skills(dir: &Path) -> Vec<Skill> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(path = %dir.display(), error = %err, "skills: failed to read directory");
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .map(|path| path.join(SKILL_FILE))
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    let mut seen = HashSet::new();
    let mut skills = Vec::new();
    for path in paths {
        match load_skill_file(&path) {
            Ok(skill) => {
                if !seen.insert(skill.name.clone()) {
                    tracing::warn!(path = %path.display(), name = %skill.name, "skills: duplicate name, skipping");
                    continue;
                }
                skills.push(skill);
            }
            Err(err) => tracing::warn!(error = %err, "skills: skipping"),
        }
    }
    skills
}

fn load_skill_file(path: &Path) -> Result<Skill, SkillError> {
    let invalid = |message: String| SkillError::Invalid {
        path: path.to_path_buf(),
        message,
    };
    let content = fs::read_to_string(path).map_err(|source| SkillError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let (yaml, _) = split_frontmatter(&content).map_err(invalid)?;
    let frontmatter: SkillFrontmatter = serde_yaml::from_str(&yaml)
        .map_err(|err| invalid(format!("failed to parse YAML front matter: {err}")))?;

    let name = frontmatter.name.unwrap_or_default().trim().to_string();
    if name.is_empty() {
        return Err(invalid("missing name in front matter".to_string()));
    }
    validate_name(&name).map_err(invalid)?;
    let description = frontmatter.description.unwrap_or_default().trim().to_string();
    if description.is_empty() {
        return Err(invalid("missing description in front matter".to_string()));
    }

    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| path.to_path_buf());
    Ok(Skill {
        name,
        description,
        file_path: path.to_path_buf(),
        base_dir,
    })
}

/// Splits `---`-delimited YAML front matter from the markdown body.
fn split_frontmatter(content: &str) -> Result<(String, String), String> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut lines = content.lines();
    if lines.next().map(str::trim) != Some("---") {
        return Err("missing YAML front matter".to_string());
    }
    let mut yaml_lines = Vec::new();
    for line in lines.by_ref() {
        let trimmed = line.trim();
        if trimmed == "---" || trimmed == "..." {
            let body = lines.collect::<Vec<_>>().join("\n");
            return Ok((yaml_lines.join("\n"), body));
        }
        yaml_lines.push(line);
    }
    Err("unterminated YAML front matter".to_string())
}

fn validate_name(name: &str) -> Result<(), String> {
    if name.len() > 64 {
        return Err(format!("skill name '{name}' exceeds 64 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(format!(
            "skill name '{name}' must be lowercase alphanumeric, '-' or '_'"
        ));
    }
    Ok(())
}
