//! Rule book: rules, templates and exclusions loaded from YAML.
//!
//! Loaded and validated once at startup. Anything malformed is a
//! `ConfigError`; the run loop never sees an invalid rule book.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::pipeline::conditions::Condition;
use crate::pipeline::rules::{DEFAULT_PRIORITY, Exclusions, Rule};
use crate::pipeline::template::Template;

/// Validated, immutable configuration consumed by the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct RuleBook {
    /// Rules in declaration order.
    pub rules: Vec<Rule>,
    pub templates: HashMap<String, Template>,
    pub exclusions: Exclusions,
}

// ── Raw YAML shapes ─────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct RawRuleBook {
    #[serde(default)]
    settings: RawSettings,
    #[serde(default)]
    exclusions: Exclusions,
    #[serde(default)]
    rules: Vec<RawRule>,
    #[serde(default)]
    templates: BTreeMap<String, RawTemplate>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    /// Directory of `<name>.txt` templates, relative to the rule file.
    templates_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    name: String,
    #[serde(default = "default_priority")]
    priority: i64,
    #[serde(alias = "response_template")]
    template: String,
    /// A bare `conditions:` key is null and means no conditions.
    #[serde(default)]
    conditions: Option<RawConditions>,
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

/// Conditions as an ordered list of variants, or as a map of keys.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawConditions {
    List(Vec<Condition>),
    Map(ConditionMap),
}

impl Default for RawConditions {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConditionMap {
    subject_contains: Option<Vec<String>>,
    subject_not_contains: Option<Vec<String>>,
    from_domain_is: Option<Vec<String>>,
    from_domain_not: Option<Vec<String>>,
    body_contains: Option<Vec<String>>,
    label_is: Option<Vec<String>>,
    has_attachments: Option<bool>,
}

impl RawConditions {
    fn into_conditions(self) -> Vec<Condition> {
        match self {
            Self::List(list) => list,
            Self::Map(map) => {
                let mut out = Vec::new();
                if let Some(v) = map.subject_contains {
                    out.push(Condition::SubjectContains(v));
                }
                if let Some(v) = map.subject_not_contains {
                    out.push(Condition::SubjectNotContains(v));
                }
                if let Some(v) = map.from_domain_is {
                    out.push(Condition::FromDomainIs(v));
                }
                if let Some(v) = map.from_domain_not {
                    out.push(Condition::FromDomainNot(v));
                }
                if let Some(v) = map.body_contains {
                    out.push(Condition::BodyContains(v));
                }
                if let Some(v) = map.label_is {
                    out.push(Condition::LabelIs(v));
                }
                if let Some(v) = map.has_attachments {
                    out.push(Condition::HasAttachments(v));
                }
                out
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTemplate {
    subject: String,
    body: String,
}

// ── Loading ─────────────────────────────────────────────────────────

impl RuleBook {
    /// Load and validate a rule book from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let book = Self::from_yaml_str(&content, base_dir, &path.display().to_string())?;

        info!(
            path = %path.display(),
            rules = book.rules.len(),
            templates = book.templates.len(),
            "Loaded rule book"
        );
        Ok(book)
    }

    /// Parse and validate YAML. `base_dir` resolves a relative `templates_dir`.
    pub fn from_yaml_str(yaml: &str, base_dir: &Path, source: &str) -> Result<Self, ConfigError> {
        let raw: RawRuleBook = if yaml.trim().is_empty() {
            RawRuleBook::default()
        } else {
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
                path: source.to_string(),
                reason: e.to_string(),
            })?
        };

        let mut templates: HashMap<String, Template> = HashMap::new();
        for (name, t) in raw.templates {
            templates.insert(name.clone(), Template::new(name, t.subject, t.body));
        }

        if let Some(dir) = raw.settings.templates_dir {
            let dir = if dir.is_absolute() { dir } else { base_dir.join(dir) };
            for template in load_template_dir(&dir)? {
                if templates.contains_key(&template.name) {
                    return Err(ConfigError::DuplicateTemplate {
                        name: template.name,
                    });
                }
                templates.insert(template.name.clone(), template);
            }
        }

        for template in templates.values() {
            template
                .validate()
                .map_err(|source| ConfigError::MalformedTemplate {
                    name: template.name.clone(),
                    source,
                })?;
        }

        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(raw.rules.len());
        for (index, r) in raw.rules.into_iter().enumerate() {
            let name = r.name.trim().to_string();
            if name.is_empty() {
                return Err(ConfigError::EmptyRuleName { index });
            }
            if !seen.insert(name.clone()) {
                return Err(ConfigError::DuplicateRule { name });
            }
            if !templates.contains_key(&r.template) {
                return Err(ConfigError::UnknownTemplate {
                    rule: name,
                    template: r.template,
                });
            }
            rules.push(Rule {
                name,
                conditions: r.conditions.unwrap_or_default().into_conditions(),
                priority: r.priority,
                template: r.template,
            });
        }

        Ok(Self {
            rules,
            templates,
            exclusions: raw.exclusions,
        })
    }

    pub fn template(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }
}

/// Load every `*.txt` file in `dir` as a template named after its stem.
fn load_template_dir(dir: &Path) -> Result<Vec<Template>, ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: dir.display().to_string(),
        source,
    };

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io_err)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "txt"))
        .collect();
    paths.sort();

    let mut templates = Vec::with_capacity(paths.len());
    for path in paths {
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let template = parse_template_file(name, &content)
            .ok_or_else(|| ConfigError::MissingSubjectLine {
                path: path.display().to_string(),
            })?;
        debug!(name = %template.name, path = %path.display(), "Loaded template file");
        templates.push(template);
    }
    Ok(templates)
}

/// Parse a template file: `Subject: ...` first line, body after the first
/// blank line. Returns `None` without a subject line.
pub fn parse_template_file(name: &str, content: &str) -> Option<Template> {
    let lines: Vec<&str> = content.trim().lines().collect();
    let subject = lines.first()?.strip_prefix("Subject:")?.trim();

    let body_start = lines
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, line)| line.trim().is_empty())
        .map(|(i, _)| i + 1)
        .unwrap_or(1);
    let body = lines.get(body_start..).unwrap_or_default().join("\n");

    Some(Template::new(name, subject, body))
}
