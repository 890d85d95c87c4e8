//! Template rendering seam.
//!
//! The template engine itself is a host-provided capability: anything that
//! turns a template plus a variables map into text can sit behind
//! [`TemplateEngine`]. The built-in [`VarsEngine`] supports variable
//! substitution, the `shell_escape` and `ignore_escape` filters, and file
//! includes, which is enough to drive the CLI without an external engine.

use std::collections::BTreeMap;
use std::path::PathBuf;

use regex::{Captures, Regex};

use crate::config::ProfileVars;
use crate::error::{Result, TplError};

/// Variables available to template rendering: scalar top-level values
/// (`profile`, `platform`, `stage_name`, ...) plus the profile's free-form
/// map addressed as `vars.<key>`.
#[derive(Debug, Clone, Default)]
pub struct RenderVars {
    values: BTreeMap<String, String>,
    vars: ProfileVars,
    user_config: ProfileVars,
}

impl RenderVars {
    pub fn new(profile: &str, platform: &str) -> Self {
        let mut values = BTreeMap::new();
        values.insert("profile".to_string(), profile.to_string());
        values.insert("platform".to_string(), platform.to_string());
        Self {
            values,
            vars: ProfileVars::new(),
            user_config: ProfileVars::new(),
        }
    }

    pub fn with_value(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_vars(mut self, vars: ProfileVars) -> Self {
        self.vars = vars;
        self
    }

    /// Expose the user configuration under `user_config.<key>`.
    pub fn with_user_config(mut self, user_config: ProfileVars) -> Self {
        self.user_config = user_config;
        self
    }

    /// Resolve a dotted variable path to its string value.
    pub fn lookup(&self, path: &str) -> Option<String> {
        if let Some(value) = self.values.get(path) {
            return Some(value.clone());
        }
        if let Some(key) = path.strip_prefix("user_config.") {
            return scalar_to_string(self.user_config.get(key)?);
        }
        let key = path.strip_prefix("vars.")?;
        scalar_to_string(self.vars.get(key)?)
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Null => Some(String::new()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// String-to-string template renderer over a variables map.
pub trait TemplateEngine: Send + Sync {
    /// Render a template file resolved against the engine's search paths.
    fn render_file(&self, name: &str, vars: &RenderVars) -> Result<String>;

    /// Render inline template source.
    fn render_str(&self, source: &str, vars: &RenderVars) -> Result<String>;
}

/// Escape a string for safe interpolation into a POSIX shell command.
pub fn shell_escape(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Escape dockerignore metacharacters so a value matches literally.
pub fn ignore_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '*' | '?' | '[' | ']' | '!' | '#') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// The built-in renderer: `{{ var }}` and `{{ var | filter }}`
/// substitution plus `{% include "file" %}` lines.
pub struct VarsEngine {
    search_paths: Vec<PathBuf>,
}

const MAX_INCLUDE_DEPTH: usize = 16;

impl VarsEngine {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        for path in &self.search_paths {
            let candidate = path.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(TplError::Template {
            reason: format!("template {name:?} not found in template_paths"),
        })
    }

    fn render_depth(&self, source: &str, vars: &RenderVars, depth: usize) -> Result<String> {
        if depth > MAX_INCLUDE_DEPTH {
            return Err(TplError::Template {
                reason: "include depth limit exceeded (include cycle?)".to_string(),
            });
        }

        let include_re = Regex::new(r#"^\s*\{%\s*include\s+"([^"]+)"\s*%\}\s*$"#)
            .expect("static regex");
        let subst_re = Regex::new(
            r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*(?:\|\s*([A-Za-z_]+)\s*)?\}\}",
        )
        .expect("static regex");

        let mut out = String::with_capacity(source.len());
        for line in source.lines() {
            if let Some(caps) = include_re.captures(line) {
                let path = self.resolve(&caps[1])?;
                let text =
                    std::fs::read_to_string(&path).map_err(|e| TplError::io(&path, e))?;
                out.push_str(&self.render_depth(&text, vars, depth + 1)?);
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                continue;
            }

            let mut error: Option<TplError> = None;
            let rendered = subst_re.replace_all(line, |caps: &Captures| {
                let path = &caps[1];
                let value = match vars.lookup(path) {
                    Some(value) => value,
                    None => {
                        error = Some(TplError::Template {
                            reason: format!("undefined template variable {path:?}"),
                        });
                        return String::new();
                    }
                };
                match caps.get(2).map(|m| m.as_str()) {
                    None => value,
                    Some("shell_escape") => shell_escape(&value),
                    Some("ignore_escape") => ignore_escape(&value),
                    Some(filter) => {
                        error = Some(TplError::Template {
                            reason: format!("unknown template filter {filter:?}"),
                        });
                        String::new()
                    }
                }
            });
            if let Some(err) = error {
                return Err(err);
            }
            out.push_str(&rendered);
            out.push('\n');
        }
        Ok(out)
    }
}

impl TemplateEngine for VarsEngine {
    fn render_file(&self, name: &str, vars: &RenderVars) -> Result<String> {
        let path = self.resolve(name)?;
        let text = std::fs::read_to_string(&path).map_err(|e| TplError::io(&path, e))?;
        self.render_depth(&text, vars, 0)
    }

    fn render_str(&self, source: &str, vars: &RenderVars) -> Result<String> {
        // Inline templates are single-line name templates in practice;
        // preserve the absence of a trailing newline.
        let rendered = self.render_depth(source, vars, 0)?;
        if !source.ends_with('\n') && rendered.ends_with('\n') {
            Ok(rendered[..rendered.len() - 1].to_string())
        } else {
            Ok(rendered)
        }
    }
}
