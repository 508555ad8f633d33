//! Command-template rendering.
//!
//! Pure functions that turn a pipeline's templates plus an input path
//! into an output path and an argv, with the pipeline's extras merged
//! from configuration and store overrides.
//!
//! Templates use `{{.Name}}` placeholders: `{{.File.Dir}}`,
//! `{{.File.Name}}`, `{{.File.Basename}}`, `{{.File.Ext}}` plus named
//! regex captures for target paths, and additionally `{{.Input}}`,
//! `{{.Output}}`, `{{.Extra}}` for commands.

use std::collections::HashMap;
use std::path::Path;

use regex_lite::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("target regex: {0}")]
    Regex(String),

    #[error("target regex did not match {0:?}")]
    RegexUnmatched(String),

    #[error("template references unknown value {0:?}")]
    UnknownPlaceholder(String),

    #[error("unterminated placeholder in template")]
    UnterminatedPlaceholder,

    #[error("parse override extra: {0}")]
    Extra(String),

    #[error("command rendered to empty argv")]
    EmptyCommand,
}

/// Path components available in command and target templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileVars {
    /// Directory containing the file.
    pub dir: String,
    /// Full file name (base + extension).
    pub name: String,
    /// File name without extension.
    pub basename: String,
    /// Extension including the leading dot, empty when absent.
    pub ext: String,
}

impl FileVars {
    pub fn from_path(path: &Path) -> Self {
        let dir = path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let basename = name
            .strip_suffix(ext.as_str())
            .unwrap_or(&name)
            .to_string();
        Self {
            dir,
            name,
            basename,
            ext,
        }
    }

    fn insert_into(&self, vars: &mut HashMap<String, String>) {
        vars.insert("File.Dir".to_string(), self.dir.clone());
        vars.insert("File.Name".to_string(), self.name.clone());
        vars.insert("File.Basename".to_string(), self.basename.clone());
        vars.insert("File.Ext".to_string(), self.ext.clone());
    }
}

/// Derive the output path for `input` using the pipeline's optional
/// target regex (named groups become template values, matched against
/// the file name) and format template. A configured regex that does
/// not match the file name fails the render.
pub fn render_target_path(
    input: &Path,
    regex: Option<&str>,
    format: &str,
) -> Result<String, ExecutorError> {
    let file_vars = FileVars::from_path(input);
    let mut vars = HashMap::new();
    file_vars.insert_into(&mut vars);

    if let Some(regex_str) = regex {
        let re = Regex::new(regex_str).map_err(|e| ExecutorError::Regex(e.to_string()))?;
        let captures = re
            .captures(&file_vars.name)
            .ok_or_else(|| ExecutorError::RegexUnmatched(file_vars.name.clone()))?;
        for name in re.capture_names().flatten() {
            if let Some(m) = captures.name(name) {
                vars.insert(name.to_string(), m.as_str().to_string());
            }
        }
    }

    render_template(format, &vars)
}

/// Merge base extras (from configuration) with the store's override
/// JSON. The override wins. Returns the merged map serialized as JSON.
pub fn merge_extra(
    base: &serde_json::Map<String, serde_json::Value>,
    override_json: &str,
) -> Result<String, ExecutorError> {
    let mut merged = base.clone();
    if !override_json.is_empty() && override_json != "{}" {
        let overrides: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(override_json).map_err(|e| ExecutorError::Extra(e.to_string()))?;
        for (key, value) in overrides {
            merged.insert(key, value);
        }
    }
    serde_json::to_string(&merged).map_err(|e| ExecutorError::Extra(e.to_string()))
}

/// Render the command template and split it into argv.
pub fn render_command(
    template: &str,
    input: &Path,
    output: &str,
    extra_json: &str,
) -> Result<Vec<String>, ExecutorError> {
    let mut vars = HashMap::new();
    FileVars::from_path(input).insert_into(&mut vars);
    vars.insert("Input".to_string(), input.to_string_lossy().into_owned());
    vars.insert("Output".to_string(), output.to_string());
    vars.insert("Extra".to_string(), extra_json.to_string());

    let rendered = render_template(template, &vars)?;
    let argv = parse_args(&rendered);
    if argv.is_empty() {
        return Err(ExecutorError::EmptyCommand);
    }
    Ok(argv)
}

/// Substitute `{{.Key}}` placeholders. Unknown keys are errors so a
/// typo fails the dispatch instead of leaking the raw placeholder into
/// a subprocess argument.
fn render_template(template: &str, vars: &HashMap<String, String>) -> Result<String, ExecutorError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or(ExecutorError::UnterminatedPlaceholder)?;
        let key = after[..end].trim();
        let key = key
            .strip_prefix('.')
            .ok_or_else(|| ExecutorError::UnknownPlaceholder(key.to_string()))?;
        let value = vars
            .get(key)
            .ok_or_else(|| ExecutorError::UnknownPlaceholder(key.to_string()))?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Split a command string into argv, respecting single/double quotes
/// and backslash escapes of `"`, `'` and `\`.
fn parse_args(s: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut quote_char = '\0';

    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' if !in_quote => {
                in_quote = true;
                quote_char = c;
            }
            _ if in_quote && c == quote_char => {
                in_quote = false;
                quote_char = '\0';
            }
            ' ' if !in_quote => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            '\\' if i + 1 < chars.len() => {
                let next = chars[i + 1];
                if next == '"' || next == '\'' || next == '\\' {
                    current.push(next);
                    i += 2;
                    continue;
                }
                current.push(c);
            }
            _ => current.push(c),
        }
        i += 1;
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}
