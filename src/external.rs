//! External tool invocation
//!
//! Converters, registration and inference engines are opaque command-line
//! programs. A [`CommandTemplate`] describes how to call one; placeholders of
//! the form `{name}` in its arguments are substituted per invocation. A
//! list-valued placeholder that makes up a whole argument expands into one
//! argument per element (`-f {folds}` becomes `-f 0 1 2`).

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Longest stderr excerpt carried in an error message.
const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {}: {stderr}", exit_text(.code))]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("'{program}' timed out after {secs}s")]
    TimedOut { program: String, secs: u64 },

    #[error("expected output {} was not produced", .0.display())]
    MissingOutput(PathBuf),

    #[error("{0}")]
    Other(String),
}

/// A value substituted into a template placeholder.
#[derive(Clone, Debug, PartialEq)]
pub enum TemplateValue {
    One(String),
    Many(Vec<String>),
}

impl From<String> for TemplateValue {
    fn from(value: String) -> Self {
        TemplateValue::One(value)
    }
}

impl From<&str> for TemplateValue {
    fn from(value: &str) -> Self {
        TemplateValue::One(value.to_string())
    }
}

impl From<&std::path::Path> for TemplateValue {
    fn from(value: &std::path::Path) -> Self {
        TemplateValue::One(value.display().to_string())
    }
}

impl From<Vec<String>> for TemplateValue {
    fn from(value: Vec<String>) -> Self {
        TemplateValue::Many(value)
    }
}

/// How to invoke an external program.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables (e.g. `CUDA_VISIBLE_DEVICES`, model roots)
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandTemplate {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
        }
    }

    /// Substitutes placeholders; unknown placeholders are left verbatim.
    pub fn render(&self, values: &HashMap<&str, TemplateValue>) -> Vec<String> {
        let mut rendered = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            let whole = arg
                .strip_prefix('{')
                .and_then(|rest| rest.strip_suffix('}'))
                .and_then(|key| values.get(key));
            if let Some(TemplateValue::Many(items)) = whole {
                rendered.extend(items.iter().cloned());
                continue;
            }

            rendered.push(substitute(arg, values));
        }
        rendered
    }

    pub fn command(
        &self,
        values: &HashMap<&str, TemplateValue>,
        timeout: Option<Duration>,
    ) -> ExternalCommand {
        ExternalCommand {
            program: self.program.clone(),
            args: self.render(values),
            env: self.env.clone(),
            timeout,
        }
    }
}

/// Output of a successful command.
#[derive(Debug, Default)]
pub struct CommandOutput {
    pub stdout: String,
}

/// A fully rendered invocation.
#[derive(Clone, Debug)]
pub struct ExternalCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl ExternalCommand {
    /// Runs the command to completion, killing it if the timeout elapses.
    pub async fn run(&self) -> Result<CommandOutput, ToolError> {
        debug!(program = %self.program, args = ?self.args, "Running external command");

        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(program = %self.program, secs = limit.as_secs(), "External command timed out");
                    return Err(ToolError::TimedOut {
                        program: self.program.clone(),
                        secs: limit.as_secs(),
                    });
                }
            },
            None => child.wait_with_output().await,
        }
        .map_err(|source| ToolError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ToolError::Failed {
                program: self.program.clone(),
                code: output.status.code(),
                stderr: tail(&stderr, STDERR_TAIL_BYTES).trim().to_string(),
            });
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

/// Replaces every `{key}` of `arg` in one left-to-right scan; substituted
/// text is never scanned again.
fn substitute(arg: &str, values: &HashMap<&str, TemplateValue>) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after
            .find('}')
            .and_then(|close| values.get(&after[..close]).map(|value| (close, value)));
        match value {
            Some((close, TemplateValue::One(v))) => {
                out.push_str(v);
                rest = &after[close + 1..];
            }
            Some((close, TemplateValue::Many(items))) => {
                out.push_str(&items.join(" "));
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn exit_text(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "signal".to_string(),
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
