//! # Killswitches
//!
//! Operator rules that silently drop matching messages. A killswitch is a
//! named [`Predicate`] evaluated against a [`KillswitchContext`]; the message
//! is shed when the predicate matches.
//!
//! ## Configuration Format
//!
//! ```json
//! {
//!   "store.load-shed-pipeline-projects": [
//!     { "project_id": 42 },
//!     { "organization_id": 3, "event_type": "transaction" }
//!   ]
//! }
//! ```
//!
//! Each object is a conjunction of field conditions; the list is a
//! disjunction. A value of `"*"` matches any present value. An empty list
//! disables the killswitch.
//!
//! ## Evaluation
//!
//! [`KillswitchStore::matches`] takes the read lock and evaluates against the
//! live rules on every call. Nothing is cached between evaluations, so a
//! rule swapped in by [`KillswitchStore::replace`] or the file watcher takes
//! effect on the very next message.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConfigError;

/// Consulted before the payload is decoded.
pub const LOAD_SHED_PIPELINE: &str = "store.load-shed-pipeline-projects";
/// Consulted after the payload is decoded.
pub const LOAD_SHED_PARSED_PIPELINE: &str = "store.load-shed-parsed-pipeline-projects";

/// The context attributes a rule may test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextField {
    /// Owning project id.
    ProjectId,
    /// Event id.
    EventId,
    /// Owning organization id.
    OrganizationId,
    /// Decoded `type` of the event (`"null"` when absent).
    EventType,
    /// Whether the message carries attachments.
    HasAttachments,
}

impl ContextField {
    /// The configuration name of the field.
    pub fn as_str(self) -> &'static str {
        match self {
            ContextField::ProjectId => "project_id",
            ContextField::EventId => "event_id",
            ContextField::OrganizationId => "organization_id",
            ContextField::EventType => "event_type",
            ContextField::HasAttachments => "has_attachments",
        }
    }
}

impl FromStr for ContextField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project_id" => Ok(ContextField::ProjectId),
            "event_id" => Ok(ContextField::EventId),
            "organization_id" => Ok(ContextField::OrganizationId),
            "event_type" => Ok(ContextField::EventType),
            "has_attachments" => Ok(ContextField::HasAttachments),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for ContextField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The attributes known about a message at one evaluation point. Fields not
/// known yet (e.g. `event_type` before decoding) stay `None` and never match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillswitchContext {
    /// Owning project id.
    pub project_id: Option<u64>,
    /// Event id.
    pub event_id: Option<String>,
    /// Owning organization id.
    pub organization_id: Option<u64>,
    /// Decoded event type.
    pub event_type: Option<String>,
    /// Whether attachments are present.
    pub has_attachments: Option<bool>,
}

impl KillswitchContext {
    /// Context available before the payload is decoded.
    pub fn pre_parse(project_id: u64, event_id: &str, has_attachments: bool) -> Self {
        Self {
            project_id: Some(project_id),
            event_id: Some(event_id.to_string()),
            has_attachments: Some(has_attachments),
            ..Self::default()
        }
    }

    /// Context available once the payload is decoded.
    pub fn post_parse(
        organization_id: u64,
        project_id: u64,
        event_type: &str,
        has_attachments: bool,
        event_id: &str,
    ) -> Self {
        Self {
            project_id: Some(project_id),
            event_id: Some(event_id.to_string()),
            organization_id: Some(organization_id),
            event_type: Some(event_type.to_string()),
            has_attachments: Some(has_attachments),
        }
    }

    /// String form of one attribute, as compared by [`Pattern::Exact`].
    pub fn value(&self, field: ContextField) -> Option<String> {
        match field {
            ContextField::ProjectId => self.project_id.map(|v| v.to_string()),
            ContextField::EventId => self.event_id.clone(),
            ContextField::OrganizationId => self.organization_id.map(|v| v.to_string()),
            ContextField::EventType => self.event_type.clone(),
            ContextField::HasAttachments => self.has_attachments.map(|v| v.to_string()),
        }
    }
}

/// How a single attribute is compared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Matches any present value.
    Any,
    /// Matches one value, compared as a string.
    Exact(String),
}

impl Pattern {
    fn matches(&self, value: Option<&str>) -> bool {
        match (self, value) {
            (_, None) => false,
            (Pattern::Any, Some(_)) => true,
            (Pattern::Exact(expected), Some(actual)) => expected == actual,
        }
    }

    fn from_json(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(s) if s == "*" => Ok(Pattern::Any),
            Value::String(s) => Ok(Pattern::Exact(s.clone())),
            Value::Number(n) => Ok(Pattern::Exact(n.to_string())),
            Value::Bool(b) => Ok(Pattern::Exact(b.to_string())),
            other => Err(format!("unsupported condition value {}", other)),
        }
    }
}

/// A predicate tree over [`ContextField`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// One attribute compared against a pattern.
    Field {
        /// Attribute tested.
        field: ContextField,
        /// Expected value.
        pattern: Pattern,
    },
    /// Every child matches. An empty list matches.
    All(Vec<Predicate>),
    /// At least one child matches. An empty list never matches.
    AnyOf(Vec<Predicate>),
}

impl Predicate {
    /// Convenience constructor for an exact field match.
    pub fn field_eq(field: ContextField, value: impl Into<String>) -> Self {
        Predicate::Field {
            field,
            pattern: Pattern::Exact(value.into()),
        }
    }

    /// Evaluates the predicate. Pure.
    pub fn matches(&self, ctx: &KillswitchContext) -> bool {
        match self {
            Predicate::Field { field, pattern } => pattern.matches(ctx.value(*field).as_deref()),
            Predicate::All(children) => children.iter().all(|p| p.matches(ctx)),
            Predicate::AnyOf(children) => children.iter().any(|p| p.matches(ctx)),
        }
    }
}

/// # Killswitch Config
///
/// An immutable snapshot of all killswitches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillswitchConfig {
    switches: HashMap<String, Predicate>,
}

impl KillswitchConfig {
    /// Parses the JSON configuration document.
    ///
    /// Rejects unknown fields and empty condition objects. An empty object
    /// would match every message; an operator who means that can write
    /// `{"project_id": "*"}`.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let raw: HashMap<String, Vec<serde_json::Map<String, Value>>> = serde_json::from_str(text)?;
        let mut switches = HashMap::with_capacity(raw.len());

        for (name, conditions) in raw {
            let mut alternatives = Vec::with_capacity(conditions.len());
            for condition in conditions {
                if condition.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "killswitch {}: empty condition",
                        name
                    )));
                }
                let mut fields = Vec::with_capacity(condition.len());
                for (field, value) in &condition {
                    let field = field.parse::<ContextField>().map_err(|field| ConfigError::UnknownField {
                        switch: name.clone(),
                        field,
                    })?;
                    let pattern = Pattern::from_json(value)
                        .map_err(|e| ConfigError::Invalid(format!("killswitch {}: {}", name, e)))?;
                    fields.push(Predicate::Field { field, pattern });
                }
                alternatives.push(Predicate::All(fields));
            }
            if name != LOAD_SHED_PIPELINE && name != LOAD_SHED_PARSED_PIPELINE {
                warn!(killswitch = %name, "configured killswitch is not consulted by the pipeline");
            }
            switches.insert(name, Predicate::AnyOf(alternatives));
        }

        Ok(Self { switches })
    }

    /// Reads and parses a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Sets one killswitch, replacing any previous rule of that name.
    pub fn with(mut self, name: impl Into<String>, predicate: Predicate) -> Self {
        self.switches.insert(name.into(), predicate);
        self
    }

    /// Whether the named killswitch matches. Unknown names never match.
    pub fn matches(&self, name: &str, ctx: &KillswitchContext) -> bool {
        self.switches.get(name).is_some_and(|p| p.matches(ctx))
    }

    /// Number of configured killswitches.
    pub fn len(&self) -> usize {
        self.switches.len()
    }

    /// `true` when no killswitch is configured.
    pub fn is_empty(&self) -> bool {
        self.switches.is_empty()
    }
}

/// # Killswitch Store
///
/// The process-wide, externally mutable killswitch configuration. Cloning
/// shares the same rules.
#[derive(Debug, Clone, Default)]
pub struct KillswitchStore {
    inner: Arc<RwLock<KillswitchConfig>>,
}

impl KillswitchStore {
    /// Creates a store holding `config`.
    pub fn new(config: KillswitchConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Evaluates the named killswitch against the live rules.
    pub fn matches(&self, name: &str, ctx: &KillswitchContext) -> bool {
        let config = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        config.matches(name, ctx)
    }

    /// Swaps in a whole new configuration.
    pub fn replace(&self, config: KillswitchConfig) {
        let mut current = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = config;
    }

    /// Sets or replaces one killswitch.
    pub fn set(&self, name: impl Into<String>, predicate: Predicate) {
        let mut current = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        current.switches.insert(name.into(), predicate);
    }

    /// Disables one killswitch.
    pub fn clear(&self, name: &str) {
        let mut current = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        current.switches.remove(name);
    }

    /// Loads a configuration file into the store.
    pub fn load_file(&self, path: &Path) -> Result<(), ConfigError> {
        let config = KillswitchConfig::from_file(path)?;
        info!(path = %path.display(), killswitches = config.len(), "killswitches loaded");
        self.replace(config);
        Ok(())
    }

    /// Re-reads `path` every `interval` until `token` is cancelled. A file that
    /// fails to load leaves the previous rules in place.
    pub async fn watch_file(self, path: PathBuf, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_text: Option<String> = None;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(path = %path.display(), "killswitch watcher stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let text = match tokio::fs::read_to_string(&path).await {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "killswitch file unreadable, keeping previous rules");
                            continue;
                        }
                    };
                    if last_text.as_deref() == Some(text.as_str()) {
                        continue;
                    }
                    match KillswitchConfig::from_json(&text) {
                        Ok(config) => {
                            info!(path = %path.display(), killswitches = config.len(), "killswitches reloaded");
                            self.replace(config);
                            last_text = Some(text);
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "invalid killswitch file, keeping previous rules");
                        }
                    }
                }
            }
        }
    }
}
