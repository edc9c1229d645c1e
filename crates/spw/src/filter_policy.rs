//! 🧹 Filter policies: which published messages a subscription actually wants.
//!
//! A policy is a JSON object mapping message attribute names to the values
//! that let a message through:
//!
//! ```json
//! { "event_type": ["order_placed", { "prefix": "order_" }],
//!   "priority":   [{ "numeric": [">=", 3] }],
//!   "region":     [{ "anything-but": ["test"] }] }
//! ```
//!
//! Setting one is a one-shot, idempotent action that has nothing to do with
//! the delivery pipeline at runtime: it runs from the CLI, or once before the
//! pipeline starts. Applying the same policy twice reports `Unchanged`.
//!
//! 🦆

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// 📏 Attribute names a single policy may constrain.
pub const MAX_ATTRIBUTES: usize = 5;
/// 📏 Allowed values across all attributes of one policy.
pub const MAX_VALUES: usize = 150;

/// 🔍 The condition operators a value array may contain besides plain literals.
const CONDITION_OPERATORS: [&str; 5] = ["prefix", "suffix", "anything-but", "numeric", "exists"];
const NUMERIC_COMPARATORS: [&str; 6] = ["=", "<", "<=", ">", ">=", "!="];

/// 📜 A validated filter policy. Construct it with [`FilterPolicy::parse`].
#[derive(Debug, Clone, PartialEq)]
pub struct FilterPolicy {
    attributes: Map<String, Value>,
}

/// 🎯 What applying a policy did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Unchanged,
}

impl FilterPolicy {
    /// 🚦 Validate a JSON value as a filter policy.
    pub fn parse(value: Value) -> Result<Self> {
        let Value::Object(attributes) = value else {
            bail!("💀 a filter policy must be a JSON object of attribute → allowed values");
        };
        if attributes.is_empty() {
            bail!("💀 a filter policy needs at least one attribute. An empty policy filters nothing and means nothing.");
        }
        if attributes.len() > MAX_ATTRIBUTES {
            bail!(
                "💀 a filter policy may constrain at most {} attributes, this one has {}",
                MAX_ATTRIBUTES,
                attributes.len()
            );
        }

        let mut total_values = 0;
        for (name, allowed) in &attributes {
            if name.trim().is_empty() {
                bail!("💀 filter policy attribute names cannot be blank");
            }
            let Value::Array(values) = allowed else {
                bail!("💀 attribute '{}' must map to an array of allowed values, got {}", name, allowed);
            };
            if values.is_empty() {
                bail!("💀 attribute '{}' has an empty value list, which would match nothing", name);
            }
            for value in values {
                validate_value(name, value)?;
            }
            total_values += values.len();
        }
        if total_values > MAX_VALUES {
            bail!(
                "💀 a filter policy may list at most {} values in total, this one lists {}",
                MAX_VALUES,
                total_values
            );
        }
        Ok(Self { attributes })
    }

    pub fn as_json(&self) -> Value {
        Value::Object(self.attributes.clone())
    }
}

fn validate_value(name: &str, value: &Value) -> Result<()> {
    match value {
        Value::String(_) | Value::Number(_) => Ok(()),
        Value::Object(condition) => validate_condition(name, condition),
        other => bail!(
            "💀 attribute '{}' allows {}, but only strings, numbers and condition objects are allowed",
            name,
            other
        ),
    }
}

fn validate_condition(name: &str, condition: &Map<String, Value>) -> Result<()> {
    let mut entries = condition.iter();
    let (Some((operator, operand)), None) = (entries.next(), entries.next()) else {
        bail!("💀 attribute '{}': a condition object holds exactly one operator", name);
    };
    match (operator.as_str(), operand) {
        ("prefix" | "suffix", Value::String(s)) if !s.is_empty() => Ok(()),
        ("exists", Value::Bool(_)) => Ok(()),
        ("anything-but", Value::String(_) | Value::Number(_)) => Ok(()),
        ("anything-but", Value::Array(items)) if !items.is_empty() => {
            if items.iter().all(|item| item.is_string() || item.is_number()) {
                Ok(())
            } else {
                bail!("💀 attribute '{}': anything-but lists strings or numbers only", name)
            }
        }
        ("numeric", Value::Array(items)) => validate_numeric(name, items),
        (op, _) if CONDITION_OPERATORS.contains(&op) => {
            bail!("💀 attribute '{}': operand {} does not fit operator '{}'", name, operand, op)
        }
        (op, _) => bail!(
            "💀 attribute '{}': unknown operator '{}'. Known ones: {}",
            name,
            op,
            CONDITION_OPERATORS.join(", ")
        ),
    }
}

/// 🔢 `[">", 0]` or `[">", 0, "<=", 100]`.
fn validate_numeric(name: &str, items: &[Value]) -> Result<()> {
    if items.is_empty() || items.len() % 2 != 0 || items.len() > 4 {
        bail!("💀 attribute '{}': numeric takes one or two (comparator, number) pairs", name);
    }
    for pair in items.chunks(2) {
        let comparator_ok = pair[0].as_str().is_some_and(|c| NUMERIC_COMPARATORS.contains(&c));
        if !comparator_ok || !pair[1].is_number() {
            bail!("💀 attribute '{}': '{}' '{}' is not a (comparator, number) pair", name, pair[0], pair[1]);
        }
    }
    Ok(())
}

/// 🧹 Something that can attach a filter policy to a subscription.
#[async_trait]
pub trait FilterPolicySetter {
    async fn apply(&mut self, subscription: &str, policy: &FilterPolicy) -> Result<ApplyOutcome>;
}

/// 📒 A subscription registry kept in one JSON file: `{ "<subscription>": <policy>, ... }`.
///
/// Writes go through a temp file and a rename, so the registry is always
/// either the old document or the new one.
#[derive(Debug, Clone)]
pub struct FileSubscriptionRegistry {
    path: PathBuf,
}

impl FileSubscriptionRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<BTreeMap<String, Value>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("💀 subscription registry '{}' is not a JSON object", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e).with_context(|| format!("💀 could not read subscription registry '{}'", self.path.display())),
        }
    }

    async fn store(&self, registry: &BTreeMap<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("💀 could not create registry directory '{}'", parent.display()))?;
        }
        let mut temp_name = self.path.clone().into_os_string();
        temp_name.push(format!(".{}.tmp", Uuid::new_v4()));
        let temp_path = PathBuf::from(temp_name);

        let body = serde_json::to_vec_pretty(registry).context("💀 could not serialize the subscription registry")?;
        tokio::fs::write(&temp_path, body)
            .await
            .with_context(|| format!("💀 could not write '{}'", temp_path.display()))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .with_context(|| format!("💀 could not replace registry '{}'", self.path.display()))
    }

    pub async fn get(&self, subscription: &str) -> Result<Option<Value>> {
        Ok(self.load().await?.remove(subscription))
    }
}

#[async_trait]
impl FilterPolicySetter for FileSubscriptionRegistry {
    async fn apply(&mut self, subscription: &str, policy: &FilterPolicy) -> Result<ApplyOutcome> {
        let mut registry = self.load().await?;
        let wanted = policy.as_json();
        if registry.get(subscription) == Some(&wanted) {
            info!(subscription, "🧹 filter policy already in place; nothing to do");
            return Ok(ApplyOutcome::Unchanged);
        }
        registry.insert(subscription.to_string(), wanted);
        self.store(&registry).await?;
        info!(subscription, registry = %self.path.display(), "🧹 filter policy applied");
        Ok(ApplyOutcome::Applied)
    }
}

/// 🧪 A registry that lives in a map. Clones share it.
#[derive(Debug, Clone, Default)]
pub struct InMemorySubscriptionRegistry {
    policies: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl InMemorySubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, subscription: &str) -> Option<Value> {
        self.policies.lock().await.get(subscription).cloned()
    }
}

#[async_trait]
impl FilterPolicySetter for InMemorySubscriptionRegistry {
    async fn apply(&mut self, subscription: &str, policy: &FilterPolicy) -> Result<ApplyOutcome> {
        let mut policies = self.policies.lock().await;
        let wanted = policy.as_json();
        if policies.get(subscription) == Some(&wanted) {
            return Ok(ApplyOutcome::Unchanged);
        }
        policies.insert(subscription.to_string(), wanted);
        Ok(ApplyOutcome::Applied)
    }
}
