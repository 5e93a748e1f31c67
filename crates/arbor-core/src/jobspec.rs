use crate::{CoreError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Request type that marks a repeatable slot pattern
pub const SLOT_TYPE: &str = "slot";

/// Jobspec version understood by the matcher
pub const JOBSPEC_VERSION: u32 = 1;

/// Reduction applied to a count range when fewer resources are available than `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CountOperator {
    /// Shrink by subtracting the operand
    #[default]
    #[serde(rename = "+")]
    Add,
    /// Shrink by dividing by the operand
    #[serde(rename = "*")]
    Mul,
    /// Shrink to the previous value reachable by repeated squaring from `min`
    #[serde(rename = "^")]
    Pow,
}

impl fmt::Display for CountOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CountOperator::Add => write!(f, "+"),
            CountOperator::Mul => write!(f, "*"),
            CountOperator::Pow => write!(f, "^"),
        }
    }
}

fn default_operand() -> u64 {
    1
}

/// On-the-wire count: either a bare integer or the verbose mapping
#[derive(Deserialize)]
#[serde(untagged)]
enum CountSpec {
    Exact(u64),
    Range {
        min: u64,
        max: u64,
        #[serde(default)]
        operator: CountOperator,
        #[serde(default = "default_operand")]
        operand: u64,
    },
}

/// Count specification of a request node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CountSpec")]
pub struct Count {
    pub min: u64,
    pub max: u64,
    pub operator: CountOperator,
    pub operand: u64,
}

impl From<CountSpec> for Count {
    fn from(spec: CountSpec) -> Self {
        match spec {
            CountSpec::Exact(n) => Count::exact(n),
            CountSpec::Range {
                min,
                max,
                operator,
                operand,
            } => Count {
                min,
                max,
                operator,
                operand,
            },
        }
    }
}

impl Count {
    /// A count with `min == max == n`
    pub fn exact(n: u64) -> Self {
        Self {
            min: n,
            max: n,
            operator: CountOperator::Add,
            operand: 1,
        }
    }

    /// A count range shrinking from `max` towards `min` by `operator`/`operand`
    pub fn range(min: u64, max: u64, operator: CountOperator, operand: u64) -> Self {
        Self {
            min,
            max,
            operator,
            operand,
        }
    }
}

/// A node of the resource request tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceRequest {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub count: Count,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub with: Vec<ResourceRequest>,
    /// Demand of every descendant type, filled in when the request is primed
    #[serde(skip)]
    pub aggregate: BTreeMap<String, u64>,
}

impl ResourceRequest {
    /// Create a request for exactly `count` resources of `resource_type`
    pub fn new(resource_type: impl Into<String>, count: u64) -> Self {
        Self {
            resource_type: resource_type.into(),
            count: Count::exact(count),
            unit: None,
            label: None,
            id: None,
            exclusive: false,
            with: Vec::new(),
            aggregate: BTreeMap::new(),
        }
    }

    /// Create a slot pattern repeated `count` times
    pub fn slot(count: u64) -> Self {
        Self::new(SLOT_TYPE, count)
    }

    /// Replace the count specification
    pub fn with_count(mut self, count: Count) -> Self {
        self.count = count;
        self
    }

    /// Mark the request exclusive
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Set the label
    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Append a nested child request
    pub fn with_child(mut self, child: ResourceRequest) -> Self {
        self.with.push(child);
        self
    }

    /// Whether this node is the distinguished slot group
    pub fn is_slot(&self) -> bool {
        self.resource_type == SLOT_TYPE
    }

    /// Validate this node and its descendants
    pub fn validate(&self) -> Result<()> {
        if self.resource_type.is_empty() {
            return Err(CoreError::validation_failed(
                "resource",
                "type must not be empty",
                "Give every resource request a type such as node or core",
            ));
        }
        if self.count.min < 1 {
            return Err(CoreError::validation_failed(
                &self.resource_type,
                "count.min must be greater than zero",
                "Set count.min to at least 1",
            ));
        }
        if self.count.max < self.count.min {
            return Err(CoreError::validation_failed(
                &self.resource_type,
                format!(
                    "count.max ({}) must be greater than or equal to count.min ({})",
                    self.count.max, self.count.min
                ),
                "Raise count.max or lower count.min",
            ));
        }
        if self.count.operand < 1 {
            return Err(CoreError::validation_failed(
                &self.resource_type,
                "count.operand must be greater than zero",
                "Use an operand of at least 1",
            ));
        }
        if self.is_slot() && self.with.is_empty() {
            return Err(CoreError::validation_failed(
                SLOT_TYPE,
                "a slot must contain at least one resource",
                "Nest the per-slot resources under the slot's `with` list",
            ));
        }
        for child in &self.with {
            child.validate()?;
        }
        Ok(())
    }
}

fn string_or_seq<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Command {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Command::deserialize(deserializer)? {
        Command::One(s) => s.split_whitespace().map(str::to_string).collect(),
        Command::Many(v) => v,
    })
}

/// A task descriptor; carried through matching untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    #[serde(deserialize_with = "string_or_seq")]
    pub command: Vec<String>,
    /// Single `{kind: label}` pair binding the task to a slot
    pub slot: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub count: BTreeMap<String, serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_yaml::Value>,
}

impl Task {
    /// The slot binding as `(kind, label)`
    pub fn slot_binding(&self) -> Option<(&str, &str)> {
        self.slot
            .iter()
            .next()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A complete job request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Jobspec {
    pub version: u32,
    pub resources: Vec<ResourceRequest>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub attributes: BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,
}

impl Jobspec {
    /// Create a jobspec around a resource tree with no tasks or attributes
    pub fn new(resources: Vec<ResourceRequest>) -> Self {
        Self {
            version: JOBSPEC_VERSION,
            resources,
            tasks: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    /// Parse and validate a YAML jobspec
    pub fn from_yaml(data: &str) -> Result<Self> {
        let jobspec: Jobspec = crate::from_yaml(data)?;
        jobspec.validate()?;
        Ok(jobspec)
    }

    /// Read, parse and validate a YAML jobspec file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            CoreError::invalid_jobspec(
                format!("cannot read {}: {}", path.display(), e),
                "Check that the jobspec path exists and is readable",
            )
        })?;
        Self::from_yaml(&data)
    }

    /// Set `attributes.system.duration`
    pub fn with_duration(mut self, duration: u64) -> Self {
        self.attributes
            .entry("system".to_string())
            .or_default()
            .insert("duration".to_string(), serde_yaml::Value::from(duration));
        self
    }

    fn duration_value(&self) -> Option<&serde_yaml::Value> {
        self.attributes.get("system")?.get("duration")
    }

    /// Requested duration from `attributes.system.duration`, if it is a
    /// whole number of seconds
    pub fn duration(&self) -> Option<u64> {
        match self.duration_value()? {
            serde_yaml::Value::Number(n) => n.as_u64().or_else(|| {
                n.as_f64()
                    .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                    .map(|f| f as u64)
            }),
            serde_yaml::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Validate the whole document
    pub fn validate(&self) -> Result<()> {
        if self.version != JOBSPEC_VERSION {
            return Err(CoreError::invalid_jobspec(
                format!("unsupported version {}", self.version),
                format!("Set version to {}", JOBSPEC_VERSION),
            ));
        }
        if self.resources.is_empty() {
            return Err(CoreError::invalid_jobspec(
                "no resources requested",
                "Add at least one entry to the resources section",
            ));
        }
        for resource in &self.resources {
            resource.validate()?;
        }
        if self.duration_value().is_some() && !self.duration().is_some_and(|d| d > 0) {
            return Err(CoreError::invalid_jobspec(
                "attributes.system.duration must be a positive whole number of seconds",
                "Set the duration to e.g. 3600, or leave it out to use the default",
            ));
        }
        for task in &self.tasks {
            if task.slot.len() != 1 {
                return Err(CoreError::invalid_jobspec(
                    "task slot must contain a single key/value pair",
                    "Bind the task with e.g. `slot: {label: default}`",
                ));
            }
            if task.command.is_empty() {
                return Err(CoreError::invalid_jobspec(
                    "task command is empty",
                    "Give each task a command",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE_JOBSPEC: &str = r#"
version: 1
resources:
  - type: node
    count: 1
    exclusive: true
    with:
      - type: slot
        count: {min: 2, max: 8, operator: "+", operand: 2}
        label: default
        with:
          - type: core
            count: 2
tasks:
  - command: app --verbose
    slot: {label: default}
    count: {per_slot: 1}
attributes:
  system:
    duration: 3600
"#;

    #[test]
    fn test_parse_jobspec() {
        let jobspec = Jobspec::from_yaml(NODE_JOBSPEC).unwrap();
        assert_eq!(jobspec.resources.len(), 1);

        let node = &jobspec.resources[0];
        assert_eq!(node.resource_type, "node");
        assert!(node.exclusive);
        assert_eq!(node.count, Count::exact(1));

        let slot = &node.with[0];
        assert!(slot.is_slot());
        assert_eq!(slot.count, Count::range(2, 8, CountOperator::Add, 2));
        assert_eq!(slot.label.as_deref(), Some("default"));
        assert_eq!(slot.with[0].count.max, 2);

        assert_eq!(jobspec.duration(), Some(3600));
        assert_eq!(jobspec.tasks[0].command, vec!["app", "--verbose"]);
        assert_eq!(jobspec.tasks[0].slot_binding(), Some(("label", "default")));
    }

    #[test]
    fn test_reject_min_above_max() {
        let doc = r#"
version: 1
resources:
  - type: core
    count: {min: 4, max: 2}
"#;
        let err = Jobspec::from_yaml(doc).unwrap_err();
        assert!(matches!(err, CoreError::ValidationFailed { .. }));
    }

    #[test]
    fn test_reject_zero_min() {
        let jobspec = Jobspec::new(vec![ResourceRequest::new("core", 0)]);
        assert!(jobspec.validate().is_err());
    }

    #[test]
    fn test_reject_empty_resources() {
        let jobspec = Jobspec::new(Vec::new());
        assert!(matches!(
            jobspec.validate(),
            Err(CoreError::InvalidJobspec { .. })
        ));
    }

    #[test]
    fn test_reject_unknown_key() {
        let doc = r#"
version: 1
resources:
  - type: core
    count: 1
    colour: blue
"#;
        assert!(Jobspec::from_yaml(doc).is_err());
    }

    fn create_test_doc(duration: &str) -> String {
        format!(
            r#"
version: 1
resources:
  - type: core
    count: 1
attributes:
  system:
    duration: {}
"#,
            duration
        )
    }

    #[test]
    fn test_reject_bad_duration() {
        for duration in ["0", "-5", "1.5", "soon"] {
            let err = Jobspec::from_yaml(&create_test_doc(duration)).unwrap_err();
            assert!(matches!(err, CoreError::InvalidJobspec { .. }), "{}", duration);
        }

        let jobspec = Jobspec::from_yaml(&create_test_doc("60.0")).unwrap();
        assert_eq!(jobspec.duration(), Some(60));
        let jobspec = Jobspec::from_yaml(&create_test_doc("\"90\"")).unwrap();
        assert_eq!(jobspec.duration(), Some(90));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.yaml");
        std::fs::write(&path, NODE_JOBSPEC).unwrap();

        let jobspec = Jobspec::from_file(&path).unwrap();
        assert_eq!(jobspec.resources[0].resource_type, "node");

        assert!(Jobspec::from_file(dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_builder_and_duration() {
        let jobspec = Jobspec::new(vec![ResourceRequest::new("node", 1)
            .exclusive()
            .with_child(ResourceRequest::new("core", 4))])
        .with_duration(10);

        assert!(jobspec.validate().is_ok());
        assert_eq!(jobspec.duration(), Some(10));
        assert!(jobspec.resources[0].with[0].aggregate.is_empty());
    }
}
