use std::{collections::BTreeMap, fmt, str::FromStr};

use kube::Resource;
use serde::Deserialize;

pub const TARGET_LABEL_KEY: &str = "mycontroller";
pub const TARGET_LABEL_VALUE: &str = "mycontroller";
pub const RESULT_LABEL_KEY: &str = "processed";
pub const RESULT_LABEL_VALUE: &str = "processed";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseLabelError {
    #[error("label requirement {0:?} is not in `key=value` form")]
    MissingSeparator(String),
    #[error("label requirement {0:?} has an empty key or value")]
    Empty(String),
}

/// A single `key=value` equality requirement on an object's labels.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct LabelRequirement {
    pub key: String,
    pub value: String,
}

impl LabelRequirement {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        matches(labels, &self.key, &self.value)
    }

    /// Same as [`LabelRequirement::matches`], on an object whose label map may be absent.
    pub fn matches_object<K: Resource>(&self, object: &K) -> bool {
        object
            .meta()
            .labels
            .as_ref()
            .map_or(false, |labels| self.matches(labels))
    }
}

impl fmt::Display for LabelRequirement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl FromStr for LabelRequirement {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| ParseLabelError::MissingSeparator(s.to_string()))?;
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            return Err(ParseLabelError::Empty(s.to_string()));
        }
        Ok(Self::new(key, value))
    }
}

impl TryFrom<String> for LabelRequirement {
    type Error = ParseLabelError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Does the label set carry `key=value`
pub fn matches(labels: &BTreeMap<String, String>, key: &str, value: &str) -> bool {
    labels.get(key).map_or(false, |v| v == value)
}

/// What the reconciler has to do to an object's labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelChange {
    /// Target label present, result label missing
    Add,
    /// Result label present, target label gone
    Remove,
    None,
}

/// The pair of labels the controller manages: whenever `target` is present,
/// `result` must be present too, and vice versa.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelRules {
    pub target: LabelRequirement,
    pub result: LabelRequirement,
}

impl Default for LabelRules {
    fn default() -> Self {
        Self {
            target: LabelRequirement::new(TARGET_LABEL_KEY, TARGET_LABEL_VALUE),
            result: LabelRequirement::new(RESULT_LABEL_KEY, RESULT_LABEL_VALUE),
        }
    }
}

impl LabelRules {
    pub fn new(target: LabelRequirement, result: LabelRequirement) -> Self {
        Self { target, result }
    }

    pub fn is_target<K: Resource>(&self, object: &K) -> bool {
        self.target.matches_object(object)
    }

    pub fn is_result<K: Resource>(&self, object: &K) -> bool {
        self.result.matches_object(object)
    }

    pub fn desired_change(&self, labels: &BTreeMap<String, String>) -> LabelChange {
        match (self.target.matches(labels), self.result.matches(labels)) {
            (true, false) => LabelChange::Add,
            (false, true) => LabelChange::Remove,
            _ => LabelChange::None,
        }
    }

    /// Mutate `labels` according to `change`. Only the result label is touched.
    pub fn apply(&self, change: LabelChange, labels: &mut BTreeMap<String, String>) {
        match change {
            LabelChange::Add => {
                labels.insert(self.result.key.clone(), self.result.value.clone());
            }
            LabelChange::Remove => {
                labels.remove(&self.result.key);
            }
            LabelChange::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_matches_ignores_other_labels() {
        let target = LabelRules::default().target;
        assert!(target.matches(&labels(&[("mycontroller", "mycontroller")])));
        assert!(target.matches(&labels(&[
            ("app", "nginx"),
            ("mycontroller", "mycontroller"),
            ("tier", "frontend"),
        ])));
        assert!(!target.matches(&labels(&[("mycontroller", "other")])));
        assert!(!target.matches(&labels(&[("app", "mycontroller")])));
        assert!(!target.matches(&BTreeMap::new()));
    }

    #[test]
    fn test_desired_change() {
        let rules = LabelRules::default();
        assert_eq!(
            rules.desired_change(&labels(&[("mycontroller", "mycontroller")])),
            LabelChange::Add
        );
        assert_eq!(
            rules.desired_change(&labels(&[("processed", "processed")])),
            LabelChange::Remove
        );
        assert_eq!(
            rules.desired_change(&labels(&[
                ("mycontroller", "mycontroller"),
                ("processed", "processed"),
            ])),
            LabelChange::None
        );
        assert_eq!(
            rules.desired_change(&labels(&[("app", "nginx")])),
            LabelChange::None
        );
        // `processed` with a foreign value is not ours to remove
        assert_eq!(
            rules.desired_change(&labels(&[("processed", "manually")])),
            LabelChange::None
        );
    }

    #[test]
    fn test_apply_only_touches_result_label() {
        let rules = LabelRules::default();

        let mut set = labels(&[("app", "nginx"), ("mycontroller", "mycontroller")]);
        rules.apply(LabelChange::Add, &mut set);
        assert_eq!(
            set,
            labels(&[
                ("app", "nginx"),
                ("mycontroller", "mycontroller"),
                ("processed", "processed"),
            ])
        );

        let mut set = labels(&[("app", "nginx"), ("processed", "processed")]);
        rules.apply(LabelChange::Remove, &mut set);
        assert_eq!(set, labels(&[("app", "nginx")]));
    }

    #[test]
    fn test_parse_requirement() {
        assert_eq!(
            "team=payments".parse(),
            Ok(LabelRequirement::new("team", "payments"))
        );
        assert_eq!(
            "team".parse::<LabelRequirement>(),
            Err(ParseLabelError::MissingSeparator("team".to_string()))
        );
        assert_eq!(
            "=payments".parse::<LabelRequirement>(),
            Err(ParseLabelError::Empty("=payments".to_string()))
        );
        assert_eq!(LabelRequirement::new("a", "b").to_string(), "a=b");
    }
}
