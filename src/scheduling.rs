//! Node-selector requirement engine
//!
//! Requirements are the currency of the launch pipeline: NodeClaims carry
//! them, instance types advertise them, offerings pin them down to a single
//! zone and capacity type. This module provides the typed operator algebra
//! used to filter one against the other.

use std::collections::{BTreeMap, BTreeSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A node-selector requirement as carried on NodeClaims and NodeClass status
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorRequirement {
    /// Label key the requirement applies to
    pub key: String,
    /// One of In, NotIn, Exists, DoesNotExist
    pub operator: String,
    /// Values for In/NotIn operators
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    /// Minimum number of distinct values the final instance-type set must
    /// still cover for this key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_values: Option<usize>,
}

/// Typed requirement operator
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operator {
    /// Label value must be one of the given values
    In(BTreeSet<String>),
    /// Label value must not be one of the given values
    NotIn(BTreeSet<String>),
    /// Label must be present
    Exists,
    /// Label must be absent
    DoesNotExist,
}

/// A single keyed requirement
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    /// Label key the requirement applies to
    pub key: String,
    /// Operator and operand values
    pub operator: Operator,
    /// Minimum distinct-value coverage demanded by the NodeClaim
    pub min_values: Option<usize>,
}

impl Requirement {
    /// Requirement with the `In` operator over the given values
    pub fn new_in<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            operator: Operator::In(values.into_iter().map(Into::into).collect()),
            min_values: None,
        }
    }

    /// Requirement with the `Exists` operator
    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: Operator::Exists,
            min_values: None,
        }
    }

    /// Requirement with the `DoesNotExist` operator
    pub fn does_not_exist(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: Operator::DoesNotExist,
            min_values: None,
        }
    }

    /// True when `value` satisfies this requirement
    pub fn has(&self, value: &str) -> bool {
        match &self.operator {
            Operator::In(values) => values.contains(value),
            Operator::NotIn(values) => !values.contains(value),
            Operator::Exists => true,
            Operator::DoesNotExist => false,
        }
    }

    /// The allowed values for an `In` requirement, empty otherwise
    pub fn values(&self) -> Vec<&str> {
        match &self.operator {
            Operator::In(values) => values.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Any single allowed value; offerings hold exactly one
    pub fn any(&self) -> Option<&str> {
        match &self.operator {
            Operator::In(values) => values.iter().next().map(String::as_str),
            _ => None,
        }
    }

    /// Number of allowed values for an `In` requirement
    pub fn len(&self) -> usize {
        match &self.operator {
            Operator::In(values) => values.len(),
            _ => 0,
        }
    }

    /// True for an `In` requirement with no values left
    pub fn is_empty(&self) -> bool {
        matches!(&self.operator, Operator::In(values) if values.is_empty())
    }

    /// Insert a value into an `In` requirement (no-op for other operators)
    pub fn insert(&mut self, value: impl Into<String>) {
        if let Operator::In(values) = &mut self.operator {
            values.insert(value.into());
        }
    }

    /// True when some label value can satisfy both requirements
    pub fn intersects(&self, other: &Requirement) -> bool {
        use Operator::*;
        match (&self.operator, &other.operator) {
            (In(a), In(b)) => a.intersection(b).next().is_some(),
            (In(a), NotIn(b)) | (NotIn(b), In(a)) => a.difference(b).next().is_some(),
            (In(a), Exists) | (Exists, In(a)) => !a.is_empty(),
            (In(_), DoesNotExist) | (DoesNotExist, In(_)) => false,
            (Exists, DoesNotExist) | (DoesNotExist, Exists) => false,
            // two exclusion sets, or anything involving absence-tolerant
            // operators, can always be satisfied together
            (NotIn(_), _) | (_, NotIn(_)) => true,
            (Exists, Exists) | (DoesNotExist, DoesNotExist) => true,
        }
    }
}

impl From<&NodeSelectorRequirement> for Requirement {
    fn from(req: &NodeSelectorRequirement) -> Self {
        let values: BTreeSet<String> = req.values.iter().cloned().collect();
        let operator = match req.operator.as_str() {
            "NotIn" => Operator::NotIn(values),
            "Exists" => Operator::Exists,
            "DoesNotExist" => Operator::DoesNotExist,
            // unknown operators degrade to In, the most restrictive choice
            _ => Operator::In(values),
        };
        Self {
            key: req.key.clone(),
            operator,
            min_values: req.min_values,
        }
    }
}

/// A set of requirements keyed by label
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Requirements(BTreeMap<String, Requirement>);

impl Requirements {
    /// Build requirements from individual entries; later entries replace
    /// earlier ones with the same key
    pub fn new(requirements: impl IntoIterator<Item = Requirement>) -> Self {
        let mut map = BTreeMap::new();
        for req in requirements {
            map.insert(req.key.clone(), req);
        }
        Self(map)
    }

    /// Build requirements from the wire representation
    pub fn from_node_selector(requirements: &[NodeSelectorRequirement]) -> Self {
        Self::new(requirements.iter().map(Requirement::from))
    }

    /// Insert a requirement, replacing any existing one for the key
    pub fn add(&mut self, requirement: Requirement) {
        self.0.insert(requirement.key.clone(), requirement);
    }

    /// Look up the requirement for a key
    pub fn get(&self, key: &str) -> Option<&Requirement> {
        self.0.get(key)
    }

    /// Mutable lookup, used while assembling instance-type labels
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Requirement> {
        self.0.get_mut(key)
    }

    /// Iterate all requirements
    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.0.values()
    }

    /// True when any requirement carries `minValues`
    pub fn has_min_values(&self) -> bool {
        self.0.values().any(|r| r.min_values.is_some())
    }

    /// True when the two requirement sets can be satisfied together
    ///
    /// Keys defined on only one side are tolerated; a conflict requires both
    /// sides to constrain the same key with an empty intersection.
    pub fn compatible(&self, other: &Requirements) -> bool {
        self.0.values().all(|req| match other.get(&req.key) {
            Some(other_req) => req.intersects(other_req),
            None => true,
        })
    }

    /// Labels derivable from single-valued requirements
    pub fn single_valued_labels(&self) -> BTreeMap<String, String> {
        self.0
            .values()
            .filter_map(|r| match &r.operator {
                Operator::In(values) if values.len() == 1 => {
                    Some((r.key.clone(), values.iter().next().unwrap().clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Render back to the wire representation
    pub fn to_node_selector(&self) -> Vec<NodeSelectorRequirement> {
        self.0
            .values()
            .map(|r| {
                let (operator, values) = match &r.operator {
                    Operator::In(v) => ("In", v.iter().cloned().collect()),
                    Operator::NotIn(v) => ("NotIn", v.iter().cloned().collect()),
                    Operator::Exists => ("Exists", Vec::new()),
                    Operator::DoesNotExist => ("DoesNotExist", Vec::new()),
                };
                NodeSelectorRequirement {
                    key: r.key.clone(),
                    operator: operator.to_string(),
                    values,
                    min_values: r.min_values,
                }
            })
            .collect()
    }
}

impl FromIterator<Requirement> for Requirements {
    fn from_iter<T: IntoIterator<Item = Requirement>>(iter: T) -> Self {
        Self::new(iter)
    }
}
