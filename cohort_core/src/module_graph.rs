//! Engine module state graphs.
//!
//! A module is a JSON document whose `states` object maps state names to
//! states. Each state has a `type` and one or more `*_transition` fields.
//! Probability-weighted alternatives appear in two places:
//! - `distributed_transition`: `[{ "distribution": p, "transition": "Next" }, ...]`
//! - each `complex_transition` branch carrying `distributions: [...]`
//!
//! Those lists are the decision lists this module validates and rewrites.
//! The parsed document is kept alongside the graph so that everything a
//! calibration does not touch is serialized back unchanged.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Allowed deviation of a decision list total from 1.0
pub const PROBABILITY_TOLERANCE: f64 = 1e-6;

const CONDITION_ONSET: &str = "ConditionOnset";
const TERMINAL: &str = "Terminal";

/// Location of one decision list inside a module
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecisionPoint {
    pub state: String,
    /// Index into `complex_transition`; `None` addresses `distributed_transition`
    #[serde(default)]
    pub branch: Option<usize>,
}

impl DecisionPoint {
    pub fn state(name: impl Into<String>) -> Self {
        Self {
            state: name.into(),
            branch: None,
        }
    }

    pub fn complex_branch(name: impl Into<String>, branch: usize) -> Self {
        Self {
            state: name.into(),
            branch: Some(branch),
        }
    }
}

impl fmt::Display for DecisionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.branch {
            Some(branch) => write!(f, "{}[branch {}]", self.state, branch),
            None => f.write_str(&self.state),
        }
    }
}

/// A weighted transition to another state
#[derive(Clone, Debug, PartialEq)]
pub struct Edge {
    pub target: String,
    /// `None` for parameterised (attribute-driven) distributions
    pub probability: Option<f64>,
}

/// An ordered list of weighted alternatives
#[derive(Clone, Debug)]
pub struct DecisionList {
    pub branch: Option<usize>,
    pub edges: Vec<Edge>,
}

impl DecisionList {
    /// True when every edge carries a literal probability
    pub fn is_numeric(&self) -> bool {
        self.edges.iter().all(|e| e.probability.is_some())
    }

    /// Sum of literal probabilities, `None` if any edge is parameterised
    pub fn total(&self) -> Option<f64> {
        self.edges.iter().map(|e| e.probability).sum()
    }
}

#[derive(Clone, Debug)]
pub struct State {
    pub name: String,
    pub kind: String,
    pub decisions: Vec<DecisionList>,
    successors: Vec<String>,
}

impl State {
    /// Every state this state may transition to, in declaration order
    pub fn successors(&self) -> &[String] {
        &self.successors
    }
}

/// Decision list edges split by what they eventually lead to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// Edge indices from which a condition onset is reachable
    pub condition: Vec<usize>,
    /// Edge indices that end without onset
    pub healthy: Vec<usize>,
}

/// Parsed module: the state graph plus the document it came from
#[derive(Clone, Debug)]
pub struct ModuleGraph {
    label: String,
    document: Value,
    states: Vec<State>,
    index: HashMap<String, usize>,
}

impl ModuleGraph {
    /// Parse module text, labelling errors with the document's `name`
    pub fn parse(text: &str) -> Result<Self> {
        let label = serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|v| v.get("name").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| "<module>".to_string());
        Self::parse_labeled(&label, text)
    }

    /// Parse module text, labelling errors with `label`
    pub fn parse_labeled(label: &str, text: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(text)
            .map_err(|e| Error::malformed(label, format!("invalid JSON: {}", e)))?;

        let raw_states = document
            .get("states")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::malformed(label, "missing 'states' object"))?;

        let mut states = Vec::with_capacity(raw_states.len());
        let mut index = HashMap::with_capacity(raw_states.len());

        for (name, raw) in raw_states {
            let state = parse_state(label, name, raw)?;
            index.insert(name.clone(), states.len());
            states.push(state);
        }

        let graph = Self {
            label: label.to_string(),
            document,
            states,
            index,
        };
        graph.check_invariants()?;

        tracing::debug!(
            "Parsed module '{}' with {} states",
            graph.label,
            graph.states.len()
        );
        Ok(graph)
    }

    /// Serialize the document, including any rewritten probabilities
    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.document)?)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self, name: &str) -> Option<&State> {
        self.index.get(name).map(|&i| &self.states[i])
    }

    /// States in document order
    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.states.iter()
    }

    pub fn decision_list(&self, point: &DecisionPoint) -> Result<&DecisionList> {
        let state = self.state(&point.state).ok_or_else(|| {
            Error::malformed(&self.label, format!("no state named '{}'", point.state))
        })?;
        state
            .decisions
            .iter()
            .find(|d| d.branch == point.branch)
            .ok_or_else(|| {
                Error::malformed(
                    &self.label,
                    format!("state '{}' is not a decision point", point),
                )
            })
    }

    /// Split a decision list into condition and healthy groups by reachability
    ///
    /// Traversal never re-enters the decision state itself. A branch that
    /// only loops back to it for a later re-check counts as healthy.
    pub fn classify(&self, point: &DecisionPoint) -> Result<Partition> {
        let list = self.decision_list(point)?;
        if !list.is_numeric() {
            return Err(Error::malformed(
                &self.label,
                format!("decision state '{}' uses parameterised distributions", point),
            ));
        }

        let mut partition = Partition {
            condition: Vec::new(),
            healthy: Vec::new(),
        };

        for (i, edge) in list.edges.iter().enumerate() {
            let reach = self.explore(&edge.target, &point.state);
            if reach.onset {
                partition.condition.push(i);
            } else if reach.terminal || reach.loops_back {
                partition.healthy.push(i);
            } else {
                return Err(Error::malformed(
                    &self.label,
                    format!(
                        "branch '{}' of decision state '{}' reaches neither condition onset nor a terminal state",
                        edge.target, point
                    ),
                ));
            }
        }

        if partition.condition.is_empty() {
            return Err(Error::malformed(
                &self.label,
                format!("no branch of decision state '{}' leads to condition onset", point),
            ));
        }
        if partition.healthy.is_empty() {
            return Err(Error::malformed(
                &self.label,
                format!("every branch of decision state '{}' leads to condition onset", point),
            ));
        }

        Ok(partition)
    }

    /// First decision list, in document order, that separates onset from health
    pub fn locate_decision_state(&self) -> Result<DecisionPoint> {
        for state in &self.states {
            for list in &state.decisions {
                let point = DecisionPoint {
                    state: state.name.clone(),
                    branch: list.branch,
                };
                if list.is_numeric() && self.classify(&point).is_ok() {
                    return Ok(point);
                }
            }
        }
        Err(Error::malformed(
            &self.label,
            "no decision state separates condition onset from a healthy outcome",
        ))
    }

    /// Replace the probabilities of one decision list, leaving all else intact
    pub fn set_probabilities(&mut self, point: &DecisionPoint, weights: &[f64]) -> Result<()> {
        let expected = self.decision_list(point)?.edges.len();
        if weights.len() != expected {
            return Err(Error::malformed(
                &self.label,
                format!(
                    "decision state '{}' has {} branches, got {} probabilities",
                    point,
                    expected,
                    weights.len()
                ),
            ));
        }
        check_total(&self.label, point, weights.iter().copied())?;

        let label = self.label.clone();
        let missing = || Error::malformed(&label, format!("decision list '{}' vanished", point));

        let raw_state = self
            .document
            .get_mut("states")
            .and_then(|s| s.get_mut(&point.state))
            .ok_or_else(missing)?;
        let raw_list = match point.branch {
            None => raw_state.get_mut("distributed_transition"),
            Some(branch) => raw_state
                .get_mut("complex_transition")
                .and_then(|c| c.get_mut(branch))
                .and_then(|b| b.get_mut("distributions")),
        }
        .and_then(Value::as_array_mut)
        .ok_or_else(missing)?;

        for (item, weight) in raw_list.iter_mut().zip(weights) {
            let number = serde_json::Number::from_f64(*weight).ok_or_else(|| {
                Error::malformed(&label, format!("probability {} is not finite", weight))
            })?;
            item.as_object_mut()
                .ok_or_else(missing)?
                .insert("distribution".to_string(), Value::Number(number));
        }

        let state_idx = self.index[&point.state];
        if let Some(list) = self.states[state_idx]
            .decisions
            .iter_mut()
            .find(|d| d.branch == point.branch)
        {
            for (edge, weight) in list.edges.iter_mut().zip(weights) {
                edge.probability = Some(*weight);
            }
        }

        Ok(())
    }

    fn check_invariants(&self) -> Result<()> {
        for state in &self.states {
            for list in &state.decisions {
                let point = DecisionPoint {
                    state: state.name.clone(),
                    branch: list.branch,
                };
                if list.is_numeric() {
                    check_total(
                        &self.label,
                        &point,
                        list.edges.iter().filter_map(|e| e.probability),
                    )?;
                }
            }
            for target in &state.successors {
                if !self.index.contains_key(target) {
                    return Err(Error::malformed(
                        &self.label,
                        format!(
                            "state '{}' transitions to unknown state '{}'",
                            state.name, target
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn explore(&self, start: &str, gate: &str) -> Reach {
        let mut reach = Reach::default();
        if start == gate {
            reach.loops_back = true;
            return reach;
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(start);
        visited.insert(start);

        while let Some(name) = queue.pop_front() {
            let Some(state) = self.state(name) else {
                continue;
            };
            match state.kind.as_str() {
                CONDITION_ONSET => {
                    reach.onset = true;
                    return reach;
                }
                TERMINAL => reach.terminal = true,
                _ => {}
            }
            for next in &state.successors {
                if next == gate {
                    reach.loops_back = true;
                } else if visited.insert(next.as_str()) {
                    queue.push_back(next);
                }
            }
        }
        reach
    }
}

/// What a branch can eventually lead to without passing its decision state
#[derive(Default)]
struct Reach {
    onset: bool,
    terminal: bool,
    loops_back: bool,
}

fn check_total(
    label: &str,
    point: &DecisionPoint,
    probabilities: impl Iterator<Item = f64>,
) -> Result<()> {
    let mut total = 0.0;
    for p in probabilities {
        if !p.is_finite() || p < 0.0 {
            return Err(Error::malformed(
                label,
                format!("decision state '{}' has invalid probability {}", point, p),
            ));
        }
        total += p;
    }
    if (total - 1.0).abs() > PROBABILITY_TOLERANCE {
        return Err(Error::malformed(
            label,
            format!(
                "decision state '{}' branch probabilities sum to {}, expected 1.0",
                point, total
            ),
        ));
    }
    Ok(())
}

fn parse_state(label: &str, name: &str, raw: &Value) -> Result<State> {
    let obj = raw
        .as_object()
        .ok_or_else(|| Error::malformed(label, format!("state '{}' is not an object", name)))?;
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::malformed(label, format!("state '{}' has no type", name)))?
        .to_string();

    let mut decisions = Vec::new();
    if let Some(list) = obj.get("distributed_transition") {
        decisions.push(DecisionList {
            branch: None,
            edges: parse_edges(label, name, list)?,
        });
    }
    if let Some(branches) = obj.get("complex_transition").and_then(Value::as_array) {
        for (i, branch) in branches.iter().enumerate() {
            if let Some(list) = branch.get("distributions") {
                decisions.push(DecisionList {
                    branch: Some(i),
                    edges: parse_edges(label, name, list)?,
                });
            }
        }
    }

    Ok(State {
        name: name.to_string(),
        kind,
        decisions,
        successors: collect_successors(obj),
    })
}

fn parse_edges(label: &str, state: &str, list: &Value) -> Result<Vec<Edge>> {
    let items = list.as_array().ok_or_else(|| {
        Error::malformed(label, format!("state '{}' has a non-list distribution", state))
    })?;

    items
        .iter()
        .map(|item| {
            let target = item
                .get("transition")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    Error::malformed(
                        label,
                        format!("state '{}' has a distribution without a transition", state),
                    )
                })?;
            let probability = match item.get("distribution") {
                Some(Value::Number(n)) => n.as_f64(),
                Some(_) => None,
                None => {
                    return Err(Error::malformed(
                        label,
                        format!(
                            "state '{}' branch to '{}' has no distribution",
                            state, target
                        ),
                    ))
                }
            };
            Ok(Edge {
                target: target.to_string(),
                probability,
            })
        })
        .collect()
}

fn collect_successors(obj: &Map<String, Value>) -> Vec<String> {
    let mut out = Vec::new();
    for (key, value) in obj {
        if key == "type_of_care_transition" {
            if let Some(targets) = value.as_object() {
                out.extend(targets.values().filter_map(Value::as_str).map(str::to_string));
            }
        } else if key.ends_with("_transition") {
            collect_targets(value, &mut out);
        }
    }

    let mut seen = HashSet::new();
    out.retain(|t| seen.insert(t.clone()));
    out
}

fn collect_targets(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(target) => out.push(target.clone()),
        Value::Array(items) => items.iter().for_each(|item| collect_targets(item, out)),
        Value::Object(map) => {
            if let Some(Value::String(target)) = map.get("transition") {
                out.push(target.clone());
            }
            for nested in ["distributions", "transitions"] {
                if let Some(inner) = map.get(nested) {
                    collect_targets(inner, out);
                }
            }
        }
        _ => {}
    }
}
