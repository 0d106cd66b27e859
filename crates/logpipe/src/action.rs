// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Action plugin contract and per-action match conditions.
//!
//! Every processor owns its own instance of every configured action, built
//! from an [`ActionFactory`]. An action sees one event at a time and answers
//! with an [`ActionResult`]:
//!
//! - `Pass` hands the event to the next action;
//! - `Discard` drops it from the chain, it is still committed;
//! - `Collapse` commits it and asks for the next event of the same stream;
//! - `Hold` gives the event to the action, see [`Action::hold`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::errors::{ConfigError, Error};
use crate::event::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionResult {
    Pass,
    Discard,
    Collapse,
    Hold,
}

pub trait Action: Send {
    /// Called once before the first event, with the handle used to give back
    /// held events.
    fn start(&mut self, _controller: ActionController) {}

    /// Called once after the last event. Holding actions should commit or
    /// propagate what they still hold.
    fn stop(&mut self) {}

    fn process(&mut self, event: &mut Event) -> ActionResult;

    /// Takes ownership of an event this action answered `Hold` for.
    ///
    /// Returning the event back means the action does not actually hold
    /// events, which is a broken plugin and stops the pipeline.
    fn hold(&mut self, event: Box<Event>) -> Result<(), Box<Event>> {
        Err(event)
    }
}

/// Builds one action instance per processor.
pub type ActionFactory = Arc<dyn Fn() -> Box<dyn Action> + Send + Sync>;

#[derive(Debug)]
pub(crate) enum Control {
    Commit(Box<Event>),
    Propagate(Box<Event>),
}

/// Returns held events to the processor that owns the action.
#[derive(Clone, Debug)]
pub struct ActionController {
    index: usize,
    tx: mpsc::UnboundedSender<Control>,
}

impl ActionController {
    pub(crate) fn new(index: usize, tx: mpsc::UnboundedSender<Control>) -> Self {
        Self { index, tx }
    }

    /// Position of the action in the chain.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Commits a held event without sending it.
    pub fn commit(&self, event: Box<Event>) -> Result<(), Error> {
        self.tx
            .send(Control::Commit(event))
            .map_err(|_| Error::Stopped)
    }

    /// Re-injects a held event; it resumes at the action after this one.
    pub fn propagate(&self, mut event: Box<Event>) -> Result<(), Error> {
        event.action = self.index + 1;
        self.tx
            .send(Control::Propagate(event))
            .map_err(|_| Error::Stopped)
    }
}

/// Opaque boolean condition evaluated before an action runs.
pub trait Predicate: Send + Sync {
    fn check(&self, event: &Event) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    fn check(&self, event: &Event) -> bool {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    And,
    Or,
}

enum FieldMatcher {
    Exact(String),
    Regex(Regex),
}

impl FieldMatcher {
    fn parse(field: &str, value: &str) -> Result<Self, ConfigError> {
        match value
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
        {
            Some(pattern) if value.len() >= 2 => Regex::new(pattern)
                .map(FieldMatcher::Regex)
                .map_err(|source| ConfigError::InvalidMatch {
                    field: field.to_string(),
                    source,
                }),
            _ => Ok(FieldMatcher::Exact(value.to_string())),
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            FieldMatcher::Exact(expected) => expected == value,
            FieldMatcher::Regex(re) => re.is_match(value),
        }
    }
}

/// Decides whether an action sees an event at all.
///
/// Field conditions compare the text of a dot-separated field with either an
/// exact value or, when written as `/pattern/`, a regex. A missing field never
/// matches. With no field conditions every event matches and `invert` has no
/// effect. An attached [`Predicate`] is ANDed with the field result.
#[derive(Default)]
pub struct MatchConditions {
    fields: Vec<(String, FieldMatcher)>,
    mode: MatchMode,
    invert: bool,
    predicate: Option<Arc<dyn Predicate>>,
}

impl MatchConditions {
    pub fn new(
        fields: &BTreeMap<String, String>,
        mode: MatchMode,
        invert: bool,
    ) -> Result<Self, ConfigError> {
        let fields = fields
            .iter()
            .map(|(field, value)| Ok((field.clone(), FieldMatcher::parse(field, value)?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self {
            fields,
            mode,
            invert,
            predicate: None,
        })
    }

    #[must_use]
    pub fn with_predicate(mut self, predicate: Arc<dyn Predicate>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        let fields_match = if self.fields.is_empty() {
            true
        } else {
            let mut results = self.fields.iter().map(|(field, matcher)| {
                event
                    .field_str(field)
                    .is_some_and(|value| matcher.matches(&value))
            });
            let matched = match self.mode {
                MatchMode::And => results.all(|m| m),
                MatchMode::Or => results.any(|m| m),
            };
            matched != self.invert
        };
        fields_match && self.predicate.as_ref().is_none_or(|p| p.check(event))
    }
}

impl fmt::Debug for MatchConditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchConditions")
            .field(
                "fields",
                &self.fields.iter().map(|(k, _)| k).collect::<Vec<_>>(),
            )
            .field("mode", &self.mode)
            .field("invert", &self.invert)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// A configured step of the chain: its conditions plus the factory of its
/// per-processor instances.
#[derive(Clone)]
pub struct ActionSpec {
    pub name: String,
    pub conditions: Arc<MatchConditions>,
    pub factory: ActionFactory,
}

impl ActionSpec {
    pub fn new(name: impl Into<String>, factory: ActionFactory) -> Self {
        Self {
            name: name.into(),
            conditions: Arc::new(MatchConditions::default()),
            factory,
        }
    }

    #[must_use]
    pub fn with_conditions(mut self, conditions: MatchConditions) -> Self {
        self.conditions = Arc::new(conditions);
        self
    }
}

impl fmt::Debug for ActionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionSpec")
            .field("name", &self.name)
            .field("conditions", &self.conditions)
            .finish_non_exhaustive()
    }
}
