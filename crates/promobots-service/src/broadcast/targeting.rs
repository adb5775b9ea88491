//! Broadcast targeting: conjunctive predicates over a user snapshot.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Read-only view of a user's state used to decide broadcast inclusion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSnapshot {
    /// Empty when the user is not inside any scenario.
    pub active_scenario_id: String,
    pub has_paid_any_product: bool,
}

/// Ordered list of condition tags that must all hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Targeting {
    #[serde(default)]
    pub conditions: Vec<String>,
}

impl Targeting {
    pub fn new<I, S>(conditions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            conditions: conditions.into_iter().map(Into::into).collect(),
        }
    }

    /// Tags outside the known vocabulary. Any of these makes the clause match nobody.
    pub fn unknown_conditions(&self) -> Vec<&str> {
        self.conditions
            .iter()
            .map(String::as_str)
            .filter(|tag| Condition::parse(tag).is_none())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    NoActiveScenario,
    HasNotPaid,
}

impl Condition {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "no_active_scenario" => Some(Self::NoActiveScenario),
            "has_not_paid" => Some(Self::HasNotPaid),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoActiveScenario => "no_active_scenario",
            Self::HasNotPaid => "has_not_paid",
        }
    }

    pub fn evaluate(self, snapshot: &UserSnapshot) -> bool {
        match self {
            Self::NoActiveScenario => snapshot.active_scenario_id.is_empty(),
            Self::HasNotPaid => !snapshot.has_paid_any_product,
        }
    }
}

/// Decides which users a broadcast reaches.
pub trait TargetResolver: Send + Sync {
    fn matches(&self, snapshot: &UserSnapshot, targeting: Option<&Targeting>) -> bool;

    /// Chat ids of every matching user, in map iteration order.
    fn select(
        &self,
        users: &HashMap<i64, UserSnapshot>,
        targeting: Option<&Targeting>,
    ) -> Vec<i64> {
        users
            .iter()
            .filter(|(_, snapshot)| self.matches(snapshot, targeting))
            .map(|(chat_id, _)| *chat_id)
            .collect()
    }
}

/// Resolver over the closed [`Condition`] vocabulary. Unknown tags fail closed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionResolver;

impl TargetResolver for ConditionResolver {
    fn matches(&self, snapshot: &UserSnapshot, targeting: Option<&Targeting>) -> bool {
        let Some(targeting) = targeting else {
            return true;
        };
        targeting.conditions.iter().all(|tag| {
            Condition::parse(tag).is_some_and(|condition| condition.evaluate(snapshot))
        })
    }
}
