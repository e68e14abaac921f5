//! Per-operation context passed explicitly through every call chain.

use std::fmt;

use uuid::Uuid;

use crate::models::IndexKind;
use crate::window::Cadence;

/// What started an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Consumer {
        topic: String,
        group: String,
        offset: u64,
    },
    Sweep {
        cadence: Cadence,
        index: IndexKind,
    },
    Cli,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Consumer {
                topic,
                group,
                offset,
            } => write!(f, "consumer {}@{}#{}", group, topic, offset),
            Origin::Sweep { cadence, index } => write!(f, "sweep {}/{}", cadence, index),
            Origin::Cli => f.write_str("cli"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    pub id: Uuid,
    pub origin: Origin,
}

impl OperationContext {
    pub fn new(origin: Origin) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin,
        }
    }

    pub fn consumer(topic: &str, group: &str, offset: u64) -> Self {
        Self::new(Origin::Consumer {
            topic: topic.to_string(),
            group: group.to_string(),
            offset,
        })
    }

    pub fn sweep(cadence: Cadence, index: IndexKind) -> Self {
        Self::new(Origin::Sweep { cadence, index })
    }

    pub fn cli() -> Self {
        Self::new(Origin::Cli)
    }
}
