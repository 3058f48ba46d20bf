//! Identifiers of scheduling components

use serde::{Deserialize, Serialize};
use std::fmt;

/// Request dispatcher identifier, also the key of a deployed application
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DispatcherId(pub u64);

impl fmt::Display for DispatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dispatcher-{}", self.0)
    }
}

/// Application VM identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AvmId(pub u64);

impl fmt::Display for AvmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "avm-{}", self.0)
    }
}
