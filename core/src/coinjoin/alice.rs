use bitcoin::{Amount, OutPoint, ScriptBuf};
use std::fmt;
use uuid::Uuid;

/// Identifier handed back to a participant after input registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AliceId(Uuid);

impl AliceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AliceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A participant's registered input within a round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alice {
    pub id: AliceId,
    /// The unspent output committed to the mix
    pub input: OutPoint,
    /// Value of `input`, as reported by the participant and checked upstream
    pub amount: Amount,
    /// Where the surplus above the denomination goes, if anywhere
    pub change_script: Option<ScriptBuf>,
    pub connection_confirmed: bool,
}

impl Alice {
    pub fn new(input: OutPoint, amount: Amount, change_script: Option<ScriptBuf>) -> Self {
        Self {
            id: AliceId::new(),
            input,
            amount,
            change_script,
            connection_confirmed: false,
        }
    }
}
