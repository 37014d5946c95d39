//! Which tools a mode may use

use super::types::{ToolDef, MODE_ACT};

pub trait ModePolicy: Send + Sync {
    fn allows(&self, mode: &str, def: &ToolDef) -> bool;
}

/// `act` allows everything. Every other mode, `plan` included, is read-only.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultModePolicy;

impl ModePolicy for DefaultModePolicy {
    fn allows(&self, mode: &str, def: &ToolDef) -> bool {
        mode.trim().eq_ignore_ascii_case(MODE_ACT) || !def.mutating
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::types::MODE_PLAN;
    use serde_json::Value;

    #[test]
    fn plan_hides_mutating_tools() {
        let write = ToolDef::new("write_file", "", Value::Null).mutating(true);
        let read = ToolDef::new("read_file", "", Value::Null);
        let policy = DefaultModePolicy;

        assert!(!policy.allows(MODE_PLAN, &write));
        assert!(policy.allows(MODE_PLAN, &read));
        assert!(policy.allows(MODE_ACT, &write));
        assert!(!policy.allows("review", &write));
    }
}
