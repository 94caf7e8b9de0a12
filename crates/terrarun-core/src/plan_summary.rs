//! Plan output summary extraction.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Resource change counts reported by a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub import: u32,
    pub add: u32,
    pub change: u32,
    pub destroy: u32,
}

fn plan_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"Plan: (?:(\d+) to import, )?(\d+) to add, (\d+) to change, (\d+) to destroy\.",
        )
        .expect("plan summary pattern is valid")
    })
}

impl PlanSummary {
    /// Parse plan output. Returns `None` when the output has neither a
    /// `Plan:` line nor a no-changes marker.
    pub fn parse(output: &str) -> Option<Self> {
        if let Some(caps) = plan_line().captures(output) {
            let num = |i: usize| {
                caps.get(i)
                    .and_then(|m| m.as_str().parse::<u32>().ok())
                    .unwrap_or(0)
            };
            return Some(Self {
                import: num(1),
                add: num(2),
                change: num(3),
                destroy: num(4),
            });
        }
        if output.contains("No changes.") {
            return Some(Self::default());
        }
        None
    }

    pub fn has_changes(&self) -> bool {
        [self.import, self.add, self.change, self.destroy]
            .iter()
            .any(|&n| n > 0)
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_changes() {
            return f.write_str("No changes.");
        }
        if self.import > 0 {
            write!(f, "{} to import, ", self.import)?;
        }
        write!(
            f,
            "{} to add, {} to change, {} to destroy.",
            self.add, self.change, self.destroy
        )
    }
}
