use thiserror::Error;

/// A turn tried to make more tool calls than it was allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Tool call limit exceeded ({attempted} calls attempted, max {limit})")]
pub struct BudgetExceeded {
    pub limit: u32,
    pub attempted: u32,
}

/// Per-turn tool-call counter.
///
/// [`charge`](Self::charge) must be called before the tool's side effect runs:
/// the call that pushes the counter past the limit is refused, so a turn can
/// make exactly `max_calls` invocations.
#[derive(Debug, Clone)]
pub struct ToolBudget {
    max_calls: u32,
    used: u32,
}

impl ToolBudget {
    pub fn new(max_calls: u32) -> Self {
        Self { max_calls, used: 0 }
    }

    pub fn charge(&mut self, tool_name: &str) -> Result<u32, BudgetExceeded> {
        self.used = self.used.saturating_add(1);
        if self.used > self.max_calls {
            tracing::debug!(
                "Refusing tool call {} ({}/{})",
                tool_name,
                self.used,
                self.max_calls
            );
            return Err(BudgetExceeded {
                limit: self.max_calls,
                attempted: self.used,
            });
        }
        Ok(self.used)
    }

    pub fn max_calls(&self) -> u32 {
        self.max_calls
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn remaining(&self) -> u32 {
        self.max_calls.saturating_sub(self.used)
    }
}
