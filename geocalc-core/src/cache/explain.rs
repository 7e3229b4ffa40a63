//! Trace of the controllers visited while calculating a value.

use super::expr::Expr;

/// One visited controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplainEntry {
    pub key: String,
    /// Nesting depth below the requested expression.
    pub depth: usize,
    /// Whether the result was already available.
    pub ready: bool,
}

/// Collects [`ExplainEntry`]s for groups that can explain their values.
#[derive(Debug, Default)]
pub struct ExplainContext {
    entries: Vec<ExplainEntry>,
    depth: usize,
}

impl ExplainContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, key: &Expr, ready: bool) {
        self.entries.push(ExplainEntry {
            key: key.to_string(),
            depth: self.depth,
            ready,
        });
    }

    pub(crate) fn enter(&mut self) {
        self.depth += 1;
    }

    pub(crate) fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn entries(&self) -> &[ExplainEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Indented, one line per entry.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            let marker = if entry.ready { "ready" } else { "calc" };
            out.push_str(&"  ".repeat(entry.depth));
            out.push_str(&format!("{} [{}]\n", entry.key, marker));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_indents_by_depth() {
        let mut explain = ExplainContext::new();
        explain.record(&Expr::parse("(add a b)").unwrap(), false);
        explain.enter();
        explain.record(&Expr::parse("(mul a 2)").unwrap(), true);
        explain.leave();
        assert_eq!(explain.render(), "(add a b) [calc]\n  (mul a 2) [ready]\n");
        assert_eq!(explain.entries()[1].depth, 1);
    }
}
