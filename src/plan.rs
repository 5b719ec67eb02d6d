//! Analysis plans and generated code
//!
//! Parsing of the two structured replies in the workflow: the numbered plan
//! and the Python code block.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref STEP_LINE: Regex =
        Regex::new(r"(?i)^\s*(?:\*\*)?(?:step\s+(\d+)\s*[:.)-]|(\d+)\s*[.)])(?:\*\*)?\s*(.*)$").unwrap();
    static ref FENCED_BLOCK: Regex = Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\n(.*?)```").unwrap();
}

/// Ordered natural-language steps for one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisPlan {
    pub steps: Vec<String>,
    /// The planner's reply as received.
    pub raw: String,
}

impl AnalysisPlan {
    /// Parse "Step N: ..." or "N. ..." lines. Continuation lines are folded
    /// into the preceding step; a reply with no numbered lines becomes a
    /// single step.
    pub fn parse(raw: &str) -> Self {
        let mut steps: Vec<String> = Vec::new();
        for line in raw.lines() {
            if let Some(caps) = STEP_LINE.captures(line) {
                let text = caps.get(3).map(|m| m.as_str().trim()).unwrap_or_default();
                steps.push(text.trim_start_matches("**").trim().to_string());
            } else if let Some(last) = steps.last_mut() {
                let extra = line.trim();
                if !extra.is_empty() {
                    if !last.is_empty() {
                        last.push(' ');
                    }
                    last.push_str(extra);
                }
            }
        }
        steps.retain(|s| !s.is_empty());

        if steps.is_empty() && !raw.trim().is_empty() {
            steps.push(raw.trim().to_string());
        }

        Self {
            steps,
            raw: raw.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Canonical "Step N: ..." rendering handed to the code generator.
    pub fn render(&self) -> String {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, s)| format!("Step {}: {}", i + 1, s))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Strip markdown fences from a code reply. When the reply contains fenced
/// blocks, their contents are joined; otherwise stray leading and trailing
/// fences are removed.
pub fn extract_code(reply: &str) -> String {
    let blocks: Vec<&str> = FENCED_BLOCK
        .captures_iter(reply)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    if !blocks.is_empty() {
        return blocks
            .iter()
            .map(|b| b.trim_end())
            .collect::<Vec<_>>()
            .join("\n\n")
            .trim()
            .to_string();
    }

    reply
        .trim()
        .trim_start_matches("```python")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_step_lines() {
        let plan = AnalysisPlan::parse(
            "Here is the plan:\nStep 1: Copy the dataframes\nStep 2: Count customers with status 'closed'\n  and divide by total\nStep 3: Plot churn by segment",
        );
        assert_eq!(
            plan.steps,
            vec![
                "Copy the dataframes",
                "Count customers with status 'closed' and divide by total",
                "Plot churn by segment"
            ]
        );
        assert!(plan.render().starts_with("Step 1: Copy the dataframes\nStep 2:"));
    }

    #[test]
    fn test_parse_numbered_and_bold() {
        let plan = AnalysisPlan::parse("1. Inspect accounts\n2) Filter closed\n**Step 3:** Summarize");
        assert_eq!(plan.steps, vec!["Inspect accounts", "Filter closed", "Summarize"]);
    }

    #[test]
    fn test_unstructured_reply_is_one_step() {
        let plan = AnalysisPlan::parse("Compute the churn rate from customers.");
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.steps[0], "Compute the churn rate from customers.");
        assert!(AnalysisPlan::parse("   ").is_empty());
    }

    #[test]
    fn test_extract_code_from_fences() {
        assert_eq!(extract_code("```python\nprint(1)\n```"), "print(1)");
        assert_eq!(
            extract_code("Sure:\n```python\na = 1\n```\nthen\n```\nprint(a)\n```\nDone."),
            "a = 1\n\nprint(a)"
        );
        assert_eq!(extract_code("print(customers.shape)"), "print(customers.shape)");
        assert_eq!(extract_code("```python\nprint(2)"), "print(2)");
    }
}
