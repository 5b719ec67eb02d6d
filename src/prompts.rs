//! Stage Prompts - System prompts for each LLM call of the workflow
//!
//! Every analysis prompt is grounded in the domain's schema description.
//! The code prompt also spells out the table binding contract and the chart
//! conventions the loading snippet configures.

use crate::domain::Domain;
use crate::executor::ExecutionResult;
use crate::plan::AnalysisPlan;
use chrono::NaiveDate;
use itertools::Itertools;
use std::fmt::Write as _;

/// Cap on stdout/stderr forwarded to the report stage.
const REPORT_OUTPUT_CHARS: usize = 12_000;

const OUTPUT_HEADER: &str = "\nAnalysis output:\n";
const ERROR_HEADER: &str = "\nError output:\n";

pub fn classify_prompt(domain: &Domain) -> String {
    format!(
        r#"You are an AI data analyst for the {} domain.
Classify the user's latest message as either "greeting" or "analysis".

- "greeting": hellos, thanks, small talk, or general questions about what this tool can do
- "analysis": any request for data analysis, numbers, insights, or a business question

Respond with exactly one word: greeting or analysis"#,
        domain.display_name()
    )
}

pub fn greeting_prompt(domain: &Domain) -> String {
    format!(
        r#"You are a friendly AI data analyst for {} data.
The user is greeting you or chatting. Reply naturally and briefly, and mention that you can help analyze their {} data.
Stay under 50 words. Do not list example questions or templates."#,
        domain.display_name(),
        domain.name
    )
}

/// Used when the greeting call itself fails.
pub fn canned_greeting(domain: &Domain) -> String {
    format!(
        "Hello! I'm here to help you analyze your {} data. What would you like to explore?",
        domain.display_name()
    )
}

pub fn rephrase_prompt(domain: &Domain) -> String {
    format!(
        r#"You are a data analyst specializing in the {} domain.

{}
Rewrite the user's latest question so that it is specific, self-contained, and ready for data analysis.
Use the earlier conversation to resolve references such as "those customers", "the previous analysis", or "that chart" into explicit entities, filters, and time ranges.

The rewritten question must:
1. Be clear and actionable
2. Name the relevant tables and columns where it helps
3. Keep the user's original intent
4. Contain no pronouns that point back into the conversation

Return only the rewritten question, nothing else."#,
        domain.display_name(),
        domain.schema_text
    )
}

pub fn rephrase_input(question: &str) -> String {
    format!("Rephrase this question: {}", question)
}

pub fn plan_prompt(domain: &Domain) -> String {
    format!(
        r#"You are an advanced data analytics expert working in the {} domain.

{}
These pandas DataFrames are already loaded and bound to variables: {}

Write a step-by-step plan that answers the question. Rules:
1. Start by copying the DataFrames you need so the originals stay untouched
2. Each step does exactly one thing: inspect, filter, join, compute, or visualize
3. Before filtering on a value, inspect the column's distinct values first
4. Handle missing data explicitly
5. Add a chart when it helps the answer
6. Print a descriptive finding after every step
7. Finish with a business-focused summary that states concrete numbers and percentages

Format every step on its own line as "Step N: <description>"."#,
        domain.display_name(),
        domain.schema_text,
        domain.bindings.names().join(", ")
    )
}

pub fn plan_input(rephrased_question: &str) -> String {
    format!("Question: {}", rephrased_question)
}

pub fn code_prompt(domain: &Domain, today: NaiveDate) -> String {
    format!(
        r#"You are a Python data analyst implementing an analysis plan step by step.

{}
BINDING CONTRACT: these pandas DataFrames are already loaded and bound before your code runs: {}
Use them directly. Never read CSV files or load data yourself. `pd`, `np`, `plt`, `os` and `OUTPUT_DIR` are already imported/defined.

Rules:
1. Implement each plan step in order and print what each step found
2. Show at most 10 columns of any DataFrame and at most 5 distinct values of a column
3. Use .loc for assignments and filter only on values verified in earlier steps
4. For categorical breakdowns keep the top 10 categories
5. For daily time series, group by month when days are too granular
6. End with a print of the final answer with explicit numbers and percentages
7. Never call plt.show()

Chart template (save every chart into OUTPUT_DIR):
    plt.figure(figsize=(9, 5))
    # plot
    plt.title("Title", fontsize=14)
    plt.xlabel("X", fontsize=12)
    plt.ylabel("Y", fontsize=12)
    plt.xticks(rotation=45)
    plt.tight_layout()
    plt.savefig(os.path.join(OUTPUT_DIR, "descriptive_name.png"), dpi=100, bbox_inches="tight")
    plt.close()

Current date: {}

Return ONLY complete, runnable Python code. No explanations and no markdown."#,
        domain.schema_text,
        domain.bindings.names().join(", "),
        today.format("%B %-d, %Y")
    )
}

pub fn code_input(plan: &AnalysisPlan) -> String {
    format!("Analysis plan to implement:\n{}", plan.render())
}

pub fn report_prompt(domain: &Domain) -> String {
    format!(
        r#"You are a senior data analyst talking with {} stakeholders about their data.

Explain the results the way you would to a colleague: professional, conversational, and concrete.
- Lead with the main finding in plain language
- Weave in the specific numbers from the analysis output
- Use bullet points for three or more related figures and **bold headers** only when they help
- If charts were produced, refer to them naturally
- Close with practical next steps

The message states the EXECUTION STATUS. When it is FAILED the analysis did not complete:
say so plainly, explain the error in business terms, suggest how to rephrase or narrow the question,
and do not state any figures that are not present in the output."#,
        domain.display_name()
    )
}

/// Report stage input, and whether any output had to be cut. Output sections
/// are cut from the front so the whole text stays within `max_chars`; the
/// status header is always kept.
pub fn report_input(question: &str, execution: &ExecutionResult, max_chars: usize) -> (String, bool) {
    let mut out = String::new();
    let _ = writeln!(out, "Question: {}\n", question);
    match &execution.failure {
        None => {
            let _ = writeln!(out, "EXECUTION STATUS: SUCCEEDED");
        }
        Some(failure) => {
            let _ = writeln!(
                out,
                "EXECUTION STATUS: FAILED ({})\nError: {}",
                failure.kind, failure.message
            );
        }
    }

    let charts_line = if execution.charts.is_empty() {
        String::new()
    } else {
        let names = execution
            .charts
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy())
            .join(", ");
        format!("\nCharts produced: {}\n", names)
    };
    let show_stderr = !execution.success && !execution.stderr.trim().is_empty();

    let mut fixed = out.len() + OUTPUT_HEADER.len() + 1 + charts_line.len();
    if show_stderr {
        fixed += ERROR_HEADER.len() + 1;
    }
    let room = max_chars.saturating_sub(fixed);
    let stderr = if show_stderr {
        clip(&execution.stderr, (room / 3).min(REPORT_OUTPUT_CHARS))
    } else {
        ""
    };
    let stdout = clip(
        &execution.stdout,
        room.saturating_sub(stderr.len()).min(REPORT_OUTPUT_CHARS),
    );

    let _ = writeln!(out, "{}{}", OUTPUT_HEADER, stdout);
    if show_stderr {
        let _ = writeln!(out, "{}{}", ERROR_HEADER, stderr);
    }
    out.push_str(&charts_line);

    let clipped = stdout.len() < execution.stdout.trim().len()
        || (show_stderr && stderr.len() < execution.stderr.trim().len());
    (out, clipped)
}

pub fn eviction_note(dropped: usize) -> String {
    format!(
        "\n\nNote: {} older conversation messages were dropped to fit the context window.",
        dropped
    )
}

/// Keep at most `max` bytes of the tail; the end usually holds the conclusions.
fn clip(text: &str, max: usize) -> &str {
    let text = text.trim();
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
