//! Domain Data Loader
//!
//! A domain is a business vertical (banking, hospital, marketing, ...) with
//! its own tables. Layout on disk:
//!
//! - `<metadata_dir>/<domain>/_schema.json` describes the tables
//! - `<data_dir>/<domain>/<table>.csv` holds one table each
//!
//! Generated analysis code never loads data itself. It runs after the
//! domain's loading snippet, which binds one pandas DataFrame per table under
//! the table's name. `TableBindings` is that contract: the exact variable
//! names the snippet binds, checked against generated code before it runs.

use crate::error::{AnalystError, Result};
use lazy_static::lazy_static;
use polars::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const SCHEMA_FILE: &str = "_schema.json";

/// Environment variable through which the executor hands the run's artifact
/// directory to the script. Distinct from the `ANALYST_OUTPUT_DIR` root.
pub const RUN_DIR_ENV: &str = "ANALYST_RUN_DIR";

lazy_static! {
    static ref PY_IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
    static ref DATA_RELOAD: Regex = Regex::new(r"\bread_csv\s*\(").unwrap();
}

const PY_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// Names the loading snippet itself binds; tables may not shadow them.
const RESERVED_NAMES: &[&str] = &["os", "pd", "np", "plt", "sns", "matplotlib", "warnings", "OUTPUT_DIR"];

const SNIPPET_PRELUDE: &str = r#"import os
import warnings
import numpy as np
import pandas as pd
import matplotlib
matplotlib.use("Agg")
import matplotlib.pyplot as plt
try:
    import seaborn as sns
except ImportError:
    sns = None

warnings.filterwarnings("ignore")

# Chart conventions: compact figures, small files.
plt.style.use("default")
plt.rcParams["figure.figsize"] = [9, 5]
plt.rcParams["font.size"] = 9
plt.rcParams["savefig.bbox"] = "tight"
plt.rcParams["savefig.dpi"] = 100

OUTPUT_DIR = os.environ.get("ANALYST_RUN_DIR", os.getcwd())
os.makedirs(OUTPUT_DIR, exist_ok=True)

# Remember which figures the analysis saved itself.
import matplotlib.figure
_saved_figures = set()
_figure_savefig = matplotlib.figure.Figure.savefig

def _tracked_savefig(self, *args, **kwargs):
    _saved_figures.add(id(self))
    return _figure_savefig(self, *args, **kwargs)

matplotlib.figure.Figure.savefig = _tracked_savefig
"#;

/// Appended after the analysis body: figures left open and never saved are
/// saved, not lost. Figures already saved are not written twice.
pub const CHART_EPILOGUE: &str = r#"
# Save figures the analysis left open without saving.
for _fig_num in plt.get_fignums():
    _fig = plt.figure(_fig_num)
    if id(_fig) not in _saved_figures:
        _fig.savefig(os.path.join(OUTPUT_DIR, f"figure_{_fig_num}.png"))
plt.close("all")
"#;

/// `fk` is either a single column or a list of columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ForeignKeys {
    One(String),
    Many(Vec<String>),
}

impl ForeignKeys {
    pub fn columns(&self) -> Vec<&str> {
        match self {
            ForeignKeys::One(c) => vec![c.as_str()],
            ForeignKeys::Many(cs) => cs.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub pk: Option<String>,
    #[serde(default)]
    pub fk: Option<ForeignKeys>,
    /// Column name -> description.
    #[serde(default)]
    pub columns: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainSchema {
    pub domain_name: String,
    #[serde(default)]
    pub domain_description: String,
    pub tables: Vec<TableSpec>,
}

impl DomainSchema {
    pub fn parse(raw: &str) -> Result<Self> {
        let schema: DomainSchema = serde_json::from_str(raw)
            .map_err(|e| AnalystError::SchemaLoad(format!("malformed schema: {}", e)))?;
        schema.validate()?;
        Ok(schema)
    }

    fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            return Err(AnalystError::SchemaLoad(format!(
                "domain '{}' declares no tables",
                self.domain_name
            )));
        }
        let mut seen = HashSet::new();
        for table in &self.tables {
            if !is_python_identifier(&table.name) || RESERVED_NAMES.contains(&table.name.as_str()) {
                return Err(AnalystError::SchemaLoad(format!(
                    "table name '{}' cannot be bound as a variable",
                    table.name
                )));
            }
            if !seen.insert(table.name.as_str()) {
                return Err(AnalystError::SchemaLoad(format!(
                    "table '{}' is declared twice",
                    table.name
                )));
            }
        }
        Ok(())
    }
}

pub fn is_python_identifier(name: &str) -> bool {
    PY_IDENTIFIER.is_match(name) && !PY_KEYWORDS.contains(&name)
}

/// The variable names the loading snippet binds, one per table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBindings {
    names: Vec<String>,
}

impl TableBindings {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Check generated analysis code against the binding contract.
    ///
    /// Returns the bound tables the code uses. Fails when it uses none of
    /// them or tries to load data on its own.
    pub fn check(&self, code: &str) -> std::result::Result<Vec<String>, String> {
        if DATA_RELOAD.is_match(code) {
            return Err(format!(
                "the code loads data itself; the tables are already bound as {}",
                self.names.join(", ")
            ));
        }
        let referenced: Vec<String> = self
            .names
            .iter()
            .filter(|name| references_identifier(code, name))
            .cloned()
            .collect();
        if referenced.is_empty() {
            return Err(format!(
                "the code uses none of the bound tables ({})",
                self.names.join(", ")
            ));
        }
        Ok(referenced)
    }
}

fn references_identifier(code: &str, name: &str) -> bool {
    match Regex::new(&format!(r"\b{}\b", regex::escape(name))) {
        Ok(re) => re.is_match(code),
        Err(_) => code.contains(name),
    }
}

/// A loaded domain. Immutable once built; replaced wholesale on switch.
#[derive(Debug, Clone)]
pub struct Domain {
    /// Directory name, e.g. `banking`.
    pub name: String,
    pub schema: DomainSchema,
    pub tables: BTreeMap<String, DataFrame>,
    pub schema_text: String,
    pub loading_snippet: String,
    pub bindings: TableBindings,
}

impl Domain {
    pub fn display_name(&self) -> &str {
        &self.schema.domain_name
    }

    pub fn table(&self, name: &str) -> Option<&DataFrame> {
        self.tables.get(name)
    }

    /// Full script: loading snippet, analysis body, chart epilogue.
    pub fn compose_script(&self, analysis_code: &str) -> String {
        format!(
            "{}\n# Analysis code\n{}\n{}",
            self.loading_snippet,
            analysis_code.trim_end(),
            CHART_EPILOGUE
        )
    }
}

#[derive(Debug, Clone)]
pub struct DomainLoader {
    metadata_dir: PathBuf,
    data_dir: PathBuf,
}

impl DomainLoader {
    pub fn new(metadata_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            metadata_dir: metadata_dir.into(),
            data_dir: data_dir.into(),
        }
    }

    pub fn metadata_dir(&self) -> &Path {
        &self.metadata_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Domains with a schema file, sorted by name.
    pub fn available_domains(&self) -> Result<Vec<String>> {
        let mut domains = Vec::new();
        if !self.metadata_dir.is_dir() {
            return Ok(domains);
        }
        for entry in std::fs::read_dir(&self.metadata_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && path.join(SCHEMA_FILE).is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    domains.push(name.to_string());
                }
            }
        }
        domains.sort();
        Ok(domains)
    }

    /// Resolve a user-supplied name to a domain directory (case-insensitive).
    pub fn resolve(&self, requested: &str) -> Result<String> {
        let requested = requested.trim();
        let available = self.available_domains()?;
        available
            .into_iter()
            .find(|d| d.eq_ignore_ascii_case(requested))
            .ok_or_else(|| AnalystError::DomainNotFound(requested.to_string()))
    }

    pub fn load_schema(&self, domain: &str) -> Result<DomainSchema> {
        let path = self.metadata_dir.join(domain).join(SCHEMA_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            AnalystError::SchemaLoad(format!("cannot read {}: {}", path.display(), e))
        })?;
        DomainSchema::parse(&raw)
    }

    /// Load schema and every table of a domain.
    pub fn load(&self, requested: &str) -> Result<Domain> {
        let name = self.resolve(requested)?;
        let schema = self.load_schema(&name)?;

        let mut tables = BTreeMap::new();
        let mut csv_paths = Vec::with_capacity(schema.tables.len());
        for spec in &schema.tables {
            let path = self.data_dir.join(&name).join(format!("{}.csv", spec.name));
            let df = read_table(&path)?;
            check_declared_columns(spec, &df);
            let absolute = std::fs::canonicalize(&path)?;
            csv_paths.push((spec.name.clone(), absolute));
            tables.insert(spec.name.clone(), df);
        }

        let bindings = TableBindings::new(schema.tables.iter().map(|t| t.name.clone()).collect());
        let schema_text = describe_schema(&schema, &tables);
        let loading_snippet = build_loading_snippet(&csv_paths);

        info!(
            "Loaded domain '{}' with {} tables ({})",
            name,
            tables.len(),
            bindings.names().join(", ")
        );

        Ok(Domain {
            name,
            schema,
            tables,
            schema_text,
            loading_snippet,
            bindings,
        })
    }
}

fn read_table(path: &Path) -> Result<DataFrame> {
    if !path.is_file() {
        return Err(AnalystError::DataLoad(format!(
            "missing table file {}",
            path.display()
        )));
    }
    LazyCsvReader::new(path)
        .with_has_header(true)
        .finish()
        .and_then(|lf| lf.collect())
        .map_err(|e| AnalystError::DataLoad(format!("cannot read {}: {}", path.display(), e)))
}

fn check_declared_columns(spec: &TableSpec, df: &DataFrame) {
    let actual: HashSet<&str> = df.get_column_names().into_iter().collect();
    let missing: Vec<&str> = spec
        .columns
        .keys()
        .map(String::as_str)
        .filter(|c| !actual.contains(c))
        .collect();
    if !missing.is_empty() {
        warn!(
            "Table '{}' lacks declared columns: {}",
            spec.name,
            missing.join(", ")
        );
    }
}

/// Human-readable schema used to ground every prompt.
pub fn describe_schema(schema: &DomainSchema, tables: &BTreeMap<String, DataFrame>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Domain: {}", schema.domain_name);
    if !schema.domain_description.is_empty() {
        let _ = writeln!(out, "Description: {}", schema.domain_description);
    }
    out.push_str("\nAvailable Tables:\n");

    for table in &schema.tables {
        let _ = writeln!(out, "\n{}:", table.name);
        if !table.description.is_empty() {
            let _ = writeln!(out, "  Description: {}", table.description);
        }
        if let Some(rows) = tables.get(&table.name).map(|df| df.height()) {
            let _ = writeln!(out, "  Rows: {}", rows);
        }
        if let Some(pk) = &table.pk {
            let _ = writeln!(out, "  Primary Key: {}", pk);
        }
        if let Some(fk) = &table.fk {
            let _ = writeln!(out, "  Foreign Keys: {}", fk.columns().join(", "));
        }
        out.push_str("  Columns:\n");
        for (column, description) in &table.columns {
            let description = description
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| description.to_string());
            let _ = writeln!(out, "    - {}: {}", column, description);
        }
    }
    out
}

fn build_loading_snippet(csv_paths: &[(String, PathBuf)]) -> String {
    let mut snippet = String::from(SNIPPET_PRELUDE);
    snippet.push('\n');
    for (name, path) in csv_paths {
        // A JSON string literal is also a valid Python string literal.
        let literal = serde_json::to_string(&path.to_string_lossy())
            .unwrap_or_else(|_| format!("{:?}", path));
        let _ = writeln!(snippet, "{} = pd.read_csv({})", name, literal);
        let _ = writeln!(snippet, "print(f\"{0} loaded: {{len({0})}} rows\")", name);
    }
    snippet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreign_keys_accept_string_or_list() {
        let schema = DomainSchema::parse(
            r#"{"domain_name": "Banking", "tables": [
                {"name": "accounts", "fk": "customer_id", "columns": {"account_id": "id"}},
                {"name": "loans", "fk": ["customer_id", "account_id"], "columns": {}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(schema.tables[0].fk.as_ref().unwrap().columns(), vec!["customer_id"]);
        assert_eq!(
            schema.tables[1].fk.as_ref().unwrap().columns(),
            vec!["customer_id", "account_id"]
        );
    }

    #[test]
    fn test_schema_without_tables_is_rejected() {
        let err = DomainSchema::parse(r#"{"domain_name": "Empty", "tables": []}"#).unwrap_err();
        assert!(matches!(err, AnalystError::SchemaLoad(_)));
    }

    #[test]
    fn test_table_names_must_be_bindable() {
        for bad in ["customer-accounts", "class", "pd", "2024_sales"] {
            let raw = format!(r#"{{"domain_name": "X", "tables": [{{"name": "{}"}}]}}"#, bad);
            assert!(
                matches!(DomainSchema::parse(&raw), Err(AnalystError::SchemaLoad(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_malformed_json_is_schema_error() {
        assert!(matches!(
            DomainSchema::parse("{not json"),
            Err(AnalystError::SchemaLoad(_))
        ));
    }

    #[test]
    fn test_bindings_check() {
        let bindings = TableBindings::new(vec!["customers".to_string(), "loans".to_string()]);

        let used = bindings
            .check("churned = customers[customers['status'] == 'closed']\nprint(len(churned))")
            .unwrap();
        assert_eq!(used, vec!["customers".to_string()]);

        assert!(bindings.check("df = pd.read_csv('data/banking/customers.csv')").is_err());
        // `customers_2` is a different identifier
        assert!(bindings.check("customers_2 = 1\nprint(customers_2)").is_err());
    }

    #[test]
    fn test_snippet_binds_every_table() {
        let snippet = build_loading_snippet(&[
            ("customers".to_string(), PathBuf::from("/srv/data/banking/customers.csv")),
            ("loans".to_string(), PathBuf::from("/srv/data/banking/loans.csv")),
        ]);
        assert!(snippet.contains("customers = pd.read_csv(\"/srv/data/banking/customers.csv\")"));
        assert!(snippet.contains("loans = pd.read_csv(\"/srv/data/banking/loans.csv\")"));
        assert!(snippet.contains("print(f\"loans loaded: {len(loans)} rows\")"));
        assert!(snippet.contains("OUTPUT_DIR = os.environ.get(\"ANALYST_RUN_DIR\""));
        assert!(!snippet.contains("ANALYST_OUTPUT_DIR"));
        assert!(snippet.contains("matplotlib.use(\"Agg\")"));
    }

    #[test]
    fn test_epilogue_skips_figures_already_saved() {
        let snippet = build_loading_snippet(&[(
            "customers".to_string(),
            PathBuf::from("/srv/data/banking/customers.csv"),
        )]);
        // Every savefig path goes through Figure.savefig, which records the figure.
        assert!(snippet.contains("matplotlib.figure.Figure.savefig = _tracked_savefig"));
        assert!(snippet.contains("_saved_figures.add(id(self))"));
        assert!(CHART_EPILOGUE.contains("if id(_fig) not in _saved_figures:"));
        assert!(!CHART_EPILOGUE.contains("plt.savefig"));

        let tracking = snippet.find("_saved_figures = set()").unwrap();
        let binding = snippet.find("customers = pd.read_csv(").unwrap();
        assert!(tracking < binding);
    }
}
