#![allow(dead_code)]

use async_trait::async_trait;
use domain_analyst::domain::{Domain, DomainLoader};
use domain_analyst::executor::{CodeRunner, ExecutionResult};
use domain_analyst::llm::{CompletionProvider, CompletionRequest};
use domain_analyst::{AnalystError, Result};
use polars::prelude::*;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const BANKING_SCHEMA: &str = r#"{
  "domain_name": "Banking",
  "domain_description": "Retail banking customers and their accounts",
  "tables": [
    {
      "name": "customers",
      "description": "One row per customer",
      "pk": "customer_id",
      "columns": {
        "customer_id": "Unique customer id",
        "segment": "Customer segment (retail, premium)",
        "churned": "1 when the customer closed all accounts"
      }
    },
    {
      "name": "accounts",
      "description": "Deposit accounts",
      "pk": "account_id",
      "fk": "customer_id",
      "columns": {
        "account_id": "Unique account id",
        "customer_id": "Owner of the account",
        "balance": "Current balance"
      }
    }
  ]
}"#;

const HOSPITAL_SCHEMA: &str = r#"{
  "domain_name": "Hospital",
  "domain_description": "Patient admissions",
  "tables": [
    {
      "name": "admissions",
      "description": "One row per admission",
      "pk": "admission_id",
      "fk": ["patient_id"],
      "columns": {
        "admission_id": "Unique admission id",
        "patient_id": "Admitted patient",
        "length_of_stay": "Days in hospital"
      }
    }
  ]
}"#;

/// Metadata and data directories with a banking and a hospital domain.
pub struct Fixture {
    pub dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let fixture = Self { dir };

        fixture.write_schema("banking", BANKING_SCHEMA);
        let mut customers = df![
            "customer_id" => ["C001", "C002", "C003"],
            "segment" => ["retail", "premium", "retail"],
            "churned" => [1i64, 0, 0]
        ]
        .unwrap();
        fixture.write_table("banking", "customers", &mut customers);
        let mut accounts = df![
            "account_id" => ["A1", "A2", "A3", "A4"],
            "customer_id" => ["C001", "C002", "C002", "C003"],
            "balance" => [120.5, 9800.0, 150.25, 640.0]
        ]
        .unwrap();
        fixture.write_table("banking", "accounts", &mut accounts);

        fixture.write_schema("hospital", HOSPITAL_SCHEMA);
        let mut admissions = df![
            "admission_id" => [1i64, 2],
            "patient_id" => ["P1", "P2"],
            "length_of_stay" => [3i64, 7]
        ]
        .unwrap();
        fixture.write_table("hospital", "admissions", &mut admissions);

        fixture
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.dir.path().join("metadata")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("output")
    }

    pub fn loader(&self) -> DomainLoader {
        DomainLoader::new(self.metadata_dir(), self.data_dir())
    }

    pub fn banking(&self) -> Domain {
        self.loader().load("banking").unwrap()
    }

    pub fn write_schema(&self, domain: &str, schema: &str) {
        let dir = self.metadata_dir().join(domain);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("_schema.json"), schema).unwrap();
    }

    pub fn write_table(&self, domain: &str, table: &str, df: &mut DataFrame) {
        let dir = self.data_dir().join(domain);
        fs::create_dir_all(&dir).unwrap();
        let mut file = fs::File::create(dir.join(format!("{}.csv", table))).unwrap();
        CsvWriter::new(&mut file).finish(df).unwrap();
    }

    pub fn remove_table(&self, domain: &str, table: &str) {
        fs::remove_file(self.data_dir().join(domain).join(format!("{}.csv", table))).unwrap();
    }
}

/// Replies from a queue and records every request.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<Result<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn push(&self, reply: Result<String>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AnalystError::Llm("no scripted reply left".to_string())))
    }
}

/// Returns a fixed result and records the scripts it was given.
pub struct RecordingRunner {
    result: Mutex<ExecutionResult>,
    scripts: Mutex<Vec<String>>,
    clears: Mutex<usize>,
}

impl RecordingRunner {
    pub fn new(result: ExecutionResult) -> Self {
        Self {
            result: Mutex::new(result),
            scripts: Mutex::new(Vec::new()),
            clears: Mutex::new(0),
        }
    }

    pub fn set_result(&self, result: ExecutionResult) {
        *self.result.lock().unwrap() = result;
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }

    pub fn clears(&self) -> usize {
        *self.clears.lock().unwrap()
    }
}

#[async_trait]
impl CodeRunner for RecordingRunner {
    async fn execute(&self, code: &str, _timeout: Duration) -> ExecutionResult {
        self.scripts.lock().unwrap().push(code.to_string());
        self.result.lock().unwrap().clone()
    }

    fn clear_artifacts(&self) -> Result<()> {
        *self.clears.lock().unwrap() += 1;
        Ok(())
    }

    fn artifacts(&self) -> Result<Vec<PathBuf>> {
        Ok(self.result.lock().unwrap().charts.clone())
    }
}

pub fn churn_output() -> ExecutionResult {
    ExecutionResult::succeeded(
        "run1".to_string(),
        "customers loaded: 3 rows\nChurn rate: 33.3%".to_string(),
        String::new(),
        vec![PathBuf::from("/tmp/output/run1/churn_by_segment.png")],
        42,
    )
}

pub fn file_names(paths: &[PathBuf]) -> Vec<String> {
    paths
        .iter()
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect()
}

pub fn is_under(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}
