//! Labelled sample messages used to fit the statistical classifier.
//!
//! The corpus is JSON Lines, one record per line:
//! `{"text": "...", "service_type": "wallet", "category": "top_up"}`.
//! Labels must come from the closed vocabularies; blank lines are skipped.

use std::collections::HashSet;
use std::io::BufRead;
use std::path::Path;

use anyhow::Context;
use autotag_core::{Category, ServiceType};
use serde::{Deserialize, Serialize};

/// One labelled message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub text: String,
    pub service_type: ServiceType,
    pub category: Category,
}

/// Ordered training records.
#[derive(Debug, Clone, Default)]
pub struct TrainingCorpus {
    pub records: Vec<TrainingRecord>,
}

/// Summary statistics for a corpus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusSummary {
    pub total_records: usize,
    pub distinct_service_types: usize,
    pub distinct_categories: usize,
    pub distinct_pairs: usize,
}

impl TrainingCorpus {
    pub fn new(records: Vec<TrainingRecord>) -> Self {
        Self { records }
    }

    /// Read a JSONL corpus from disk.
    pub fn from_jsonl(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening corpus {}", path.display()))?;
        Self::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("parsing corpus {}", path.display()))
    }

    /// Parse JSONL from any buffered reader.
    pub fn from_reader(reader: impl BufRead) -> anyhow::Result<Self> {
        let mut records = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: TrainingRecord = serde_json::from_str(&line)
                .with_context(|| format!("line {}", idx + 1))?;
            records.push(record);
        }
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn texts(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.text.as_str()).collect()
    }

    pub fn service_labels(&self) -> Vec<ServiceType> {
        self.records.iter().map(|r| r.service_type).collect()
    }

    pub fn category_labels(&self) -> Vec<Category> {
        self.records.iter().map(|r| r.category).collect()
    }

    pub fn summary(&self) -> CorpusSummary {
        let services: HashSet<ServiceType> = self.service_labels().into_iter().collect();
        let categories: HashSet<Category> = self.category_labels().into_iter().collect();
        let pairs: HashSet<(ServiceType, Category)> = self
            .records
            .iter()
            .map(|r| (r.service_type, r.category))
            .collect();

        CorpusSummary {
            total_records: self.records.len(),
            distinct_service_types: services.len(),
            distinct_categories: categories.len(),
            distinct_pairs: pairs.len(),
        }
    }
}
