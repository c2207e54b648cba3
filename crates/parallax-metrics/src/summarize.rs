//! Aggregation of per-batch results into per-category, per-difficulty-bucket
//! summaries.

use crate::BatchEvalResult;
use crate::difficulty::difficulty_bucket;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Averaged metrics for one (category, subset) cell of the evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub category: String,
    /// Difficulty bucket name, or "multisequence".
    pub subset: String,
    pub camera_difficulty: f32,
    /// Set when results are dumped for a specific training epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_epoch: Option<i64>,
    #[serde(flatten)]
    pub metrics: BTreeMap<String, f64>,
}

/// Group per-batch results by category and difficulty bucket and average each
/// metric. In the multisequence regime difficulty stratification is not
/// meaningful, so everything lands in a single subset per category.
///
/// The grouping keys are ordered, so the output order does not depend on the
/// batch order.
pub fn summarize_nvs_eval_results(
    per_batch: &[BatchEvalResult],
    is_multisequence: bool,
    bin_breaks: (f32, f32),
) -> Vec<MetricsRecord> {
    let mut groups: BTreeMap<(String, String), Vec<&BatchEvalResult>> = BTreeMap::new();
    for result in per_batch {
        let subset = if is_multisequence {
            "multisequence".to_owned()
        } else {
            difficulty_bucket(result.camera_difficulty, bin_breaks).to_owned()
        };
        groups
            .entry((result.category.clone(), subset))
            .or_default()
            .push(result);
    }

    groups
        .into_iter()
        .map(|((category, subset), entries)| {
            let mut sums: BTreeMap<String, (f64, u32)> = BTreeMap::new();
            let mut difficulty_sum = 0.0;
            for entry in &entries {
                difficulty_sum += entry.camera_difficulty;
                for (name, value) in &entry.metrics {
                    let slot = sums.entry(name.clone()).or_insert((0.0, 0));
                    slot.0 += value;
                    slot.1 += 1;
                }
            }
            let metrics = sums
                .into_iter()
                .map(|(name, (sum, count))| (name, sum / f64::from(count)))
                .collect();
            MetricsRecord {
                category,
                subset,
                camera_difficulty: difficulty_sum / entries.len() as f32,
                eval_epoch: None,
                metrics,
            }
        })
        .collect()
}

/// The summary as a category-to-records mapping.
pub fn results_by_category(results: &[MetricsRecord]) -> BTreeMap<String, Vec<MetricsRecord>> {
    let mut by_category: BTreeMap<String, Vec<MetricsRecord>> = BTreeMap::new();
    for record in results {
        by_category
            .entry(record.category.clone())
            .or_default()
            .push(record.clone());
    }
    by_category
}

/// Log the summary as an aligned table.
pub fn pretty_print_nvs_metrics(results: &[MetricsRecord]) {
    let mut names: Vec<&str> = results
        .iter()
        .flat_map(|r| r.metrics.keys().map(String::as_str))
        .collect();
    names.sort_unstable();
    names.dedup();

    let mut header = format!("{:<16} {:<14} {:>10}", "category", "subset", "difficulty");
    for name in &names {
        header.push_str(&format!(" {name:>12}"));
    }
    log::info!("{header}");

    for record in results {
        let mut line = format!(
            "{:<16} {:<14} {:>10.4}",
            record.category, record.subset, record.camera_difficulty
        );
        for name in &names {
            match record.metrics.get(*name) {
                Some(value) => line.push_str(&format!(" {value:>12.4}")),
                None => line.push_str(&format!(" {:>12}", "-")),
            }
        }
        log::info!("{line}");
    }
}
