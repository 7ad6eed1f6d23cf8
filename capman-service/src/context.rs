//! # Plugin Context Manager
//!
//! Ranks plugin summaries by relevance to a natural-language goal under
//! token and count budgets, for callers assembling prompts. Metadata comes
//! from the registry through a five-minute cache; relevance blends keyword
//! and category matches with the plugin's own track record, which this
//! manager maintains as exponential moving averages fed by the
//! orchestrator after every invocation.

use capman_plugin_sdk::registry::PluginRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Cache of upstream plugin metadata is refreshed past this age.
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Smoothing factor for the usage-statistic moving averages.
const EMA_ALPHA: f64 = 0.1;

/// Raw samples retained per plugin.
const MAX_SAMPLES: usize = 100;

/// Budgets and steering knobs for context generation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextConstraints {
    pub max_tokens: usize,
    pub max_plugins: usize,
    pub required_capabilities: Vec<String>,
    pub excluded_plugins: Vec<String>,
    pub priority_keywords: Vec<String>,
}

impl Default for ContextConstraints {
    fn default() -> Self {
        Self {
            max_tokens: 2000,
            max_plugins: 20,
            required_capabilities: Vec::new(),
            excluded_plugins: Vec::new(),
            priority_keywords: Vec::new(),
        }
    }
}

/// Rolling per-plugin execution statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub total_uses: u64,
    /// EMA of the success indicator, in [0, 1].
    pub success_rate: f64,
    /// EMA of execution time in milliseconds.
    pub avg_execution_time_ms: f64,
    pub last_used: DateTime<Utc>,
    #[serde(skip)]
    samples: VecDeque<(f64, bool)>,
}

impl UsageStats {
    fn update(&mut self, execution_time: Duration, success: bool) {
        let millis = execution_time.as_secs_f64() * 1000.0;
        self.total_uses += 1;
        self.success_rate =
            EMA_ALPHA * if success { 1.0 } else { 0.0 } + (1.0 - EMA_ALPHA) * self.success_rate;
        self.avg_execution_time_ms = EMA_ALPHA * millis + (1.0 - EMA_ALPHA) * self.avg_execution_time_ms;
        self.last_used = Utc::now();
        self.samples.push_back((millis, success));
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
    }
}

impl Default for UsageStats {
    fn default() -> Self {
        Self {
            total_uses: 0,
            success_rate: 1.0,
            avg_execution_time_ms: 0.0,
            last_used: Utc::now(),
            samples: VecDeque::new(),
        }
    }
}

/// What the manager knows about one plugin.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    pub id: String,
    pub verb: String,
    pub description: String,
    pub categories: Vec<String>,
    pub required_inputs: Vec<String>,
}

/// One selected summary, with its score and estimated token cost.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedPlugin {
    #[serde(flatten)]
    pub metadata: PluginMetadata,
    pub score: f64,
    pub token_count: usize,
}

/// The generated context block.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginContext {
    pub text: String,
    pub plugins: Vec<RankedPlugin>,
    pub token_count: usize,
}

pub struct PluginContextManager {
    registry: Arc<PluginRegistry>,
    cache: RwLock<Vec<PluginMetadata>>,
    refreshed_at: RwLock<Option<Instant>>,
    stats: DashMap<String, UsageStats>,
}

impl PluginContextManager {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self {
            registry,
            cache: RwLock::new(Vec::new()),
            refreshed_at: RwLock::new(None),
            stats: DashMap::new(),
        }
    }

    /// Fold one invocation outcome into the plugin's statistics.
    /// Last-writer-wins is fine here; there is no ordering requirement.
    pub fn record_usage(&self, plugin_id: &str, execution_time: Duration, success: bool) {
        self.stats
            .entry(plugin_id.to_string())
            .or_default()
            .update(execution_time, success);
    }

    /// Per-plugin statistics snapshot for the operator surface.
    pub fn statistics(&self) -> Vec<(String, UsageStats)> {
        let mut all: Vec<(String, UsageStats)> = self
            .stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        all.sort_by(|a, b| b.1.total_uses.cmp(&a.1.total_uses));
        all
    }

    /// Build a ranked, budget-bounded context block for `goal`.
    pub async fn generate_context(
        &self,
        goal: &str,
        constraints: &ContextConstraints,
    ) -> PluginContext {
        self.refresh_if_stale().await;

        let goal_lower = goal.to_lowercase();
        let goal_words: Vec<&str> = goal_lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 2)
            .collect();

        let cache = self.cache.read().await;
        let mut scored: Vec<RankedPlugin> = cache
            .iter()
            .map(|metadata| {
                let score = self.score(metadata, &goal_lower, &goal_words, constraints);
                let token_count = metadata.description.len().div_ceil(4);
                RankedPlugin {
                    metadata: metadata.clone(),
                    score,
                    token_count,
                }
            })
            .collect();
        drop(cache);

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let mut selected = Vec::new();
        let mut token_count = 0usize;
        for candidate in scored {
            if selected.len() >= constraints.max_plugins {
                break;
            }
            if constraints
                .excluded_plugins
                .iter()
                .any(|x| x == &candidate.metadata.id || x == &candidate.metadata.verb)
            {
                continue;
            }
            if token_count + candidate.token_count > constraints.max_tokens {
                continue;
            }
            token_count += candidate.token_count;
            selected.push(candidate);
        }

        let text = selected
            .iter()
            .map(|p| {
                let mut line = format!("- {}: {}", p.metadata.verb, p.metadata.description);
                if !p.metadata.required_inputs.is_empty() {
                    line.push_str(&format!(
                        " (required inputs: {})",
                        p.metadata.required_inputs.join(", ")
                    ));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n");

        PluginContext {
            text,
            plugins: selected,
            token_count,
        }
    }

    fn score(
        &self,
        metadata: &PluginMetadata,
        goal_lower: &str,
        goal_words: &[&str],
        constraints: &ContextConstraints,
    ) -> f64 {
        let description = metadata.description.to_lowercase();
        let mut score = 0.0;

        let keyword_matches = goal_words
            .iter()
            .filter(|word| description.contains(**word))
            .count() as f64;
        score += 2.0 * keyword_matches;

        let priority_matches = constraints
            .priority_keywords
            .iter()
            .filter(|keyword| description.contains(&keyword.to_lowercase()))
            .count() as f64;
        score += 5.0 * priority_matches;

        let category_matches = metadata
            .categories
            .iter()
            .filter(|category| goal_lower.contains(&category.to_lowercase()))
            .count() as f64;
        score += 3.0 * category_matches;

        if let Some(stats) = self.stats.get(&metadata.id) {
            score += (stats.success_rate * 2.0).min(2.0);
            score += (stats.total_uses as f64 / 10.0).min(1.0);
        }

        if constraints
            .required_capabilities
            .iter()
            .any(|capability| description.contains(&capability.to_lowercase()))
        {
            score += 10.0;
        }

        score
    }

    async fn refresh_if_stale(&self) {
        {
            let refreshed_at = self.refreshed_at.read().await;
            let cache = self.cache.read().await;
            let fresh = refreshed_at
                .map(|at| at.elapsed() < CACHE_TTL)
                .unwrap_or(false);
            if fresh && !cache.is_empty() {
                return;
            }
        }

        let mut fresh = Vec::new();
        for locator in self.registry.list(None).await {
            if let Some(manifest) = self.registry.fetch_one(&locator.id, None, None).await {
                fresh.push(PluginMetadata {
                    id: manifest.id.clone(),
                    verb: manifest.verb.clone(),
                    description: manifest.description.clone(),
                    categories: manifest.categories.clone(),
                    required_inputs: manifest
                        .input_definitions
                        .iter()
                        .filter(|d| d.required)
                        .map(|d| d.name.clone())
                        .collect(),
                });
            }
        }

        *self.cache.write().await = fresh;
        *self.refreshed_at.write().await = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capman_plugin_sdk::manifest::{
        HandlerKind, HostCompatibility, IoDefinition, PackageSource, PluginManifest,
        SecurityConfig,
    };
    use capman_plugin_sdk::registry::prepare::BundleCache;
    use capman_plugin_sdk::registry::repository::LocalRepository;
    use capman_plugin_sdk::registry::AcceptUnsigned;
    use capman_plugin_sdk::ValueType;

    fn manifest(verb: &str, description: &str, categories: &[&str]) -> PluginManifest {
        PluginManifest {
            id: format!("plugin-{verb}"),
            verb: verb.to_string(),
            version: semver::Version::parse("1.0.0").unwrap(),
            handler: HandlerKind::Internal,
            description: description.to_string(),
            categories: categories.iter().map(|c| c.to_string()).collect(),
            entry_point: None,
            input_definitions: vec![IoDefinition::required("query", ValueType::String)],
            output_definitions: Vec::new(),
            package_source: PackageSource::default(),
            security: SecurityConfig::default(),
            host_compatibility: HostCompatibility::default(),
        }
    }

    async fn manager_with(
        dir: &std::path::Path,
        manifests: Vec<PluginManifest>,
    ) -> PluginContextManager {
        let registry = Arc::new(PluginRegistry::new(
            vec![Arc::new(LocalRepository::new(dir.join("repo")))],
            Box::new(AcceptUnsigned),
            BundleCache::new(dir.join("cache"), dir.join("plugins")),
        ));
        for manifest in manifests {
            registry.store(manifest).await.unwrap();
        }
        PluginContextManager::new(registry)
    }

    #[tokio::test]
    async fn relevant_plugins_rank_first() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(
            dir.path(),
            vec![
                manifest("SEARCH", "search the web for documents and articles", &["web"]),
                manifest("RESIZE", "resize and crop images", &["images"]),
            ],
        )
        .await;

        let context = manager
            .generate_context("search the web for rust articles", &ContextConstraints::default())
            .await;

        assert_eq!(context.plugins.len(), 2);
        assert_eq!(context.plugins[0].metadata.verb, "SEARCH");
        assert!(context.plugins[0].score > context.plugins[1].score);
        assert!(context.text.starts_with("- SEARCH: search the web"));
        assert!(context.text.contains("(required inputs: query)"));
    }

    #[tokio::test]
    async fn budgets_bound_the_selection() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(
            dir.path(),
            vec![
                manifest("A", "alpha handler that does many things", &[]),
                manifest("B", "beta handler that does many things", &[]),
                manifest("C", "gamma handler that does many things", &[]),
            ],
        )
        .await;

        let one_plugin = manager
            .generate_context(
                "anything",
                &ContextConstraints {
                    max_plugins: 1,
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(one_plugin.plugins.len(), 1);

        let tiny_budget = manager
            .generate_context(
                "anything",
                &ContextConstraints {
                    max_tokens: 1,
                    ..Default::default()
                },
            )
            .await;
        assert!(tiny_budget.plugins.is_empty());
        assert_eq!(tiny_budget.token_count, 0);
    }

    #[tokio::test]
    async fn excluded_plugins_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(
            dir.path(),
            vec![manifest("SEARCH", "search the web", &[])],
        )
        .await;

        let context = manager
            .generate_context(
                "search",
                &ContextConstraints {
                    excluded_plugins: vec!["SEARCH".to_string()],
                    ..Default::default()
                },
            )
            .await;
        assert!(context.plugins.is_empty());
    }

    #[test]
    fn usage_stats_are_monotonic_and_smoothed() {
        let stats = &mut UsageStats::default();
        for _ in 0..10 {
            stats.update(Duration::from_millis(100), true);
        }
        assert_eq!(stats.total_uses, 10);
        assert!(stats.success_rate > 0.99);

        stats.update(Duration::from_millis(100), false);
        assert_eq!(stats.total_uses, 11);
        // One failure nudges the EMA down by roughly alpha.
        assert!(stats.success_rate < 0.95 && stats.success_rate > 0.85);

        for _ in 0..300 {
            stats.update(Duration::from_millis(50), true);
        }
        assert!(stats.samples.len() <= MAX_SAMPLES);
        assert_eq!(stats.total_uses, 311);
    }

    #[tokio::test]
    async fn priority_keywords_outrank_track_record() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(
            dir.path(),
            vec![
                manifest("POPULAR", "well-worn handler", &[]),
                manifest("NICHE", "handler for spectrograms", &[]),
            ],
        )
        .await;
        for _ in 0..50 {
            manager.record_usage("plugin-POPULAR", Duration::from_millis(10), true);
        }

        let context = manager
            .generate_context(
                "analyze audio",
                &ContextConstraints {
                    priority_keywords: vec!["spectrograms".to_string()],
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(context.plugins[0].metadata.verb, "NICHE");
    }
}
