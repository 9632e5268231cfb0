use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dealwatch_adapters::SourceConfig;
use dealwatch_storage::{HttpClientConfig, RenderSettings};
use serde::Deserialize;
use tokio::fs;

use crate::continuation::{ChunkSettings, DEFAULT_CHUNK_LIMIT};

/// Contents of `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        {
            let mut ids = HashSet::new();
            for source in &registry.sources {
                if source.source_id.trim().is_empty() {
                    bail!("source registry entry `{}` has an empty source_id", source.display_name);
                }
                if !ids.insert(source.source_id.as_str()) {
                    bail!("source `{}` is registered twice", source.source_id);
                }
            }
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub sources_file: PathBuf,
    pub fixtures_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub page_timeout_secs: u64,
    pub chunk_limit: usize,
    pub chunk_budget_secs: u64,
    pub chrome_path: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub scan_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: u64| {
            lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };
        let chunk_limit = number("DEALWATCH_CHUNK_LIMIT", DEFAULT_CHUNK_LIMIT as u64);
        let chunk_limit = chunk_limit.max(1) as usize;
        Self {
            database_url: lookup("DEALWATCH_DATABASE_URL")
                .unwrap_or_else(|| "sqlite://dealwatch.db".to_string()),
            sources_file: lookup("DEALWATCH_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sources.yaml")),
            fixtures_dir: lookup("DEALWATCH_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./fixtures")),
            user_agent: lookup("DEALWATCH_USER_AGENT")
                .unwrap_or_else(|| "dealwatch-bot/0.1".to_string()),
            http_timeout_secs: number("DEALWATCH_HTTP_TIMEOUT_SECS", 20),
            page_timeout_secs: number("DEALWATCH_PAGE_TIMEOUT_SECS", 45),
            chunk_limit,
            chunk_budget_secs: number("DEALWATCH_CHUNK_BUDGET_SECS", 50).max(1),
            chrome_path: lookup("DEALWATCH_CHROME_PATH")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            scheduler_enabled: lookup("DEALWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            scan_cron: lookup("DEALWATCH_SCAN_CRON")
                .unwrap_or_else(|| "0 */15 * * * *".to_string()),
        }
    }

    pub fn chunk_settings(&self) -> ChunkSettings {
        ChunkSettings {
            limit: self.chunk_limit,
            budget: Duration::from_secs(self.chunk_budget_secs),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..HttpClientConfig::default()
        }
    }

    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            chrome_path: self.chrome_path.clone(),
            navigation_timeout: Duration::from_secs(self.page_timeout_secs),
            ..RenderSettings::default()
        }
    }

    /// Manifest replayed for a fixture-mode source: its explicit
    /// `fixture_manifest` (relative to the fixtures directory) or
    /// `<fixtures_dir>/<source_id>/manifest.json`.
    pub fn fixture_manifest_for(&self, source: &SourceConfig) -> PathBuf {
        match &source.fixture_manifest {
            Some(path) => self.fixtures_dir.join(path),
            None => self.fixtures_dir.join(&source.source_id).join("manifest.json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealwatch_adapters::SourceMode;
    use std::collections::HashMap;

    const REGISTRY: &str = r#"
sources:
  - source_id: citydeals
    display_name: CityDeals
    mode: fixture
    listing_url: https://api.citydeals.test/v1/deals
    page_size: 4
  - source_id: snapbuy-food
    display_name: SnapBuy (food)
    profile: snapbuy
    listing_url: https://snapbuy.test/deals
    filter: food
    fixture_manifest: snapbuy/manifest.json
  - source_id: localfeast
    display_name: LocalFeast
    enabled: false
    listing_url: https://localfeast.test/offers
"#;

    #[test]
    fn registry_parses_with_defaults() {
        let registry = SourceRegistry::from_yaml(REGISTRY).unwrap();
        assert_eq!(registry.sources.len(), 3);
        let enabled: Vec<_> = registry.enabled().map(|s| s.source_id.as_str()).collect();
        assert_eq!(enabled, vec!["citydeals", "snapbuy-food"]);

        let food = registry.get("snapbuy-food").unwrap();
        assert_eq!(food.mode, SourceMode::Live);
        assert_eq!(food.profile_name(), "snapbuy");
        assert_eq!(registry.get("citydeals").unwrap().page_size, Some(4));
    }

    #[test]
    fn shipped_registry_resolves_every_source() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml");
        let registry = SourceRegistry::from_yaml(&std::fs::read_to_string(path).unwrap()).unwrap();
        for source in &registry.sources {
            assert!(
                dealwatch_adapters::adapter_for_source(source).is_ok(),
                "{} does not resolve to an adapter",
                source.source_id
            );
        }
        assert!(registry.enabled().all(|s| s.mode == SourceMode::Fixture));
    }

    #[test]
    fn duplicate_source_ids_are_rejected() {
        let text = "sources:
  - {source_id: a, display_name: A, listing_url: 'https://a.test'}
  - {source_id: a, display_name: A2, listing_url: 'https://a.test'}
";
        let err = SourceRegistry::from_yaml(text).unwrap_err();
        assert!(err.to_string().contains("registered twice"));
    }

    #[test]
    fn env_defaults_apply_when_unset() {
        let config = SyncConfig::from_lookup(|_| None);
        assert_eq!(config.database_url, "sqlite://dealwatch.db");
        assert_eq!(config.sources_file, PathBuf::from("./sources.yaml"));
        assert_eq!(config.chunk_settings(), ChunkSettings::default());
        assert_eq!(config.scan_cron, "0 */15 * * * *");
        assert!(!config.scheduler_enabled);
        assert!(config.chrome_path.is_none());
        assert_eq!(config.http_config().user_agent.as_deref(), Some("dealwatch-bot/0.1"));
    }

    #[test]
    fn env_overrides_are_parsed() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DEALWATCH_CHUNK_LIMIT", "12"),
            ("DEALWATCH_CHUNK_BUDGET_SECS", "25"),
            ("DEALWATCH_SCHEDULER_ENABLED", "true"),
            ("DEALWATCH_PAGE_TIMEOUT_SECS", "not-a-number"),
            ("DEALWATCH_FIXTURES_DIR", "/srv/fixtures"),
        ]);
        let config = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.chunk_settings().limit, 12);
        assert_eq!(config.chunk_settings().budget, Duration::from_secs(25));
        assert!(config.scheduler_enabled);
        assert_eq!(config.page_timeout_secs, 45);

        let registry = SourceRegistry::from_yaml(REGISTRY).unwrap();
        assert_eq!(
            config.fixture_manifest_for(registry.get("citydeals").unwrap()),
            PathBuf::from("/srv/fixtures/citydeals/manifest.json")
        );
        assert_eq!(
            config.fixture_manifest_for(registry.get("snapbuy-food").unwrap()),
            PathBuf::from("/srv/fixtures/snapbuy/manifest.json")
        );
    }
}
