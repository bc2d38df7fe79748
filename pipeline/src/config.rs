//! Pipeline configuration.
//!
//! A [`PipelineConfig`] is a versioned, immutable snapshot loaded from TOML.
//! Every field has a default, so a partial file (or an empty one) is valid.
//! [`ConfigStore`] holds the active snapshot and swaps it atomically on reload.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{info, warn};

use crate::breaker::FailureKind;
use crate::error::ConfigError;
use crate::tier::TierId;

/// Admission caps and the backoff hinted to rejected callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub global_max: usize,
    pub session_max: usize,
    pub global_backoff_ms: u64,
    pub session_backoff_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global_max: 200,
            session_max: 100,
            global_backoff_ms: 5_000,
            session_backoff_ms: 2_000,
        }
    }
}

/// Breaker weight per failure class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureWeights {
    pub timeout: f64,
    pub resource_exhausted: f64,
    pub crash: f64,
    /// Quality rejection or structurally invalid output.
    pub validation: f64,
}

impl Default for FailureWeights {
    fn default() -> Self {
        Self {
            timeout: 1.0,
            resource_exhausted: 1.5,
            crash: 1.2,
            validation: 0.3,
        }
    }
}

impl FailureWeights {
    pub fn weight(&self, kind: FailureKind) -> f64 {
        match kind {
            FailureKind::Timeout => self.timeout,
            FailureKind::ResourceExhausted => self.resource_exhausted,
            FailureKind::Crash => self.crash,
            FailureKind::Validation => self.validation,
        }
    }
}

/// Circuit breaker thresholds for one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Weighted failure rate at which the breaker opens.
    pub failure_threshold: f64,
    pub consecutive_timeout_limit: u32,
    pub half_open_probe_size: u32,
    pub half_open_success_rate: f64,
    pub cooldown_ms: u64,
    /// Samples younger than this are always retained.
    pub window_secs: u64,
    /// The most recent this-many samples are always retained.
    pub window_samples: usize,
    /// Samples required before the rate rule may trip.
    pub min_samples: usize,
    pub weights: FailureWeights,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.30,
            consecutive_timeout_limit: 10,
            half_open_probe_size: 10,
            half_open_success_rate: 0.80,
            cooldown_ms: 60_000,
            window_secs: 60,
            window_samples: 200,
            min_samples: 20,
            weights: FailureWeights::default(),
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Settings for one analyzer tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierConfig {
    pub name: String,
    pub max_concurrency: usize,
    /// Minimum F1 the quality gate requires; `None` means safety rules only.
    pub min_f1: Option<f64>,
    pub breaker: BreakerConfig,
}

impl TierConfig {
    pub fn default_for(tier: TierId) -> Self {
        let (name, max_concurrency, min_f1) = match tier {
            TierId::Primary => ("ud", 8, Some(0.90)),
            TierId::Secondary => ("mecab", 16, Some(0.82)),
            TierId::Tertiary => ("heuristic", 64, None),
        };
        Self {
            name: name.to_string(),
            max_concurrency,
            min_f1,
            breaker: BreakerConfig::default(),
        }
    }

    fn apply(mut self, over: TierOverride) -> Self {
        if let Some(name) = over.name {
            self.name = name;
        }
        if let Some(max) = over.max_concurrency {
            self.max_concurrency = max;
        }
        if let Some(f1) = over.min_f1 {
            self.min_f1 = f1;
        }
        if let Some(breaker) = over.breaker {
            self.breaker = breaker;
        }
        self
    }
}

/// Partial tier table as written in TOML. Absent keys keep the tier's own
/// defaults, which differ per tier.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TierOverride {
    name: Option<String>,
    max_concurrency: Option<usize>,
    #[serde(default, deserialize_with = "explicit_option")]
    min_f1: Option<Option<f64>>,
    breaker: Option<BreakerConfig>,
}

/// Distinguishes an absent `min_f1` from an explicit value.
fn explicit_option<'de, D>(de: D) -> Result<Option<Option<f64>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<f64>::deserialize(de).map(Some)
}

/// The three tiers in chain order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TiersConfig {
    pub primary: TierConfig,
    pub secondary: TierConfig,
    pub tertiary: TierConfig,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            primary: TierConfig::default_for(TierId::Primary),
            secondary: TierConfig::default_for(TierId::Secondary),
            tertiary: TierConfig::default_for(TierId::Tertiary),
        }
    }
}

impl TiersConfig {
    pub fn get(&self, tier: TierId) -> &TierConfig {
        match tier {
            TierId::Primary => &self.primary,
            TierId::Secondary => &self.secondary,
            TierId::Tertiary => &self.tertiary,
        }
    }

    pub fn get_mut(&mut self, tier: TierId) -> &mut TierConfig {
        match tier {
            TierId::Primary => &mut self.primary,
            TierId::Secondary => &mut self.secondary,
            TierId::Tertiary => &mut self.tertiary,
        }
    }
}

impl<'de> Deserialize<'de> for TiersConfig {
    fn deserialize<D>(de: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize, Default)]
        #[serde(default, deny_unknown_fields)]
        struct Raw {
            primary: Option<TierOverride>,
            secondary: Option<TierOverride>,
            tertiary: Option<TierOverride>,
        }

        let raw = Raw::deserialize(de)?;
        let merge = |tier: TierId, over: Option<TierOverride>| {
            TierConfig::default_for(tier).apply(over.unwrap_or_default())
        };
        Ok(Self {
            primary: merge(TierId::Primary, raw.primary),
            secondary: merge(TierId::Secondary, raw.secondary),
            tertiary: merge(TierId::Tertiary, raw.tertiary),
        })
    }
}

/// Deadline distribution across the tier chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Deadline used when the caller does not supply one.
    pub default_deadline_ms: u64,
    /// Relative share per tier, in chain order.
    pub split_ratios: Vec<f64>,
    /// Fraction of a skipped tier's slice that rolls forward.
    pub skip_carry_fraction: f64,
    pub min_viable_timeout_ms: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: 5_000,
            split_ratios: vec![0.5, 0.3, 0.2],
            skip_carry_fraction: 0.5,
            min_viable_timeout_ms: 200,
        }
    }
}

/// Full pipeline configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Monotonic version; a reload must carry a strictly larger one.
    pub version: u64,
    pub admission: AdmissionConfig,
    pub budget: BudgetConfig,
    pub tiers: TiersConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            admission: AdmissionConfig::default(),
            budget: BudgetConfig::default(),
            tiers: TiersConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&src)
    }

    /// Check the whole snapshot and report every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let a = &self.admission;
        if a.global_max == 0 {
            problems.push("admission.global_max must be at least 1".to_string());
        }
        if a.session_max == 0 {
            problems.push("admission.session_max must be at least 1".to_string());
        }
        if a.global_backoff_ms == 0 || a.session_backoff_ms == 0 {
            problems.push("admission backoff must be positive".to_string());
        }

        let b = &self.budget;
        if b.default_deadline_ms == 0 {
            problems.push("budget.default_deadline_ms must be positive".to_string());
        }
        if b.split_ratios.len() != TierId::ALL.len() {
            problems.push(format!(
                "budget.split_ratios must have {} entries, found {}",
                TierId::ALL.len(),
                b.split_ratios.len()
            ));
        }
        if b.split_ratios.iter().any(|r| !r.is_finite() || *r <= 0.0) {
            problems.push("budget.split_ratios must all be positive".to_string());
        }
        if !(0.0..=1.0).contains(&b.skip_carry_fraction) {
            problems.push("budget.skip_carry_fraction must be within [0, 1]".to_string());
        }
        if b.min_viable_timeout_ms == 0 {
            problems.push("budget.min_viable_timeout_ms must be positive".to_string());
        } else if b.min_viable_timeout_ms > b.default_deadline_ms {
            problems.push(
                "budget.min_viable_timeout_ms exceeds budget.default_deadline_ms".to_string(),
            );
        }

        let mut names = HashSet::new();
        for tier in TierId::ALL {
            let t = self.tiers.get(tier);
            let key = format!("tiers.{tier}");
            if t.name.trim().is_empty() {
                problems.push(format!("{key}.name must not be empty"));
            } else if !names.insert(t.name.as_str()) {
                problems.push(format!("{key}.name '{}' is used by another tier", t.name));
            }
            if t.max_concurrency == 0 {
                problems.push(format!("{key}.max_concurrency must be at least 1"));
            }
            if let Some(f1) = t.min_f1 {
                if !(0.0..=1.0).contains(&f1) {
                    problems.push(format!("{key}.min_f1 must be within [0, 1]"));
                }
            }
            validate_breaker(&key, &t.breaker, &mut problems);
        }

        // A higher tier's gate must be at least as strict as the one below it.
        match (self.tiers.primary.min_f1, self.tiers.secondary.min_f1) {
            (Some(p), Some(s)) if p < s => problems
                .push("tiers.primary.min_f1 must not be below tiers.secondary.min_f1".to_string()),
            (None, Some(_)) => problems.push(
                "tiers.primary.min_f1 is required when tiers.secondary.min_f1 is set".to_string(),
            ),
            _ => {}
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

fn validate_breaker(key: &str, b: &BreakerConfig, problems: &mut Vec<String>) {
    if !(b.failure_threshold > 0.0 && b.failure_threshold <= 1.0) {
        problems.push(format!("{key}.breaker.failure_threshold must be within (0, 1]"));
    }
    if b.consecutive_timeout_limit == 0 {
        problems.push(format!("{key}.breaker.consecutive_timeout_limit must be at least 1"));
    }
    if b.half_open_probe_size == 0 {
        problems.push(format!("{key}.breaker.half_open_probe_size must be at least 1"));
    }
    if !(0.0..=1.0).contains(&b.half_open_success_rate) {
        problems.push(format!("{key}.breaker.half_open_success_rate must be within [0, 1]"));
    }
    if b.window_samples == 0 {
        problems.push(format!("{key}.breaker.window_samples must be at least 1"));
    }
    let w = &b.weights;
    if [w.timeout, w.resource_exhausted, w.crash, w.validation]
        .iter()
        .any(|x| !x.is_finite() || *x < 0.0)
    {
        problems.push(format!("{key}.breaker.weights must be non-negative"));
    }
}

/// Holds the active configuration snapshot.
///
/// Readers clone the `Arc`; a reload replaces the pointer so requests already
/// running keep the snapshot they started with.
#[derive(Debug)]
pub struct ConfigStore {
    current: RwLock<Arc<PipelineConfig>>,
}

impl ConfigStore {
    /// Validate and install the initial snapshot.
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(config)),
        })
    }

    pub fn current(&self) -> Arc<PipelineConfig> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.current().version
    }

    /// Swap in `next` if it is valid and newer than the active snapshot.
    /// On any error the previous snapshot stays active.
    pub fn reload(&self, next: PipelineConfig) -> Result<Arc<PipelineConfig>, ConfigError> {
        if let Err(e) = next.validate() {
            warn!(version = next.version, error = %e, "Rejected invalid config reload");
            return Err(e);
        }
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        if next.version <= guard.version {
            let err = ConfigError::StaleVersion {
                offered: next.version,
                active: guard.version,
            };
            warn!(error = %err, "Rejected stale config reload");
            return Err(err);
        }
        let next = Arc::new(next);
        info!(
            from = guard.version,
            to = next.version,
            "Pipeline config reloaded"
        );
        *guard = next.clone();
        Ok(next)
    }

    pub fn reload_from_path(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Arc<PipelineConfig>, ConfigError> {
        let next = PipelineConfig::load(path)?;
        self.reload(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.admission.global_max, 200);
        assert_eq!(config.tiers.primary.name, "ud");
        assert_eq!(config.tiers.secondary.min_f1, Some(0.82));
        assert_eq!(config.tiers.tertiary.min_f1, None);
        assert_eq!(config.tiers.tertiary.max_concurrency, 64);
        assert_eq!(config.tiers.primary.breaker.cooldown(), Duration::from_secs(60));
        assert_eq!(config.tiers.primary.breaker.min_samples, 20);
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_partial_tier_override_keeps_tier_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            version = 3

            [tiers.secondary]
            max_concurrency = 4

            [tiers.primary.breaker]
            cooldown_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.version, 3);
        assert_eq!(config.tiers.secondary.max_concurrency, 4);
        assert_eq!(config.tiers.secondary.name, "mecab");
        assert_eq!(config.tiers.secondary.min_f1, Some(0.82));
        assert_eq!(config.tiers.primary.breaker.cooldown_ms, 1000);
        assert_eq!(config.tiers.primary.breaker.half_open_probe_size, 10);
    }

    #[test]
    fn test_validate_collects_all_problems() {
        let mut config = PipelineConfig::default();
        config.admission.global_max = 0;
        config.budget.split_ratios = vec![0.5, 0.5];
        config.tiers.secondary.name = "ud".into();
        let Err(ConfigError::Invalid(problems)) = config.validate() else {
            panic!("expected invalid config");
        };
        assert_eq!(problems.len(), 3, "{problems:?}");
    }

    #[test]
    fn test_validate_rejects_inverted_f1_floors() {
        let mut config = PipelineConfig::default();
        config.tiers.primary.min_f1 = Some(0.7);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_tier_key_is_a_parse_error() {
        let err =
            PipelineConfig::from_toml_str("[tiers.primary]\nmax_concurency = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_store_reload_requires_newer_version() {
        let store = ConfigStore::new(PipelineConfig::default()).unwrap();
        let same = PipelineConfig::default();
        assert!(matches!(
            store.reload(same),
            Err(ConfigError::StaleVersion { offered: 1, active: 1 })
        ));

        let mut next = PipelineConfig::default();
        next.version = 2;
        next.admission.global_max = 10;
        store.reload(next).unwrap();
        assert_eq!(store.version(), 2);
        assert_eq!(store.current().admission.global_max, 10);
    }

    #[test]
    fn test_store_keeps_previous_on_invalid_reload() {
        let store = ConfigStore::new(PipelineConfig::default()).unwrap();
        let before = store.current();
        let mut bad = PipelineConfig::default();
        bad.version = 5;
        bad.budget.skip_carry_fraction = 2.0;
        assert!(store.reload(bad).is_err());
        assert!(Arc::ptr_eq(&before, &store.current()));
    }

    #[test]
    fn test_failure_weights_lookup() {
        let w = FailureWeights::default();
        assert_eq!(w.weight(FailureKind::ResourceExhausted), 1.5);
        assert_eq!(w.weight(FailureKind::Validation), 0.3);
    }
}
