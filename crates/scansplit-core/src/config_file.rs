use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limit::AdaptiveLimiter;
use crate::retry::{Backoff, RetryPolicy};
use crate::taxonomy::{Category, CategoryTaxonomy, GroupingPolicy};
use crate::{Config, CoreError};

/// Requests per second against one model backend when not configured.
pub const DEFAULT_REQUESTS_PER_SECOND: f64 = 2.0;

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub model: Option<ModelConfig>,
    /// Backend for the ordering step; falls back to `model`.
    pub ordering_model: Option<ModelConfig>,
    pub pipeline: Option<PipelineConfig>,
    pub paths: Option<PathsConfig>,
    pub categories: Option<Vec<Category>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    /// `openai`, `ollama` or `heuristic`.
    pub backend: Option<String>,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub requests_per_second: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// `packet` or `distinct-title`.
    pub grouping_policy: Option<String>,
    /// Free-form grouping rules; wins over `grouping_policy`.
    pub grouping_policy_text: Option<String>,
    pub grouping_attempts: Option<u32>,
    pub ordering_attempts: Option<u32>,
    pub retry_delay_secs: Option<f64>,
    /// `fixed` or `exponential`.
    pub backoff: Option<String>,
    pub max_retry_delay_secs: Option<f64>,
    pub call_timeout_secs: Option<u64>,
    pub ordering_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    pub output_dir: Option<String>,
    pub archive_dir: Option<String>,
}

/// Platform config directory path: `<config_dir>/scansplit/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("scansplit").join("config.toml"))
}

/// Load config by cascading CWD `.scansplit.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".scansplit.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparsable config file");
            None
        }
    }
}

/// Load an explicitly requested config file. Unlike [`load_from_path`],
/// a missing or invalid file is an error.
pub fn load_required(path: &Path) -> Result<ConfigFile, CoreError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| CoreError::Config(format!("cannot read {}: {e}", path.display())))?;
    toml::from_str(&content)
        .map_err(|e| CoreError::Config(format!("invalid config {}: {e}", path.display())))
}

fn pick<S, T: Clone>(
    base: &Option<S>,
    overlay: &Option<S>,
    field: impl Fn(&S) -> Option<T>,
) -> Option<T> {
    overlay
        .as_ref()
        .and_then(&field)
        .or_else(|| base.as_ref().and_then(&field))
}

/// Merge two model sections field by field; `overlay` wins.
pub fn merge_model(
    base: &Option<ModelConfig>,
    overlay: &Option<ModelConfig>,
) -> Option<ModelConfig> {
    if base.is_none() && overlay.is_none() {
        return None;
    }
    Some(ModelConfig {
        backend: pick(base, overlay, |m| m.backend.clone()),
        endpoint: pick(base, overlay, |m| m.endpoint.clone()),
        api_key: pick(base, overlay, |m| m.api_key.clone()),
        model: pick(base, overlay, |m| m.model.clone()),
        requests_per_second: pick(base, overlay, |m| m.requests_per_second),
    })
}

/// Merge two configs: `overlay` values take precedence over `base`.
///
/// The category list is replaced as a whole, never merged entry by entry.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    let (bp, op) = (&base.pipeline, &overlay.pipeline);
    let (bd, od) = (&base.paths, &overlay.paths);
    ConfigFile {
        model: merge_model(&base.model, &overlay.model),
        ordering_model: merge_model(&base.ordering_model, &overlay.ordering_model),
        pipeline: Some(PipelineConfig {
            grouping_policy: pick(bp, op, |p| p.grouping_policy.clone()),
            grouping_policy_text: pick(bp, op, |p| p.grouping_policy_text.clone()),
            grouping_attempts: pick(bp, op, |p| p.grouping_attempts),
            ordering_attempts: pick(bp, op, |p| p.ordering_attempts),
            retry_delay_secs: pick(bp, op, |p| p.retry_delay_secs),
            backoff: pick(bp, op, |p| p.backoff.clone()),
            max_retry_delay_secs: pick(bp, op, |p| p.max_retry_delay_secs),
            call_timeout_secs: pick(bp, op, |p| p.call_timeout_secs),
            ordering_concurrency: pick(bp, op, |p| p.ordering_concurrency),
        }),
        paths: Some(PathsConfig {
            output_dir: pick(bd, od, |p| p.output_dir.clone()),
            archive_dir: pick(bd, od, |p| p.archive_dir.clone()),
        }),
        categories: overlay.categories.or(base.categories),
    }
}

fn secs(value: f64, what: &str) -> Result<Duration, CoreError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| CoreError::Config(format!("{what} must be a non-negative number of seconds")))
}

/// Turn the on-disk configuration into a runtime [`Config`].
///
/// `policy` (from the command line) wins over the file. A grouping policy
/// and a non-empty category list are both required.
pub fn resolve_config(
    file: &ConfigFile,
    policy: Option<GroupingPolicy>,
) -> Result<Config, CoreError> {
    let pipeline = file.pipeline.clone().unwrap_or_default();

    let policy = match policy {
        Some(p) => p,
        None => match (&pipeline.grouping_policy_text, &pipeline.grouping_policy) {
            (Some(text), _) if !text.trim().is_empty() => GroupingPolicy::Custom(text.trim().to_string()),
            (_, Some(name)) => name.parse()?,
            _ => {
                return Err(CoreError::Config(
                    "no grouping policy configured (set pipeline.grouping_policy or pass --grouping)"
                        .into(),
                ));
            }
        },
    };

    let taxonomy = CategoryTaxonomy::new(file.categories.clone().unwrap_or_default())?;
    let mut config = Config::new(taxonomy, policy);

    let delay = match pipeline.retry_delay_secs {
        Some(s) => secs(s, "retry_delay_secs")?,
        None => crate::retry::DEFAULT_RETRY_DELAY,
    };
    let backoff = match pipeline.backoff.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("fixed") => Backoff::Fixed,
        Some("exponential") => Backoff::Exponential {
            max_delay: match pipeline.max_retry_delay_secs {
                Some(s) => secs(s, "max_retry_delay_secs")?,
                None => Duration::from_secs(60),
            },
            jitter: true,
        },
        Some(other) => {
            return Err(CoreError::Config(format!(
                "unknown backoff {other:?} (expected `fixed` or `exponential`)"
            )));
        }
    };

    config.grouping_retry = RetryPolicy::fixed(
        pipeline
            .grouping_attempts
            .unwrap_or(crate::retry::DEFAULT_MAX_ATTEMPTS),
        delay,
    )
    .with_backoff(backoff);
    config.ordering_retry = RetryPolicy::fixed(
        pipeline
            .ordering_attempts
            .unwrap_or(crate::retry::DEFAULT_MAX_ATTEMPTS),
        delay,
    )
    .with_backoff(backoff);
    if let Some(t) = pipeline.call_timeout_secs {
        config.call_timeout = Duration::from_secs(t);
    }
    if let Some(n) = pipeline.ordering_concurrency {
        config.ordering_concurrency = n;
    }

    config.validate()?;
    Ok(config)
}

/// Shared rate limiter for the backend described by `model`.
pub fn limiter_for(model: &ModelConfig) -> Arc<AdaptiveLimiter> {
    Arc::new(AdaptiveLimiter::per_second(
        model
            .requests_per_second
            .unwrap_or(DEFAULT_REQUESTS_PER_SECOND),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[model]
backend = "openai"
model = "gpt-4o-mini"

[pipeline]
grouping_policy = "packet"
ordering_attempts = 5
retry_delay_secs = 0.5

[[categories]]
key = "invoice"
label = "Invoices"

[[categories]]
key = "letter"
label = "Correspondence"
"#;

    #[test]
    fn parses_and_resolves_sample() {
        let file: ConfigFile = toml::from_str(SAMPLE).unwrap();
        let config = resolve_config(&file, None).unwrap();
        assert_eq!(config.grouping_policy, GroupingPolicy::Packet);
        assert_eq!(config.taxonomy.len(), 2);
        assert_eq!(config.taxonomy.label("letter"), Some("Correspondence"));
        assert_eq!(config.grouping_retry.max_attempts, 3);
        assert_eq!(config.ordering_retry.max_attempts, 5);
        assert_eq!(config.ordering_retry.delay, Duration::from_millis(500));
    }

    #[test]
    fn missing_policy_is_an_error() {
        let file: ConfigFile = toml::from_str("[[categories]]\nkey = \"a\"\nlabel = \"A\"\n").unwrap();
        let err = resolve_config(&file, None).unwrap_err();
        assert!(err.to_string().contains("grouping policy"));
        assert!(resolve_config(&file, Some(GroupingPolicy::DistinctTitle)).is_ok());
    }

    #[test]
    fn free_form_policy_text_wins() {
        let toml_str = r#"
[pipeline]
grouping_policy = "packet"
grouping_policy_text = "One document per envelope."

[[categories]]
key = "mail"
label = "Mail"
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let config = resolve_config(&file, None).unwrap();
        assert_eq!(
            config.grouping_policy,
            GroupingPolicy::Custom("One document per envelope.".into())
        );
    }

    #[test]
    fn empty_taxonomy_is_rejected() {
        let file: ConfigFile = toml::from_str("[pipeline]\ngrouping_policy = \"packet\"\n").unwrap();
        assert!(matches!(
            resolve_config(&file, None),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn zero_call_timeout_is_rejected() {
        let mut file: ConfigFile = toml::from_str(SAMPLE).unwrap();
        file.pipeline.as_mut().unwrap().call_timeout_secs = Some(0);
        let err = resolve_config(&file, None).unwrap_err();
        assert!(err.to_string().contains("call timeout"));
    }

    #[test]
    fn merge_overlay_wins_field_by_field() {
        let base: ConfigFile = toml::from_str(SAMPLE).unwrap();
        let overlay: ConfigFile =
            toml::from_str("[model]\nmodel = \"llama3\"\n[pipeline]\nordering_attempts = 2\n").unwrap();
        let merged = merge(base, overlay);

        let model = merged.model.unwrap();
        assert_eq!(model.backend.as_deref(), Some("openai"));
        assert_eq!(model.model.as_deref(), Some("llama3"));
        let pipeline = merged.pipeline.unwrap();
        assert_eq!(pipeline.ordering_attempts, Some(2));
        assert_eq!(pipeline.grouping_policy.as_deref(), Some("packet"));
        assert_eq!(merged.categories.unwrap().len(), 2);
    }

    #[test]
    fn load_required_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_required(&dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }

    #[test]
    fn exponential_backoff_from_file() {
        let toml_str = r#"
[pipeline]
grouping_policy = "distinct-title"
backoff = "exponential"
max_retry_delay_secs = 30

[[categories]]
key = "a"
label = "A"
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let config = resolve_config(&file, None).unwrap();
        assert_eq!(
            config.grouping_retry.backoff,
            Backoff::Exponential {
                max_delay: Duration::from_secs(30),
                jitter: true
            }
        );
    }
}
