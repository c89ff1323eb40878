use std::path::{Path, PathBuf};

use anyhow::Context as _;
use url::Url;

use crate::document::SelectorPath;
use crate::formats::{SOURCE_URL_FIELD, SiteConfig};
use crate::transform::Transform;

/// Site configurations keyed by domain.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    configs: Vec<SiteConfig>,
}

impl ConfigStore {
    /// Loads a JSON/YAML file (one config or a list) or a directory of them.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let files = if path.is_dir() {
            config_files_in(path)?
        } else {
            vec![path.to_path_buf()]
        };

        let mut configs = Vec::new();
        for file in &files {
            let loaded = load_file(file).with_context(|| format!("load {}", file.display()))?;
            configs.extend(loaded);
        }
        tracing::debug!(
            path = %path.display(),
            files = files.len(),
            configs = configs.len(),
            "loaded site configs"
        );
        Self::from_configs(configs)
    }

    pub fn from_configs(configs: Vec<SiteConfig>) -> anyhow::Result<Self> {
        for config in &configs {
            validate(config).with_context(|| format!("site config `{}`", config.website))?;
        }
        Ok(Self { configs })
    }

    pub fn configs(&self) -> &[SiteConfig] {
        &self.configs
    }

    /// Exact host or sub-domain match first (the most specific domain wins);
    /// then the first config whose domain occurs anywhere in the URL.
    pub fn lookup(&self, url: &Url) -> Option<&SiteConfig> {
        let host = url.host_str()?.to_ascii_lowercase();
        let host = host.trim_start_matches("www.");

        self.configs
            .iter()
            .filter(|config| {
                let site = site_domain(&config.website);
                host == site || host.ends_with(&format!(".{site}"))
            })
            .max_by_key(|config| site_domain(&config.website).len())
            .or_else(|| {
                let raw = url.as_str().to_ascii_lowercase();
                self.configs
                    .iter()
                    .find(|config| raw.contains(&site_domain(&config.website)))
            })
    }
}

fn config_files_in(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("read dir: {}", dir.display()))? {
        let path = entry.context("read dir entry")?.path();
        if path.is_file() && config_format(&path).is_some() {
            files.push(path);
        }
    }
    files.sort();
    if files.is_empty() {
        anyhow::bail!("no *.json, *.yaml or *.yml files in {}", dir.display());
    }
    Ok(files)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Json,
    Yaml,
}

fn config_format(path: &Path) -> Option<ConfigFormat> {
    match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
        "json" => Some(ConfigFormat::Json),
        "yaml" | "yml" => Some(ConfigFormat::Yaml),
        _ => None,
    }
}

fn load_file(path: &Path) -> anyhow::Result<Vec<SiteConfig>> {
    let format = config_format(path)
        .ok_or_else(|| anyhow::anyhow!("unsupported config extension (expected json, yaml or yml)"))?;
    let raw = std::fs::read_to_string(path).context("read config file")?;
    let is_list = starts_list(&raw, format);

    let configs = match (format, is_list) {
        (ConfigFormat::Json, true) => serde_json::from_str(&raw).context("parse config list json")?,
        (ConfigFormat::Json, false) => vec![serde_json::from_str(&raw).context("parse config json")?],
        (ConfigFormat::Yaml, true) => serde_yaml::from_str(&raw).context("parse config list yaml")?,
        (ConfigFormat::Yaml, false) => vec![serde_yaml::from_str(&raw).context("parse config yaml")?],
    };
    Ok(configs)
}

/// Peeks at the first significant token; untagged enums would hide parse errors.
fn starts_list(raw: &str, format: ConfigFormat) -> bool {
    match format {
        ConfigFormat::Json => raw.trim_start().starts_with('['),
        ConfigFormat::Yaml => raw
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#') && *line != "---")
            .is_some_and(|line| line == "-" || line.starts_with("- ") || line.starts_with('[')),
    }
}

fn validate(config: &SiteConfig) -> anyhow::Result<()> {
    if site_domain(&config.website).is_empty() {
        anyhow::bail!("`website` must not be empty");
    }
    if config.fields.is_empty() {
        anyhow::bail!("`fields` must declare at least one field");
    }
    if config.fields.contains(SOURCE_URL_FIELD) {
        anyhow::bail!("field name `{SOURCE_URL_FIELD}` is reserved");
    }
    if let Some(name) = config.probe_field.as_deref()
        && !config.fields.contains(name)
    {
        anyhow::bail!("`probe_field` names an undeclared field: {name}");
    }
    Ok(())
}

/// Lower-cased domain of a `website` key, without scheme, `www.` or path.
pub fn site_domain(website: &str) -> String {
    let website = website.trim().to_ascii_lowercase();
    let website = website
        .strip_prefix("https://")
        .or_else(|| website.strip_prefix("http://"))
        .unwrap_or(website.as_str());
    let website = website.strip_prefix("www.").unwrap_or(website);
    website.split('/').next().unwrap_or_default().to_owned()
}

/// Every path and transform that would fail at extraction time.
pub fn problems(config: &SiteConfig) -> Vec<String> {
    let mut problems = Vec::new();

    for (name, rule) in config.fields.iter() {
        if let Some(path) = rule.path.as_deref().filter(|p| !p.trim().is_empty())
            && let Err(err) = SelectorPath::parse(path)
        {
            problems.push(format!("field `{name}`: {err}"));
        }
        if let Some(expr) = rule.transform.as_deref().filter(|t| !t.trim().is_empty())
            && let Err(err) = Transform::parse(expr)
        {
            problems.push(format!("field `{name}`: {err}"));
        }
    }

    let selectors = [
        ("list_page_check", config.list_page_check.as_deref()),
        ("next_page", config.next_page.as_deref()),
        ("page_ready", config.render.page_ready.as_deref()),
    ];
    for (key, path) in selectors {
        if let Some(path) = path.filter(|p| !p.trim().is_empty())
            && let Err(err) = SelectorPath::parse(path)
        {
            problems.push(format!("`{key}`: {err}"));
        }
    }

    if let Some(name) = config.page_query.as_deref()
        && name.trim().is_empty()
    {
        problems.push("`page_query` is blank".to_owned());
    }

    problems
}
