use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::auth::AuthMethod;
use crate::exec::DEFAULT_TOOL;

pub const DEFAULT_PAGES_LIBRARY: &str = "sitepages";
pub const DEFAULT_PAGES_LIST_TITLE: &str = "Site Pages";
pub const DEFAULT_ASSET_FOLDER: &str = "SiteAssets";
pub const DEFAULT_PROTECTED_FOLDERS: &[&str] = &["templates", "forms"];

const DEFAULT_CONFIG_TOML: &str = r#"[site]
# web_url = "https://contoso.sharepoint.com/sites/docs"
tool = "m365"

[publish]
retry = true
continue_on_error = false
clean_start = false
skip_existing_pages = false
strict_existence = false
asset_folder = "SiteAssets"

[auth]
method = "none"
"#;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteConfig {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub publish: PublishSection,
    #[serde(default)]
    pub auth: AuthSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteSection {
    pub web_url: Option<String>,
    pub tool: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PublishSection {
    pub retry: Option<bool>,
    pub continue_on_error: Option<bool>,
    pub clean_start: Option<bool>,
    pub skip_existing_pages: Option<bool>,
    pub strict_existence: Option<bool>,
    pub asset_folder: Option<String>,
    pub pages_library: Option<String>,
    pub pages_list_title: Option<String>,
    #[serde(default)]
    pub protected_folders: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct AuthSection {
    pub method: Option<String>,
    pub username: Option<String>,
}

impl SiteConfig {
    /// Site URL: env SITEPRESS_WEB_URL > config.
    pub fn web_url(&self) -> Option<String> {
        env_override("SITEPRESS_WEB_URL").or_else(|| {
            self.site
                .web_url
                .as_ref()
                .map(|url| url.trim().trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty())
        })
    }

    /// Tool binary: env SITEPRESS_TOOL > config > DEFAULT_TOOL.
    pub fn tool(&self) -> String {
        env_override("SITEPRESS_TOOL")
            .or_else(|| self.site.tool.clone())
            .unwrap_or_else(|| DEFAULT_TOOL.to_string())
    }

    pub fn retry(&self) -> bool {
        self.publish.retry.unwrap_or(true)
    }

    pub fn continue_on_error(&self) -> bool {
        self.publish.continue_on_error.unwrap_or(false)
    }

    pub fn clean_start(&self) -> bool {
        self.publish.clean_start.unwrap_or(false)
    }

    pub fn skip_existing_pages(&self) -> bool {
        self.publish.skip_existing_pages.unwrap_or(false)
    }

    pub fn strict_existence(&self) -> bool {
        self.publish.strict_existence.unwrap_or(false)
    }

    pub fn asset_folder(&self) -> &str {
        self.publish
            .asset_folder
            .as_deref()
            .unwrap_or(DEFAULT_ASSET_FOLDER)
    }

    pub fn pages_library(&self) -> &str {
        self.publish
            .pages_library
            .as_deref()
            .unwrap_or(DEFAULT_PAGES_LIBRARY)
    }

    pub fn pages_list_title(&self) -> &str {
        self.publish
            .pages_list_title
            .as_deref()
            .unwrap_or(DEFAULT_PAGES_LIST_TITLE)
    }

    pub fn protected_folders(&self) -> Vec<String> {
        if self.publish.protected_folders.is_empty() {
            DEFAULT_PROTECTED_FOLDERS
                .iter()
                .map(|name| (*name).to_string())
                .collect()
        } else {
            self.publish
                .protected_folders
                .iter()
                .map(|name| name.to_lowercase())
                .collect()
        }
    }

    /// Login method with secrets pulled from SITEPRESS_PASSWORD and
    /// SITEPRESS_CERTIFICATE.
    pub fn auth_method(&self) -> Result<AuthMethod> {
        let method = self
            .auth
            .method
            .as_deref()
            .unwrap_or("none")
            .trim()
            .to_ascii_lowercase();
        match method.as_str() {
            "" | "none" => Ok(AuthMethod::None),
            "devicecode" | "device_code" | "device-code" => Ok(AuthMethod::DeviceCode),
            "password" => {
                let username = self
                    .auth
                    .username
                    .clone()
                    .filter(|value| !value.trim().is_empty())
                    .ok_or_else(|| {
                        anyhow::anyhow!("auth.username is required for password login")
                    })?;
                let password = env_override("SITEPRESS_PASSWORD").ok_or_else(|| {
                    anyhow::anyhow!("SITEPRESS_PASSWORD is required for password login")
                })?;
                Ok(AuthMethod::Password { username, password })
            }
            "certificate" => {
                let certificate = env_override("SITEPRESS_CERTIFICATE").ok_or_else(|| {
                    anyhow::anyhow!("SITEPRESS_CERTIFICATE is required for certificate login")
                })?;
                Ok(AuthMethod::Certificate {
                    certificate,
                    password: env_override("SITEPRESS_PASSWORD"),
                })
            }
            other => bail!("unknown auth.method `{other}`"),
        }
    }
}

/// Load and parse a SiteConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<SiteConfig> {
    if !config_path.exists() {
        return Ok(SiteConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: SiteConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Write the starter config. Returns `true` when a write occurred.
pub fn write_default_config(config_path: &Path, force: bool) -> Result<bool> {
    if config_path.exists() && !force {
        return Ok(false);
    }
    let parent = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", config_path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    fs::write(config_path, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(true)
}

fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
