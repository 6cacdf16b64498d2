use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::Context;

use crate::cli::ConnectArgs;

/// Resolved connection settings for the content API.
pub struct StoreSettings {
    pub base_url: String,
    pub dataset: String,
    pub token: String,
}

impl std::fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSettings")
            .field("base_url", &self.base_url)
            .field("dataset", &self.dataset)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl StoreSettings {
    /// Validate CLI/environment connection settings, prompting for the
    /// token when it was not provided any other way.
    pub fn resolve(args: &ConnectArgs) -> anyhow::Result<Self> {
        let base_url = args.api_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            anyhow::bail!("No API URL configured. Pass --api-url or set GALLERY_CMS_URL.");
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            anyhow::bail!("API URL must start with http:// or https://, got '{}'", base_url);
        }

        let dataset = args.dataset.trim().to_string();
        if dataset.is_empty() {
            anyhow::bail!("No dataset configured. Pass --dataset or set GALLERY_CMS_DATASET.");
        }

        let token = match args.token.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => prompt_token()?,
        };

        Ok(Self {
            base_url,
            dataset,
            token,
        })
    }
}

fn prompt_token() -> anyhow::Result<String> {
    if !std::io::stdin().is_terminal() {
        anyhow::bail!("No API token configured. Set GALLERY_CMS_TOKEN or pass --token.");
    }
    let token = tokio::task::block_in_place(|| rpassword::prompt_password("API token: "))
        .context("Failed to read API token")?;
    let token = token.trim().to_string();
    if token.is_empty() {
        anyhow::bail!("API token must not be empty");
    }
    Ok(token)
}

/// Resolve `~` to the user's home directory, as shells would.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
