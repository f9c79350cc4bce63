//! Client settings, loaded from an optional TOML file.
use anyhow::{Context, Result};
use reqwest::blocking::{Client, ClientBuilder};
use reqwest::{NoProxy, Proxy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::retry::RetryPolicy;

const CATALOGUE_URL: &str = "https://catalogue.dataspace.copernicus.eu/";
const TOKEN_URL: &str =
    "https://identity.dataspace.copernicus.eu/auth/realms/CDSE/protocol/openid-connect/token";
const ODATA_URL: &str = "https://download.dataspace.copernicus.eu/odata/v1/";

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Settings {
    pub catalogue: CatalogueSettings,
    pub auth: AuthSettings,
    pub download: DownloadSettings,
    pub http: HttpSettings,
    pub retry: RetryPolicy,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct CatalogueSettings {
    pub url: Url,
}

impl Default for CatalogueSettings {
    fn default() -> Self {
        Self {
            url: Url::parse(CATALOGUE_URL).expect("Default catalogue URL should always parse"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct AuthSettings {
    pub token_url: Url,
    pub client_id: String,
    /// Login file consulted when no explicit username/password is given.
    /// Falls back to `$NETRC`, then `~/.netrc`.
    pub netrc_path: Option<PathBuf>,
    pub expiry_margin_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            token_url: Url::parse(TOKEN_URL).expect("Default token URL should always parse"),
            client_id: "cdse-public".to_string(),
            netrc_path: None,
            expiry_margin_secs: 60,
        }
    }
}

impl AuthSettings {
    pub fn netrc_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.netrc_path {
            return Some(path.clone());
        }
        if let Some(path) = std::env::var_os("NETRC") {
            return Some(PathBuf::from(path));
        }
        dirs::home_dir().map(|home| home.join(".netrc"))
    }

    pub fn expiry_margin(&self) -> Duration {
        Duration::from_secs(self.expiry_margin_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct DownloadSettings {
    pub odata_url: Url,
    pub chunk_size: usize,
    pub max_redirects: usize,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            odata_url: Url::parse(ODATA_URL).expect("Default OData URL should always parse"),
            chunk_size: 1024 * 1024,
            max_redirects: 10,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: String,
    pub proxy: ProxySettings,
}

/// Proxies for every request the client makes: catalogue, identity and transfers.
/// When none is set, the `HTTP_PROXY`/`HTTPS_PROXY` environment is honoured.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ProxySettings {
    pub http: Option<String>,
    pub https: Option<String>,
    /// Comma-separated hosts reached directly, e.g. "localhost,127.0.0.1"
    pub no_proxy: Option<String>,
}

impl ProxySettings {
    pub fn proxies(&self) -> reqwest::Result<Vec<Proxy>> {
        let no_proxy = self.no_proxy.as_deref().and_then(NoProxy::from_string);
        let mut proxies = Vec::new();
        if let Some(url) = &self.http {
            proxies.push(Proxy::http(url.as_str())?.no_proxy(no_proxy.clone()));
        }
        if let Some(url) = &self.https {
            proxies.push(Proxy::https(url.as_str())?.no_proxy(no_proxy.clone()));
        }
        Ok(proxies)
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            connect_timeout_secs: 30,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
            proxy: ProxySettings::default(),
        }
    }
}

impl HttpSettings {
    fn builder(&self) -> reqwest::Result<ClientBuilder> {
        let mut builder = Client::builder()
            .user_agent(&self.user_agent)
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs));
        for proxy in self.proxy.proxies()? {
            builder = builder.proxy(proxy);
        }
        Ok(builder)
    }

    /// Client for catalogue and identity calls: bounded total time, default redirects.
    pub fn api_client(&self) -> reqwest::Result<Client> {
        self.builder()?
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
    }

    /// Client for asset transfers. Large bodies make a total timeout meaningless, and
    /// redirects are followed by hand so the bearer token survives host changes.
    pub fn transfer_client(&self) -> reqwest::Result<Client> {
        self.builder()?
            .timeout(None)
            .redirect(reqwest::redirect::Policy::none())
            .build()
    }
}

impl Settings {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Unable to read settings from {}", path.display()))?;
        let settings: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid settings file {}", path.display()))?;
        Ok(settings)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Points every endpoint at one base URL. Handy for mirrors and local test servers.
    pub fn with_base_url(mut self, base: &Url) -> Result<Self> {
        self.catalogue.url = base.clone();
        self.auth.token_url = base.join("auth/token")?;
        self.download.odata_url = base.join("odata/v1/")?;
        Ok(self)
    }
}
