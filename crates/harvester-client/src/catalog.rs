use std::time::Duration;

use harvester_core::error::AppError;
use harvester_core::traits::CatalogSource;
use reqwest::Client;
use url::Url;

const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Catalog downloaded over HTTP(S) with a single GET.
#[derive(Clone)]
pub struct HttpCatalog {
    client: Client,
    url: Url,
}

impl HttpCatalog {
    pub fn new(url: &str) -> Result<Self, AppError> {
        Self::with_timeout(url, DEFAULT_DOWNLOAD_TIMEOUT)
    }

    pub fn with_timeout(url: &str, timeout: Duration) -> Result<Self, AppError> {
        let url = Url::parse(url)
            .map_err(|e| AppError::ConfigError(format!("Invalid catalog URL '{url}': {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::NetworkError(e.to_string()))?;
        Ok(Self { client, url })
    }

    /// True for locations this source can load.
    pub fn handles(location: &str) -> bool {
        location.starts_with("http://") || location.starts_with("https://")
    }
}

impl CatalogSource for HttpCatalog {
    fn describe(&self) -> String {
        self.url.to_string()
    }

    async fn load(&self) -> Result<String, AppError> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| AppError::CatalogUnavailable(format!("{}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::CatalogUnavailable(format!(
                "{}: HTTP {}",
                self.url,
                status.as_u16()
            )));
        }

        response.text().await.map_err(|e| {
            AppError::CatalogUnavailable(format!("{}: failed to read body: {e}", self.url))
        })
    }
}
