use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use harvester_core::error::AppError;
use harvester_core::models::{ApiResponse, WorkKey};
use harvester_core::traits::SearchApi;
use reqwest::Client;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://api.yelp.com/v3/businesses/search";
pub const TOKEN_VAR: &str = "YELP_TOKEN";
const DEFAULT_PAGE_SIZE: u32 = 50;
const DEFAULT_SORT_BY: &str = "distance";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for the upstream business search API.
#[derive(Clone)]
pub struct ApiConfig {
    pub endpoint: Url,
    pub token: String,
    /// Results requested per key (`limit`).
    pub page_size: u32,
    pub sort_by: String,
    pub timeout: Duration,
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("endpoint", &self.endpoint.as_str())
            .field("token", &"<redacted>")
            .field("page_size", &self.page_size)
            .field("sort_by", &self.sort_by)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ApiConfig {
    pub fn new(token: impl Into<String>) -> Result<Self, AppError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(AppError::ConfigError(format!("{TOKEN_VAR} is empty")));
        }
        Ok(Self {
            endpoint: parse_endpoint(DEFAULT_ENDPOINT)?,
            token,
            page_size: DEFAULT_PAGE_SIZE,
            sort_by: DEFAULT_SORT_BY.to_string(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Read configuration from environment variables.
    ///
    /// - `YELP_TOKEN` (required)
    /// - `HARVESTER_API_ENDPOINT` (optional, defaults to the Yelp search endpoint)
    pub fn from_env() -> Result<Self, AppError> {
        let token = std::env::var(TOKEN_VAR).map_err(|_| {
            AppError::ConfigError(format!("{TOKEN_VAR} not set. Required to call the search API."))
        })?;

        let config = Self::new(token)?;
        match std::env::var("HARVESTER_API_ENDPOINT") {
            Err(_) => Ok(config),
            Ok(raw) => config.with_endpoint(&raw),
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self, AppError> {
        self.endpoint = parse_endpoint(endpoint)?;
        Ok(self)
    }

    pub fn with_page_size(mut self, page_size: u32) -> Result<Self, AppError> {
        if page_size == 0 {
            return Err(AppError::ConfigError("page size must be at least 1".into()));
        }
        self.page_size = page_size;
        Ok(self)
    }

    pub fn with_sort_by(mut self, sort_by: impl Into<String>) -> Self {
        self.sort_by = sort_by.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Full request URL for one key.
    pub fn request_url(&self, key: &WorkKey) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("location", key.as_str())
            .append_pair("limit", &self.page_size.to_string())
            .append_pair("sort_by", &self.sort_by);
        url
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, AppError> {
    let url = Url::parse(raw)
        .map_err(|e| AppError::ConfigError(format!("Invalid endpoint '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(AppError::ConfigError(format!(
            "Endpoint scheme '{scheme}' is not allowed (only http/https)"
        ))),
    }
}

/// [`SearchApi`] over HTTP using reqwest.
///
/// Returns every HTTP answer as an [`ApiResponse`], rate-limit and error
/// statuses included. Only transport failures become errors.
#[derive(Clone)]
pub struct ReqwestSearchApi {
    client: Client,
    config: Arc<ApiConfig>,
}

impl ReqwestSearchApi {
    pub fn new(config: ApiConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(concat!("harvester/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::NetworkError(e.to_string()))?;

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }
}

impl SearchApi for ReqwestSearchApi {
    async fn search(&self, key: &WorkKey) -> Result<ApiResponse, AppError> {
        let url = self.config.request_url(key);
        tracing::debug!(%key, "Searching");

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.config.timeout.as_secs())
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {e}"))
                } else {
                    AppError::NetworkError(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to read response body: {e}")))?;

        Ok(ApiResponse::new(status, body))
    }
}
