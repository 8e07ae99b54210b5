//! HTTP fetcher for Cloudflare's published IP ranges.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{CloudflareConfig, SecureString};
use crate::error::FetchError;
use crate::model::{IpFamily, IpRange};

const RETRY_DELAY_MS: u64 = 500;

/// Maximum size of one range list (1 MB)
/// The published lists are well under 1 KB
const MAX_LIST_SIZE: usize = 1024 * 1024;

/// Source of provider ranges, one family per call.
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    /// Raw CIDR strings for `family`, as published.
    async fn fetch(&self, family: IpFamily) -> Result<Vec<String>, FetchError>;
}

/// Fetches ranges from Cloudflare's text lists or the `/client/v4/ips` API.
pub struct CloudflareFetcher {
    client: Client,
    ipv4_url: String,
    ipv6_url: String,
    api_key: SecureString,
    timeout: Duration,
    max_retries: u32,
}

impl CloudflareFetcher {
    pub fn new(config: &CloudflareConfig) -> Result<Self, FetchError> {
        let timeout = Duration::from_secs(config.fetch_timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("cloudflare-ufw-sync/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Http {
                family: IpFamily::V4,
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            ipv4_url: config.ipv4_url.clone(),
            ipv6_url: config.ipv6_url.clone(),
            api_key: config.get_api_key(),
            timeout,
            max_retries: config.max_retries,
        })
    }

    fn url(&self, family: IpFamily) -> &str {
        match family {
            IpFamily::V4 => &self.ipv4_url,
            IpFamily::V6 => &self.ipv6_url,
        }
    }

    /// Total time allowed for one family, retries included
    fn deadline(&self) -> Duration {
        self.timeout * (self.max_retries + 1)
            + Duration::from_millis(RETRY_DELAY_MS * ((1u64 << self.max_retries) - 1))
    }

    /// Fetch content with retry logic and size validation
    async fn fetch_with_retry(&self, family: IpFamily) -> Result<String, FetchError> {
        let url = self.url(family);
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = RETRY_DELAY_MS * (1 << (attempt - 1));
                debug!("Retry {} after {}ms for {}", attempt, delay, url);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let mut request = self.client.get(url);
            if !self.api_key.is_empty() {
                request = request.bearer_auth(self.api_key.as_str());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return self.read_body(family, response).await;
                    }
                    let err = FetchError::Status {
                        family,
                        status: status.as_u16(),
                    };
                    // Client errors will not go away on retry
                    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
                Err(e) if e.is_timeout() => {
                    last_error = Some(FetchError::Timeout {
                        family,
                        timeout: self.timeout,
                    });
                }
                Err(e) => {
                    last_error = Some(FetchError::Http {
                        family,
                        message: e.to_string(),
                    });
                }
            }
        }

        Err(last_error.unwrap_or(FetchError::Http {
            family,
            message: "no attempt made".to_string(),
        }))
    }

    async fn read_body(
        &self,
        family: IpFamily,
        response: reqwest::Response,
    ) -> Result<String, FetchError> {
        if let Some(content_length) = response.content_length() {
            if content_length as usize > MAX_LIST_SIZE {
                return Err(FetchError::TooLarge {
                    family,
                    size: content_length as usize,
                    max: MAX_LIST_SIZE,
                });
            }
        }

        let body = response.text().await.map_err(|e| FetchError::Http {
            family,
            message: format!("failed to read response body: {}", e),
        })?;

        // Double-check actual size after download
        if body.len() > MAX_LIST_SIZE {
            return Err(FetchError::TooLarge {
                family,
                size: body.len(),
                max: MAX_LIST_SIZE,
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl RangeFetcher for CloudflareFetcher {
    async fn fetch(&self, family: IpFamily) -> Result<Vec<String>, FetchError> {
        info!("Fetching Cloudflare {} ranges...", family);
        let deadline = self.deadline();
        let body = tokio::time::timeout(deadline, self.fetch_with_retry(family))
            .await
            .map_err(|_| FetchError::Timeout {
                family,
                timeout: deadline,
            })??;

        let entries = parse_range_body(family, &body)?;
        info!("Fetched {} {} entries", entries.len(), family);
        Ok(entries)
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<ApiRanges>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiRanges {
    #[serde(default)]
    ipv4_cidrs: Vec<String>,
    #[serde(default)]
    ipv6_cidrs: Vec<String>,
}

/// Extract the entries for `family` from a response body.
///
/// A body starting with `{` is read as a Cloudflare API envelope, anything
/// else as a plain list with one entry per line and `#` comments.
pub fn parse_range_body(family: IpFamily, body: &str) -> Result<Vec<String>, FetchError> {
    let trimmed = body.trim_start();
    if !trimmed.starts_with('{') {
        return Ok(parse_simple_list(trimmed));
    }

    let response: ApiResponse = serde_json::from_str(trimmed).map_err(|e| FetchError::Parse {
        family,
        message: e.to_string(),
    })?;

    if !response.success {
        let detail = response
            .errors
            .iter()
            .map(|e| format!("{} ({})", e.message, e.code))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(FetchError::Api(if detail.is_empty() {
            "request was not successful".to_string()
        } else {
            detail
        }));
    }

    let ranges = response.result.unwrap_or_default();
    Ok(match family {
        IpFamily::V4 => ranges.ipv4_cidrs,
        IpFamily::V6 => ranges.ipv6_cidrs,
    })
}

/// Parse simple line-based list, ignoring comments and blank lines
fn parse_simple_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Validate fetched entries into ranges of `family`.
///
/// Invalid entries and entries of the other family are logged and skipped.
/// An empty result is an error: no ranges means something upstream is wrong.
pub fn into_ranges(family: IpFamily, entries: &[String]) -> Result<Vec<IpRange>, FetchError> {
    let mut ranges = Vec::with_capacity(entries.len());
    for entry in entries {
        match IpRange::parse(entry) {
            Ok(range) if range.family() == family => ranges.push(range),
            Ok(range) => warn!("Ignoring {} entry {} in {} list", range.family(), range, family),
            Err(e) => warn!("Ignoring {}", e),
        }
    }
    if ranges.is_empty() {
        return Err(FetchError::Empty(family));
    }
    Ok(ranges)
}
