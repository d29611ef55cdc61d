use std::time::Duration;

use crate::config::Config;

/// The `User-Agent` sent with every download.
pub const USER_AGENT: &str = concat!("mediacache/", env!("CARGO_PKG_VERSION"));

/// Various timeouts for the HTTP downloads.
#[derive(Copy, Clone, Debug)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for receiving the response headers.
    pub head: Duration,
    /// Global timeout for one download, including the body.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            head: config.head_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(500),
            head: Duration::from_secs(5),
            max_download: Duration::from_secs(315),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided timeouts.
///
/// The overall request timeout is left to the caller, which bounds the whole download
/// (head and streamed body) with [`DownloadTimeouts::max_download`].
pub fn create_client(timeouts: &DownloadTimeouts) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .user_agent(USER_AGENT)
        .connect_timeout(timeouts.connect)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}
