use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, Context};
use reqwest::blocking::Client;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use url::Url;

use super::{ByteSource, SegmentFetcher};
use crate::segment::Segment;

pub fn range_header(local_start: u64, local_end: u64) -> String {
    format!("bytes={}-{}", local_start, local_end)
}

/// Serves segments addressed by URL through HTTP range requests.
#[derive(Debug, Clone)]
pub struct HttpRangeFetcher {
    client: Client,
}

impl HttpRangeFetcher {
    /// The body of a response is read without a deadline; a stalled body is
    /// bounded by the stream buffer's timeouts instead.
    pub fn new(connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(None::<Duration>)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl SegmentFetcher<Url> for HttpRangeFetcher {
    fn fetch(
        &self,
        local_start: u64,
        local_end: u64,
        segment: &Segment<Url>,
    ) -> anyhow::Result<ByteSource> {
        let url = &segment.handle;
        let range = range_header(local_start, local_end);
        log::debug!("http/GET: {} {}", url, range);

        let response = self
            .client
            .get(url.clone())
            .header(RANGE, range.as_str())
            .send()
            .with_context(|| format!("GET {} ({})", url, range))?
            .error_for_status()?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {}
            // a server ignoring the range still serves the right bytes
            // when the range starts at zero
            StatusCode::OK if local_start == 0 => {}
            status => {
                return Err(anyhow!(
                    "GET {} ({}): unexpected status {}",
                    url,
                    range,
                    status
                ))
            }
        }

        Ok(Box::new(response.take(local_end - local_start + 1)))
    }
}
