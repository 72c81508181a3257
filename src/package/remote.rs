use reqwest::Client;

use crate::errors::Result;
use crate::package::format::{Footer, FOOTER_LEN};
use crate::package::reader::{parse_package, ParsedPackage};
use crate::services::http;

/// The same parsed view a local self-read produces, built from three range
/// requests: the 256-byte discovery probe, the tail footer, and the segment
/// region. No payload bytes are transferred.
#[derive(Debug)]
pub struct RemotePackage {
    pub url: String,
    pub total_size: u64,
    pub footer: Footer,
    pub parsed: ParsedPackage,
}

impl RemotePackage {
    pub async fn open(client: &Client, url: &str) -> Result<Self> {
        let (probe, total_size) = http::fetch_probe(client, url).await?;

        let footer = if total_size <= probe.len() as u64 {
            Footer::decode_from_tail(&probe[..total_size as usize])?
        } else {
            let tail =
                http::fetch_range_bytes(client, url, total_size - FOOTER_LEN as u64, FOOTER_LEN as u64)
                    .await?;
            Footer::decode_from_tail(&tail)?
        };

        let region_len = footer.segment_region_len();
        let region = if region_len == 0 {
            Vec::new()
        } else {
            http::fetch_range_bytes(client, url, footer.payload_start as u64, region_len).await?
        };
        let parsed = parse_package(&footer, &region, total_size)?;
        Ok(Self {
            url: url.to_string(),
            total_size,
            footer,
            parsed,
        })
    }
}
