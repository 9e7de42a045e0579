//! Azure Blob Storage over REST
//!
//! Every call is authorised with a service SAS signed locally with the
//! account key, so no SDK or shared-key request signing is needed.

use super::{matches_suffix, BlobStore, SignedUrl};
use crate::config::StorageConfig;
use crate::error::PipelineError;
use crate::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Client, StatusCode, Url};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, error, info};

type HmacSha256 = Hmac<Sha256>;

const SAS_VERSION: &str = "2022-11-02";

/// Lifetime of the SAS used for the store's own calls
const OPERATION_SAS_TTL: Duration = Duration::from_secs(15 * 60);

/// Backdating of SAS start times to absorb clock skew
const CLOCK_SKEW_MINUTES: i64 = 5;

//
// ================= Connection String =================
//

#[derive(Debug, Clone, PartialEq)]
pub struct StorageAccount {
    pub name: String,
    pub key: Vec<u8>,
    pub blob_endpoint: String,
}

impl StorageAccount {
    pub fn parse(connection_string: &str) -> Result<Self> {
        let mut name = None;
        let mut key = None;
        let mut protocol = "https".to_string();
        let mut suffix = "core.windows.net".to_string();
        let mut blob_endpoint = None;

        for part in connection_string.split(';').filter(|p| !p.trim().is_empty()) {
            let Some((k, v)) = part.split_once('=') else {
                continue;
            };
            match k.trim() {
                "AccountName" => name = Some(v.trim().to_string()),
                "AccountKey" => key = Some(v.trim().to_string()),
                "DefaultEndpointsProtocol" => protocol = v.trim().to_string(),
                "EndpointSuffix" => suffix = v.trim().to_string(),
                "BlobEndpoint" => blob_endpoint = Some(v.trim().trim_end_matches('/').to_string()),
                _ => {}
            }
        }

        let name = name.ok_or_else(|| {
            PipelineError::Config("storage connection string has no AccountName".to_string())
        })?;
        let key = key.ok_or_else(|| {
            PipelineError::Config("storage connection string has no AccountKey".to_string())
        })?;
        let key = STANDARD
            .decode(key)
            .map_err(|e| PipelineError::Config(format!("storage AccountKey is not base64: {}", e)))?;

        let blob_endpoint = blob_endpoint
            .unwrap_or_else(|| format!("{}://{}.blob.{}", protocol, name, suffix));

        Ok(Self {
            name,
            key,
            blob_endpoint,
        })
    }
}

//
// ================= Service SAS =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SasResource<'a> {
    Container,
    Blob(&'a str),
}

fn sas_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// String-to-sign for a service SAS (version 2020-12-06 and later)
fn string_to_sign(
    account: &str,
    container: &str,
    resource: SasResource<'_>,
    permissions: &str,
    start: &str,
    expiry: &str,
) -> String {
    let (canonical, signed_resource) = match resource {
        SasResource::Container => (format!("/blob/{}/{}", account, container), "c"),
        SasResource::Blob(blob) => (format!("/blob/{}/{}/{}", account, container, blob), "b"),
    };

    [
        permissions,
        start,
        expiry,
        canonical.as_str(),
        "", // signed identifier
        "", // signed ip
        "https",
        SAS_VERSION,
        signed_resource,
        "", // snapshot time
        "", // encryption scope
        "", // rscc
        "", // rscd
        "", // rsce
        "", // rscl
        "", // rsct
    ]
    .join("\n")
}

/// SAS query parameters, signature included
pub fn sas_query(
    account: &StorageAccount,
    container: &str,
    resource: SasResource<'_>,
    permissions: &str,
    start: DateTime<Utc>,
    expiry: DateTime<Utc>,
) -> Result<Vec<(&'static str, String)>> {
    let start = sas_time(start);
    let expiry = sas_time(expiry);
    let to_sign = string_to_sign(
        &account.name,
        container,
        resource,
        permissions,
        &start,
        &expiry,
    );

    let mut mac = HmacSha256::new_from_slice(&account.key)
        .map_err(|e| PipelineError::Config(format!("invalid storage key: {}", e)))?;
    mac.update(to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let signed_resource = match resource {
        SasResource::Container => "c",
        SasResource::Blob(_) => "b",
    };

    Ok(vec![
        ("sv", SAS_VERSION.to_string()),
        ("sr", signed_resource.to_string()),
        ("sp", permissions.to_string()),
        ("st", start),
        ("se", expiry),
        ("spr", "https".to_string()),
        ("sig", signature),
    ])
}

//
// ================= Listing =================
//

#[derive(Debug, Default, PartialEq)]
pub struct BlobPage {
    pub names: Vec<String>,
    pub next_marker: Option<String>,
}

/// Parse one page of a `List Blobs` response
pub fn parse_blob_list(xml: &str) -> Result<BlobPage> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = BlobPage::default();
    let mut path: Vec<Vec<u8>> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => path.push(e.name().as_ref().to_vec()),
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| PipelineError::Storage(format!("invalid listing XML: {}", e)))?
                    .into_owned();
                let current = path.last().map(Vec::as_slice);
                let parent = path.len().checked_sub(2).map(|i| path[i].as_slice());

                match (parent, current) {
                    (Some(b"Blob"), Some(b"Name")) => page.names.push(text),
                    (Some(b"EnumerationResults"), Some(b"NextMarker")) if !text.is_empty() => {
                        page.next_marker = Some(text)
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(PipelineError::Storage(format!(
                    "invalid listing XML at {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
    }

    Ok(page)
}

//
// ================= Store =================
//

pub struct AzureBlobStore {
    client: Client,
    account: StorageAccount,
    container: String,
}

impl AzureBlobStore {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            account: StorageAccount::parse(&config.connection_string)?,
            container: config.container.clone(),
        })
    }

    fn url(
        &self,
        resource: SasResource<'_>,
        permissions: &str,
        ttl: Duration,
        extra: &[(&str, &str)],
    ) -> Result<(Url, DateTime<Utc>)> {
        let now = Utc::now();
        let expiry = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| PipelineError::Storage(format!("invalid expiry: {}", e)))?;
        let query = sas_query(
            &self.account,
            &self.container,
            resource,
            permissions,
            now - chrono::Duration::minutes(CLOCK_SKEW_MINUTES),
            expiry,
        )?;

        let mut url = Url::parse(&self.account.blob_endpoint)
            .map_err(|e| PipelineError::Config(format!("invalid blob endpoint: {}", e)))?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                PipelineError::Config("blob endpoint cannot carry a path".to_string())
            })?;
            segments.pop_if_empty().push(&self.container);
            if let SasResource::Blob(blob) = resource {
                segments.extend(blob.split('/'));
            }
        }
        {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in extra {
                pairs.append_pair(k, v);
            }
            for (k, v) in &query {
                pairs.append_pair(k, v);
            }
        }

        Ok((url, expiry))
    }

    async fn check(response: reqwest::Response, context: &str, name: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(PipelineError::NotFound(format!("blob '{}'", name)));
        }
        error!(%status, "Blob {} failed: {}", context, body);
        Err(PipelineError::Storage(format!("{} '{}' failed ({})", context, name, status)))
    }
}

fn transport(context: &str, e: reqwest::Error) -> PipelineError {
    error!("Blob {} request failed: {}", context, e);
    PipelineError::Storage(format!("{} request failed: {}", context, e))
}

#[async_trait::async_trait]
impl BlobStore for AzureBlobStore {
    async fn upload(&self, name: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let (url, _) = self.url(SasResource::Blob(name), "cw", OPERATION_SAS_TTL, &[])?;
        let size = bytes.len();

        let response = self
            .client
            .put(url)
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-version", SAS_VERSION)
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| transport("upload", e))?;
        Self::check(response, "upload", name).await?;

        info!(blob = %name, size, "Blob uploaded");
        Ok(())
    }

    async fn download(&self, name: &str) -> Result<Vec<u8>> {
        let (url, _) = self.url(SasResource::Blob(name), "r", OPERATION_SAS_TTL, &[])?;

        let response = self
            .client
            .get(url)
            .header("x-ms-version", SAS_VERSION)
            .send()
            .await
            .map_err(|e| transport("download", e))?;
        let response = Self::check(response, "download", name).await?;
        let bytes = response.bytes().await.map_err(|e| transport("download", e))?;

        debug!(blob = %name, size = bytes.len(), "Blob downloaded");
        Ok(bytes.to_vec())
    }

    async fn list(&self, suffix: Option<&str>) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut extra = vec![("restype", "container"), ("comp", "list")];
            if let Some(m) = marker.as_deref() {
                extra.push(("marker", m));
            }
            let (url, _) = self.url(SasResource::Container, "l", OPERATION_SAS_TTL, &extra)?;

            let response = self
                .client
                .get(url)
                .header("x-ms-version", SAS_VERSION)
                .send()
                .await
                .map_err(|e| transport("list", e))?;
            let response = Self::check(response, "list", &self.container).await?;
            let xml = response.text().await.map_err(|e| transport("list", e))?;

            let page = parse_blob_list(&xml)?;
            names.extend(page.names.into_iter().filter(|n| matches_suffix(n, suffix)));

            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        debug!(count = names.len(), "Blobs listed");
        Ok(names)
    }

    async fn signed_url(&self, name: &str, ttl: Duration) -> Result<SignedUrl> {
        let (url, expires_at) = self.url(SasResource::Blob(name), "r", ttl, &[])?;
        Ok(SignedUrl {
            url: url.to_string(),
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn account() -> StorageAccount {
        StorageAccount::parse(
            "DefaultEndpointsProtocol=https;AccountName=acct;AccountKey=dGVzdC1hY2NvdW50LWtleQ==;EndpointSuffix=core.windows.net",
        )
        .unwrap()
    }

    #[test]
    fn test_connection_string_parsing() {
        let acct = account();
        assert_eq!(acct.name, "acct");
        assert_eq!(acct.key, b"test-account-key");
        assert_eq!(acct.blob_endpoint, "https://acct.blob.core.windows.net");

        let custom = StorageAccount::parse(
            "AccountName=dev;AccountKey=a2V5;BlobEndpoint=http://127.0.0.1:10000/dev/",
        )
        .unwrap();
        assert_eq!(custom.blob_endpoint, "http://127.0.0.1:10000/dev");

        assert!(matches!(
            StorageAccount::parse("AccountName=acct"),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_blob_sas_signature() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let expiry = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        let query = sas_query(
            &account(),
            "reports",
            SasResource::Blob("exports/a b.xlsx"),
            "r",
            start,
            expiry,
        )
        .unwrap();

        let get = |k: &str| query.iter().find(|(key, _)| *key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("sr"), Some("b"));
        assert_eq!(get("st"), Some("2024-01-01T00:00:00Z"));
        assert_eq!(get("se"), Some("2024-01-02T00:00:00Z"));
        assert_eq!(get("sig"), Some("/qviMKBwfJZK3Vxd+23iSr+gqsQ2MqiOJ+4Xd5qjnHc="));
    }

    #[test]
    fn test_signed_url_is_read_only_and_encoded() {
        let store = AzureBlobStore::new(&StorageConfig {
            connection_string:
                "AccountName=acct;AccountKey=dGVzdC1hY2NvdW50LWtleQ==".to_string(),
            container: "reports".to_string(),
        })
        .unwrap();

        let (url, expiry) = store
            .url(
                SasResource::Blob("exports/a b.xlsx"),
                "r",
                Duration::from_secs(3600),
                &[],
            )
            .unwrap();

        assert_eq!(url.path(), "/reports/exports/a%20b.xlsx");
        assert!(url.query_pairs().any(|(k, v)| k == "sp" && v == "r"));
        assert!(url.query_pairs().any(|(k, _)| k == "sig"));
        assert!(expiry > Utc::now());
    }

    #[test]
    fn test_parse_blob_list() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/" ContainerName="reports">
  <Blobs>
    <Blob><Name>10k-2023.pdf</Name><Properties><Content-Type>application/pdf</Content-Type></Properties></Blob>
    <Blob><Name>R&amp;D notes.pdf</Name><Properties /></Blob>
  </Blobs>
  <NextMarker>page-2</NextMarker>
</EnumerationResults>"#;

        let page = parse_blob_list(xml).unwrap();
        assert_eq!(page.names, vec!["10k-2023.pdf", "R&D notes.pdf"]);
        assert_eq!(page.next_marker.as_deref(), Some("page-2"));

        let last = parse_blob_list("<EnumerationResults><Blobs /><NextMarker /></EnumerationResults>")
            .unwrap();
        assert_eq!(last, BlobPage::default());
    }
}
