//! Azure Blob Storage backend.
//!
//! Talks to the Blob REST API with `reqwest`, authenticating every call
//! with a bearer token from the process's managed identity (see
//! [`crate::credential`]).  No shared key, SAS or connection string path
//! exists.
//!
//! Upload strategy:
//!   payload <= block size -> Put Blob (single request, `Content-MD5`)
//!   payload >  block size -> Put Block per chunk, then Put Block List
//!
//! Block blobs are always written with overwrite semantics: committing a
//! new blob under an existing name replaces it.
//!
//! Block IDs: `base64("{nonce}-{index:06}")` with a fresh 16-hex-digit
//! nonce per upload.  Staged blocks belong to the blob, not the upload, so
//! two uploads racing on one name must never share IDs.  Every ID of a
//! blob has the same length, as the service requires.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use md5::{Digest, Md5};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Method, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

use super::backend::StorageBackend;
use crate::credential::ManagedIdentityCredential;

/// Azure REST API version used for all requests.
const AZURE_API_VERSION: &str = "2023-11-03";

/// Default size of staged blocks for large uploads.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Encode everything except unreserved characters and '/' in blob paths.
const AZURE_BLOB_ENCODE_SET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Backend that writes into a single Azure Blob container.
pub struct AzureBlobBackend {
    /// HTTP client for Blob REST API calls.
    client: reqwest::Client,
    /// Target container name.
    container: String,
    /// Blob service endpoint, no trailing slash.
    base_url: String,
    /// Managed identity token source.
    credential: Arc<ManagedIdentityCredential>,
    /// Chunk size for staged uploads.
    block_size: usize,
}

impl AzureBlobBackend {
    /// Create a backend for `container` at the blob endpoint `base_url`.
    pub fn new(
        base_url: String,
        container: String,
        credential: Arc<ManagedIdentityCredential>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        let base_url = base_url.trim_end_matches('/').to_string();
        info!(
            "Azure blob backend initialized: endpoint={} container={}",
            base_url, container
        );

        Ok(Self {
            client,
            container,
            base_url,
            credential,
            block_size: DEFAULT_BLOCK_SIZE,
        })
    }

    /// Override the staged block size.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// URL of the container resource.
    fn container_url(&self) -> String {
        format!("{}/{}", self.base_url, self.container)
    }

    /// Full URL of a blob.
    fn blob_url(&self, blob_name: &str) -> String {
        let encoded_blob =
            percent_encoding::utf8_percent_encode(blob_name, &AZURE_BLOB_ENCODE_SET).to_string();
        format!("{}/{}/{}", self.base_url, self.container, encoded_blob)
    }

    /// Random prefix shared by the block IDs of one upload.
    fn block_nonce() -> String {
        format!("{:016x}", rand::random::<u64>())
    }

    /// Generate the block ID for the `index`th staged block of an upload.
    fn block_id(nonce: &str, index: usize) -> String {
        BASE64_STANDARD.encode(format!("{}-{:06}", nonce, index).as_bytes())
    }

    /// Base64 MD5 digest, the form `Content-MD5` expects.
    fn content_md5(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        BASE64_STANDARD.encode(hasher.finalize())
    }

    /// Get the current UTC date in RFC 1123 format for Azure headers.
    fn rfc1123_date() -> String {
        httpdate::fmt_http_date(std::time::SystemTime::now())
    }

    /// Start a request with the version, date and bearer headers set.
    async fn request(&self, method: Method, url: &str) -> anyhow::Result<reqwest::RequestBuilder> {
        let token = self.credential.get_token().await?;
        Ok(self
            .client
            .request(method, url)
            .header("x-ms-date", Self::rfc1123_date())
            .header("x-ms-version", AZURE_API_VERSION)
            .bearer_auth(token.token))
    }

    /// Map an Azure HTTP error to an anyhow error with context.
    fn map_azure_error(context: &str, status: StatusCode, body: &str) -> anyhow::Error {
        match parse_error_code(body) {
            Some(code) => anyhow::anyhow!("Azure {}: HTTP {} - {}", context, status, code),
            None => anyhow::anyhow!("Azure {}: HTTP {} - {}", context, status, body),
        }
    }

    /// Read the error code from the `x-ms-error-code` header, falling back
    /// to the XML body.
    async fn error_code(resp: reqwest::Response) -> (Option<String>, String) {
        let header_code = resp
            .headers()
            .get("x-ms-error-code")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await.unwrap_or_default();
        (header_code.or_else(|| parse_error_code(&body)), body)
    }

    // -- Azure Blob REST API operations ----------------------------------------

    /// Create Container.  `ContainerAlreadyExists` counts as success.
    async fn azure_create_container(&self) -> anyhow::Result<bool> {
        let resp = self
            .request(Method::PUT, &self.container_url())
            .await?
            .query(&[("restype", "container")])
            .body(Vec::new())
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure create container request failed: {}", e))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(true);
        }

        let (code, body) = Self::error_code(resp).await;
        if status == StatusCode::CONFLICT && code.as_deref() == Some("ContainerAlreadyExists") {
            return Ok(false);
        }
        Err(match code {
            Some(code) => anyhow::anyhow!("Azure create container: HTTP {} - {}", status, code),
            None => Self::map_azure_error("create container", status, &body),
        })
    }

    /// Upload a blob (Put Blob) in one request.
    async fn azure_put_blob(
        &self,
        blob_name: &str,
        data: Bytes,
        content_type: &str,
    ) -> anyhow::Result<()> {
        let url = self.blob_url(blob_name);
        let resp = self
            .request(Method::PUT, &url)
            .await?
            .header("x-ms-blob-type", "BlockBlob")
            .header("Content-Type", content_type)
            .header("Content-MD5", Self::content_md5(&data))
            .body(data)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure upload request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_azure_error("upload", status, &body));
        }
        Ok(())
    }

    /// Stage one block (Put Block).
    async fn azure_put_block(
        &self,
        blob_name: &str,
        block_id: &str,
        data: Bytes,
    ) -> anyhow::Result<()> {
        let url = self.blob_url(blob_name);
        let resp = self
            .request(Method::PUT, &url)
            .await?
            .query(&[("comp", "block"), ("blockid", block_id)])
            .header("Content-MD5", Self::content_md5(&data))
            .body(data)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure put block request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_azure_error("put block", status, &body));
        }
        Ok(())
    }

    /// Commit staged blocks in order (Put Block List).
    async fn azure_put_block_list(
        &self,
        blob_name: &str,
        block_ids: &[String],
        content_type: &str,
    ) -> anyhow::Result<()> {
        let url = self.blob_url(blob_name);
        let resp = self
            .request(Method::PUT, &url)
            .await?
            .query(&[("comp", "blocklist")])
            .header("x-ms-blob-content-type", content_type)
            .header("Content-Type", "application/xml")
            .body(render_block_list(block_ids))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure put block list request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_azure_error("put block list", status, &body));
        }
        Ok(())
    }

    /// Stage `data` in `block_size` chunks and commit them.
    async fn azure_upload_blocks(
        &self,
        blob_name: &str,
        data: Bytes,
        content_type: &str,
    ) -> anyhow::Result<()> {
        let nonce = Self::block_nonce();
        let mut block_ids = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + self.block_size).min(data.len());
            let block_id = Self::block_id(&nonce, block_ids.len());
            self.azure_put_block(blob_name, &block_id, data.slice(offset..end))
                .await?;
            block_ids.push(block_id);
            offset = end;
        }
        debug!("Staged {} blocks for {}", block_ids.len(), blob_name);
        self.azure_put_block_list(blob_name, &block_ids, content_type)
            .await
    }

    /// List Blobs with pagination.  A missing container lists as empty.
    async fn azure_list_blobs(&self) -> anyhow::Result<Vec<String>> {
        let mut all_names: Vec<String> = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut query = vec![
                ("restype", "container".to_string()),
                ("comp", "list".to_string()),
            ];
            if let Some(ref m) = marker {
                query.push(("marker", m.clone()));
            }

            let resp = self
                .request(Method::GET, &self.container_url())
                .await?
                .query(&query)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("Azure list_blobs request failed: {}", e))?;

            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_azure_error("list_blobs", status, &body));
            }

            let body = resp.text().await.unwrap_or_default();
            let (names, next_marker) = parse_list_blobs(&body)?;
            all_names.extend(names);

            match next_marker {
                Some(m) => marker = Some(m),
                None => break,
            }
        }

        Ok(all_names)
    }
}

impl StorageBackend for AzureBlobBackend {
    fn authenticate(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.credential.get_token().await?;
            Ok(())
        })
    }

    fn ensure_container(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.azure_create_container().await? {
                info!("Created container {}", self.container);
            } else {
                debug!("Container {} already exists", self.container);
            }
            Ok(())
        })
    }

    fn upload(
        &self,
        blob_name: &str,
        data: Bytes,
        content_type: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let blob_name = blob_name.to_string();
        let content_type = content_type.to_string();
        Box::pin(async move {
            if data.len() <= self.block_size {
                self.azure_put_blob(&blob_name, data, &content_type).await?;
            } else {
                self.azure_upload_blocks(&blob_name, data, &content_type)
                    .await?;
            }
            Ok(self.blob_url(&blob_name))
        })
    }

    fn list_blobs(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>> {
        Box::pin(async move { self.azure_list_blobs().await })
    }
}

// -- XML helpers ---------------------------------------------------------------

/// Render the Put Block List request body.
fn render_block_list(block_ids: &[String]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<BlockList>\n");
    for id in block_ids {
        xml.push_str(&format!("  <Latest>{}</Latest>\n", id));
    }
    xml.push_str("</BlockList>");
    xml
}

/// Extract blob names and the continuation marker from a List Blobs
/// response.
fn parse_list_blobs(body: &str) -> anyhow::Result<(Vec<String>, Option<String>)> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut names = Vec::new();
    let mut next_marker = None;
    let mut in_blob = false;
    let mut current_tag = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                current_tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if current_tag == "Blob" {
                    in_blob = true;
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"Blob" {
                    in_blob = false;
                }
                current_tag.clear();
            }
            Ok(Event::Text(ref t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| anyhow::anyhow!("Malformed List Blobs XML: {}", e))?
                    .to_string();
                match current_tag.as_str() {
                    "Name" if in_blob => names.push(text),
                    "NextMarker" if !text.is_empty() => next_marker = Some(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(anyhow::anyhow!("Malformed List Blobs XML: {}", e)),
            _ => {}
        }
    }

    Ok((names, next_marker))
}

/// Pull `<Code>` out of an Azure `<Error>` body.
fn parse_error_code(body: &str) -> Option<String> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);
    let mut in_code = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => in_code = e.name().as_ref() == b"Code",
            Ok(Event::End(_)) => in_code = false,
            Ok(Event::Text(ref t)) if in_code => {
                return t.unescape().ok().map(|c| c.to_string());
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

// -- Tests -------------------------------------------------------------------
