use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bookmate_core::DocumentSource;
use serde::Deserialize;
use tracing::{debug, info, instrument};
use url::Url;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_DOCUMENT_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct SourceResponse {
    #[serde(alias = "url")]
    pdf_url: String,
}

pub(crate) fn http_agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}

/// Asks the book service where the document to read lives.
#[derive(Clone)]
pub struct HttpSourceResolver {
    endpoint: Url,
    agent: ureq::Agent,
}

impl HttpSourceResolver {
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint =
            Url::parse(endpoint).with_context(|| format!("invalid API endpoint {:?}", endpoint))?;
        Ok(Self {
            endpoint,
            agent: http_agent(DEFAULT_HTTP_TIMEOUT),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn resolve(&self) -> Result<DocumentSource> {
        let agent = self.agent.clone();
        let endpoint = self.endpoint.clone();
        let body = tokio::task::spawn_blocking(move || -> Result<String> {
            let response = agent
                .get(endpoint.as_str())
                .call()
                .with_context(|| format!("request to {} failed", endpoint))?;
            response
                .into_string()
                .context("failed to read document source response")
        })
        .await
        .context("http worker panicked")??;

        let source = parse_source_response(&self.endpoint, &body)?;
        info!(%source, "resolved document source");
        Ok(source)
    }
}

fn parse_source_response(endpoint: &Url, body: &str) -> Result<DocumentSource> {
    let response: SourceResponse =
        serde_json::from_str(body).context("unexpected document source response")?;
    let raw = response.pdf_url.trim();
    if raw.is_empty() {
        return Err(anyhow!("document source response has an empty pdf_url"));
    }
    let url = endpoint
        .join(raw)
        .with_context(|| format!("invalid pdf_url {:?}", raw))?;
    if url.scheme() == "file" {
        let path = url
            .to_file_path()
            .map_err(|_| anyhow!("pdf_url {:?} is not a local path", raw))?;
        return Ok(DocumentSource::Path(path));
    }
    Ok(DocumentSource::Url(url.into()))
}

pub(crate) async fn download(agent: ureq::Agent, url: String) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let response = agent
            .get(&url)
            .call()
            .with_context(|| format!("failed to download {}", url))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_DOCUMENT_BYTES)
            .read_to_end(&mut bytes)
            .with_context(|| format!("failed to read body of {}", url))?;
        debug!(%url, len = bytes.len(), "document downloaded");
        Ok(bytes)
    })
    .await
    .context("http worker panicked")?
}
