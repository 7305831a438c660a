use super::file_store::FileStore;
use futures::StreamExt;
use http::header::{CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use miette::Diagnostic;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// How a request may interact with the on-disk cache.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheMode {
    /// Use the cache, revalidating stale entries against the server.
    Default,
    /// Only answer from the cache; error with [`HttpError::NotCached`]
    /// otherwise.
    OnlyIfCached,
    /// Bypass the cache entirely.
    NoStore,
}

/// Where a response came from, attached for logging and tests.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from cache after the server confirmed it unchanged.
    Revalidated,
    /// Served from cache without contacting the server.
    Cached,
    /// Fetched from the network and stored.
    Miss,
    /// Fetched from the network, not storable.
    Uncacheable,
}

/// A fully buffered response.
#[derive(Debug)]
pub struct HttpResponse {
    /// The response status.
    pub status: StatusCode,
    /// The `Content-Type` header, if any.
    pub content_type: Option<String>,
    /// The URL after redirects.
    pub final_url: Url,
    /// The response body.
    pub body: Vec<u8>,
    /// How the cache participated.
    pub cache_status: CacheStatus,
    /// The `(ETag, Last-Modified)` validators of a network response; absent
    /// for replies served from the cache.
    validators: Option<(Option<String>, Option<String>)>,
}

/// Error raised by the HTTP session.
#[derive(Debug, Error, Diagnostic)]
pub enum HttpError {
    /// A transport or protocol error.
    #[error(transparent)]
    Request(#[from] reqwest::Error),

    /// A cache I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// `OnlyIfCached` was requested but the entry is absent.
    #[error("request not in cache, and cache_mode=OnlyIfCached")]
    NotCached,
}

#[derive(Serialize, Deserialize)]
struct CachedEntry {
    final_url: Url,
    content_type: Option<String>,
    etag: Option<String>,
    last_modified: Option<String>,
    body: Vec<u8>,
}

/// An HTTP session with an on-disk response cache. Cached entries carry
/// their validators and are revalidated with conditional requests; a
/// response without validators is never stored.
#[derive(Debug, Clone)]
pub struct Http {
    client: Client,
    cache: Arc<FileStore>,
}

impl Http {
    /// Creates a session from a configured client and a response store.
    pub fn new(client: Client, cache: FileStore) -> Self {
        Http {
            client,
            cache: Arc::new(cache),
        }
    }

    /// The underlying client, for requests that manage their own caching.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Performs a GET honoring `cache_mode`.
    pub async fn get(
        &self,
        url: Url,
        accept: Option<&str>,
        cache_mode: CacheMode,
    ) -> Result<HttpResponse, HttpError> {
        tracing::debug!(url = %url, ?cache_mode, "executing request");
        let key = cache_key(&url, accept);

        if cache_mode == CacheMode::NoStore {
            let response = self.fetch(&url, accept, None, None).await?;
            return Ok(into_response(response, CacheStatus::Uncacheable).await?);
        }

        let cached = self.read_cache(&key);
        if cache_mode == CacheMode::OnlyIfCached {
            let entry = cached.ok_or(HttpError::NotCached)?;
            return Ok(cached_response(entry, CacheStatus::Cached));
        }

        if let Some(entry) = cached {
            if entry.etag.is_some() || entry.last_modified.is_some() {
                let result = self
                    .fetch(
                        &url,
                        accept,
                        entry.etag.as_deref(),
                        entry.last_modified.as_deref(),
                    )
                    .await;
                return match result {
                    Ok(response) if response.status() == StatusCode::NOT_MODIFIED => {
                        tracing::debug!(url = %url, "cache entry is still fresh");
                        Ok(cached_response(entry, CacheStatus::Revalidated))
                    }
                    Ok(response) => {
                        let response = into_response(response, CacheStatus::Miss).await?;
                        self.store(&key, &response)?;
                        Ok(response)
                    }
                    Err(err) => {
                        // a flaky network falls back to the stale copy
                        tracing::warn!(url = %url, "request failed ({err}), using cached copy");
                        Ok(cached_response(entry, CacheStatus::Cached))
                    }
                };
            }
        }
        let response = self.fetch(&url, accept, None, None).await?;
        let response = into_response(response, CacheStatus::Miss).await?;
        self.store(&key, &response)?;
        Ok(response)
    }

    /// Streams the body of `url` into `writer`, without caching. Used for
    /// artifacts, which are cached under their own content-addressed keys.
    pub async fn download(&self, url: Url, writer: &mut (dyn Write + Send)) -> Result<(), HttpError> {
        tracing::info!(url = %url, "downloading artifact");
        let response = self.client.get(url).send().await?.error_for_status()?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            writer.write_all(chunk?.as_ref())?;
        }
        Ok(())
    }

    async fn fetch(
        &self,
        url: &Url,
        accept: Option<&str>,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self.client.get(url.clone());
        if let Some(accept) = accept {
            request = request.header(http::header::ACCEPT.as_str(), accept);
        }
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH.as_str(), etag);
        }
        if let Some(last_modified) = last_modified {
            request = request.header(IF_MODIFIED_SINCE.as_str(), last_modified);
        }
        let response = request.send().await?;
        if response.status() != StatusCode::NOT_MODIFIED && response.status() != StatusCode::NOT_FOUND {
            response.error_for_status_ref()?;
        }
        Ok(response)
    }

    fn read_cache(&self, key: &[u8]) -> Option<CachedEntry> {
        let mut reader = self.cache.get(&key)?;
        let mut bytes = Vec::new();
        // a truncated or unreadable entry is just a miss
        reader.read_to_end(&mut bytes).ok()?;
        ciborium::de::from_reader(bytes.as_slice()).ok()
    }

    fn store(&self, key: &[u8], response: &HttpResponse) -> Result<(), HttpError> {
        if response.status != StatusCode::OK {
            return Ok(());
        }
        let Some((etag, last_modified)) = response.validators.clone() else {
            return Ok(());
        };
        if etag.is_none() && last_modified.is_none() {
            return Ok(());
        }
        let entry = CachedEntry {
            final_url: response.final_url.clone(),
            content_type: response.content_type.clone(),
            etag,
            last_modified,
            body: response.body.clone(),
        };
        let lock = self.cache.lock(&key)?;
        let mut writer = lock.begin()?;
        ciborium::ser::into_writer(&entry, &mut writer)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writer.commit()?;
        Ok(())
    }
}

fn cache_key(url: &Url, accept: Option<&str>) -> Vec<u8> {
    let mut url = url.clone();
    url.set_fragment(None);
    let mut key = url.as_str().as_bytes().to_vec();
    if let Some(accept) = accept {
        key.push(0);
        key.extend_from_slice(accept.as_bytes());
    }
    key
}

fn cached_response(entry: CachedEntry, cache_status: CacheStatus) -> HttpResponse {
    HttpResponse {
        status: StatusCode::OK,
        content_type: entry.content_type,
        final_url: entry.final_url,
        body: entry.body,
        cache_status,
        validators: None,
    }
}

async fn into_response(
    response: reqwest::Response,
    cache_status: CacheStatus,
) -> Result<HttpResponse, reqwest::Error> {
    let status = response.status();
    let final_url = response.url().clone();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let etag = response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let last_modified = response
        .headers()
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.bytes().await?.to_vec();
    Ok(HttpResponse {
        status,
        content_type,
        final_url,
        body,
        cache_status,
        validators: Some((etag, last_modified)),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cache_key_ignores_fragment() {
        let a = cache_key(&"https://x.org/p/#frag".parse().unwrap(), None);
        let b = cache_key(&"https://x.org/p/".parse().unwrap(), None);
        assert_eq!(a, b);
        let c = cache_key(&"https://x.org/p/".parse().unwrap(), Some("application/json"));
        assert_ne!(a, c);
    }
}
