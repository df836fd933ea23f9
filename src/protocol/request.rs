//! Builds update, get-hash, and chunk-redirect requests.
//!
//! The builder owns the runtime-settable additional query string; everything
//! else comes from the immutable [`ProtocolConfig`].

use std::fmt::Write as _;
use std::sync::Arc;

use url::Url;

use super::chunk::{HashPrefix, ListCoverage};
use super::config::ProtocolConfig;
use super::constants::PREFIX_LEN;
use crate::transport::{FetchMethod, FetchRequest, LoadFlags};

/// Content type for update and get-hash bodies.
const BODY_CONTENT_TYPE: &str = "text/plain";

/// Formats one list's coverage as a request-body line.
///
/// ```
/// use listupdate_core::protocol::{ListCoverage, format_list};
///
/// let phish = ListCoverage::new("goog-phish-shavar", "1,4,6,8-20,99", "16,32,64-96");
/// assert_eq!(format_list(&phish), "goog-phish-shavar;a:1,4,6,8-20,99:s:16,32,64-96\n");
/// assert_eq!(format_list(&ListCoverage::empty("x")), "x;\n");
/// ```
#[must_use]
pub fn format_list(coverage: &ListCoverage) -> String {
    let mut line = format!("{};", coverage.list_name);
    if !coverage.adds.is_empty() {
        line.push_str("a:");
        line.push_str(&coverage.adds);
    }
    if !coverage.adds.is_empty() && !coverage.subs.is_empty() {
        line.push(':');
    }
    if !coverage.subs.is_empty() {
        line.push_str("s:");
        line.push_str(&coverage.subs);
    }
    line.push('\n');
    line
}

/// Formats the full update body, one line per list in delegate order.
#[must_use]
pub fn update_body(lists: &[ListCoverage]) -> String {
    lists.iter().map(format_list).collect()
}

/// Formats a get-hash body: `<prefix_len>:<total_len>\n` followed by the raw prefixes.
#[must_use]
pub fn gethash_body(prefixes: &[HashPrefix]) -> Vec<u8> {
    let mut body = format!("{PREFIX_LEN}:{}\n", PREFIX_LEN * prefixes.len()).into_bytes();
    for prefix in prefixes {
        body.extend_from_slice(prefix);
    }
    body
}

/// Request factory bound to one manager's configuration.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    config: Arc<ProtocolConfig>,
    additional_query: Option<String>,
}

impl RequestBuilder {
    /// Creates a builder with no additional query.
    #[must_use]
    pub fn new(config: Arc<ProtocolConfig>) -> Self {
        Self {
            config,
            additional_query: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    #[must_use]
    pub fn additional_query(&self) -> Option<&str> {
        self.additional_query.as_deref()
    }

    /// Sets (or clears, with `None` or an empty string) the additional query.
    pub fn set_additional_query(&mut self, query: Option<String>) {
        self.additional_query = query
            .map(|q| q.trim_start_matches(['?', '&']).to_string())
            .filter(|q| !q.is_empty());
    }

    /// `<prefix>/downloads?client=..&appver=..&pver=..[&key=..][&extra]`.
    ///
    /// # Errors
    ///
    /// Returns the URL parse error if the assembled URL is invalid.
    pub fn update_url(&self, prefix: &str) -> Result<Url, url::ParseError> {
        self.compose_url(prefix, "downloads")
    }

    /// `<primary prefix>/gethash?...` with the same parameters as updates.
    ///
    /// # Errors
    ///
    /// Returns the URL parse error if the assembled URL is invalid.
    pub fn gethash_url(&self) -> Result<Url, url::ParseError> {
        self.compose_url(self.config.url_prefix(), "gethash")
    }

    /// Normalizes a redirect target from a `u:` line into a fetchable URL.
    ///
    /// Schemeless targets get `https://`; the additional query is appended
    /// with `&` or `?` depending on whether the target already has a query.
    ///
    /// # Errors
    ///
    /// Returns the URL parse error if the normalized target is invalid.
    pub fn next_chunk_url(&self, target: &str) -> Result<Url, url::ParseError> {
        let mut url = if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            format!("https://{target}")
        };

        if let Some(extra) = &self.additional_query {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(extra);
        }
        Url::parse(&url)
    }

    /// POST request carrying the coverage body to `<prefix>/downloads`.
    ///
    /// # Errors
    ///
    /// Returns the URL parse error if the update URL is invalid.
    pub fn update_request(&self, prefix: &str, body: &str) -> Result<FetchRequest, url::ParseError> {
        Ok(FetchRequest {
            url: self.update_url(prefix)?,
            method: FetchMethod::Post,
            headers: vec![("Content-Type".to_string(), BODY_CONTENT_TYPE.to_string())],
            body: body.as_bytes().to_vec(),
            load_flags: LoadFlags::DISABLE_CACHE,
        })
    }

    /// GET request for one redirect target.
    #[must_use]
    pub fn chunk_request(url: Url) -> FetchRequest {
        FetchRequest {
            url,
            method: FetchMethod::Get,
            headers: Vec::new(),
            body: Vec::new(),
            load_flags: LoadFlags::DISABLE_CACHE,
        }
    }

    /// POST request asking for full hashes matching `prefixes`.
    ///
    /// # Errors
    ///
    /// Returns the URL parse error if the get-hash URL is invalid.
    pub fn gethash_request(&self, prefixes: &[HashPrefix]) -> Result<FetchRequest, url::ParseError> {
        Ok(FetchRequest {
            url: self.gethash_url()?,
            method: FetchMethod::Post,
            headers: vec![("Content-Type".to_string(), BODY_CONTENT_TYPE.to_string())],
            body: gethash_body(prefixes),
            load_flags: LoadFlags::DISABLE_CACHE,
        })
    }

    fn compose_url(&self, prefix: &str, endpoint: &str) -> Result<Url, url::ParseError> {
        let config = &self.config;
        let mut url = format!(
            "{prefix}/{endpoint}?client={}&appver={}&pver={}",
            urlencoding::encode(config.client_name()),
            urlencoding::encode(config.version()),
            urlencoding::encode(config.protocol_version()),
        );
        if let Some(key) = config.api_key() {
            let _ = write!(url, "&key={}", urlencoding::encode(key));
        }
        if let Some(extra) = &self.additional_query {
            url.push('&');
            url.push_str(extra);
        }
        Url::parse(&url)
    }
}
