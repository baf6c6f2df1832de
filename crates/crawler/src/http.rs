// farcrawl is a polite, high-throughput web crawler.
// Copyright (C) 2024 The farcrawl Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! The HTTP fetch collaborator (spec §4.6/§4.7): issues the request,
//! enforces the fetch deadline, and decodes the body via the
//! Content-Type-header -> HTML-meta -> UTF-8 fallback chain.

use std::time::Duration;

use url::Url;

pub const MAX_CONTENT_LENGTH: usize = 32 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("response exceeded max content length of {MAX_CONTENT_LENGTH} bytes")]
    TooLarge,
    #[error("fetch deadline exceeded")]
    Timeout,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    /// Raw, undecoded bytes. Charset decoding happens once, in the parser
    /// (spec §4.7 step 2), so it can be skipped entirely for non-HTML
    /// responses instead of paying for it on every fetch.
    pub body: Vec<u8>,
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self { client })
    }

    pub async fn fetch(&self, url: &Url, deadline: Duration) -> Result<FetchedPage, FetchError> {
        let response = tokio::time::timeout(deadline, self.client.get(url.clone()).send())
            .await
            .map_err(|_| FetchError::Timeout)??;

        if let Some(len) = response.content_length() {
            if len as usize > MAX_CONTENT_LENGTH {
                return Err(FetchError::TooLarge);
            }
        }

        let final_url = response.url().clone();
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = tokio::time::timeout(deadline, response.bytes())
            .await
            .map_err(|_| FetchError::Timeout)??;
        if bytes.len() > MAX_CONTENT_LENGTH {
            return Err(FetchError::TooLarge);
        }

        Ok(FetchedPage {
            final_url,
            status,
            content_type,
            body: bytes.to_vec(),
        })
    }
}

/// Charset-detection fallback chain (spec §4.7): Content-Type header -> HTML
/// `<meta charset>` sniff -> UTF-8.
pub fn decode_body(bytes: &[u8], content_type: Option<&str>) -> String {
    if let Some(encoding) = content_type.and_then(charset_from_content_type) {
        let (text, _, _) = encoding.decode(bytes);
        return text.into_owned();
    }

    if let Some(encoding) = charset_from_html_meta(bytes) {
        let (text, _, _) = encoding.decode(bytes);
        return text.into_owned();
    }

    String::from_utf8_lossy(bytes).into_owned()
}

fn charset_from_content_type(content_type: &str) -> Option<&'static encoding_rs::Encoding> {
    let mime: mime::Mime = content_type.parse().ok()?;
    let charset = mime.get_param(mime::CHARSET)?;
    encoding_rs::Encoding::for_label(charset.as_str().as_bytes())
}

fn charset_from_html_meta(bytes: &[u8]) -> Option<&'static encoding_rs::Encoding> {
    // Charset declarations always live in the first few KB of a well-formed
    // document; scanning the whole body for a regex on every fetch would be
    // wasteful.
    let head = &bytes[..bytes.len().min(4096)];
    let head_str = String::from_utf8_lossy(head);
    let lower = head_str.to_lowercase();

    if let Some(pos) = lower.find("charset=") {
        let rest = &head_str[pos + "charset=".len()..];
        let value: String = rest
            .chars()
            .take_while(|c| !matches!(c, '"' | '\'' | ' ' | '>' | ';'))
            .collect();
        return encoding_rs::Encoding::for_label(value.trim().as_bytes());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_header_charset_wins_over_meta() {
        let body = br#"<html><head><meta charset="iso-8859-1"></head></html>"#;
        let decoded = decode_body(body, Some("text/html; charset=utf-8"));
        assert!(decoded.contains("meta charset"));
    }

    #[test]
    fn falls_back_to_html_meta_charset() {
        let body = "<html><head><meta charset=\"utf-8\"></head><body>caf\u{e9}</body></html>".as_bytes();
        let decoded = decode_body(body, None);
        assert!(decoded.contains('\u{e9}'));
    }

    #[test]
    fn falls_back_to_utf8_with_no_hints() {
        let decoded = decode_body("hello world".as_bytes(), None);
        assert_eq!(decoded, "hello world");
    }
}
