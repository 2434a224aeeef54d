//! Page listing over HTTP for WebKit endpoints
//!
//! A WebKit endpoint lists its inspectable pages at `GET /json`. Each entry's
//! `webSocketDebuggerUrl` ends in the page id used to attach.

use std::time::Duration;

use serde::Deserialize;

use rdbg_core::prelude::*;
use rdbg_core::Page;

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Fetches the pages an endpoint exposes.
#[trait_variant::make(PageListFetcher: Send)]
pub trait LocalPageListFetcher {
    async fn fetch_pages(&self, host: &str, port: u16) -> Result<Vec<Page>>;
}

/// One element of the `/json` array.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageEntry {
    #[serde(default)]
    pub web_socket_debugger_url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

impl From<PageEntry> for Page {
    fn from(entry: PageEntry) -> Self {
        let id = entry
            .web_socket_debugger_url
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let is_key = !id.is_empty();
        Page::new(id, entry.title, entry.url).with_key(is_key)
    }
}

/// [`PageListFetcher`] using `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpPageListFetcher {
    client: reqwest::Client,
}

impl HttpPageListFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| Error::http(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl PageListFetcher for HttpPageListFetcher {
    async fn fetch_pages(&self, host: &str, port: u16) -> Result<Vec<Page>> {
        let url = format!("http://{host}:{port}/json");
        debug!("Sending request to: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::http(format!("{url}: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::http(format!(
                "{url}: unexpected status {}",
                response.status()
            )));
        }

        let entries: Vec<PageEntry> = response
            .json()
            .await
            .map_err(|e| Error::http(format!("{url}: invalid page list: {e}")))?;
        debug!("Page list has {} entries", entries.len());

        Ok(entries.into_iter().map(Page::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::{HttpPageListFetcher, PageEntry, PageListFetcher};
    use rdbg_core::{Error, Page};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one HTTP response on a loopback port.
    async fn serve_once(status: &str, body: &str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        });
        port
    }

    #[test]
    fn test_entry_id_is_last_url_segment() {
        let entry = PageEntry {
            web_socket_debugger_url: "ws://localhost:27753/devtools/page/3".to_string(),
            title: "Home".to_string(),
            url: "http://example.com/".to_string(),
        };
        let page = Page::from(entry);
        assert_eq!(page.id, "3");
        assert_eq!(page.title, "Home");
        assert!(page.is_key);
    }

    #[test]
    fn test_entry_without_socket_url_is_not_key() {
        let page = Page::from(PageEntry::default());
        assert_eq!(page.id, "");
        assert!(!page.is_key);
    }

    #[tokio::test]
    async fn test_fetch_pages_over_http() {
        let body = r#"[
            {"webSocketDebuggerUrl": "ws://127.0.0.1/devtools/page/1", "title": "One", "url": "http://one/"},
            {"webSocketDebuggerUrl": "ws://127.0.0.1/devtools/page/2", "title": "Two", "url": "http://two/"}
        ]"#;
        let port = serve_once("200 OK", body).await;

        let pages = HttpPageListFetcher::new()
            .unwrap()
            .fetch_pages("127.0.0.1", port)
            .await
            .unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].id, "1");
        assert_eq!(pages[1].url, "http://two/");
    }

    #[tokio::test]
    async fn test_fetch_pages_error_status() {
        let port = serve_once("500 Internal Server Error", "{}").await;
        let err = HttpPageListFetcher::new()
            .unwrap()
            .fetch_pages("127.0.0.1", port)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http { .. }));
    }

    #[tokio::test]
    async fn test_fetch_pages_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = HttpPageListFetcher::new()
            .unwrap()
            .fetch_pages("127.0.0.1", port)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http { .. }));
    }
}
