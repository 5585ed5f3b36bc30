//! HTTP upstream provider.
//!
//! Talks to a v1.1-shaped REST + streaming API:
//!
//! * `GET  {api_base}/users/show.json` resolves a handle;
//! * `GET  {api_base}/users/search.json` searches accounts;
//! * `GET  {api_base}/statuses/user_timeline.json` pulls a timeline;
//! * `POST {stream_base}/statuses/filter.json` opens the live stream, a
//!   long-lived response of newline-delimited JSON.
//!
//! Payload parsing is kept in pure functions ([`parse_profile`],
//! [`parse_search`], [`parse_statuses`], [`parse_stream_line`]) so tests can
//! exercise it without the network.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{FetchMode, SourceProfile, SourceRef, SourceSummary, Subscription, Upstream};
use crate::config::UpstreamConfig;
use crate::error::{RelayError, Result};
use crate::item::{item_url, normalize_handle, Item, ItemId, SourceId, StreamEvent};

/// Items requested per page when paging backwards through a timeline.
const PAGE_SIZE: usize = 200;

/// Largest page `users/search` serves.
const SEARCH_MAX: usize = 20;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireUser {
    id: u64,
    screen_name: String,
    #[serde(default)]
    protected: bool,
    #[serde(default)]
    status: Option<WireStatusRef>,
}

#[derive(Debug, Deserialize)]
struct WireStatusRef {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct WireSearchUser {
    id: u64,
    screen_name: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    statuses_count: u64,
    #[serde(default)]
    followers_count: u64,
}

#[derive(Debug, Deserialize)]
struct WireStatus {
    id: u64,
    user: WireStatusUser,
}

#[derive(Debug, Deserialize)]
struct WireStatusUser {
    id: u64,
    screen_name: String,
}

impl WireStatus {
    fn into_item(self, url_base: &str) -> Item {
        let id = ItemId(self.id);
        let handle = normalize_handle(&self.user.screen_name);
        Item {
            id,
            source_id: SourceId(self.user.id),
            url: item_url(url_base, &handle, id),
        }
    }
}

// ---------------------------------------------------------------------------
// Pure parsing
// ---------------------------------------------------------------------------

/// Parse a `users/show` body.  Protected accounts are rejected here since
/// their timelines cannot be read.
pub fn parse_profile(body: &str) -> Result<SourceProfile> {
    let user: WireUser = serde_json::from_str(body)?;
    let handle = normalize_handle(&user.screen_name);

    if user.protected {
        return Err(RelayError::SourceProtected { handle });
    }

    Ok(SourceProfile {
        id: SourceId(user.id),
        handle,
        latest_item: user.status.map(|s| ItemId(s.id)),
    })
}

/// Parse a `users/search` body.  Empty descriptions become `None`.
pub fn parse_search(body: &str) -> Result<Vec<SourceSummary>> {
    let users: Vec<WireSearchUser> = serde_json::from_str(body)?;
    Ok(users
        .into_iter()
        .map(|u| SourceSummary {
            id: SourceId(u.id),
            handle: normalize_handle(&u.screen_name),
            name: u.name,
            description: u.description.filter(|d| !d.trim().is_empty()),
            items: u.statuses_count,
            followers: u.followers_count,
        })
        .collect())
}

/// Parse a timeline page (newest first, as returned).
pub fn parse_statuses(body: &str, url_base: &str) -> Result<Vec<Item>> {
    let statuses: Vec<WireStatus> = serde_json::from_str(body)?;
    Ok(statuses
        .into_iter()
        .map(|s| s.into_item(url_base))
        .collect())
}

/// Parse one line of the live stream.  Keep-alive blank lines and control
/// messages (deletes, limits, warnings) yield `None`.
pub fn parse_stream_line(line: &str, url_base: &str) -> Option<Item> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<WireStatus>(line) {
        Ok(status) => Some(status.into_item(url_base)),
        Err(e) => {
            debug!(error = %e, "ignoring non-item stream message");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Which REST call a response belongs to.  A 401/403 on a timeline means
/// the account is protected; on any other call it means our credentials
/// were refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Profile,
    Timeline,
}

/// [`Upstream`] backed by [`reqwest`].
pub struct HttpUpstream {
    client: Client,
    api_base: String,
    stream_base: String,
    bearer_token: String,
    item_url_base: String,
    request_timeout: Duration,
    stall_timeout: Duration,
    max_pages: usize,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        // No overall timeout on the client: the stream response never ends.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            stream_base: config.stream_base.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token.clone(),
            item_url_base: config.item_url_base.clone(),
            request_timeout: config.fetch_timeout(),
            stall_timeout: config.stall_timeout(),
            max_pages: config.max_pages.max(1),
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(format!("{}/{path}", self.api_base))
            .bearer_auth(&self.bearer_token)
            .timeout(self.request_timeout)
    }

    async fn get_statuses(&self, params: &[(&str, String)], label: &str) -> Result<Vec<Item>> {
        let resp = self
            .get("statuses/user_timeline.json")
            .query(params)
            .send()
            .await?;
        let body = check_status(resp, Endpoint::Timeline, label).await?.text().await?;
        parse_statuses(&body, &self.item_url_base)
    }
}

/// Map HTTP failures onto the error taxonomy.
async fn check_status(resp: Response, endpoint: Endpoint, handle: &str) -> Result<Response> {
    match resp.status() {
        s if s.is_success() => Ok(resp),
        StatusCode::NOT_FOUND => Err(RelayError::SourceNotFound {
            handle: handle.to_string(),
        }),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN if endpoint == Endpoint::Timeline => {
            Err(RelayError::SourceProtected {
                handle: handle.to_string(),
            })
        }
        status => {
            let body = resp.text().await.unwrap_or_default();
            Err(RelayError::upstream(format!("HTTP {status}: {body}")))
        }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn resolve_source(&self, handle: &str) -> Result<SourceProfile> {
        let handle = normalize_handle(handle);
        let resp = self
            .get("users/show.json")
            .query(&[("screen_name", handle.as_str())])
            .send()
            .await?;
        let body = check_status(resp, Endpoint::Profile, &handle).await?.text().await?;
        parse_profile(&body)
    }

    async fn search_sources(&self, query: &str, limit: usize) -> Result<Vec<SourceSummary>> {
        let count = limit.clamp(1, SEARCH_MAX);
        let resp = self
            .get("users/search.json")
            .query(&[("q", query.to_string()), ("count", count.to_string())])
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body = check_status(resp, Endpoint::Profile, query).await?.text().await?;

        let mut hits = parse_search(&body)?;
        hits.truncate(limit);
        Ok(hits)
    }

    async fn fetch_timeline(&self, source: &SourceRef, mode: FetchMode) -> Result<Vec<Item>> {
        let (key, value) = match source {
            SourceRef::Id(id) => ("user_id", id.to_string()),
            SourceRef::Handle(handle) => ("screen_name", normalize_handle(handle)),
        };
        let mut params = vec![
            ("exclude_replies", "true".to_string()),
            ("include_rts", "true".to_string()),
            (key, value.clone()),
        ];

        let since = match mode {
            FetchMode::Latest(limit) => {
                params.push(("count", limit.to_string()));
                return self.get_statuses(&params, &value).await;
            }
            FetchMode::Since(since) => since,
        };

        // Page backwards from the newest item until the cursor is reached.
        // History deeper than `max_pages` pages is not recoverable.
        params.push(("since_id", since.to_string()));
        params.push(("count", PAGE_SIZE.to_string()));

        let mut items = Vec::new();
        let mut max_id: Option<u64> = None;
        for page in 0..self.max_pages {
            let mut page_params = params.clone();
            if let Some(max_id) = max_id {
                page_params.push(("max_id", max_id.to_string()));
            }

            let batch = self.get_statuses(&page_params, &value).await?;
            let Some(oldest) = batch.last().map(|i| i.id.0) else {
                break;
            };
            items.extend(batch.into_iter().filter(|i| i.id > since));

            if oldest <= since.0 + 1 {
                break;
            }
            max_id = Some(oldest - 1);

            if page + 1 == self.max_pages {
                warn!(source = %value, since = %since, "timeline history depth reached, older items are unrecoverable");
            }
        }

        Ok(items)
    }

    async fn open_subscription(&self, sources: &[SourceId]) -> Result<Subscription> {
        let follow = sources
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let resp = self
            .client
            .post(format!("{}/statuses/filter.json", self.stream_base))
            .bearer_auth(&self.bearer_token)
            .form(&[("follow", follow)])
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(RelayError::upstream(format!("stream rejected: HTTP {status}")));
        }
        info!(sources = sources.len(), "stream connected");

        let url_base = self.item_url_base.clone();
        let stall_timeout = self.stall_timeout;
        let mut body = resp.bytes_stream();

        let stream = async_stream::stream! {
            yield StreamEvent::Connected;

            let mut buf: Vec<u8> = Vec::new();
            loop {
                // The provider sends keep-alives; total silence means a
                // half-open connection.
                let chunk = match tokio::time::timeout(stall_timeout, body.next()).await {
                    Ok(Some(Ok(chunk))) => chunk,
                    Ok(Some(Err(e))) => {
                        warn!(error = %e, "stream read failed");
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!(timeout = ?stall_timeout, "stream stalled");
                        break;
                    }
                };
                buf.extend_from_slice(&chunk);

                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    if let Some(item) = parse_stream_line(&String::from_utf8_lossy(&line), &url_base) {
                        yield StreamEvent::Item(item);
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const BASE: &str = "https://twitter.com";

    /// One canned answer of [`serve`].
    enum Reply {
        /// A complete JSON response, then the connection is closed.
        Json(u16, String),
        /// Raw bytes written after the request, then the connection is held
        /// open without further data.
        Hold(String),
    }

    /// Answer one connection per reply, in order, on a local port.  Returns
    /// the base URL and the request lines seen.
    async fn serve(replies: Vec<Reply>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        tokio::spawn(async move {
            for reply in replies {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                }
                let head = String::from_utf8_lossy(&head).to_string();
                seen.lock()
                    .unwrap()
                    .push(head.lines().next().unwrap_or_default().to_string());

                match reply {
                    Reply::Json(code, body) => {
                        let response = format!(
                            "HTTP/1.1 {code} Status\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                            body.len()
                        );
                        socket.write_all(response.as_bytes()).await.unwrap();
                        socket.shutdown().await.unwrap();
                    }
                    Reply::Hold(raw) => {
                        socket.write_all(raw.as_bytes()).await.unwrap();
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_secs(10)).await;
                            drop(socket);
                        });
                    }
                }
            }
        });

        (base, requests)
    }

    fn upstream(base: &str, max_pages: usize) -> HttpUpstream {
        HttpUpstream::new(&UpstreamConfig {
            api_base: base.to_string(),
            stream_base: base.to_string(),
            item_url_base: BASE.to_string(),
            max_pages,
            ..UpstreamConfig::default()
        })
        .unwrap()
    }

    fn statuses(ids: &[u64]) -> String {
        let entries: Vec<String> = ids
            .iter()
            .map(|id| format!(r#"{{"id": {id}, "user": {{"id": 42, "screen_name": "alice"}}}}"#))
            .collect();
        format!("[{}]", entries.join(","))
    }

    fn ids(items: &[Item]) -> Vec<u64> {
        items.iter().map(|i| i.id.0).collect()
    }

    #[test]
    fn parse_profile_extracts_latest_item() {
        let body = r#"{"id": 42, "screen_name": "Alice", "protected": false, "status": {"id": 1000}}"#;
        let profile = parse_profile(body).unwrap();

        assert_eq!(profile.id, SourceId(42));
        assert_eq!(profile.handle, "alice");
        assert_eq!(profile.latest_item, Some(ItemId(1000)));
    }

    #[test]
    fn parse_profile_without_status_has_no_latest_item() {
        let body = r#"{"id": 42, "screen_name": "alice"}"#;
        assert_eq!(parse_profile(body).unwrap().latest_item, None);
    }

    #[test]
    fn parse_profile_rejects_protected_accounts() {
        let body = r#"{"id": 42, "screen_name": "alice", "protected": true}"#;
        let err = parse_profile(body).unwrap_err();
        assert!(matches!(err, RelayError::SourceProtected { ref handle } if handle == "alice"));
    }

    #[test]
    fn parse_statuses_keeps_provider_order() {
        let body = r#"[
            {"id": 1002, "text": "newest", "user": {"id": 42, "screen_name": "Alice"}},
            {"id": 1001, "full_text": "long form", "user": {"id": 42, "screen_name": "Alice"}}
        ]"#;
        let items = parse_statuses(body, BASE).unwrap();

        assert_eq!(ids(&items), vec![1002, 1001]);
        assert_eq!(items[0].url, "https://twitter.com/alice/status/1002");
    }

    #[test]
    fn parse_search_reads_summaries() {
        let body = r#"[
            {"id": 42, "screen_name": "Alice", "name": "Alice A.", "description": "hi", "statuses_count": 10, "followers_count": 3},
            {"id": 43, "screen_name": "alice_b", "name": "B", "description": ""}
        ]"#;
        let hits = parse_search(body).unwrap();

        assert_eq!(hits[0].handle, "alice");
        assert_eq!(hits[0].name, "Alice A.");
        assert_eq!(hits[0].description.as_deref(), Some("hi"));
        assert_eq!((hits[0].items, hits[0].followers), (10, 3));
        assert_eq!(hits[1].description, None);
    }

    #[test]
    fn stream_line_skips_keepalives_and_control_messages() {
        assert!(parse_stream_line("\r\n", BASE).is_none());
        assert!(parse_stream_line(r#"{"delete": {"status": {"id": 5}}}"#, BASE).is_none());

        let item = parse_stream_line(
            r#"{"id": 1001, "text": "hi", "user": {"id": 42, "screen_name": "alice"}}"#,
            BASE,
        )
        .unwrap();
        assert_eq!(item.source_id, SourceId(42));
        assert_eq!(item.id, ItemId(1001));
    }

    #[test]
    fn new_trims_trailing_slashes() {
        let config = UpstreamConfig {
            api_base: "https://api.example.com/1.1/".to_string(),
            ..UpstreamConfig::default()
        };
        let upstream = HttpUpstream::new(&config).unwrap();
        assert_eq!(upstream.api_base, "https://api.example.com/1.1");
    }

    #[tokio::test]
    async fn refused_credentials_on_profile_are_transient() {
        let (base, _) = serve(vec![Reply::Json(
            401,
            r#"{"errors":[{"code":89,"message":"Invalid or expired token."}]}"#.to_string(),
        )])
        .await;

        let err = upstream(&base, 16).resolve_source("alice").await.unwrap_err();

        assert!(matches!(err, RelayError::UpstreamUnavailable(_)), "{err:?}");
        assert!(!err.is_user_facing());
    }

    #[tokio::test]
    async fn denied_timeline_means_protected() {
        let (base, _) = serve(vec![Reply::Json(401, "{}".to_string())]).await;

        let err = upstream(&base, 16)
            .fetch_timeline(&SourceRef::Handle("alice".to_string()), FetchMode::Latest(3))
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::SourceProtected { ref handle } if handle == "alice"));
    }

    #[tokio::test]
    async fn unknown_profile_is_not_found() {
        let (base, _) = serve(vec![Reply::Json(404, "{}".to_string())]).await;

        let err = upstream(&base, 16).resolve_source("@Nobody").await.unwrap_err();

        assert!(matches!(err, RelayError::SourceNotFound { ref handle } if handle == "nobody"));
    }

    #[tokio::test]
    async fn since_pages_back_with_max_id_until_cursor() {
        let (base, requests) = serve(vec![
            Reply::Json(200, statuses(&[1005, 1004])),
            Reply::Json(200, statuses(&[1003, 1002])),
            Reply::Json(200, statuses(&[1001])),
        ])
        .await;

        let items = upstream(&base, 16)
            .fetch_timeline(&SourceRef::Id(SourceId(42)), FetchMode::Since(ItemId(1000)))
            .await
            .unwrap();

        assert_eq!(ids(&items), vec![1005, 1004, 1003, 1002, 1001]);
        let requests = requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.contains("since_id=1000") && r.contains("user_id=42")));
        assert!(!requests[0].contains("max_id"));
        assert!(requests[1].contains("max_id=1003"));
        assert!(requests[2].contains("max_id=1001"));
    }

    #[tokio::test]
    async fn since_stops_on_empty_page() {
        let (base, requests) = serve(vec![
            Reply::Json(200, statuses(&[1010, 1009])),
            Reply::Json(200, "[]".to_string()),
        ])
        .await;

        let items = upstream(&base, 16)
            .fetch_timeline(&SourceRef::Id(SourceId(42)), FetchMode::Since(ItemId(1000)))
            .await
            .unwrap();

        assert_eq!(ids(&items), vec![1010, 1009]);
        assert_eq!(requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn since_stops_at_history_depth() {
        let (base, requests) = serve(vec![
            Reply::Json(200, statuses(&[1010, 1009])),
            Reply::Json(200, statuses(&[1008, 1007])),
        ])
        .await;

        let items = upstream(&base, 2)
            .fetch_timeline(&SourceRef::Id(SourceId(42)), FetchMode::Since(ItemId(1000)))
            .await
            .unwrap();

        assert_eq!(ids(&items), vec![1010, 1009, 1008, 1007]);
        assert_eq!(requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn search_sends_query_and_treats_not_found_as_empty() {
        let (base, requests) = serve(vec![
            Reply::Json(200, r#"[{"id": 42, "screen_name": "alice", "name": "Alice"}]"#.to_string()),
            Reply::Json(404, "{}".to_string()),
        ])
        .await;
        let upstream = upstream(&base, 16);

        let hits = upstream.search_sources("alice", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, SourceId(42));
        assert!(upstream.search_sources("zed", 5).await.unwrap().is_empty());

        let requests = requests.lock().unwrap().clone();
        assert!(requests[0].contains("users/search.json") && requests[0].contains("q=alice"));
        assert!(requests[0].contains("count=5"));
    }

    #[tokio::test]
    async fn silent_stream_ends_after_stall_timeout() {
        let line = format!("{}\n", r#"{"id": 1001, "user": {"id": 42, "screen_name": "alice"}}"#);
        let raw = format!(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\n{line}\r\n",
            line.len()
        );
        let (base, _) = serve(vec![Reply::Hold(raw)]).await;
        let mut upstream = upstream(&base, 16);
        upstream.stall_timeout = Duration::from_millis(200);

        let mut stream = upstream.open_subscription(&[SourceId(42)]).await.unwrap();
        let events = tokio::time::timeout(Duration::from_secs(5), async {
            let mut events = Vec::new();
            while let Some(event) = stream.next().await {
                events.push(event);
            }
            events
        })
        .await
        .expect("stalled stream should end");

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Connected);
        assert!(matches!(&events[1], StreamEvent::Item(item) if item.id == ItemId(1001)));
    }
}
