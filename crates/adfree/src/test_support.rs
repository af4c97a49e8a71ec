use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::EngineError;
use crate::fetch::{FetchRequest, FetchResponse, Fetcher};

/// Routes test log output through the capture machinery. Safe to call from
/// every test; only the first call installs the subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

enum MockReply {
    Response { status: u16, body: String },
    Transport,
}

struct Route {
    url_prefix: String,
    body_contains: Option<String>,
    url_contains: Option<String>,
    reply: MockReply,
}

impl Route {
    fn matches(&self, request: &FetchRequest) -> bool {
        if !request.url.starts_with(&self.url_prefix) {
            return false;
        }
        if let Some(needle) = &self.url_contains
            && !request.url.contains(needle.as_str())
        {
            return false;
        }
        if let Some(needle) = &self.body_contains {
            match &request.body {
                Some(body) if body.contains(needle.as_str()) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Scripted [`Fetcher`] for tests. Requests are matched against registered
/// routes in registration order; anything unmatched answers 404. Every
/// request is recorded for later inspection.
pub struct MockFetcher {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn route(&self, url_prefix: &str, status: u16, body: &str) {
        self.route_when(url_prefix, None, None, status, body);
    }

    pub fn route_when(
        &self,
        url_prefix: &str,
        body_contains: Option<&str>,
        url_contains: Option<&str>,
        status: u16,
        body: &str,
    ) {
        self.routes.lock().push(Route {
            url_prefix: url_prefix.to_string(),
            body_contains: body_contains.map(str::to_string),
            url_contains: url_contains.map(str::to_string),
            reply: MockReply::Response {
                status,
                body: body.to_string(),
            },
        });
    }

    pub fn route_transport_error(&self, url_prefix: &str) {
        self.routes.lock().push(Route {
            url_prefix: url_prefix.to_string(),
            body_contains: None,
            url_contains: None,
            reply: MockReply::Transport,
        });
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    /// Counts recorded requests whose URL or body contains the needle.
    pub fn request_count(&self, needle: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| {
                r.url.contains(needle)
                    || r.body.as_deref().is_some_and(|b| b.contains(needle))
            })
            .count()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, EngineError> {
        self.requests.lock().push(request.clone());
        let routes = self.routes.lock();
        for route in routes.iter() {
            if route.matches(&request) {
                return match &route.reply {
                    MockReply::Response { status, body } => Ok(FetchResponse {
                        status: *status,
                        body: body.clone(),
                    }),
                    MockReply::Transport => Err(EngineError::Transport {
                        reason: format!("connection refused: {}", request.url),
                    }),
                };
            }
        }
        Ok(FetchResponse {
            status: 404,
            body: String::new(),
        })
    }
}
