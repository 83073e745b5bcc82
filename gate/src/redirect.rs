//! Manual redirect chain resolution.
//!
//! Used when the web container gives up on a chain with too many redirects:
//! the chain is walked here with HEAD requests and the container reloads the
//! final URL directly.

use crate::config::RedirectLimits;
use crate::errors::GateError;
use crate::metrics_defs::{REDIRECT_HOPS, REDIRECT_RESOLUTIONS};
use http::StatusCode;
use http::header::LOCATION;
use shared::{counter, histogram};
use std::time::Duration;
use url::Url;

/// Why the walk stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The last URL answered without redirecting.
    NonRedirect(StatusCode),
    /// A redirect status without a usable `Location` header.
    MissingLocation,
    HopLimit,
    /// The request for the last URL failed or timed out.
    Transport(String),
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::NonRedirect(_) => "non_redirect",
            Termination::MissingLocation => "missing_location",
            Termination::HopLimit => "hop_limit",
            Termination::Transport(_) => "transport",
        }
    }
}

#[derive(Clone, Debug)]
pub struct RedirectChain {
    visited: Vec<Url>,
    final_url: Url,
    termination: Termination,
}

impl RedirectChain {
    /// Every URL requested or reached, starting with the initial one.
    pub fn visited(&self) -> &[Url] {
        &self.visited
    }

    pub fn hops(&self) -> usize {
        self.visited.len().saturating_sub(1)
    }

    pub fn final_url(&self) -> &Url {
        &self.final_url
    }

    pub fn termination(&self) -> &Termination {
        &self.termination
    }

    pub fn into_final_url(self) -> Url {
        self.final_url
    }
}

enum Hop {
    Redirect(Url),
    Stop(Termination),
}

#[derive(Clone)]
pub struct RedirectResolver {
    client: reqwest::Client,
    max_hops: usize,
    hop_timeout: Duration,
}

impl RedirectResolver {
    pub fn new(limits: &RedirectLimits) -> Result<Self, GateError> {
        Self::with_limits(limits.max_hops, limits.hop_timeout())
    }

    pub fn with_limits(max_hops: usize, hop_timeout: Duration) -> Result<Self, GateError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(RedirectResolver {
            client,
            max_hops,
            hop_timeout,
        })
    }

    /// The URL the chain starting at `start` settles on. Never fails: on any
    /// error the last URL reached is returned.
    pub async fn resolve(&self, start: Url) -> Url {
        self.resolve_chain(start).await.into_final_url()
    }

    pub async fn resolve_chain(&self, start: Url) -> RedirectChain {
        let mut visited = vec![start.clone()];
        let mut current = start;
        let mut termination = Termination::HopLimit;

        for _ in 0..self.max_hops {
            match self.next_hop(&current).await {
                Ok(Hop::Redirect(next)) => {
                    tracing::trace!(from = %current, to = %next, "Following redirect");
                    visited.push(next.clone());
                    current = next;
                }
                Ok(Hop::Stop(reason)) => {
                    termination = reason;
                    break;
                }
                Err(e) => {
                    tracing::warn!(url = %current, error = %e, "Redirect hop failed");
                    termination = Termination::Transport(e.to_string());
                    break;
                }
            }
        }

        let chain = RedirectChain {
            visited,
            final_url: current,
            termination,
        };

        histogram!(REDIRECT_HOPS).record(chain.hops() as f64);
        counter!(REDIRECT_RESOLUTIONS, "termination" => chain.termination.as_str()).increment(1);
        tracing::info!(
            hops = chain.hops(),
            termination = chain.termination.as_str(),
            final_url = %chain.final_url,
            "Resolved redirect chain"
        );

        chain
    }

    async fn next_hop(&self, url: &Url) -> Result<Hop, reqwest::Error> {
        let response = self
            .client
            .head(url.clone())
            .timeout(self.hop_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_redirection() {
            return Ok(Hop::Stop(Termination::NonRedirect(status)));
        }

        let next = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|location| url.join(location).ok());

        Ok(match next {
            Some(next) => Hop::Redirect(next),
            None => Hop::Stop(Termination::MissingLocation),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{CLOSED_PORT_URL, redirect_response, start_mock_server, status_response};
    use hyper::Method;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// `/hop/N` redirects to `/hop/N+1` until `last`, which answers 200.
    async fn chain_server(last: usize, requests: Arc<AtomicUsize>) -> u16 {
        start_mock_server(move |req| {
            let requests = requests.clone();
            async move {
                requests.fetch_add(1, Ordering::SeqCst);
                assert_eq!(req.method(), Method::HEAD);

                let n: usize = req
                    .uri()
                    .path()
                    .trim_start_matches("/hop/")
                    .parse()
                    .unwrap_or(0);
                if n >= last {
                    status_response(StatusCode::OK)
                } else {
                    redirect_response(&format!("/hop/{}", n + 1))
                }
            }
        })
        .await
    }

    fn resolver(max_hops: usize) -> RedirectResolver {
        RedirectResolver::with_limits(max_hops, Duration::from_secs(8)).unwrap()
    }

    #[tokio::test]
    async fn test_follows_chain_to_final_url() {
        let requests = Arc::new(AtomicUsize::new(0));
        let port = chain_server(5, requests.clone()).await;
        let start = Url::parse(&format!("http://127.0.0.1:{port}/hop/0")).unwrap();

        let chain = resolver(80).resolve_chain(start).await;

        assert_eq!(chain.hops(), 5);
        assert_eq!(chain.final_url().path(), "/hop/5");
        assert_eq!(chain.termination(), &Termination::NonRedirect(StatusCode::OK));
        assert_eq!(requests.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_stops_at_hop_limit() {
        let requests = Arc::new(AtomicUsize::new(0));
        let port = chain_server(usize::MAX, requests.clone()).await;
        let start = Url::parse(&format!("http://127.0.0.1:{port}/hop/0")).unwrap();

        let chain = resolver(10).resolve_chain(start).await;

        assert_eq!(chain.termination(), &Termination::HopLimit);
        assert_eq!(chain.final_url().path(), "/hop/10");
        assert_eq!(requests.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_missing_location() {
        let port = start_mock_server(|_| async { status_response(StatusCode::FOUND) }).await;
        let start = Url::parse(&format!("http://127.0.0.1:{port}/start")).unwrap();

        let chain = resolver(80).resolve_chain(start.clone()).await;

        assert_eq!(chain.termination(), &Termination::MissingLocation);
        assert_eq!(chain.final_url(), &start);
    }

    #[tokio::test]
    async fn test_transport_error_returns_last_url() {
        let port = start_mock_server(|_| async { redirect_response(CLOSED_PORT_URL) }).await;
        let start = Url::parse(&format!("http://127.0.0.1:{port}/start")).unwrap();

        let chain = resolver(80).resolve_chain(start).await;

        assert!(matches!(chain.termination(), Termination::Transport(_)));
        assert_eq!(chain.final_url().as_str(), CLOSED_PORT_URL);
        assert_eq!(chain.hops(), 1);
    }

    #[tokio::test]
    async fn test_slow_hop_times_out() {
        let port = start_mock_server(|req| async move {
            if req.uri().path() == "/slow" {
                tokio::time::sleep(Duration::from_secs(5)).await;
                status_response(StatusCode::OK)
            } else {
                redirect_response("/slow")
            }
        })
        .await;
        let start = Url::parse(&format!("http://127.0.0.1:{port}/start")).unwrap();
        let resolver = RedirectResolver::with_limits(80, Duration::from_millis(200)).unwrap();

        let began = Instant::now();
        let url = resolver.resolve(start).await;

        assert_eq!(url.path(), "/slow");
        assert!(began.elapsed() < Duration::from_secs(3));
    }
}
