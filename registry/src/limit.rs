use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use http::Extensions;
use log::{debug, warn};
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next};

pub type HostLimiter = governor::DefaultDirectRateLimiter;

// stick to at most 200/min in requests against Docker Hub (and allow an immediate burst of 200)
pub fn docker_hub_limiter() -> Arc<HostLimiter> {
    let per_minute = NonZeroU32::new(200).unwrap();
    Arc::new(RateLimiter::direct(
        Quota::per_minute(per_minute).allow_burst(per_minute),
    ))
}

// a transport layer that transparently applies a per-host request budget and 429/50x retrying.
// each request additionally gets its own once-per-second retry cap so a single hot request
// cannot spin, and a 429 eats every available token in the host bucket: any 429 means we need
// to slow down, so the whole bucket is shot
pub struct RateLimitedRetry {
    limiter: Option<Arc<HostLimiter>>,
}

impl RateLimitedRetry {
    pub fn new(limiter: Option<Arc<HostLimiter>>) -> Self {
        RateLimitedRetry { limiter }
    }
}

#[async_trait]
impl Middleware for RateLimitedRetry {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let retry_limiter = RateLimiter::direct(Quota::per_second(NonZeroU32::new(1).unwrap()));
        // if we see 3x (500 or 502 or 503) on this request, we bail with the last response
        let mut tries_50x = 3u32;

        let mut pending = Some(req);
        loop {
            retry_limiter.until_ready().await;
            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }

            let current = pending.take().expect("request present on every iteration");
            let url = current.url().clone();
            // cloning can fail for streaming bodies; those get exactly one attempt
            let retry_clone = current.try_clone();

            let response = next.clone().run(current, extensions).await?;
            let status = response.status().as_u16();

            let mut do_retry = false;
            if status == 429 {
                if let Some(limiter) = &self.limiter {
                    let mut drained = 0u32;
                    while limiter.check().is_ok() {
                        drained += 1;
                    }
                    debug!("429 from {url}, drained {drained} tokens");
                }
                do_retry = true;
            }
            if matches!(status, 500 | 502 | 503) && tries_50x > 1 {
                tries_50x -= 1;
                do_retry = true;
                // no bucket draining here, this is not a rate limiting signal (the per-request
                // limiter above already spaces the retries out)
            }

            if !do_retry {
                return Ok(response);
            }
            match retry_clone {
                Some(clone) => {
                    drop(response);
                    pending = Some(clone);
                }
                None => {
                    warn!("wanted to retry {status} from {url} but request body is not replayable");
                    return Ok(response);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(limiter: Option<Arc<HostLimiter>>) -> reqwest_middleware::ClientWithMiddleware {
        reqwest_middleware::ClientBuilder::new(reqwest::Client::new())
            .with(RateLimitedRetry::new(limiter))
            .build()
    }

    #[test]
    fn test_drain_starves_bucket() {
        let limiter = docker_hub_limiter();
        for _ in 0..5 {
            assert!(limiter.check().is_ok());
        }
        let mut drained = 0;
        while limiter.check().is_ok() {
            drained += 1;
        }
        assert!(drained > 0);
        assert!(limiter.check().is_err());
    }

    #[tokio::test]
    async fn test_429_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(200))
            .with_priority(2)
            .mount(&server)
            .await;

        let response = client(Some(docker_hub_limiter()))
            .get(format!("{}/v2/", server.uri()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_429_retry_resends_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v2/foo/manifests/latest"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v2/foo/manifests/latest"))
            .and(wiremock::matchers::body_string("{\"x\":1}"))
            .respond_with(ResponseTemplate::new(201))
            .with_priority(2)
            .mount(&server)
            .await;

        let response = client(None)
            .put(format!("{}/v2/foo/manifests/latest", server.uri()))
            .body("{\"x\":1}")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 201);
    }

    #[tokio::test]
    async fn test_50x_retry_cap() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let response = client(None)
            .get(format!("{}/v2/", server.uri()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 503);
        // initial try plus two retries
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_other_statuses_pass_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let response = client(None)
            .get(format!("{}/v2/", server.uri()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }
}
