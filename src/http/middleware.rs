//! Admission middleware.
//!
//! [`AdmissionLayer`] wraps any downstream service. Each request costs exactly
//! one [`AdmissionPolicy::check`]; admitted requests reach the downstream
//! service untouched, rejected ones are answered here with a 429 and the
//! downstream service is neither polled for readiness nor called.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::response::Response;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tower::{Layer, Service, ServiceExt};

use super::response::{admission_headers, rejection};
use crate::ratelimit::{AdmissionPolicy, Decision};

/// Which responses carry the advisory `X-Ratelimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPolicy {
    /// Report limit and remaining tokens on admitted responses
    #[serde(default)]
    pub on_admit: bool,
    /// Report limit, remaining and retry-after on rejections
    #[serde(default = "default_on_reject")]
    pub on_reject: bool,
}

impl Default for HeaderPolicy {
    fn default() -> Self {
        Self {
            on_admit: false,
            on_reject: default_on_reject(),
        }
    }
}

fn default_on_reject() -> bool {
    true
}

/// A layer that gates requests on an [`AdmissionPolicy`].
#[derive(Debug)]
pub struct AdmissionLayer<P> {
    policy: Arc<P>,
    headers: HeaderPolicy,
}

impl<P> AdmissionLayer<P> {
    /// Create a new admission layer.
    pub fn new(policy: Arc<P>) -> Self {
        Self {
            policy,
            headers: HeaderPolicy::default(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderPolicy) -> Self {
        self.headers = headers;
        self
    }
}

impl<P> Clone for AdmissionLayer<P> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            headers: self.headers,
        }
    }
}

impl<S, P> Layer<S> for AdmissionLayer<P> {
    type Service = AdmissionService<S, P>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            policy: self.policy.clone(),
            headers: self.headers,
        }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
#[derive(Debug)]
pub struct AdmissionService<S, P> {
    inner: S,
    policy: Arc<P>,
    headers: HeaderPolicy,
}

impl<S: Clone, P> Clone for AdmissionService<S, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            policy: self.policy.clone(),
            headers: self.headers,
        }
    }
}

impl<S, P, B> Service<Request<B>> for AdmissionService<S, P>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    P: AdmissionPolicy,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    // Downstream readiness is awaited only after admission, so a rejected
    // request never holds a slot in a readiness-reserving service.
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        match self.policy.check() {
            Decision::Admitted { limit, remaining } => {
                let report = self.headers.on_admit;
                let clone = self.inner.clone();
                let downstream = std::mem::replace(&mut self.inner, clone);

                Box::pin(async move {
                    let mut response = downstream.oneshot(request).await?;
                    if report {
                        admission_headers(response.headers_mut(), limit, remaining);
                    }
                    Ok(response)
                })
            }
            Decision::Rejected { limit, retry_after } => {
                let response = rejection(limit, retry_after, self.headers.on_reject);
                Box::pin(futures::future::ready(Ok(response)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use tower::ServiceExt;

    use crate::http::response::{X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RETRY_AFTER};
    use crate::ratelimit::{ManualClock, RateLimiter};

    fn limiter(rate: f64, capacity: u32) -> (Arc<RateLimiter>, ManualClock) {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(rate, capacity, Arc::new(clock.clone())).unwrap();
        (Arc::new(limiter), clock)
    }

    fn counting_downstream(
        calls: Arc<AtomicUsize>,
    ) -> impl Service<Request, Response = Response, Error = Infallible, Future = impl Send> + Clone
    {
        tower::service_fn(move |_request: Request| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>((StatusCode::OK, "downstream").into_response())
            }
        })
    }

    /// Downstream that counts how often its readiness is polled.
    #[derive(Clone)]
    struct ReadinessTracking {
        polled: Arc<AtomicUsize>,
    }

    impl Service<Request> for ReadinessTracking {
        type Response = Response;
        type Error = Infallible;
        type Future = futures::future::Ready<Result<Response, Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            self.polled.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _request: Request) -> Self::Future {
            futures::future::ready(Ok(StatusCode::OK.into_response()))
        }
    }

    fn request() -> Request {
        Request::builder().uri("/").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_admitted_request_reaches_downstream() {
        let (limiter, _clock) = limiter(1.0, 1);
        let calls = Arc::new(AtomicUsize::new(0));
        let service = AdmissionLayer::new(limiter).layer(counting_downstream(calls.clone()));

        let response = service.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(response.headers().get(&X_RATELIMIT_REMAINING).is_none());
    }

    #[tokio::test]
    async fn test_rejected_request_skips_downstream() {
        let (limiter, _clock) = limiter(0.5, 2);
        let calls = Arc::new(AtomicUsize::new(0));
        let service = AdmissionLayer::new(limiter).layer(counting_downstream(calls.clone()));

        for _ in 0..2 {
            let response = service.clone().oneshot(request()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = service.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[&X_RATELIMIT_LIMIT], "2");
        assert_eq!(response.headers()[&X_RATELIMIT_REMAINING], "0");
        assert_eq!(response.headers()[&X_RATELIMIT_RETRY_AFTER], "2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejected_request_does_not_reserve_downstream() {
        let (limiter, _clock) = limiter(0.0, 1);
        let polled = Arc::new(AtomicUsize::new(0));
        let service = AdmissionLayer::new(limiter).layer(ReadinessTracking {
            polled: polled.clone(),
        });

        let response = service.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(polled.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            let response = service.clone().oneshot(request()).await.unwrap();
            assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        }
        assert_eq!(polled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_refill() {
        let (limiter, clock) = limiter(0.5, 2);
        let calls = Arc::new(AtomicUsize::new(0));
        let service = AdmissionLayer::new(limiter).layer(counting_downstream(calls.clone()));

        let mut statuses = Vec::new();
        for _ in 0..3 {
            statuses.push(service.clone().oneshot(request()).await.unwrap().status());
        }
        clock.advance(Duration::from_secs(2));
        for _ in 0..2 {
            statuses.push(service.clone().oneshot(request()).await.unwrap().status());
        }

        assert_eq!(
            statuses,
            vec![
                StatusCode::OK,
                StatusCode::OK,
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::OK,
                StatusCode::TOO_MANY_REQUESTS,
            ]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_headers_on_admit() {
        let (limiter, _clock) = limiter(1.0, 3);
        let calls = Arc::new(AtomicUsize::new(0));
        let headers = HeaderPolicy {
            on_admit: true,
            on_reject: false,
        };
        let service = AdmissionLayer::new(limiter)
            .with_headers(headers)
            .layer(counting_downstream(calls));

        let response = service.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.headers()[&X_RATELIMIT_LIMIT], "3");
        assert_eq!(response.headers()[&X_RATELIMIT_REMAINING], "2");

        for _ in 0..2 {
            service.clone().oneshot(request()).await.unwrap();
        }
        let rejected = service.clone().oneshot(request()).await.unwrap();
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(rejected.headers().get(&X_RATELIMIT_LIMIT).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_admit_exactly_capacity() {
        let (limiter, _clock) = limiter(0.0, 8);
        let calls = Arc::new(AtomicUsize::new(0));
        let service = AdmissionLayer::new(limiter).layer(counting_downstream(calls.clone()));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.oneshot(request()).await.unwrap().status() })
            })
            .collect();

        let statuses = futures::future::join_all(tasks).await;
        let admitted = statuses
            .into_iter()
            .map(|status| status.unwrap())
            .filter(|status| *status == StatusCode::OK)
            .count();

        assert_eq!(admitted, 8);
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }
}
