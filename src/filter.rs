//! Pre-request gate evaluated before any session is created

use hyper::http::request::Parts;
use std::sync::Arc;
use tracing::debug;

/// Typed outcome of evaluating a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Allow,
    Deny { reason: String },
}

impl FilterDecision {
    pub fn deny(reason: impl Into<String>) -> Self {
        FilterDecision::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, FilterDecision::Allow)
    }
}

pub trait RequestFilter: Send + Sync {
    fn evaluate(&self, request: &Parts) -> FilterDecision;
}

impl<F> RequestFilter for F
where
    F: Fn(&Parts) -> FilterDecision + Send + Sync,
{
    fn evaluate(&self, request: &Parts) -> FilterDecision {
        self(request)
    }
}

/// Ordered filters; the first deny wins
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn RequestFilter>>,
}

impl FilterChain {
    /// A chain with no filters, which allows everything
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: impl RequestFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn evaluate(&self, request: &Parts) -> FilterDecision {
        for filter in &self.filters {
            let decision = filter.evaluate(request);
            if let FilterDecision::Deny { reason } = &decision {
                debug!(uri = %request.uri, reason, "Request denied by filter");
                return decision;
            }
        }
        FilterDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::{Method, Request};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn parts(method: Method, uri: &str) -> Parts {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[test]
    fn test_empty_chain_allows() {
        let chain = FilterChain::allow_all();
        assert!(chain.is_empty());
        assert!(chain.evaluate(&parts(Method::GET, "/gw/orders/1")).is_allowed());
    }

    #[test]
    fn test_first_deny_short_circuits() {
        let later_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&later_calls);

        let chain = FilterChain::allow_all()
            .with_filter(|req: &Parts| {
                if req.method == Method::DELETE {
                    FilterDecision::deny("deletes are not proxied")
                } else {
                    FilterDecision::Allow
                }
            })
            .with_filter(move |_: &Parts| {
                counter.fetch_add(1, Ordering::SeqCst);
                FilterDecision::Allow
            });
        assert_eq!(chain.len(), 2);

        assert_eq!(
            chain.evaluate(&parts(Method::DELETE, "/gw/orders/1")),
            FilterDecision::deny("deletes are not proxied")
        );
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);

        assert!(chain.evaluate(&parts(Method::GET, "/gw/orders/1")).is_allowed());
        assert_eq!(later_calls.load(Ordering::SeqCst), 1);
    }
}
