//! Mapping gateway-relative request paths to backend-relative ones
//!
//! Inbound URIs look like `/{prefix}/{service}/{remainder}`. The prefix is
//! only removed when it sits at position zero; a prefix string that recurs
//! later in the path is left alone.

/// Extract the service-name segment from `path`, if it is routed under `prefix`.
///
/// Returns `None` for paths outside the gateway namespace and for an empty
/// segment (`/{prefix}//...`).
pub fn service_name<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    let rest = path.strip_prefix('/')?.strip_prefix(prefix)?.strip_prefix('/')?;
    let segment = match rest.split_once('/') {
        Some((segment, _)) => segment,
        None => rest,
    };
    let segment = segment.split(['?', '#']).next().unwrap_or_default();
    (!segment.is_empty()).then_some(segment)
}

/// Strip `/{prefix}/{service}` from the start of `full_path`.
///
/// `full_path` may carry a query string, which is kept. An empty remainder
/// becomes `/`. When the constructed prefix is not at position zero, or is
/// followed by something other than a path or query boundary, the path is
/// returned unchanged.
pub fn rewrite(prefix: &str, service: &str, full_path: &str) -> String {
    let expected = format!("/{}/{}", prefix, service);
    match full_path.strip_prefix(&expected) {
        Some("") => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        Some(rest) if rest.starts_with('?') => format!("/{}", rest),
        _ => full_path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_strips_prefix_and_service() {
        assert_eq!(rewrite("gw", "orders", "/gw/orders/42"), "/42");
        assert_eq!(rewrite("gw", "orders", "/gw/orders/a/b/c"), "/a/b/c");
    }

    #[test]
    fn test_rewrite_roundtrip() {
        let cases = [
            ("gw", "orders", "/42"),
            ("api", "user-service", "/v1/users/7/profile"),
            ("gateway", "s", "/"),
            ("gw", "orders", "/trailing/"),
        ];
        for (prefix, service, rest) in cases {
            let full = format!("/{}/{}{}", prefix, service, rest);
            assert_eq!(rewrite(prefix, service, &full), rest, "path {}", full);
        }
    }

    #[test]
    fn test_rewrite_keeps_query() {
        assert_eq!(rewrite("gw", "orders", "/gw/orders/42?expand=items"), "/42?expand=items");
        assert_eq!(rewrite("gw", "orders", "/gw/orders?page=2"), "/?page=2");
    }

    #[test]
    fn test_rewrite_empty_remainder() {
        assert_eq!(rewrite("gw", "orders", "/gw/orders"), "/");
    }

    #[test]
    fn test_rewrite_only_removes_leading_prefix() {
        // A recurring prefix deeper in the path belongs to the backend
        assert_eq!(rewrite("gw", "orders", "/gw/orders/gw/orders/1"), "/gw/orders/1");
    }

    #[test]
    fn test_rewrite_without_leading_prefix_is_unchanged() {
        assert_eq!(rewrite("gw", "orders", "/other/gw/orders/1"), "/other/gw/orders/1");
        assert_eq!(rewrite("gw", "orders", "/gw/orders2/1"), "/gw/orders2/1");
    }

    #[test]
    fn test_service_name_extraction() {
        assert_eq!(service_name("gw", "/gw/orders/42"), Some("orders"));
        assert_eq!(service_name("gw", "/gw/orders"), Some("orders"));
        assert_eq!(service_name("gw", "/gw/orders?x=1"), Some("orders"));
        assert_eq!(service_name("gw", "/gw/orders/"), Some("orders"));
    }

    #[test]
    fn test_service_name_missing() {
        assert_eq!(service_name("gw", "/gw//42"), None);
        assert_eq!(service_name("gw", "/gw/"), None);
        assert_eq!(service_name("gw", "/gw"), None);
        assert_eq!(service_name("gw", "/other/orders/42"), None);
        assert_eq!(service_name("gw", "/gwx/orders/42"), None);
    }
}
