// Per-vendor header rewriting for forwarded requests
//
// Inbound requests authenticate with the local protective key in any of
// the accepted slots; before forwarding, every auth-bearing header is
// stripped and the upstream credential is inserted in the slot the
// vendor expects. Hop-by-hop headers and Host never cross the proxy.

use axum::http::HeaderMap;

use crate::tools::WireFlavor;

/// Headers that may carry the client's protective key.
const AUTH_HEADERS: [&str; 3] = ["authorization", "x-api-key", "x-goog-api-key"];

/// Hop-by-hop headers (RFC 9110 §7.6.1) plus Host, which is rewritten by
/// the upstream client.
const HOP_BY_HOP: [&str; 9] = [
    "host",
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "transfer-encoding",
    "upgrade",
];

/// Extract the presented credential from any accepted auth slot.
/// `authorization` values shed their Bearer prefix.
pub fn extract_client_key(headers: &HeaderMap, flavor: WireFlavor) -> Option<String> {
    let accepted: &[&str] = match flavor {
        // Gemini clients use any of the three slots
        WireFlavor::Gemini => &AUTH_HEADERS,
        _ => &AUTH_HEADERS[..2],
    };

    for name in accepted {
        let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        let value = value.trim();
        let key = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .unwrap_or(value)
            .trim();
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    None
}

/// Copy forwardable headers onto an upstream request and install the
/// upstream credential in the vendor slot.
pub fn rewrite_for_upstream(
    mut request: reqwest::RequestBuilder,
    headers: &HeaderMap,
    flavor: WireFlavor,
    upstream_key: &str,
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        let name_str = name.as_str();
        if HOP_BY_HOP.contains(&name_str) || AUTH_HEADERS.contains(&name_str) {
            continue;
        }
        request = request.header(name_str, value.as_bytes());
    }

    match flavor {
        WireFlavor::Anthropic | WireFlavor::Amp => {
            request = request.header("authorization", format!("Bearer {upstream_key}"));
        }
        WireFlavor::OpenAiResponses => {
            request = request.header("authorization", format!("Bearer {upstream_key}"));
        }
        WireFlavor::Gemini => {
            request = request.header("x-goog-api-key", upstream_key);
        }
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn bearer_prefix_is_stripped() {
        let h = headers(&[("authorization", "Bearer K-123")]);
        assert_eq!(
            extract_client_key(&h, WireFlavor::Anthropic).as_deref(),
            Some("K-123")
        );
    }

    #[test]
    fn x_api_key_is_accepted() {
        let h = headers(&[("x-api-key", "K-456")]);
        assert_eq!(
            extract_client_key(&h, WireFlavor::OpenAiResponses).as_deref(),
            Some("K-456")
        );
    }

    #[test]
    fn goog_header_only_counts_for_gemini() {
        let h = headers(&[("x-goog-api-key", "K-789")]);
        assert_eq!(
            extract_client_key(&h, WireFlavor::Gemini).as_deref(),
            Some("K-789")
        );
        assert_eq!(extract_client_key(&h, WireFlavor::Anthropic), None);
    }

    #[test]
    fn empty_value_is_no_credential() {
        let h = headers(&[("authorization", "Bearer ")]);
        assert_eq!(extract_client_key(&h, WireFlavor::Anthropic), None);
    }
}
