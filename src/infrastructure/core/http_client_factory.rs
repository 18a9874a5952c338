use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use std::time::Duration;

pub struct HttpClientFactory;

impl HttpClientFactory {
    /// REST client with exponential-backoff retry (max 3 attempts) for
    /// transient failures. Request timeout 30s, connect timeout 10s.
    pub fn create_client() -> ClientWithMiddleware {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let client = Client::builder()
            .pool_max_idle_per_host(5)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build()
    }
}

/// Append query parameters to a URL. reqwest-middleware's request builder
/// does not expose `.query()`, so the query string is assembled by hand.
pub fn build_url_with_query<K, V>(base_url: &str, params: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    if params.is_empty() {
        return base_url.to_string();
    }

    let query: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k.as_ref()), percent_encode(v.as_ref())))
        .collect();

    let separator = if base_url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", base_url, separator, query.join("&"))
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn percent_encode(s: &str) -> String {
    let mut encoded = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') {
            encoded.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).as_bytes() {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_without_params() {
        let url = build_url_with_query::<&str, &str>("https://api.binance.com/api/v3/klines", &[]);
        assert_eq!(url, "https://api.binance.com/api/v3/klines");
    }

    #[test]
    fn test_build_url_appends_query_string() {
        let url = build_url_with_query(
            "https://api.binance.com/api/v3/klines",
            &[("symbol", "ETHUSDT"), ("interval", "5m"), ("limit", "1000")],
        );
        assert_eq!(
            url,
            "https://api.binance.com/api/v3/klines?symbol=ETHUSDT&interval=5m&limit=1000"
        );
    }

    #[test]
    fn test_build_url_extends_existing_query() {
        let url = build_url_with_query("https://host/path?a=1", &[("b", "2")]);
        assert_eq!(url, "https://host/path?a=1&b=2");
    }

    #[test]
    fn test_reserved_characters_are_percent_encoded() {
        assert_eq!(percent_encode("ETH/USDT"), "ETH%2FUSDT");
        assert_eq!(percent_encode("a b"), "a%20b");
        assert_eq!(percent_encode("safe-._~"), "safe-._~");
    }
}
