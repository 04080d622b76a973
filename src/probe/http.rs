//! HTTP probe implementation.

use super::ProbeError;
use std::error::Error as _;
use std::time::Duration;

/// Issue a GET against `url` and require a 2xx answer within `timeout`.
///
/// Returns the response status on success.
pub async fn run_http_probe(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<u16, ProbeError> {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(timeout)
            } else if e.is_builder() {
                ProbeError::Config(describe(&e))
            } else {
                ProbeError::Network(describe(&e))
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProbeError::Status(status.as_u16()));
    }
    Ok(status.as_u16())
}

/// reqwest's top-level message hides the cause ("error sending request");
/// append the source chain so refused connections and DNS failures are visible.
fn describe(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_probe_invalid_url() {
        let client = reqwest::Client::new();
        let result =
            run_http_probe(&client, "http://256.256.256.256", Duration::from_millis(100)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_http_probe_malformed_url() {
        let client = reqwest::Client::new();
        let result = run_http_probe(&client, "not a url", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ProbeError::Config(_))));
    }
}
