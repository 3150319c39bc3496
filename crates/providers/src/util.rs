use std::time::Duration;

use ma_domain::{Error, Result};

pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Resolve an API key from the named environment variable.
pub fn resolve_api_key(env_var: &str) -> Result<String> {
    match std::env::var(env_var) {
        Ok(key) if !key.is_empty() => Ok(key),
        _ => Err(Error::Config(format!(
            "LLM API key env var {env_var} is not set"
        ))),
    }
}

/// Whether an HTTP status warrants the single in-call retry.
pub(crate) fn is_transient(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

/// Jittered backoff before the retry: 300–800ms.
pub(crate) fn retry_delay() -> Duration {
    use rand::Rng;
    Duration::from_millis(rand::thread_rng().gen_range(300..800))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses() {
        assert!(is_transient(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient(reqwest::StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_transient(reqwest::StatusCode::BAD_GATEWAY));
        assert!(!is_transient(reqwest::StatusCode::UNAUTHORIZED));
        assert!(!is_transient(reqwest::StatusCode::BAD_REQUEST));
    }

    #[test]
    fn retry_delay_in_band() {
        for _ in 0..32 {
            let d = retry_delay();
            assert!(d >= Duration::from_millis(300) && d < Duration::from_millis(800));
        }
    }
}
