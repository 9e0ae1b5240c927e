//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides helpers for working with
//! credentials in the jobhost context.

pub use secrecy::{ExposeSecret, SecretString};

/// Render a connection URL with its password replaced, for logging.
pub fn redact_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "<redacted>".to_string();
    };
    match rest.split_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_hidden() {
        let url = SecretString::from("postgres://jobhost:hunter2@db:5432/jobs");
        assert_eq!(redact_url(&url), "postgres://jobhost:***@db:5432/jobs");
    }

    #[test]
    fn url_without_credentials_is_unchanged() {
        let url = SecretString::from("postgres://db/jobs");
        assert_eq!(redact_url(&url), "postgres://db/jobs");
    }
}
