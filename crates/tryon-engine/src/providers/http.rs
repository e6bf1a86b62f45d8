use reqwest::Response;
use tryon_contracts::{ErrorClass, ProviderError};

/// Status code plus raw body. Reading the body can itself fail on a broken
/// connection, which is classified like any other transport error.
pub(crate) async fn read_body(provider: &str, response: Response) -> Result<(u16, String), ProviderError> {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|err| transport_error(provider, &err))?;
    Ok((status, body))
}

pub(crate) fn transport_error(provider: &str, err: &reqwest::Error) -> ProviderError {
    let class = if err.is_timeout() {
        ErrorClass::Timeout
    } else if err.is_connect() || err.is_request() {
        ErrorClass::Network
    } else if err.is_decode() || err.is_body() {
        ErrorClass::MalformedResponse
    } else {
        ErrorClass::Unknown
    };
    ProviderError::new(class, provider, truncate_text(&error_chain_text(err), 512))
}

fn error_chain_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty() && parts.last().map(|last| last != trimmed).unwrap_or(true) {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    parts.join(" | caused by: ")
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::{contains_any, truncate_text};

    #[test]
    fn truncation_counts_chars() {
        assert_eq!(truncate_text("abc", 5), "abc");
        assert_eq!(truncate_text("ééééé", 2), "éé…");
    }

    #[test]
    fn contains_any_matches_substrings() {
        assert!(contains_any("daily quota exceeded", &["quota", "limit"]));
        assert!(!contains_any("teapot", &["quota"]));
    }
}
