//! Failure classification

use relaycast_common::types::ErrorType;

/// Keyword lists per category, checked in order; the first category with a
/// matching keyword wins
const CATEGORIES: &[(ErrorType, &[&str])] = &[
    (
        ErrorType::Temporary,
        &[
            "timeout",
            "timed out",
            "temporarily",
            "temporary",
            "try again",
            "connection refused",
            "connection reset",
            "network",
            "rate limit",
            "too many",
            "throttl",
            "busy",
            "421 ",
            "450 ",
            "451 ",
            "452 ",
        ],
    ),
    (
        ErrorType::Auth,
        &[
            "authentication",
            "auth failed",
            "unauthorized",
            "invalid credentials",
            "login",
            "535 ",
            "534 ",
            "530 ",
        ],
    ),
    (
        ErrorType::Permanent,
        &[
            "invalid recipient",
            "invalid number",
            "invalid address",
            "user unknown",
            "no such user",
            "does not exist",
            "mailbox unavailable",
            "unsubscribed",
            "blocked",
            "blacklist",
            "550 ",
            "551 ",
            "553 ",
            "554 ",
        ],
    ),
    (
        ErrorType::Server,
        &[
            "server error",
            "internal error",
            "service unavailable",
            "bad gateway",
            "500 ",
            "502 ",
            "503 ",
            "504 ",
        ],
    ),
];

/// Failures that report throttling get the carrier's flat delay
const RATE_LIMIT_KEYWORDS: &[&str] = &["rate limit", "too many", "throttl"];

/// Classify failure text by case-insensitive keyword match
pub fn classify(error_text: &str) -> ErrorType {
    let text = error_text.to_lowercase();
    CATEGORIES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| text.contains(k)))
        .map(|(error_type, _)| *error_type)
        .unwrap_or(ErrorType::Unknown)
}

/// Whether the failure reports throttling
pub fn is_rate_limited(error_text: &str) -> bool {
    let text = error_text.to_lowercase();
    RATE_LIMIT_KEYWORDS.iter().any(|k| text.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_categories() {
        assert_eq!(classify("Connection timed out"), ErrorType::Temporary);
        assert_eq!(classify("SMTP authentication failed"), ErrorType::Auth);
        assert_eq!(classify("Invalid recipient"), ErrorType::Permanent);
        assert_eq!(classify("550 mailbox unavailable"), ErrorType::Permanent);
        assert_eq!(classify("Internal error on relay"), ErrorType::Server);
        assert_eq!(classify("something odd happened"), ErrorType::Unknown);
        assert_eq!(classify(""), ErrorType::Unknown);
    }

    #[test]
    fn test_first_category_wins() {
        // Both temporary and permanent keywords; temporary is checked first
        assert_eq!(classify("timeout talking to blocked host"), ErrorType::Temporary);
        assert_eq!(classify("login rejected: 550 user unknown"), ErrorType::Auth);
    }

    #[test]
    fn test_classify_is_pure() {
        let text = "Rate limit exceeded, try again later";
        let first = classify(text);
        for _ in 0..10 {
            assert_eq!(classify(text), first);
        }
        assert_eq!(first, ErrorType::Temporary);
    }

    #[test]
    fn test_rate_limit_detection() {
        assert!(is_rate_limited("421 Too many messages"));
        assert!(is_rate_limited("Throttled by carrier"));
        assert!(!is_rate_limited("connection reset"));
    }
}
