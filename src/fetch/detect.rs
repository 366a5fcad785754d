//! Anti-bot and rate-limit detection
//!
//! Recognizes responses that mean the source is refusing us rather than
//! serving the page: throttling status codes and challenge/CAPTCHA
//! interstitials.

/// Markers found on challenge pages
const BOT_INDICATORS: [&str; 11] = [
    "captcha",
    "recaptcha",
    "hcaptcha",
    "cf-browser-verification",
    "cloudflare",
    "ddos-guard",
    "challenge-platform",
    "please wait while we verify",
    "checking your browser",
    "just a moment",
    "enable javascript and cookies",
];

/// Status codes a source uses to turn us away
pub fn is_blocking_status(status: u16) -> bool {
    matches!(status, 403 | 429)
}

/// Whether page content looks like a bot challenge instead of real content
pub fn check_bot_protection(html: &str) -> bool {
    let html_lower = html.to_lowercase();
    let protection_count = BOT_INDICATORS
        .iter()
        .filter(|p| html_lower.contains(*p))
        .count();

    // Challenge pages carry several markers; a lone CDN reference does not count
    protection_count >= 2
}

/// Reason the response should be treated as `Blocked`, if any
pub fn detect_block(status: Option<u16>, html: &str) -> Option<String> {
    if let Some(status) = status {
        if is_blocking_status(status) {
            return Some(format!("HTTP {}", status));
        }
    }
    if check_bot_protection(html) {
        return Some("bot protection challenge".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_page_detected() {
        let html = r#"<html><head><title>Just a moment...</title></head>
            <body><div id="challenge-platform">Checking your browser</div></body></html>"#;
        assert!(check_bot_protection(html));
        assert_eq!(
            detect_block(Some(200), html).as_deref(),
            Some("bot protection challenge")
        );
    }

    #[test]
    fn test_single_cdn_marker_is_not_a_block() {
        let html = r#"<script src="https://cdnjs.cloudflare.com/x.js"></script><div class="match-header"></div>"#;
        assert!(!check_bot_protection(html));
        assert!(detect_block(Some(200), html).is_none());
    }

    #[test]
    fn test_blocking_status() {
        assert_eq!(detect_block(Some(429), "").as_deref(), Some("HTTP 429"));
        assert_eq!(detect_block(Some(403), "").as_deref(), Some("HTTP 403"));
        assert!(detect_block(Some(404), "").is_none());
        assert!(detect_block(None, "<html></html>").is_none());
    }
}
