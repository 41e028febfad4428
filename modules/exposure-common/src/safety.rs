use regex::Regex;
use std::sync::LazyLock;
use url::Url;

static LONG_DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{6,}").unwrap());

/// Mask every run of 6+ digits, keeping the first two and last two.
/// `"0101234567"` becomes `"01***67"`. Shorter runs are left alone.
pub fn mask_digits(text: &str) -> String {
    LONG_DIGITS_RE
        .replace_all(text, |caps: &regex::Captures| {
            let run = &caps[0];
            // ASCII digits only, so byte slicing is safe.
            format!("{}***{}", &run[..2], &run[run.len() - 2..])
        })
        .into_owned()
}

/// Whether an image URL may be fetched server-side.
///
/// Only `https` URLs whose host equals one of `trusted_suffixes` or is a
/// subdomain of one pass. Everything else is refused before any request goes out.
pub fn is_allowed_image_url(raw: &str, trusted_suffixes: &[String]) -> bool {
    let Ok(url) = Url::parse(raw) else {
        return false;
    };
    if url.scheme() != "https" {
        return false;
    }
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();

    trusted_suffixes.iter().any(|suffix| {
        let suffix = suffix.trim().trim_start_matches('.').to_ascii_lowercase();
        !suffix.is_empty() && (host == suffix || host.ends_with(&format!(".{suffix}")))
    })
}

/// Content type for an image URL, judged from its path extension. Defaults to JPEG.
pub fn guess_image_content_type(raw: &str) -> &'static str {
    let path = Url::parse(raw)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_else(|_| raw.to_ascii_lowercase());

    if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else {
        "image/jpeg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trusted() -> Vec<String> {
        vec!["pstatic.net".to_string()]
    }

    #[test]
    fn test_mask_digits_long_runs() {
        assert_eq!(mask_digits("call 01012345678 now"), "call 01***78 now");
        assert_eq!(mask_digits("123456"), "12***56");
    }

    #[test]
    fn test_mask_digits_leaves_short_runs() {
        assert_eq!(mask_digits("apt 12345, floor 3"), "apt 12345, floor 3");
    }

    #[test]
    fn test_mask_digits_multiple_runs() {
        assert_eq!(
            mask_digits("900101-1234567 / 12-3456789012"),
            "90***01-12***67 / 12-34***12"
        );
    }

    #[test]
    fn test_allowed_image_url_subdomain() {
        assert!(is_allowed_image_url(
            "https://postfiles.pstatic.net/a/b.jpg?type=w966",
            &trusted()
        ));
        assert!(is_allowed_image_url("https://pstatic.net/x.png", &trusted()));
    }

    #[test]
    fn test_allowed_image_url_rejects_http_and_lookalikes() {
        assert!(!is_allowed_image_url("http://postfiles.pstatic.net/a.jpg", &trusted()));
        assert!(!is_allowed_image_url("https://evilpstatic.net/a.jpg", &trusted()));
        assert!(!is_allowed_image_url("https://pstatic.net.evil.com/a.jpg", &trusted()));
        assert!(!is_allowed_image_url("not a url", &trusted()));
        assert!(!is_allowed_image_url("https://postfiles.pstatic.net/a.jpg", &[]));
    }

    #[test]
    fn test_guess_image_content_type() {
        assert_eq!(guess_image_content_type("https://x.pstatic.net/a.PNG?type=w1"), "image/png");
        assert_eq!(guess_image_content_type("https://x.pstatic.net/a.webp"), "image/webp");
        assert_eq!(guess_image_content_type("https://x.pstatic.net/a.gif"), "image/gif");
        assert_eq!(guess_image_content_type("https://x.pstatic.net/a"), "image/jpeg");
    }
}
