/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_url() {
        let urls = parse_rpc_urls("https://bsc.publicnode.com");
        assert_eq!(urls, vec!["https://bsc.publicnode.com"]);
    }

    #[test]
    fn test_parse_multiple_urls() {
        let urls = parse_rpc_urls(
            "https://bsc.publicnode.com,https://bsc-dataseed1.binance.org,https://binance.llamarpc.com",
        );
        assert_eq!(urls.len(), 3);
        assert_eq!(urls[0], "https://bsc.publicnode.com");
        assert_eq!(urls[1], "https://bsc-dataseed1.binance.org");
        assert_eq!(urls[2], "https://binance.llamarpc.com");
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let urls = parse_rpc_urls(" https://a.com , https://b.com , https://c.com ");
        assert_eq!(
            urls,
            vec!["https://a.com", "https://b.com", "https://c.com"]
        );
    }

    #[test]
    fn test_parse_ignores_empty() {
        let urls = parse_rpc_urls("https://a.com,,https://b.com,");
        assert_eq!(urls, vec!["https://a.com", "https://b.com"]);
    }

    #[test]
    fn test_parse_empty_string() {
        let urls = parse_rpc_urls("");
        assert!(urls.is_empty());
    }
}
