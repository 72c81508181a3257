use url::Url;

/// Strip query and fragment before a URL reaches the logs; session ids and
/// signed tokens ride in the query string.
pub fn sanitize_url_for_logging(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => {
            let mut sanitized = format!("{}://", parsed.scheme());
            if let Some(host) = parsed.host_str() {
                sanitized.push_str(host);
                if let Some(port) = parsed.port() {
                    sanitized.push(':');
                    sanitized.push_str(&port.to_string());
                }
            }
            sanitized.push_str(parsed.path());
            sanitized
        }
        Err(_) => url
            .split_once('?')
            .or_else(|| url.split_once('#'))
            .map(|(head, _)| head.to_string())
            .unwrap_or_else(|| url.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_query_and_fragment() {
        assert_eq!(
            sanitize_url_for_logging("https://cdn.example.com/pkg.exe?sid=secret#frag"),
            "https://cdn.example.com/pkg.exe"
        );
        assert_eq!(
            sanitize_url_for_logging("https://cdn.example.com:8443/pkg.exe"),
            "https://cdn.example.com:8443/pkg.exe"
        );
    }
}
