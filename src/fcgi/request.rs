//! Per-request view of the CGI environment and query string.

use std::collections::HashMap;

/// Query strings of this many bytes or more are refused with
/// `Status: 414 Request-URI Too Long`.
pub const URL_MAX_LENGTH: usize = 10240;

/// One FastCGI request as seen by a service.
///
/// Header lookups are exact CGI names (`CONTENT_LENGTH`, `HTTP_HOST`, ...).
/// Query parameters come from `QUERY_STRING`: the whole string is
/// percent-decoded, then split on `&`, and key and value split on the first
/// `=`. An encoded `%26` or `%3D` therefore separates like a literal one. A
/// key without `=` maps to `""`. When a key repeats, the last value wins.
#[derive(Debug, Clone, Default)]
pub struct Request {
    env: HashMap<String, String>,
    params: Vec<(String, String)>,
    query_string: String,
}

impl Request {
    pub fn new(env: impl IntoIterator<Item = (String, String)>) -> Self {
        let env: HashMap<String, String> = env.into_iter().collect();
        let mut request = Self {
            env,
            ..Self::default()
        };
        let raw = request.env.get("QUERY_STRING").cloned().unwrap_or_default();
        request.reset(&raw);
        request
    }

    /// A request with only a query string, for tests and tools.
    pub fn from_query(raw: &str) -> Self {
        Self::new([("QUERY_STRING".to_string(), raw.to_string())])
    }

    fn reset(&mut self, raw: &str) {
        self.query_string = url_decode(raw);
        self.params = self
            .query_string
            .split('&')
            .filter(|token| !token.is_empty())
            .map(|token| match token.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (token.to_string(), String::new()),
            })
            .collect();
    }

    pub fn header_for_name(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    pub fn parameter_for_name(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn parameter_for_name_with_default<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.parameter_for_name(name).unwrap_or(default)
    }

    pub fn request_method(&self) -> Option<&str> {
        self.header_for_name("REQUEST_METHOD")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header_for_name("CONTENT_TYPE")
    }

    pub fn document_uri(&self) -> Option<&str> {
        self.header_for_name("DOCUMENT_URI")
    }

    /// The decoded query string.
    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    /// `0` when absent or unparsable.
    pub fn content_length(&self) -> usize {
        self.header_for_name("CONTENT_LENGTH")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn is_get(&self) -> bool {
        self.request_method() == Some("GET")
    }

    pub fn is_post(&self) -> bool {
        self.request_method() == Some("POST")
    }

    /// Query parameters in the order they appear.
    pub fn parameters(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode `%XX` escapes. Malformed escapes are kept as-is; `+` is not
/// translated.
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_parsing() {
        let request = Request::from_query("name=Chen%20Bowei&age=27&gender=male");
        assert_eq!(request.query_string(), "name=Chen Bowei&age=27&gender=male");
        assert_eq!(request.parameter_for_name("name"), Some("Chen Bowei"));
        assert_eq!(request.parameter_for_name("age"), Some("27"));
        assert_eq!(request.parameter_for_name("gender"), Some("male"));
    }

    #[test]
    fn test_key_without_value() {
        let request = Request::from_query("key1=value1&key2=&key3");
        assert_eq!(request.parameter_for_name("key1"), Some("value1"));
        assert_eq!(request.parameter_for_name("key2"), Some(""));
        assert_eq!(request.parameter_for_name("key3"), Some(""));
        assert_eq!(request.parameter_for_name("key4"), None);
        assert_eq!(request.parameter_for_name_with_default("key4", "fallback"), "fallback");
        assert_eq!(request.parameter_for_name_with_default("key3", "fallback"), "");
    }

    #[test]
    fn test_query_is_decoded_before_splitting() {
        let request = Request::from_query("q=a%26b&x=1");
        assert_eq!(request.query_string(), "q=a&b&x=1");
        let params: Vec<_> = request.parameters().collect();
        assert_eq!(params, vec![("q", "a"), ("b", ""), ("x", "1")]);

        let request = Request::from_query("k%3Dv=1");
        assert_eq!(request.parameter_for_name("k"), Some("v=1"));
    }

    #[test]
    fn test_empty_tokens_skipped() {
        let request = Request::from_query("&&a=1&&b=2&");
        let params: Vec<_> = request.parameters().collect();
        assert_eq!(params, vec![("a", "1"), ("b", "2")]);
    }

    #[test]
    fn test_repeated_key_last_wins() {
        let request = Request::from_query("a=1&a=2");
        assert_eq!(request.parameter_for_name("a"), Some("2"));
    }

    #[test]
    fn test_cgi_headers() {
        let request = Request::new([
            ("REQUEST_METHOD".to_string(), "POST".to_string()),
            ("CONTENT_LENGTH".to_string(), "1000".to_string()),
            ("CONTENT_TYPE".to_string(), String::new()),
            ("DOCUMENT_URI".to_string(), "/echo".to_string()),
        ]);
        assert!(request.is_post());
        assert!(!request.is_get());
        assert_eq!(request.header_for_name("CONTENT_LENGTH"), Some("1000"));
        assert_eq!(request.header_for_name("CONTENT_TYPE"), Some(""));
        assert_eq!(request.header_for_name("content-length"), None);
        assert_eq!(request.content_length(), 1000);
        assert_eq!(request.document_uri(), Some("/echo"));
        assert_eq!(request.query_string(), "");
    }

    #[test]
    fn test_missing_content_length_is_zero() {
        assert_eq!(Request::default().content_length(), 0);
        assert_eq!(Request::default().request_method(), None);
    }

    #[test]
    fn test_url_decode_malformed() {
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(url_decode("%zz%41"), "%zzA");
        assert_eq!(url_decode("a+b"), "a+b");
        assert_eq!(url_decode("%E4%BD%A0"), "你");
    }
}
