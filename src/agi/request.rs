//! FastAGI request environment

use std::collections::HashMap;

use percent_encoding::percent_decode_str;

use crate::error::{AgiError, AgiResult};

const VAR_PREFIX: &str = "agi_";
const ARG_PREFIX: &str = "arg_";

/// The `agi_*` variables Asterisk sends when a FastAGI session opens.
///
/// Keys are stored without the `agi_` prefix. `agi_arg_N` values are
/// collected into [`arguments`](Self::arguments) in numeric order, and the
/// query string of `agi_request` is decoded into parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgiRequest {
    fields: HashMap<String, String>,
    arguments: Vec<String>,
    script: Option<String>,
    parameters: HashMap<String, Vec<String>>,
}

impl AgiRequest {
    /// Build a request from the header lines (without the closing blank line).
    ///
    /// Lines without a `:` separator are rejected; keys without the `agi_`
    /// prefix are kept as-is.
    pub fn parse<I, S>(lines: I) -> AgiResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut fields = HashMap::new();
        let mut numbered = Vec::new();

        for line in lines {
            let line = line.as_ref();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                return Err(AgiError::protocol_error(format!(
                    "malformed request line: {}",
                    line
                )));
            };
            let key = key
                .trim()
                .strip_prefix(VAR_PREFIX)
                .unwrap_or(key.trim())
                .to_string();
            let value = value
                .trim_start()
                .to_string();

            if let Some(n) = key
                .strip_prefix(ARG_PREFIX)
                .and_then(|n| n.parse::<usize>().ok())
            {
                numbered.push((n, value));
            } else {
                fields.insert(key, value);
            }
        }

        numbered.sort_by_key(|(n, _)| *n);
        let arguments = numbered
            .into_iter()
            .map(|(_, v)| v)
            .collect();

        let (script, parameters) = match fields.get("request") {
            Some(url) => split_request_url(url),
            None => (None, HashMap::new()),
        };

        Ok(Self {
            fields,
            arguments,
            script,
            parameters,
        })
    }

    /// Raw variable, with or without the `agi_` prefix.
    pub fn get(&self, name: &str) -> Option<&str> {
        let key = name
            .strip_prefix(VAR_PREFIX)
            .unwrap_or(name);
        self.fields
            .get(key)
            .map(String::as_str)
    }

    /// All variables, keyed without the `agi_` prefix.
    pub fn fields(&self) -> &HashMap<String, String> {
        &self.fields
    }

    /// `agi_request`, e.g. `agi://10.0.0.1/ivr/main?lang=en`.
    pub fn request_url(&self) -> Option<&str> {
        self.get("request")
    }

    /// Script path from the request URL, without leading `/` or query.
    pub fn script(&self) -> Option<&str> {
        self.script
            .as_deref()
    }

    pub fn channel(&self) -> Option<&str> {
        self.get("channel")
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.get("uniqueid")
    }

    pub fn language(&self) -> Option<&str> {
        self.get("language")
    }

    pub fn caller_id(&self) -> Option<&str> {
        self.get("callerid")
            .filter(|v| !is_unknown(v))
    }

    pub fn caller_id_name(&self) -> Option<&str> {
        self.get("calleridname")
            .filter(|v| !is_unknown(v))
    }

    pub fn context(&self) -> Option<&str> {
        self.get("context")
    }

    pub fn extension(&self) -> Option<&str> {
        self.get("extension")
    }

    /// `agi_priority` as a number; `None` for labels.
    pub fn priority(&self) -> Option<i64> {
        self.get("priority")?
            .parse()
            .ok()
    }

    /// `agi_arg_1`, `agi_arg_2`, ... in order.
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// First value of a query parameter from the request URL.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .get(name)?
            .first()
            .map(String::as_str)
    }

    /// Every value of a repeated query parameter.
    pub fn parameter_values(&self, name: &str) -> &[String] {
        self.parameters
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn is_unknown(value: &str) -> bool {
    value.is_empty() || value.eq_ignore_ascii_case("unknown")
}

fn decode(component: &str) -> String {
    let spaced = component.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8_lossy()
        .into_owned()
}

/// `agi://host[:port]/path?k=v&k2=v2` into (`path`, params).
fn split_request_url(url: &str) -> (Option<String>, HashMap<String, Vec<String>>) {
    let rest = match url.split_once("://") {
        Some((_, after_scheme)) => after_scheme
            .split_once('/')
            .map(|(_, path)| path)
            .unwrap_or(""),
        None => url,
    };
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };

    let path = path.trim_start_matches('/');
    let script = (!path.is_empty()).then(|| decode(path));

    let mut parameters: HashMap<String, Vec<String>> = HashMap::new();
    for pair in query
        .unwrap_or("")
        .split('&')
        .filter(|p| !p.is_empty())
    {
        let (k, v) = pair
            .split_once('=')
            .unwrap_or((pair, ""));
        parameters
            .entry(decode(k))
            .or_default()
            .push(decode(v));
    }
    (script, parameters)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AgiRequest {
        AgiRequest::parse([
            "agi_network: yes",
            "agi_network_script: ivr/main",
            "agi_request: agi://10.0.0.1:4573/ivr/main?lang=en&tag=a%20b&tag=c+d",
            "agi_channel: SIP/100-00000001",
            "agi_language: en",
            "agi_uniqueid: 1700000000.12",
            "agi_callerid: 100",
            "agi_calleridname: unknown",
            "agi_context: default",
            "agi_extension: 500",
            "agi_priority: 2",
            "agi_arg_2: second",
            "agi_arg_1: first",
            "agi_arg_10: tenth",
        ])
        .unwrap()
    }

    #[test]
    fn test_standard_variables() {
        let request = sample();
        assert_eq!(request.channel(), Some("SIP/100-00000001"));
        assert_eq!(request.get("agi_uniqueid"), Some("1700000000.12"));
        assert_eq!(request.get("uniqueid"), Some("1700000000.12"));
        assert_eq!(request.caller_id(), Some("100"));
        assert_eq!(request.caller_id_name(), None);
        assert_eq!(request.priority(), Some(2));
        assert_eq!(request.extension(), Some("500"));
    }

    #[test]
    fn test_arguments_are_ordered_numerically() {
        assert_eq!(sample().arguments(), ["first", "second", "tenth"]);
    }

    #[test]
    fn test_script_and_query_parameters() {
        let request = sample();
        assert_eq!(request.script(), Some("ivr/main"));
        assert_eq!(request.parameter("lang"), Some("en"));
        assert_eq!(request.parameter_values("tag"), ["a b", "c d"]);
        assert_eq!(request.parameter("missing"), None);
    }

    #[test]
    fn test_url_without_path() {
        let request = AgiRequest::parse(["agi_request: agi://10.0.0.1"]).unwrap();
        assert_eq!(request.script(), None);
    }

    #[test]
    fn test_malformed_line_is_rejected() {
        let err = AgiRequest::parse(["agi_channel SIP/1"]).unwrap_err();
        assert!(matches!(err, AgiError::ProtocolError { .. }));
    }

    #[test]
    fn test_value_keeps_colons() {
        let request = AgiRequest::parse(["agi_request: agi://host/x"]).unwrap();
        assert_eq!(request.request_url(), Some("agi://host/x"));
    }
}
