//! Protected header selection and response header cleanup.
//!
//! Header names are compared case-insensitively and stored lowercase.

use std::collections::BTreeMap;

use mte_relay_types::{ENCRYPTED_HEADERS_HEADER, RELAY_HEADER};

/// Header map with lowercase names.
pub type Headers = BTreeMap<String, String>;

/// Always protected when present.
const CONTENT_TYPE: &str = "content-type";

/// CORS lists that may advertise the relay headers.
const CORS_LISTS: [&str; 2] = [
    "access-control-allow-headers",
    "access-control-expose-headers",
];

/// Split `headers` into the set to encrypt and the set sent in the clear.
///
/// `content-type` is always protected; `allow_list` adds more names.
pub fn split_protected(headers: &Headers, allow_list: &[String]) -> (Headers, Headers) {
    let mut protected = Headers::new();
    let mut plain = Headers::new();
    for (name, value) in headers {
        let name = name.to_ascii_lowercase();
        let is_protected =
            name == CONTENT_TYPE || allow_list.iter().any(|a| a.eq_ignore_ascii_case(&name));
        if is_protected {
            protected.insert(name, value.clone());
        } else {
            plain.insert(name, value.clone());
        }
    }
    (protected, plain)
}

/// Merge decrypted headers into `target`; decrypted values win.
pub fn merge_headers(target: &mut Headers, decrypted: Headers) {
    for (name, value) in decrypted {
        target.insert(name.to_ascii_lowercase(), value);
    }
}

/// Remove relay protocol headers and scrub them from CORS header lists.
pub fn strip_relay_headers(headers: &mut Headers) {
    headers.remove(RELAY_HEADER);
    headers.remove(ENCRYPTED_HEADERS_HEADER);

    for list_name in CORS_LISTS {
        let Some(list) = headers.get(list_name) else {
            continue;
        };
        let kept: Vec<&str> = list
            .split(',')
            .map(str::trim)
            .filter(|entry| {
                !entry.is_empty()
                    && !entry.eq_ignore_ascii_case(RELAY_HEADER)
                    && !entry.eq_ignore_ascii_case(ENCRYPTED_HEADERS_HEADER)
            })
            .collect();
        if kept.is_empty() {
            headers.remove(list_name);
        } else {
            let joined = kept.join(", ");
            headers.insert(list_name.to_string(), joined);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn content_type_always_protected() {
        let input = headers(&[("content-type", "application/json"), ("accept", "*/*")]);
        let (protected, plain) = split_protected(&input, &[]);
        assert_eq!(protected, headers(&[("content-type", "application/json")]));
        assert_eq!(plain, headers(&[("accept", "*/*")]));
    }

    #[test]
    fn allow_list_is_case_insensitive() {
        let input = headers(&[("Authorization", "Bearer t"), ("X-Trace", "1")]);
        let (protected, plain) = split_protected(&input, &["authorization".to_string()]);
        assert_eq!(protected, headers(&[("authorization", "Bearer t")]));
        assert_eq!(plain, headers(&[("x-trace", "1")]));
    }

    #[test]
    fn nothing_protected_without_content_type() {
        let (protected, plain) = split_protected(&headers(&[("accept", "*/*")]), &[]);
        assert!(protected.is_empty());
        assert_eq!(plain.len(), 1);
    }

    #[test]
    fn merge_overrides_plain_values() {
        let mut target = headers(&[("content-type", "application/octet-stream")]);
        merge_headers(&mut target, headers(&[("Content-Type", "application/json")]));
        assert_eq!(target["content-type"], "application/json");
    }

    #[test]
    fn strips_relay_headers_and_cors_entries() {
        let mut input = headers(&[
            ("x-mte-relay", "c,p,0,1,1,1"),
            ("x-mte-relay-eh", "blob"),
            (
                "access-control-allow-headers",
                "x-mte-relay, Content-Type, X-MTE-RELAY-EH",
            ),
            ("access-control-expose-headers", "x-mte-relay"),
            ("cache-control", "no-store"),
        ]);
        strip_relay_headers(&mut input);

        assert_eq!(
            input,
            headers(&[
                ("access-control-allow-headers", "Content-Type"),
                ("cache-control", "no-store"),
            ])
        );
    }
}
