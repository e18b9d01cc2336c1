//! `key=value&key=value` splitting shared by query strings and
//! `application/x-www-form-urlencoded` bodies.

use crate::HeaderMap;
use memchr::{memchr, memchr_iter};
use std::borrow::Cow;

/// URL query string parser.
///
/// Values are kept exactly as they arrived unless decoding is requested:
/// no `%XX` unescaping and no `+` to space translation.
///
/// Splitting rules:
/// - pairs are separated by `&`
/// - a pair is split on its first `=`, so values may contain `=`
/// - `key=` keeps the key with an empty value
/// - a token without `=` is dropped, parsing continues with the next token
/// - a repeated key replaces the earlier value
///
/// # Examples
/// ```rust
/// use modserve::query::Query;
///
/// let params = Query::parse(b"a=1&b=&c&a=3", false);
///
/// assert_eq!(params.get("a"), Some("3"));
/// assert_eq!(params.get("b"), Some(""));
/// assert_eq!(params.get("c"), None);
/// ```
pub struct Query;

impl Query {
    /// Parses `input` into a new map.
    #[inline]
    pub fn parse(input: &[u8], decode: bool) -> HeaderMap {
        let mut map = HeaderMap::new();
        Self::parse_into(&mut map, input, decode);
        map
    }

    /// Parses `input` and inserts every pair into `map`.
    pub fn parse_into(map: &mut HeaderMap, input: &[u8], decode: bool) {
        let mut start = 0;
        let ends = memchr_iter(b'&', input).chain(std::iter::once(input.len()));

        for end in ends {
            let token = &input[start..end];
            start = end + 1;

            let Some(eq) = memchr(b'=', token) else {
                continue;
            };

            let key = String::from_utf8_lossy(&token[..eq]);
            let value = String::from_utf8_lossy(&token[eq + 1..]);

            if decode {
                map.insert(Self::decode(&key), Self::decode(&value));
            } else {
                map.insert(key, value);
            }
        }
    }

    /// Percent-decodes a single key or value, turning `+` into a space.
    ///
    /// Input that does not decode to valid UTF-8 is returned unchanged.
    ///
    /// ```rust
    /// use modserve::query::Query;
    ///
    /// assert_eq!(Query::decode("a%20b+c"), "a b c");
    /// assert_eq!(Query::decode("%FF"), "%FF");
    /// ```
    pub fn decode(value: &str) -> String {
        let spaced: Cow<str> = match memchr(b'+', value.as_bytes()) {
            Some(_) => Cow::Owned(value.replace('+', " ")),
            None => Cow::Borrowed(value),
        };

        match urlencoding::decode(&spaced) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => value.to_owned(),
        }
    }
}
