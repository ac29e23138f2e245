//! Validators for the `contentEncoding` keyword.
use ahash::AHashMap;
use base64::{engine::general_purpose::STANDARD, Engine};
use once_cell::sync::Lazy;

use crate::ValidationError;

/// A function that checks whether a string conforms to a particular content encoding.
pub type ContentEncodingCheckType = fn(&str) -> bool;
/// A function that decodes a string, returning `Ok(None)` if the input does not conform to
/// the encoding.
pub type ContentEncodingConverterType =
    fn(&str) -> Result<Option<String>, ValidationError<'static>>;

fn is_base64(instance_string: &str) -> bool {
    STANDARD.decode(instance_string).is_ok()
}

fn from_base64(instance_string: &str) -> Result<Option<String>, ValidationError<'static>> {
    match STANDARD.decode(instance_string) {
        Ok(decoded) => Ok(String::from_utf8(decoded).ok()),
        Err(_) => Ok(None),
    }
}

pub(crate) static DEFAULT_CONTENT_ENCODING_CHECKS_AND_CONVERTERS: Lazy<
    AHashMap<&'static str, (ContentEncodingCheckType, ContentEncodingConverterType)>,
> = Lazy::new(|| {
    let mut map: AHashMap<&'static str, (ContentEncodingCheckType, ContentEncodingConverterType)> =
        AHashMap::default();
    map.insert(
        "base64",
        (
            is_base64 as ContentEncodingCheckType,
            from_base64 as ContentEncodingConverterType,
        ),
    );
    map
});

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("eyJrZXkiOiAidmFsdWUifQ==", true)]
    #[test_case("not-base64!", false)]
    fn base64_check(instance: &str, expected: bool) {
        assert_eq!(is_base64(instance), expected);
    }

    #[test]
    fn base64_decode() {
        let decoded = from_base64("eyJrZXkiOiAidmFsdWUifQ==").unwrap();
        assert_eq!(decoded.as_deref(), Some(r#"{"key": "value"}"#));
    }
}
