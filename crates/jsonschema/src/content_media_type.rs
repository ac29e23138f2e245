//! Validators for the `contentMediaType` keyword.
use ahash::AHashMap;
use once_cell::sync::Lazy;

/// A function that checks whether a decoded string conforms to a particular media type.
pub type ContentMediaTypeCheckType = fn(&str) -> bool;

fn is_json(instance_string: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(instance_string).is_ok()
}

pub(crate) static DEFAULT_CONTENT_MEDIA_TYPE_CHECKS: Lazy<
    AHashMap<&'static str, ContentMediaTypeCheckType>,
> = Lazy::new(|| {
    let mut map: AHashMap<&'static str, ContentMediaTypeCheckType> = AHashMap::default();
    map.insert("application/json", is_json as ContentMediaTypeCheckType);
    map
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case::test_case("{}", true)]
    #[test_case::test_case("[1, 2]", true)]
    #[test_case::test_case("not a json", false)]
    fn json_check(instance: &str, expected: bool) {
        assert_eq!(is_json(instance), expected);
    }
}
