use std::{borrow::Cow, str};

use xmltree::Element;

const NON_UTF8_MSG: &str = "[Non-UTF-8 data]";

/// Document text for log messages.
pub(crate) fn to_utf8_or_error_string(data: &[u8]) -> &str {
    str::from_utf8(data).unwrap_or(NON_UTF8_MSG)
}

/// Walk `path` from `elem` and return the text of the final element. An element
/// that exists but has no text yields an empty string, while a missing element
/// yields `None`.
pub(crate) fn child_text<'a>(elem: &'a Element, path: &[&str]) -> Option<Cow<'a, str>> {
    let mut result = Some(elem);

    for p in path {
        result = result.and_then(|e| e.get_child(*p));
    }

    result.map(|e| e.get_text().unwrap_or(Cow::Borrowed("")))
}

/// Look up an attribute on an element.
pub(crate) fn attribute<'a>(elem: &'a Element, name: &str) -> Option<&'a str> {
    elem.attributes.get(name).map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_text() {
        let root = Element::parse(&b"<a><b><c>text</c><d/></b></a>"[..]).unwrap();

        assert_eq!(child_text(&root, &["b", "c"]).as_deref(), Some("text"));
        assert_eq!(child_text(&root, &["b", "d"]).as_deref(), Some(""));
        assert_eq!(child_text(&root, &["b", "e"]), None);
    }

    #[test]
    fn test_to_utf8_or_error_string() {
        assert_eq!(to_utf8_or_error_string(b"<FUSMsg/>"), "<FUSMsg/>");
        assert_eq!(to_utf8_or_error_string(b"\xff\xfe"), NON_UTF8_MSG);
    }
}
