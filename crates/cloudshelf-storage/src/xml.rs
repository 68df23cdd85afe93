//! Minimal namespace-agnostic XML element tree.
//!
//! OSS, COS, Azure, WebDAV and S3-dialect multipart responses are small
//! documents read once; a tiny owned tree keyed by local names is simpler
//! than per-backend serde models and ignores `D:`/`d:` prefix differences.

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use cloudshelf_core::error::{AppError, ErrorKind};
use cloudshelf_core::result::AppResult;

/// One element with its local name, concatenated text, and children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    /// Local name, without namespace prefix.
    pub name: String,
    /// Unescaped text content directly inside this element.
    pub text: String,
    /// Child elements in document order.
    pub children: Vec<Element>,
}

impl Element {
    /// Parse a document and return its root element.
    pub fn parse(xml: &str) -> AppResult<Element> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader.read_event().map_err(|e| {
                AppError::with_source(
                    ErrorKind::MalformedResponse,
                    format!("Invalid XML at byte {}", reader.buffer_position()),
                    e,
                )
            })?;
            match event {
                Event::Start(start) => {
                    stack.push(Element {
                        name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
                        ..Element::default()
                    });
                }
                Event::Empty(start) => {
                    let element = Element {
                        name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
                        ..Element::default()
                    };
                    attach(&mut stack, &mut root, element);
                }
                Event::Text(text) => {
                    if let Some(current) = stack.last_mut() {
                        let text = text.unescape().map_err(|e| {
                            AppError::with_source(
                                ErrorKind::MalformedResponse,
                                "Invalid XML text escape",
                                e,
                            )
                        })?;
                        current.text.push_str(&text);
                    }
                }
                Event::CData(data) => {
                    if let Some(current) = stack.last_mut() {
                        current
                            .text
                            .push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| AppError::malformed("Unbalanced XML end tag"))?;
                    attach(&mut stack, &mut root, element);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        root.ok_or_else(|| AppError::malformed("XML document has no root element"))
    }

    /// First direct child named `name`.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Every direct child named `name`.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text of the first direct child named `name`.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    /// Follow a path of child names from this element.
    pub fn find(&self, path: &[&str]) -> Option<&Element> {
        path.iter().try_fold(self, |el, name| el.child(name))
    }

    /// Text at a path of child names.
    pub fn find_text(&self, path: &[&str]) -> Option<&str> {
        self.find(path).map(|e| e.text.as_str())
    }
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}

/// Escape text for inclusion in a request body.
pub fn escape(text: &str) -> String {
    quick_xml::escape::escape(text).into_owned()
}

/// Parse `body` and require its root element to be named `expected`.
pub fn parse_document(body: &str, expected: &str) -> AppResult<Element> {
    if crate::classify::looks_like_html(body) {
        return Err(AppError::malformed(format!(
            "Expected an XML <{expected}> document but received an HTML page"
        )));
    }
    let root = Element::parse(body)?;
    if root.name != expected {
        return Err(AppError::malformed(format!(
            "Expected XML root <{expected}>, found <{}>",
            root.name
        )));
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_bucket_result() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>photos</Name>
  <IsTruncated>true</IsTruncated>
  <NextMarker>b.txt</NextMarker>
  <Contents><Key>a &amp; b.txt</Key><Size>3</Size></Contents>
  <Contents><Key>b.txt</Key><Size>5</Size></Contents>
  <CommonPrefixes><Prefix>dir/</Prefix></CommonPrefixes>
</ListBucketResult>"#;
        let root = Element::parse(xml).unwrap();
        assert_eq!(root.name, "ListBucketResult");
        assert_eq!(root.child_text("NextMarker"), Some("b.txt"));
        let keys: Vec<_> = root
            .children_named("Contents")
            .filter_map(|c| c.child_text("Key"))
            .collect();
        assert_eq!(keys, ["a & b.txt", "b.txt"]);
        assert_eq!(root.find_text(&["CommonPrefixes", "Prefix"]), Some("dir/"));
    }

    #[test]
    fn test_namespace_prefixes_are_ignored() {
        let xml = r#"<d:multistatus xmlns:d="DAV:"><d:response><d:href>/a</d:href>
<d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat>
</d:response></d:multistatus>"#;
        let root = Element::parse(xml).unwrap();
        assert_eq!(root.name, "multistatus");
        assert!(
            root.find(&["response", "propstat", "prop", "resourcetype", "collection"])
                .is_some()
        );
    }

    #[test]
    fn test_html_is_malformed() {
        let err = parse_document("<!DOCTYPE html><html><body>502</body></html>", "Error")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedResponse);
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
    }
}
