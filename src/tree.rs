//! Generic ordered property-tree container used by the metadata codecs.
//!
//! A [`PropTree`] is a named node with an optional text value, ordered
//! attributes (keyed with a leading `@`), ordered children, and named
//! binary properties. It is the in-memory shape of everything that lives
//! in the coordination store: file branches, part records, lock nodes.
//!
//! The module also defines the generic binary form used for nested part
//! subtrees: a NUL-terminated value string, then a NUL-terminated list of
//! attribute name/value pairs, then a NUL-terminated list of named child
//! trees. Binary properties are not part of the generic wire form.

use std::io::Read;

/// Result of tree and codec operations with error type [`TreeError`].
pub type Result<T> = std::result::Result<T, TreeError>;

/// Errors produced while decoding serialized trees and part records.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// The serialized input ended before the structure was complete.
    #[error("unexpected end of serialized data")]
    Truncated,
    /// A serialized string is not valid UTF-8.
    #[error("serialized string is not valid UTF-8")]
    BadString(#[from] std::string::FromUtf8Error),
    /// An underlying read failed.
    #[error(transparent)]
    Io(std::io::Error),
}

impl From<std::io::Error> for TreeError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            TreeError::Truncated
        } else {
            TreeError::Io(err)
        }
    }
}

/// Writes a NUL-terminated string.
pub(crate) fn write_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

/// Reads a NUL-terminated string.
pub(crate) fn read_cstr(src: &mut impl Read) -> Result<String> {
    let mut bytes = Vec::new();
    let mut b = [0u8; 1];
    loop {
        src.read_exact(&mut b)?;
        if b[0] == 0 {
            break;
        }
        bytes.push(b[0]);
    }
    Ok(String::from_utf8(bytes)?)
}

fn norm_attr(name: &str) -> String {
    if name.starts_with('@') {
        name.to_string()
    } else {
        format!("@{name}")
    }
}

/// Ordered generic property tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropTree {
    name: String,
    value: Option<String>,
    attrs: Vec<(String, String)>,
    children: Vec<PropTree>,
    bins: Vec<(String, Vec<u8>)>,
}

impl PropTree {
    /// Creates an empty node with the given element name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// Element name of this node.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Text value of this node, when set.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Sets the text value of this node.
    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = Some(value.into());
    }

    /// Looks up an attribute; the leading `@` on `name` is optional.
    pub fn attr(&self, name: &str) -> Option<&str> {
        let key = norm_attr(name);
        self.attrs.iter().find(|(n, _)| *n == key).map(|(_, v)| v.as_str())
    }

    /// True when the attribute is present.
    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    /// Attribute parsed as `u64`.
    pub fn attr_u64(&self, name: &str) -> Option<u64> {
        self.attr(name).and_then(|v| v.trim().parse().ok())
    }

    /// Attribute parsed as `i64`.
    pub fn attr_i64(&self, name: &str) -> Option<i64> {
        self.attr(name).and_then(|v| v.trim().parse().ok())
    }

    /// Attribute parsed as `i32`.
    pub fn attr_i32(&self, name: &str) -> Option<i32> {
        self.attr(name).and_then(|v| v.trim().parse().ok())
    }

    /// Attribute parsed as `u32`.
    pub fn attr_u32(&self, name: &str) -> Option<u32> {
        self.attr(name).and_then(|v| v.trim().parse().ok())
    }

    /// Attribute parsed as a boolean (`1`/`true`).
    pub fn attr_bool(&self, name: &str) -> bool {
        matches!(self.attr(name), Some("1") | Some("true"))
    }

    /// Sets (or replaces) an attribute; the leading `@` is optional.
    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let key = norm_attr(name);
        let value = value.into();
        match self.attrs.iter_mut().find(|(n, _)| *n == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    /// Removes an attribute, returning its old value.
    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let key = norm_attr(name);
        let idx = self.attrs.iter().position(|(n, _)| *n == key)?;
        Some(self.attrs.remove(idx).1)
    }

    /// Attributes in insertion order, names carrying their leading `@`.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Appends a child node.
    pub fn add_child(&mut self, child: PropTree) {
        self.children.push(child);
    }

    /// All children in order.
    pub fn children(&self) -> &[PropTree] {
        &self.children
    }

    /// All children in order, mutable.
    pub fn children_mut(&mut self) -> &mut [PropTree] {
        &mut self.children
    }

    /// True when the node has any children.
    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Children with the given element name, in order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a PropTree> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// First child with the given element name.
    pub fn first_child(&self, name: &str) -> Option<&PropTree> {
        self.children.iter().find(|c| c.name == name)
    }

    /// First child with the given element name, mutable.
    pub fn first_child_mut(&mut self, name: &str) -> Option<&mut PropTree> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// Text value of the first child with the given element name.
    pub fn child_value(&self, name: &str) -> Option<&str> {
        self.first_child(name).and_then(|c| c.value())
    }

    /// Removes and returns all children with the given element name.
    pub fn take_children(&mut self, name: &str) -> Vec<PropTree> {
        let mut taken = Vec::new();
        let mut i = 0;
        while i < self.children.len() {
            if self.children[i].name == name {
                taken.push(self.children.remove(i));
            } else {
                i += 1;
            }
        }
        taken
    }

    /// Keeps only the children for which `keep` returns true.
    pub fn retain_children(&mut self, keep: impl FnMut(&PropTree) -> bool) {
        self.children.retain(keep);
    }

    /// Looks up a binary property.
    pub fn bin(&self, name: &str) -> Option<&[u8]> {
        self.bins.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_slice())
    }

    /// Sets (or replaces) a binary property.
    pub fn set_bin(&mut self, name: &str, data: Vec<u8>) {
        match self.bins.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = data,
            None => self.bins.push((name.to_string(), data)),
        }
    }

    /// Removes a binary property, returning its old contents.
    pub fn remove_bin(&mut self, name: &str) -> Option<Vec<u8>> {
        let idx = self.bins.iter().position(|(n, _)| n == name)?;
        Some(self.bins.remove(idx).1)
    }

    /// Serializes the node in the generic wire form (name excluded, binary
    /// properties excluded).
    pub fn serialize(&self, out: &mut Vec<u8>) {
        write_cstr(out, self.value.as_deref().unwrap_or(""));
        for (n, v) in &self.attrs {
            write_cstr(out, n);
            write_cstr(out, v);
        }
        write_cstr(out, "");
        for c in &self.children {
            write_cstr(out, &c.name);
            c.serialize(out);
        }
        write_cstr(out, "");
    }

    /// Decodes a node from the generic wire form; the element name is
    /// supplied by the caller, as it travels outside the node body.
    pub fn deserialize(name: impl Into<String>, src: &mut impl Read) -> Result<Self> {
        let mut node = PropTree::new(name);
        let value = read_cstr(src)?;
        if !value.is_empty() {
            node.value = Some(value);
        }
        loop {
            let attr = read_cstr(src)?;
            if attr.is_empty() {
                break;
            }
            let value = read_cstr(src)?;
            node.set_attr(&attr, value);
        }
        loop {
            let child = read_cstr(src)?;
            if child.is_empty() {
                break;
            }
            node.add_child(PropTree::deserialize(child, src)?);
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> PropTree {
        let mut t = PropTree::new("Part");
        t.set_attr("@kind", "data");
        t.set_attr("rank", "3");
        t.set_value("payload");
        let mut sub = PropTree::new("Hint");
        sub.set_attr("@weight", "9");
        t.add_child(sub);
        t
    }

    #[test]
    fn attr_names_are_normalized() {
        let t = sample();
        assert_eq!(t.attr("kind"), Some("data"));
        assert_eq!(t.attr("@rank"), Some("3"));
        assert_eq!(t.attr_u64("rank"), Some(3));
        assert!(!t.has_attr("@missing"));
    }

    #[test]
    fn serialize_round_trip() {
        let t = sample();
        let mut buf = Vec::new();
        t.serialize(&mut buf);
        let back = PropTree::deserialize("Part", &mut Cursor::new(buf)).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let t = sample();
        let mut buf = Vec::new();
        t.serialize(&mut buf);
        buf.truncate(buf.len() - 2);
        let err = PropTree::deserialize("Part", &mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, TreeError::Truncated));
    }

    #[test]
    fn take_children_preserves_others() {
        let mut t = sample();
        t.add_child(PropTree::new("Other"));
        let hints = t.take_children("Hint");
        assert_eq!(hints.len(), 1);
        assert_eq!(t.children().len(), 1);
        assert_eq!(t.children()[0].name(), "Other");
    }
}
