//! Decoded output tree.
//!
//! Every node carries its name, absolute byte offset (relative to the buffer
//! the node was decoded from), byte size and an optional validation outcome.
//! Virtual nodes have size 0; fields skipped by their condition are absent.

use crate::schema::StringEncoding;
use crate::value::RuntimeValue;

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedNode {
    pub name: String,
    pub offset: usize,
    pub size: usize,
    pub validation: Option<ValidationOutcome>,
    pub kind: NodeKind,
}

/// Result of a field's `validate` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub expression: String,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumLabel {
    pub label: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChecksumOutcome {
    pub algorithm: &'static str,
    pub valid: bool,
    /// Computed checksum when it does not match the decoded value.
    pub expected: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BitEntryValue {
    pub name: String,
    pub high: u32,
    pub low: u32,
    pub value: u64,
    pub enum_label: Option<EnumLabel>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlagState {
    pub name: String,
    pub mask: u64,
    pub set: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompressedPayload {
    Struct(Box<DecodedNode>),
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Struct {
        type_name: String,
        children: Vec<DecodedNode>,
    },
    Array {
        elements: Vec<DecodedNode>,
    },
    Integer {
        value: i64,
        enum_label: Option<EnumLabel>,
        checksum: Option<ChecksumOutcome>,
        /// String looked up in a string table at this value's offset.
        string_ref: Option<String>,
    },
    Float {
        value: f64,
        double: bool,
    },
    String {
        value: String,
        encoding: StringEncoding,
    },
    Bytes {
        data: Vec<u8>,
        /// Whether the bytes matched the declared expected pattern.
        matches_expected: Option<bool>,
    },
    Bitfield {
        raw: u64,
        entries: Vec<BitEntryValue>,
    },
    Flags {
        raw: u64,
        flags: Vec<FlagState>,
    },
    Compressed {
        algorithm: &'static str,
        compressed_size: usize,
        decompressed_size: usize,
        payload: CompressedPayload,
    },
    Virtual {
        value: RuntimeValue,
    },
    Error {
        message: String,
        field_type: Option<String>,
    },
}

impl DecodedNode {
    pub fn new(name: impl Into<String>, offset: usize, size: usize, kind: NodeKind) -> Self {
        DecodedNode {
            name: name.into(),
            offset,
            size,
            validation: None,
            kind,
        }
    }

    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    /// Child of a struct node by name.
    pub fn child(&self, name: &str) -> Option<&DecodedNode> {
        self.children().iter().find(|c| c.name == name)
    }

    /// Children of a struct node, elements of an array node, otherwise empty.
    pub fn children(&self) -> &[DecodedNode] {
        match &self.kind {
            NodeKind::Struct { children, .. } => children,
            NodeKind::Array { elements } => elements,
            _ => &[],
        }
    }

    /// Follow a dotted path of child names, e.g. `header.version`.
    pub fn get(&self, path: &str) -> Option<&DecodedNode> {
        path.split('.').try_fold(self, |node, part| node.child(part))
    }

    pub fn as_int(&self) -> Option<i64> {
        match &self.kind {
            NodeKind::Integer { value, .. } => Some(*value),
            NodeKind::Bitfield { raw, .. } | NodeKind::Flags { raw, .. } => Some(*raw as i64),
            NodeKind::Virtual { value } => value.as_i64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::String { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.kind {
            NodeKind::Bytes { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, NodeKind::Error { .. })
    }

    /// Scalar value bound into variable frames for this node, if any.
    pub fn scalar(&self) -> Option<RuntimeValue> {
        match &self.kind {
            NodeKind::Integer { value, .. } => Some(RuntimeValue::Int(*value)),
            NodeKind::Float { value, .. } => Some(RuntimeValue::Float(*value)),
            NodeKind::String { value, .. } => Some(RuntimeValue::Str(value.clone())),
            NodeKind::Bitfield { raw, .. } | NodeKind::Flags { raw, .. } => Some(RuntimeValue::Int(*raw as i64)),
            NodeKind::Virtual { value } => Some(value.clone()),
            _ => None,
        }
    }
}
