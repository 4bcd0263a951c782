//! Format decoded trees and recovered errors for display.

use crate::decoder::DecodeError;
use crate::node::{CompressedPayload, DecodedNode, NodeKind};

/// Byte previews longer than this are cut with a trailing `..`.
const BYTES_PREVIEW: usize = 16;

fn hex_string(b: &[u8]) -> String {
    b.iter().map(|x| format!("{:02x}", x)).collect::<Vec<_>>().join(" ")
}

fn bytes_preview(b: &[u8]) -> String {
    if b.len() > BYTES_PREVIEW {
        format!("hex({} ..) [{} bytes]", hex_string(&b[..BYTES_PREVIEW]), b.len())
    } else {
        format!("hex({})", hex_string(b))
    }
}

/// One-line summary of a node's value (empty for structs and arrays).
pub fn value_summary(node: &DecodedNode) -> String {
    let mut s = match &node.kind {
        NodeKind::Struct { type_name, .. } => format!("struct {}", type_name),
        NodeKind::Array { elements } => format!("[{} elements]", elements.len()),
        NodeKind::Integer {
            value,
            enum_label,
            checksum,
            string_ref,
        } => {
            let mut s = format!("{} (0x{:x})", value, value);
            if let Some(e) = enum_label {
                s.push_str(&format!(" {}", e.label));
                if let Some(d) = &e.description {
                    s.push_str(&format!(" \"{}\"", d));
                }
            }
            if let Some(c) = checksum {
                if c.valid {
                    s.push_str(&format!(" [{} ok]", c.algorithm));
                } else {
                    s.push_str(&format!(
                        " [{} MISMATCH, computed 0x{:08x}]",
                        c.algorithm,
                        c.expected.unwrap_or_default()
                    ));
                }
            }
            if let Some(r) = string_ref {
                s.push_str(&format!(" -> \"{}\"", r));
            }
            s
        }
        NodeKind::Float { value, .. } => format!("{}", value),
        NodeKind::String { value, encoding } => format!("{:?} ({})", value, encoding.name()),
        NodeKind::Bytes { data, matches_expected } => {
            let mut s = bytes_preview(data);
            match matches_expected {
                Some(true) => s.push_str(" [expected]"),
                Some(false) => s.push_str(" [UNEXPECTED]"),
                None => {}
            }
            s
        }
        NodeKind::Bitfield { raw, entries } => {
            let parts: Vec<String> = entries
                .iter()
                .map(|e| match &e.enum_label {
                    Some(l) => format!("{}[{}:{}]={} {}", e.name, e.high, e.low, e.value, l.label),
                    None => format!("{}[{}:{}]={}", e.name, e.high, e.low, e.value),
                })
                .collect();
            format!("0x{:x} {{{}}}", raw, parts.join(", "))
        }
        NodeKind::Flags { raw, flags } => {
            let set: Vec<&str> = flags.iter().filter(|f| f.set).map(|f| f.name.as_str()).collect();
            format!("0x{:x} {{{}}}", raw, set.join(" | "))
        }
        NodeKind::Compressed {
            algorithm,
            compressed_size,
            decompressed_size,
            ..
        } => format!("{} {} -> {} bytes", algorithm, compressed_size, decompressed_size),
        NodeKind::Virtual { value } => format!("= {}", value),
        NodeKind::Error { message, field_type } => match field_type {
            Some(t) => format!("<error: {} ({})>", message, t),
            None => format!("<error: {}>", message),
        },
    };
    if let Some(v) = &node.validation {
        let verdict = if v.passed { "passed" } else { "FAILED" };
        s.push_str(&format!(" (validate {} {})", v.expression, verdict));
    }
    s
}

fn push_tree(out: &mut Vec<String>, node: &DecodedNode, indent: usize) {
    let pad = "  ".repeat(indent);
    out.push(format!(
        "{}{} @{}+{}: {}",
        pad,
        node.name,
        node.offset,
        node.size,
        value_summary(node)
    ));
    match &node.kind {
        NodeKind::Compressed {
            payload: CompressedPayload::Struct(inner),
            ..
        } => push_tree(out, inner, indent + 1),
        NodeKind::Compressed {
            payload: CompressedPayload::Raw(data),
            ..
        } => out.push(format!("{}  {}", pad, bytes_preview(data))),
        _ => {
            for child in node.children() {
                push_tree(out, child, indent + 1);
            }
        }
    }
}

/// Render a decoded tree, one line per node: `name @offset+size: value`.
pub fn format_tree(root: &DecodedNode) -> String {
    let mut lines = Vec::new();
    push_tree(&mut lines, root, 0);
    lines.join("\n")
}

/// Render recovered errors, one block per error with its path and hint.
pub fn format_errors(errors: &[DecodeError]) -> String {
    let mut lines = Vec::new();
    for (i, e) in errors.iter().enumerate() {
        lines.push(format!("#{} {} at offset {}: {}", i + 1, e.field_path, e.offset, e.message));
        if let Some(t) = &e.field_type {
            lines.push(format!("   type: {}", t));
        }
        if let Some(h) = &e.hint {
            lines.push(format!("   hint: {}", h));
        }
    }
    lines.join("\n")
}
