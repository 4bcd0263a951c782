//! Decoder tests: hand-encoded buffers decoded with schemas written in the schema DSL.

use binschema::node::{CompressedPayload, NodeKind};
use binschema::{decode, decode_with_recovery, load, DecodeErrorKind, DecodedNode, ErrorMode, ResolvedSchema};

fn schema(src: &str) -> ResolvedSchema {
    load(src).expect("schema")
}

fn int(node: &DecodedNode, path: &str) -> i64 {
    node.get(path)
        .and_then(DecodedNode::as_int)
        .unwrap_or_else(|| panic!("no integer at {}", path))
}

// ---------------------------------------------------------------- scenarios

#[test]
fn test_bitfield_entries() {
    let s = schema("struct Root { flags: bitfield [size = 1, bits = (bit7 7:7, bit0 0:0)]; }");
    let root = decode(&[0xA5], &s).expect("decode");
    let flags = root.child("flags").expect("flags");
    match &flags.kind {
        NodeKind::Bitfield { raw, entries } => {
            assert_eq!(*raw, 0xA5);
            assert_eq!(entries[0].name, "bit7");
            assert_eq!(entries[0].value, 1);
            assert_eq!(entries[1].name, "bit0");
            assert_eq!(entries[1].value, 1);
        }
        other => panic!("expected bitfield, got {:?}", other),
    }
    assert_eq!(flags.size, 1);
}

#[test]
fn test_uleb128_value_and_size() {
    let s = schema("struct Root { n: uleb128; }");
    let root = decode(&[0xE5, 0x8E, 0x26], &s).expect("decode");
    let n = root.child("n").expect("n");
    assert_eq!(n.as_int(), Some(624485));
    assert_eq!(n.size, 3);
}

#[test]
fn test_condition_false_skips_field() {
    let s = schema(
        "struct Root { version: u8; extra: u16 [if = {version >= 2}]; trailing: u8; }",
    );
    let root = decode(&[0x01, 0xFF], &s).expect("decode");
    assert_eq!(root.children().len(), 2);
    assert_eq!(int(&root, "version"), 1);
    let trailing = root.child("trailing").expect("trailing");
    assert_eq!(trailing.as_int(), Some(0xFF));
    assert_eq!(trailing.offset, 1);
    assert!(root.child("extra").is_none());
}

#[test]
fn test_length_prefixed_blocks() {
    let s = schema("struct Root { blocks: bytes [repeat = length_prefixed, prefix = 1]; }");
    let root = decode(&[0x02, 0xAA, 0xBB, 0x03, 0xCC, 0xDD, 0xEE, 0x00], &s).expect("decode");
    let blocks = root.child("blocks").expect("blocks");
    let elements = blocks.children();
    assert_eq!(elements.len(), 2);
    assert_eq!(elements[0].size, 2);
    assert_eq!(elements[0].as_bytes(), Some(&[0xAA, 0xBB][..]));
    assert_eq!(elements[1].size, 3);
    assert_eq!(elements[1].offset, 4);
    assert_eq!(root.size, 8);
}

const UNMATCHED_SWITCH: &str = r#"
format Demo { endian: little; root: Root; }
struct Root { records: Record [repeat = until_eof]; }
struct Record {
  kind: u8;
  body: switch [on = {kind}, cases = ({1} => Text)];
}
struct Text { c: u8; }
"#;

#[test]
fn test_unmatched_switch_stop_mode() {
    let s = schema(UNMATCHED_SWITCH);
    let err = decode(&[0x07], &s).expect_err("must fail");
    assert_eq!(err.kind, DecodeErrorKind::Structural);
    assert_eq!(err.field_path, "Root.records[0].body");
    assert!(err.field_path.contains("records") && err.field_path.contains("body"));
    assert_eq!(err.offset, 1);
    assert!(err.hint.is_some());
}

#[test]
fn test_unmatched_switch_continue_mode() {
    let s = schema(UNMATCHED_SWITCH);
    let (root, errors) = decode_with_recovery(&[0x07], &s, ErrorMode::Continue).expect("decode");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].field_path, "Root.records[0].body");
    let records = root.child("records").expect("records");
    assert_eq!(records.children().len(), 1);
    let element = &records.children()[0];
    assert!(element.is_error());
    assert_eq!(element.offset, 0);
    assert_eq!(element.size, 0);
}

#[test]
fn test_sibling_promotion_drives_later_elements() {
    let s = schema(
        r#"
        struct Root {
          items: Item [repeat = count, count = 2];
          after: u8 [if = {type == 2}];
        }
        struct Item {
          prev: virtual [value = {_index > 0 ? type : 0}];
          type: u8;
          body: switch [on = {type}, cases = ({1} => One, {2} => Two)];
        }
        struct One { a: u8; }
        struct Two { b: u16; }
        "#,
    );
    let root = decode(&[1, 0x11, 2, 0x22, 0x33, 0x44], &s).expect("decode");
    let items = root.child("items").expect("items").children();
    assert_eq!(items.len(), 2);
    assert_eq!(int(&items[0], "body.a"), 0x11);
    assert_eq!(int(&items[1], "body.b"), 0x3322);
    assert_eq!(int(&items[1], "prev"), 1);
    assert_eq!(int(&root, "after"), 0x44);
}

// ---------------------------------------------------------------- repeats

#[test]
fn test_count_repeat_exact_elements() {
    let s = schema("struct Root { n: u8; xs: u16 [repeat = count, count = {n}]; }");
    let root = decode(&[3, 1, 0, 2, 0, 3, 0], &s).expect("decode");
    let xs = root.child("xs").expect("xs");
    let values: Vec<i64> = xs.children().iter().filter_map(DecodedNode::as_int).collect();
    assert_eq!(values, vec![1, 2, 3]);
    assert_eq!(xs.children()[2].name, "xs[2]");
}

#[test]
fn test_count_beyond_data_fails_without_partial_array() {
    let s = schema("struct Root { n: u8; xs: u16 [repeat = count, count = {n}]; }");
    let err = decode(&[3, 1, 0, 2, 0], &s).expect_err("must fail");
    assert_eq!(err.kind, DecodeErrorKind::InsufficientData);
    assert_eq!(err.field_path, "Root.xs[2]");
    assert_eq!(err.offset, 5);
}

#[test]
fn test_scalar_array_binds_list() {
    let s = schema(
        "struct Root { xs: u8 [repeat = count, count = 3]; second: virtual [value = {xs[1]}]; }",
    );
    let root = decode(&[7, 8, 9], &s).expect("decode");
    assert_eq!(int(&root, "second"), 8);
}

#[test]
fn test_until_eof_drops_partial_element() {
    let s = schema("struct Root { recs: Rec [repeat = until_eof]; } struct Rec { a: u16; }");
    let (root, errors) = decode_with_recovery(&[1, 0, 2], &s, ErrorMode::Continue).expect("decode");
    assert!(errors.is_empty());
    assert_eq!(root.child("recs").expect("recs").children().len(), 1);
    assert_eq!(root.size, 2);
    assert!(decode(&[1, 0, 2], &s).is_ok());
}

#[test]
fn test_while_repeat_may_be_empty() {
    let s = schema("struct Root { n: u8; xs: u8 [repeat = while, while = {_index < n}]; rest: u8; }");
    let root = decode(&[0, 9], &s).expect("decode");
    assert!(root.child("xs").expect("xs").children().is_empty());
    assert_eq!(int(&root, "rest"), 9);

    let root = decode(&[2, 5, 6, 9], &s).expect("decode");
    assert_eq!(root.child("xs").expect("xs").children().len(), 2);
    assert_eq!(int(&root, "rest"), 9);
}

#[test]
fn test_until_value_includes_terminating_element() {
    let s = schema("struct Root { vals: u8 [repeat = until_value, until = {vals == 0}]; next: u8; }");
    let root = decode(&[5, 6, 0, 7], &s).expect("decode");
    assert_eq!(root.child("vals").expect("vals").children().len(), 3);
    assert_eq!(int(&root, "next"), 7);
}

#[test]
fn test_element_size_skips_trailing_bytes() {
    let s = schema(
        "struct Root { items: Item [repeat = count, count = 2, element_size = 3]; } struct Item { a: u8; }",
    );
    let root = decode(&[1, 9, 9, 2, 9, 9], &s).expect("decode");
    let items = root.child("items").expect("items").children();
    assert_eq!(int(&items[0], "a"), 1);
    assert_eq!(int(&items[1], "a"), 2);
    assert_eq!(items[1].offset, 3);
    assert_eq!(items[1].size, 3);
}

#[test]
fn test_element_window_overrun_fails() {
    let s = schema(
        "struct Root { items: Item [repeat = count, count = 1, element_size = 1]; } struct Item { a: u16; }",
    );
    let err = decode(&[1, 2, 3], &s).expect_err("must fail");
    assert_eq!(err.kind, DecodeErrorKind::InsufficientData);
    assert_eq!(err.field_path, "Root.items[0].a");
}

#[test]
fn test_per_element_seek_with_restore() {
    let s = schema(
        r#"struct Root {
          offs: u8 [repeat = count, count = 2];
          vals: u8 [repeat = count, count = 2, seek = {offs[_index]}, restore];
          tail: u8;
        }"#,
    );
    let root = decode(&[3, 2, 0xBB, 0xAA], &s).expect("decode");
    let vals: Vec<i64> = root
        .child("vals")
        .expect("vals")
        .children()
        .iter()
        .filter_map(DecodedNode::as_int)
        .collect();
    assert_eq!(vals, vec![0xAA, 0xBB]);
    let tail = root.child("tail").expect("tail");
    assert_eq!(tail.offset, 2);
    assert_eq!(tail.as_int(), Some(0xBB));
}

// ---------------------------------------------------------------- fields

#[test]
fn test_seek_restore_returns_cursor() {
    let s = schema("struct Root { off: u8; name: ascii [size = 3, seek = {off}, restore]; next: u8; }");
    let root = decode(&[4, 0x55, 0, 0, b'a', b'b', b'c'], &s).expect("decode");
    let name = root.child("name").expect("name");
    assert_eq!(name.as_str(), Some("abc"));
    assert_eq!(name.offset, 4);
    let next = root.child("next").expect("next");
    assert_eq!(next.offset, 1);
    assert_eq!(next.as_int(), Some(0x55));
}

#[test]
fn test_seek_out_of_range() {
    let s = schema("struct Root { x: u8 [seek = 10]; }");
    let err = decode(&[1, 2], &s).expect_err("must fail");
    assert_eq!(err.kind, DecodeErrorKind::Structural);
    assert!(err.message.contains("outside the buffer"));
}

#[test]
fn test_endianness_precedence() {
    let s = schema(
        r#"
        format E { endian: little; root: Root; }
        struct Root {
          a: u16;
          b: u16 [endian = big];
          inner: Inner;
          be: BigStruct;
        }
        struct Inner { c: u16; }
        struct BigStruct { @endian big; d: u16; sub: Inner; e: u16 [endian = little]; }
        "#,
    );
    let data = [1, 0, 0, 1, 1, 0, 0, 1, 0, 1, 1, 0];
    let root = decode(&data, &s).expect("decode");
    assert_eq!(int(&root, "a"), 1);
    assert_eq!(int(&root, "b"), 1);
    assert_eq!(int(&root, "inner.c"), 1);
    assert_eq!(int(&root, "be.d"), 1);
    // Inner inherits big from BigStruct.
    assert_eq!(int(&root, "be.sub.c"), 1);
    assert_eq!(int(&root, "be.e"), 1);
}

#[test]
fn test_dynamic_endianness() {
    let s = schema(
        r#"struct Tiff {
          @endian {bom == 'II' ? 'little' : 'big'};
          bom: ascii [size = 2];
          magic: u16;
        }"#,
    );
    let le = decode(b"II\x2a\x00", &s).expect("decode");
    assert_eq!(int(&le, "magic"), 42);
    let be = decode(b"MM\x00\x2a", &s).expect("decode");
    assert_eq!(int(&be, "magic"), 42);
}

#[test]
fn test_dynamic_endianness_must_name_byte_order() {
    let s = schema("struct Root { @endian {kind}; kind: u8; v: u16; }");
    let err = decode(&[1, 0, 0], &s).expect_err("must fail");
    assert!(err.message.contains("invalid value"));
    assert_eq!(err.field_path, "Root.v");
}

#[test]
fn test_struct_and_field_alignment() {
    let s = schema(
        r#"struct Root { a: u8; b: u8 [align = 4]; inner: Padded; }
        struct Padded { @align 8; c: u8; }"#,
    );
    let data = [1, 0, 0, 0, 2, 0, 0, 0, 3];
    let root = decode(&data, &s).expect("decode");
    assert_eq!(root.child("b").expect("b").offset, 4);
    assert_eq!(root.child("inner").expect("inner").offset, 5);
    assert_eq!(int(&root, "inner.c"), 3);
    assert_eq!(root.get("inner.c").expect("c").offset, 8);
}

#[test]
fn test_signed_and_float_fields() {
    let s = schema("struct Root { a: i8; b: i32; c: f32; d: f64 [endian = big]; }");
    let mut data = vec![0xFE];
    data.extend_from_slice(&(-100000i32).to_le_bytes());
    data.extend_from_slice(&1.5f32.to_le_bytes());
    data.extend_from_slice(&(-2.25f64).to_be_bytes());
    let root = decode(&data, &s).expect("decode");
    assert_eq!(int(&root, "a"), -2);
    assert_eq!(int(&root, "b"), -100000);
    match &root.child("c").expect("c").kind {
        NodeKind::Float { value, double } => {
            assert_eq!(*value, 1.5);
            assert!(!double);
        }
        other => panic!("expected float, got {:?}", other),
    }
    match &root.child("d").expect("d").kind {
        NodeKind::Float { value, .. } => assert_eq!(*value, -2.25),
        other => panic!("expected float, got {:?}", other),
    }
}

#[test]
fn test_string_encodings() {
    let s = schema(
        "struct Root { a: asciiz; b: utf16le [size = 4]; c: latin1 [size = 1]; d: utf8 [size = 4]; }",
    );
    let data = [b'h', b'i', 0, b'o', 0, b'k', 0, 0xE9, b'a', b'b', 0, 0];
    let root = decode(&data, &s).expect("decode");
    let a = root.child("a").expect("a");
    assert_eq!(a.as_str(), Some("hi"));
    assert_eq!(a.size, 3);
    assert_eq!(root.child("b").and_then(DecodedNode::as_str), Some("ok"));
    assert_eq!(root.child("c").and_then(DecodedNode::as_str), Some("é"));
    // Fixed strings keep their padding.
    assert_eq!(root.child("d").and_then(DecodedNode::as_str), Some("ab\0\0"));
}

#[test]
fn test_null_terminated_runs_to_scope_end() {
    let s = schema("struct Root { name: utf8z [size = 3]; tail: u8; }");
    let root = decode(b"abcd", &s).expect("decode");
    assert_eq!(root.child("name").and_then(DecodedNode::as_str), Some("abc"));
    assert_eq!(int(&root, "tail"), b'd' as i64);
}

#[test]
fn test_expected_bytes() {
    let s = schema(r#"struct Root { magic: bytes [size = 2, expect = x"CAFE"]; }"#);
    let ok = decode(&[0xCA, 0xFE], &s).expect("decode");
    assert!(matches!(
        ok.child("magic").expect("magic").kind,
        NodeKind::Bytes { matches_expected: Some(true), .. }
    ));
    let bad = decode(&[0xCA, 0xFF], &s).expect("decode");
    assert!(matches!(
        bad.child("magic").expect("magic").kind,
        NodeKind::Bytes { matches_expected: Some(false), .. }
    ));
}

#[test]
fn test_enum_and_flags() {
    let s = schema(
        r#"
        enum Kind { 1 => Text "plain text"; 2 => Blob; }
        flags Perms { read = 0x1; write = 0x2; exec = 0x4; }
        struct Root { kind: u8 [enum = Kind]; perms: u8 [flags = Perms]; other: u8 [enum = Kind]; }
        "#,
    );
    let root = decode(&[1, 5, 9], &s).expect("decode");
    match &root.child("kind").expect("kind").kind {
        NodeKind::Integer { enum_label: Some(l), .. } => {
            assert_eq!(l.label, "Text");
            assert_eq!(l.description.as_deref(), Some("plain text"));
        }
        other => panic!("expected labelled integer, got {:?}", other),
    }
    match &root.child("perms").expect("perms").kind {
        NodeKind::Flags { raw, flags } => {
            assert_eq!(*raw, 5);
            let set: Vec<&str> = flags.iter().filter(|f| f.set).map(|f| f.name.as_str()).collect();
            assert_eq!(set, vec!["read", "exec"]);
        }
        other => panic!("expected flags, got {:?}", other),
    }
    assert!(matches!(
        root.child("other").expect("other").kind,
        NodeKind::Integer { enum_label: None, .. }
    ));
}

#[test]
fn test_crc32_checksum() {
    let s = schema("struct Root { data: ascii [size = 9]; crc: u32 [checksum = crc32(data)]; }");
    let mut buf = b"123456789".to_vec();
    buf.extend_from_slice(&0xCBF4_3926u32.to_le_bytes());
    let root = decode(&buf, &s).expect("decode");
    match &root.child("crc").expect("crc").kind {
        NodeKind::Integer { checksum: Some(c), .. } => {
            assert!(c.valid);
            assert_eq!(c.expected, None);
        }
        other => panic!("expected checksum, got {:?}", other),
    }

    let mut bad = b"123456789".to_vec();
    bad.extend_from_slice(&[0, 0, 0, 0]);
    let root = decode(&bad, &s).expect("decode");
    match &root.child("crc").expect("crc").kind {
        NodeKind::Integer { checksum: Some(c), .. } => {
            assert!(!c.valid);
            assert_eq!(c.expected, Some(0xCBF4_3926));
        }
        other => panic!("expected checksum, got {:?}", other),
    }
}

#[test]
fn test_string_table_lookup() {
    let s = schema(
        r#"
        struct Root { strings: Strings; first: u8 [string_table = Strings]; second: u8 [string_table = Strings]; bad: u8 [string_table = Strings]; }
        struct Strings { @string_table; pool: bytes [size = 8]; }
        "#,
    );
    let mut data = b"foo\0bar\0".to_vec();
    data.extend_from_slice(&[0, 4, 40]);
    let root = decode(&data, &s).expect("decode");
    let lookup = |name: &str| match &root.child(name).expect("field").kind {
        NodeKind::Integer { string_ref, .. } => string_ref.clone(),
        other => panic!("expected integer, got {:?}", other),
    };
    assert_eq!(lookup("first").as_deref(), Some("foo"));
    assert_eq!(lookup("second").as_deref(), Some("bar"));
    assert_eq!(lookup("bad"), None);
}

#[test]
fn test_zlib_payload_decodes_struct() {
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    let mut enc = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(&[0x34, 0x12, b'x', b'y', b'z']).expect("compress");
    let z = enc.finish().expect("compress");

    let s = schema(
        r#"struct Root { len: u8; payload: zlib [size = {len}, struct = Inner]; tail: u8; }
        struct Inner { a: u16; b: ascii [size = 3]; }"#,
    );
    let mut data = vec![z.len() as u8];
    data.extend_from_slice(&z);
    data.push(0x99);
    let root = decode(&data, &s).expect("decode");
    match &root.child("payload").expect("payload").kind {
        NodeKind::Compressed {
            algorithm,
            compressed_size,
            decompressed_size,
            payload: CompressedPayload::Struct(inner),
        } => {
            assert_eq!(*algorithm, "zlib");
            assert_eq!(*compressed_size, z.len());
            assert_eq!(*decompressed_size, 5);
            assert_eq!(int(inner, "a"), 0x1234);
            assert_eq!(inner.get("b").and_then(DecodedNode::as_str), Some("xyz"));
            assert_eq!(inner.get("b").expect("b").offset, 2);
        }
        other => panic!("expected compressed struct, got {:?}", other),
    }
    assert_eq!(int(&root, "tail"), 0x99);
}

#[test]
fn test_bad_deflate_names_field() {
    let s = schema("struct Root { payload: deflate [size = 3]; }");
    let err = decode(&[0xFF, 0xFF, 0xFF], &s).expect_err("must fail");
    assert_eq!(err.kind, DecodeErrorKind::Decompression);
    assert_eq!(err.field_path, "Root.payload");
}

#[test]
fn test_virtual_and_validation() {
    let s = schema(
        r#"struct Root {
          w: u8; h: u8;
          area: virtual [value = {w * h}, validate = {area < 100}];
          kind: u8 [validate = {kind == 1}];
        }"#,
    );
    let root = decode(&[4, 5, 2], &s).expect("decode");
    let area = root.child("area").expect("area");
    assert_eq!(area.as_int(), Some(20));
    assert_eq!(area.size, 0);
    assert_eq!(area.offset, 2);
    assert_eq!(area.validation.as_ref().map(|v| v.passed), Some(true));
    let kind = root.child("kind").expect("kind");
    assert_eq!(kind.validation.as_ref().map(|v| v.passed), Some(false));
}

#[test]
fn test_undefined_variable_error() {
    let s = schema("struct Root { data: bytes [size = {missing}]; }");
    let err = decode(&[1, 2], &s).expect_err("must fail");
    assert_eq!(err.kind, DecodeErrorKind::Expression);
    assert!(err.message.contains("missing"));
    assert_eq!(err.field_path, "Root.data");
    assert_eq!(err.field_type.as_deref(), Some("bytes"));
    assert!(err.hint.is_some());
}

#[test]
fn test_until_marker_sizes_line() {
    let s = schema(
        r#"struct Root {
          line: ascii [size = {until_marker(0x0D, 0x0A)}];
          eol: bytes [size = 2];
          rest: ascii [size = remaining];
        }"#,
    );
    let root = decode(b"GET /\r\nok", &s).expect("decode");
    assert_eq!(root.child("line").and_then(DecodedNode::as_str), Some("GET /"));
    assert_eq!(root.child("rest").and_then(DecodedNode::as_str), Some("ok"));
}

#[test]
fn test_parse_int_drives_size() {
    let s = schema(
        r#"struct Root { size: ascii [size = 4]; body: bytes [size = {parse_int(size, 8)}]; }"#,
    );
    let root = decode(b"012\0abcdefghij", &s).expect("decode");
    assert_eq!(root.child("body").expect("body").size, 10);
}

#[test]
fn test_varint_limits() {
    let s = schema("struct Root { n: vlq; m: sleb128; }");
    let root = decode(&[0x81, 0x00, 0x7F], &s).expect("decode");
    assert_eq!(int(&root, "n"), 128);
    assert_eq!(int(&root, "m"), -1);

    let err = decode(&[0xFF; 12], &s).expect_err("must fail");
    assert_eq!(err.kind, DecodeErrorKind::Structural);
}

// ---------------------------------------------------------------- continue mode

#[test]
fn test_continue_skips_known_window() {
    let s = schema(
        r#"
        struct Root { hdr: Header [size = 4]; tail: u8; }
        struct Header { kind: u8; body: switch [on = {kind}, cases = ({1} => One)]; }
        struct One { a: u8; }
        "#,
    );
    let data = [9, 0, 0, 0, 0x7F];
    assert!(decode(&data, &s).is_err());

    let (root, errors) = decode_with_recovery(&data, &s, ErrorMode::Continue).expect("decode");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].field_path, "Root.hdr.body");
    let hdr = root.child("hdr").expect("hdr");
    assert!(hdr.is_error());
    assert_eq!(hdr.size, 4);
    let tail = root.child("tail").expect("tail");
    assert_eq!(tail.offset, 4);
    assert_eq!(tail.as_int(), Some(0x7F));
}

#[test]
fn test_continue_unknown_size_consumes_nothing() {
    let s = schema("struct Root { a: u8; data: bytes [size = {nope}]; b: u8; }");
    let (root, errors) = decode_with_recovery(&[1, 2], &s, ErrorMode::Continue).expect("decode");
    assert_eq!(errors.len(), 1);
    let data = root.child("data").expect("data");
    assert!(data.is_error());
    assert_eq!(data.size, 0);
    let b = root.child("b").expect("b");
    assert_eq!(b.offset, 1);
    assert_eq!(b.as_int(), Some(2));
}

#[test]
fn test_continue_keeps_decoding_elements_with_windows() {
    let s = schema(
        r#"
        struct Root { items: Item [repeat = count, count = 3, element_size = 2]; }
        struct Item { kind: u8; body: switch [on = {kind}, cases = ({1} => One)]; }
        struct One { a: u8; }
        "#,
    );
    let data = [1, 10, 5, 0, 1, 30];
    let (root, errors) = decode_with_recovery(&data, &s, ErrorMode::Continue).expect("decode");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].field_path, "Root.items[1].body");
    let items = root.child("items").expect("items").children();
    assert_eq!(items.len(), 3);
    assert!(items[1].is_error());
    assert_eq!(items[1].name, "items[1]");
    assert_eq!(int(&items[2], "body.a"), 30);
}

fn error_nodes(node: &DecodedNode) -> usize {
    let own = usize::from(node.is_error());
    own + node.children().iter().map(error_nodes).sum::<usize>()
}

#[test]
fn test_continue_skips_fixed_width_field() {
    let s = schema("struct Root { @endian {k}; k: u8; v: u16; w: u8; }");
    let (root, errors) =
        decode_with_recovery(&[1, 0xAA, 0xBB, 0xCC], &s, ErrorMode::Continue).expect("decode");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].field_path, "Root.v");
    let v = root.child("v").expect("v");
    assert!(v.is_error());
    assert_eq!((v.offset, v.size), (1, 2));
    let w = root.child("w").expect("w");
    assert_eq!(w.offset, 3);
    assert_eq!(w.as_int(), Some(0xCC));
}

#[test]
fn test_continue_failure_after_read_keeps_consumed_bytes() {
    let s = schema("struct Root { a: u8 [validate = {nope == 1}]; b: u8; }");
    let (root, errors) = decode_with_recovery(&[1, 2], &s, ErrorMode::Continue).expect("decode");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].field_path, "Root.a");
    assert_eq!(root.child("a").expect("a").size, 1);
    let b = root.child("b").expect("b");
    assert_eq!(b.offset, 1);
    assert_eq!(b.as_int(), Some(2));
}

#[test]
fn test_continue_fixed_width_elements_keep_going() {
    let s = schema("struct Root { @endian {k}; k: u8; xs: u16 [repeat = count, count = 2]; tail: u8; }");
    let data = [1, 0x10, 0x00, 0x20, 0x00, 0x7F];
    let (root, errors) = decode_with_recovery(&data, &s, ErrorMode::Continue).expect("decode");
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[1].field_path, "Root.xs[1]");
    assert_eq!(root.child("xs").expect("xs").children().len(), 2);
    assert_eq!(int(&root, "tail"), 0x7F);
}

#[test]
fn test_discarded_element_drops_its_errors() {
    let s = schema(
        r#"
        struct Root { recs: Rec [repeat = until_eof]; }
        struct Rec { n: u8; xs: u8 [repeat = count, count = {n}]; tail: u16; }
        "#,
    );
    let (root, errors) = decode_with_recovery(&[5, 1], &s, ErrorMode::Continue).expect("decode");
    assert!(errors.is_empty());
    assert!(root.child("recs").expect("recs").children().is_empty());
    assert_eq!(error_nodes(&root), 0);
}

#[test]
fn test_error_list_matches_error_nodes() {
    let s = schema(
        r#"
        struct Root { blk: Blk; }
        struct Blk { xs: u16 [repeat = count, count = 2]; check: u8; }
        "#,
    );
    let (root, errors) = decode_with_recovery(&[1], &s, ErrorMode::Continue).expect("decode");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].field_path, "Root.blk.check");
    assert_eq!(error_nodes(&root), errors.len());

    let s = schema(UNMATCHED_SWITCH);
    let (root, errors) = decode_with_recovery(&[1, 5, 7], &s, ErrorMode::Continue).expect("decode");
    assert_eq!(errors.len(), 1);
    assert_eq!(error_nodes(&root), errors.len());
}

#[test]
fn test_until_value_on_empty_scope() {
    let s = schema(
        r#"
        struct Root { len: u8; body: Body [size = {len}]; tail: u8; }
        struct Body { vals: u8 [repeat = until_value, until = {vals == 0}]; }
        "#,
    );
    let root = decode(&[0, 7], &s).expect("decode");
    assert!(root.get("body.vals").expect("vals").children().is_empty());
    assert_eq!(int(&root, "tail"), 7);
}

#[test]
fn test_continue_restored_seek_elements_are_independent() {
    let s = schema(
        r#"struct Root {
          offs: u8 [repeat = count, count = 3];
          vals: u16 [repeat = count, count = 3, seek = {offs[_index]}, restore];
          tail: u8;
        }"#,
    );
    let data = [4, 20, 6, 0xEE, 1, 0, 2, 0];
    let (root, errors) = decode_with_recovery(&data, &s, ErrorMode::Continue).expect("decode");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].field_path, "Root.vals[1]");
    let vals = root.child("vals").expect("vals").children();
    assert_eq!(vals.len(), 3);
    assert_eq!(vals[0].as_int(), Some(1));
    assert!(vals[1].is_error());
    assert_eq!(vals[2].as_int(), Some(2));
    assert_eq!(int(&root, "tail"), 0xEE);
}
