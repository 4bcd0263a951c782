//! Decoder fuzz target: decode arbitrary bytes with a fixed schema that
//! exercises windows, repeats, switches and varints, in both error modes.
//! Build with: cargo fuzz run decode_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;

#[cfg(fuzzing)]
const SCHEMA: &str = r#"
format Fuzz { endian: big; root: Root; }
struct Root {
  count: u8;
  records: Record [repeat = count, count = {count}];
  tail: Chunk [repeat = length_prefixed];
}
struct Record {
  kind: u8;
  len: uleb128;
  body: switch [on = {kind}, cases = ({1} => Text, {2} => Bits), default = Raw, size = {len}];
}
struct Text { s: utf8z; }
struct Bits { b: bitfield [size = 2, bits = (hi 15:8, lo 7:0)]; }
struct Raw { data: bytes [size = remaining]; }
struct Chunk { v: vlq; }
"#;

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    if let Ok(schema) = binschema::load(SCHEMA) {
        let _ = binschema::decode(data, &schema);
        let _ = binschema::decode_with_recovery(data, &schema, binschema::ErrorMode::Continue);
    }
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run decode_fuzz");
}
