//! Parse schema source into a [`Schema`] using PEST.
//!
//! Expressions are parsed here, at load time, so a bad expression is reported
//! with the field it belongs to before any data is decoded.

use crate::expr::{self, Expression};
use crate::schema::*;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser as PestParser;
use std::path::Path;

#[derive(PestParser)]
#[grammar = "grammar.pest"]
struct SchemaParser;

/// Parse schema source into a [`Schema`] (names are not yet checked).
pub fn parse(source: &str) -> Result<Schema, SchemaError> {
    let pairs = SchemaParser::parse(Rule::schema, source)
        .map_err(|e| SchemaError::Syntax(format!("Parse error: {}", e)))?;
    let pair = pairs
        .into_iter()
        .next()
        .ok_or_else(|| SchemaError::Syntax("Empty parse".to_string()))?;
    build_schema(pair)
}

/// Parse and resolve schema source.
pub fn load(source: &str) -> Result<ResolvedSchema, SchemaError> {
    ResolvedSchema::resolve(parse(source)?)
}

/// Read, parse and resolve a schema file.
pub fn load_file(path: impl AsRef<Path>) -> Result<ResolvedSchema, SchemaError> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).map_err(|e| SchemaError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    load(&source)
}

fn invalid(msg: impl Into<String>) -> SchemaError {
    SchemaError::Invalid(msg.into())
}

fn build_schema(pair: Pair<Rule>) -> Result<Schema, SchemaError> {
    let mut name = String::from("schema");
    let mut endianness = Endianness::Little;
    let mut root = None;
    let mut enums = Vec::new();
    let mut flags = Vec::new();
    let mut structs = Vec::new();

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::format_decl => {
                let mut it = inner.into_inner();
                if let Some(n) = it.next() {
                    name = n.as_str().to_string();
                }
                for prop in it {
                    let mut kv = prop.into_inner();
                    let key = kv.next().map(|p| p.as_str()).unwrap_or_default();
                    let value = kv.next().map(|p| p.as_str()).unwrap_or_default();
                    match key {
                        "endian" => {
                            endianness = Endianness::from_name(value)
                                .ok_or_else(|| invalid(format!("format {}: bad endian '{}'", name, value)))?
                        }
                        "root" => root = Some(value.to_string()),
                        other => return Err(invalid(format!("format {}: unknown property '{}'", name, other))),
                    }
                }
            }
            Rule::enum_decl => enums.push(build_enum(inner)?),
            Rule::flags_decl => flags.push(build_flags(inner)?),
            Rule::struct_decl => structs.push(build_struct(inner)?),
            _ => {}
        }
    }

    // Without a format block the first struct is the root.
    let root = match root {
        Some(r) => r,
        None => structs
            .first()
            .map(|s: &StructDef| s.name.clone())
            .ok_or_else(|| invalid("schema declares no structs"))?,
    };

    Ok(Schema {
        name,
        endianness,
        enums,
        flags,
        structs,
        root,
    })
}

fn build_enum(pair: Pair<Rule>) -> Result<EnumDef, SchemaError> {
    let mut it = pair.into_inner();
    let name = it.next().map(|p| p.as_str().to_string()).ok_or_else(|| invalid("enum: missing name"))?;
    let mut variants = Vec::new();
    for entry in it {
        let mut e = entry.into_inner();
        let value = parse_integer(e.next().map(|p| p.as_str()).unwrap_or_default())?;
        let label = e
            .next()
            .map(|p| p.as_str().to_string())
            .ok_or_else(|| invalid(format!("enum {}: variant without label", name)))?;
        let description = e.next().map(|p| unquote(p.as_str()));
        variants.push(EnumVariant {
            value,
            label,
            description,
        });
    }
    Ok(EnumDef { name, variants })
}

fn build_flags(pair: Pair<Rule>) -> Result<FlagsDef, SchemaError> {
    let mut it = pair.into_inner();
    let name = it.next().map(|p| p.as_str().to_string()).ok_or_else(|| invalid("flags: missing name"))?;
    let mut flags = Vec::new();
    for entry in it {
        let mut e = entry.into_inner();
        let flag = e.next().map(|p| p.as_str().to_string()).unwrap_or_default();
        let mask = parse_integer(e.next().map(|p| p.as_str()).unwrap_or_default())? as u64;
        flags.push(FlagDef { name: flag, mask });
    }
    Ok(FlagsDef { name, flags })
}

fn build_struct(pair: Pair<Rule>) -> Result<StructDef, SchemaError> {
    let mut it = pair.into_inner();
    let name = it.next().map(|p| p.as_str().to_string()).ok_or_else(|| invalid("struct: missing name"))?;
    let mut def = StructDef::new(name, Vec::new());
    for inner in it {
        match inner.as_rule() {
            Rule::struct_prop => build_struct_prop(&mut def, inner)?,
            Rule::field_decl => def.fields.push(build_field(inner)?),
            _ => {}
        }
    }
    Ok(def)
}

fn build_struct_prop(def: &mut StructDef, pair: Pair<Rule>) -> Result<(), SchemaError> {
    let mut it = pair.into_inner();
    let key = it.next().map(|p| p.as_str().to_string()).unwrap_or_default();
    let value = it.next().and_then(|v| v.into_inner().next());
    let context = format!("{}.@{}", def.name, key);
    match (key.as_str(), value) {
        ("align", Some(v)) => def.align = Some(positive(&context, &v)?),
        ("endian", Some(v)) if v.as_rule() == Rule::expr => {
            def.endianness = Some(StructEndianness::Dynamic(parse_expr(&context, v.as_str())?))
        }
        ("endian", Some(v)) => {
            let e = Endianness::from_name(v.as_str())
                .ok_or_else(|| invalid(format!("{}: bad endian '{}'", context, v.as_str())))?;
            def.endianness = Some(StructEndianness::Static(e));
        }
        ("string_table", None) => def.string_table = true,
        _ => return Err(invalid(format!("{}: unknown or malformed struct property", context))),
    }
    Ok(())
}

/// Attribute name and the inner alternative of its value (`expr`, `integer`, ...).
type Attr<'i> = (String, Option<Pair<'i, Rule>>);

fn build_field(pair: Pair<Rule>) -> Result<FieldDef, SchemaError> {
    let mut it = pair.into_inner();
    let name = it.next().map(|p| p.as_str().to_string()).unwrap_or_default();
    let type_name = it.next().map(|p| p.as_str().to_string()).unwrap_or_default();
    let mut attrs: Vec<Attr> = Vec::new();
    if let Some(list) = it.next() {
        for attr in list.into_inner() {
            let mut a = attr.into_inner();
            let key = a.next().map(|p| p.as_str().to_string()).unwrap_or_default();
            let value = a.next().and_then(|v| v.into_inner().next());
            attrs.push((key, value));
        }
    }

    let field_type = build_field_type(&name, &type_name, &attrs)?;
    let mut field = FieldDef::new(name, field_type);
    let mut repeat_kind = None;
    let mut prefix = 1u8;

    for (key, value) in &attrs {
        let ctx = format!("{}.{}", field.name, key);
        match key.as_str() {
            // consumed by build_field_type
            "on" | "cases" | "default" | "bits" | "value" | "struct" => {}
            "size" => field.size = Some(size_spec(&ctx, required(&ctx, value)?)?),
            "element_size" => field.element_size = Some(size_spec(&ctx, required(&ctx, value)?)?),
            "repeat" => repeat_kind = Some(required(&ctx, value)?.as_str().to_string()),
            // companions of `repeat`, read below
            "count" | "while" | "until" => {}
            "prefix" => {
                let width = positive(&ctx, required(&ctx, value)?)?;
                prefix = match width {
                    1 | 2 | 4 | 8 => width as u8,
                    _ => return Err(invalid(format!("{}: prefix width must be 1, 2, 4 or 8", ctx))),
                };
            }
            "if" => field.condition = Some(expr_attr(&ctx, required(&ctx, value)?)?),
            "seek" => field.seek = Some(expr_attr(&ctx, required(&ctx, value)?)?),
            "restore" => {
                field.seek_restore = match value {
                    None => true,
                    Some(v) => match v.as_str() {
                        "true" => true,
                        "false" => false,
                        other => return Err(invalid(format!("{}: expected true or false, got '{}'", ctx, other))),
                    },
                }
            }
            "endian" => {
                let v = required(&ctx, value)?;
                field.endianness = Some(
                    Endianness::from_name(v.as_str())
                        .ok_or_else(|| invalid(format!("{}: bad endian '{}'", ctx, v.as_str())))?,
                );
            }
            "align" => field.align = Some(positive(&ctx, required(&ctx, value)?)?),
            "checksum" => field.checksum = Some(checksum_spec(&ctx, required(&ctx, value)?)?),
            "validate" => field.validate = Some(expr_attr(&ctx, required(&ctx, value)?)?),
            "enum" => field.enum_ref = Some(required(&ctx, value)?.as_str().to_string()),
            "flags" => field.flags_ref = Some(required(&ctx, value)?.as_str().to_string()),
            "string_table" => field.string_table = Some(required(&ctx, value)?.as_str().to_string()),
            "expect" => field.expected = Some(hex_bytes(&ctx, required(&ctx, value)?)?),
            other => return Err(invalid(format!("{}: unknown attribute '{}'", field.name, other))),
        }
    }

    if let Some(kind) = repeat_kind {
        let ctx = format!("{}.repeat", field.name);
        let companion = |key: &str| -> Result<Expression, SchemaError> {
            let value = find_attr(&attrs, key)
                .ok_or_else(|| invalid(format!("{}: repeat = {} needs a '{}' attribute", ctx, kind, key)))?;
            expr_attr(&ctx, required(&ctx, value)?)
        };
        field.repeat = match kind.as_str() {
            "count" => RepeatMode::Count(companion("count")?),
            "until_eof" => RepeatMode::UntilEof,
            "while" => RepeatMode::While(companion("while")?),
            "until_value" => RepeatMode::UntilValue(companion("until")?),
            "length_prefixed" => RepeatMode::LengthPrefixed(prefix),
            other => return Err(invalid(format!("{}: unknown repeat mode '{}'", ctx, other))),
        };
    }
    Ok(field)
}

fn build_field_type(name: &str, type_name: &str, attrs: &[Attr]) -> Result<FieldType, SchemaError> {
    let ty = match type_name {
        "u8" => FieldType::U8,
        "u16" => FieldType::U16,
        "u32" => FieldType::U32,
        "u64" => FieldType::U64,
        "i8" => FieldType::I8,
        "i16" => FieldType::I16,
        "i32" => FieldType::I32,
        "i64" => FieldType::I64,
        "f32" => FieldType::F32,
        "f64" => FieldType::F64,
        "bytes" => FieldType::Bytes,
        "uleb128" => FieldType::Uleb128,
        "sleb128" => FieldType::Sleb128,
        "vlq" => FieldType::Vlq,
        "zlib" | "deflate" => FieldType::Compressed {
            algorithm: if type_name == "zlib" { Compression::Zlib } else { Compression::Deflate },
            target: find_attr(attrs, "struct").and_then(|v| v.as_ref()).map(|p| p.as_str().to_string()),
        },
        "virtual" => {
            let ctx = format!("{}.value", name);
            let value = find_attr(attrs, "value").ok_or_else(|| invalid(format!("{}: virtual field needs 'value'", name)))?;
            FieldType::Virtual(expr_attr(&ctx, required(&ctx, value)?)?)
        }
        "switch" => FieldType::Switch(switch_spec(name, attrs)?),
        "bitfield" => {
            let ctx = format!("{}.bits", name);
            let bits = find_attr(attrs, "bits").ok_or_else(|| invalid(format!("{}: bitfield needs 'bits'", name)))?;
            FieldType::Bitfield(bit_entries(&ctx, required(&ctx, bits)?)?)
        }
        other => {
            if let Some(enc) = StringEncoding::from_name(other) {
                FieldType::String(enc)
            } else if let Some(enc) = other.strip_suffix('z').and_then(StringEncoding::from_name) {
                FieldType::StringZ(enc)
            } else {
                FieldType::Struct(other.to_string())
            }
        }
    };
    Ok(ty)
}

fn switch_spec(name: &str, attrs: &[Attr]) -> Result<SwitchSpec, SchemaError> {
    let ctx = format!("{}.on", name);
    let on = find_attr(attrs, "on").ok_or_else(|| invalid(format!("{}: switch needs 'on'", name)))?;
    let on = expr_attr(&ctx, required(&ctx, on)?)?;
    let mut cases = Vec::new();
    if let Some(list) = find_attr(attrs, "cases") {
        let ctx = format!("{}.cases", name);
        let list = required(&ctx, list)?;
        if list.as_rule() != Rule::case_list {
            return Err(invalid(format!("{}: expected ({{expr}} => Struct, ...)", ctx)));
        }
        for arm in list.clone().into_inner() {
            let mut a = arm.into_inner();
            let condition = parse_expr(&ctx, a.next().map(|p| p.as_str()).unwrap_or_default())?;
            let target = a.next().map(|p| p.as_str().to_string()).unwrap_or_default();
            cases.push(SwitchCase { condition, target });
        }
    }
    let default = find_attr(attrs, "default").and_then(|v| v.as_ref()).map(|p| p.as_str().to_string());
    Ok(SwitchSpec { on, cases, default })
}

fn bit_entries(ctx: &str, pair: &Pair<Rule>) -> Result<Vec<BitEntryDef>, SchemaError> {
    if pair.as_rule() != Rule::bit_list {
        return Err(invalid(format!("{}: expected (name high:low, ...)", ctx)));
    }
    let mut out = Vec::new();
    for entry in pair.clone().into_inner() {
        let mut e = entry.into_inner();
        let name = e.next().map(|p| p.as_str().to_string()).unwrap_or_default();
        let high = parse_integer(e.next().map(|p| p.as_str()).unwrap_or_default())?;
        let low = parse_integer(e.next().map(|p| p.as_str()).unwrap_or_default())?;
        if low < 0 || high < low || high > 63 {
            return Err(invalid(format!("{}: bad bit range {}:{} for '{}'", ctx, high, low, name)));
        }
        let enum_ref = e.next().map(|p| p.as_str().to_string());
        out.push(BitEntryDef {
            name,
            high: high as u32,
            low: low as u32,
            enum_ref,
        });
    }
    Ok(out)
}

fn checksum_spec(ctx: &str, pair: &Pair<Rule>) -> Result<ChecksumSpec, SchemaError> {
    if pair.as_rule() != Rule::name_list {
        return Err(invalid(format!("{}: expected crc32(field, ...)", ctx)));
    }
    let mut names = pair.clone().into_inner().map(|p| p.as_str().to_string());
    let algorithm = match names.next().as_deref() {
        Some("crc32") => ChecksumAlgorithm::Crc32,
        other => {
            return Err(invalid(format!(
                "{}: unsupported checksum algorithm '{}'",
                ctx,
                other.unwrap_or_default()
            )))
        }
    };
    Ok(ChecksumSpec {
        algorithm,
        fields: names.collect(),
    })
}

fn find_attr<'a, 'i>(attrs: &'a [Attr<'i>], key: &str) -> Option<&'a Option<Pair<'i, Rule>>> {
    attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

fn required<'a, 'i>(ctx: &str, value: &'a Option<Pair<'i, Rule>>) -> Result<&'a Pair<'i, Rule>, SchemaError> {
    value.as_ref().ok_or_else(|| invalid(format!("{}: missing value", ctx)))
}

fn parse_expr(ctx: &str, text: &str) -> Result<Expression, SchemaError> {
    expr::parse(text).map_err(|source| SchemaError::Expression {
        field: ctx.to_string(),
        source,
    })
}

/// `{expr}`, a bare integer or a bare identifier, all parsed as expressions.
fn expr_attr(ctx: &str, pair: &Pair<Rule>) -> Result<Expression, SchemaError> {
    match pair.as_rule() {
        Rule::expr | Rule::integer | Rule::ident => parse_expr(ctx, pair.as_str()),
        _ => Err(invalid(format!("{}: expected an expression, got '{}'", ctx, pair.as_str()))),
    }
}

fn size_spec(ctx: &str, pair: &Pair<Rule>) -> Result<SizeSpec, SchemaError> {
    match pair.as_rule() {
        Rule::integer => {
            let n = parse_integer(pair.as_str())?;
            if n < 0 {
                return Err(invalid(format!("{}: size must not be negative", ctx)));
            }
            Ok(SizeSpec::Fixed(n as u64))
        }
        Rule::ident if pair.as_str() == "remaining" => Ok(SizeSpec::Remaining),
        _ => Ok(SizeSpec::Expr(expr_attr(ctx, pair)?)),
    }
}

fn positive(ctx: &str, pair: &Pair<Rule>) -> Result<u64, SchemaError> {
    if pair.as_rule() != Rule::integer {
        return Err(invalid(format!("{}: expected an integer, got '{}'", ctx, pair.as_str())));
    }
    match parse_integer(pair.as_str())? {
        n if n > 0 => Ok(n as u64),
        n => Err(invalid(format!("{}: expected a positive integer, got {}", ctx, n))),
    }
}

fn hex_bytes(ctx: &str, pair: &Pair<Rule>) -> Result<Vec<u8>, SchemaError> {
    let digits = pair
        .as_str()
        .strip_prefix("x\"")
        .and_then(|s| s.strip_suffix('"'))
        .filter(|_| pair.as_rule() == Rule::hex_bytes)
        .ok_or_else(|| invalid(format!("{}: expected x\"..\" hex bytes", ctx)))?;
    if digits.len() % 2 != 0 {
        return Err(invalid(format!("{}: odd number of hex digits", ctx)));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16).map_err(|e| invalid(format!("{}: {}", ctx, e)))
        })
        .collect()
}

fn parse_integer(text: &str) -> Result<i64, SchemaError> {
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = match body.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => body.parse::<u64>(),
    }
    .map_err(|e| invalid(format!("bad integer '{}': {}", text, e)))? as i64;
    Ok(if negative { magnitude.wrapping_neg() } else { magnitude })
}

fn unquote(s: &str) -> String {
    s.trim_matches('"').to_string()
}
