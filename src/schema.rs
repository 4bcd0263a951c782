//! Schema data model: formats, structs, fields, enums and flags.
//!
//! A [`Schema`] is plain data (built by [`crate::parser`] or by hand);
//! [`ResolvedSchema`] indexes it by name for the decoder.

use crate::expr::Expression;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

impl Endianness {
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "big" | "be" => Some(Endianness::Big),
            "little" | "le" => Some(Endianness::Little),
            _ => None,
        }
    }
}

/// Root schema: default endianness, enum/flags tables, structs and root struct name.
#[derive(Debug, Clone)]
pub struct Schema {
    pub name: String,
    pub endianness: Endianness,
    pub enums: Vec<EnumDef>,
    pub flags: Vec<FlagsDef>,
    pub structs: Vec<StructDef>,
    pub root: String,
}

#[derive(Debug, Clone)]
pub struct EnumDef {
    pub name: String,
    pub variants: Vec<EnumVariant>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumVariant {
    pub value: i64,
    pub label: String,
    pub description: Option<String>,
}

impl EnumDef {
    pub fn lookup(&self, value: i64) -> Option<&EnumVariant> {
        self.variants.iter().find(|v| v.value == value)
    }
}

#[derive(Debug, Clone)]
pub struct FlagsDef {
    pub name: String,
    pub flags: Vec<FlagDef>,
}

#[derive(Debug, Clone)]
pub struct FlagDef {
    pub name: String,
    pub mask: u64,
}

/// Struct-level endianness override.
#[derive(Debug, Clone)]
pub enum StructEndianness {
    Static(Endianness),
    /// Evaluated per use; must yield `'little'` or `'big'`.
    Dynamic(Expression),
}

#[derive(Debug, Clone)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub align: Option<u64>,
    pub endianness: Option<StructEndianness>,
    /// Decoded bytes of this struct are a pool of null-terminated strings.
    pub string_table: bool,
}

impl StructDef {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        StructDef {
            name: name.into(),
            fields,
            align: None,
            endianness: None,
            string_table: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringEncoding {
    Ascii,
    Utf8,
    Utf16Le,
    Utf16Be,
    ShiftJis,
    Latin1,
}

impl StringEncoding {
    pub fn name(self) -> &'static str {
        match self {
            StringEncoding::Ascii => "ascii",
            StringEncoding::Utf8 => "utf8",
            StringEncoding::Utf16Le => "utf16le",
            StringEncoding::Utf16Be => "utf16be",
            StringEncoding::ShiftJis => "sjis",
            StringEncoding::Latin1 => "latin1",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "ascii" => Some(StringEncoding::Ascii),
            "utf8" => Some(StringEncoding::Utf8),
            "utf16le" => Some(StringEncoding::Utf16Le),
            "utf16be" => Some(StringEncoding::Utf16Be),
            "sjis" => Some(StringEncoding::ShiftJis),
            "latin1" => Some(StringEncoding::Latin1),
            _ => None,
        }
    }

    /// Size of the terminator for null-terminated forms.
    pub fn code_unit(self) -> usize {
        match self {
            StringEncoding::Utf16Le | StringEncoding::Utf16Be => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Zlib,
    Deflate,
}

impl Compression {
    pub fn name(self) -> &'static str {
        match self {
            Compression::Zlib => "zlib",
            Compression::Deflate => "deflate",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwitchCase {
    pub condition: Expression,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct SwitchSpec {
    pub on: Expression,
    pub cases: Vec<SwitchCase>,
    pub default: Option<String>,
}

/// One named bit range of a bitfield, `high..=low` with bit 0 least significant.
#[derive(Debug, Clone)]
pub struct BitEntryDef {
    pub name: String,
    pub high: u32,
    pub low: u32,
    pub enum_ref: Option<String>,
}

/// Field type tag.
#[derive(Debug, Clone)]
pub enum FieldType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Fixed-size string; the window is the field size.
    String(StringEncoding),
    /// Null-terminated string.
    StringZ(StringEncoding),
    Bytes,
    Struct(String),
    Switch(SwitchSpec),
    Bitfield(Vec<BitEntryDef>),
    Compressed {
        algorithm: Compression,
        target: Option<String>,
    },
    Uleb128,
    Sleb128,
    Vlq,
    /// Computed value; consumes no bytes.
    Virtual(Expression),
}

impl FieldType {
    /// `(width, signed)` for fixed-width integers.
    pub fn int_width(&self) -> Option<(usize, bool)> {
        match self {
            FieldType::U8 => Some((1, false)),
            FieldType::U16 => Some((2, false)),
            FieldType::U32 => Some((4, false)),
            FieldType::U64 => Some((8, false)),
            FieldType::I8 => Some((1, true)),
            FieldType::I16 => Some((2, true)),
            FieldType::I32 => Some((4, true)),
            FieldType::I64 => Some((8, true)),
            _ => None,
        }
    }

    /// Byte width of fixed-width integers and floats.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            FieldType::F32 => Some(4),
            FieldType::F64 => Some(8),
            other => other.int_width().map(|(width, _)| width),
        }
    }

    /// Whether decoding this type yields a struct node (and so participates in promotion).
    pub fn is_composite(&self) -> bool {
        matches!(self, FieldType::Struct(_) | FieldType::Switch(_))
    }

    /// Types that decode a byte window and need a size (or an enclosing element window).
    pub fn needs_window(&self) -> bool {
        matches!(
            self,
            FieldType::String(_) | FieldType::Bytes | FieldType::Bitfield(_) | FieldType::Compressed { .. }
        )
    }

    pub fn label(&self) -> String {
        match self {
            FieldType::U8 => "u8".into(),
            FieldType::U16 => "u16".into(),
            FieldType::U32 => "u32".into(),
            FieldType::U64 => "u64".into(),
            FieldType::I8 => "i8".into(),
            FieldType::I16 => "i16".into(),
            FieldType::I32 => "i32".into(),
            FieldType::I64 => "i64".into(),
            FieldType::F32 => "f32".into(),
            FieldType::F64 => "f64".into(),
            FieldType::String(e) => e.name().into(),
            FieldType::StringZ(e) => format!("{}z", e.name()),
            FieldType::Bytes => "bytes".into(),
            FieldType::Struct(name) => name.clone(),
            FieldType::Switch(_) => "switch".into(),
            FieldType::Bitfield(_) => "bitfield".into(),
            FieldType::Compressed { algorithm, .. } => algorithm.name().into(),
            FieldType::Uleb128 => "uleb128".into(),
            FieldType::Sleb128 => "sleb128".into(),
            FieldType::Vlq => "vlq".into(),
            FieldType::Virtual(_) => "virtual".into(),
        }
    }
}

/// Byte window of a field or of each repeated element.
#[derive(Debug, Clone)]
pub enum SizeSpec {
    Fixed(u64),
    Expr(Expression),
    /// Everything left in the current scope.
    Remaining,
}

#[derive(Debug, Clone, Default)]
pub enum RepeatMode {
    #[default]
    None,
    Count(Expression),
    UntilEof,
    While(Expression),
    UntilValue(Expression),
    /// Length prefix width in bytes; a zero prefix terminates the stream.
    LengthPrefixed(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Crc32,
}

impl ChecksumAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Crc32 => "crc32",
        }
    }
}

/// Checksum over the raw bytes of prior sibling fields, compared to the field's value.
#[derive(Debug, Clone)]
pub struct ChecksumSpec {
    pub algorithm: ChecksumAlgorithm,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub size: Option<SizeSpec>,
    pub element_size: Option<SizeSpec>,
    pub repeat: RepeatMode,
    pub condition: Option<Expression>,
    pub seek: Option<Expression>,
    pub seek_restore: bool,
    pub endianness: Option<Endianness>,
    pub align: Option<u64>,
    pub checksum: Option<ChecksumSpec>,
    pub validate: Option<Expression>,
    pub enum_ref: Option<String>,
    pub flags_ref: Option<String>,
    pub string_table: Option<String>,
    /// Expected raw bytes for `bytes` fields (magic numbers).
    pub expected: Option<Vec<u8>>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        FieldDef {
            name: name.into(),
            field_type,
            size: None,
            element_size: None,
            repeat: RepeatMode::None,
            condition: None,
            seek: None,
            seek_restore: false,
            endianness: None,
            align: None,
            checksum: None,
            validate: None,
            enum_ref: None,
            flags_ref: None,
            string_table: None,
            expected: None,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SchemaError {
    #[error("schema syntax: {0}")]
    Syntax(String),
    #[error("field {field}: bad expression: {source}")]
    Expression {
        field: String,
        #[source]
        source: crate::expr::ExprError,
    },
    #[error("duplicate {kind} name: {name}")]
    Duplicate { kind: &'static str, name: String },
    #[error("{context}: unknown {kind} '{name}'")]
    UnknownReference {
        context: String,
        kind: &'static str,
        name: String,
    },
    #[error("{0}")]
    Invalid(String),
    #[error("cannot read {path}: {message}")]
    Io { path: String, message: String },
}

/// Schema indexed by name.
#[derive(Debug, Clone)]
pub struct ResolvedSchema {
    pub schema: Schema,
    structs_by_name: HashMap<String, usize>,
    enums_by_name: HashMap<String, usize>,
    flags_by_name: HashMap<String, usize>,
}

impl ResolvedSchema {
    /// Index `schema` and check that every name it references exists.
    pub fn resolve(schema: Schema) -> Result<Self, SchemaError> {
        let structs_by_name = index(schema.structs.iter().map(|s| &s.name), "struct")?;
        let enums_by_name = index(schema.enums.iter().map(|e| &e.name), "enum")?;
        let flags_by_name = index(schema.flags.iter().map(|f| &f.name), "flags")?;
        let resolved = ResolvedSchema {
            schema,
            structs_by_name,
            enums_by_name,
            flags_by_name,
        };
        resolved.check_references()?;
        Ok(resolved)
    }

    pub fn root(&self) -> Option<&StructDef> {
        self.get_struct(&self.schema.root)
    }

    pub fn get_struct(&self, name: &str) -> Option<&StructDef> {
        self.structs_by_name.get(name).map(|&i| &self.schema.structs[i])
    }

    pub fn get_enum(&self, name: &str) -> Option<&EnumDef> {
        self.enums_by_name.get(name).map(|&i| &self.schema.enums[i])
    }

    pub fn get_flags(&self, name: &str) -> Option<&FlagsDef> {
        self.flags_by_name.get(name).map(|&i| &self.schema.flags[i])
    }

    fn check_references(&self) -> Result<(), SchemaError> {
        if self.root().is_none() {
            return Err(SchemaError::UnknownReference {
                context: format!("format {}", self.schema.name),
                kind: "root struct",
                name: self.schema.root.clone(),
            });
        }
        for s in &self.schema.structs {
            for f in &s.fields {
                let context = format!("{}.{}", s.name, f.name);
                let need_struct = |name: &str| -> Result<(), SchemaError> {
                    if self.get_struct(name).is_none() {
                        return Err(SchemaError::UnknownReference {
                            context: context.clone(),
                            kind: "struct",
                            name: name.to_string(),
                        });
                    }
                    Ok(())
                };
                match &f.field_type {
                    FieldType::Struct(name) => need_struct(name)?,
                    FieldType::Switch(spec) => {
                        for c in &spec.cases {
                            need_struct(&c.target)?;
                        }
                        if let Some(d) = &spec.default {
                            need_struct(d)?;
                        }
                    }
                    FieldType::Compressed { target: Some(t), .. } => need_struct(t)?,
                    FieldType::Bitfield(entries) => {
                        for e in entries {
                            if let Some(en) = &e.enum_ref {
                                self.need_enum(&context, en)?;
                            }
                        }
                    }
                    _ => {}
                }
                if let Some(en) = &f.enum_ref {
                    self.need_enum(&context, en)?;
                }
                if let Some(fl) = &f.flags_ref {
                    if self.get_flags(fl).is_none() {
                        return Err(SchemaError::UnknownReference {
                            context: context.clone(),
                            kind: "flags",
                            name: fl.clone(),
                        });
                    }
                }
                if let Some(t) = &f.string_table {
                    need_struct(t)?;
                }
            }
        }
        Ok(())
    }

    fn need_enum(&self, context: &str, name: &str) -> Result<(), SchemaError> {
        if self.get_enum(name).is_none() {
            return Err(SchemaError::UnknownReference {
                context: context.to_string(),
                kind: "enum",
                name: name.to_string(),
            });
        }
        Ok(())
    }
}

fn index<'a>(
    names: impl Iterator<Item = &'a String>,
    kind: &'static str,
) -> Result<HashMap<String, usize>, SchemaError> {
    let mut out = HashMap::new();
    for (i, name) in names.enumerate() {
        if out.insert(name.clone(), i).is_some() {
            return Err(SchemaError::Duplicate { kind, name: name.clone() });
        }
    }
    Ok(out)
}
