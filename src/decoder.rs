//! Structural decoder: walks a [`ResolvedSchema`] against a byte buffer and
//! builds a [`DecodedNode`] tree.
//!
//! Each field goes through the same steps: condition, seek, endianness,
//! alignment, byte window, type dispatch, binding, restore. Repeated fields
//! wrap the per-value steps in a loop that pushes one variable frame per
//! iteration with `_index` bound.
//!
//! ## Error modes
//!
//! - [`ErrorMode::Stop`]: the first failure is returned as a [`DecodeError`]
//!   carrying the byte offset and dotted field path (`Root.records[2].body`).
//! - [`ErrorMode::Continue`]: failures are caught at the root struct's fields
//!   and at every repeat iteration. The failed field or element becomes an
//!   error node, the error is recorded, and decoding resumes at the end of the
//!   failed field's window when it was known, at its start otherwise.
//!
//! Both modes share one fallible per-field function; only the handlers at
//! the recovery points differ.

use crate::context::{crc32, extract_bits, ContextError, DecodeContext};
use crate::expr::eval::values_equal;
use crate::expr::{evaluate, evaluate_as_bool, evaluate_as_long, ExprError, Expression};
use crate::node::{
    BitEntryValue, ChecksumOutcome, CompressedPayload, DecodedNode, EnumLabel, FlagState, NodeKind,
    ValidationOutcome,
};
use crate::schema::{
    ChecksumAlgorithm, Compression, Endianness, FieldDef, FieldType, RepeatMode, ResolvedSchema, SizeSpec,
    StructDef, StructEndianness, SwitchSpec,
};
use crate::value::RuntimeValue;
use flate2::read::{DeflateDecoder, ZlibDecoder};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    #[default]
    Stop,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// Scope or buffer exhausted before a read completed.
    InsufficientData,
    /// Expression failed to evaluate.
    Expression,
    /// Unmatched switch, bad endianness/alignment/seek/size, varint or bitfield limits.
    Structural,
    Decompression,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message} at offset {offset} (field '{field_path}')")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub message: String,
    pub offset: usize,
    pub field_path: String,
    pub field_type: Option<String>,
    pub hint: Option<String>,
}

/// Why a field failed, before it is tied to a position and path.
#[derive(Debug, thiserror::Error)]
enum Failure {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Expr(#[from] ExprError),
    #[error("no switch case matched discriminant {0} and no default is declared")]
    NoSwitchMatch(String),
    #[error("invalid value for endianness: {0} (expected 'little' or 'big')")]
    InvalidEndianness(String),
    #[error("seek target {target} is outside the buffer (length {len})")]
    SeekOutOfRange { target: i64, len: usize },
    #[error("invalid size {0}")]
    InvalidSize(i64),
    #[error("invalid repeat count {0}")]
    InvalidCount(i64),
    #[error("decompression failed: {0}")]
    Decompression(String),
    #[error("unknown struct: {0}")]
    UnknownStruct(String),
}

impl Failure {
    fn kind(&self) -> DecodeErrorKind {
        match self {
            Failure::Context(ContextError::InsufficientData { .. }) => DecodeErrorKind::InsufficientData,
            Failure::Expr(_) => DecodeErrorKind::Expression,
            Failure::Decompression(_) => DecodeErrorKind::Decompression,
            _ => DecodeErrorKind::Structural,
        }
    }

    fn hint(&self) -> Option<&'static str> {
        match self {
            Failure::Context(ContextError::InsufficientData { .. }) => {
                Some("the data may be truncated, or a size or count expression exceeds the available bytes")
            }
            Failure::Context(ContextError::VarIntTooLong { .. }) => {
                Some("the bytes at this offset are not a valid variable-length integer")
            }
            Failure::Expr(ExprError::UndefinedVariable(_)) => {
                Some("fields are only visible after they are decoded; check field order and conditions")
            }
            Failure::NoSwitchMatch(_) => Some("add a case for this value or declare a default"),
            Failure::InvalidEndianness(_) => Some("the endianness expression must evaluate to 'little' or 'big'"),
            Failure::SeekOutOfRange { .. } => Some("check the seek expression against the buffer length"),
            Failure::Decompression(_) => {
                Some("the compressed window may be truncated or use a different algorithm")
            }
            _ => None,
        }
    }
}

enum PathSegment {
    Field(String),
    Index(usize),
}

/// Position bookkeeping for one field or element attempt, used to pick the
/// resume point when the attempt fails in Continue mode.
struct FieldAttempt {
    start: usize,
    window_end: Option<usize>,
    /// Cursor after the value itself decoded; later steps may still fail.
    consumed: Option<usize>,
    restore: bool,
}

impl FieldAttempt {
    fn new(start: usize) -> Self {
        FieldAttempt {
            start,
            window_end: None,
            consumed: None,
            restore: false,
        }
    }

    fn note_window(&mut self, end: usize) {
        if self.window_end.is_none() {
            self.window_end = Some(end);
        }
    }

    fn note_consumed(&mut self, end: usize) {
        self.consumed = Some(end);
    }

    fn resume_position(&self) -> usize {
        if self.restore {
            self.start
        } else {
            self.consumed.or(self.window_end).unwrap_or(self.start)
        }
    }
}

/// The struct whose fields are being decoded and the endianness it inherits.
struct StructFrame<'d> {
    def: &'d StructDef,
    inherited: Endianness,
}

/// Decode `buffer` with the schema's root struct, stopping at the first failure.
pub fn decode(buffer: &[u8], schema: &ResolvedSchema) -> Result<DecodedNode, DecodeError> {
    let root = schema.schema.root.clone();
    Decoder::new(schema, ErrorMode::Stop).run(buffer, &root).map(|(node, _)| node)
}

/// Decode `buffer` in `mode`, returning the tree and the failures recovered from.
pub fn decode_with_recovery(
    buffer: &[u8],
    schema: &ResolvedSchema,
    mode: ErrorMode,
) -> Result<(DecodedNode, Vec<DecodeError>), DecodeError> {
    let root = schema.schema.root.clone();
    Decoder::new(schema, mode).run(buffer, &root)
}

pub struct Decoder<'s> {
    schema: &'s ResolvedSchema,
    mode: ErrorMode,
    path: Vec<PathSegment>,
    errors: Vec<DecodeError>,
    /// Raw bytes of the most recent decode of each string-table struct.
    string_tables: HashMap<String, Vec<u8>>,
}

impl<'s> Decoder<'s> {
    pub fn new(schema: &'s ResolvedSchema, mode: ErrorMode) -> Self {
        Decoder {
            schema,
            mode,
            path: Vec::new(),
            errors: Vec::new(),
            string_tables: HashMap::new(),
        }
    }

    /// Decode `buffer` starting with struct `root`.
    pub fn run(mut self, buffer: &[u8], root: &str) -> Result<(DecodedNode, Vec<DecodeError>), DecodeError> {
        let mut ctx = DecodeContext::new(buffer, self.schema.schema.endianness);
        self.path.push(PathSegment::Field(root.to_string()));
        let def = self
            .lookup_struct(root)
            .map_err(|f| self.error(f, 0, None))?;
        let recover = self.mode == ErrorMode::Continue;
        let inherited = ctx.endianness();
        let node = self.decode_struct(&mut ctx, def, root, inherited, recover)?;
        self.path.pop();
        tracing::debug!(size = node.size, errors = self.errors.len(), "decode finished");
        Ok((node, self.errors))
    }

    // ------------------------------------------------------------------ errors

    fn path_string(&self) -> String {
        let mut out = String::new();
        for seg in &self.path {
            match seg {
                PathSegment::Field(name) => {
                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push_str(name);
                }
                PathSegment::Index(i) => {
                    let _ = write!(out, "[{}]", i);
                }
            }
        }
        out
    }

    fn error(&self, failure: Failure, offset: usize, field_type: Option<String>) -> DecodeError {
        DecodeError {
            kind: failure.kind(),
            message: failure.to_string(),
            offset,
            field_path: self.path_string(),
            field_type,
            hint: failure.hint().map(str::to_string),
        }
    }

    /// Attach the current position, path and `field`'s type to a failed result.
    fn at<T, E: Into<Failure>>(
        &self,
        result: Result<T, E>,
        ctx: &DecodeContext<'_>,
        field: &FieldDef,
    ) -> Result<T, DecodeError> {
        result.map_err(|e| self.error(e.into(), ctx.position(), Some(field.field_type.label())))
    }

    fn lookup_struct(&self, name: &str) -> Result<&'s StructDef, Failure> {
        let schema: &'s ResolvedSchema = self.schema;
        schema
            .get_struct(name)
            .ok_or_else(|| Failure::UnknownStruct(name.to_string()))
    }

    // ------------------------------------------------------------------ structs

    fn decode_struct(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        def: &StructDef,
        name: &str,
        inherited: Endianness,
        recover: bool,
    ) -> Result<DecodedNode, DecodeError> {
        if let Some(align) = def.align {
            ctx.align_to(align as i64)
                .map_err(|e| self.error(e.into(), ctx.position(), Some(def.name.clone())))?;
        }
        let start = ctx.position();
        ctx.push_frame();
        let frame = StructFrame { def, inherited };
        let mut children: Vec<DecodedNode> = Vec::with_capacity(def.fields.len());
        for field in &def.fields {
            let mark = ctx.mark();
            let errors_mark = self.errors.len();
            let mut attempt = FieldAttempt::new(ctx.position());
            match self.decode_field(ctx, field, &frame, &children, &mut attempt) {
                Ok(Some(node)) => children.push(node),
                Ok(None) => {}
                Err(err) if recover => {
                    let resume = attempt.resume_position();
                    ctx.rewind(&mark, resume);
                    // The failed field's own error nodes are gone with it.
                    self.errors.truncate(errors_mark);
                    tracing::debug!(field = %field.name, offset = err.offset, resume, "recovered from field failure");
                    children.push(error_node(&field.name, attempt.start, resume, &err));
                    self.errors.push(err);
                }
                Err(err) => return Err(err),
            }
        }
        ctx.pop_frame();
        let end = ctx.position();
        if def.string_table {
            tracing::debug!(table = %def.name, start, end, "registered string table");
            self.string_tables
                .insert(def.name.clone(), ctx.slice(start, end).to_vec());
        }
        Ok(DecodedNode::new(
            name,
            start,
            end.saturating_sub(start),
            NodeKind::Struct {
                type_name: def.name.clone(),
                children,
            },
        ))
    }

    // ------------------------------------------------------------------ fields

    fn decode_field(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        field: &FieldDef,
        frame: &StructFrame<'_>,
        siblings: &[DecodedNode],
        attempt: &mut FieldAttempt,
    ) -> Result<Option<DecodedNode>, DecodeError> {
        self.path.push(PathSegment::Field(field.name.clone()));
        let result = self.decode_field_steps(ctx, field, frame, siblings, attempt);
        self.path.pop();
        result
    }

    fn decode_field_steps(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        field: &FieldDef,
        frame: &StructFrame<'_>,
        siblings: &[DecodedNode],
        attempt: &mut FieldAttempt,
    ) -> Result<Option<DecodedNode>, DecodeError> {
        tracing::trace!(field = %field.name, offset = ctx.position(), "decode field");
        if let Some(cond) = &field.condition {
            if !self.at(evaluate_as_bool(cond, ctx), ctx, field)? {
                return Ok(None);
            }
        }

        let repeated = !matches!(field.repeat, RepeatMode::None);
        let per_element_seek = repeated && field.seek.as_ref().map_or(false, |s| s.references("_index"));
        let mut saved = None;
        if let Some(seek) = field.seek.as_ref().filter(|_| !per_element_seek) {
            let target = self.seek_target(ctx, field, seek)?;
            saved = Some(self.at(ctx.enter_seek(target), ctx, field)?);
            attempt.restore = field.seek_restore;
        }

        if let Some(align) = field.align {
            self.at(ctx.align_to(align as i64), ctx, field)?;
        }

        let mut node = if repeated {
            self.decode_repeated(ctx, field, frame, siblings, per_element_seek)?
        } else {
            let node = self.decode_value(ctx, field, frame, siblings, attempt)?;
            bind_node(ctx, &field.name, &node);
            node
        };
        attempt.note_consumed(ctx.position());

        if let Some(saved) = saved {
            self.at(ctx.leave_seek(saved, field.seek_restore), ctx, field)?;
            attempt.note_consumed(ctx.position());
        }

        if let Some(expr) = &field.validate {
            let passed = self.at(evaluate_as_bool(expr, ctx), ctx, field)?;
            node.validation = Some(ValidationOutcome {
                expression: expr.source.clone(),
                passed,
            });
        }
        Ok(Some(node))
    }

    fn seek_target(
        &self,
        ctx: &DecodeContext<'_>,
        field: &FieldDef,
        expr: &Expression,
    ) -> Result<usize, DecodeError> {
        let target = self.at(evaluate_as_long(expr, ctx), ctx, field)?;
        let len = ctx.buffer().len();
        if target < 0 || target as u64 > len as u64 {
            return Err(self.error(
                Failure::SeekOutOfRange { target, len },
                ctx.position(),
                Some(field.field_type.label()),
            ));
        }
        Ok(target as usize)
    }

    fn window_len(&self, ctx: &DecodeContext<'_>, field: &FieldDef, spec: &SizeSpec) -> Result<usize, DecodeError> {
        match spec {
            SizeSpec::Fixed(n) => Ok(*n as usize),
            SizeSpec::Remaining => Ok(ctx.remaining()),
            SizeSpec::Expr(expr) => {
                let n = self.at(evaluate_as_long(expr, ctx), ctx, field)?;
                if n < 0 {
                    return Err(self.error(Failure::InvalidSize(n), ctx.position(), Some(field.field_type.label())));
                }
                Ok(n as usize)
            }
        }
    }

    /// Effective endianness: field override, struct static, struct dynamic,
    /// then the endianness inherited from the parent (the format default at the root).
    fn endianness_for(
        &self,
        ctx: &DecodeContext<'_>,
        field: &FieldDef,
        frame: &StructFrame<'_>,
    ) -> Result<Endianness, DecodeError> {
        if let Some(e) = field.endianness {
            return Ok(e);
        }
        match &frame.def.endianness {
            Some(StructEndianness::Static(e)) => Ok(*e),
            Some(StructEndianness::Dynamic(expr)) => {
                let v = self.at(evaluate(expr, ctx), ctx, field)?;
                match v.as_str() {
                    Some("little") => Ok(Endianness::Little),
                    Some("big") => Ok(Endianness::Big),
                    _ => Err(self.error(
                        Failure::InvalidEndianness(v.to_string()),
                        ctx.position(),
                        Some(field.field_type.label()),
                    )),
                }
            }
            None => Ok(frame.inherited),
        }
    }

    /// Endianness a nested struct inherits; only resolved when the child
    /// does not declare its own.
    fn inherited_for(
        &self,
        ctx: &DecodeContext<'_>,
        field: &FieldDef,
        frame: &StructFrame<'_>,
        child: &StructDef,
    ) -> Result<Endianness, DecodeError> {
        if child.endianness.is_some() && field.endianness.is_none() {
            return Ok(frame.inherited);
        }
        self.endianness_for(ctx, field, frame)
    }

    /// Steps 5 and 6: byte window and type dispatch for one value.
    fn decode_value(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        field: &FieldDef,
        frame: &StructFrame<'_>,
        siblings: &[DecodedNode],
        attempt: &mut FieldAttempt,
    ) -> Result<DecodedNode, DecodeError> {
        let start = ctx.position();
        if let FieldType::Virtual(expr) = &field.field_type {
            let value = self.at(evaluate(expr, ctx), ctx, field)?;
            return Ok(DecodedNode::new(&field.name, start, 0, NodeKind::Virtual { value }));
        }
        let window = match &field.size {
            Some(spec) => Some(self.window_len(ctx, field, spec)?),
            None if field.field_type.needs_window() => Some(ctx.remaining()),
            None => None,
        };
        if let Some(len) = window {
            self.at(ctx.push_scope(len), ctx, field)?;
            attempt.note_window(start + len);
        } else if let Some(width) = field.field_type.fixed_width() {
            attempt.note_window(start + width.min(ctx.remaining()));
        }
        let kind = self.decode_kind(ctx, field, frame, siblings)?;
        if window.is_some() {
            self.at(ctx.pop_scope(), ctx, field)?;
        }
        let end = ctx.position();
        Ok(DecodedNode::new(&field.name, start, end.saturating_sub(start), kind))
    }

    fn decode_kind(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        field: &FieldDef,
        frame: &StructFrame<'_>,
        siblings: &[DecodedNode],
    ) -> Result<NodeKind, DecodeError> {
        match &field.field_type {
            FieldType::U8 => self.read_integer(ctx, field, frame, siblings, 1, false),
            FieldType::U16 => self.read_integer(ctx, field, frame, siblings, 2, false),
            FieldType::U32 => self.read_integer(ctx, field, frame, siblings, 4, false),
            FieldType::U64 => self.read_integer(ctx, field, frame, siblings, 8, false),
            FieldType::I8 => self.read_integer(ctx, field, frame, siblings, 1, true),
            FieldType::I16 => self.read_integer(ctx, field, frame, siblings, 2, true),
            FieldType::I32 => self.read_integer(ctx, field, frame, siblings, 4, true),
            FieldType::I64 => self.read_integer(ctx, field, frame, siblings, 8, true),
            FieldType::F32 => {
                let e = self.endianness_for(ctx, field, frame)?;
                let value = self.at(ctx.read_f32(e), ctx, field)? as f64;
                Ok(NodeKind::Float { value, double: false })
            }
            FieldType::F64 => {
                let e = self.endianness_for(ctx, field, frame)?;
                let value = self.at(ctx.read_f64(e), ctx, field)?;
                Ok(NodeKind::Float { value, double: true })
            }
            FieldType::String(encoding) => {
                let value = self.at(ctx.read_string(ctx.remaining(), *encoding), ctx, field)?;
                Ok(NodeKind::String { value, encoding: *encoding })
            }
            FieldType::StringZ(encoding) => {
                let value = self.at(ctx.read_string_z(*encoding), ctx, field)?;
                Ok(NodeKind::String { value, encoding: *encoding })
            }
            FieldType::Bytes => {
                let data = self.at(ctx.read_bytes(ctx.remaining()), ctx, field)?.to_vec();
                let matches_expected = field.expected.as_ref().map(|want| *want == data);
                Ok(NodeKind::Bytes { data, matches_expected })
            }
            FieldType::Struct(name) => {
                let def = self.lookup_struct(name).map_err(|f| {
                    self.error(f, ctx.position(), Some(field.field_type.label()))
                })?;
                let inherited = self.inherited_for(ctx, field, frame, def)?;
                Ok(self.decode_struct(ctx, def, &field.name, inherited, false)?.kind)
            }
            FieldType::Switch(spec) => {
                let target = self.select_case(ctx, field, spec)?;
                let def = self.lookup_struct(target).map_err(|f| {
                    self.error(f, ctx.position(), Some(field.field_type.label()))
                })?;
                let inherited = self.inherited_for(ctx, field, frame, def)?;
                Ok(self.decode_struct(ctx, def, &field.name, inherited, false)?.kind)
            }
            FieldType::Bitfield(entries) => {
                let size = ctx.remaining();
                let e = if size > 1 { self.endianness_for(ctx, field, frame)? } else { ctx.endianness() };
                let raw = self.at(ctx.read_bitfield(size, e), ctx, field)?;
                let mut out = Vec::with_capacity(entries.len());
                for entry in entries {
                    let value = self.at(extract_bits(raw, size, entry.high, entry.low), ctx, field)?;
                    out.push(BitEntryValue {
                        name: entry.name.clone(),
                        high: entry.high,
                        low: entry.low,
                        value,
                        enum_label: entry
                            .enum_ref
                            .as_deref()
                            .and_then(|en| self.enum_label(en, value as i64)),
                    });
                }
                Ok(NodeKind::Bitfield { raw, entries: out })
            }
            FieldType::Compressed { algorithm, target } => {
                let input = self.at(ctx.read_bytes(ctx.remaining()), ctx, field)?;
                let data = self.at(inflate(*algorithm, input), ctx, field)?;
                let payload = match target {
                    Some(name) => {
                        let def = self.lookup_struct(name).map_err(|f| {
                            self.error(f, ctx.position(), Some(field.field_type.label()))
                        })?;
                        let inherited = self.inherited_for(ctx, field, frame, def)?;
                        let mut sub = ctx.fork(&data);
                        let node = self.decode_struct(&mut sub, def, &field.name, inherited, false)?;
                        CompressedPayload::Struct(Box::new(node))
                    }
                    None => CompressedPayload::Raw(data.clone()),
                };
                Ok(NodeKind::Compressed {
                    algorithm: algorithm.name(),
                    compressed_size: input.len(),
                    decompressed_size: data.len(),
                    payload,
                })
            }
            FieldType::Uleb128 => {
                let v = self.at(ctx.read_uleb128(), ctx, field)? as i64;
                Ok(self.integer_kind(ctx, field, siblings, v))
            }
            FieldType::Sleb128 => {
                let v = self.at(ctx.read_sleb128(), ctx, field)?;
                Ok(self.integer_kind(ctx, field, siblings, v))
            }
            FieldType::Vlq => {
                let v = self.at(ctx.read_vlq(), ctx, field)? as i64;
                Ok(self.integer_kind(ctx, field, siblings, v))
            }
            FieldType::Virtual(expr) => {
                let value = self.at(evaluate(expr, ctx), ctx, field)?;
                Ok(NodeKind::Virtual { value })
            }
        }
    }

    fn read_integer(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        field: &FieldDef,
        frame: &StructFrame<'_>,
        siblings: &[DecodedNode],
        width: usize,
        signed: bool,
    ) -> Result<NodeKind, DecodeError> {
        let e = if width > 1 { self.endianness_for(ctx, field, frame)? } else { ctx.endianness() };
        let value = if signed {
            self.at(ctx.read_int(width, e), ctx, field)?
        } else {
            self.at(ctx.read_uint(width, e), ctx, field)? as i64
        };
        Ok(self.integer_kind(ctx, field, siblings, value))
    }

    /// Integer node with enum label, checksum outcome and string-table lookup attached.
    /// A `flags` reference turns it into a flags node.
    fn integer_kind(
        &self,
        ctx: &DecodeContext<'_>,
        field: &FieldDef,
        siblings: &[DecodedNode],
        value: i64,
    ) -> NodeKind {
        if let Some(def) = field.flags_ref.as_deref().and_then(|n| self.schema.get_flags(n)) {
            let raw = value as u64;
            let flags = def
                .flags
                .iter()
                .map(|f| FlagState {
                    name: f.name.clone(),
                    mask: f.mask,
                    set: raw & f.mask != 0,
                })
                .collect();
            return NodeKind::Flags { raw, flags };
        }
        let checksum = field.checksum.as_ref().map(|spec| {
            let mut data = Vec::new();
            for name in &spec.fields {
                if let Some(node) = siblings.iter().rev().find(|n| n.name == *name) {
                    data.extend_from_slice(ctx.slice(node.offset, node.end()));
                }
            }
            let computed = match spec.algorithm {
                ChecksumAlgorithm::Crc32 => crc32(&data) as u64,
            };
            let valid = computed == value as u64;
            ChecksumOutcome {
                algorithm: spec.algorithm.name(),
                valid,
                expected: if valid { None } else { Some(computed) },
            }
        });
        let string_ref = field
            .string_table
            .as_deref()
            .and_then(|t| self.string_tables.get(t))
            .and_then(|table| lookup_cstr(table, value));
        NodeKind::Integer {
            value,
            enum_label: field.enum_ref.as_deref().and_then(|en| self.enum_label(en, value)),
            checksum,
            string_ref,
        }
    }

    fn enum_label(&self, enum_name: &str, value: i64) -> Option<EnumLabel> {
        let variant = self.schema.get_enum(enum_name)?.lookup(value)?;
        Some(EnumLabel {
            label: variant.label.clone(),
            description: variant.description.clone(),
        })
    }

    /// First case whose value equals the discriminant (or whose condition is
    /// true), else the default.
    fn select_case<'f>(
        &self,
        ctx: &DecodeContext<'_>,
        field: &FieldDef,
        spec: &'f SwitchSpec,
    ) -> Result<&'f str, DecodeError> {
        let on = self.at(evaluate(&spec.on, ctx), ctx, field)?;
        for case in &spec.cases {
            let v = self.at(evaluate(&case.condition, ctx), ctx, field)?;
            let hit = match (&v, &on) {
                (RuntimeValue::Bool(b), d) if !matches!(d, RuntimeValue::Bool(_)) => *b,
                _ => values_equal(&v, &on),
            };
            if hit {
                tracing::debug!(field = %field.name, discriminant = %on, target = %case.target, "switch case selected");
                return Ok(case.target.as_str());
            }
        }
        match &spec.default {
            Some(target) => Ok(target.as_str()),
            None => Err(self.error(
                Failure::NoSwitchMatch(on.to_string()),
                ctx.position(),
                Some(field.field_type.label()),
            )),
        }
    }

    // ------------------------------------------------------------------ repeats

    fn decode_repeated(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        field: &FieldDef,
        frame: &StructFrame<'_>,
        siblings: &[DecodedNode],
        per_element_seek: bool,
    ) -> Result<DecodedNode, DecodeError> {
        let start = ctx.position();
        let count = match &field.repeat {
            RepeatMode::Count(expr) => {
                let n = self.at(evaluate_as_long(expr, ctx), ctx, field)?;
                if n < 0 {
                    return Err(self.error(Failure::InvalidCount(n), start, Some(field.field_type.label())));
                }
                n as usize
            }
            _ => 0,
        };
        let composite = field.field_type.is_composite();
        let mut elements: Vec<DecodedNode> = Vec::new();
        let mut index = 0usize;
        loop {
            match &field.repeat {
                RepeatMode::Count(_) if index >= count => break,
                RepeatMode::UntilEof | RepeatMode::UntilValue(_) | RepeatMode::LengthPrefixed(_)
                    if ctx.remaining() == 0 =>
                {
                    break
                }
                _ => {}
            }
            ctx.push_frame();
            ctx.bind_local("_index", RuntimeValue::Int(index as i64));
            if let RepeatMode::While(expr) = &field.repeat {
                if !self.at(evaluate_as_bool(expr, ctx), ctx, field)? {
                    ctx.pop_frame();
                    break;
                }
            }

            let mark = ctx.mark();
            let errors_mark = self.errors.len();
            let mut attempt = FieldAttempt::new(ctx.position());
            if composite {
                ctx.begin_capture();
            }
            self.path.push(PathSegment::Index(index));
            let result = self.decode_element(ctx, field, frame, siblings, index, per_element_seek, &mut attempt);
            self.path.pop();

            match result {
                Ok(Some(node)) => {
                    if composite {
                        let captured = ctx.end_capture();
                        ctx.promote(captured);
                    }
                    let stop = match &field.repeat {
                        RepeatMode::UntilValue(expr) => self.at(evaluate_as_bool(expr, ctx), ctx, field)?,
                        _ => false,
                    };
                    ctx.pop_frame();
                    elements.push(node);
                    index += 1;
                    if stop {
                        break;
                    }
                }
                Ok(None) => {
                    if composite {
                        ctx.end_capture();
                    }
                    ctx.pop_frame();
                    break;
                }
                Err(err)
                    if err.kind == DecodeErrorKind::InsufficientData
                        && matches!(field.repeat, RepeatMode::UntilEof) =>
                {
                    ctx.rewind(&mark, attempt.start);
                    self.errors.truncate(errors_mark);
                    ctx.pop_frame();
                    tracing::debug!(field = %field.name, index, "until_eof stopped at exhausted element");
                    break;
                }
                Err(err) if self.mode == ErrorMode::Continue => {
                    let resume = attempt.resume_position();
                    ctx.rewind(&mark, resume);
                    self.errors.truncate(errors_mark);
                    ctx.pop_frame();
                    tracing::debug!(field = %field.name, index, resume, "recovered from element failure");
                    elements.push(error_node(&element_name(field, index), attempt.start, resume, &err));
                    self.errors.push(err);
                    index += 1;
                    // Restored per-element seeks locate each element independently.
                    let independent = per_element_seek
                        && field.seek_restore
                        && matches!(field.repeat, RepeatMode::Count(_) | RepeatMode::While(_));
                    if resume <= attempt.start && !independent {
                        break;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        if !composite {
            let list: Vec<RuntimeValue> = elements.iter().filter_map(DecodedNode::scalar).collect();
            ctx.set_variable(field.name.clone(), RuntimeValue::List(list));
        }

        let end = ctx.position();
        let (offset, size) = match (per_element_seek, elements.first()) {
            (true, Some(first)) => {
                let lo = elements.iter().map(|e| e.offset).min().unwrap_or(first.offset);
                let hi = elements.iter().map(DecodedNode::end).max().unwrap_or(first.end());
                (lo, hi - lo)
            }
            _ => (start, end.saturating_sub(start)),
        };
        tracing::debug!(field = %field.name, elements = elements.len(), "repeat finished");
        Ok(DecodedNode::new(&field.name, offset, size, NodeKind::Array { elements }))
    }

    /// One repeat iteration: per-element seek, length prefix or element window,
    /// then the value itself. `Ok(None)` marks a zero length prefix (terminator).
    #[allow(clippy::too_many_arguments)]
    fn decode_element(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        field: &FieldDef,
        frame: &StructFrame<'_>,
        siblings: &[DecodedNode],
        index: usize,
        per_element_seek: bool,
        attempt: &mut FieldAttempt,
    ) -> Result<Option<DecodedNode>, DecodeError> {
        let mut saved = None;
        if let Some(seek) = field.seek.as_ref().filter(|_| per_element_seek) {
            let target = self.seek_target(ctx, field, seek)?;
            saved = Some(self.at(ctx.enter_seek(target), ctx, field)?);
            attempt.restore = field.seek_restore;
        }

        let window = match (&field.repeat, &field.element_size) {
            (RepeatMode::LengthPrefixed(width), _) => {
                let width = *width as usize;
                let e = if width > 1 { self.endianness_for(ctx, field, frame)? } else { ctx.endianness() };
                let len = self.at(ctx.read_uint(width, e), ctx, field)?;
                if len == 0 {
                    if let Some(saved) = saved {
                        self.at(ctx.leave_seek(saved, field.seek_restore), ctx, field)?;
                    }
                    return Ok(None);
                }
                Some(len as usize)
            }
            (_, Some(spec)) => Some(self.window_len(ctx, field, spec)?),
            _ => None,
        };

        let window_start = ctx.position();
        if let Some(len) = window {
            self.at(ctx.push_scope(len), ctx, field)?;
            attempt.note_window(window_start + len);
        }
        let mut node = self.decode_value(ctx, field, frame, siblings, attempt)?;
        if let Some(len) = window {
            self.at(ctx.pop_scope(), ctx, field)?;
            node.offset = window_start;
            node.size = len;
        }
        attempt.note_consumed(ctx.position());
        node.name = element_name(field, index);
        bind_node(ctx, &field.name, &node);

        if let Some(saved) = saved {
            self.at(ctx.leave_seek(saved, field.seek_restore), ctx, field)?;
        }
        Ok(Some(node))
    }
}

fn element_name(field: &FieldDef, index: usize) -> String {
    format!("{}[{}]", field.name, index)
}

fn error_node(name: &str, start: usize, resume: usize, err: &DecodeError) -> DecodedNode {
    DecodedNode::new(
        name,
        start,
        resume.saturating_sub(start),
        NodeKind::Error {
            message: err.message.clone(),
            field_type: err.field_type.clone(),
        },
    )
}

/// Bind a node's scalar value under `name`; bitfields also bind each entry by its own name.
fn bind_node(ctx: &mut DecodeContext<'_>, name: &str, node: &DecodedNode) {
    if let Some(v) = node.scalar() {
        ctx.set_variable(name, v);
    }
    if let NodeKind::Bitfield { entries, .. } = &node.kind {
        for entry in entries {
            ctx.set_variable(entry.name.clone(), RuntimeValue::Int(entry.value as i64));
        }
    }
}

/// Null-terminated string at `offset` in a string table; None when out of range.
fn lookup_cstr(table: &[u8], offset: i64) -> Option<String> {
    if offset < 0 || offset as u64 >= table.len() as u64 {
        return None;
    }
    let rest = &table[offset as usize..];
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    Some(String::from_utf8_lossy(&rest[..end]).into_owned())
}

fn inflate(algorithm: Compression, input: &[u8]) -> Result<Vec<u8>, Failure> {
    let mut out = Vec::new();
    let result = match algorithm {
        Compression::Zlib => ZlibDecoder::new(input).read_to_end(&mut out),
        Compression::Deflate => DeflateDecoder::new(input).read_to_end(&mut out),
    };
    result.map_err(|e| Failure::Decompression(e.to_string()))?;
    Ok(out)
}
