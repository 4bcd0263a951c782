//! Decode context: the byte buffer, cursor, nested read scopes and variable frames.
//!
//! All mutable decode state lives here, so independent decodes of the same
//! schema and buffer can run concurrently on separate contexts.
//!
//! - **Scopes** bound reads to a byte window. A read never crosses the end of
//!   the innermost scope even if the buffer has more bytes. Popping a scope
//!   moves the cursor to `start + len` regardless of what was read.
//! - **Frames** hold variable bindings. Lookups search innermost to
//!   outermost, so inner bindings shadow outer ones and vanish on pop.
//! - **Captures** record every binding made while active; the decoder uses
//!   them to promote a struct array element's fields to the enclosing frame.

use crate::schema::{Endianness, StringEncoding};
use crate::value::RuntimeValue;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::collections::HashMap;

/// Maximum bytes of a ULEB128/SLEB128/VLQ value.
pub const MAX_VARINT_BYTES: usize = 10;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContextError {
    #[error("insufficient data: need {needed} byte(s) at offset {offset}, {available} available")]
    InsufficientData {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("invalid alignment: {0} (must be a positive integer)")]
    InvalidAlignment(i64),
    #[error("scope stack underflow")]
    ScopeUnderflow,
    #[error("{encoding} value exceeds maximum length of {MAX_VARINT_BYTES} bytes")]
    VarIntTooLong { encoding: &'static str },
    #[error("bitfield container must be 1 to 8 bytes, got {0}")]
    InvalidBitfieldSize(usize),
    #[error("invalid bit range [{high}:{low}] for a {bits}-bit container")]
    InvalidBitRange { high: u32, low: u32, bits: u32 },
    #[error("position {position} is outside the buffer (length {len})")]
    OutOfBounds { position: usize, len: usize },
}

#[derive(Debug, Clone, Copy)]
struct Scope {
    start: usize,
    len: usize,
    /// Seek scopes cover `[target, buffer end)` and do not move the cursor on exit.
    seek: bool,
}

impl Scope {
    fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Stack depths used to unwind the context after a recovered failure.
#[derive(Debug, Clone, Copy)]
pub struct ContextMark {
    pub position: usize,
    scopes: usize,
    frames: usize,
    captures: usize,
}

pub struct DecodeContext<'a> {
    buf: &'a [u8],
    pos: usize,
    endianness: Endianness,
    scopes: Vec<Scope>,
    frames: Vec<HashMap<String, RuntimeValue>>,
    captures: Vec<HashMap<String, RuntimeValue>>,
}

impl<'a> DecodeContext<'a> {
    pub fn new(buf: &'a [u8], endianness: Endianness) -> Self {
        DecodeContext {
            buf,
            pos: 0,
            endianness,
            scopes: Vec::new(),
            frames: vec![HashMap::new()],
            captures: Vec::new(),
        }
    }

    /// New context over `buf` that starts with a copy of this context's bindings.
    pub fn fork<'b>(&self, buf: &'b [u8]) -> DecodeContext<'b> {
        let mut flat = HashMap::new();
        for frame in &self.frames {
            for (k, v) in frame {
                flat.insert(k.clone(), v.clone());
            }
        }
        DecodeContext {
            buf,
            pos: 0,
            endianness: self.endianness,
            scopes: Vec::new(),
            frames: vec![flat],
            captures: Vec::new(),
        }
    }

    pub fn buffer(&self) -> &'a [u8] {
        self.buf
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn set_position(&mut self, pos: usize) -> Result<(), ContextError> {
        if pos > self.buf.len() {
            return Err(ContextError::OutOfBounds { position: pos, len: self.buf.len() });
        }
        self.pos = pos;
        Ok(())
    }

    fn scope_start(&self) -> usize {
        self.scopes.last().map_or(0, |s| s.start)
    }

    fn scope_end(&self) -> usize {
        self.scopes.last().map_or(self.buf.len(), Scope::end)
    }

    /// Bytes left in the innermost scope (or the buffer when no scope is pushed).
    pub fn remaining(&self) -> usize {
        self.scope_end().saturating_sub(self.pos)
    }

    /// The unread bytes of the innermost scope, without consuming them.
    pub fn peek_remaining(&self) -> &'a [u8] {
        let end = self.scope_end();
        if self.pos >= end {
            return &[];
        }
        &self.buf[self.pos..end]
    }

    pub fn slice(&self, start: usize, end: usize) -> &'a [u8] {
        let end = end.min(self.buf.len());
        &self.buf[start.min(end)..end]
    }

    // ---------------------------------------------------------------- scopes

    pub fn push_scope(&mut self, len: usize) -> Result<(), ContextError> {
        self.ensure(len)?;
        self.scopes.push(Scope { start: self.pos, len, seek: false });
        Ok(())
    }

    pub fn pop_scope(&mut self) -> Result<(), ContextError> {
        let scope = self.scopes.pop().ok_or(ContextError::ScopeUnderflow)?;
        if !scope.seek {
            self.pos = scope.end();
        }
        Ok(())
    }

    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    /// Relocate the cursor to the absolute `target` inside a seek scope covering
    /// the rest of the buffer. Returns the position to restore afterwards.
    pub fn enter_seek(&mut self, target: usize) -> Result<usize, ContextError> {
        if target > self.buf.len() {
            return Err(ContextError::OutOfBounds { position: target, len: self.buf.len() });
        }
        let saved = self.pos;
        self.scopes.push(Scope { start: target, len: self.buf.len() - target, seek: true });
        self.pos = target;
        Ok(saved)
    }

    /// Leave the innermost seek scope; with `restore` the cursor returns to `saved`.
    pub fn leave_seek(&mut self, saved: usize, restore: bool) -> Result<(), ContextError> {
        match self.scopes.last() {
            Some(s) if s.seek => {
                self.scopes.pop();
            }
            _ => return Err(ContextError::ScopeUnderflow),
        }
        if restore {
            self.pos = saved;
        }
        Ok(())
    }

    /// Advance to the next multiple of `n` relative to the innermost scope start.
    pub fn align_to(&mut self, n: i64) -> Result<(), ContextError> {
        if n <= 0 {
            return Err(ContextError::InvalidAlignment(n));
        }
        let n = n as usize;
        let rel = self.pos.saturating_sub(self.scope_start());
        let pad = (n - rel % n) % n;
        self.take(pad)?;
        Ok(())
    }

    // ---------------------------------------------------------------- frames

    pub fn push_frame(&mut self) {
        self.frames.push(HashMap::new());
    }

    /// Pop the innermost frame. The outermost frame is never removed.
    pub fn pop_frame(&mut self) -> HashMap<String, RuntimeValue> {
        if self.frames.len() > 1 {
            self.frames.pop().unwrap_or_default()
        } else {
            HashMap::new()
        }
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Bind into the innermost frame and record the binding in the active capture.
    pub fn set_variable(&mut self, name: impl Into<String>, value: RuntimeValue) {
        let name = name.into();
        if let Some(capture) = self.captures.last_mut() {
            capture.insert(name.clone(), value.clone());
        }
        self.bind_local(name, value);
    }

    /// Bind into the innermost frame without recording it for promotion
    /// (loop counters such as `_index`).
    pub fn bind_local(&mut self, name: impl Into<String>, value: RuntimeValue) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.into(), value);
        }
    }

    pub fn get_variable(&self, name: &str) -> Option<&RuntimeValue> {
        self.frames.iter().rev().find_map(|f| f.get(name))
    }

    pub fn begin_capture(&mut self) {
        self.captures.push(HashMap::new());
    }

    pub fn end_capture(&mut self) -> HashMap<String, RuntimeValue> {
        self.captures.pop().unwrap_or_default()
    }

    /// Copy `bindings` into the frame enclosing the innermost one; they are
    /// also recorded in the active capture so promotion chains through
    /// nested arrays.
    pub fn promote(&mut self, bindings: HashMap<String, RuntimeValue>) {
        if let Some(capture) = self.captures.last_mut() {
            for (k, v) in &bindings {
                capture.insert(k.clone(), v.clone());
            }
        }
        let n = self.frames.len();
        let target = if n >= 2 { n - 2 } else { 0 };
        self.frames[target].extend(bindings);
    }

    pub fn mark(&self) -> ContextMark {
        ContextMark {
            position: self.pos,
            scopes: self.scopes.len(),
            frames: self.frames.len(),
            captures: self.captures.len(),
        }
    }

    /// Drop scopes, frames and captures opened after `mark` and move the cursor to `position`.
    pub fn rewind(&mut self, mark: &ContextMark, position: usize) {
        self.scopes.truncate(mark.scopes);
        self.frames.truncate(mark.frames.max(1));
        self.captures.truncate(mark.captures);
        self.pos = position.min(self.buf.len());
    }

    // ---------------------------------------------------------------- reads

    fn ensure(&self, n: usize) -> Result<(), ContextError> {
        let available = self.remaining();
        if n > available {
            return Err(ContextError::InsufficientData { offset: self.pos, needed: n, available });
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ContextError> {
        self.ensure(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], ContextError> {
        self.take(n)
    }

    pub fn read_u8(&mut self) -> Result<u8, ContextError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, ContextError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self, e: Endianness) -> Result<u16, ContextError> {
        let b = self.take(2)?;
        Ok(match e {
            Endianness::Big => BigEndian::read_u16(b),
            Endianness::Little => LittleEndian::read_u16(b),
        })
    }

    pub fn read_u32(&mut self, e: Endianness) -> Result<u32, ContextError> {
        let b = self.take(4)?;
        Ok(match e {
            Endianness::Big => BigEndian::read_u32(b),
            Endianness::Little => LittleEndian::read_u32(b),
        })
    }

    pub fn read_u64(&mut self, e: Endianness) -> Result<u64, ContextError> {
        let b = self.take(8)?;
        Ok(match e {
            Endianness::Big => BigEndian::read_u64(b),
            Endianness::Little => LittleEndian::read_u64(b),
        })
    }

    pub fn read_i16(&mut self, e: Endianness) -> Result<i16, ContextError> {
        Ok(self.read_u16(e)? as i16)
    }

    pub fn read_i32(&mut self, e: Endianness) -> Result<i32, ContextError> {
        Ok(self.read_u32(e)? as i32)
    }

    pub fn read_i64(&mut self, e: Endianness) -> Result<i64, ContextError> {
        Ok(self.read_u64(e)? as i64)
    }

    pub fn read_f32(&mut self, e: Endianness) -> Result<f32, ContextError> {
        let b = self.take(4)?;
        Ok(match e {
            Endianness::Big => BigEndian::read_f32(b),
            Endianness::Little => LittleEndian::read_f32(b),
        })
    }

    pub fn read_f64(&mut self, e: Endianness) -> Result<f64, ContextError> {
        let b = self.take(8)?;
        Ok(match e {
            Endianness::Big => BigEndian::read_f64(b),
            Endianness::Little => LittleEndian::read_f64(b),
        })
    }

    /// Unsigned integer of `width` (1..=8) bytes.
    pub fn read_uint(&mut self, width: usize, e: Endianness) -> Result<u64, ContextError> {
        if !(1..=8).contains(&width) {
            return Err(ContextError::InvalidBitfieldSize(width));
        }
        let b = self.take(width)?;
        Ok(match e {
            Endianness::Big => BigEndian::read_uint(b, width),
            Endianness::Little => LittleEndian::read_uint(b, width),
        })
    }

    /// Signed integer of `width` (1..=8) bytes, sign-extended to 64 bits.
    pub fn read_int(&mut self, width: usize, e: Endianness) -> Result<i64, ContextError> {
        let raw = self.read_uint(width, e)?;
        let shift = 64 - (width as u32) * 8;
        Ok(((raw << shift) as i64) >> shift)
    }

    /// Read a 1..=8 byte bitfield container as one big-endian-ordered value.
    pub fn read_bitfield(&mut self, size: usize, e: Endianness) -> Result<u64, ContextError> {
        if !(1..=8).contains(&size) {
            return Err(ContextError::InvalidBitfieldSize(size));
        }
        self.read_uint(size, e)
    }

    pub fn read_ascii(&mut self, n: usize) -> Result<String, ContextError> {
        self.read_string(n, StringEncoding::Ascii)
    }

    /// Fixed-width string of `n` bytes in `encoding`.
    pub fn read_string(&mut self, n: usize, encoding: StringEncoding) -> Result<String, ContextError> {
        let b = self.take(n)?;
        Ok(decode_text(b, encoding))
    }

    /// Null-terminated string. Scans the innermost scope for a zero byte (a zero
    /// code unit for UTF-16); the terminator is consumed but not part of the text.
    /// Without a terminator the rest of the scope is consumed.
    pub fn read_string_z(&mut self, encoding: StringEncoding) -> Result<String, ContextError> {
        let window = self.peek_remaining();
        let unit = encoding.code_unit();
        let mut text_len = window.len();
        let mut consumed = window.len();
        let mut i = 0;
        while i + unit <= window.len() {
            if window[i..i + unit].iter().all(|&b| b == 0) {
                text_len = i;
                consumed = i + unit;
                break;
            }
            i += unit;
        }
        let b = self.take(consumed)?;
        Ok(decode_text(&b[..text_len], encoding))
    }

    pub fn read_uleb128(&mut self) -> Result<u64, ContextError> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for _ in 0..MAX_VARINT_BYTES {
            let b = self.read_u8()?;
            if shift < 64 {
                result |= ((b & 0x7f) as u64) << shift;
            }
            shift += 7;
            if b & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(ContextError::VarIntTooLong { encoding: "ULEB128" })
    }

    pub fn read_sleb128(&mut self) -> Result<i64, ContextError> {
        let mut result = 0i64;
        let mut shift = 0u32;
        for _ in 0..MAX_VARINT_BYTES {
            let b = self.read_u8()?;
            if shift < 64 {
                result |= ((b & 0x7f) as i64) << shift;
            }
            shift += 7;
            if b & 0x80 == 0 {
                if shift < 64 && b & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
        Err(ContextError::VarIntTooLong { encoding: "SLEB128" })
    }

    /// MSB-first variable-length quantity (MIDI style).
    pub fn read_vlq(&mut self) -> Result<u64, ContextError> {
        let mut result = 0u64;
        for _ in 0..MAX_VARINT_BYTES {
            let b = self.read_u8()?;
            result = (result << 7) | (b & 0x7f) as u64;
            if b & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(ContextError::VarIntTooLong { encoding: "VLQ" })
    }
}

/// Extract bits `high..=low` (bit 0 = least significant) from a `size`-byte value.
pub fn extract_bits(raw: u64, size: usize, high: u32, low: u32) -> Result<u64, ContextError> {
    if !(1..=8).contains(&size) {
        return Err(ContextError::InvalidBitfieldSize(size));
    }
    let bits = size as u32 * 8;
    if high < low || high >= bits {
        return Err(ContextError::InvalidBitRange { high, low, bits });
    }
    let width = high - low + 1;
    let mask = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };
    Ok((raw >> low) & mask)
}

/// CRC-32 (IEEE 802.3) of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Decode `bytes` as text. Invalid sequences become U+FFFD.
pub fn decode_text(bytes: &[u8], encoding: StringEncoding) -> String {
    match encoding {
        StringEncoding::Ascii => bytes
            .iter()
            .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
            .collect(),
        StringEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        StringEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        StringEncoding::Utf16Le => encoding_rs::UTF_16LE.decode_without_bom_handling(bytes).0.into_owned(),
        StringEncoding::Utf16Be => encoding_rs::UTF_16BE.decode_without_bom_handling(bytes).0.into_owned(),
        StringEncoding::ShiftJis => encoding_rs::SHIFT_JIS.decode_without_bom_handling(bytes).0.into_owned(),
    }
}
