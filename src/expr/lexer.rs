//! Tokenizer for expression source text.

use super::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Str(String),
    Ident(String),
    And,
    Or,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Amp,
    Pipe,
    Caret,
    Shl,
    Shr,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Question,
    Colon,
    Eof,
}

impl Token {
    /// Text used when reporting the token in errors.
    pub fn describe(&self) -> String {
        match self {
            Token::Int(v) => v.to_string(),
            Token::Str(s) => format!("'{}'", s),
            Token::Ident(s) => s.clone(),
            Token::And => "and".into(),
            Token::Or => "or".into(),
            Token::Not => "not".into(),
            Token::Plus => "+".into(),
            Token::Minus => "-".into(),
            Token::Star => "*".into(),
            Token::Slash => "/".into(),
            Token::Percent => "%".into(),
            Token::EqEq => "==".into(),
            Token::NotEq => "!=".into(),
            Token::Lt => "<".into(),
            Token::Le => "<=".into(),
            Token::Gt => ">".into(),
            Token::Ge => ">=".into(),
            Token::Amp => "&".into(),
            Token::Pipe => "|".into(),
            Token::Caret => "^".into(),
            Token::Shl => "<<".into(),
            Token::Shr => ">>".into(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
            Token::LBracket => "[".into(),
            Token::RBracket => "]".into(),
            Token::Comma => ",".into(),
            Token::Question => "?".into(),
            Token::Colon => ":".into(),
            Token::Eof => "end of input".into(),
        }
    }
}

/// Token with the byte position where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub pos: usize,
}

/// Convert source text into tokens terminated by a single [`Token::Eof`].
pub fn tokenize(text: &str) -> Result<Vec<Spanned>, ExprError> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        if c.is_ascii_digit() {
            let (value, next) = lex_number(text, i)?;
            out.push(Spanned { token: Token::Int(value), pos: start });
            i = next;
            continue;
        }
        if c == b'\'' {
            let rest = &text[i + 1..];
            let end = rest.find('\'').ok_or_else(|| {
                ExprError::Format(format!("unterminated string literal at position {}", start))
            })?;
            out.push(Spanned { token: Token::Str(rest[..end].to_string()), pos: start });
            i += end + 2;
            continue;
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let word = &text[start..i];
            let token = match word {
                "and" => Token::And,
                "or" => Token::Or,
                "not" => Token::Not,
                _ => Token::Ident(word.to_string()),
            };
            out.push(Spanned { token, pos: start });
            continue;
        }
        let next = bytes.get(i + 1).copied();
        let (token, len) = match (c, next) {
            (b'=', Some(b'=')) => (Token::EqEq, 2),
            (b'!', Some(b'=')) => (Token::NotEq, 2),
            (b'<', Some(b'=')) => (Token::Le, 2),
            (b'>', Some(b'=')) => (Token::Ge, 2),
            (b'<', Some(b'<')) => (Token::Shl, 2),
            (b'>', Some(b'>')) => (Token::Shr, 2),
            (b'<', _) => (Token::Lt, 1),
            (b'>', _) => (Token::Gt, 1),
            (b'+', _) => (Token::Plus, 1),
            (b'-', _) => (Token::Minus, 1),
            (b'*', _) => (Token::Star, 1),
            (b'/', _) => (Token::Slash, 1),
            (b'%', _) => (Token::Percent, 1),
            (b'&', _) => (Token::Amp, 1),
            (b'|', _) => (Token::Pipe, 1),
            (b'^', _) => (Token::Caret, 1),
            (b'(', _) => (Token::LParen, 1),
            (b')', _) => (Token::RParen, 1),
            (b'[', _) => (Token::LBracket, 1),
            (b']', _) => (Token::RBracket, 1),
            (b',', _) => (Token::Comma, 1),
            (b'?', _) => (Token::Question, 1),
            (b':', _) => (Token::Colon, 1),
            _ => {
                let ch = text[i..].chars().next().unwrap_or('\u{FFFD}');
                return Err(ExprError::Syntax(format!(
                    "unexpected character '{}' at position {}",
                    ch, start
                )));
            }
        };
        out.push(Spanned { token, pos: start });
        i += len;
    }
    out.push(Spanned { token: Token::Eof, pos: text.len() });
    Ok(out)
}

/// Decimal or `0x` hex literal starting at `start`. Hex literals up to 64 bits
/// are accepted and reinterpreted as i64.
fn lex_number(text: &str, start: usize) -> Result<(i64, usize), ExprError> {
    let bytes = text.as_bytes();
    let is_hex = bytes[start] == b'0'
        && matches!(bytes.get(start + 1), Some(b'x') | Some(b'X'))
        && bytes.get(start + 2).map_or(false, |b| b.is_ascii_hexdigit());
    if is_hex {
        let mut end = start + 2;
        while end < bytes.len() && bytes[end].is_ascii_hexdigit() {
            end += 1;
        }
        let digits = &text[start + 2..end];
        let v = u64::from_str_radix(digits, 16).map_err(|_| {
            ExprError::Syntax(format!("hex literal out of range at position {}", start))
        })?;
        return Ok((v as i64, end));
    }
    let mut end = start;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let v = text[start..end].parse::<i64>().map_err(|_| {
        ExprError::Syntax(format!("integer literal out of range at position {}", start))
    })?;
    Ok((v, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<Token> {
        tokenize(text).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn hex_and_decimal() {
        assert_eq!(kinds("0x1F 42"), vec![Token::Int(31), Token::Int(42), Token::Eof]);
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("a and not b_2 or _c"),
            vec![
                Token::Ident("a".into()),
                Token::And,
                Token::Not,
                Token::Ident("b_2".into()),
                Token::Or,
                Token::Ident("_c".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn two_char_operators() {
        assert_eq!(
            kinds("<= << >= >> == !="),
            vec![Token::Le, Token::Shl, Token::Ge, Token::Shr, Token::EqEq, Token::NotEq, Token::Eof]
        );
    }

    #[test]
    fn unterminated_string() {
        assert!(matches!(tokenize("'abc"), Err(ExprError::Format(_))));
    }

    #[test]
    fn bad_character_reports_position() {
        let err = tokenize("a $ b").unwrap_err();
        assert_eq!(err, ExprError::Syntax("unexpected character '$' at position 2".into()));
    }

    #[test]
    fn single_eof() {
        assert_eq!(kinds("   "), vec![Token::Eof]);
    }
}
