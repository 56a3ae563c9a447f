use super::TemplateError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Pipe,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Tilde,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub offset: usize,
}

pub(crate) fn tokenize(input: &str) -> Result<Vec<Spanned>, TemplateError> {
    let bytes = input.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;

        let token = match b {
            b'(' => single(&mut i, Token::LParen),
            b')' => single(&mut i, Token::RParen),
            b'[' => single(&mut i, Token::LBracket),
            b']' => single(&mut i, Token::RBracket),
            b'{' => single(&mut i, Token::LBrace),
            b'}' => single(&mut i, Token::RBrace),
            b',' => single(&mut i, Token::Comma),
            b':' => single(&mut i, Token::Colon),
            b'.' => single(&mut i, Token::Dot),
            b'|' => single(&mut i, Token::Pipe),
            b'+' => single(&mut i, Token::Plus),
            b'-' => single(&mut i, Token::Minus),
            b'*' => single(&mut i, Token::Star),
            b'/' => single(&mut i, Token::Slash),
            b'%' => single(&mut i, Token::Percent),
            b'~' => single(&mut i, Token::Tilde),
            b'=' if bytes.get(i + 1) == Some(&b'=') => {
                i += 2;
                Token::Eq
            }
            b'!' if bytes.get(i + 1) == Some(&b'=') => {
                i += 2;
                Token::Ne
            }
            b'<' if bytes.get(i + 1) == Some(&b'=') => {
                i += 2;
                Token::Le
            }
            b'>' if bytes.get(i + 1) == Some(&b'=') => {
                i += 2;
                Token::Ge
            }
            b'<' => single(&mut i, Token::Lt),
            b'>' => single(&mut i, Token::Gt),
            b'"' | b'\'' => lex_string(input, &mut i)?,
            b'0'..=b'9' => lex_number(input, &mut i)?,
            b if b == b'_' || b.is_ascii_alphabetic() => {
                while i < bytes.len() && (bytes[i] == b'_' || bytes[i].is_ascii_alphanumeric()) {
                    i += 1;
                }
                Token::Ident(input[start..i].to_string())
            }
            _ => {
                let ch = input[i..].chars().next().unwrap_or('?');
                return Err(TemplateError::Syntax {
                    offset: i,
                    message: format!("unexpected character '{ch}'"),
                });
            }
        };

        out.push(Spanned {
            token,
            offset: start,
        });
    }

    Ok(out)
}

fn single(i: &mut usize, token: Token) -> Token {
    *i += 1;
    token
}

fn lex_number(input: &str, i: &mut usize) -> Result<Token, TemplateError> {
    let bytes = input.as_bytes();
    let start = *i;
    while *i < bytes.len() && bytes[*i].is_ascii_digit() {
        *i += 1;
    }

    // `rows.0.id` keeps `0` an integer: a fraction needs a digit after the dot.
    let is_float = *i + 1 < bytes.len() && bytes[*i] == b'.' && bytes[*i + 1].is_ascii_digit();
    if is_float {
        *i += 1;
        while *i < bytes.len() && bytes[*i].is_ascii_digit() {
            *i += 1;
        }
    }

    let text = &input[start..*i];
    let err = |message: &str| TemplateError::Syntax {
        offset: start,
        message: format!("{message}: {text}"),
    };
    if is_float {
        text.parse::<f64>()
            .map(Token::Float)
            .map_err(|_| err("invalid number"))
    } else {
        text.parse::<i64>()
            .map(Token::Int)
            .map_err(|_| err("integer literal out of range"))
    }
}

fn lex_string(input: &str, i: &mut usize) -> Result<Token, TemplateError> {
    let start = *i;
    let mut chars = input[start..].char_indices();
    let quote = match chars.next() {
        Some((_, q)) => q,
        None => {
            return Err(TemplateError::Syntax {
                offset: start,
                message: "expected string".to_string(),
            })
        }
    };

    let mut out = String::new();
    while let Some((pos, ch)) = chars.next() {
        if ch == quote {
            *i = start + pos + ch.len_utf8();
            return Ok(Token::Str(out));
        }
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        let escaped = match chars.next() {
            Some((_, e)) => e,
            None => break,
        };
        match escaped {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '0' => out.push('\0'),
            'u' => {
                let hex: String = chars.by_ref().take(4).map(|(_, c)| c).collect();
                let decoded = u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| TemplateError::Syntax {
                        offset: start + pos,
                        message: format!("invalid unicode escape \\u{hex}"),
                    })?;
                out.push(decoded);
            }
            other => out.push(other),
        }
    }

    Err(TemplateError::Syntax {
        offset: start,
        message: "unterminated string literal".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token> {
        tokenize(input).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn member_index_stays_integer() {
        assert_eq!(
            kinds("rows.0.id"),
            vec![
                Token::Ident("rows".into()),
                Token::Dot,
                Token::Int(0),
                Token::Dot,
                Token::Ident("id".into()),
            ]
        );
    }

    #[test]
    fn floats_and_comparisons() {
        assert_eq!(
            kinds("1.5 <= x != 'a\\'b'"),
            vec![
                Token::Float(1.5),
                Token::Le,
                Token::Ident("x".into()),
                Token::Ne,
                Token::Str("a'b".into()),
            ]
        );
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(matches!(tokenize("'abc"), Err(TemplateError::Syntax { offset: 0, .. })));
    }

    #[test]
    fn stray_character_reports_offset() {
        match tokenize("a ; b") {
            Err(TemplateError::Syntax { offset, .. }) => assert_eq!(offset, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
