// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Tokenizer for the aggregate-SELECT dialect.
//!
//! Identifiers are bare or backtick-quoted (with `` doubling) and limited
//! to 64 bytes of UTF-8, matching the storage dictionary's identifier
//! limit. Keywords are case-insensitive.

use crate::arena::Arena;

use super::RsqlError;

pub const MAX_IDENTIFIER_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Explain,
    Select,
    From,
    Where,
    Group,
    Order,
    By,
    As,
    And,
    Or,
    Not,
    Asc,
    Desc,
    Count,
    Sum,
    Min,
    Max,
    Avg,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tok<'a> {
    Keyword(Keyword),
    Ident(&'a str),
    Int(i64),
    Str(&'a str),
    Comma,
    LParen,
    RParen,
    Star,
    Plus,
    Minus,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Semicolon,
    Eof,
}

/// A token plus the byte span it came from; spans feed error messages and
/// unaliased output names.
#[derive(Debug, Clone, Copy)]
pub struct Token<'a> {
    pub tok: Tok<'a>,
    pub start: usize,
    pub end: usize,
}

fn keyword_of(word: &str) -> Option<Keyword> {
    let upper = word.to_ascii_uppercase();
    Some(match upper.as_str() {
        "EXPLAIN" => Keyword::Explain,
        "SELECT" => Keyword::Select,
        "FROM" => Keyword::From,
        "WHERE" => Keyword::Where,
        "GROUP" => Keyword::Group,
        "ORDER" => Keyword::Order,
        "BY" => Keyword::By,
        "AS" => Keyword::As,
        "AND" => Keyword::And,
        "OR" => Keyword::Or,
        "NOT" => Keyword::Not,
        "ASC" => Keyword::Asc,
        "DESC" => Keyword::Desc,
        "COUNT" => Keyword::Count,
        "SUM" => Keyword::Sum,
        "MIN" => Keyword::Min,
        "MAX" => Keyword::Max,
        "AVG" => Keyword::Avg,
        "DIV" => Keyword::Div,
        _ => return None,
    })
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_' || ch == '$'
}

fn is_ident_continue(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '$'
}

/// Tokenize the whole statement up front. The arena owns unescaped quoted
/// identifiers; bare identifiers borrow from the input.
pub fn tokenize<'a>(sql: &'a str, arena: &'a Arena) -> Result<Vec<Token<'a>>, RsqlError> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let ch = sql[pos..].chars().next().expect("pos is a char boundary");
        if ch == '\0' {
            return Err(RsqlError::syntax("Unexpected null byte.", pos));
        }
        if ch.is_ascii_whitespace() {
            pos += 1;
            continue;
        }
        let start = pos;
        let tok = match ch {
            ',' => {
                pos += 1;
                Tok::Comma
            }
            '(' => {
                pos += 1;
                Tok::LParen
            }
            ')' => {
                pos += 1;
                Tok::RParen
            }
            '*' => {
                pos += 1;
                Tok::Star
            }
            '+' => {
                pos += 1;
                Tok::Plus
            }
            '-' => {
                pos += 1;
                Tok::Minus
            }
            '/' => {
                pos += 1;
                Tok::Slash
            }
            '%' => {
                pos += 1;
                Tok::Percent
            }
            ';' => {
                pos += 1;
                Tok::Semicolon
            }
            '=' => {
                pos += 1;
                Tok::Eq
            }
            '!' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    pos += 2;
                    Tok::Ne
                } else {
                    return Err(RsqlError::syntax("Illegal token", pos));
                }
            }
            '<' => match bytes.get(pos + 1) {
                Some(&b'=') => {
                    pos += 2;
                    Tok::Le
                }
                Some(&b'>') => {
                    pos += 2;
                    Tok::Ne
                }
                _ => {
                    pos += 1;
                    Tok::Lt
                }
            },
            '>' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    pos += 2;
                    Tok::Ge
                } else {
                    pos += 1;
                    Tok::Gt
                }
            }
            '`' => {
                let (ident, next) = lex_quoted_identifier(sql, pos, arena)?;
                pos = next;
                Tok::Ident(ident)
            }
            '\'' => {
                let (text, next) = lex_single_quoted(sql, pos, arena)?;
                pos = next;
                Tok::Str(text)
            }
            '0'..='9' => {
                let mut end = pos + 1;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let value: i64 = sql[pos..end].parse().map_err(|_| {
                    RsqlError::syntax("Literal integer too big for a 64-bit value.", pos)
                })?;
                pos = end;
                Tok::Int(value)
            }
            _ if is_ident_start(ch) => {
                let mut end = pos + ch.len_utf8();
                while end < bytes.len() {
                    let next = sql[end..].chars().next().expect("char boundary");
                    if !is_ident_continue(next) {
                        break;
                    }
                    end += next.len_utf8();
                }
                let word = &sql[pos..end];
                pos = end;
                match keyword_of(word) {
                    Some(kw) => Tok::Keyword(kw),
                    None => {
                        if word.len() > MAX_IDENTIFIER_BYTES {
                            return Err(RsqlError::syntax(
                                "This identifier is too long. The limit is 64 bytes encoded as UTF-8.",
                                start,
                            ));
                        }
                        Tok::Ident(word)
                    }
                }
            }
            _ => return Err(RsqlError::syntax("Illegal token", pos)),
        };
        tokens.push(Token {
            tok,
            start,
            end: pos,
        });
    }
    tokens.push(Token {
        tok: Tok::Eof,
        start: sql.len(),
        end: sql.len(),
    });
    Ok(tokens)
}

fn lex_quoted_identifier<'a>(
    sql: &'a str,
    start: usize,
    arena: &'a Arena,
) -> Result<(&'a str, usize), RsqlError> {
    let mut ident = String::new();
    let mut pos = start + 1;
    let bytes = sql.as_bytes();
    loop {
        if pos >= bytes.len() {
            return Err(RsqlError::syntax(
                "Unexpected end of input inside quoted identifier",
                start,
            ));
        }
        let ch = sql[pos..].chars().next().expect("char boundary");
        if ch == '`' {
            if bytes.get(pos + 1) == Some(&b'`') {
                ident.push('`');
                pos += 2;
                continue;
            }
            pos += 1;
            break;
        }
        ident.push(ch);
        pos += ch.len_utf8();
    }
    if ident.is_empty() {
        return Err(RsqlError::syntax("Illegal token", start));
    }
    if ident.len() > MAX_IDENTIFIER_BYTES {
        return Err(RsqlError::syntax(
            "This identifier is too long. The limit is 64 bytes encoded as UTF-8.",
            start,
        ));
    }
    Ok((arena.alloc_str(&ident), pos))
}

fn lex_single_quoted<'a>(
    sql: &'a str,
    start: usize,
    arena: &'a Arena,
) -> Result<(&'a str, usize), RsqlError> {
    let mut text = String::new();
    let mut pos = start + 1;
    let bytes = sql.as_bytes();
    loop {
        if pos >= bytes.len() {
            return Err(RsqlError::syntax(
                "Unexpected end of input inside single-quoted string",
                start,
            ));
        }
        let ch = sql[pos..].chars().next().expect("char boundary");
        match ch {
            '\'' => {
                if bytes.get(pos + 1) == Some(&b'\'') {
                    text.push('\'');
                    pos += 2;
                    continue;
                }
                pos += 1;
                break;
            }
            '\\' => {
                let Some(escaped) = sql[pos + 1..].chars().next() else {
                    return Err(RsqlError::syntax(
                        "Incomplete escape sequence in single-quoted string",
                        pos,
                    ));
                };
                text.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '0' => '\0',
                    other => other,
                });
                pos += 1 + escaped.len_utf8();
            }
            other => {
                text.push(other);
                pos += other.len_utf8();
            }
        }
    }
    Ok((arena.alloc_str(&text), pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks<'a>(sql: &'a str, arena: &'a Arena) -> Vec<Tok<'a>> {
        tokenize(sql, arena).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn lexes_a_select() {
        let arena = Arena::new();
        let tokens = toks("SELECT Sum(a+b) FROM t;", &arena);
        assert_eq!(
            tokens,
            vec![
                Tok::Keyword(Keyword::Select),
                Tok::Keyword(Keyword::Sum),
                Tok::LParen,
                Tok::Ident("a"),
                Tok::Plus,
                Tok::Ident("b"),
                Tok::RParen,
                Tok::Keyword(Keyword::From),
                Tok::Ident("t"),
                Tok::Semicolon,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn comparison_operators() {
        let arena = Arena::new();
        let tokens = toks("a >= 1 AND b < 2 OR c <> 3 AND d != 4", &arena);
        assert!(tokens.contains(&Tok::Ge));
        assert!(tokens.contains(&Tok::Lt));
        assert_eq!(tokens.iter().filter(|t| **t == Tok::Ne).count(), 2);
    }

    #[test]
    fn quoted_identifier_unescapes_backticks() {
        let arena = Arena::new();
        let tokens = toks("`we``ird`", &arena);
        assert_eq!(tokens[0], Tok::Ident("we`ird"));
    }

    #[test]
    fn identifier_length_limit() {
        let arena = Arena::new();
        let ok = format!("SELECT {} FROM t", "a".repeat(64));
        assert!(tokenize(&ok, &arena).is_ok());
        let bad = format!("SELECT {} FROM t", "a".repeat(65));
        let err = tokenize(&bad, &arena).unwrap_err();
        assert!(err.to_string().contains("too long"));
    }

    #[test]
    fn oversized_integer_is_rejected() {
        let arena = Arena::new();
        let err = tokenize("SELECT Sum(a + 99999999999999999999) FROM t", &arena).unwrap_err();
        assert!(err.to_string().contains("too big"));
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let arena = Arena::new();
        let tokens = toks("select sUm(a) from t group by b", &arena);
        assert_eq!(tokens[0], Tok::Keyword(Keyword::Select));
        assert_eq!(tokens[1], Tok::Keyword(Keyword::Sum));
        assert!(tokens.contains(&Tok::Keyword(Keyword::Group)));
    }
}
