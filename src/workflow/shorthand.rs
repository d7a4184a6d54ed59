//! Positional-template parsing for step shorthand.
//!
//! A template is a sequence of:
//! - `${name}`: one token of input (a bare word or a quoted string)
//! - `${name...}`: everything remaining
//! - `"literal"` or a bare word: must match the next input token exactly
//! - `[ ... ]`: an optional group
//!
//! For example the template `${variable} [ "=" ${value...} ]` accepts
//! `x = 1 + 2`, giving `variable = x` and `value = 1 + 2`.

use std::collections::BTreeMap;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Var { name: String, rest: bool },
    Literal(String),
    Optional(Vec<Part>),
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    text: String,
    start: usize,
    quoted: bool,
}

#[derive(Debug, Clone)]
pub struct ShorthandTemplate {
    source: String,
    parts: Vec<Part>,
}

impl ShorthandTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let tokens = tokenize(template)?;
        let mut pos = 0;
        let parts = parse_parts(&tokens, &mut pos, template)?;
        if pos != tokens.len() {
            return Err(EngineError::IllegalArgument(format!(
                "Unbalanced ']' in shorthand template '{}'",
                template
            )));
        }
        Ok(Self {
            source: template.to_string(),
            parts,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Matches `input` against the template, returning captured values.
    pub fn apply(&self, input: &str) -> Result<BTreeMap<String, String>> {
        let tokens = tokenize(input)?;
        let mut out = BTreeMap::new();
        match match_parts(&self.parts, &tokens, 0, input, &mut out) {
            Some(end) if end == tokens.len() => Ok(out),
            _ => Err(EngineError::IllegalArgument(format!(
                "Invalid shorthand '{}'; expected '{}'",
                input.trim(),
                self.source
            ))),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' || c == '\'' {
            let quote = c;
            chars.next();
            let mut text = String::new();
            let mut closed = false;
            while let Some((_, ch)) = chars.next() {
                if ch == '\\' {
                    if let Some((_, escaped)) = chars.next() {
                        text.push(escaped);
                    }
                } else if ch == quote {
                    closed = true;
                    break;
                } else {
                    text.push(ch);
                }
            }
            if !closed {
                return Err(EngineError::IllegalArgument(format!(
                    "Unterminated quote in '{}'",
                    input
                )));
            }
            tokens.push(Token {
                text,
                start,
                quoted: true,
            });
            continue;
        }
        let mut text = String::new();
        while let Some(&(_, ch)) = chars.peek() {
            if ch.is_whitespace() {
                break;
            }
            text.push(ch);
            chars.next();
        }
        tokens.push(Token {
            text,
            start,
            quoted: false,
        });
    }
    Ok(tokens)
}

fn parse_parts(tokens: &[Token], pos: &mut usize, template: &str) -> Result<Vec<Part>> {
    let mut parts = Vec::new();
    while *pos < tokens.len() {
        let token = &tokens[*pos];
        if !token.quoted && token.text == "]" {
            return Ok(parts);
        }
        *pos += 1;
        if !token.quoted && token.text == "[" {
            let group = parse_parts(tokens, pos, template)?;
            if *pos >= tokens.len() {
                return Err(EngineError::IllegalArgument(format!(
                    "Unclosed '[' in shorthand template '{}'",
                    template
                )));
            }
            *pos += 1;
            parts.push(Part::Optional(group));
        } else if !token.quoted && token.text.starts_with("${") && token.text.ends_with('}') {
            let inner = &token.text[2..token.text.len() - 1];
            let (name, rest) = match inner.strip_suffix("...") {
                Some(n) => (n, true),
                None => (inner, false),
            };
            parts.push(Part::Var {
                name: name.to_string(),
                rest,
            });
        } else {
            parts.push(Part::Literal(token.text.clone()));
        }
    }
    Ok(parts)
}

/// Returns the index of the first unconsumed token on success.
fn match_parts(
    parts: &[Part],
    tokens: &[Token],
    mut idx: usize,
    input: &str,
    out: &mut BTreeMap<String, String>,
) -> Option<usize> {
    for (i, part) in parts.iter().enumerate() {
        match part {
            Part::Literal(lit) => {
                let tok = tokens.get(idx)?;
                if tok.text != *lit {
                    return None;
                }
                idx += 1;
            }
            Part::Var { name, rest: false } => {
                let tok = tokens.get(idx)?;
                out.insert(name.clone(), tok.text.clone());
                idx += 1;
            }
            Part::Var { name, rest: true } => {
                if idx >= tokens.len() {
                    return None;
                }
                let value = if idx + 1 == tokens.len() && tokens[idx].quoted {
                    tokens[idx].text.clone()
                } else {
                    input[tokens[idx].start..].trim_end().to_string()
                };
                out.insert(name.clone(), value);
                idx = tokens.len();
            }
            Part::Optional(group) => {
                let mut attempt = out.clone();
                if let Some(after) = match_parts(group, tokens, idx, input, &mut attempt) {
                    // keep the group only if the remainder still matches
                    let mut rest_out = attempt.clone();
                    if match_parts(&parts[i + 1..], tokens, after, input, &mut rest_out)
                        == Some(tokens.len())
                    {
                        *out = rest_out;
                        return Some(tokens.len());
                    }
                }
            }
        }
    }
    Some(idx)
}
