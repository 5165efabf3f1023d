//! Lua tokenizer
//!
//! Produces just enough structure for identity extraction: names, string
//! literals (decoded), numbers and symbols, each tagged with its line. Comments
//! and whitespace are dropped.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_till, take_until, take_while, take_while1, take_while_m_n},
    character::complete::{char, digit1, hex_digit1, multispace0, multispace1, one_of},
    combinator::{map, map_opt, opt, recognize, value},
    multi::many0_count,
    sequence::{delimited, pair, preceded},
    IResult,
};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Identifier or keyword
    Name(String),
    /// String literal with escapes decoded
    Str(String),
    Number,
    Symbol(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

impl Token {
    pub fn is_symbol(&self, symbol: &str) -> bool {
        matches!(&self.kind, TokenKind::Symbol(s) if *s == symbol)
    }

    pub fn is_name(&self, name: &str) -> bool {
        matches!(&self.kind, TokenKind::Name(n) if n == name)
    }

    pub fn name(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Name(n) => Some(n),
            _ => None,
        }
    }

    pub fn string(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Str(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct LexError {
    pub line: usize,
    pub message: String,
}

// Longest first so that prefixes never shadow multi-character operators
const SYMBOLS: &[&str] = &[
    "...", "..", "==", "~=", "<=", ">=", "<<", ">>", "//", "::", "+", "-", "*", "/", "%", "^",
    "#", "&", "~", "|", "<", ">", "=", "(", ")", "{", "}", "[", "]", ";", ":", ",", ".",
];

/// Tokenize a complete Lua chunk
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut rest = source;

    loop {
        let (after_trivia, _) = trivia(rest).map_err(|_| LexError {
            line,
            message: "malformed comment".into(),
        })?;
        line += newlines_between(rest, after_trivia);
        rest = after_trivia;

        if rest.is_empty() {
            break;
        }

        let (after, kind) = token(rest).map_err(|_| LexError {
            line,
            message: format!("unexpected input near '{}'", preview(rest)),
        })?;
        tokens.push(Token { kind, line });
        line += newlines_between(rest, after);
        rest = after;
    }

    Ok(tokens)
}

fn newlines_between(before: &str, after: &str) -> usize {
    before[..before.len() - after.len()].matches('\n').count()
}

fn preview(input: &str) -> String {
    input.chars().take(20).collect()
}

fn trivia(input: &str) -> IResult<&str, usize> {
    many0_count(alt((value((), multispace1), value((), comment))))(input)
}

fn comment(input: &str) -> IResult<&str, &str> {
    preceded(tag("--"), alt((long_bracket, take_till(|c| c == '\n'))))(input)
}

fn token(input: &str) -> IResult<&str, TokenKind> {
    alt((
        map(long_bracket, |s: &str| TokenKind::Str(s.to_string())),
        map(short_string, TokenKind::Str),
        map(name, |s: &str| TokenKind::Name(s.to_string())),
        value(TokenKind::Number, number),
        map(symbol, TokenKind::Symbol),
    ))(input)
}

fn name(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

fn number(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((digit1, recognize(pair(char('.'), digit1)))),
        many0_count(alt((
            recognize(pair(one_of("eEpP"), opt(one_of("+-")))),
            recognize(one_of("0123456789abcdefABCDEFxX.")),
        ))),
    ))(input)
}

fn symbol(input: &str) -> IResult<&str, &'static str> {
    for symbol in SYMBOLS {
        if let Some(rest) = input.strip_prefix(*symbol) {
            return Ok((rest, *symbol));
        }
    }
    Err(nom::Err::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Tag,
    )))
}

/// `[[ ... ]]`, `[==[ ... ]==]`
fn long_bracket(input: &str) -> IResult<&str, &str> {
    let (rest, level) = preceded(char('['), many0_count(char('=')))(input)?;
    let (rest, _) = char('[')(rest)?;
    let close = format!("]{}]", "=".repeat(level));
    let (rest, body) = take_until(close.as_str())(rest)?;
    let (rest, _) = tag(close.as_str())(rest)?;

    // A newline right after the opening bracket is not part of the string
    let body = body
        .strip_prefix("\r\n")
        .or_else(|| body.strip_prefix('\n'))
        .unwrap_or(body);
    Ok((rest, body))
}

fn short_string(input: &str) -> IResult<&str, String> {
    let (mut rest, quote) = one_of("\"'")(input)?;
    let mut decoded = String::new();

    loop {
        let mut chars = rest.chars();
        match chars.next() {
            None | Some('\n') => {
                return Err(nom::Err::Failure(nom::error::Error::new(
                    rest,
                    nom::error::ErrorKind::Char,
                )))
            }
            Some(c) if c == quote => return Ok((chars.as_str(), decoded)),
            Some('\\') => {
                let (after, escaped) = escape(chars.as_str())
                    .map_err(|_| nom::Err::Failure(nom::error::Error::new(rest, nom::error::ErrorKind::Escaped)))?;
                if let Some(c) = escaped {
                    decoded.push(c);
                }
                rest = after;
            }
            Some(c) => {
                decoded.push(c);
                rest = chars.as_str();
            }
        }
    }
}

fn escape(input: &str) -> IResult<&str, Option<char>> {
    alt((
        value(Some('\n'), char('n')),
        value(Some('\t'), char('t')),
        value(Some('\r'), char('r')),
        value(Some('\u{7}'), char('a')),
        value(Some('\u{8}'), char('b')),
        value(Some('\u{c}'), char('f')),
        value(Some('\u{b}'), char('v')),
        value(Some('\\'), char('\\')),
        value(Some('"'), char('"')),
        value(Some('\''), char('\'')),
        value(Some('\n'), char('\n')),
        value(None, preceded(char('z'), multispace0)),
        map_opt(
            preceded(char('x'), take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit())),
            |hex: &str| u8::from_str_radix(hex, 16).ok().map(|b| Some(char::from(b))),
        ),
        map_opt(
            delimited(tag("u{"), hex_digit1, char('}')),
            |hex: &str| u32::from_str_radix(hex, 16).ok().and_then(char::from_u32).map(Some),
        ),
        map_opt(
            take_while_m_n(1, 3, |c: char| c.is_ascii_digit()),
            |digits: &str| digits.parse::<u8>().ok().map(|b| Some(char::from(b))),
        ),
    ))(input)
}
