//! Reader for the literal notation the shield uses when it hands back a
//! retrieval filter expression.
//!
//! The notation is the Python literal subset: quoted strings (single or
//! double), integers, floats, `True`/`False`/`None`, lists, tuples and dicts.
//! Nothing is evaluated; anything outside that subset is rejected.

use super::FilterError;

const MAX_DEPTH: usize = 64;

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Literal>),
    Tuple(Vec<Literal>),
    Dict(Vec<(Literal, Literal)>),
}

impl Literal {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
        }
    }
}

pub fn parse_literal(input: &str) -> Result<Literal, FilterError> {
    let mut parser = Parser { chars: input.chars().collect(), position: 0 };
    let value = parser.value(0)?;
    parser.skip_whitespace();
    if parser.position < parser.chars.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(value)
}

struct Parser {
    chars: Vec<char>,
    position: usize,
}

impl Parser {
    fn value(&mut self, depth: usize) -> Result<Literal, FilterError> {
        if depth > MAX_DEPTH {
            return Err(self.error("literal nesting is too deep"));
        }

        self.skip_whitespace();
        match self.peek() {
            Some('{') => self.dict(depth),
            Some('[') => self.sequence(']', depth).map(Literal::List),
            Some('(') => self.tuple(depth),
            Some(quote @ ('\'' | '"')) => self.string(quote).map(Literal::Str),
            Some(ch) if ch == '-' || ch == '+' || ch == '.' || ch.is_ascii_digit() => {
                self.number()
            }
            Some(ch) if ch.is_ascii_alphabetic() => self.keyword(),
            Some(_) => Err(self.error("unexpected character")),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn dict(&mut self, depth: usize) -> Result<Literal, FilterError> {
        self.expect('{')?;
        let mut entries = Vec::new();

        loop {
            self.skip_whitespace();
            if self.eat('}') {
                return Ok(Literal::Dict(entries));
            }

            let key = self.value(depth + 1)?;
            self.skip_whitespace();
            self.expect(':')?;
            let value = self.value(depth + 1)?;
            entries.push((key, value));

            self.skip_whitespace();
            if self.eat('}') {
                return Ok(Literal::Dict(entries));
            }
            self.expect(',')?;
        }
    }

    fn sequence(&mut self, close: char, depth: usize) -> Result<Vec<Literal>, FilterError> {
        self.advance();
        let mut items = Vec::new();

        loop {
            self.skip_whitespace();
            if self.eat(close) {
                return Ok(items);
            }

            items.push(self.value(depth + 1)?);

            self.skip_whitespace();
            if self.eat(close) {
                return Ok(items);
            }
            self.expect(',')?;
        }
    }

    fn tuple(&mut self, depth: usize) -> Result<Literal, FilterError> {
        let start = self.position;
        let items = self.sequence(')', depth)?;

        // `(x)` is a parenthesized value, `(x,)` a one-element tuple.
        let has_trailing_comma = self.chars[start..self.position]
            .iter()
            .rev()
            .skip(1)
            .find(|ch| !ch.is_whitespace())
            .is_some_and(|ch| *ch == ',');
        match items.len() {
            1 if !has_trailing_comma => Ok(items.into_iter().next().unwrap_or(Literal::None)),
            _ => Ok(Literal::Tuple(items)),
        }
    }

    fn string(&mut self, quote: char) -> Result<String, FilterError> {
        self.advance();
        let mut output = String::new();

        loop {
            match self.advance() {
                Some(ch) if ch == quote => return Ok(output),
                Some('\\') => output.push(self.escape()?),
                Some('\n') | None => return Err(self.error("unterminated string")),
                Some(ch) => output.push(ch),
            }
        }
    }

    fn escape(&mut self) -> Result<char, FilterError> {
        match self.advance() {
            Some('n') => Ok('\n'),
            Some('t') => Ok('\t'),
            Some('r') => Ok('\r'),
            Some('0') => Ok('\0'),
            Some('\\') => Ok('\\'),
            Some('\'') => Ok('\''),
            Some('"') => Ok('"'),
            Some('x') => self.hex_escape(2),
            Some('u') => self.hex_escape(4),
            Some('U') => self.hex_escape(8),
            _ => Err(self.error("invalid escape sequence")),
        }
    }

    fn hex_escape(&mut self, digits: usize) -> Result<char, FilterError> {
        let mut code = 0u32;
        for _ in 0..digits {
            let digit = self
                .advance()
                .and_then(|ch| ch.to_digit(16))
                .ok_or_else(|| self.error("invalid hex escape"))?;
            code = code * 16 + digit;
        }
        char::from_u32(code).ok_or_else(|| self.error("escape is not a valid code point"))
    }

    fn number(&mut self) -> Result<Literal, FilterError> {
        let start = self.position;
        if matches!(self.peek(), Some('-' | '+')) {
            self.advance();
        }

        let mut is_float = false;
        while let Some(ch) = self.peek() {
            match ch {
                '0'..='9' | '_' => {}
                '.' => is_float = true,
                'e' | 'E' => {
                    is_float = true;
                    if matches!(self.peek_at(1), Some('-' | '+')) {
                        self.advance();
                    }
                }
                _ => break,
            }
            self.advance();
        }

        let raw: String =
            self.chars[start..self.position].iter().filter(|ch| **ch != '_').collect();
        let parsed = if is_float {
            raw.parse::<f64>().ok().map(Literal::Float)
        } else {
            raw.parse::<i64>().ok().map(Literal::Int)
        };
        parsed.ok_or_else(|| FilterError::Parse {
            position: start,
            message: format!("invalid number `{raw}`"),
        })
    }

    fn keyword(&mut self) -> Result<Literal, FilterError> {
        let start = self.position;
        while self.peek().is_some_and(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
            self.advance();
        }

        let word: String = self.chars[start..self.position].iter().collect();
        match word.as_str() {
            "True" => Ok(Literal::Bool(true)),
            "False" => Ok(Literal::Bool(false)),
            "None" => Ok(Literal::None),
            _ => Err(FilterError::Parse {
                position: start,
                message: format!("unsupported name `{word}`"),
            }),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.position += 1;
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), FilterError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(&format!("expected `{expected}`")))
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn peek(&self) -> Option<char> {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.position + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek();
        if ch.is_some() {
            self.position += 1;
        }
        ch
    }

    fn error(&self, message: &str) -> FilterError {
        FilterError::Parse { position: self.position, message: message.to_string() }
    }
}
