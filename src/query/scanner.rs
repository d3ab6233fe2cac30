use crate::core::error::{Error, Result};
use crate::query::lexeme::{Lexeme, Token};

/// Lexical scanner over the query text.
///
/// Produces lexemes lazily; string escapes are kept verbatim and only
/// stripped of quotes by `Lexeme::unquoted`.
pub struct Scanner {
    input: Vec<char>,
    pos: usize,
    pushback: Option<Lexeme>,
}

impl Scanner {
    pub fn new(data: &str) -> Self {
        Scanner {
            input: data.chars().collect(),
            pos: 0,
            pushback: None,
        }
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    fn is_ident(ch: char) -> bool {
        ch == '_' || ch.is_alphabetic()
    }

    fn is_digit(ch: char) -> bool {
        ch.is_ascii_digit()
    }

    /// Put one lexeme back, the next `scan` returns it
    pub fn unscan(&mut self, lex: Lexeme) {
        self.pushback = Some(lex);
    }

    /// Scan everything up to EOF
    pub fn scan_all(&mut self, ignore_spaces: bool) -> Result<Vec<Lexeme>> {
        let mut res = Vec::new();
        loop {
            let lex = self.scan()?;
            match lex.token {
                Token::Eof => break,
                Token::Ws if ignore_spaces => continue,
                _ => res.push(lex),
            }
        }
        Ok(res)
    }

    pub fn scan(&mut self) -> Result<Lexeme> {
        if let Some(lex) = self.pushback.take() {
            return Ok(lex);
        }

        let ch = match self.peek() {
            None => return Ok(Lexeme::eof()),
            Some(ch) => ch,
        };

        if ch.is_whitespace() {
            return Ok(self.scan_space());
        }
        if Self::is_ident(ch) {
            return Ok(self.scan_ident());
        }
        if Self::is_digit(ch) {
            return self.scan_number(String::new(), false);
        }
        if ch == '"' || ch == '\'' {
            return self.scan_string();
        }

        self.pos += 1;
        let next = self.peek();
        let lex = match ch {
            '=' if next == Some('=') => self.pair(Token::Deq, "=="),
            '=' => Lexeme::new(Token::Eq, "="),
            '!' if next == Some('=') => self.pair(Token::Neq, "!="),
            '!' => Lexeme::new(Token::Not, "!"),
            '<' if next == Some('=') => self.pair(Token::Leq, "<="),
            '<' => Lexeme::new(Token::Ls, "<"),
            '>' if next == Some('=') => self.pair(Token::Geq, ">="),
            '>' => Lexeme::new(Token::Gt, ">"),
            '+' | '-' if next.is_some_and(|c| c == '.' || Self::is_digit(c)) => {
                return self.scan_number(ch.to_string(), false);
            }
            '+' => Lexeme::new(Token::Plus, "+"),
            '-' => Lexeme::new(Token::Minus, "-"),
            '.' if next.is_some_and(Self::is_digit) => {
                return self.scan_number(".".to_string(), true);
            }
            '.' => Lexeme::new(Token::Period, "."),
            '?' => Lexeme::new(Token::Wcard, "?"),
            '/' => Lexeme::new(Token::Slash, "/"),
            ',' => Lexeme::new(Token::Comma, ","),
            ':' => Lexeme::new(Token::Colon, ":"),
            ';' => Lexeme::new(Token::Semicolon, ";"),
            '(' => Lexeme::new(Token::LParen, "("),
            ')' => Lexeme::new(Token::RParen, ")"),
            '[' => Lexeme::new(Token::LBrack, "["),
            ']' => Lexeme::new(Token::RBrack, "]"),
            '{' => Lexeme::new(Token::LBrace, "{"),
            '}' => Lexeme::new(Token::RBrace, "}"),
            other => Lexeme::new(Token::Illegal, other.to_string()),
        };
        Ok(lex)
    }

    // consume the second rune of a two-rune operator
    fn pair(&mut self, token: Token, literal: &str) -> Lexeme {
        self.pos += 1;
        Lexeme::new(token, literal)
    }

    fn scan_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut buf = String::new();
        while let Some(ch) = self.peek() {
            if !pred(ch) {
                break;
            }
            buf.push(ch);
            self.pos += 1;
        }
        buf
    }

    fn scan_space(&mut self) -> Lexeme {
        Lexeme::new(Token::Ws, self.scan_while(char::is_whitespace))
    }

    fn scan_ident(&mut self) -> Lexeme {
        Lexeme::new(Token::Ident, self.scan_while(|c| Self::is_ident(c) || Self::is_digit(c)))
    }

    fn scan_string(&mut self) -> Result<Lexeme> {
        let mut buf = String::new();
        let ending = match self.bump() {
            Some(q) => q,
            None => return Err(Error::parse("no string ending found")),
        };
        buf.push(ending); // quotes are part of the literal

        loop {
            match self.bump() {
                None => return Err(Error::parse("no string ending found")),
                Some(ch) if ch == ending => {
                    buf.push(ch);
                    return Ok(Lexeme::new(Token::String, buf));
                }
                Some('\\') => match self.bump() {
                    None => return Err(Error::parse("bad string escaping found")),
                    Some(escaped) => {
                        buf.push('\\');
                        buf.push(escaped);
                    }
                },
                Some(ch) => buf.push(ch),
            }
        }
    }

    // Numbers start with a digit, a dot, or a sign followed by either.
    fn scan_number(&mut self, prefix: String, mut is_decimal: bool) -> Result<Lexeme> {
        let mut buf = prefix;
        buf.push_str(&self.scan_while(Self::is_digit));

        if !is_decimal && self.peek() == Some('.') {
            self.pos += 1;
            buf.push('.');
            is_decimal = true;
            buf.push_str(&self.scan_while(Self::is_digit));
        }

        if let Some(e) = self.peek().filter(|c| *c == 'e' || *c == 'E') {
            self.pos += 1;
            buf.push(e);
            is_decimal = true;

            match self.peek() {
                Some(d) if Self::is_digit(d) => {}
                Some(sign) if (sign == '+' || sign == '-')
                    && self.peek_at(1).is_some_and(Self::is_digit) =>
                {
                    self.pos += 1;
                    buf.push(sign);
                }
                _ => return Err(Error::parse("bad float format, expected digital")),
            }
            buf.push_str(&self.scan_while(Self::is_digit));
        }

        let token = if is_decimal { Token::Float } else { Token::Int };
        Ok(Lexeme::new(token, buf))
    }
}
