use std::fmt;

pub const IN_RAW_TEXT: &str = "RAW_TEXT";
pub const IN_RECORD: &str = "RECORD";
pub const IN_JRECORD: &str = "JRECORD";
pub const IN_XRECORD: &str = "XRECORD";
pub const IN_CRECORD: &str = "CRECORD";

pub const OP_CONTAINS: &str = "CONTAINS";
pub const OP_NOT_CONTAINS: &str = "NOT_CONTAINS";
pub const OP_EQUALS: &str = "EQUALS";
pub const OP_NOT_EQUALS: &str = "NOT_EQUALS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Illegal,
    Eof,
    Ws,
    Ident,
    String,
    Int,
    Float,
    Wcard,      // ?

    Eq,         // =
    Deq,        // ==
    Not,        // !
    Neq,        // !=
    Ls,         // <
    Leq,        // <=
    Gt,         // >
    Geq,        // >=
    Plus,       // +
    Minus,      // -
    Slash,      // /
    Comma,      // ,
    Period,     // .
    Colon,      // :
    Semicolon,  // ;

    LParen,     // (
    RParen,     // )
    LBrack,     // [
    RBrack,     // ]
    LBrace,     // {
    RBrace,     // }
}

/// Token and its literal text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lexeme {
    pub token: Token,
    pub literal: String,
}

impl Lexeme {
    pub fn new(token: Token, literal: impl Into<String>) -> Self {
        Lexeme { token, literal: literal.into() }
    }

    pub fn eof() -> Self {
        Lexeme::new(Token::Eof, "")
    }

    /// Literal without the surrounding quotes (strings only)
    pub fn unquoted(&self) -> &str {
        if self.token == Token::String {
            let lit = self.literal.as_str();
            if lit.len() > 1
                && ((lit.starts_with('"') && lit.ends_with('"'))
                    || (lit.starts_with('\'') && lit.ends_with('\'')))
            {
                return &lit[1..lit.len() - 1];
            }
        }
        &self.literal
    }

    fn is_keyword(&self, names: &[&str]) -> bool {
        self.token == Token::Ident
            && names.iter().any(|name| self.literal.eq_ignore_ascii_case(name))
    }

    pub fn is_and(&self) -> bool {
        self.is_keyword(&["AND"])
    }

    pub fn is_or(&self) -> bool {
        self.is_keyword(&["OR"])
    }

    pub fn is_xor(&self) -> bool {
        self.is_keyword(&["XOR"])
    }

    pub fn is_raw_text(&self) -> bool {
        self.is_keyword(&[IN_RAW_TEXT])
    }

    pub fn is_record(&self) -> bool {
        self.is_keyword(&[IN_RECORD, IN_JRECORD, IN_XRECORD, IN_CRECORD])
    }

    pub fn is_contains(&self) -> bool {
        self.is_keyword(&[OP_CONTAINS])
    }

    pub fn is_not_contains(&self) -> bool {
        self.is_keyword(&[OP_NOT_CONTAINS])
    }

    pub fn is_equals(&self) -> bool {
        self.is_keyword(&[OP_EQUALS])
    }

    pub fn is_not_equals(&self) -> bool {
        self.is_keyword(&[OP_NOT_EQUALS])
    }

    pub fn is_es(&self) -> bool {
        self.is_keyword(&["ES", "EXACT"])
    }

    pub fn is_fhs(&self) -> bool {
        self.is_keyword(&["FHS", "HAMMING"])
    }

    pub fn is_feds(&self) -> bool {
        self.is_keyword(&["FEDS", "EDIT", "EDIT_DIST", "EDIT_DISTANCE"])
    }

    pub fn is_date(&self) -> bool {
        self.is_keyword(&["DS", "DATE"])
    }

    pub fn is_time(&self) -> bool {
        self.is_keyword(&["TS", "TIME"])
    }

    pub fn is_number(&self) -> bool {
        self.is_keyword(&["NS", "NUMBER", "NUMERIC"])
    }

    pub fn is_num(&self) -> bool {
        self.is_keyword(&["NUM"])
    }

    pub fn is_currency(&self) -> bool {
        self.is_keyword(&["CS", "CURRENCY", "MONEY"])
    }

    pub fn is_cur(&self) -> bool {
        self.is_keyword(&["CUR"])
    }

    pub fn is_ipv4(&self) -> bool {
        self.is_keyword(&["IPV4"])
    }

    pub fn is_ipv6(&self) -> bool {
        self.is_keyword(&["IPV6"])
    }

    pub fn is_ip(&self) -> bool {
        self.is_keyword(&["IP"])
    }

    pub fn is_regex(&self) -> bool {
        self.is_keyword(&["PCRE2", "RE", "REGEX", "REGEXP"])
    }
}

impl fmt::Display for Lexeme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.literal)
    }
}
