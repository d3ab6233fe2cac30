use std::fmt;
use std::str::FromStr;
use serde::{Serialize, Deserialize};
use crate::core::error::{Error, Result};
use crate::query::lexeme::{Lexeme, Token};
use crate::query::parser::Parser;

/// Backend search primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Es,     // exact
    Fhs,    // fuzzy hamming
    Feds,   // fuzzy edit distance
    Ds,     // date
    Ts,     // time
    Ns,     // number
    Cs,     // currency
    Ipv4,
    Ipv6,
    Pcre2,
}

impl Mode {
    pub const ALL: [Mode; 10] = [
        Mode::Es, Mode::Fhs, Mode::Feds, Mode::Ds, Mode::Ts,
        Mode::Ns, Mode::Cs, Mode::Ipv4, Mode::Ipv6, Mode::Pcre2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Es => "es",
            Mode::Fhs => "fhs",
            Mode::Feds => "feds",
            Mode::Ds => "ds",
            Mode::Ts => "ts",
            Mode::Ns => "ns",
            Mode::Cs => "cs",
            Mode::Ipv4 => "ipv4",
            Mode::Ipv6 => "ipv6",
            Mode::Pcre2 => "pcre2",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Mode::ALL
            .iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| Error::option(format!("{:?} is unknown search mode", s)))
    }
}

/// Search options of a simple predicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    pub mode: Option<Mode>,
    pub dist: u32,                  // fuzziness distance (fhs, feds)
    pub width: i32,                 // surrounding width, -1 for entire line
    pub case: bool,                 // case sensitivity (es, fhs, feds)
    pub reduce: bool,               // reduce duplicates (feds)
    pub octal: bool,                // octal format (ipv4)
    pub currency_symbol: String,    // e.g. "$" (cs)
    pub digit_separator: String,    // e.g. "," (cs, ns)
    pub decimal_point: String,      // e.g. "." (cs, ns)
    pub file_filter: String,        // regexp applied to result file names
}

impl Default for Options {
    fn default() -> Self {
        Options {
            mode: None,
            dist: 0,
            width: 0,
            case: true,
            reduce: false,
            octal: false,
            currency_symbol: "$".to_string(),
            digit_separator: ",".to_string(),
            decimal_point: ".".to_string(),
            file_filter: String::new(),
        }
    }
}

const MAX_DISTANCE: i64 = 64 * 1024 - 1;
const MAX_WIDTH: i64 = 64 * 1024 - 1;

impl Options {
    /// Options without number formatting, case sensitivity set
    pub fn empty() -> Self {
        Options {
            currency_symbol: String::new(),
            digit_separator: String::new(),
            decimal_point: String::new(),
            ..Options::default()
        }
    }

    /// Compare everything but the file filter
    pub fn same_as(&self, other: &Options) -> bool {
        self.mode == other.mode
            && self.dist == other.dist
            && self.width == other.width
            && self.case == other.case
            && self.reduce == other.reduce
            && self.octal == other.octal
            && self.currency_symbol == other.currency_symbol
            && self.digit_separator == other.digit_separator
            && self.decimal_point == other.decimal_point
    }

    pub fn is_line(&self) -> bool {
        self.width < 0
    }

    /// Set the search mode and reset options the mode does not support.
    /// Fuzzy modes without distance fall back to exact search.
    pub fn set_mode(&mut self, mode: Mode) -> &mut Self {
        let mut mode = mode;
        match mode {
            Mode::Es => {
                self.dist = 0;
                self.reduce = false;
                self.octal = false;
                self.clear_formatting();
            }
            Mode::Fhs => {
                if self.dist == 0 {
                    mode = Mode::Es;
                }
                self.reduce = false;
                self.octal = false;
                self.clear_formatting();
            }
            Mode::Feds => {
                if self.dist == 0 {
                    mode = Mode::Es;
                    self.reduce = false;
                }
                self.octal = false;
                self.clear_formatting();
            }
            Mode::Ds | Mode::Ts | Mode::Ipv6 | Mode::Pcre2 => {
                self.dist = 0;
                self.case = true;
                self.reduce = false;
                self.octal = false;
                self.clear_formatting();
            }
            Mode::Ns => {
                self.dist = 0;
                self.case = true;
                self.reduce = false;
                self.octal = false;
                self.currency_symbol.clear();
            }
            Mode::Cs => {
                self.dist = 0;
                self.case = true;
                self.reduce = false;
                self.octal = false;
            }
            Mode::Ipv4 => {
                self.dist = 0;
                self.case = true;
                self.reduce = false;
                self.clear_formatting();
            }
        }
        self.mode = Some(mode);
        self
    }

    fn clear_formatting(&mut self) {
        self.currency_symbol.clear();
        self.digit_separator.clear();
        self.decimal_point.clear();
    }

    /// Apply one option. Supported forms: `!opt`, `opt`, `opt=val` and,
    /// when a positional name is given, a bare `val`.
    ///
    /// Returns `true` if the option was named explicitly.
    pub fn set(&mut self, option: &str, positional: Option<&str>) -> Result<bool> {
        let mut p = Parser::new(option);

        let not = match p.scan_ignore_space()? {
            lex if lex.token == Token::Not => true,
            lex => {
                p.unscan(lex);
                false
            }
        };

        let lex = p.scan_ignore_space()?;
        let (named, name) = if lex.token == Token::Ident {
            (true, lex.literal)
        } else if let Some(pos) = positional {
            // it's actually a value
            p.unscan(lex);
            p.unscan(Lexeme::new(Token::Eq, "="));
            (false, pos.to_string())
        } else {
            return Err(Error::parse(format!(
                "{:?} no valid option name found",
                lex.literal
            )));
        };

        let is = |aliases: &[&str]| aliases.iter().any(|a| name.eq_ignore_ascii_case(a));

        if is(&["FUZZINESS", "DISTANCE", "DIST", "D"]) {
            if not {
                self.dist = 0;
            } else {
                expect_eq(&mut p)?;
                self.dist = p.parse_int_val(0, MAX_DISTANCE)? as u32;
            }
        } else if is(&["SURROUNDING", "WIDTH", "W"]) {
            if not {
                self.width = 0;
            } else {
                expect_eq(&mut p)?;
                let val = p.scan_ignore_space()?;
                let is_line = matches!(val.token, Token::String | Token::Ident)
                    && val.unquoted().eq_ignore_ascii_case("LINE");
                if is_line {
                    self.width = -1;
                } else {
                    p.unscan(val);
                    self.width = p.parse_int_val(0, MAX_WIDTH)? as i32;
                }
            }
        } else if is(&["LINE", "L"]) {
            if not {
                self.width = 0;
            } else {
                let line = parse_flag(&mut p)?;
                self.width = if line { -1 } else { 0 };
            }
        } else if is(&["CASE", "CS"]) {
            self.case = !not && parse_flag(&mut p)?;
        } else if is(&["REDUCE", "R"]) {
            self.reduce = !not && parse_flag(&mut p)?;
        } else if is(&["USE_OCTAL", "OCTAL", "OCT"]) {
            self.octal = !not && parse_flag(&mut p)?;
        } else if is(&["SYMBOL", "SYMB", "SYM"]) {
            self.currency_symbol = parse_string_option(&mut p, not)?;
        } else if is(&["SEPARATOR", "SEP"]) {
            self.digit_separator = parse_string_option(&mut p, not)?;
        } else if is(&["DECIMAL", "DEC"]) {
            self.decimal_point = parse_string_option(&mut p, not)?;
        } else if is(&["FILE_FILTER", "FILTER", "FF"]) {
            self.file_filter = parse_string_option(&mut p, not)?;
        } else {
            return Err(Error::parse(format!("unknown option {:?} found", name)));
        }

        let rest = p.scan_ignore_space()?;
        if rest.token != Token::Eof {
            return Err(Error::parse(format!(
                "extra data {:?} at the end",
                rest.literal
            )));
        }

        Ok(named)
    }
}

fn expect_eq(p: &mut Parser) -> Result<()> {
    let eq = p.scan_ignore_space()?;
    if eq.token != Token::Eq {
        return Err(Error::option(format!("{:?} found instead of =", eq.literal)));
    }
    Ok(())
}

// `opt` alone means true, `opt=val` parses a boolean
fn parse_flag(p: &mut Parser) -> Result<bool> {
    let eq = p.scan_ignore_space()?;
    if eq.token == Token::Eq {
        p.parse_bool_val()
    } else {
        p.unscan(eq);
        Ok(true)
    }
}

fn parse_string_option(p: &mut Parser, not: bool) -> Result<String> {
    if not {
        return Err(Error::option("! is not supported for string option"));
    }
    expect_eq(p)?;
    p.parse_string_val()
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut args = Vec::new();

        if let Some(mode) = self.mode {
            args.push(mode.to_string());
        }
        if self.dist != 0 {
            args.push(format!("d={}", self.dist));
        }
        if self.width > 0 {
            args.push(format!("w={}", self.width));
        }
        if self.width < 0 {
            args.push("line".to_string());
        }
        if !self.case {
            args.push("!cs".to_string());
        }
        if self.reduce {
            args.push("reduce".to_string());
        }
        if self.octal {
            args.push("octal".to_string());
        }
        if !self.currency_symbol.is_empty() {
            args.push(format!("sym={:?}", self.currency_symbol));
        }
        if !self.digit_separator.is_empty() {
            args.push(format!("sep={:?}", self.digit_separator));
        }
        if !self.decimal_point.is_empty() {
            args.push(format!("dot={:?}", self.decimal_point));
        }
        if !self.file_filter.is_empty() {
            args.push(format!("filter={:?}", self.file_filter));
        }

        if args.is_empty() {
            return Ok(());
        }
        write!(f, "[{}]", args.join(","))
    }
}

/// Pick the file filter of two fused predicates: the last non-empty one
pub fn select_file_filter(a: &Options, b: &Options) -> String {
    if !b.file_filter.is_empty() {
        return b.file_filter.clone();
    }
    a.file_filter.clone()
}
