use std::collections::HashMap;
use std::sync::LazyLock;
use regex::Regex;
use crate::core::error::{Error, Result};
use crate::query::ast::{Operator, Query, SimpleQuery};
use crate::query::lexeme::{IN_RAW_TEXT, IN_RECORD, OP_CONTAINS, Lexeme, Token};
use crate::query::options::{Mode, Options};
use crate::query::scanner::Scanner;

/// Parse a query with the default base options
pub fn parse_query(query: &str) -> Result<Query> {
    parse_query_opt(query, Options::default())
}

/// Parse a query with custom base options
pub fn parse_query_opt(query: &str, opts: Options) -> Result<Query> {
    parse_query_ex(query, opts, "", HashMap::new())
}

/// Parse a query, rewriting `RECORD` to `new_record` and quoted field
/// names through `new_fields` (used for XML/CSV backends).
pub fn parse_query_ex(
    query: &str,
    opts: Options,
    new_record: &str,
    new_fields: HashMap<String, String>,
) -> Result<Query> {
    let mut p = Parser::new(query);
    p.base_opts = opts;
    p.replace_record = new_record.to_string();
    p.replace_fields = new_fields;

    let res = p.parse()?;
    if !p.eof()? {
        return Err(Error::parse("not fully parsed, no EOF found"));
    }
    Ok(res)
}

/// Recursive-descent query parser.
///
/// Precedence from lowest: OR, XOR, AND, then groups and simple
/// predicates. Runs of the same operator fold into one n-ary node.
pub struct Parser {
    scanner: Scanner,
    base_opts: Options,
    lex_buf: Vec<Lexeme>,               // pushed back lexemes
    replace_record: String,             // RECORD => JRECORD, XRECORD...
    replace_fields: HashMap<String, String>,
}

// "%q" style quoting of a lexeme in error messages
fn q(lex: &Lexeme) -> String {
    format!("{:?}", lex.literal)
}

impl Parser {
    pub fn new(data: &str) -> Self {
        Parser {
            scanner: Scanner::new(data),
            base_opts: Options::default(),
            lex_buf: Vec::new(),
            replace_record: String::new(),
            replace_fields: HashMap::new(),
        }
    }

    pub fn with_base_options(mut self, opts: Options) -> Self {
        self.base_opts = opts;
        self
    }

    pub(crate) fn scan(&mut self) -> Result<Lexeme> {
        match self.lex_buf.pop() {
            Some(lex) => Ok(lex),
            None => self.scanner.scan(),
        }
    }

    pub(crate) fn unscan(&mut self, lex: Lexeme) {
        self.lex_buf.push(lex);
    }

    pub(crate) fn scan_ignore_space(&mut self) -> Result<Lexeme> {
        loop {
            let lex = self.scan()?;
            if lex.token != Token::Ws {
                return Ok(lex);
            }
        }
    }

    /// No more data to parse
    pub fn eof(&mut self) -> Result<bool> {
        let lex = self.scan_ignore_space()?;
        if lex.token == Token::Eof {
            return Ok(true);
        }
        self.unscan(lex);
        Ok(false)
    }

    /// Build the non-optimized query tree
    pub fn parse(&mut self) -> Result<Query> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Query> {
        self.parse_chain(Operator::Or, Lexeme::is_or, Self::parse_xor)
    }

    fn parse_xor(&mut self) -> Result<Query> {
        self.parse_chain(Operator::Xor, Lexeme::is_xor, Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Query> {
        self.parse_chain(Operator::And, Lexeme::is_and, Self::parse_primary)
    }

    fn parse_chain(
        &mut self,
        op: Operator,
        is_op: fn(&Lexeme) -> bool,
        next: fn(&mut Self) -> Result<Query>,
    ) -> Result<Query> {
        let mut res = next(self)?;
        loop {
            let lex = self.scan_ignore_space()?;
            if !is_op(&lex) {
                self.unscan(lex);
                return Ok(res);
            }

            let arg = next(self)?;
            if res.operator != Some(op) {
                res = Query::compound(op, vec![res]);
            }
            res.arguments.push(arg);
        }
    }

    fn parse_primary(&mut self) -> Result<Query> {
        let lex = self.scan_ignore_space()?;
        let (op, end) = match lex.token {
            Token::LParen => (Operator::P, Token::RParen),
            Token::LBrace => (Operator::B, Token::RBrace),
            Token::LBrack => (Operator::S, Token::RBrack),
            _ => {
                self.unscan(lex);
                return Ok(Query::leaf(self.parse_simple_query()?));
            }
        };

        let arg = self.parse_or()?;
        let close = self.scan_ignore_space()?;
        if close.token != end {
            let expected = match end {
                Token::RParen => ")",
                Token::RBrace => "}",
                _ => "]",
            };
            return Err(Error::parse(format!("{} found instead of {}", q(&close), expected)));
        }
        Ok(Query::compound(op, vec![arg]))
    }

    /// Parse one relational expression
    pub(crate) fn parse_simple_query(&mut self) -> Result<SimpleQuery> {
        let mut options = self.base_opts.clone();
        let mut structured = false;
        let mut operator = String::new();
        let mut expression = String::new();

        // search mode of plain text queries
        let plain_mode = match options.mode {
            Some(m @ (Mode::Es | Mode::Fhs | Mode::Feds | Mode::Pcre2)) => m,
            _ if options.dist != 0 => Mode::Fhs,
            _ => Mode::Es,
        };

        let lex = self.scan_ignore_space()?;
        let input = if lex.is_raw_text() {
            lex.literal.to_uppercase()
        } else if lex.is_record() {
            structured = true;
            self.parse_record_path(&lex)?
        } else if lex.token == Token::String {
            operator = OP_CONTAINS.to_string();
            expression = self.parse_string_expr(&lex)?;
            options.set_mode(plain_mode);
            IN_RAW_TEXT.to_string()
        } else if matches!(lex.token, Token::Ident | Token::Int | Token::Float) {
            operator = OP_CONTAINS.to_string();
            expression = self.parse_ident_expr(lex)?;
            options.set_mode(plain_mode);
            IN_RAW_TEXT.to_string()
        } else {
            return Err(Error::parse(format!(
                "found {}, expected RAW_TEXT or RECORD",
                q(&lex)
            )));
        };

        if operator.is_empty() {
            let lex = self.scan_ignore_space()?;
            if lex.is_contains() || lex.is_not_contains() || lex.is_equals() || lex.is_not_equals() {
                operator = lex.literal.to_uppercase();
            } else {
                return Err(Error::parse(format!(
                    "found {}, expected CONTAINS or EQUALS",
                    q(&lex)
                )));
            }
        }

        if expression.is_empty() {
            let lex = self.scan_ignore_space()?;
            let (expr, mut opts, mode) = if lex.is_es() {
                let (e, o) = self.parse_search_expr(options)?;
                (e, o, Mode::Es)
            } else if lex.is_fhs() {
                let (e, o) = self.parse_search_expr(options)?;
                (e, o, Mode::Fhs)
            } else if lex.is_feds() {
                let (e, o) = self.parse_search_expr(options)?;
                (e, o, Mode::Feds)
            } else if lex.is_date() {
                let (e, o) = self.parse_date_expr(options)?;
                (e, o, Mode::Ds)
            } else if lex.is_time() {
                let (e, o) = self.parse_time_expr(options)?;
                (e, o, Mode::Ts)
            } else if lex.is_number() {
                let (e, o) = self.parse_range_expr(options, &NUMBER_EXPR)?;
                (e, o, Mode::Ns)
            } else if lex.is_currency() {
                let (e, o) = self.parse_range_expr(options, &CURRENCY_EXPR)?;
                (e, o, Mode::Cs)
            } else if lex.is_ipv4() {
                let (e, o) = self.parse_range_expr(options, &IPV4_EXPR)?;
                (e, o, Mode::Ipv4)
            } else if lex.is_ipv6() {
                let (e, o) = self.parse_range_expr(options, &IPV6_EXPR)?;
                (e, o, Mode::Ipv6)
            } else if lex.is_regex() {
                let (e, o) = self.parse_search_expr(options)?;
                (e, o, Mode::Pcre2)
            } else if matches!(lex.token, Token::String | Token::Wcard) {
                (self.parse_string_expr(&lex)?, options, plain_mode)
            } else {
                return Err(Error::parse(format!("{} is unexpected expression", q(&lex))));
            };
            opts.set_mode(mode);
            expression = expr;
            options = opts;
        }

        let mut input = input;
        if structured {
            // no surrounding for structured search
            options.width = 0;
            if !self.replace_record.is_empty() && input.starts_with(IN_RECORD) {
                input = input.replacen(IN_RECORD, &self.replace_record, 1);
            }
        }

        Ok(SimpleQuery {
            structured,
            expr_old: format!("({} {} {})", input, operator, expr_old(&expression, &options)),
            expr_new: format!("({} {} {})", input, operator, expr_new(&expression, &options)),
            options,
        })
    }

    // RECORD[.name|."name"|.[]|.2]...
    fn parse_record_path(&mut self, start: &Lexeme) -> Result<String> {
        let mut buf = start.literal.to_uppercase();
        loop {
            let dot = self.scan()?;
            match dot.token {
                Token::Period => {
                    let lex = self.scan()?;
                    match lex.token {
                        Token::Ident | Token::String => {
                            buf.push_str(&dot.literal);
                            match self.replace_fields.get(lex.unquoted()) {
                                Some(field) => buf.push_str(field),
                                None => buf.push_str(&lex.literal),
                            }
                        }
                        Token::LBrack => {
                            // array wildcard "field.[].subfield"
                            let end = self.scan()?;
                            if end.token != Token::RBrack {
                                return Err(Error::parse("no closing ] found"));
                            }
                            buf.push_str(&dot.literal);
                            buf.push_str(&lex.literal);
                            buf.push_str(&end.literal);
                        }
                        _ => return Err(Error::parse("no field name found for RECORD")),
                    }
                }
                // RECORD.2.3
                Token::Float => buf.push_str(&dot.literal),
                _ => {
                    self.unscan(dot);
                    return Ok(buf);
                }
            }
        }
    }

    fn expect_lparen(&mut self) -> Result<()> {
        let beg = self.scan_ignore_space()?;
        if beg.token != Token::LParen {
            return Err(Error::parse(format!("{} found instead of (", q(&beg))));
        }
        Ok(())
    }

    fn expect_rparen(&mut self) -> Result<()> {
        let end = self.scan_ignore_space()?;
        if end.token != Token::RParen {
            return Err(Error::parse(format!("{} found instead of )", q(&end))));
        }
        Ok(())
    }

    // optional ", opt, opt..." before the closing paren
    fn parse_trailing_options(&mut self, opts: Options, positional: &[&str]) -> Result<Options> {
        let lex = self.scan_ignore_space()?;
        let opts = if lex.token == Token::Comma {
            self.parse_search_options(opts, positional)?
        } else {
            self.unscan(lex);
            opts
        };
        self.expect_rparen()?;
        Ok(opts)
    }

    // raw text until "," or the matching ")"
    fn parse_until_comma_or_rparen(&mut self) -> Result<String> {
        let mut buf = String::new();
        let mut depth = 1;
        loop {
            let lex = self.scan()?;
            match lex.token {
                Token::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        self.unscan(lex);
                        break;
                    }
                }
                Token::LParen => depth += 1,
                Token::Comma | Token::Eof => {
                    self.unscan(lex);
                    break;
                }
                _ => {}
            }
            buf.push_str(&lex.literal);
        }
        Ok(buf)
    }

    // ES, FHS, FEDS, PCRE2
    fn parse_search_expr(&mut self, opts: Options) -> Result<(String, Options)> {
        self.expect_lparen()?;

        let lex = self.scan_ignore_space()?;
        if !matches!(lex.token, Token::String | Token::Wcard) {
            return Err(Error::parse("no string expression found"));
        }
        let expr = self.parse_string_expr(&lex)?;

        let opts = self.parse_trailing_options(opts, &[])?;
        Ok((expr, opts))
    }

    fn parse_date_expr(&mut self, opts: Options) -> Result<(String, Options)> {
        self.expect_lparen()?;
        let expr = check_date_expr(&self.parse_until_comma_or_rparen()?)?;
        let opts = self.parse_trailing_options(opts, &[])?;
        Ok((expr, opts))
    }

    fn parse_time_expr(&mut self, opts: Options) -> Result<(String, Options)> {
        self.expect_lparen()?;
        let expr = check_time_expr(&self.parse_until_comma_or_rparen()?)?;
        let opts = self.parse_trailing_options(opts, &[])?;
        Ok((expr, opts))
    }

    // NUMBER, CURRENCY, IPV4, IPV6: [<val> <op>] KEYWORD <op> <val>
    fn parse_range_expr(&mut self, opts: Options, spec: &RangeExpr) -> Result<(String, Options)> {
        self.expect_lparen()?;

        let mut x = String::new();
        let mut xop = String::new();
        let lex = self.scan_ignore_space()?;
        if spec.values.contains(&lex.token) {
            x = lex.unquoted().to_string();
            let op = self.scan_ignore_space()?;
            if !matches!(op.token, Token::Ls | Token::Leq | Token::Gt | Token::Geq) {
                return Err(Error::parse(format!("{} found instead of < or <=", q(&op))));
            }
            xop = op.literal;
        } else {
            self.unscan(lex);
        }

        let lex = self.scan_ignore_space()?;
        if !(spec.is_keyword)(&lex) {
            return Err(Error::parse(format!("{} found instead of {}", q(&lex), spec.keyword)));
        }

        let op = self.scan_ignore_space()?;
        let yop = match op.token {
            Token::Ls | Token::Leq | Token::Gt | Token::Geq => op.literal,
            Token::Eq | Token::Deq | Token::Neq if xop.is_empty() => op.literal,
            _ => return Err(Error::parse(format!("{} found instead of < or <=", q(&op)))),
        };

        let lex = self.scan_ignore_space()?;
        if !spec.values.contains(&lex.token) {
            return Err(Error::parse(format!("{} found instead of value", q(&lex))));
        }
        let y = lex.unquoted().to_string();

        let expr = if !x.is_empty() {
            let (x, xop, yop, y) = swap_greater(x, xop, yop, y);
            format!(r#""{}" {} {} {} "{}""#, x, xop, spec.keyword, yop, y)
        } else {
            format!(r#"{} {} "{}""#, spec.keyword, normalize_eq(yop), y)
        };

        let opts = self.parse_trailing_options(opts, spec.positional)?;
        Ok((expr, opts))
    }

    fn parse_search_options(&mut self, mut opts: Options, positional: &[&str]) -> Result<Options> {
        let mut positional = positional;
        let mut i = 0;
        loop {
            let option = self.parse_until_comma_or_rparen()?;
            let option = option.trim();
            if !option.is_empty() {
                let named = opts
                    .set(option, positional.get(i).copied())
                    .map_err(|e| e.wrap("failed to parse option"))?;
                if named {
                    // named option stops positional ones
                    positional = &[];
                }
            }
            i += 1;

            let lex = self.scan_ignore_space()?;
            if lex.token != Token::Comma {
                self.unscan(lex);
                return Ok(opts);
            }
        }
    }

    // adjacent strings and wildcards, e.g. "he"??"o"
    fn parse_string_expr(&mut self, start: &Lexeme) -> Result<String> {
        let mut buf = start.literal.clone();
        loop {
            let lex = self.scan_ignore_space()?;
            if matches!(lex.token, Token::String | Token::Wcard) {
                buf.push_str(&lex.literal);
            } else {
                self.unscan(lex);
                return Ok(buf);
            }
        }
    }

    // bare words and numbers up to a keyword, quoted as one string
    fn parse_ident_expr(&mut self, start: Lexeme) -> Result<String> {
        let mut res = vec![start];
        loop {
            let lex = self.scan()?;
            let keep = match lex.token {
                Token::Ws | Token::Int | Token::Float => true,
                Token::Ident => {
                    !(lex.is_and() || lex.is_or() || lex.is_xor() || lex.is_record() || lex.is_raw_text())
                }
                _ => false,
            };
            if !keep {
                self.unscan(lex);
                break;
            }
            res.push(lex);
        }

        while res.last().is_some_and(|lex| lex.token == Token::Ws) {
            res.pop();
        }

        let body: String = res.iter().map(|lex| lex.literal.as_str()).collect();
        Ok(format!("\"{}\"", body))
    }

    pub(crate) fn parse_string_val(&mut self) -> Result<String> {
        let val = self.scan_ignore_space()?;
        match val.token {
            Token::String => Ok(val.unquoted().to_string()),
            Token::Ident | Token::Int | Token::Float => Ok(val.literal),
            _ => Err(Error::option(format!("{} found instead of string value", q(&val)))),
        }
    }

    pub(crate) fn parse_int_val(&mut self, min: i64, max: i64) -> Result<i64> {
        let val = self.scan_ignore_space()?;
        if !matches!(val.token, Token::Int | Token::String) {
            let err = Error::option(format!("{} found instead of integer value", q(&val)));
            self.unscan(val);
            return Err(err);
        }

        let text = val.unquoted().trim().to_string();
        let i = match text.parse::<i64>() {
            Ok(i) => i,
            Err(e) => {
                self.unscan(val);
                return Err(Error::option(format!("failed to parse integer {:?}: {}", text, e)));
            }
        };
        if i < min || max < i {
            self.unscan(val);
            return Err(Error::option(format!("value {} is out of range [{},{}]", i, min, max)));
        }
        Ok(i)
    }

    pub(crate) fn parse_bool_val(&mut self) -> Result<bool> {
        let val = self.scan_ignore_space()?;
        if !matches!(val.token, Token::Int | Token::Ident | Token::String) {
            return Err(Error::option(format!("{} found instead of boolean value", q(&val))));
        }
        match val.unquoted().trim() {
            "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
            "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
            other => Err(Error::option(format!("failed to parse boolean {:?}", other))),
        }
    }
}

struct RangeExpr {
    keyword: &'static str,
    is_keyword: fn(&Lexeme) -> bool,
    values: &'static [Token],
    positional: &'static [&'static str],
}

static NUMBER_EXPR: RangeExpr = RangeExpr {
    keyword: "NUM",
    is_keyword: Lexeme::is_num,
    values: &[Token::String, Token::Float, Token::Int],
    positional: &["SEPARATOR", "DECIMAL"],
};

static CURRENCY_EXPR: RangeExpr = RangeExpr {
    keyword: "CUR",
    is_keyword: Lexeme::is_cur,
    values: &[Token::String, Token::Float, Token::Int],
    positional: &["SYMBOL", "SEPARATOR", "DECIMAL"],
};

static IPV4_EXPR: RangeExpr = RangeExpr {
    keyword: "IP",
    is_keyword: Lexeme::is_ip,
    values: &[Token::String],
    positional: &["OCTAL"],
};

static IPV6_EXPR: RangeExpr = RangeExpr {
    keyword: "IP",
    is_keyword: Lexeme::is_ip,
    values: &[Token::String],
    positional: &[],
};

// `a > X >= b` is rewritten as `b <= X < a`
fn swap_greater(x: String, xop: String, yop: String, y: String) -> (String, String, String, String) {
    let greater = |op: &str| op == ">" || op == ">=";
    if greater(&xop) && greater(&yop) {
        (y, yop.replace('>', "<"), xop.replace('>', "<"), x)
    } else {
        (x, xop, yop, y)
    }
}

fn normalize_eq(op: String) -> String {
    if op == "==" { "=".to_string() } else { op }
}

const DATE_FORMATS: &str = "YYYY.MM.DD|YY.MM.DD|DD.MM.YYYY|DD.MM.YY|MM.DD.YYYY|MM.DD.YY";
const DATE_VALUE: &str = r"\d+.\d+.\d+";
const TIME_VALUE3: &str = r"\d+.\d+.\d+";
const TIME_VALUE4: &str = r"\d+.\d+.\d+.\d+";

fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static pattern")
}

static DATE_F2: LazyLock<Regex> = LazyLock::new(|| {
    regex(&format!(
        r#"^\s*({})\s*"?(<|<=|>|>=|=|==|!=)\s*"?({})"?\s*$"#,
        DATE_FORMATS, DATE_VALUE
    ))
});
static DATE_F3: LazyLock<Regex> = LazyLock::new(|| {
    regex(&format!(
        r#"^\s*"?({})"?\s*(<|<=|>|>=)\s*({})\s*"?(<|<=|>|>=)\s*"?({})"?\s*$"#,
        DATE_VALUE, DATE_FORMATS, DATE_VALUE
    ))
});
static DATE_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| regex(r"^(YYYY|YY|MM|DD)(.)(YYYY|YY|MM|DD)(.)(YYYY|YY|MM|DD)$"));
static DATE_VALUE_PARTS: LazyLock<Regex> = LazyLock::new(|| regex(r"^(\d+)(.)(\d+)(.)(\d+)$"));

static TIME_F23: LazyLock<Regex> = LazyLock::new(|| {
    regex(&format!(
        r#"^\s*(HH.MM.SS)\s*"?(<|<=|>|>=|=|==|!=)\s*"?({})"?\s*$"#,
        TIME_VALUE3
    ))
});
static TIME_F24: LazyLock<Regex> = LazyLock::new(|| {
    regex(&format!(
        r#"^\s*(HH.MM.SS.ss)\s*"?(<|<=|>|>=|=|==|!=)\s*"?({})"?\s*$"#,
        TIME_VALUE4
    ))
});
static TIME_F33: LazyLock<Regex> = LazyLock::new(|| {
    regex(&format!(
        r#"^\s*"?({})"?\s*(<|<=|>|>=)\s*(HH.MM.SS)\s*"?(<|<=|>|>=)\s*"?({})"?\s*$"#,
        TIME_VALUE3, TIME_VALUE3
    ))
});
static TIME_F34: LazyLock<Regex> = LazyLock::new(|| {
    regex(&format!(
        r#"^\s*"?({})"?\s*(<|<=|>|>=)\s*(HH.MM.SS.ss)\s*"?(<|<=|>|>=)\s*"?({})"?\s*$"#,
        TIME_VALUE4, TIME_VALUE4
    ))
});
static TIME_FORMAT: LazyLock<Regex> = LazyLock::new(|| regex(r"^(HH)(.)(MM)(.)(SS)(.)?(ss)?$"));
static TIME_VALUE_PARTS: LazyLock<Regex> =
    LazyLock::new(|| regex(r"^(\d+)(.)(\d+)(.)(\d+)(.)?(\d+)?$"));

/// Capture groups as plain strings, missing groups are empty
fn groups(re: &Regex, text: &str) -> Option<Vec<String>> {
    re.captures(text).map(|caps| {
        (1..caps.len())
            .map(|i| caps.get(i).map_or(String::new(), |m| m.as_str().to_string()))
            .collect()
    })
}

// x, xop, format, yop, y; x and xop are empty for the single-bound form
fn split_bounded(expr: &str, bounded: &[&Regex], single: &[&Regex]) -> Option<[String; 5]> {
    for re in bounded {
        if let Some(g) = groups(re, expr) {
            return Some([g[0].clone(), g[1].clone(), g[2].clone(), g[3].clone(), g[4].clone()]);
        }
    }
    for re in single {
        if let Some(g) = groups(re, expr) {
            return Some([String::new(), String::new(), g[0].clone(), g[1].clone(), g[2].clone()]);
        }
    }
    None
}

fn format_expr(x: String, xop: String, f: String, yop: String, y: String) -> String {
    if !x.is_empty() {
        let (x, xop, yop, y) = swap_greater(x, xop, yop, y);
        return format!("{} {} {} {} {}", x, xop, f, yop, y);
    }
    format!("{} {} {}", f, normalize_eq(yop), y)
}

/// Validate and normalize `DATE(...)` content
fn check_date_expr(expr: &str) -> Result<String> {
    let [x, xop, f, yop, y] = split_bounded(expr, &[&DATE_F3], &[&DATE_F2])
        .ok_or_else(|| Error::parse(format!("\"{}\" is unknown DATE expression", expr)))?;

    let fm = groups(&DATE_FORMAT, &f)
        .ok_or_else(|| Error::parse(format!("{:?} is unknown DATE format", f)))?;
    let sep = fm[1].clone();
    if fm[3] != sep {
        return Err(Error::parse(format!("{:?} DATE format contains bad separators", f)));
    }

    for value in [&x, &y] {
        match groups(&DATE_VALUE_PARTS, value) {
            Some(v) if v[1] != sep || v[3] != sep => {
                return Err(Error::parse(format!("{:?} DATE value contains bad separators", value)));
            }
            Some(_) => {}
            None if !value.is_empty() => {
                return Err(Error::parse(format!("{:?} is unknown DATE value", value)));
            }
            None => {}
        }
    }

    Ok(format_expr(x, xop, f, yop, y))
}

/// Validate and normalize `TIME(...)` content
fn check_time_expr(expr: &str) -> Result<String> {
    let [x, xop, f, yop, y] =
        split_bounded(expr, &[&TIME_F34, &TIME_F33], &[&TIME_F24, &TIME_F23])
            .ok_or_else(|| Error::parse(format!("\"{}\" is unknown TIME expression", expr)))?;

    let fm = groups(&TIME_FORMAT, &f)
        .ok_or_else(|| Error::parse(format!("{:?} is unknown TIME format", f)))?;
    let sep = fm[1].clone();
    if fm[3] != sep || (!fm[5].is_empty() && fm[5] != sep) {
        return Err(Error::parse(format!("{:?} TIME format contains bad separators", f)));
    }

    for value in [&x, &y] {
        match groups(&TIME_VALUE_PARTS, value) {
            Some(v) if v[1] != sep || v[3] != sep || (!v[5].is_empty() && v[5] != sep) => {
                return Err(Error::parse(format!("{:?} TIME value contains bad separators", value)));
            }
            Some(_) => {}
            None if !value.is_empty() => {
                return Err(Error::parse(format!("{:?} is unknown TIME value", value)));
            }
            None => {}
        }
    }

    Ok(format_expr(x, xop, f, yop, y))
}

fn width_arg(opts: &Options, args: &mut Vec<String>) {
    if opts.width < 0 {
        args.push(r#"LINE="true""#.to_string());
    } else if opts.width > 0 {
        args.push(format!(r#"WIDTH="{}""#, opts.width));
    }
}

/// Compatibility rendering of a search expression
pub fn expr_old(expr: &str, opts: &Options) -> String {
    match opts.mode {
        Some(Mode::Ds) => format!("DATE({})", expr),
        Some(Mode::Ts) => format!("TIME({})", expr),
        Some(Mode::Ns) => format!(
            r#"NUMBER({}, "{}", "{}")"#,
            expr, opts.digit_separator, opts.decimal_point
        ),
        Some(Mode::Cs) => format!(
            r#"CURRENCY({}, "{}", "{}", "{}")"#,
            expr, opts.currency_symbol, opts.digit_separator, opts.decimal_point
        ),
        Some(Mode::Ipv4) if opts.octal => format!("IPV4({}, USE_OCTAL)", expr),
        Some(Mode::Ipv4) => format!("IPV4({})", expr),
        Some(Mode::Ipv6) => format!("IPV6({})", expr),
        _ => expr.to_string(),
    }
}

/// Generic rendering with explicit keyword arguments
pub fn expr_new(expr: &str, opts: &Options) -> String {
    let mut args = vec![expr.to_string()];
    let name = match opts.mode {
        None => return expr.to_string(),
        Some(Mode::Es) => {
            width_arg(opts, &mut args);
            if !opts.case {
                args.push(r#"CASE="false""#.to_string());
            }
            "EXACT"
        }
        Some(Mode::Fhs) | Some(Mode::Feds) => {
            if opts.dist != 0 {
                args.push(format!(r#"DISTANCE="{}""#, opts.dist));
            }
            width_arg(opts, &mut args);
            if !opts.case {
                args.push(r#"CASE="false""#.to_string());
            }
            if opts.mode == Some(Mode::Fhs) {
                "HAMMING"
            } else {
                if opts.reduce {
                    args.push(r#"REDUCE="true""#.to_string());
                }
                "EDIT_DISTANCE"
            }
        }
        Some(Mode::Ds) => {
            width_arg(opts, &mut args);
            "DATE"
        }
        Some(Mode::Ts) => {
            width_arg(opts, &mut args);
            "TIME"
        }
        Some(Mode::Ns) => {
            width_arg(opts, &mut args);
            args.push(format!(r#"SEPARATOR="{}""#, opts.digit_separator));
            args.push(format!(r#"DECIMAL="{}""#, opts.decimal_point));
            "NUMBER"
        }
        Some(Mode::Cs) => {
            width_arg(opts, &mut args);
            args.push(format!(r#"SYMBOL="{}""#, opts.currency_symbol));
            args.push(format!(r#"SEPARATOR="{}""#, opts.digit_separator));
            args.push(format!(r#"DECIMAL="{}""#, opts.decimal_point));
            "CURRENCY"
        }
        Some(Mode::Ipv4) => {
            width_arg(opts, &mut args);
            if opts.octal {
                args.push(r#"OCTAL="true""#.to_string());
            }
            "IPV4"
        }
        Some(Mode::Ipv6) => {
            width_arg(opts, &mut args);
            "IPV6"
        }
        Some(Mode::Pcre2) => {
            width_arg(opts, &mut args);
            "PCRE2"
        }
    };
    format!("{}({})", name, args.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    // simple predicate: (old + options, new + options, structured)
    fn simple(data: &str) -> (String, String, bool) {
        let mut p = Parser::new(data);
        let res = p.parse_simple_query().unwrap();
        assert!(p.eof().unwrap(), "not fully parsed: {}", data);
        (
            format!("{}{}", res.expr_old, res.options),
            format!("{}{}", res.expr_new, res.options),
            res.structured,
        )
    }

    fn bad_simple(data: &str, expected: &str) {
        let err = Parser::new(data).parse_simple_query().unwrap_err();
        assert!(
            err.context.contains(expected),
            "data: {}, error: {}",
            data,
            err
        );
    }

    fn parsed(data: &str) -> String {
        parse_query(data).unwrap().to_old_string()
    }

    fn bad(data: &str, expected: &str) {
        let err = parse_query(data).unwrap_err();
        assert!(err.context.contains(expected), "data: {}, error: {}", data, err);
    }

    #[test]
    fn test_plain_queries() {
        let (old, new, structured) = simple(r#"   "hello"  "#);
        assert_eq!(old, r#"(RAW_TEXT CONTAINS "hello")[es]"#);
        assert_eq!(new, r#"(RAW_TEXT CONTAINS EXACT("hello"))[es]"#);
        assert!(!structured);

        assert_eq!(simple(r#""he"??"o""#).1, r#"(RAW_TEXT CONTAINS EXACT("he"??"o"))[es]"#);
        assert_eq!(simple("  hello  ").1, r#"(RAW_TEXT CONTAINS EXACT("hello"))[es]"#);
        assert_eq!(simple("hello world").1, r#"(RAW_TEXT CONTAINS EXACT("hello world"))[es]"#);
        assert_eq!(simple("123").1, r#"(RAW_TEXT CONTAINS EXACT("123"))[es]"#);
        assert_eq!(simple("123.456").0, r#"(RAW_TEXT CONTAINS "123.456")[es]"#);
    }

    #[test]
    fn test_inputs_and_operators() {
        assert_eq!(
            simple(r#" RECORD.text CONTAINS "hello" "#),
            (
                r#"(RECORD.text CONTAINS "hello")[es]"#.to_string(),
                r#"(RECORD.text CONTAINS EXACT("hello"))[es]"#.to_string(),
                true
            )
        );
        assert_eq!(simple(r#"RECORD.[] CONTAINS "x""#).1, r#"(RECORD.[] CONTAINS EXACT("x"))[es]"#);
        assert_eq!(simple(r#"record.a.2.b EQUALS "x""#).1, r#"(RECORD.a.2.b EQUALS EXACT("x"))[es]"#);
        assert_eq!(simple(r#"RAW_TEXT not_contains "x""#).1, r#"(RAW_TEXT NOT_CONTAINS EXACT("x"))[es]"#);
        assert_eq!(simple(r#"RAW_TEXT NOT_EQUALS "x""#).1, r#"(RAW_TEXT NOT_EQUALS EXACT("x"))[es]"#);

        bad_simple(",", "expected RAW_TEXT or RECORD");
        bad_simple("", "expected RAW_TEXT or RECORD");
        bad_simple(r#"RECORD. CONTAINS "hello""#, "no field name found for RECORD");
        bad_simple(r#"RECORD., CONTAINS "hello""#, "no field name found for RECORD");
        bad_simple(r#"RECORD.[ CONTAINS "hello""#, "no closing ] found");
        bad_simple(r#"RAW_TEXT IS "hello""#, "expected CONTAINS or EQUALS");
        bad_simple(" RAW_TEXT CONTAINS 123 ", "is unexpected expression");
    }

    #[test]
    fn test_search_types() {
        assert_eq!(simple(r#"RAW_TEXT CONTAINS ?"#).1, "(RAW_TEXT CONTAINS EXACT(?))[es]");
        assert_eq!(
            simple(r#"RAW_TEXT CONTAINS FHS("hello",D=1)"#),
            (
                r#"(RAW_TEXT CONTAINS "hello")[fhs,d=1]"#.to_string(),
                r#"(RAW_TEXT CONTAINS HAMMING("hello", DISTANCE="1"))[fhs,d=1]"#.to_string(),
                false
            )
        );
        assert_eq!(
            simple(r#"RAW_TEXT CONTAINS FEDS("hello", d=2, w=3, !cs, reduce)"#).1,
            r#"(RAW_TEXT CONTAINS EDIT_DISTANCE("hello", DISTANCE="2", WIDTH="3", CASE="false", REDUCE="true"))[feds,d=2,w=3,!cs,reduce]"#
        );
        assert_eq!(
            simple(r#"RAW_TEXT CONTAINS FHS("hello", d=0)"#).1,
            r#"(RAW_TEXT CONTAINS EXACT("hello"))[es]"#
        );
        assert_eq!(
            simple(r#"RAW_TEXT CONTAINS DATE(YY/MM/DD != 00/11/22)"#).1,
            "(RAW_TEXT CONTAINS DATE(YY/MM/DD != 00/11/22))[ds]"
        );
        assert_eq!(
            simple(r#"RAW_TEXT CONTAINS TIME(HH:MM:SS != 00:11:22)"#).0,
            "(RAW_TEXT CONTAINS TIME(HH:MM:SS != 00:11:22))[ts]"
        );
        assert_eq!(
            simple(r#"RAW_TEXT CONTAINS NUMBER(NUM != 0)"#),
            (
                r#"(RAW_TEXT CONTAINS NUMBER(NUM != "0", ",", "."))[ns,sep=",",dot="."]"#.to_string(),
                r#"(RAW_TEXT CONTAINS NUMBER(NUM != "0", SEPARATOR=",", DECIMAL="."))[ns,sep=",",dot="."]"#.to_string(),
                false
            )
        );
        assert_eq!(
            simple(r#"RAW_TEXT CONTAINS CURRENCY(CUR == 0)"#).1,
            r#"(RAW_TEXT CONTAINS CURRENCY(CUR = "0", SYMBOL="$", SEPARATOR=",", DECIMAL="."))[cs,sym="$",sep=",",dot="."]"#
        );
        assert_eq!(
            simple(r#"RAW_TEXT CONTAINS IPv4(IP != "0.0.0.0", OCT)"#),
            (
                r#"(RAW_TEXT CONTAINS IPV4(IP != "0.0.0.0", USE_OCTAL))[ipv4,octal]"#.to_string(),
                r#"(RAW_TEXT CONTAINS IPV4(IP != "0.0.0.0", OCTAL="true"))[ipv4,octal]"#.to_string(),
                false
            )
        );
        assert_eq!(
            simple(r#"RAW_TEXT CONTAINS IPv6(IP != "1::0")"#).1,
            r#"(RAW_TEXT CONTAINS IPV6(IP != "1::0"))[ipv6]"#
        );
        assert_eq!(
            simple(r#"RAW_TEXT CONTAINS PCRE2("[a-z]+", W=LINE)"#).1,
            r#"(RAW_TEXT CONTAINS PCRE2("[a-z]+", LINE="true"))[pcre2,line]"#
        );
    }

    #[test]
    fn test_structured_has_no_width() {
        let (_, new, structured) = simple(r#"RECORD.body CONTAINS ES("x", W=10)"#);
        assert!(structured);
        assert_eq!(new, r#"(RECORD.body CONTAINS EXACT("x"))[es]"#);
    }

    #[test]
    fn test_number_positional_options() {
        assert_eq!(
            parsed(r#"(RECORD.price CONTAINS NUMBER("450" < NUM < "600", ",", "."))"#),
            r#"P{(RECORD.price CONTAINS NUMBER("450" < NUM < "600", ",", "."))[ns,sep=",",dot="."]}"#
        );
        assert_eq!(
            parsed(r#"(RECORD.price CONTAINS CURRENCY("$450" < CUR < "$10,100.50", "$", ",", "."))"#),
            r#"P{(RECORD.price CONTAINS CURRENCY("$450" < CUR < "$10,100.50", "$", ",", "."))[cs,sym="$",sep=",",dot="."]}"#
        );
        assert_eq!(
            parsed(r#"RAW_TEXT CONTAINS NUMBER("600" > NUM >= "450", "-", DEC="x")"#),
            r#"(RAW_TEXT CONTAINS NUMBER("450" <= NUM < "600", "-", "x"))[ns,sep="-",dot="x"]"#
        );

        // a named option stops positional ones
        bad(
            r#"RAW_TEXT CONTAINS NUMBER(NUM > 1, DEC=".", ",")"#,
            "failed to parse option",
        );
    }

    #[test]
    fn test_date_and_time() {
        assert_eq!(
            parsed("(RAW_TEXT CONTAINS DATE(MM/DD/YY > 02/28/12))"),
            "P{(RAW_TEXT CONTAINS DATE(MM/DD/YY > 02/28/12))[ds]}"
        );
        assert_eq!(
            parsed(r#"(RAW_TEXT CONTAINS DATE(MM/DD/YY > "02/28/12", W=1))"#),
            "P{(RAW_TEXT CONTAINS DATE(MM/DD/YY > 02/28/12))[ds,w=1]}"
        );
        assert_eq!(
            parsed("(RAW_TEXT CONTAINS DATE(MM-DD-YY  ==  02-28-12))"),
            "P{(RAW_TEXT CONTAINS DATE(MM-DD-YY = 02-28-12))[ds]}"
        );
        assert_eq!(
            parsed("(RAW_TEXT CONTAINS DATE(01-19-15   >   MM-DD-YY   >=   02-28-12, L=true))"),
            "P{(RAW_TEXT CONTAINS DATE(02-28-12 <= MM-DD-YY < 01-19-15))[ds,line]}"
        );
        assert_eq!(
            parsed(r#"(RAW_TEXT CONTAINS TIME("02:28:12:55" < HH:MM:SS:ss < "01:19:15:56"))"#),
            "P{(RAW_TEXT CONTAINS TIME(02:28:12:55 < HH:MM:SS:ss < 01:19:15:56))[ts]}"
        );
        assert_eq!(
            parsed("((RECORD.Date CONTAINS DATE(MM/DD/YYYY!=04/15/2015))AND(RECORD.Date CONTAINS TIME(HH:MM:SS<=11:59:00)))"),
            "P{AND{P{(RECORD.Date CONTAINS DATE(MM/DD/YYYY != 04/15/2015))[ds]}, P{(RECORD.Date CONTAINS TIME(HH:MM:SS <= 11:59:00))[ts]}}}"
        );

        bad("(RAW_TEXT CONTAINS DATE(MMM_DD_YY == Feb-28-12))", "is unknown DATE expression");
        bad("(RAW_TEXT CONTAINS DATE(YY-MM-DD == 02-28-12", "found instead of )");
        bad("(RAW_TEXT CONTAINS DATE(MM_DD-YY == 02-28-12))", "DATE format contains bad separators");
        bad("(RAW_TEXT CONTAINS DATE(MM-DD-YY == 02_28_12))", "DATE value contains bad separators");
        bad("(RAW_TEXT CONTAINS DATE(02-28_12 <= MM-DD-YY < 02-28-12))", "DATE value contains bad separators");
        bad("(RAW_TEXT CONTAINS TIME(HH_MM-SS == 02-28-12))", "TIME format contains bad separators");
        bad("(RAW_TEXT CONTAINS TIME(HHH-MM-SS == Feb-28-12))", "is unknown TIME expression");
    }

    #[test]
    fn test_boolean_folding() {
        assert_eq!(
            parsed(r#""a" AND "b" AND "c""#),
            r#"AND{(RAW_TEXT CONTAINS "a")[es], (RAW_TEXT CONTAINS "b")[es], (RAW_TEXT CONTAINS "c")[es]}"#
        );
        assert_eq!(
            parsed(r#""a" or "b" and "c""#),
            r#"OR{(RAW_TEXT CONTAINS "a")[es], AND{(RAW_TEXT CONTAINS "b")[es], (RAW_TEXT CONTAINS "c")[es]}}"#
        );
        assert_eq!(
            parsed(r#""a" XOR "b" OR "c""#),
            r#"OR{XOR{(RAW_TEXT CONTAINS "a")[es], (RAW_TEXT CONTAINS "b")[es]}, (RAW_TEXT CONTAINS "c")[es]}"#
        );
        assert_eq!(
            parsed(r#"("a" AND "b") AND "c""#),
            r#"AND{P{AND{(RAW_TEXT CONTAINS "a")[es], (RAW_TEXT CONTAINS "b")[es]}}, (RAW_TEXT CONTAINS "c")[es]}"#
        );
        assert_eq!(
            parsed(r#"{"a" OR "b"} AND ["c"]"#),
            r#"AND{B{OR{(RAW_TEXT CONTAINS "a")[es], (RAW_TEXT CONTAINS "b")[es]}}, S{(RAW_TEXT CONTAINS "c")[es]}}"#
        );
    }

    #[test]
    fn test_bracket_errors() {
        bad(r#"("a""#, r#""" found instead of )"#);
        bad(r#"("a"]"#, r#""]" found instead of )"#);
        bad(r#"{"a")"#, r#"")" found instead of }"#);
        bad(r#"["a"}"#, r#""}" found instead of ]"#);
        bad(r#""a" "b" )"#, "not fully parsed");
        bad(r#"RAW_TEXT CONTAINS ES("a""#, "found instead of )");
        bad("RAW_TEXT CONTAINS ES(abc)", "no string expression found");
        bad(r#"RAW_TEXT CONTAINS ES "a""#, "found instead of (");
        bad(r#"RAW_TEXT CONTAINS ES("a", x=1)"#, "unknown option");

        let err = parse_query(r#"RAW_TEXT CONTAINS ES("a", w=-1)"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Option);
        assert!(err.context.starts_with("failed to parse option: "));
    }

    #[test]
    fn test_base_options() {
        let mut opts = Options::default();
        opts.mode = Some(Mode::Fhs);
        opts.dist = 1;
        opts.width = 2;
        let q = parse_query_opt(r#""hello""#, opts).unwrap();
        assert_eq!(
            q.simple.unwrap().expr_new,
            r#"(RAW_TEXT CONTAINS HAMMING("hello", DISTANCE="1", WIDTH="2"))"#
        );
    }

    #[test]
    fn test_replace_record_and_fields() {
        let mut fields = HashMap::new();
        fields.insert("name".to_string(), "2".to_string());
        let q = parse_query_ex(
            r#"RECORD."name" CONTAINS "x" AND RECORD.other CONTAINS "y""#,
            Options::default(),
            "CRECORD",
            fields,
        )
        .unwrap();
        assert_eq!(
            q.to_string(),
            r#"AND{(CRECORD.2 CONTAINS EXACT("x"))[es], (CRECORD.other CONTAINS EXACT("y"))[es]}"#
        );
    }

    #[test]
    fn test_render_round_trip() {
        let queries = [
            r#"(RAW_TEXT CONTAINS "hello") AND (RECORD.a CONTAINS FHS("x", d=2))"#,
            r#"hello OR {RECORD.b CONTAINS DATE(MM/DD/YY > 02/28/12)}"#,
            r#"[RAW_TEXT CONTAINS NUMBER("1" < NUM < "5", ",", ".")] XOR world"#,
        ];
        for data in queries {
            let first = parse_query(data).unwrap();
            let rendered = render(&first);
            let second = parse_query(&rendered).unwrap();
            assert_eq!(first.to_string(), second.to_string(), "rendered: {}", rendered);
        }
    }

    // textual query equivalent to the parsed tree
    fn render(q: &Query) -> String {
        if let Some(simple) = &q.simple {
            // outer parens would add a P node
            let expr = &simple.expr_new;
            return expr[1..expr.len() - 1].to_string();
        }
        let args: Vec<String> = q.arguments.iter().map(render).collect();
        match q.operator {
            Some(Operator::P) => format!("({})", args.join("")),
            Some(Operator::B) => format!("{{{}}}", args.join("")),
            Some(Operator::S) => format!("[{}]", args.join("")),
            Some(op) => args.join(&format!(" {} ", op)),
            None => String::new(),
        }
    }
}
