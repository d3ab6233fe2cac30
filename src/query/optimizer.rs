use serde::{Serialize, Deserialize};
use crate::query::ast::{NO_COMBINE, Operator, Query, SimpleQuery};
use crate::query::options::{Options, select_file_filter};

/// Combine limit meaning "fuse as much as possible"
pub const NO_LIMIT: i32 = -1;

/// Fuses adjacent compatible predicates into one backend expression
/// so a tree needs fewer backend calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Optimizer {
    pub combine_limit: i32,         // max fused operators, NO_LIMIT for unbounded
    pub except_modes: Vec<String>,  // search modes never fused
}

impl Default for Optimizer {
    fn default() -> Self {
        Optimizer {
            combine_limit: NO_LIMIT,
            except_modes: Vec::new(),
        }
    }
}

/// Optimize with the given combine limit and excluded modes
pub fn optimize(q: Query, limit: i32, except: &[String]) -> Query {
    Optimizer {
        combine_limit: limit,
        except_modes: except.to_vec(),
    }
    .process(q)
}

impl Optimizer {
    pub fn new(combine_limit: i32, except_modes: Vec<String>) -> Self {
        Optimizer { combine_limit, except_modes }
    }

    pub fn process(&self, q: Query) -> Query {
        let mut q = q;
        match q.operator {
            Some(op @ (Operator::B | Operator::S)) => {
                let mut res = self.combine(q);
                res.bool_ops = NO_COMBINE;
                res.operator = Some(op);
                res
            }
            Some(op) if !q.arguments.is_empty() => {
                let mut rest = std::mem::take(&mut q.arguments).into_iter();
                let mut args = Vec::new();
                let mut a = match rest.next() {
                    Some(first) => self.process(first),
                    None => return q,
                };
                let mut first = true;

                for b in rest {
                    let b = self.process(b);
                    if self.can_combine(&a, &b, op) {
                        a = fuse(&a, &b, op, first);
                        first = false;
                    } else {
                        args.push(a);
                        a = b;
                        first = true;
                    }
                }
                args.push(a);

                if args.len() == 1 {
                    return args.remove(0);
                }
                q.arguments = args;
                q
            }
            _ => q,
        }
    }

    /// Collapse a whole subtree into a single leaf
    pub fn combine(&self, q: Query) -> Query {
        if q.operator.is_none() || q.arguments.is_empty() {
            return q;
        }
        let op = q.operator.map_or("", |op| op.as_str());
        let mut args = q.arguments;
        if args.len() == 1 {
            return self.combine(args.remove(0));
        }

        let n = args.len() as i32;
        let mut res = Query {
            bool_ops: n - 1,
            bool_count: (n - 1) as usize,
            ..Query::default()
        };
        let mut old = Vec::with_capacity(args.len());
        let mut new = Vec::with_capacity(args.len());
        let mut opts: Option<Options> = None;
        let mut structured = true;

        for arg in args {
            let a = self.combine(arg);
            res.bool_ops += a.bool_ops;
            res.bool_count += a.bool_count;

            let simple = match a.simple {
                Some(simple) => simple,
                None => continue,
            };
            old.push(wrapped(&simple.expr_old, a.bool_ops != 0));
            new.push(wrapped(&simple.expr_new, a.bool_ops != 0));

            opts = Some(match opts {
                None => simple.options,
                Some(prev) => {
                    let ff = select_file_filter(&prev, &simple.options);
                    let mut next = if prev.same_as(&simple.options) { prev } else { Options::empty() };
                    next.file_filter = ff;
                    next
                }
            });
            structured = structured && simple.structured;
        }

        let sep = format!(" {} ", op);
        res.simple = Some(SimpleQuery {
            structured,
            expr_old: old.join(&sep),
            expr_new: new.join(&sep),
            options: opts.unwrap_or_default(),
        });
        res
    }

    fn can_combine(&self, a: &Query, b: &Query, op: Operator) -> bool {
        if a.bool_ops < 0 || b.bool_ops < 0 {
            return false;
        }

        match (a.is_structured(), b.is_structured()) {
            // two RAW_TEXT searches fuse only under OR
            (false, false) if op != Operator::Or => return false,
            (true, false) | (false, true) => return false,
            _ => {}
        }

        let lim = self.limit(a, b);
        if lim >= 0 && a.bool_ops + b.bool_ops >= lim {
            return false;
        }

        let excluded = |q: &Query| {
            q.simple
                .as_ref()
                .and_then(|s| s.options.mode)
                .is_some_and(|mode| {
                    self.except_modes.iter().any(|m| m.eq_ignore_ascii_case(mode.as_str()))
                })
        };
        !(excluded(a) || excluded(b))
    }

    // combine limit applies to two leaves only
    fn limit(&self, a: &Query, b: &Query) -> i32 {
        if a.simple.is_some() && b.simple.is_some() {
            self.combine_limit
        } else {
            0
        }
    }
}

fn wrapped(expr: &str, parens: bool) -> String {
    if parens { format!("({})", expr) } else { expr.to_string() }
}

// both arguments are leaves here, can_combine checked it
fn fuse(a: &Query, b: &Query, op: Operator, first: bool) -> Query {
    let (sa, sb) = match (&a.simple, &b.simple) {
        (Some(sa), Some(sb)) => (sa, sb),
        _ => return a.clone(),
    };

    let mut options = if sa.options.same_as(&sb.options) {
        sa.options.clone()
    } else {
        Options::empty()
    };
    options.file_filter = select_file_filter(&sa.options, &sb.options);

    let wrap_a = a.bool_ops != 0 && first;
    let wrap_b = b.bool_ops != 0;
    Query {
        simple: Some(SimpleQuery {
            structured: sa.structured && sb.structured,
            expr_old: format!("{} {} {}", wrapped(&sa.expr_old, wrap_a), op, wrapped(&sb.expr_old, wrap_b)),
            expr_new: format!("{} {} {}", wrapped(&sa.expr_new, wrap_a), op, wrapped(&sb.expr_new, wrap_b)),
            options,
        }),
        bool_ops: a.bool_ops + b.bool_ops + 1,
        bool_count: a.bool_count + b.bool_count + 1,
        ..Query::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::options::Mode;
    use crate::query::parser::parse_query;

    fn check_combine(structured: bool, data: &str, expected: &str) {
        let q = parse_query(data).unwrap();
        let res = Optimizer::default().combine(q);
        assert_eq!(res.to_string(), expected, "data: {}", data);
        assert_eq!(res.is_structured(), structured, "data: {}", data);
    }

    fn check(limit: i32, except: &[&str], structured: bool, data: &str, expected: &str) {
        let q = parse_query(data).unwrap();
        let except: Vec<String> = except.iter().map(|s| s.to_string()).collect();
        let res = optimize(q, limit, &except);
        assert_eq!(res.to_string(), expected, "data: {}", data);
        assert_eq!(res.is_structured(), structured, "data: {}", data);
    }

    const CHAIN: &str = r#"(RECORD CONTAINS "A") AND (RECORD CONTAINS "B") AND (RECORD CONTAINS "C") AND (RECORD CONTAINS "D") AND (RECORD CONTAINS "E") AND (RECORD CONTAINS "F")"#;

    #[test]
    fn test_combine_single() {
        for data in [
            r#""hello""#,
            r#"( "hello" )"#,
            r#"RAW_TEXT CONTAINS "hello""#,
            r#"{RAW_TEXT CONTAINS "hello"}"#,
            r#"{{RAW_TEXT CONTAINS "hello"}}"#,
            r#"({RAW_TEXT CONTAINS "hello"})"#,
        ] {
            check_combine(false, data, r#"(RAW_TEXT CONTAINS EXACT("hello"))[es]"#);
        }
        check_combine(true, r#"{(RECORD CONTAINS "hello")}"#, r#"(RECORD CONTAINS EXACT("hello"))[es]"#);
    }

    #[test]
    fn test_combine_operators() {
        check_combine(
            false,
            r#"(RAW_TEXT EQUALS "100") XOR ((RAW_TEXT EQUALS "200"))"#,
            r#"(RAW_TEXT EQUALS EXACT("100")) XOR (RAW_TEXT EQUALS EXACT("200"))[es]x1"#,
        );
        check_combine(
            false,
            r#"(RAW_TEXT EQUALS "100") OR (RAW_TEXT EQUALS "200") AND (RAW_TEXT EQUALS "300")"#,
            r#"(RAW_TEXT EQUALS EXACT("100")) OR ((RAW_TEXT EQUALS EXACT("200")) AND (RAW_TEXT EQUALS EXACT("300")))[es]x2"#,
        );
        check_combine(
            false,
            r#"(RAW_TEXT EQUALS "100") AND (RAW_TEXT EQUALS "200") OR (RAW_TEXT EQUALS "300") AND (RAW_TEXT EQUALS "400")"#,
            r#"((RAW_TEXT EQUALS EXACT("100")) AND (RAW_TEXT EQUALS EXACT("200"))) OR ((RAW_TEXT EQUALS EXACT("300")) AND (RAW_TEXT EQUALS EXACT("400")))[es]x3"#,
        );

        // different options are dropped, mixed inputs are not structured
        check_combine(
            true,
            r#"(RECORD EQUALS "100") AND (RECORD EQUALS FHS("200",D=1)) AND (RECORD EQUALS "300")"#,
            r#"(RECORD EQUALS EXACT("100")) AND (RECORD EQUALS HAMMING("200", DISTANCE="1")) AND (RECORD EQUALS EXACT("300"))x2"#,
        );
        check_combine(
            false,
            r#"(RECORD EQUALS "100") AND (RAW_TEXT EQUALS FHS("200",D=1)) AND (RECORD EQUALS "300")"#,
            r#"(RECORD EQUALS EXACT("100")) AND (RAW_TEXT EQUALS HAMMING("200", DISTANCE="1")) AND (RECORD EQUALS EXACT("300"))x2"#,
        );
    }

    #[test]
    fn test_combine_file_filter() {
        check_combine(
            false,
            r#"(RAW_TEXT CONTAINS ES("100", FF="100.txt")) OR (RAW_TEXT CONTAINS ES("200", FF="200.txt"))"#,
            r#"(RAW_TEXT CONTAINS EXACT("100")) OR (RAW_TEXT CONTAINS EXACT("200"))[es,filter="200.txt"]x1"#,
        );
        check_combine(
            false,
            r#"{(RAW_TEXT CONTAINS ES("100", FF="100.txt")) OR (RAW_TEXT CONTAINS ES("200", FF=""))}"#,
            r#"(RAW_TEXT CONTAINS EXACT("100")) OR (RAW_TEXT CONTAINS EXACT("200"))[es,filter="100.txt"]x1"#,
        );
    }

    #[test]
    fn test_limits() {
        check(0, &[], true, CHAIN,
            r#"AND{(RECORD CONTAINS EXACT("A"))[es], (RECORD CONTAINS EXACT("B"))[es], (RECORD CONTAINS EXACT("C"))[es], (RECORD CONTAINS EXACT("D"))[es], (RECORD CONTAINS EXACT("E"))[es], (RECORD CONTAINS EXACT("F"))[es]}"#);
        check(1, &[], true, CHAIN,
            r#"AND{(RECORD CONTAINS EXACT("A")) AND (RECORD CONTAINS EXACT("B"))[es]x1, (RECORD CONTAINS EXACT("C")) AND (RECORD CONTAINS EXACT("D"))[es]x1, (RECORD CONTAINS EXACT("E")) AND (RECORD CONTAINS EXACT("F"))[es]x1}"#);
        check(2, &[], true, CHAIN,
            r#"AND{(RECORD CONTAINS EXACT("A")) AND (RECORD CONTAINS EXACT("B")) AND (RECORD CONTAINS EXACT("C"))[es]x2, (RECORD CONTAINS EXACT("D")) AND (RECORD CONTAINS EXACT("E")) AND (RECORD CONTAINS EXACT("F"))[es]x2}"#);
        check(3, &[], true, CHAIN,
            r#"AND{(RECORD CONTAINS EXACT("A")) AND (RECORD CONTAINS EXACT("B")) AND (RECORD CONTAINS EXACT("C")) AND (RECORD CONTAINS EXACT("D"))[es]x3, (RECORD CONTAINS EXACT("E")) AND (RECORD CONTAINS EXACT("F"))[es]x1}"#);
    }

    #[test]
    fn test_limits_nested() {
        check(0, &[], true,
            r#"(RECORD CONTAINS "A") AND ((RECORD CONTAINS "B") AND (RECORD CONTAINS "C")) AND ((RECORD CONTAINS "D") AND (RECORD CONTAINS "E")) AND (RECORD CONTAINS "F")"#,
            r#"AND{(RECORD CONTAINS EXACT("A"))[es], AND{(RECORD CONTAINS EXACT("B"))[es], (RECORD CONTAINS EXACT("C"))[es]}, AND{(RECORD CONTAINS EXACT("D"))[es], (RECORD CONTAINS EXACT("E"))[es]}, (RECORD CONTAINS EXACT("F"))[es]}"#);
        check(1, &[], true,
            r#"(RECORD CONTAINS "A") AND ((RECORD CONTAINS "B") AND (RECORD CONTAINS "C")) AND ((RECORD CONTAINS "D") AND (RECORD CONTAINS "E")) AND (RECORD CONTAINS "F")"#,
            r#"AND{(RECORD CONTAINS EXACT("A"))[es], (RECORD CONTAINS EXACT("B")) AND (RECORD CONTAINS EXACT("C"))[es]x1, (RECORD CONTAINS EXACT("D")) AND (RECORD CONTAINS EXACT("E"))[es]x1, (RECORD CONTAINS EXACT("F"))[es]}"#);
        check(2, &[], true,
            r#"(RECORD CONTAINS "A") AND ((RECORD CONTAINS "B") XOR (RECORD CONTAINS "C")) AND ((RECORD CONTAINS "D") OR (RECORD CONTAINS "E")) AND (RECORD CONTAINS "F")"#,
            r#"AND{(RECORD CONTAINS EXACT("A")) AND ((RECORD CONTAINS EXACT("B")) XOR (RECORD CONTAINS EXACT("C")))[es]x2, ((RECORD CONTAINS EXACT("D")) OR (RECORD CONTAINS EXACT("E"))) AND (RECORD CONTAINS EXACT("F"))[es]x2}"#);
    }

    #[test]
    fn test_raw_text_and_mixed_inputs() {
        check(10, &[], false,
            r#"(RECORD CONTAINS "A") AND (RAW_TEXT CONTAINS "B")"#,
            r#"AND{(RECORD CONTAINS EXACT("A"))[es], (RAW_TEXT CONTAINS EXACT("B"))[es]}"#);
        check(10, &[], false,
            r#"(RAW_TEXT CONTAINS "A") AND (RAW_TEXT CONTAINS "B")"#,
            r#"AND{(RAW_TEXT CONTAINS EXACT("A"))[es], (RAW_TEXT CONTAINS EXACT("B"))[es]}"#);
        check(10, &[], false,
            r#"(RAW_TEXT CONTAINS "A") OR (RAW_TEXT CONTAINS "B")"#,
            r#"(RAW_TEXT CONTAINS EXACT("A")) OR (RAW_TEXT CONTAINS EXACT("B"))[es]x1"#);
    }

    #[test]
    fn test_groups() {
        check(0, &[], false,
            r#"{(RAW_TEXT CONTAINS "A") AND (RAW_TEXT CONTAINS "B")}"#,
            r#"{}(RAW_TEXT CONTAINS EXACT("A")) AND (RAW_TEXT CONTAINS EXACT("B"))[es]x+"#);
        check(0, &[], false,
            r#"{(RAW_TEXT CONTAINS FHS("A",d=1)) AND (RAW_TEXT CONTAINS "B")}"#,
            r#"{}(RAW_TEXT CONTAINS HAMMING("A", DISTANCE="1")) AND (RAW_TEXT CONTAINS EXACT("B"))x+"#);
        check(10, &[], true,
            r#"{(RECORD CONTAINS FHS("A",d=1))} AND {(RECORD CONTAINS "B")}"#,
            r#"AND{{}(RECORD CONTAINS HAMMING("A", DISTANCE="1"))[fhs,d=1]x+, {}(RECORD CONTAINS EXACT("B"))[es]x+}"#);
        check(0, &[], false,
            r#"[(RAW_TEXT CONTAINS "A") AND (RAW_TEXT CONTAINS "B")]"#,
            r#"[](RAW_TEXT CONTAINS EXACT("A")) AND (RAW_TEXT CONTAINS EXACT("B"))[es]x+"#);
        check(10, &[], false,
            r#"[(RAW_TEXT CONTAINS FHS("A",d=1))] AND (RECORD CONTAINS "B")"#,
            r#"AND{[](RAW_TEXT CONTAINS HAMMING("A", DISTANCE="1"))[fhs,d=1]x+, (RECORD CONTAINS EXACT("B"))[es]}"#);
    }

    #[test]
    fn test_options_and_except_modes() {
        check(NO_LIMIT, &[], true,
            r#"((RECORD CONTAINS FHS("A",d=1)) AND (RECORD CONTAINS FEDS("B",d=2)))"#,
            r#"(RECORD CONTAINS HAMMING("A", DISTANCE="1")) AND (RECORD CONTAINS EDIT_DISTANCE("B", DISTANCE="2"))x1"#);

        let separate = r#"AND{(RECORD CONTAINS HAMMING("A", DISTANCE="1"))[fhs,d=1], (RECORD CONTAINS EDIT_DISTANCE("B", DISTANCE="1"))[feds,d=1]}"#;
        let data = r#"((RECORD CONTAINS FHS("A",d=1)) AND (RECORD CONTAINS FEDS("B",d=1)))"#;
        check(NO_LIMIT, &["fhs"], true, data, separate);
        check(NO_LIMIT, &["FEDS"], true, data, separate);
        check(NO_LIMIT, &["fhs", "feds"], true, data, separate);
    }

    #[test]
    fn test_real_life() {
        check(NO_LIMIT, &[], true,
            r#"((RECORD.doc.text_entry CONTAINS FHS("To", DIST=1)) AND (RECORD.doc.text_entry CONTAINS FHS("be", DIST=1)) AND (RECORD.doc.text_entry CONTAINS FHS("or", DIST=1)))"#,
            r#"(RECORD.doc.text_entry CONTAINS HAMMING("To", DISTANCE="1")) AND (RECORD.doc.text_entry CONTAINS HAMMING("be", DISTANCE="1")) AND (RECORD.doc.text_entry CONTAINS HAMMING("or", DISTANCE="1"))[fhs,d=1]x2"#);

        check(NO_LIMIT, &[], true,
            r#"( RECORD.block CONTAINS FHS(""?"INDIANA"?"",CS=true,DIST=0,WIDTH=0) )"#,
            r#"(RECORD.block CONTAINS EXACT(""?"INDIANA"?""))[es]"#);

        check(NO_LIMIT, &[], false,
            r#"((RAW_TEXT CONTAINS NUMBER("2000000" <= NUM <= "19999999999",SEPARATOR="-",DECIMAL="")) OR (RAW_TEXT CONTAINS NUMBER("2000000" <= NUM <= "19999999999",SEPARATOR=".",DECIMAL="")))"#,
            r#"(RAW_TEXT CONTAINS NUMBER("2000000" <= NUM <= "19999999999", SEPARATOR="-", DECIMAL="")) OR (RAW_TEXT CONTAINS NUMBER("2000000" <= NUM <= "19999999999", SEPARATOR=".", DECIMAL=""))x1"#);

        check(NO_LIMIT, &[], true,
            r#"(((RECORD.a CONTAINS FEDS("Lrd", DIST=2)) AND (RECORD.a CONTAINS FEDS("Halet", DIST=2))) AND (RECORD.b CONTAINS FEDS("PONIUS", DIST=2))) OR ((RECORD.b CONTAINS FEDS("PONIUS", DIST=2)) AND (RECORD.b CONTAINS FEDS("Hlet", DIST=2)))"#,
            r#"(((RECORD.a CONTAINS EDIT_DISTANCE("Lrd", DISTANCE="2")) AND (RECORD.a CONTAINS EDIT_DISTANCE("Halet", DISTANCE="2"))) AND (RECORD.b CONTAINS EDIT_DISTANCE("PONIUS", DISTANCE="2"))) OR ((RECORD.b CONTAINS EDIT_DISTANCE("PONIUS", DISTANCE="2")) AND (RECORD.b CONTAINS EDIT_DISTANCE("Hlet", DISTANCE="2")))[feds,d=2]x4"#);
    }

    #[test]
    fn test_limit_needs_two_leaves() {
        let o = Optimizer::new(1, Vec::new());
        assert_eq!(o.limit(&Query::default(), &Query::default()), 0);

        let leaf = |mode: Mode| {
            let mut options = Options::empty();
            options.mode = Some(mode);
            Query::leaf(SimpleQuery {
                structured: true,
                expr_old: String::new(),
                expr_new: String::new(),
                options,
            })
        };
        assert_eq!(o.limit(&leaf(Mode::Fhs), &leaf(Mode::Feds)), 1);
    }

    #[test]
    fn test_idempotent() {
        for limit in [NO_LIMIT, 0, 1, 2] {
            let once = optimize(parse_query(CHAIN).unwrap(), limit, &[]);
            let twice = optimize(once.clone(), limit, &[]);
            assert_eq!(once, twice, "limit: {}", limit);
        }
    }
}
