use std::fmt;
use crate::query::options::Options;

/// Optimizer sentinel: the node came from a `{...}` or `[...]` group
/// and must not be fused with its siblings.
pub const NO_COMBINE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    And,
    Or,
    Xor,
    P,  // (...) grouping
    B,  // {...} combine into one backend call
    S,  // [...] strict variant of B
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::And => "AND",
            Operator::Or => "OR",
            Operator::Xor => "XOR",
            Operator::P => "P",
            Operator::B => "B",
            Operator::S => "S",
        }
    }

    pub fn is_boolean(&self) -> bool {
        matches!(self, Operator::And | Operator::Or | Operator::Xor)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One relational expression, e.g. `(RAW_TEXT CONTAINS EXACT("hello"))`
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleQuery {
    pub structured: bool,   // RECORD input, false for RAW_TEXT
    pub expr_old: String,   // compatibility form
    pub expr_new: String,   // generic form
    pub options: Options,
}

impl fmt::Display for SimpleQuery {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", self.expr_new, self.options)
    }
}

/// Query tree node.
///
/// Parsed trees have either `simple` (a leaf) or `operator` with
/// `arguments`. After optimization a `{...}`/`[...]` group is a leaf that
/// keeps its B/S operator and carries `bool_ops == NO_COMBINE`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub operator: Option<Operator>,
    pub simple: Option<SimpleQuery>,
    pub arguments: Vec<Query>,
    pub bool_ops: i32,          // fused boolean operators, NO_COMBINE for groups
    pub bool_count: usize,      // actual number of boolean operators inside
}

impl Query {
    pub fn leaf(simple: SimpleQuery) -> Self {
        Query {
            simple: Some(simple),
            ..Query::default()
        }
    }

    pub fn compound(operator: Operator, arguments: Vec<Query>) -> Self {
        Query {
            operator: Some(operator),
            arguments,
            ..Query::default()
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.simple.is_some()
    }

    /// All leaves are structured (RECORD) searches
    pub fn is_structured(&self) -> bool {
        match &self.simple {
            Some(simple) => simple.structured,
            None => self.arguments.iter().all(Query::is_structured),
        }
    }

    /// At least one leaf is a structured search
    pub fn is_some_structured(&self) -> bool {
        match &self.simple {
            Some(simple) => simple.structured,
            None => self.arguments.iter().any(Query::is_some_structured),
        }
    }

    /// Number of leaves, i.e. backend calls needed to run the tree
    pub fn leaf_count(&self) -> usize {
        if self.is_leaf() {
            1
        } else {
            self.arguments.iter().map(Query::leaf_count).sum()
        }
    }

    /// Compact form using the compatibility expressions
    pub fn to_old_string(&self) -> String {
        self.render(&|s: &SimpleQuery| format!("{}{}", s.expr_old, s.options))
    }

    fn render(&self, leaf: &dyn Fn(&SimpleQuery) -> String) -> String {
        let mut buf = String::new();

        if let Some(op) = self.operator {
            match (op, self.simple.is_some()) {
                (Operator::B, true) => buf.push_str("{}"),
                (Operator::S, true) => buf.push_str("[]"),
                _ => buf.push_str(op.as_str()),
            }
        }
        if let Some(simple) = &self.simple {
            buf.push_str(&leaf(simple));
        }
        if !self.arguments.is_empty() {
            let args: Vec<String> = self.arguments.iter().map(|a| a.render(leaf)).collect();
            buf.push('{');
            buf.push_str(&args.join(", "));
            buf.push('}');
        }
        if self.bool_ops < 0 {
            buf.push_str("x+");
        } else if self.bool_ops > 0 {
            buf.push_str(&format!("x{}", self.bool_ops));
        }
        buf
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.render(&|s: &SimpleQuery| s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(expr: &str, structured: bool) -> Query {
        Query::leaf(SimpleQuery {
            structured,
            expr_old: expr.to_string(),
            expr_new: expr.to_string(),
            options: Options::empty(),
        })
    }

    #[test]
    fn test_structured_flags() {
        let q = Query::compound(Operator::And, vec![leaf("a", true), leaf("b", false)]);
        assert!(!q.is_structured());
        assert!(q.is_some_structured());
        assert_eq!(q.leaf_count(), 2);

        let q = Query::compound(Operator::Or, vec![leaf("a", true), leaf("b", true)]);
        assert!(q.is_structured());
    }

    #[test]
    fn test_display() {
        let q = Query::compound(
            Operator::And,
            vec![leaf("(A)", true), Query::compound(Operator::P, vec![leaf("(B)", true)])],
        );
        assert_eq!(q.to_string(), "AND{(A), P{(B)}}");

        let mut group = leaf("(A) OR (B)", false);
        group.operator = Some(Operator::B);
        group.bool_ops = NO_COMBINE;
        assert_eq!(group.to_string(), "{}(A) OR (B)x+");
    }
}
