pub mod lexeme;
pub mod scanner;
pub mod options;
pub mod ast;
pub mod parser;
pub mod optimizer;

pub use ast::{Operator, Query, SimpleQuery};
pub use options::{Mode, Options};
pub use optimizer::{NO_LIMIT, Optimizer, optimize};
pub use parser::{parse_query, parse_query_ex, parse_query_opt};
