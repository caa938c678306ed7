pub mod lexer;
pub mod rewrite;
pub mod validator;

pub use rewrite::{extract_order_by, remove_limit_offset, strip_order_by, SortOverride};
pub use validator::{SqlValidator, ValidationOutcome};
