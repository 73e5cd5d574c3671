pub mod apply;
pub mod error;
pub mod expr;
pub mod fields;
pub mod path;
pub mod quantity;

pub use error::ExprError;
pub use expr::{Context, Program};
pub use fields::{path_managed_by, remove_field_path, FieldSet};
pub use path::{FieldPathSegment, PathExpr, Section};
pub use quantity::{compare_quantities, parse_quantity};
