pub mod expr;
pub mod yaml;
