pub mod date;
pub mod keys;
pub mod text;
pub mod value;

pub use date::{format_run_id, parse_legacy_date, parse_opt_date};
pub use text::{code_key, normalize_code, normalize_sex, normalize_string};
