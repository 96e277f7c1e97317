//! Building blocks of the `sdk-http-probe` command line tool.
pub mod error;
pub mod logs;
pub mod probe;
