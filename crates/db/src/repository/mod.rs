//! Repository functions, one function per database operation.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! No business logic: pure SQL plus the row ↔ record mapping. Text
//! columns holding enums are parsed back with `FromStr`; a value that
//! does not parse is reported as [`DbError::Corrupt`].

pub mod dataclips;
pub mod logs;
pub mod runs;
pub mod steps;
pub mod work_orders;
pub mod workflows;

use std::str::FromStr;

use crate::DbError;

pub(crate) fn parse_text<T>(table: &'static str, value: &str) -> Result<T, DbError>
where
    T: FromStr<Err = String>,
{
    value.parse().map_err(|e: String| DbError::corrupt(table, e))
}

pub(crate) fn parse_opt_text<T>(
    table: &'static str,
    value: Option<&str>,
) -> Result<Option<T>, DbError>
where
    T: FromStr<Err = String>,
{
    value.map(|v| parse_text(table, v)).transpose()
}

pub(crate) fn to_count(table: &'static str, value: i32) -> Result<u32, DbError> {
    u32::try_from(value).map_err(|_| DbError::corrupt(table, format!("negative count {value}")))
}

pub(crate) fn to_opt_count(
    table: &'static str,
    value: Option<i32>,
) -> Result<Option<u32>, DbError> {
    value.map(|v| to_count(table, v)).transpose()
}

/// Caps are stored as `INTEGER`; anything above `i32::MAX` is clamped.
pub(crate) fn from_opt_count(value: Option<u32>) -> Option<i32> {
    value.map(|v| i32::try_from(v).unwrap_or(i32::MAX))
}
