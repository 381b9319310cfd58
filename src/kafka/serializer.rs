use crate::{postgres::Row, Result};
use serde_json;

/// Encodes a row as the flat JSON document carried in each message.
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn serialize(row: &Row) -> Result<String> {
        serde_json::to_string(row).map_err(Into::into)
    }
}
