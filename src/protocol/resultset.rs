//! Text-protocol result set decoding
//!
//! A COM_QUERY result set is: column count, one column definition per
//! column, EOF, zero or more rows, EOF (or ERR). Rows are sequences of
//! length-encoded strings where 0xFB marks NULL.

/// One decoded text-protocol row
pub type Row = Vec<Option<String>>;

/// Marker byte for a NULL column value in a text row
const NULL_MARKER: u8 = 0xFB;

/// Errors decoding result set packets
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Empty payload")]
    Empty,
    #[error("Invalid length encoding")]
    InvalidLength,
    #[error("Truncated value")]
    Truncated,
}

/// Parse a length-encoded integer, returning the value and bytes consumed
pub fn read_lenenc_int(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    match first {
        0..=0xFA => Some((first as u64, 1)),
        0xFC if data.len() >= 3 => Some((u16::from_le_bytes([data[1], data[2]]) as u64, 3)),
        0xFD if data.len() >= 4 => Some((
            u32::from_le_bytes([data[1], data[2], data[3], 0]) as u64,
            4,
        )),
        0xFE if data.len() >= 9 => Some((
            u64::from_le_bytes([
                data[1], data[2], data[3], data[4], data[5], data[6], data[7], data[8],
            ]),
            9,
        )),
        _ => None,
    }
}

/// Parse a length-encoded string (NULL yields `None`) and the bytes consumed
pub fn read_lenenc_str(data: &[u8]) -> Result<(Option<String>, usize), DecodeError> {
    match data.first() {
        None => return Err(DecodeError::Empty),
        Some(&NULL_MARKER) => return Ok((None, 1)),
        Some(_) => {}
    }

    let (len, header_size) = read_lenenc_int(data).ok_or(DecodeError::InvalidLength)?;
    let len = len as usize;
    if data.len() < header_size + len {
        return Err(DecodeError::Truncated);
    }

    let value = String::from_utf8_lossy(&data[header_size..header_size + len]).into_owned();
    Ok((Some(value), header_size + len))
}

/// Parse a text-protocol row with `columns` values
pub fn parse_text_row(payload: &[u8], columns: usize) -> Result<Row, DecodeError> {
    let mut row = Vec::with_capacity(columns);
    let mut offset = 0;
    for _ in 0..columns {
        let (value, used) = read_lenenc_str(&payload[offset..])?;
        row.push(value);
        offset += used;
    }
    Ok(row)
}

/// Extract the column name from a Protocol::ColumnDefinition41 payload
///
/// Layout: catalog, schema, table, org_table, name, org_name, ...
pub fn parse_column_name(payload: &[u8]) -> Result<String, DecodeError> {
    let mut offset = 0;
    for _ in 0..4 {
        let (_, used) = read_lenenc_str(&payload[offset..])?;
        offset += used;
    }
    let (name, _) = read_lenenc_str(&payload[offset..])?;
    Ok(name.unwrap_or_default())
}
