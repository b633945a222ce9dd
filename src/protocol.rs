//! Command grammar for the linevault line protocol
//!
//! Commands are colon separated: `Put:<key>:<value>`, `Get:<key>`,
//! `Update:<key>:<old>:<new>` and `Delete:<key>`. Every split is an
//! "at most N parts" split, so the last field keeps any colons it contains.
//! Parsing is zero-copy with nom; the parsed command borrows from the line.

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    bytes::complete::{tag, take_until},
    sequence::{pair, terminated},
    IResult,
};

pub const SEPARATOR: &str = ":";

pub const PUT: &[u8] = b"Put";
pub const GET: &[u8] = b"Get";
pub const UPDATE: &[u8] = b"Update";
pub const DELETE: &[u8] = b"Delete";

/// A parsed command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Put { key: &'a [u8], value: &'a [u8] },
    Get { key: &'a [u8] },
    Update { key: &'a [u8], old: &'a [u8], new: &'a [u8] },
    Delete { key: &'a [u8] },
    /// Unknown command token, missing separator or missing fields
    Unrecognized,
}

impl Command<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Put { .. } => "Put",
            Command::Get { .. } => "Get",
            Command::Update { .. } => "Update",
            Command::Delete { .. } => "Delete",
            Command::Unrecognized => "Unrecognized",
        }
    }

    /// Serialize the command as a wire line, trailing newline included.
    ///
    /// `Unrecognized` has no wire form and encodes to an empty buffer.
    pub fn to_line(&self) -> Vec<u8> {
        let fields: Vec<&[u8]> = match *self {
            Command::Put { key, value } => vec![PUT, key, value],
            Command::Get { key } => vec![GET, key],
            Command::Update { key, old, new } => vec![UPDATE, key, old, new],
            Command::Delete { key } => vec![DELETE, key],
            Command::Unrecognized => return Vec::new(),
        };
        let mut line = fields.join(SEPARATOR.as_bytes());
        line.push(b'\n');
        line
    }
}

/// Parse a single line (newline already stripped) into a command.
///
/// Malformed input never fails; it yields `Command::Unrecognized`.
pub fn parse_command(line: &[u8]) -> Command<'_> {
    let Ok((rest, name)) = field(line) else {
        return Command::Unrecognized;
    };

    match name {
        PUT => match field(rest) {
            Ok((value, key)) => Command::Put { key, value },
            Err(_) => Command::Unrecognized,
        },
        GET => Command::Get { key: rest },
        UPDATE => match pair(field, field)(rest) {
            Ok((new, (key, old))) => Command::Update { key, old, new },
            Err(_) => Command::Unrecognized,
        },
        DELETE => Command::Delete { key: rest },
        _ => Command::Unrecognized,
    }
}

/// Everything up to the next separator, consuming the separator.
fn field(input: &[u8]) -> IResult<&[u8], &[u8]> {
    terminated(take_until(SEPARATOR), tag(SEPARATOR))(input)
}

/// Format the values of a Get as `<key>:<value>` lines, in store order.
pub fn format_values(key: &[u8], values: &[Vec<u8>]) -> Vec<Bytes> {
    values
        .iter()
        .map(|value| {
            let mut line = BytesMut::with_capacity(key.len() + 1 + value.len());
            line.put_slice(key);
            line.put_slice(SEPARATOR.as_bytes());
            line.put_slice(value);
            line.freeze()
        })
        .collect()
}
