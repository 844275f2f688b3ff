use crate::error::Error;
use std::io::{self, Write};

/// Encodes or decodes the length-prefixed name/value pairs carried inside a
/// `FCGI_PARAMS` record body.
///
/// The high-order bit of a length's first byte selects the encoding: clear
/// means a single byte holds the length (0..=127); set means three more
/// bytes follow, with the low 7 bits of the first byte contributing the top
/// bits of a 31-bit length.
fn read_len(bytes: &[u8]) -> Result<(u32, usize), Error> {
    let &first = bytes
        .first()
        .ok_or(Error::MalformedRecordPayload("Params"))?;

    if first & 0x80 == 0 {
        return Ok((first as u32, 1));
    }

    let rest = bytes
        .get(1..4)
        .ok_or(Error::MalformedRecordPayload("Params"))?;
    let len = (((first & 0x7F) as u32) << 24)
        | ((rest[0] as u32) << 16)
        | ((rest[1] as u32) << 8)
        | (rest[2] as u32);
    Ok((len, 4))
}

fn write_len<W: Write>(len: usize, writer: &mut W) -> io::Result<()> {
    if len <= 127 {
        writer.write_all(&[len as u8])
    } else {
        let mut bytes = (len as u32).to_be_bytes();
        bytes[0] |= 0x80;
        writer.write_all(&bytes)
    }
}

/// Decodes every `(name, value)` pair in `bytes`, in wire order.
///
/// This is the wire-format layer only: it neither bounds name length nor
/// validates UTF-8. Policy about which pairs a `PARAMS` record is allowed to
/// carry lives with the request parameter extraction in [`crate::request`].
pub fn decode(bytes: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
    let mut pairs = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let (name_len, consumed) = read_len(&bytes[pos..])?;
        pos += consumed;
        let (value_len, consumed) = read_len(&bytes[pos..])?;
        pos += consumed;

        let name_len = name_len as usize;
        let value_len = value_len as usize;
        let end = pos
            .checked_add(name_len)
            .and_then(|p| p.checked_add(value_len))
            .ok_or(Error::MalformedRecordPayload("Params"))?;

        let name = bytes
            .get(pos..pos + name_len)
            .ok_or(Error::MalformedRecordPayload("Params"))?
            .to_vec();
        let value = bytes
            .get(pos + name_len..end)
            .ok_or(Error::MalformedRecordPayload("Params"))?
            .to_vec();

        pos = end;
        pairs.push((name, value));
    }

    Ok(pairs)
}

pub fn encode<W: Write>(pairs: &[(&[u8], &[u8])], writer: &mut W) -> io::Result<()> {
    for (name, value) in pairs {
        write_len(name.len(), writer)?;
        write_len(value.len(), writer)?;
        writer.write_all(name)?;
        writer.write_all(value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(name: &[u8], value: &[u8]) {
        let mut bytes = Vec::new();
        encode(&[(name, value)], &mut bytes).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, vec![(name.to_vec(), value.to_vec())]);
    }

    #[test]
    fn short_form_pairs_round_trip() {
        round_trip(b"SCRIPT_NAME", b"/app/");
        round_trip(b"", b"");
    }

    #[test]
    fn long_form_threshold() {
        // 127 bytes uses the short, 1-byte form ...
        let name_127 = vec![b'a'; 127];
        let mut bytes = Vec::new();
        encode(&[(&name_127, b"v")], &mut bytes).unwrap();
        assert_eq!(bytes[0] & 0x80, 0);

        // ... 128 bytes tips over into the long, 4-byte form.
        let name_128 = vec![b'a'; 128];
        let mut bytes = Vec::new();
        encode(&[(&name_128, b"v")], &mut bytes).unwrap();
        assert_eq!(bytes[0] & 0x80, 0x80);

        round_trip(&name_127, b"short");
        round_trip(&name_128, b"long");
    }

    #[test]
    fn multiple_pairs_round_trip() {
        let mut bytes = Vec::new();
        encode(
            &[(b"A", b"1" as &[u8]), (b"BB", b"22"), (b"CCC", b"333")],
            &mut bytes,
        )
        .unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(
            decoded,
            vec![
                (b"A".to_vec(), b"1".to_vec()),
                (b"BB".to_vec(), b"22".to_vec()),
                (b"CCC".to_vec(), b"333".to_vec()),
            ]
        );
    }
}
