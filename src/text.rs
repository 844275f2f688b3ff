//! Text transforms used by the router's handlers (§4.E): percent-decoding
//! `QUERY_STRING`, escaping a search phrase for the full-text query syntax,
//! obfuscating maintainer e-mail addresses, and picking a version suffix out
//! of a package name.

/// Percent-decodes `input` in place, per §4.E rule 1: `%XX` where both
/// digits are hex and not both zero; any other `%` sequence is an error.
/// Non-`%` bytes pass through unchanged.
pub fn unquote(input: &str) -> Result<String, ()> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = bytes.get(i + 1).copied();
            let lo = bytes.get(i + 2).copied();
            let (hi, lo) = match (hi, lo) {
                (Some(h), Some(l)) if h.is_ascii_hexdigit() && l.is_ascii_hexdigit() => (h, l),
                _ => return Err(()),
            };
            let hi_val = (hi as char).to_digit(16).unwrap();
            let lo_val = (lo as char).to_digit(16).unwrap();
            if hi_val == 0 && lo_val == 0 {
                return Err(());
            }
            out.push((hi_val * 16 + lo_val) as u8);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| ())
}

/// Maximum length (including the implicit terminator) of an escaped FTS
/// match expression (§4.E rule 2).
pub const FTS_MAX_LEN: usize = 1024;

/// Escapes `query` for the full-text query syntax: split on ASCII
/// whitespace, wrap each token in double quotes, double every embedded
/// `"`, join with single spaces.
pub fn fts_escape(query: &str) -> Result<String, ()> {
    let mut out = String::new();
    for (i, token) in query
        .split(|c: char| c == ' ' || c == '\x0c' || c == '\n' || c == '\r' || c == '\t' || c == '\x0b')
        .filter(|t| !t.is_empty())
        .enumerate()
    {
        if i > 0 {
            out.push(' ');
        }
        out.push('"');
        for c in token.chars() {
            if c == '"' {
                out.push('"');
                out.push('"');
            } else {
                out.push(c);
            }
        }
        out.push('"');
        if out.len() + 1 > FTS_MAX_LEN {
            return Err(());
        }
    }
    if out.len() + 1 > FTS_MAX_LEN {
        return Err(());
    }
    Ok(out)
}

/// Obfuscates the maintainer string's e-mail address (§4.E): outside an
/// `<...>` pair, bytes pass through; inside, `@` becomes ` at `, `.`
/// becomes ` dot `, and `>` exits the obfuscation (printed literally).
pub fn obfuscate_maintainer(maintainer: &str) -> String {
    let mut out = String::with_capacity(maintainer.len());
    let mut inside = false;
    for c in maintainer.chars() {
        if !inside {
            if c == '<' {
                inside = true;
            }
            out.push(c);
            continue;
        }
        match c {
            '@' => out.push_str(" at "),
            '.' => out.push_str(" dot "),
            '>' => {
                inside = false;
                out.push('>');
            }
            other => out.push(other),
        }
    }
    out
}

/// Splits `pkgname` into its version suffix: the portion after the last
/// `-`, or `None` if there is no `-`.
pub fn pkgname_version(pkgname: &str) -> Option<&str> {
    pkgname.rsplit_once('-').map(|(_, version)| version)
}
