//! External-path codec: mapping OS file paths to and from
//! `file::endpoint::...` names.
//!
//! Encoding turns path separators into `::`, escapes uppercase letters and
//! literal `^` with a `^` prefix, folds a windows drive `X:\` into a
//! leading `X$` scope, and base32-encodes paths that start with `$`. XML
//! entity references in the input are decoded and re-encoded with newline
//! preservation so the result survives property-tree storage.

use super::{
    is_sep, is_std_io, skip_scope, LogicalName, NameError, Result, EXTERNAL_SCOPE,
};
use crate::endpoint::Endpoint;

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Base32 (lowercase, unpadded) used for `$`-prefixed external paths.
fn base32_encode(data: &[u8], out: &mut String) {
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for &b in data {
        acc = (acc << 8) | u32::from(b);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }
}

/// Decodes XML entity references, keeping unknown ones literally.
fn xml_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let Some(semi) = rest[..rest.len().min(12)].find(';') else {
            out.push('&');
            rest = &rest[1..];
            continue;
        };
        let entity = &rest[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity.strip_prefix('#').and_then(|num| {
                let code = match num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
                    Some(hex) => u32::from_str_radix(hex, 16).ok(),
                    None => num.parse().ok(),
                };
                code.and_then(char::from_u32)
            }),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Re-encodes XML-special characters, preserving newlines as references.
fn xml_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            _ => out.push(c),
        }
    }
    out
}

/// Encodes a local path under an endpoint into `file::endpoint::...` text.
pub(super) fn encode_external(ep: &Endpoint, path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(NameError::Invalid("empty external path".to_string()));
    }
    let b = path.as_bytes();
    if b.len() >= 2 && is_sep(b[0] as char) && b[0] == b[1] {
        // UNC form re-roots the endpoint
        let rest = &path[2..];
        let hostend = rest.find(is_sep).unwrap_or(rest.len());
        let host: Endpoint = rest[..hostend]
            .parse()
            .map_err(|_| NameError::Invalid(path.to_string()))?;
        return encode_external(&host, &rest[hostend..]);
    }

    let mut out = format!("{EXTERNAL_SCOPE}::{}", ep.url());
    let mut p = path;
    if b.len() >= 3 && b[1] == b':' && b[2] == b'\\' {
        // windows drive becomes an X$ scope
        out.push_str("::");
        out.push(b[0] as char);
        out.push('$');
        p = &p[2..];
    } else if !p.starts_with(is_sep) {
        out.push_str("::");
    }
    let reencoded: String;
    if let Some(enc) = p.strip_prefix('$').filter(|r| !r.is_empty()) {
        out.push_str("$::");
        base32_encode(enc.as_bytes(), &mut out);
        p = "";
    } else if is_std_io(p) {
        out.push_str(p);
        p = "";
    } else {
        reencoded = xml_encode(&xml_decode(p));
        p = &reencoded;
    }
    for c in p.chars() {
        if is_sep(c) {
            out.push_str("::");
        } else {
            if c == '^' || c.is_ascii_uppercase() {
                out.push('^');
            }
            out.push(c.to_ascii_lowercase());
        }
    }
    Ok(out)
}

/// Encodes an OS path given in os-path parse mode; UNC paths carry their
/// own host, everything else is rooted at the local node.
pub(super) fn encode_os_path(input: &str) -> Result<String> {
    let local = Endpoint::new("localhost", None)
        .map_err(|_| NameError::Invalid(input.to_string()))?;
    encode_external(&local, input.trim())
}

/// Decodes an external name into a local directory and tail.
pub(super) fn decode_external(lfn: &LogicalName, windows: bool) -> Result<(String, String)> {
    if !lfn.is_external() {
        return Err(NameError::NotExternal(lfn.get(false).to_string()));
    }
    if lfn.is_multi() {
        tracing::warn!("external decode requested on multi name {}", lfn.get(false));
    }
    let full = lfn.get(false);
    let after = skip_scope(full, EXTERNAL_SCOPE)
        .ok_or_else(|| NameError::BadExternal(full.to_string()))?;
    let idx = after.find("::").ok_or_else(|| NameError::BadExternal(full.to_string()))?;
    let mut s = &after[idx..];
    if s.as_bytes().get(2) == Some(&b'>') {
        // query name: the query text is the tail
        return Ok(("/".to_string(), s[2..].to_string()));
    }
    if windows && s.as_bytes().get(3) == Some(&b'$') {
        s = &s[2..]; // no leading separator before the drive
    }
    let t1 = {
        let mut last = None;
        let mut scan = s;
        let mut off = 0;
        while let Some(pos) = scan.find("::") {
            last = Some(off + pos);
            scan = &scan[pos + 2..];
            off += pos + 2;
        }
        last.ok_or_else(|| NameError::NoDirectory(full.to_string()))?
    };
    let db = s[..t1].as_bytes();
    let sep = if windows { '\\' } else { '/' };
    let mut dir = String::new();
    let mut start = true;
    let mut i = 0;
    while i < db.len() {
        let c = db[i] as char;
        i += 1;
        if is_sep(c) {
            return Err(NameError::PathSeparator(full.to_string()));
        }
        if c == ':' && i < db.len() && db[i] == b':' {
            dir.push(sep);
            i += 1;
        } else if c == ':' {
            return Err(NameError::SingleColon(full.to_string()));
        } else if windows && start && i < db.len() && db[i] == b'$' {
            dir.push(c);
            dir.push(':');
            i += 1;
        } else if c == '^' && i < db.len() {
            dir.push((db[i] as char).to_ascii_uppercase());
            i += 1;
        } else {
            dir.push(c);
        }
        start = false;
    }
    if !dir.is_empty() && !dir.ends_with(sep) {
        dir.push(sep);
    }
    let tb = s[t1 + 2..].as_bytes();
    let mut tail = String::new();
    let mut i = 0;
    while i < tb.len() {
        let c = tb[i] as char;
        i += 1;
        if c == '^' && i < tb.len() {
            tail.push((tb[i] as char).to_ascii_uppercase());
            i += 1;
        } else {
            tail.push(c);
        }
    }
    Ok((dir, tail))
}

/// Decodes an external name into a host-prefixed remote directory and
/// tail (`\\host\dir\` on windows, `//host/dir/` otherwise).
pub(super) fn remote_path(lfn: &LogicalName, windows: bool) -> Result<(String, String)> {
    let (mut dir, tail) = decode_external(lfn, windows)?;
    let ep = lfn
        .endpoint()
        .ok_or_else(|| NameError::BadExternal(lfn.get(false).to_string()))?;
    if windows {
        if dir.as_bytes().get(1) == Some(&b':') {
            // drive letters address the administrative share remotely
            dir.replace_range(1..2, "$");
        }
        let mut out = format!("\\\\{}", ep.url());
        if !dir.starts_with('\\') {
            out.push('\\');
        }
        out.push_str(&dir);
        Ok((out, tail))
    } else {
        let mut out = format!("//{}", ep.url());
        if !dir.starts_with('/') {
            out.push('/');
        }
        out.push_str(&dir);
        Ok((out, tail))
    }
}
