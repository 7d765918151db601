use std::io::Read;

/// Default ceiling, in characters, on captured stdout and stderr.
pub const DEFAULT_MAX_OUTPUT: usize = 10 * 1024;

/// Reads `reader` to EOF, keeping at most `cap` bytes. The rest is drained and
/// dropped so the writer never blocks on a full pipe.
pub fn read_to_end_capped<R: Read>(mut reader: R, cap: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = match reader.read(&mut tmp) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        if truncated {
            continue;
        }

        let remaining = cap.saturating_sub(buf.len());
        if n <= remaining {
            buf.extend_from_slice(&tmp[..n]);
        } else {
            buf.extend_from_slice(&tmp[..remaining]);
            truncated = true;
        }
    }

    Ok((buf, truncated))
}

/// Drops invalid UTF-8 sequences and NUL bytes.
pub fn cleaned(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut rest = bytes;
    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                out.push_str(s);
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                // valid_up_to() guarantees this prefix is UTF-8.
                out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                let skip = e.error_len().unwrap_or(after.len());
                rest = &after[skip..];
            }
        }
    }
    out.retain(|c| c != '\0');
    out
}

/// Keeps at most `max_chars` characters.
pub fn truncated(mut s: String, max_chars: usize) -> String {
    if let Some((byte_idx, _)) = s.char_indices().nth(max_chars) {
        s.truncate(byte_idx);
    }
    s
}

/// Raw capture budget for an output that is cleaned then truncated to
/// `max_chars`: one UTF-8 char is at most four bytes.
pub fn capture_cap(max_chars: usize) -> usize {
    max_chars.saturating_mul(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capped_reader_drains_past_the_cap() {
        let data = vec![b'x'; 20_000];
        let (buf, truncated) = read_to_end_capped(&data[..], 100).unwrap();
        assert_eq!(buf.len(), 100);
        assert!(truncated);

        let (buf, truncated) = read_to_end_capped(&b"abc"[..], 100).unwrap();
        assert_eq!(buf, b"abc");
        assert!(!truncated);
    }

    #[test]
    fn cleaning_drops_invalid_sequences() {
        assert_eq!(cleaned(b"hello\n"), "hello\n");
        assert_eq!(cleaned(b"a\xffb\xc3"), "ab");
        assert_eq!(cleaned(b"a\0b"), "ab");
        assert_eq!(cleaned("caf\u{e9}".as_bytes()), "caf\u{e9}");
    }

    #[test]
    fn truncation_is_by_character() {
        assert_eq!(truncated("abcdef".to_string(), 3), "abc");
        assert_eq!(truncated("ab".to_string(), 3), "ab");
        assert_eq!(truncated("\u{e9}\u{e9}\u{e9}".to_string(), 2), "\u{e9}\u{e9}");
        assert_eq!(truncated(String::new(), 0), "");
    }
}
