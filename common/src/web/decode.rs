use super::ProtocolError;

const SENTINEL: u8 = 64;

/// Percent-decodes `buf` in place and returns the decoded length. `+` becomes
/// a space. A `%` not followed by two hex digits is copied through as is.
pub fn url_decode_in_place(buf: &mut [u8]) -> usize {
    let len = buf.len();
    let mut read = 0;
    let mut write = 0;

    while read < len {
        let byte = buf[read];
        let decoded = match byte {
            b'+' => {
                read += 1;
                b' '
            }
            b'%' if read + 2 < len => {
                match (hex_value(buf[read + 1]), hex_value(buf[read + 2])) {
                    (Some(hi), Some(lo)) => {
                        read += 3;
                        (hi << 4) | lo
                    }
                    _ => {
                        read += 1;
                        byte
                    }
                }
            }
            _ => {
                read += 1;
                byte
            }
        };
        buf[write] = decoded;
        write += 1;
    }

    write
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn base64_value(byte: u8) -> u8 {
    match byte {
        b'A'..=b'Z' => byte - b'A',
        b'a'..=b'z' => byte - b'a' + 26,
        b'0'..=b'9' => byte - b'0' + 52,
        b'+' | b'-' => 62,
        b'/' | b'_' => 63,
        _ => SENTINEL,
    }
}

/// Decodes standard or URL-safe Base64 in place and returns the decoded
/// length. A sentinel (`=` or any non-alphabet byte) in the third or fourth
/// position of a group ends decoding there.
pub fn base64_decode_in_place(buf: &mut [u8]) -> Result<usize, ProtocolError> {
    if buf.len() % 4 != 0 {
        return Err(ProtocolError::MalformedEncoding);
    }

    let mut write = 0;
    for group in 0..buf.len() / 4 {
        let at = group * 4;
        let a = base64_value(buf[at]);
        let b = base64_value(buf[at + 1]);
        let c = base64_value(buf[at + 2]);
        let d = base64_value(buf[at + 3]);
        if a == SENTINEL || b == SENTINEL {
            return Err(ProtocolError::MalformedEncoding);
        }

        buf[write] = (a << 2) | ((b & 0x30) >> 4);
        write += 1;
        if c == SENTINEL {
            break;
        }
        buf[write] = ((b & 0x0f) << 4) | ((c & 0x3c) >> 2);
        write += 1;
        if d == SENTINEL {
            break;
        }
        buf[write] = ((c & 0x03) << 6) | d;
        write += 1;
    }

    Ok(write)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(input: &str) -> String {
        let mut buf = input.as_bytes().to_vec();
        let len = url_decode_in_place(&mut buf);
        String::from_utf8_lossy(&buf[..len]).into_owned()
    }

    fn b64(input: &str) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = input.as_bytes().to_vec();
        let len = base64_decode_in_place(&mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    #[test]
    fn decodes_percent_and_plus() {
        assert_eq!(url("a%20b+c%2Fd"), "a b c/d");
        assert_eq!(url("%41%62"), "Ab");
    }

    #[test]
    fn clean_input_is_unchanged() {
        assert_eq!(url("relay?state=on"), "relay?state=on");
    }

    #[test]
    fn malformed_percent_passes_through() {
        assert_eq!(url("100%"), "100%");
        assert_eq!(url("50%2"), "50%2");
        assert_eq!(url("%zz!"), "%zz!");
    }

    #[test]
    fn base64_with_and_without_padding() {
        assert_eq!(b64("YWRtaW46cHc=").unwrap(), b"admin:pw");
        assert_eq!(b64("YQ==").unwrap(), b"a");
        assert_eq!(b64("YWI=").unwrap(), b"ab");
        assert_eq!(b64("").unwrap(), b"");
    }

    #[test]
    fn base64_accepts_url_safe_alphabet() {
        assert_eq!(b64("-_-_").unwrap(), vec![0xfb, 0xff, 0xbf]);
        assert_eq!(b64("+/+/").unwrap(), vec![0xfb, 0xff, 0xbf]);
    }

    #[test]
    fn base64_rejects_bad_length_and_leading_sentinel() {
        assert!(matches!(b64("YWJ"), Err(ProtocolError::MalformedEncoding)));
        assert!(matches!(b64("=AAA"), Err(ProtocolError::MalformedEncoding)));
    }
}
