//! Hex dump formatting for raw endpoint data

const BYTES_PER_LINE: usize = 16;

/// Format `data` as `offset: hex  ascii` lines, 16 bytes per line
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::new();
    for (i, line) in data.chunks(BYTES_PER_LINE).enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&format_line(i * BYTES_PER_LINE, line));
    }
    out
}

fn format_line(offset: usize, line: &[u8]) -> String {
    let encoded = hex::encode(line);
    let pairs: Vec<&str> = (0..encoded.len())
        .step_by(2)
        .map(|i| &encoded[i..i + 2])
        .collect();
    let ascii: String = line
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect();

    format!(
        "{:04x}: {:<width$}  {}",
        offset,
        pairs.join(" "),
        ascii,
        width = BYTES_PER_LINE * 3 - 1
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line() {
        let dump = hexdump(b"P6SPIH\0\0");
        assert_eq!(
            dump,
            format!("0000: {:<47}  P6SPIH..", "50 36 53 50 49 48 00 00")
        );
    }

    #[test]
    fn test_multiple_lines_offsets() {
        let data: Vec<u8> = (0u8..40).collect();
        let dump = hexdump(&data);
        let lines: Vec<&str> = dump.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("0000: 00 01 02"));
        assert!(lines[1].starts_with("0010: 10 11 12"));
        assert!(lines[2].starts_with("0020: 20 21 22"));
        // Short last line keeps the ascii column aligned
        assert_eq!(lines[0].len(), 6 + 47 + 2 + 16);
        assert_eq!(lines[2].len(), 6 + 47 + 2 + 8);
    }

    #[test]
    fn test_response_header() {
        let dump = hexdump(&[0xFA, 0x55, 0xE5, 0x00]);
        assert!(dump.starts_with("0000: fa 55 e5 00"));
        assert!(dump.ends_with(".U.."));
    }

    #[test]
    fn test_empty() {
        assert_eq!(hexdump(&[]), "");
    }
}
