/*!
 * Wire codecs for the hub protocol.
 *
 * This module implements the numeric and binary encodings used across the
 * notification and enumeration protocol: the 16-bit decimal float format,
 * the compressed word-array and float-array encodings, and the multi-format
 * "public value" carried in advertised-value notifications.
 */

/// Maximum length of a decoded public value, in bytes
pub const PUBVAL_LEN: usize = 16;

/// Framing tag: payload is a legacy NUL-terminated string
pub const NOTIFY_V2_LEGACY: u8 = 0;
/// Framing tag: payload is six raw bytes, hex-encoded
pub const NOTIFY_V2_6RAWBYTES: u8 = 1;
/// Framing tag: payload starts with a typed-data tag byte
pub const NOTIFY_V2_TYPEDDATA: u8 = 2;
/// Framing tag: group flush marker, no payload
pub const NOTIFY_V2_FLUSHGROUP: u8 = 3;

/// Typed-data tag: legacy string payload
pub const PUBVAL_TAG_LEGACY: u8 = 0;
/// Typed-data tags 1..=6: that many raw bytes, hex-encoded
pub const PUBVAL_TAG_6RAWBYTES: u8 = 6;
/// Typed-data tag: little-endian 32-bit signed integer
pub const PUBVAL_TAG_C_LONG: u8 = 7;
/// Typed-data tag: 32-bit IEEE-754 float
pub const PUBVAL_TAG_C_FLOAT: u8 = 8;
/// Typed-data tag: 32-bit integer scaled by 1e-3
pub const PUBVAL_TAG_FLOAT_E3: u8 = 9;
/// Typed-data tag: 32-bit integer scaled by 1e-6
pub const PUBVAL_TAG_FLOAT_E6: u8 = 10;

/// Power-of-ten table indexed by the 4 exponent bits of a decimal16 word
const DECIMAL_EXP: [f64; 16] = [
    1.0e-6, 1.0e-5, 1.0e-4, 1.0e-3, 1.0e-2, 1.0e-1, 1.0, 1.0e1, 1.0e2, 1.0e3,
    1.0e4, 1.0e5, 1.0e6, 1.0e7, 1.0e8, 1.0e9,
];

/// Convert a 16-bit decimal float word to a double
///
/// A word with all-zero mantissa bits decodes to 0.0 regardless of its sign
/// and exponent bits; the firmware emits such words and relies on this.
/// Sub-unit exponents divide by the rounded reciprocal instead of multiplying,
/// which keeps decoded values free of binary fraction error.
pub fn decimal_to_double(raw: u16) -> f64 {
    let mut val = u32::from(raw);
    let negate = if val > 32767 {
        val = 65536 - val;
        true
    } else {
        false
    };
    let mantissa = val & 2047;
    if mantissa == 0 {
        return 0.0;
    }
    let exp = DECIMAL_EXP[(val >> 11) as usize];
    let res = if exp >= 1.0 {
        f64::from(mantissa) * exp
    } else {
        f64::from(mantissa) / (1.0 / exp).round()
    };
    if negate {
        -res
    } else {
        res
    }
}

/// Convert a double to its nearest 16-bit decimal float word
///
/// Picks the smallest exponent index such that `value / 1999 <= 10^(i-6)`,
/// then rounds the mantissa; values beyond the largest representable decimal
/// saturate at `(15 << 11) + 2047`. The mapping is exact only for values that
/// are themselves representable decimal floats.
pub fn double_to_decimal(value: f64) -> u16 {
    if value == 0.0 {
        return 0;
    }
    let negate = value < 0.0;
    let val = value.abs();
    let comp = val / 1999.0;
    let mut dec_pow = 0usize;
    while dec_pow < 15 && comp > DECIMAL_EXP[dec_pow] {
        dec_pow += 1;
    }
    let mantissa = val / DECIMAL_EXP[dec_pow];
    let res: u32 = if dec_pow == 15 && mantissa > 2047.0 {
        (15 << 11) + 2047
    } else {
        ((dec_pow as u32) << 11) + (mantissa + 0.5).floor() as u32
    };
    if negate {
        (65536 - res) as u16
    } else {
        res as u16
    }
}

/// Decode a compressed word-array string into 16-bit words
///
/// `*`, `X` and `Y` stand for 0, 0xFFFF and 0x7FFF; lowercase letters are
/// back-references to previously decoded words (out-of-range references decode
/// to 0); any other byte opens a 3-byte group of 5-bit chunks offset from
/// `'0'`, with `z` standing in for `\` in the third position. A truncated
/// trailing group aborts the decode and yields an empty sequence.
pub fn decode_words(s: &str) -> Vec<u16> {
    let bytes = s.as_bytes();
    let mut words: Vec<u16> = Vec::new();
    let mut p = 0;
    while p < bytes.len() {
        let c = bytes[p];
        p += 1;
        let val: u32 = match c {
            b'*' => 0,
            b'X' => 0xffff,
            b'Y' => 0x7fff,
            c if c >= b'a' => {
                let src = words.len() as isize - 1 - isize::from(c - b'a');
                if src < 0 {
                    0
                } else {
                    u32::from(words[src as usize])
                }
            }
            _ => {
                if p + 2 > bytes.len() {
                    return Vec::new();
                }
                let mut val = u32::from(c).wrapping_sub(u32::from(b'0'));
                val += (u32::from(bytes[p]).wrapping_sub(u32::from(b'0'))) << 5;
                let mut c3 = bytes[p + 1];
                if c3 == b'z' {
                    c3 = b'\\';
                }
                val += (u32::from(c3).wrapping_sub(u32::from(b'0'))) << 10;
                p += 2;
                val
            }
        };
        words.push(val as u16);
    }
    words
}

/// Encode 16-bit words into the compressed word-array string
///
/// Exact inverse of [`decode_words`]: special symbols for 0/0xFFFF/0x7FFF,
/// back-references into the previous 26 words, 3-byte groups otherwise.
pub fn encode_words(words: &[u16]) -> String {
    let mut out = String::with_capacity(words.len() * 3);
    for (i, &w) in words.iter().enumerate() {
        match w {
            0 => out.push('*'),
            0xffff => out.push('X'),
            0x7fff => out.push('Y'),
            _ => {
                let back = words[i.saturating_sub(26)..i]
                    .iter()
                    .rposition(|&prev| prev == w);
                if let Some(pos) = back {
                    let offset = i - i.saturating_sub(26) - pos - 1;
                    out.push((b'a' + offset as u8) as char);
                } else {
                    let v = u32::from(w);
                    out.push((b'0' + (v & 31) as u8) as char);
                    out.push((b'0' + ((v >> 5) & 31) as u8) as char);
                    let c3 = b'0' + (v >> 10) as u8;
                    out.push(if c3 == b'\\' { 'z' } else { c3 as char });
                }
            }
        }
    }
    out
}

/// Decode a compact signed fixed-point float list into milli-unit integers
///
/// Scans digit runs (optional leading `-`, at most one `.`, at most 3 kept
/// fractional digits) separated by arbitrary non-digit characters, scaling
/// each value so the result is expressed in thousandths.
pub fn decode_floats(s: &str) -> Vec<i32> {
    let bytes = s.as_bytes();
    let mut values = Vec::new();
    let mut p = 0;
    while p < bytes.len() {
        // Skip to the next number start
        while p < bytes.len() && bytes[p] != b'-' && !bytes[p].is_ascii_digit() {
            p += 1;
        }
        if p >= bytes.len() {
            break;
        }
        let mut sign = 1i32;
        if bytes[p] == b'-' {
            sign = -1;
            p += 1;
            if p >= bytes.len() || !bytes[p].is_ascii_digit() {
                continue;
            }
        }
        let mut val = 0i32;
        let mut dec = 0u32;
        let mut dec_inc = 0u32;
        while p < bytes.len() && (bytes[p].is_ascii_digit() || bytes[p] == b'.') {
            if bytes[p] == b'.' {
                if dec_inc != 0 {
                    break;
                }
                dec_inc = 1;
            } else if dec < 3 {
                val = val * 10 + i32::from(bytes[p] - b'0');
                dec += dec_inc;
            }
            p += 1;
        }
        let scaled = match dec {
            0 => val * 1000,
            1 => val * 100,
            2 => val * 10,
            _ => val,
        };
        values.push(sign * scaled);
    }
    values
}

/// Decode a 7-bit packed public-value buffer from a notification line
///
/// Each wire byte carries 7 bits of data offset by 32; the buffer ends at a
/// literal LF (or NUL) and never exceeds 7 bytes (1 tag + 6 data). A byte
/// below the offset is malformed and aborts the decode.
pub fn decode_packed(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(7);
    for &b in data {
        if b == b'\n' || b == 0 {
            break;
        }
        if b < 32 {
            return Vec::new();
        }
        out.push(b - 32);
        if out.len() == 7 {
            break;
        }
    }
    out
}

/// Decode a public value from its wire representation
///
/// `type_v2` is the framing tag from the notification opcode; `data` is the
/// unpacked payload. Legacy framing copies printable bytes up to a NUL or the
/// public-value length limit.
pub fn decode_public_value(type_v2: u8, data: &[u8]) -> String {
    match type_v2 {
        NOTIFY_V2_6RAWBYTES => decode_typed_value(PUBVAL_TAG_6RAWBYTES, data),
        NOTIFY_V2_TYPEDDATA => {
            if data.is_empty() {
                return String::new();
            }
            decode_typed_value(data[0], &data[1..])
        }
        _ => legacy_copy(data),
    }
}

fn decode_typed_value(tag: u8, data: &[u8]) -> String {
    match tag {
        PUBVAL_TAG_LEGACY => legacy_copy(data),
        1..=PUBVAL_TAG_6RAWBYTES => {
            let n = (tag as usize).min(data.len());
            let mut s = String::with_capacity(n * 2);
            for b in &data[..n] {
                s.push_str(&format!("{:02x}", b));
            }
            s
        }
        PUBVAL_TAG_C_LONG => le_i32(data).to_string(),
        PUBVAL_TAG_C_FLOAT => {
            let num = le_i32(data) as u32;
            let exp = ((num >> 23) & 0xff) as i32;
            let mantissa = f64::from(num & 0x7f_ffff);
            let val = if exp == 0 {
                0.0
            } else {
                let magnitude = (mantissa + 8_388_608.0) * 2f64.powi(exp - 150);
                if num & 0x8000_0000 != 0 {
                    -magnitude
                } else {
                    magnitude
                }
            };
            trim_fraction(format!("{:.6}", val))
        }
        PUBVAL_TAG_FLOAT_E3 => format_fixed(le_i32(data), 3),
        PUBVAL_TAG_FLOAT_E6 => format_fixed(le_i32(data), 6),
        _ => "?".to_string(),
    }
}

fn le_i32(data: &[u8]) -> i32 {
    let mut bytes = [0u8; 4];
    for (i, b) in data.iter().take(4).enumerate() {
        bytes[i] = *b;
    }
    i32::from_le_bytes(bytes)
}

fn legacy_copy(data: &[u8]) -> String {
    let mut s = String::new();
    for &b in data.iter().take(PUBVAL_LEN) {
        if b == 0 || b < 32 || b > 126 {
            break;
        }
        s.push(b as char);
    }
    s
}

/// Format a scaled integer as a decimal string, trimming trailing zeros
fn format_fixed(val: i32, decimals: u32) -> String {
    let scale = 10i64.pow(decimals);
    let v = i64::from(val);
    let negative = v < 0;
    let abs = v.abs();
    let int_part = abs / scale;
    let frac_part = abs % scale;
    let mut s = String::new();
    if negative && (int_part != 0 || frac_part != 0) {
        s.push('-');
    }
    s.push_str(&int_part.to_string());
    if frac_part != 0 {
        s.push('.');
        s.push_str(&format!("{:0width$}", frac_part, width = decimals as usize));
        while s.ends_with('0') {
            s.pop();
        }
    }
    s
}

fn trim_fraction(mut s: String) -> String {
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_round_trip_one() {
        assert_eq!(double_to_decimal(1.0), 7144);
        assert_eq!(decimal_to_double(7144), 1.0);
    }

    #[test]
    fn test_decimal_degenerate_zero_mantissa() {
        // Any word whose low 11 bits are zero decodes to 0.0, whatever the
        // sign and exponent bits say
        for raw in [0u16, 1 << 11, 7 << 11, 15 << 11, 0x8000, 0x9800, 0xF800] {
            assert_eq!(decimal_to_double(raw), 0.0, "raw = {:#x}", raw);
        }
    }

    #[test]
    fn test_decimal_negative_values() {
        let enc = double_to_decimal(-1.0);
        assert_eq!(decimal_to_double(enc), -1.0);
        let enc = double_to_decimal(-0.5);
        assert_eq!(decimal_to_double(enc), -0.5);
    }

    #[test]
    fn test_decimal_saturation() {
        let enc = double_to_decimal(1.0e13);
        assert_eq!(enc, (15 << 11) + 2047);
    }

    #[test]
    fn test_decimal_sub_unit_precision() {
        // Sub-unit exponents divide by the rounded reciprocal; 0.001 must
        // survive a round trip exactly
        let enc = double_to_decimal(0.001);
        assert_eq!(decimal_to_double(enc), 0.001);
    }

    #[test]
    fn test_decode_words_specials() {
        assert_eq!(decode_words("*X"), vec![0, 65535]);
        assert_eq!(decode_words("Y"), vec![32767]);
    }

    #[test]
    fn test_decode_words_back_reference() {
        // 'a' refers to the immediately preceding word
        let mut s = encode_words(&[1000]);
        s.push('a');
        assert_eq!(decode_words(&s), vec![1000, 1000]);
        // Out-of-range back-reference decodes to 0
        assert_eq!(decode_words("c"), vec![0]);
    }

    #[test]
    fn test_decode_words_truncated_group() {
        let mut s = encode_words(&[1234]);
        s.pop();
        assert_eq!(decode_words(&s), Vec::<u16>::new());
    }

    #[test]
    fn test_encode_words_round_trip() {
        let words = vec![0, 1, 1000, 0x7fff, 0xffff, 1000, 30999, 12500, 1366];
        assert_eq!(decode_words(&encode_words(&words)), words);
    }

    #[test]
    fn test_decode_floats() {
        assert_eq!(decode_floats("1.5 -0.25 3"), vec![1500, -250, 3000]);
        assert_eq!(decode_floats("30,1.0,1.1"), vec![30000, 1000, 1100]);
        // Extra fractional digits beyond 3 are dropped
        assert_eq!(decode_floats("0.12345"), vec![123]);
        assert_eq!(decode_floats(""), Vec::<i32>::new());
    }

    #[test]
    fn test_decode_packed() {
        // Offset-32 bytes, LF-terminated
        let wire: Vec<u8> = vec![32 + 7, 32 + 0x42, 32 + 0x01, b'\n', b'x'];
        assert_eq!(decode_packed(&wire), vec![7, 0x42, 0x01]);
        // Malformed low byte aborts
        assert_eq!(decode_packed(&[5u8]), Vec::<u8>::new());
    }

    #[test]
    fn test_public_value_c_long() {
        let data = [PUBVAL_TAG_C_LONG, 0xC2, 0x65, 0x00, 0x00];
        assert_eq!(decode_public_value(NOTIFY_V2_TYPEDDATA, &data), "26050");
        let data = [PUBVAL_TAG_C_LONG, 0xFF, 0xFF, 0xFF, 0xFF];
        assert_eq!(decode_public_value(NOTIFY_V2_TYPEDDATA, &data), "-1");
    }

    #[test]
    fn test_public_value_fixed_point() {
        let data = [PUBVAL_TAG_FLOAT_E3, 0xC2, 0x65, 0x00, 0x00];
        assert_eq!(decode_public_value(NOTIFY_V2_TYPEDDATA, &data), "26.05");
        let data = [PUBVAL_TAG_FLOAT_E6, 0x40, 0x42, 0x0F, 0x00];
        assert_eq!(decode_public_value(NOTIFY_V2_TYPEDDATA, &data), "1");
    }

    #[test]
    fn test_public_value_float() {
        // 1.5f32 = 0x3FC00000
        let data = [PUBVAL_TAG_C_FLOAT, 0x00, 0x00, 0xC0, 0x3F];
        assert_eq!(decode_public_value(NOTIFY_V2_TYPEDDATA, &data), "1.5");
        // -2.0f32 = 0xC0000000
        let data = [PUBVAL_TAG_C_FLOAT, 0x00, 0x00, 0x00, 0xC0];
        assert_eq!(decode_public_value(NOTIFY_V2_TYPEDDATA, &data), "-2");
    }

    #[test]
    fn test_public_value_raw_bytes() {
        let data = [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01];
        assert_eq!(
            decode_public_value(NOTIFY_V2_6RAWBYTES, &data),
            "deadbeef0001"
        );
    }

    #[test]
    fn test_public_value_unknown_tag() {
        let data = [42u8, 1, 2, 3, 4];
        assert_eq!(decode_public_value(NOTIFY_V2_TYPEDDATA, &data), "?");
    }

    #[test]
    fn test_public_value_legacy() {
        let data = b"26.05\0garbage";
        assert_eq!(decode_public_value(NOTIFY_V2_LEGACY, data), "26.05");
    }
}
