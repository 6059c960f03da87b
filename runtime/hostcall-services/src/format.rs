//! C `printf` formatting over 64-bit argument words
//!
//! Every numeric argument arrives as one `u64`; length modifiers are
//! accepted and ignored. `%s` arguments come from a separate list of
//! strings, consumed in order.

use std::iter::Peekable;
use std::str::Chars;

use thiserror::Error;

/// Upper bound on a width or precision, device input is untrusted
pub const MAX_FIELD: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("format string ends inside a conversion")]
    Truncated,

    #[error("unsupported conversion '%{0}'")]
    Unsupported(char),

    #[error("no argument word left for conversion {0}")]
    MissingWord(usize),

    #[error("no string argument left for conversion {0}")]
    MissingString(usize),

    #[error("field width or precision {0} exceeds {MAX_FIELD}")]
    FieldTooWide(usize),
}

#[derive(Debug, Clone, Copy, Default)]
struct FieldSpec {
    left: bool,
    plus: bool,
    space: bool,
    alt: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
}

struct Args<'a> {
    words: std::slice::Iter<'a, u64>,
    strings: std::slice::Iter<'a, String>,
    conversion: usize,
}

impl<'a> Args<'a> {
    fn word(&mut self) -> Result<u64, FormatError> {
        self.words
            .next()
            .copied()
            .ok_or(FormatError::MissingWord(self.conversion))
    }

    fn string(&mut self) -> Result<&'a str, FormatError> {
        self.strings
            .next()
            .map(String::as_str)
            .ok_or(FormatError::MissingString(self.conversion))
    }

    /// `*` field value: the word is a C `int`
    fn star(&mut self) -> Result<i64, FormatError> {
        Ok(i64::from(self.word()? as i32))
    }
}

/// Format `fmt` with `words` for numeric conversions and `strings` for `%s`
///
/// Arguments left over after the format string is exhausted are ignored,
/// as in C.
pub fn format(fmt: &str, words: &[u64], strings: &[String]) -> Result<String, FormatError> {
    let mut out = String::with_capacity(fmt.len());
    let mut args = Args {
        words: words.iter(),
        strings: strings.iter(),
        conversion: 0,
    };
    let mut chars = fmt.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        args.conversion += 1;
        let spec = parse_spec(&mut chars, &mut args)?;
        let conversion = chars.next().ok_or(FormatError::Truncated)?;

        match conversion {
            '%' => out.push('%'),
            'd' | 'i' => {
                let value = args.word()? as i64;
                let sign = if value < 0 {
                    "-"
                } else {
                    positive_sign(&spec)
                };
                let digits = integer_digits(value.unsigned_abs(), 10, false, spec.precision);
                pad(&mut out, &spec, sign, &digits, spec.precision.is_none());
            }
            'u' => {
                let digits = integer_digits(args.word()?, 10, false, spec.precision);
                pad(&mut out, &spec, "", &digits, spec.precision.is_none());
            }
            'x' | 'X' => {
                let value = args.word()?;
                let upper = conversion == 'X';
                let digits = integer_digits(value, 16, upper, spec.precision);
                let prefix = match (spec.alt && value != 0, upper) {
                    (false, _) => "",
                    (true, false) => "0x",
                    (true, true) => "0X",
                };
                pad(&mut out, &spec, prefix, &digits, spec.precision.is_none());
            }
            'o' => {
                let mut digits = integer_digits(args.word()?, 8, false, spec.precision);
                if spec.alt && !digits.starts_with('0') {
                    digits.insert(0, '0');
                }
                pad(&mut out, &spec, "", &digits, spec.precision.is_none());
            }
            'p' => {
                let digits = format!("{:x}", args.word()?);
                pad(&mut out, &spec, "0x", &digits, false);
            }
            'c' => {
                let c = char::from(args.word()? as u8);
                pad(&mut out, &spec, "", c.encode_utf8(&mut [0; 4]), false);
            }
            's' => {
                let s = args.string()?;
                let s = match spec.precision {
                    Some(limit) => match s.char_indices().nth(limit) {
                        Some((end, _)) => &s[..end],
                        None => s,
                    },
                    None => s,
                };
                pad(&mut out, &spec, "", s, false);
            }
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' => {
                let value = f64::from_bits(args.word()?);
                format_float(&mut out, &spec, conversion, value);
            }
            other => return Err(FormatError::Unsupported(other)),
        }
    }
    Ok(out)
}

fn parse_spec(chars: &mut Peekable<Chars<'_>>, args: &mut Args<'_>) -> Result<FieldSpec, FormatError> {
    let mut spec = FieldSpec::default();

    while let Some(&flag) = chars.peek() {
        match flag {
            '-' => spec.left = true,
            '+' => spec.plus = true,
            ' ' => spec.space = true,
            '#' => spec.alt = true,
            '0' => spec.zero = true,
            _ => break,
        }
        chars.next();
    }

    if chars.peek() == Some(&'*') {
        chars.next();
        let width = args.star()?;
        if width < 0 {
            spec.left = true;
        }
        spec.width = field(width.unsigned_abs() as usize)?;
    } else {
        spec.width = parse_number(chars)?.unwrap_or(0);
    }

    if chars.peek() == Some(&'.') {
        chars.next();
        if chars.peek() == Some(&'*') {
            chars.next();
            let precision = args.star()?;
            // A negative precision is taken as if omitted
            spec.precision = match usize::try_from(precision) {
                Ok(p) => Some(field(p)?),
                Err(_) => None,
            };
        } else {
            spec.precision = Some(parse_number(chars)?.unwrap_or(0));
        }
    }

    // Length modifiers: every argument is already a full word
    while matches!(chars.peek(), Some('h' | 'l' | 'q' | 'j' | 'z' | 't' | 'L')) {
        chars.next();
    }

    Ok(spec)
}

fn parse_number(chars: &mut Peekable<Chars<'_>>) -> Result<Option<usize>, FormatError> {
    let mut value: Option<usize> = None;
    while let Some(digit) = chars.peek().and_then(|c| c.to_digit(10)) {
        chars.next();
        let next = value
            .unwrap_or(0)
            .saturating_mul(10)
            .saturating_add(digit as usize);
        value = Some(next);
    }
    value.map(field).transpose()
}

fn field(value: usize) -> Result<usize, FormatError> {
    if value > MAX_FIELD {
        return Err(FormatError::FieldTooWide(value));
    }
    Ok(value)
}

fn positive_sign(spec: &FieldSpec) -> &'static str {
    if spec.plus {
        "+"
    } else if spec.space {
        " "
    } else {
        ""
    }
}

fn integer_digits(value: u64, radix: u32, upper: bool, precision: Option<usize>) -> String {
    if value == 0 && precision == Some(0) {
        return String::new();
    }
    let digits = match (radix, upper) {
        (16, false) => format!("{:x}", value),
        (16, true) => format!("{:X}", value),
        (8, _) => format!("{:o}", value),
        _ => value.to_string(),
    };
    match precision {
        Some(min) if min > digits.len() => format!("{}{}", "0".repeat(min - digits.len()), digits),
        _ => digits,
    }
}

/// Emit `prefix` and `body` padded to the field width
fn pad(out: &mut String, spec: &FieldSpec, prefix: &str, body: &str, zero_allowed: bool) {
    let len = prefix.chars().count() + body.chars().count();
    let fill = spec.width.saturating_sub(len);

    if spec.left {
        out.push_str(prefix);
        out.push_str(body);
        out.extend(std::iter::repeat(' ').take(fill));
    } else if spec.zero && zero_allowed {
        out.push_str(prefix);
        out.extend(std::iter::repeat('0').take(fill));
        out.push_str(body);
    } else {
        out.extend(std::iter::repeat(' ').take(fill));
        out.push_str(prefix);
        out.push_str(body);
    }
}

fn format_float(out: &mut String, spec: &FieldSpec, conversion: char, value: f64) {
    let upper = conversion.is_ascii_uppercase();
    let sign = if value.is_sign_negative() && !value.is_nan() {
        "-"
    } else {
        positive_sign(spec)
    };

    if !value.is_finite() {
        let body = match (value.is_nan(), upper) {
            (true, false) => "nan",
            (true, true) => "NAN",
            (false, false) => "inf",
            (false, true) => "INF",
        };
        pad(out, spec, sign, body, false);
        return;
    }

    let magnitude = value.abs();
    let precision = spec.precision.unwrap_or(6);
    let body = match conversion.to_ascii_lowercase() {
        'e' => exponential(magnitude, precision, spec.alt),
        'g' => general(magnitude, precision, spec.alt),
        _ => fixed(magnitude, precision, spec.alt),
    };
    let body = if upper { body.to_ascii_uppercase() } else { body };
    pad(out, spec, sign, &body, true);
}

fn fixed(value: f64, precision: usize, alt: bool) -> String {
    let mut s = format!("{:.*}", precision, value);
    if alt && precision == 0 {
        s.push('.');
    }
    s
}

/// Split Rust's `1.5e3` rendering into mantissa and exponent
fn rust_exponential(value: f64, precision: usize) -> (String, i32) {
    let s = format!("{:.*e}", precision, value);
    match s.split_once('e') {
        Some((mantissa, exponent)) => (mantissa.to_string(), exponent.parse().unwrap_or(0)),
        None => (s, 0),
    }
}

fn c_exponent(mantissa: &str, exponent: i32) -> String {
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{}e{}{:02}", mantissa, sign, exponent.unsigned_abs())
}

fn exponential(value: f64, precision: usize, alt: bool) -> String {
    let (mut mantissa, exponent) = rust_exponential(value, precision);
    if alt && precision == 0 {
        mantissa.push('.');
    }
    c_exponent(&mantissa, exponent)
}

fn strip_fraction_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// `%g`: the shorter of `%e` and `%f` by the C rules
fn general(value: f64, precision: usize, alt: bool) -> String {
    let precision = precision.max(1);
    let (_, exponent) = rust_exponential(value, precision - 1);

    if exponent >= -4 && exponent < precision as i32 {
        let decimals = (precision as i32 - 1 - exponent) as usize;
        let s = fixed(value, decimals, alt);
        if alt {
            s
        } else {
            strip_fraction_zeros(&s).to_string()
        }
    } else {
        let (mantissa, exponent) = rust_exponential(value, precision - 1);
        let mantissa = if alt {
            if mantissa.contains('.') {
                mantissa
            } else {
                format!("{}.", mantissa)
            }
        } else {
            strip_fraction_zeros(&mantissa).to_string()
        };
        c_exponent(&mantissa, exponent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(fmt: &str, words: &[u64]) -> String {
        format(fmt, words, &[]).unwrap()
    }

    fn float(fmt: &str, value: f64) -> String {
        format(fmt, &[value.to_bits()], &[]).unwrap()
    }

    #[test]
    fn test_integers() {
        assert_eq!(words("%d", &[(-42i64) as u64]), "-42");
        assert_eq!(words("[%5d]", &[(-42i64) as u64]), "[  -42]");
        assert_eq!(words("[%-5d]", &[(-42i64) as u64]), "[-42  ]");
        assert_eq!(words("[%05d]", &[(-42i64) as u64]), "[-0042]");
        assert_eq!(words("%+d % d", &[5, 5]), "+5  5");
        assert_eq!(words("%.3d", &[7]), "007");
        assert_eq!(words("[%.0d]", &[0]), "[]");
        assert_eq!(words("%u", &[u64::MAX]), "18446744073709551615");
        assert_eq!(words("%ld %lld %zu %hhd", &[1, 2, 3, 4]), "1 2 3 4");
    }

    #[test]
    fn test_radix_conversions() {
        assert_eq!(words("%x %X", &[255, 255]), "ff FF");
        assert_eq!(words("%#x %#X %#x", &[255, 255, 0]), "0xff 0XFF 0");
        assert_eq!(words("%o %#o", &[8, 8]), "10 010");
        assert_eq!(words("%08x", &[0xbeef]), "0000beef");
        assert_eq!(words("%p", &[0x1000]), "0x1000");
    }

    #[test]
    fn test_chars_and_strings() {
        let strings = vec!["hi".to_string(), "hello".to_string()];
        assert_eq!(
            format("%c|%4s|%.3s|%-4c|", &[b'A' as u64, b'z' as u64], &strings).unwrap(),
            "A|  hi|hel|z   |"
        );
        assert_eq!(words("100%%", &[]), "100%");
    }

    #[test]
    fn test_star_width_and_precision() {
        assert_eq!(words("[%*d]", &[4, 7]), "[   7]");
        assert_eq!(words("[%*d]", &[(-4i64) as u64, 7]), "[7   ]");
        assert_eq!(
            format("%.*f", &[2, 3.14159f64.to_bits()], &[]).unwrap(),
            "3.14"
        );
    }

    #[test]
    fn test_fixed_and_exponential() {
        assert_eq!(float("%f", 1.5), "1.500000");
        assert_eq!(float("%.2f", -0.126), "-0.13");
        assert_eq!(float("%8.3f", 3.14159), "   3.142");
        assert_eq!(float("%08.2f", -1.25), "-0001.25");
        assert_eq!(float("%#.0f", 3.0), "3.");
        assert_eq!(float("%e", 12345.678), "1.234568e+04");
        assert_eq!(float("%.2E", 0.000123), "1.23E-04");
        assert_eq!(float("%F", f64::INFINITY), "INF");
        assert_eq!(float("%f", f64::NEG_INFINITY), "-inf");
        assert_eq!(float("%5f", f64::NAN), "  nan");
    }

    #[test]
    fn test_general() {
        assert_eq!(float("%g", 100000.0), "100000");
        assert_eq!(float("%g", 1000000.0), "1e+06");
        assert_eq!(float("%g", 0.0001), "0.0001");
        assert_eq!(float("%g", 0.00001), "1e-05");
        assert_eq!(float("%g", 123456789.0), "1.23457e+08");
        assert_eq!(float("%.3g", 3.14159), "3.14");
        assert_eq!(float("%g", 0.0), "0");
        assert_eq!(float("%#g", 1.0), "1.00000");
        assert_eq!(float("%G", 1e-10), "1E-10");
    }

    #[test]
    fn test_errors() {
        assert_eq!(format("%d %d", &[1], &[]), Err(FormatError::MissingWord(2)));
        assert_eq!(format("%s", &[], &[]), Err(FormatError::MissingString(1)));
        assert_eq!(format("%n", &[0], &[]), Err(FormatError::Unsupported('n')));
        assert_eq!(format("abc %", &[], &[]), Err(FormatError::Truncated));
        assert_eq!(
            format("%99999d", &[1], &[]),
            Err(FormatError::FieldTooWide(99999))
        );
    }

    #[test]
    fn test_extra_arguments_ignored() {
        assert_eq!(words("plain", &[1, 2, 3]), "plain");
    }
}
