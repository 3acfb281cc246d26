#![forbid(unsafe_code)]

use crate::error::FilterError;
use packet_types::tcp_flags;

/// Canonical letter order; `format_flags` emits letters in this order.
const LETTERS: [(char, u16); 8] = [
    ('F', tcp_flags::FIN),
    ('S', tcp_flags::SYN),
    ('R', tcp_flags::RST),
    ('P', tcp_flags::PSH),
    ('A', tcp_flags::ACK),
    ('U', tcp_flags::URG),
    ('E', tcp_flags::ECE),
    ('W', tcp_flags::CWR),
];

/// Default mask when the rule text names no mask: the standard set minus
/// the ECN pair for a bare SYN requirement, minus ECE otherwise.
const SYN_ONLY_MASK: u16 = tcp_flags::STANDARD & !(tcp_flags::ECE | tcp_flags::CWR);
const DEFAULT_MASK: u16 = tcp_flags::STANDARD & !tcp_flags::ECE;

/// Parse a flag specification of the form `FLAGS` or `FLAGS/MASK` into
/// `(required, mask)` bitsets. Either side may be a letter string or a
/// numeric literal (`0x` hex or decimal) for bits with no assigned letter.
/// A zero mask falls back to the policy default, matching the legacy
/// parser.
pub fn parse_flags(text: &str) -> Result<(u16, u16), FilterError> {
    let (set_text, mask_text) = match text.split_once('/') {
        Some((set, mask)) => (set, Some(mask)),
        None => (text, None),
    };

    let set = parse_side(set_text)?;
    let mut mask = match mask_text {
        Some(m) => parse_side(m)?,
        None => 0,
    };
    if mask == 0 {
        mask = if set == tcp_flags::SYN {
            SYN_ONLY_MASK
        } else {
            DEFAULT_MASK
        };
    }
    Ok((set, mask))
}

fn parse_side(text: &str) -> Result<u16, FilterError> {
    if text.starts_with(|c: char| c.is_ascii_digit()) {
        return parse_literal(text);
    }
    let mut bits = 0u16;
    for c in text.chars() {
        match LETTERS.iter().find(|(letter, _)| *letter == c) {
            Some((_, bit)) => bits |= bit,
            None => return Err(FilterError::InvalidFlagLetter(c)),
        }
    }
    Ok(bits)
}

fn parse_literal(text: &str) -> Result<u16, FilterError> {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        text.parse::<u16>()
    };
    parsed.map_err(|_| FilterError::BadFlagLiteral(text.to_string()))
}

/// Render a flag bitset as its minimal letter string. Bits without an
/// assigned letter are skipped; `parse_flags` is the inverse for every set
/// of assigned bits.
pub fn format_flags(bits: u16) -> String {
    let mut out = String::new();
    for (letter, bit) in LETTERS {
        if bits & bit != 0 {
            out.push(letter);
        }
    }
    out
}
