const MIN_PAN_DIGITS: usize = 13;
const MAX_PAN_DIGITS: usize = 19;

pub fn luhn_valid(digits: &str) -> bool {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let mut sum = 0u32;
    for (i, b) in digits.bytes().rev().enumerate() {
        let mut d = (b - b'0') as u32;
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    sum % 10 == 0
}

/// Replaces Luhn-valid card numbers (13-19 digits, single spaces or hyphens
/// allowed between digits) with `[REDACTED_CARD_<last4>]`.
pub fn redact_pan(text: &str) -> (String, bool) {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut redacted = false;
    let mut i = 0;

    while i < chars.len() {
        if !chars[i].is_ascii_digit() {
            out.push(chars[i]);
            i += 1;
            continue;
        }

        let start = i;
        let mut end = i;
        let mut digits = String::new();
        while end < chars.len() {
            let c = chars[end];
            if c.is_ascii_digit() {
                digits.push(c);
                end += 1;
            } else if (c == ' ' || c == '-')
                && end + 1 < chars.len()
                && chars[end + 1].is_ascii_digit()
            {
                end += 1;
            } else {
                break;
            }
        }

        let len = digits.len();
        if (MIN_PAN_DIGITS..=MAX_PAN_DIGITS).contains(&len) && luhn_valid(&digits) {
            out.push_str(&format!("[REDACTED_CARD_{}]", &digits[len - 4..]));
            redacted = true;
        } else {
            out.extend(&chars[start..end]);
        }
        i = end;
    }

    if !redacted {
        return (text.to_string(), false);
    }
    (out, true)
}
