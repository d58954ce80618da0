use crate::config::AckConfig;

const DEFAULT_CLINIC_NAME: &str = "our clinic";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    FirstSms,
    ReturningSms,
    FirstMissedCall,
    ReturningMissedCall,
}

impl AckKind {
    pub fn for_sms(first_contact: bool) -> Self {
        if first_contact {
            AckKind::FirstSms
        } else {
            AckKind::ReturningSms
        }
    }

    pub fn for_missed_call(first_contact: bool) -> Self {
        if first_contact {
            AckKind::FirstMissedCall
        } else {
            AckKind::ReturningMissedCall
        }
    }
}

fn pool(table: &AckConfig, kind: AckKind) -> &[String] {
    match kind {
        AckKind::FirstSms => &table.first_sms,
        AckKind::ReturningSms => &table.returning_sms,
        AckKind::FirstMissedCall => &table.first_missed_call,
        AckKind::ReturningMissedCall => &table.returning_missed_call,
    }
}

// FNV-1a; stable across builds so the same seed always picks the same variant.
fn seed_index(seed: &str, len: usize) -> usize {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in seed.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % len as u64) as usize
}

/// Picks the acknowledgement copy for `kind`. `None` when the pool is empty.
pub fn select_ack(
    table: &AckConfig,
    kind: AckKind,
    seed: &str,
    clinic_name: Option<&str>,
) -> Option<String> {
    let variants: Vec<&String> = pool(table, kind)
        .iter()
        .filter(|v| !v.trim().is_empty())
        .collect();
    if variants.is_empty() {
        return None;
    }
    let template = variants[seed_index(seed, variants.len())];
    let clinic = clinic_name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_CLINIC_NAME);
    Some(template.replace("{clinic}", clinic))
}
