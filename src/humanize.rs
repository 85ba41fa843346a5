//! Human-readable formatting for byte counts and UUIDs, used by progress
//! reporting, `list` output, and tracing fields.

use uuid::Uuid;

const UNITS: [&str; 5] = ["bytes", "KiB", "MiB", "GiB", "TiB"];
const BASE: f64 = 1024.0;

/// Renders `number` as e.g. `"1.500 MiB"`.
pub fn humanize(number: u64) -> String {
    if number == 0 {
        return format!("{:.3} {}", 0.0, UNITS[0]);
    }
    let pow = (number as f64).log(BASE).floor() as i32;
    let pow = pow.clamp(0, UNITS.len() as i32 - 1) as usize;
    let mantissa = number as f64 / BASE.powi(pow as i32);
    format!("{:.3} {}", mantissa, UNITS[pow])
}

/// Truncates a UUID to `xxxx...xxxx` for compact log lines.
pub fn print_uuid(uuid: &Uuid) -> String {
    let s = uuid.simple().to_string();
    format!("{}...{}", &s[..4], &s[s.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humanize_bytes() {
        assert_eq!(humanize(0), "0.000 bytes");
        assert_eq!(humanize(512), "512.000 bytes");
    }

    #[test]
    fn humanize_kib() {
        assert_eq!(humanize(1536), "1.500 KiB");
    }

    #[test]
    fn humanize_clamps_at_tib() {
        let huge = u64::MAX;
        assert!(humanize(huge).ends_with("TiB"));
    }

    #[test]
    fn print_uuid_truncates() {
        let u = Uuid::from_bytes([0x01; 16]);
        let printed = print_uuid(&u);
        assert_eq!(printed, "0101...0101");
    }
}
