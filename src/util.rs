use crate::error::QopsError;

/// Parse a memory amount into MiB, the unit qubesd uses for `memory`/`maxmem`.
///
/// Accepts formats like `"4G"`, `"800M"`, `"800"` (already MiB) and `"1T"`.
/// Uses binary units (1G = 1024 MiB).
pub fn parse_memory_mib(field: &str, s: &str) -> Result<u64, QopsError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(QopsError::InvalidValue {
            field: field.into(),
            message: "size cannot be empty".into(),
        });
    }

    // Split into numeric part and suffix
    let (num_str, suffix) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str.trim().parse().map_err(|_| QopsError::InvalidValue {
        field: field.into(),
        message: format!("invalid size number: '{num_str}'"),
    })?;

    let multiplier: u64 = match suffix.as_str() {
        "" | "M" | "MB" | "MIB" => 1,
        "G" | "GB" | "GIB" => 1024,
        "T" | "TB" | "TIB" => 1024 * 1024,
        _ => {
            return Err(QopsError::InvalidValue {
                field: field.into(),
                message: format!("unknown size suffix: '{suffix}' (use M, G or T)"),
            });
        }
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| QopsError::InvalidValue {
            field: field.into(),
            message: format!("size overflows: '{s}'"),
        })
}

/// Render captured stderr for error messages: lossy UTF-8, trimmed, bounded.
pub fn stderr_summary(stderr: &[u8]) -> String {
    const MAX: usize = 512;
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut end = MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
