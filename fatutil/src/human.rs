//! Human-readable byte counts.

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// Format `bytes` as `"904"`, `"2K"` or `"40M"`, rounding down.
pub fn human_size(bytes: u64) -> String {
    match bytes {
        b if b < KIB => b.to_string(),
        b if b < MIB => format!("{}K", b / KIB),
        b => format!("{}M", b / MIB),
    }
}
