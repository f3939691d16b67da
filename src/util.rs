use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[must_use]
pub fn cancel_requested(cancel: &Option<Arc<AtomicBool>>) -> bool {
    cancel
        .as_deref()
        .is_some_and(|flag| flag.load(Ordering::SeqCst))
}

/// Byte count with binary units, as shown in delta and savings reports.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [(&str, u64, usize); 3] = [
        ("GB", 1 << 30, 2),
        ("MB", 1 << 20, 1),
        ("KB", 1 << 10, 1),
    ];
    UNITS
        .iter()
        .find(|(_, size, _)| bytes >= *size)
        .map(|(unit, size, precision)| {
            format!("{:.*} {unit}", *precision, bytes as f64 / *size as f64)
        })
        .unwrap_or_else(|| format!("{bytes} B"))
}

#[must_use]
pub fn format_speed(bytes_per_sec: f32) -> String {
    format!("{}/s", format_bytes(bytes_per_sec.max(0.0) as u64))
}

/// `done` out of `total` as a percentage in `0..=100`. An unknown or empty total reads as 0.
#[must_use]
pub fn progress_percent(done: u64, total: Option<u64>) -> f32 {
    match total {
        Some(total) if total > 0 => (done.min(total) as f32 / total as f32) * 100.0,
        _ => 0.0,
    }
}
