//! Snapshot ID generation and grammar.
//!
//! `SN = <unix-ms, >=13 digits>-<8 lowercase hex>`. The hex suffix is random;
//! collisions within the same millisecond are handled by retrying generation, not by
//! serial allocation (spec.md §6).

use std::time::{SystemTime, UNIX_EPOCH};

/// Generate a fresh snapshot id, retrying if it happens to collide with `exists`.
pub fn generate_snapshot_id(mut exists: impl FnMut(&str) -> bool) -> String {
    loop {
        let id = one_candidate();
        if !exists(&id) {
            return id;
        }
    }
}

fn one_candidate() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis();
    format!("{millis}-{}", random_hex8())
}

fn random_hex8() -> String {
    // No external RNG dependency: XOR a high-resolution clock reading with the
    // process id and a thread-local counter to get 32 bits of spread that's
    // sufficient for a within-the-same-millisecond collision-avoidance suffix.
    use std::cell::Cell;
    thread_local! {
        static COUNTER: Cell<u32> = Cell::new(0);
    }
    let counter = COUNTER.with(|c| {
        let v = c.get().wrapping_add(1);
        c.set(v);
        v
    });
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .subsec_nanos();
    let pid = std::process::id();
    let mixed = nanos ^ pid.wrapping_mul(2654435761) ^ counter.wrapping_mul(40503);
    format!("{:08x}", mixed)
}

/// True if `s` has the shape `<>=13 digits>-<8 lowercase hex>`, independent of
/// whether a descriptor actually exists for it.
pub fn looks_like_snapshot_id(s: &str) -> bool {
    let Some((millis, suffix)) = s.split_once('-') else {
        return false;
    };
    millis.len() >= 13
        && millis.bytes().all(|b| b.is_ascii_digit())
        && suffix.len() == 8
        && suffix.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}
