//! Coalescing rules for hint-event storms.
//!
//! DISPLAYHINT word layout: [0] width, [1] height, [2] flags, [3] hint int,
//! [4] density (float), [5] cell width, [6] cell height, [7] display token.
//! FONTHINT word layout: [0] descriptor, [1] has-descriptor, [2] size in mm
//! (float), [3] hinting mode.

use crate::{BAD_FD, EventRecord, TargetKind, time_millis};

/// Merge `old` into `new` when both address the same display token.
///
/// Non-zero fields of the newer event win; zero dimension and cell fields
/// and non-positive density fall through to the older event; a strictly
/// negative hint word falls through; a missing timestamp is forced to the
/// process clock so consumers always observe monotonic time.
///
/// Returns false (and leaves `new` untouched) when the tokens differ.
pub fn merge_displayhint(new: &mut EventRecord, old: &EventRecord) -> bool {
    if new.tgt().ioevs[7].uv() != old.tgt().ioevs[7].uv() {
        return false;
    }

    let o = *old.tgt();
    let t = new.tgt_mut();

    if t.ioevs[0].iv() == 0 {
        t.ioevs[0] = o.ioevs[0];
    }
    if t.ioevs[1].iv() == 0 {
        t.ioevs[1] = o.ioevs[1];
    }
    if t.ioevs[3].iv() < 0 {
        t.ioevs[3] = o.ioevs[3];
    }
    if !(t.ioevs[4].fv() > 0.0) {
        t.ioevs[4] = o.ioevs[4];
    }
    if t.ioevs[5].iv() == 0 {
        t.ioevs[5] = o.ioevs[5];
    }
    if t.ioevs[6].iv() == 0 {
        t.ioevs[6] = o.ioevs[6];
    }
    if t.timestamp == 0 {
        t.timestamp = time_millis();
    }

    true
}

/// Fold a FONTHINT into a pending slot during pause aggregation. The
/// descriptor word is managed by the caller (it lives on the socket, not in
/// the record); size and hinting merge here.
pub fn merge_fonthint(pending: &mut EventRecord, new: &EventRecord) {
    pending.category = new.category;
    pending.tgt_mut().kind = TargetKind::FontHint as u8;

    if new.tgt().ioevs[2].fv() > 0.0 {
        pending.tgt_mut().ioevs[2] = new.tgt().ioevs[2];
    }
    if new.tgt().ioevs[3].iv() > -1 {
        pending.tgt_mut().ioevs[3] = new.tgt().ioevs[3];
    }
}

/// A fresh FONTHINT pending slot with the descriptor field cleared.
pub fn empty_fonthint() -> EventRecord {
    let mut ev = EventRecord::target(TargetKind::FontHint);
    ev.tgt_mut().ioevs[0].iv = BAD_FD;
    ev.tgt_mut().ioevs[3].iv = -1;
    ev
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dh(w: i32, h: i32, density: f32, token: u32) -> EventRecord {
        let mut ev = EventRecord::target(TargetKind::DisplayHint);
        ev.tgt_mut().ioevs[0].iv = w;
        ev.tgt_mut().ioevs[1].iv = h;
        ev.tgt_mut().ioevs[4].fv = density;
        ev.tgt_mut().ioevs[7].uv = token;
        ev
    }

    #[test]
    fn newest_nonzero_fields_win() {
        // Typical WM storm: (800x600, 38), (820x600, 0), (0x0, 42).
        let first = dh(800, 600, 38.0, 1);
        let mut second = dh(820, 600, 0.0, 1);
        assert!(merge_displayhint(&mut second, &first));

        let mut third = dh(0, 0, 42.0, 1);
        assert!(merge_displayhint(&mut third, &second));

        assert_eq!(third.tgt().ioevs[0].iv(), 820);
        assert_eq!(third.tgt().ioevs[1].iv(), 600);
        assert_eq!(third.tgt().ioevs[4].fv(), 42.0);
    }

    #[test]
    fn token_mismatch_blocks_merge() {
        let old = dh(800, 600, 38.0, 1);
        let mut new = dh(0, 0, 0.0, 2);
        assert!(!merge_displayhint(&mut new, &old));
        assert_eq!(new.tgt().ioevs[0].iv(), 0);
    }

    #[test]
    fn missing_timestamp_is_stamped() {
        // pin the clock epoch, then move past millisecond zero
        let _ = time_millis();
        std::thread::sleep(std::time::Duration::from_millis(2));

        let old = dh(10, 10, 1.0, 0);
        let mut new = dh(20, 20, 2.0, 0);
        assert_eq!(new.tgt().timestamp, 0);
        assert!(merge_displayhint(&mut new, &old));
        assert!(new.tgt().timestamp > 0);

        // an explicit timestamp is left alone
        let mut stamped = dh(30, 30, 2.0, 0);
        stamped.tgt_mut().timestamp = 77;
        assert!(merge_displayhint(&mut stamped, &old));
        assert_eq!(stamped.tgt().timestamp, 77);
    }

    #[test]
    fn fonthint_folds_size_and_hinting() {
        let mut pending = empty_fonthint();
        let mut a = EventRecord::target(TargetKind::FontHint);
        a.tgt_mut().ioevs[2].fv = 3.5;
        a.tgt_mut().ioevs[3].iv = -1;
        merge_fonthint(&mut pending, &a);

        let mut b = EventRecord::target(TargetKind::FontHint);
        b.tgt_mut().ioevs[2].fv = 0.0;
        b.tgt_mut().ioevs[3].iv = 2;
        merge_fonthint(&mut pending, &b);

        assert_eq!(pending.tgt().ioevs[2].fv(), 3.5);
        assert_eq!(pending.tgt().ioevs[3].iv(), 2);
    }
}
