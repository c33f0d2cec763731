use pgm_transport::fec::GroupCodec;
use pgm_transport::packet::{Data, Fragment, PacketOptions};
use pgm_transport::rxw::{NakTiming, ReceiveWindow, RxwAdd, SlotState};
use pgm_transport::sqn::Sqn;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::{Duration, Instant};

fn timing() -> NakTiming {
    NakTiming {
        nak_bo_ivl: Duration::from_millis(50),
        nak_rpt_ivl: Duration::from_secs(2),
        nak_rdata_ivl: Duration::from_secs(2),
        nak_data_retries: 2,
        nak_ncf_retries: 2,
    }
}

fn data(sqn: u32, trail: u32, payload: &[u8]) -> Data {
    Data {
        sqn: Sqn(sqn),
        trail: Sqn(trail),
        options: PacketOptions::default(),
        payload: payload.to_vec(),
        is_parity: false,
        is_var_pktlen: false,
    }
}

fn frag_data(sqn: u32, trail: u32, payload: &[u8], first: u32, off: u32, total: u32) -> Data {
    let mut d = data(sqn, trail, payload);
    d.options.fragment = Some(Fragment {
        first_sqn: Sqn(first),
        offset: off,
        total_length: total,
    });
    d
}

fn rxw(sqns: u32) -> (ReceiveWindow, StdRng, Instant) {
    (
        ReceiveWindow::new(sqns, 1400, None).unwrap(),
        StdRng::seed_from_u64(42),
        Instant::now(),
    )
}

#[test]
fn test_first_packet_defines_window() {
    let (mut w, mut rng, now) = rxw(64);
    assert!(!w.is_defined());
    assert_eq!(w.add(data(100, 100, b"hello"), now, &mut rng, &timing()), RxwAdd::Appended);
    assert!(w.is_defined());
    assert_eq!(w.trail(), Sqn(100));
    assert_eq!(w.lead(), Sqn(100));
    let mut msgv = Vec::new();
    let res = w.flush(&mut msgv, 16);
    assert_eq!(res.delivered, 1);
    assert_eq!(msgv, vec![b"hello".to_vec()]);
    assert_eq!(w.trail(), Sqn(101));
}

#[test]
fn test_gap_creates_backoff_placeholder() {
    let (mut w, mut rng, now) = rxw(64);
    w.add(data(0, 0, b"a"), now, &mut rng, &timing());
    assert_eq!(w.add(data(2, 0, b"c"), now, &mut rng, &timing()), RxwAdd::Appended);
    assert_eq!(w.slot_state(Sqn(1)), Some(SlotState::BackOff));
    assert_eq!(w.len(), 3);
    // Only the contiguous head is deliverable.
    let mut msgv = Vec::new();
    w.flush(&mut msgv, 16);
    assert_eq!(msgv, vec![b"a".to_vec()]);
    // Repair arrives, the rest drains in order.
    assert_eq!(w.add(data(1, 0, b"b"), now, &mut rng, &timing()), RxwAdd::Filled);
    let mut msgv = Vec::new();
    w.flush(&mut msgv, 16);
    assert_eq!(msgv, vec![b"b".to_vec(), b"c".to_vec()]);
}

#[test]
fn test_arrival_order_does_not_change_delivery_order() {
    let deliver = |second_first: bool| {
        let (mut w, mut rng, now) = rxw(64);
        w.add(data(5, 5, b"base"), now, &mut rng, &timing());
        let mut msgv = Vec::new();
        w.flush(&mut msgv, 16);
        if second_first {
            w.add(data(7, 5, b"seven"), now, &mut rng, &timing());
            w.add(data(6, 5, b"six"), now, &mut rng, &timing());
        } else {
            w.add(data(6, 5, b"six"), now, &mut rng, &timing());
            w.add(data(7, 5, b"seven"), now, &mut rng, &timing());
        }
        let mut msgv = Vec::new();
        w.flush(&mut msgv, 16);
        msgv
    };
    assert_eq!(deliver(false), deliver(true));
    assert_eq!(deliver(true), vec![b"six".to_vec(), b"seven".to_vec()]);
}

#[test]
fn test_duplicate_detection() {
    let (mut w, mut rng, now) = rxw(64);
    w.add(data(0, 0, b"a"), now, &mut rng, &timing());
    assert_eq!(w.add(data(0, 0, b"a"), now, &mut rng, &timing()), RxwAdd::Duplicate);
    let mut msgv = Vec::new();
    w.flush(&mut msgv, 16);
    // Below the delivery trail: already delivered.
    assert_eq!(w.add(data(0, 0, b"a"), now, &mut rng, &timing()), RxwAdd::Duplicate);
    assert_eq!(w.stats().duplicates, 2);
}

#[test]
fn test_out_of_bounds_discarded() {
    let (mut w, mut rng, now) = rxw(16);
    w.add(data(1000, 1000, b"a"), now, &mut rng, &timing());
    // Far beyond the permitted advance from the sender's trail.
    assert_eq!(
        w.add(data(1000 + 64, 1000, b"x"), now, &mut rng, &timing()),
        RxwAdd::NotInWindow
    );
    // Below the sender's advertised trail.
    assert_eq!(w.add(data(900, 1000, b"x"), now, &mut rng, &timing()), RxwAdd::NotInWindow);
}

#[test]
fn test_stale_out_of_window_packet_does_not_expire_recovery() {
    let t = timing();
    let (mut w, mut rng, now) = rxw(16);
    w.add(data(100, 100, b"a"), now, &mut rng, &t);
    w.add(data(102, 100, b"c"), now, &mut rng, &t);
    assert_eq!(w.slot_state(Sqn(101)), Some(SlotState::BackOff));

    // Reordered stale packets: out-of-window sequences carrying a trail
    // that has moved past the hole. They must not advance the edge.
    assert_eq!(w.add(data(200, 102, b"x"), now, &mut rng, &t), RxwAdd::NotInWindow);
    assert_eq!(w.add(data(90, 102, b"x"), now, &mut rng, &t), RxwAdd::NotInWindow);
    assert_eq!(w.rxw_trail(), Sqn(100));
    assert_eq!(w.slot_state(Sqn(101)), Some(SlotState::BackOff));
    assert_eq!(w.cumulative_losses(), 0);

    // The repair stays recoverable.
    assert_eq!(w.add(data(101, 100, b"b"), now, &mut rng, &t), RxwAdd::Filled);
    let mut msgv = Vec::new();
    w.flush(&mut msgv, 16);
    assert_eq!(msgv, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}

#[test]
fn test_fragment_head_after_own_sequence_is_malformed() {
    let t = timing();
    let mut w = ReceiveWindow::new(64, 4, None).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let now = Instant::now();
    w.add(data(0, 0, b"a"), now, &mut rng, &t);
    // Claims its APDU starts after itself.
    assert_eq!(
        w.add(frag_data(1, 0, b"bbbb", 2, 0, 8), now, &mut rng, &t),
        RxwAdd::Malformed
    );
    assert_eq!(w.slot_state(Sqn(1)), Some(SlotState::Lost));
    assert_eq!(w.cumulative_losses(), 1);
}

#[test]
fn test_fill_with_invalid_fragment_marks_lost() {
    let t = timing();
    let mut w = ReceiveWindow::new(64, 4, None).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let now = Instant::now();
    w.add(data(0, 0, b"a"), now, &mut rng, &t);
    w.add(data(2, 0, b"c"), now, &mut rng, &t);
    assert_eq!(w.slot_state(Sqn(1)), Some(SlotState::BackOff));
    assert_eq!(
        w.add(frag_data(1, 0, b"bb", 3, 0, 8), now, &mut rng, &t),
        RxwAdd::Malformed
    );
    assert_eq!(w.slot_state(Sqn(1)), Some(SlotState::Lost));
    assert_eq!(w.cumulative_losses(), 1);
    // The loss is surfaced and the window moves on.
    let mut msgv = Vec::new();
    let res = w.flush(&mut msgv, 16);
    assert_eq!(res.lost, 1);
    assert_eq!(msgv, vec![b"a".to_vec(), b"c".to_vec()]);
}

#[test]
fn test_fragment_head_already_delivered_is_unrecoverable() {
    let t = timing();
    let mut w = ReceiveWindow::new(64, 4, None).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let now = Instant::now();
    w.add(data(0, 0, b"a"), now, &mut rng, &t);
    w.add(data(1, 0, b"b"), now, &mut rng, &t);
    let mut msgv = Vec::new();
    w.flush(&mut msgv, 16);
    assert_eq!(w.trail(), Sqn(2));
    // Head names a sequence that already left through delivery.
    assert_eq!(
        w.add(frag_data(3, 0, b"cccc", 1, 8, 12), now, &mut rng, &t),
        RxwAdd::Malformed
    );
    assert_eq!(w.slot_state(Sqn(3)), Some(SlotState::Lost));
    assert_eq!(w.slot_state(Sqn(2)), Some(SlotState::BackOff));
}

#[test]
fn test_fragment_outside_apdu_span_is_malformed() {
    let t = timing();
    let mut w = ReceiveWindow::new(64, 4, None).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let now = Instant::now();
    // An 8-byte APDU spans two fragments; sequence 3 cannot be part of it.
    w.add(frag_data(0, 0, b"aaaa", 0, 0, 8), now, &mut rng, &t);
    assert_eq!(
        w.add(frag_data(3, 0, b"x", 0, 0, 8), now, &mut rng, &t),
        RxwAdd::Malformed
    );
    assert_eq!(w.slot_state(Sqn(3)), Some(SlotState::Lost));
    assert_eq!(w.cumulative_losses(), 1);
}

#[test]
fn test_confirm_is_idempotent_on_have_data() {
    let (mut w, mut rng, now) = rxw(64);
    w.add(data(0, 0, b"a"), now, &mut rng, &timing());
    w.confirm(Sqn(0), now, &mut rng, &timing());
    assert_eq!(w.slot_state(Sqn(0)), Some(SlotState::HaveData));
    let dispatch = w.dispatch_timers(now + Duration::from_secs(10), &timing());
    assert!(dispatch.naks.is_empty());
}

#[test]
fn test_confirm_moves_backoff_to_wait_data() {
    let (mut w, mut rng, now) = rxw(64);
    w.add(data(0, 0, b"a"), now, &mut rng, &timing());
    w.add(data(2, 0, b"c"), now, &mut rng, &timing());
    assert_eq!(w.slot_state(Sqn(1)), Some(SlotState::BackOff));
    w.confirm(Sqn(1), now, &mut rng, &timing());
    assert_eq!(w.slot_state(Sqn(1)), Some(SlotState::WaitData));
    // No NAK of our own when the back-off deadline passes.
    let dispatch = w.dispatch_timers(now + Duration::from_millis(60), &timing());
    assert!(dispatch.naks.is_empty());
}

#[test]
fn test_confirm_unknown_sequence_extends_window() {
    let (mut w, mut rng, now) = rxw(64);
    w.add(data(0, 0, b"a"), now, &mut rng, &timing());
    w.confirm(Sqn(3), now, &mut rng, &timing());
    assert_eq!(w.slot_state(Sqn(1)), Some(SlotState::BackOff));
    assert_eq!(w.slot_state(Sqn(2)), Some(SlotState::BackOff));
    assert_eq!(w.slot_state(Sqn(3)), Some(SlotState::WaitData));
    assert_eq!(w.lead(), Sqn(3));
}

#[test]
fn test_nak_state_ladder_to_lost() {
    let t = timing();
    let (mut w, mut rng, mut now) = rxw(64);
    w.add(data(0, 0, b"a"), now, &mut rng, &t);
    w.add(data(2, 0, b"c"), now, &mut rng, &t);

    // BACK_OFF -> WAIT_NCF, one NAK out.
    now += t.nak_bo_ivl;
    let dispatch = w.dispatch_timers(now, &t);
    assert_eq!(dispatch.naks.len(), 1);
    assert_eq!(dispatch.naks[0].as_slice(), &[Sqn(1)]);
    assert_eq!(w.slot_state(Sqn(1)), Some(SlotState::WaitNcf));

    // No NCF: retried until the cap, then lost.
    for _ in 0..t.nak_ncf_retries {
        now += t.nak_rpt_ivl;
        let dispatch = w.dispatch_timers(now, &t);
        assert_eq!(dispatch.naks.len(), 1);
        assert_eq!(w.slot_state(Sqn(1)), Some(SlotState::WaitNcf));
    }
    now += t.nak_rpt_ivl;
    let dispatch = w.dispatch_timers(now, &t);
    assert!(dispatch.naks.is_empty());
    assert_eq!(w.slot_state(Sqn(1)), Some(SlotState::Lost));
    assert_eq!(w.cumulative_losses(), 1);

    // Loss is surfaced on delivery and the window moves on.
    let mut msgv = Vec::new();
    let res = w.flush(&mut msgv, 16);
    assert_eq!(res.lost, 1);
    assert_eq!(msgv, vec![b"a".to_vec(), b"c".to_vec()]);
    assert_eq!(w.trail(), Sqn(3));
}

#[test]
fn test_wait_data_retries_then_lost() {
    let t = timing();
    let (mut w, mut rng, mut now) = rxw(64);
    w.add(data(0, 0, b"a"), now, &mut rng, &t);
    w.add(data(2, 0, b"c"), now, &mut rng, &t);
    w.confirm(Sqn(1), now, &mut rng, &t);
    assert_eq!(w.slot_state(Sqn(1)), Some(SlotState::WaitData));

    // Repair never arrives: retries, then abandonment.
    for _ in 0..t.nak_data_retries {
        now += t.nak_rdata_ivl;
        let dispatch = w.dispatch_timers(now, &t);
        assert_eq!(dispatch.naks.len(), 1, "retry NAK expected");
        assert_eq!(w.slot_state(Sqn(1)), Some(SlotState::WaitData));
    }
    now += t.nak_rdata_ivl;
    w.dispatch_timers(now, &t);
    assert_eq!(w.slot_state(Sqn(1)), Some(SlotState::Lost));
    assert_eq!(w.cumulative_losses(), 1);
}

#[test]
fn test_update_extends_lead_and_expires_trail() {
    let t = timing();
    let (mut w, mut rng, now) = rxw(64);
    w.add(data(10, 10, b"a"), now, &mut rng, &t);
    // SPM announces more data in flight: placeholders appear.
    w.update(Sqn(10), Sqn(13), now, &mut rng, &t);
    assert_eq!(w.lead(), Sqn(13));
    for s in 11..=13u32 {
        assert_eq!(w.slot_state(Sqn(s)), Some(SlotState::BackOff));
    }
    // The sender's trail then advances past the holes: they expire.
    w.update(Sqn(14), Sqn(14), now, &mut rng, &t);
    for s in 11..=13u32 {
        assert_eq!(w.slot_state(Sqn(s)), Some(SlotState::Lost), "sqn {s}");
    }
    assert_eq!(w.cumulative_losses(), 3);
}

#[test]
fn test_late_join_starts_empty_at_lead() {
    let t = timing();
    let (mut w, mut rng, now) = rxw(64);
    w.update(Sqn(90), Sqn(99), now, &mut rng, &t);
    assert!(w.is_defined());
    assert!(w.is_empty());
    // No historical recovery is attempted.
    assert!(w.next_expiry().is_none());
    assert_eq!(w.add(data(100, 90, b"new"), now, &mut rng, &t), RxwAdd::Appended);
}

#[test]
fn test_window_length_capped_on_overflow() {
    let t = timing();
    let (mut w, mut rng, now) = rxw(4);
    w.add(data(0, 0, b"a"), now, &mut rng, &t);
    // The furthest admissible advance still overflows a four-slot window.
    assert_eq!(w.add(data(4, 0, b"e"), now, &mut rng, &t), RxwAdd::Appended);
    assert!(w.len() <= 4);
    assert_eq!(w.lead(), Sqn(4));
    assert_eq!(w.trail(), Sqn(1));
    // Sequence 0 carried undelivered data when it was pushed out.
    assert_eq!(w.cumulative_losses(), 1);
    // Beyond the permitted advance is discarded outright.
    assert_eq!(w.add(data(20, 0, b"x"), now, &mut rng, &t), RxwAdd::NotInWindow);
}

#[test]
fn test_nak_batches_cap_at_sixty_three() {
    let t = timing();
    let (mut w, mut rng, now) = rxw(256);
    w.add(data(0, 0, b"a"), now, &mut rng, &t);
    w.add(data(100, 0, b"z"), now, &mut rng, &t);
    let dispatch = w.dispatch_timers(now + t.nak_bo_ivl, &t);
    assert_eq!(dispatch.naks.len(), 2);
    assert_eq!(dispatch.naks[0].len(), 63);
    assert_eq!(dispatch.naks[1].len(), 99 - 63);
}

#[test]
fn test_apdu_delivered_once_complete() {
    let t = timing();
    let (mut w, mut rng, now) = (
        ReceiveWindow::new(64, 4, None).unwrap(),
        StdRng::seed_from_u64(7),
        Instant::now(),
    );
    // Three fragments of a 10-byte APDU, max TSDU 4.
    w.add(frag_data(0, 0, b"aaaa", 0, 0, 10), now, &mut rng, &t);
    w.add(frag_data(2, 0, b"cc", 0, 8, 10), now, &mut rng, &t);
    let mut msgv = Vec::new();
    let res = w.flush(&mut msgv, 16);
    assert_eq!(res.delivered, 0);
    assert!(msgv.is_empty());
    w.add(frag_data(1, 0, b"bbbb", 0, 4, 10), now, &mut rng, &t);
    let mut msgv = Vec::new();
    let res = w.flush(&mut msgv, 16);
    assert_eq!(res.delivered, 1);
    assert_eq!(msgv, vec![b"aaaabbbbcc".to_vec()]);
    assert_eq!(w.trail(), Sqn(3));
}

#[test]
fn test_lost_fragment_invalidates_whole_apdu() {
    let t = timing();
    let mut w = ReceiveWindow::new(64, 4, None).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let mut now = Instant::now();
    w.add(frag_data(0, 0, b"aaaa", 0, 0, 10), now, &mut rng, &t);
    w.add(frag_data(2, 0, b"cc", 0, 8, 10), now, &mut rng, &t);
    // Exhaust recovery of the middle fragment.
    now += t.nak_bo_ivl;
    w.dispatch_timers(now, &t);
    for _ in 0..=t.nak_ncf_retries {
        now += t.nak_rpt_ivl;
        w.dispatch_timers(now, &t);
    }
    assert_eq!(w.slot_state(Sqn(1)), Some(SlotState::Lost));
    let mut msgv = Vec::new();
    let res = w.flush(&mut msgv, 16);
    assert!(msgv.is_empty());
    // One loss event covering all three sequences.
    assert_eq!(res.lost, 1);
    assert_eq!(w.trail(), Sqn(3));
}

#[test]
fn test_buffer_full_indicator() {
    let t = timing();
    let (mut w, mut rng, now) = rxw(64);
    for s in 0..5u32 {
        w.add(data(s, 0, b"m"), now, &mut rng, &t);
    }
    let mut msgv = Vec::new();
    let res = w.flush(&mut msgv, 3);
    assert_eq!(res.delivered, 3);
    assert!(res.buffer_full);
    let mut msgv = Vec::new();
    let res = w.flush(&mut msgv, 16);
    assert_eq!(res.delivered, 2);
    assert!(!res.buffer_full);
}

fn parity_data(sqn: u32, trail: u32, payload: Vec<u8>, var: bool) -> Data {
    Data {
        sqn: Sqn(sqn),
        trail: Sqn(trail),
        options: PacketOptions::default(),
        payload,
        is_parity: true,
        is_var_pktlen: var,
    }
}

#[test]
fn test_parity_reconstructs_missing_source() {
    let t = timing();
    let codec = GroupCodec::new(4, 2).unwrap();
    let mut w = ReceiveWindow::new(16, 1400, Some(GroupCodec::new(4, 2).unwrap())).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let now = Instant::now();

    w.add(data(0, 0, b"aaaa"), now, &mut rng, &t);
    // Parity symbol h=0 (RS index 2) covers the missing sequence 1.
    let parity = codec.encode_parity(&[b"aaaa".as_slice(), b"bbbb".as_slice()], 0).unwrap();
    assert_eq!(w.add(parity_data(0, 0, parity, false), now, &mut rng, &t), RxwAdd::Filled);
    assert_eq!(w.slot_state(Sqn(1)), Some(SlotState::HaveData));
    let mut msgv = Vec::new();
    w.flush(&mut msgv, 16);
    assert_eq!(msgv, vec![b"aaaa".to_vec(), b"bbbb".to_vec()]);
}

#[test]
fn test_parity_only_group_reconstruction() {
    let t = timing();
    let codec = GroupCodec::new(4, 2).unwrap();
    let mut w = ReceiveWindow::new(16, 1400, Some(GroupCodec::new(4, 2).unwrap())).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let now = Instant::now();

    // Window must already be defined; an earlier delivered group does that.
    w.add(data(0, 0, b"warm"), now, &mut rng, &t);
    w.add(data(1, 0, b"up!!"), now, &mut rng, &t);
    let mut msgv = Vec::new();
    w.flush(&mut msgv, 16);

    // Both sources of group [2, 3] lost; two parity symbols arrive.
    let p0 = codec.encode_parity(&[b"eeee".as_slice(), b"ffff".as_slice()], 0).unwrap();
    let p1 = codec.encode_parity(&[b"eeee".as_slice(), b"ffff".as_slice()], 1).unwrap();
    assert_eq!(w.add(parity_data(2, 0, p0, false), now, &mut rng, &t), RxwAdd::Filled);
    assert_eq!(w.slot_state(Sqn(2)), Some(SlotState::HaveParity));
    assert_eq!(w.add(parity_data(3, 0, p1, false), now, &mut rng, &t), RxwAdd::Filled);
    // Decode runs once k symbols are on hand.
    assert_eq!(w.slot_state(Sqn(2)), Some(SlotState::HaveData));
    assert_eq!(w.slot_state(Sqn(3)), Some(SlotState::HaveData));
    let mut msgv = Vec::new();
    w.flush(&mut msgv, 16);
    assert_eq!(msgv, vec![b"eeee".to_vec(), b"ffff".to_vec()]);
}

#[test]
fn test_variable_length_parity_reconstruction() {
    let t = timing();
    let codec = GroupCodec::new(4, 2).unwrap();
    let mut w = ReceiveWindow::new(16, 1400, Some(GroupCodec::new(4, 2).unwrap())).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let now = Instant::now();

    // Padded source blocks: payload zero-padded to the longest TSDU, with
    // the true length appended.
    let block0 = {
        let mut b = b"aaaaa".to_vec();
        b.extend_from_slice(&5u16.to_be_bytes());
        b
    };
    let block1 = {
        let mut b = b"bb\0\0\0".to_vec();
        b.extend_from_slice(&2u16.to_be_bytes());
        b
    };
    let parity = codec
        .encode_parity(&[block0.as_slice(), block1.as_slice()], 0)
        .unwrap();

    w.add(data(0, 0, b"aaaaa"), now, &mut rng, &t);
    w.add(parity_data(0, 0, parity, true), now, &mut rng, &t);
    assert_eq!(w.slot_state(Sqn(1)), Some(SlotState::HaveData));
    let mut msgv = Vec::new();
    w.flush(&mut msgv, 16);
    assert_eq!(msgv, vec![b"aaaaa".to_vec(), b"bb".to_vec()]);
}

#[test]
fn test_parity_reconstructs_fragment_option() {
    let t = timing();
    let codec = GroupCodec::new(4, 2).unwrap();
    let mut w = ReceiveWindow::new(16, 4, Some(GroupCodec::new(4, 2).unwrap())).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let now = Instant::now();

    // Sequence 0 carries fragment 0 of an 8-byte APDU; sequence 1 carries
    // fragment 1 but is lost and recovered via parity.
    let frag0 = [0u32.to_be_bytes(), 0u32.to_be_bytes(), 8u32.to_be_bytes()].concat();
    let frag1 = [0u32.to_be_bytes(), 4u32.to_be_bytes(), 8u32.to_be_bytes()].concat();
    let payload_parity = codec.encode_parity(&[b"aaaa".as_slice(), b"bbbb".as_slice()], 0).unwrap();
    let opt_parity = codec.encode_parity(&[frag0.as_slice(), frag1.as_slice()], 0).unwrap();

    w.add(frag_data(0, 0, b"aaaa", 0, 0, 8), now, &mut rng, &t);
    let mut parity = parity_data(0, 0, payload_parity, false);
    parity.options.fragment = Some(Fragment {
        first_sqn: Sqn(u32::from_be_bytes(opt_parity[0..4].try_into().unwrap())),
        offset: u32::from_be_bytes(opt_parity[4..8].try_into().unwrap()),
        total_length: u32::from_be_bytes(opt_parity[8..12].try_into().unwrap()),
    });
    w.add(parity, now, &mut rng, &t);
    assert_eq!(w.slot_state(Sqn(1)), Some(SlotState::HaveData));

    let mut msgv = Vec::new();
    let res = w.flush(&mut msgv, 16);
    assert_eq!(res.delivered, 1);
    assert_eq!(msgv, vec![b"aaaabbbb".to_vec()]);
}
