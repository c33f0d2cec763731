use pgm_transport::checksum::{csum, csum_block_add, csum_fold, csum_partial};
use pgm_transport::packet::{Data, PacketOptions};
use pgm_transport::rate::RateLimiter;
use pgm_transport::rxw::{NakTiming, ReceiveWindow};
use pgm_transport::skb::SocketBuffer;
use pgm_transport::sqn::Sqn;
use pgm_transport::time::{Clock, ManualClock};
use pgm_transport::tsi::{Gsi, Tsi};
use pgm_transport::txw::TransmitWindow;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::{Duration, Instant};

fn reference_checksum(data: &[u8]) -> u16 {
    let mut sum: u64 = 0;
    for chunk in data.chunks(2) {
        let hi = u64::from(chunk[0]) << 8;
        let lo = u64::from(chunk.get(1).copied().unwrap_or(0));
        sum += hi | lo;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    let folded = !(sum as u16);
    if folded == 0 {
        0xffff
    } else {
        folded
    }
}

fn timing() -> NakTiming {
    NakTiming {
        nak_bo_ivl: Duration::from_millis(50),
        nak_rpt_ivl: Duration::from_secs(2),
        nak_rdata_ivl: Duration::from_secs(2),
        nak_data_retries: 2,
        nak_ncf_retries: 2,
    }
}

fn plain_data(sqn: u32, payload: Vec<u8>) -> Data {
    Data {
        sqn: Sqn(sqn),
        trail: Sqn(0),
        options: PacketOptions::default(),
        payload,
        is_parity: false,
        is_var_pktlen: false,
    }
}

proptest! {
    #[test]
    fn prop_checksum_matches_reference(data in prop::collection::vec(any::<u8>(), 0..2048)) {
        prop_assert_eq!(csum(&data), reference_checksum(&data));
    }

    #[test]
    fn prop_checksum_split_recombines(
        data in prop::collection::vec(any::<u8>(), 1..1024),
        split_seed in any::<usize>(),
    ) {
        let split = split_seed % data.len();
        let (head, tail) = data.split_at(split);
        let acc = csum_block_add(csum_partial(head, 0), csum_partial(tail, 0), split);
        prop_assert_eq!(csum_fold(acc), csum(&data));
    }

    #[test]
    fn prop_sqn_ordering_antisymmetric(a in any::<u32>(), b in any::<u32>()) {
        // At exactly half the space the difference is its own negation and
        // the order is genuinely ambiguous; everywhere else it is total.
        prop_assume!(a.wrapping_sub(b) != 0x8000_0000);
        let (a, b) = (Sqn(a), Sqn(b));
        if a == b {
            prop_assert!(a.lte(b) && a.gte(b) && !a.lt(b) && !a.gt(b));
        } else {
            prop_assert_ne!(a.lt(b), a.gt(b));
            prop_assert_eq!(a.lt(b), b.gt(a));
        }
    }

    #[test]
    fn prop_txw_peek_returns_appended(count in 1usize..64, capacity in 1u32..32) {
        let mut w = TransmitWindow::new(capacity, Sqn(0), None).unwrap();
        let tsi = Tsi::new(Gsi([1, 2, 3, 4, 5, 6]), 1000);
        for i in 0..count {
            let payload = format!("payload {i}");
            let (skb, unfolded) =
                SocketBuffer::for_odata(&tsi, 7500, None, payload.as_bytes(), Instant::now());
            w.add(skb, unfolded);
        }
        // The newest `min(count, capacity)` sequences are retained
        // verbatim; everything older has rolled out.
        let retained = count.min(capacity as usize);
        for i in 0..count {
            let slot = w.peek(Sqn(i as u32));
            if i < count - retained {
                prop_assert!(slot.is_none());
            } else {
                let payload = format!("payload {i}");
                prop_assert_eq!(slot.unwrap().skb.payload(), payload.as_bytes());
            }
        }
        prop_assert!(w.len() <= w.capacity());
    }

    #[test]
    fn prop_txw_duplicate_requests_collapse(dups in 1usize..8) {
        let mut w = TransmitWindow::new(8, Sqn(0), None).unwrap();
        let tsi = Tsi::new(Gsi([1, 2, 3, 4, 5, 6]), 1000);
        let (skb, unfolded) = SocketBuffer::for_odata(&tsi, 7500, None, b"x", Instant::now());
        let sqn = w.add(skb, unfolded);
        w.push_retransmit(sqn, false);
        for _ in 0..dups {
            w.push_retransmit(sqn, false);
        }
        prop_assert_eq!(w.peek(sqn).unwrap().nak_elimination_count, dups as u32);
        // One queue entry only: a single pop empties the queue.
        w.pop_retransmit();
        prop_assert!(w.retransmit_is_empty());
    }

    #[test]
    fn prop_rxw_delivery_order_independent_of_arrival(
        order in Just((1u32..=24).collect::<Vec<u32>>()).prop_shuffle(),
        seed in any::<u64>(),
    ) {
        let mut w = ReceiveWindow::new(64, 1400, None).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let t = timing();
        let now = Instant::now();
        w.add(plain_data(0, b"base".to_vec()), now, &mut rng, &t);
        let mut msgv = Vec::new();
        w.flush(&mut msgv, 64);
        for &s in &order {
            w.add(plain_data(s, s.to_be_bytes().to_vec()), now, &mut rng, &t);
        }
        let mut msgv = Vec::new();
        let res = w.flush(&mut msgv, 64);
        prop_assert_eq!(res.delivered, 24);
        let expect: Vec<Vec<u8>> = (1u32..=24).map(|s| s.to_be_bytes().to_vec()).collect();
        prop_assert_eq!(msgv, expect);
    }

    #[test]
    fn prop_rxw_len_never_exceeds_capacity(
        gaps in prop::collection::vec(0u32..8, 1..64),
        seed in any::<u64>(),
    ) {
        let mut w = ReceiveWindow::new(16, 1400, None).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let t = timing();
        let now = Instant::now();
        let mut sqn = 0u32;
        w.add(plain_data(sqn, vec![0]), now, &mut rng, &t);
        for &gap in &gaps {
            sqn = sqn.wrapping_add(gap + 1);
            // The sender's trail follows a few sequences behind.
            let mut d = plain_data(sqn, vec![0]);
            d.trail = Sqn(sqn.saturating_sub(8));
            w.add(d, now, &mut rng, &t);
            prop_assert!(w.len() <= w.capacity());
        }
    }

    #[test]
    fn prop_rate_admissions_bounded(
        steps in prop::collection::vec((1u64..50, 100usize..600), 1..100),
    ) {
        let clock = ManualClock::new(Instant::now());
        let rate = 10_000u64;
        let bucket = RateLimiter::new(rate, 0, 1500, clock.now());
        let mut admitted = 0u64;
        let mut elapsed = Duration::ZERO;
        for &(millis, size) in &steps {
            if bucket.check(&clock, size, true) {
                admitted += size as u64;
            }
            let step = Duration::from_millis(millis);
            clock.advance(step);
            elapsed += step;
        }
        let bound = (rate as f64 * elapsed.as_secs_f64()) as u64 + rate;
        prop_assert!(admitted <= bound, "admitted {} > bound {}", admitted, bound);
    }
}
