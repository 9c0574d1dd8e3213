//! Secure multiplication protocols and the two-party linear layer, run over
//! the in-process mesh.

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use troika::fixedpoint::FixedPointEncoder;
use troika::layer::{AggregatorConfig, AggregatorState, SsheAggregator};
use troika::share::{self, ArithmeticShare};
use troika::simulate::simulate;
use troika::sshe::{self, CipherPair};
use troika::tensor::Matrix;

const TEST_KEY_BITS: u64 = 512;

fn close(a: &Matrix, b: &Matrix, tol: f64) {
    assert_eq!(a.shape(), b.shape());
    for (x, y) in a.data().iter().zip(b.data()) {
        assert!((x - y).abs() < tol, "{x} vs {y} exceeds {tol}");
    }
}

/// A full share of `m` at the local rank, a zero share elsewhere; the pair
/// is a valid additive sharing without any coordination.
fn trivial_share(encoder: &FixedPointEncoder, m: Option<&Matrix>, rows: usize, cols: usize) -> ArithmeticShare {
    match m {
        Some(m) => ArithmeticShare::from_encoded(encoder.encode(m), 1),
        None => ArithmeticShare::zeros(rows, cols),
    }
}

#[tokio::test]
async fn shared_input_reveals_only_at_destination() {
    let outputs = simulate(2, |mut comm| async move {
        let mut rng = ChaCha20Rng::seed_from_u64(comm.rank() as u64);
        let encoder = FixedPointEncoder::default();
        let plain =
            (comm.rank() == 0).then(|| Matrix::from_vec(2, 2, vec![1.25, -3.0, 0.5, 7.0]));
        let share = share::share_from(&mut comm, plain.as_ref(), 0, &encoder, &mut rng)
            .await
            .unwrap();
        share::reveal(&mut comm, &share, 1, &encoder).await.unwrap()
    })
    .await
    .unwrap();

    assert!(outputs[0].is_none());
    let revealed = outputs[1].as_ref().unwrap();
    close(
        revealed,
        &Matrix::from_vec(2, 2, vec![1.25, -3.0, 0.5, 7.0]),
        1e-9,
    );
}

#[tokio::test]
async fn smm_lc_recombines_to_the_product() {
    let ta = Matrix::from_vec(2, 3, vec![0.5, -1.0, 2.0, 1.5, 0.25, -0.75]);
    let tb = Matrix::from_vec(3, 2, vec![1.0, 0.5, -2.0, 1.25, 0.0, 3.0]);
    let expected = ta.matmul(&tb);

    let (ta2, tb2) = (ta.clone(), tb.clone());
    let outputs = simulate(2, move |mut comm| {
        let (ta, tb) = (ta2.clone(), tb2.clone());
        async move {
            let mut rng = ChaCha20Rng::seed_from_u64(100 + comm.rank() as u64);
            let encoder = FixedPointEncoder::default();
            let ciphers = sshe::exchange_keys(&mut comm, TEST_KEY_BITS, &mut rng)
                .await
                .unwrap();
            let (a, b) = if comm.rank() == 0 {
                (Some(encoder.encode(&ta)), None)
            } else {
                (None, Some(encoder.encode(&tb)))
            };
            let share = sshe::smm_lc(&mut comm, a.as_ref(), b.as_ref(), 0, 1, &ciphers, &mut rng)
                .await
                .unwrap()
                .truncate(&encoder);
            share::reveal_all(&mut comm, &share, &encoder).await.unwrap()
        }
    })
    .await
    .unwrap();

    close(&outputs[0], &expected, 1e-3);
    close(&outputs[1], &expected, 1e-3);
}

#[tokio::test]
async fn smm_output_share_does_not_track_the_peer_input() {
    let secret = 42.12345;
    let outputs = simulate(2, move |mut comm| async move {
        let mut rng = ChaCha20Rng::seed_from_u64(500 + comm.rank() as u64);
        let encoder = FixedPointEncoder::default();
        let ciphers = sshe::exchange_keys(&mut comm, TEST_KEY_BITS, &mut rng)
            .await
            .unwrap();
        let w = (comm.rank() == 1).then(|| Matrix::from_vec(1, 1, vec![2.0]));
        let w_share = share::share_from(&mut comm, w.as_ref(), 1, &encoder, &mut rng)
            .await
            .unwrap();
        let x = (comm.rank() == 0).then(|| encoder.encode(&Matrix::from_vec(1, 1, vec![secret])));
        let y = (comm.rank() == 1).then(|| w_share.clone());
        let out = sshe::smm(&mut comm, x.as_ref(), y.as_ref(), 0, 1, &ciphers, &encoder, &mut rng)
            .await
            .unwrap();
        // The best local estimate of the peer's input: normalize the own
        // output share by the own weight share.
        let guess = out.encoded().get(0, 0) as f64 / w_share.encoded().get(0, 0) as f64;
        let revealed = share::reveal_all(&mut comm, &out, &encoder).await.unwrap();
        (guess, revealed)
    })
    .await
    .unwrap();

    // The recombined product is correct, but the keyholder's share alone
    // lands nowhere near the other party's input.
    close(&outputs[1].1, &Matrix::from_vec(1, 1, vec![2.0 * secret]), 1e-3);
    assert!((outputs[1].0 - secret).abs() > 1.0);
}

#[tokio::test]
async fn cross_smm_matches_the_bilinear_form() {
    let xa = Matrix::from_vec(2, 3, vec![0.5, 1.0, -0.25, 2.0, -1.5, 0.75]);
    let xb = Matrix::from_vec(2, 2, vec![1.5, -0.5, 0.25, 2.0]);
    let wa = Matrix::from_vec(3, 1, vec![0.2, -0.4, 1.1]);
    let wb = Matrix::from_vec(2, 1, vec![0.6, -0.3]);
    let expected = xa.matmul(&wa).add(&xb.matmul(&wb));

    let inputs = (xa, xb, wa, wb);
    let outputs = simulate(2, move |mut comm| {
        let (xa, xb, wa, wb) = inputs.clone();
        async move {
            let mut rng = ChaCha20Rng::seed_from_u64(200 + comm.rank() as u64);
            let encoder = FixedPointEncoder::default();
            let ciphers = sshe::exchange_keys(&mut comm, TEST_KEY_BITS, &mut rng)
                .await
                .unwrap();
            let is_a = comm.rank() == 0;
            let wa_share = trivial_share(&encoder, is_a.then_some(&wa), wa.rows(), wa.cols());
            let wb_share =
                trivial_share(&encoder, (!is_a).then_some(&wb), wb.rows(), wb.cols());
            let out = sshe::cross_smm(
                &mut comm,
                &ciphers,
                is_a.then_some(&xa),
                (!is_a).then_some(&xb),
                &wa_share,
                &wb_share,
                0,
                1,
                &encoder,
                &mut rng,
            )
            .await
            .unwrap();
            share::reveal_all(&mut comm, &out, &encoder).await.unwrap()
        }
    })
    .await
    .unwrap();

    // Each party's share is truncated once, so the recombined result can
    // be off by up to two fixed-point ulps.
    close(&outputs[0], &expected, 2.0 / f64::from(1u32 << 16) + 1e-6);
    close(&outputs[1], &expected, 2.0 / f64::from(1u32 << 16) + 1e-6);
}

fn fixed_layer(
    rank: usize,
    encoder: &FixedPointEncoder,
    ciphers: CipherPair,
    wa: &Matrix,
    wb: &Matrix,
    learning_rate: f64,
) -> SsheAggregator {
    let is_a = rank == 0;
    let state = AggregatorState {
        rank_a: 0,
        rank_b: 1,
        learning_rate,
        precision_bits: encoder.precision_bits(),
        wa: trivial_share(encoder, is_a.then_some(wa), wa.rows(), wa.cols()),
        wb: trivial_share(encoder, (!is_a).then_some(wb), wb.rows(), wb.cols()),
    };
    SsheAggregator::restore(state, ciphers)
}

#[tokio::test]
async fn forward_reveals_two_point_zero_at_rank_b_only() {
    // xa = [[1, 2]], wa = [[0.1], [0.2]], xb = [[3]], wb = [[0.5]]:
    // 1*0.1 + 2*0.2 + 3*0.5 = 2.0, visible to the label holder only.
    let outputs = simulate(2, |mut comm| async move {
        let mut rng = ChaCha20Rng::seed_from_u64(300 + comm.rank() as u64);
        let encoder = FixedPointEncoder::default();
        let ciphers = sshe::exchange_keys(&mut comm, TEST_KEY_BITS, &mut rng)
            .await
            .unwrap();
        let wa = Matrix::from_vec(2, 1, vec![0.1, 0.2]);
        let wb = Matrix::from_vec(1, 1, vec![0.5]);
        let layer = fixed_layer(comm.rank(), &encoder, ciphers, &wa, &wb, 0.05);
        let x = if comm.rank() == 0 {
            Matrix::from_vec(1, 2, vec![1.0, 2.0])
        } else {
            Matrix::from_vec(1, 1, vec![3.0])
        };
        layer.forward(&mut comm, &x, &mut rng).await.unwrap()
    })
    .await
    .unwrap();

    assert_eq!(outputs[0].shape(), (1, 1));
    assert_eq!(outputs[0].get(0, 0), 0.0);
    assert!((outputs[1].get(0, 0) - 2.0).abs() < 1e-3);
}

#[tokio::test]
async fn backward_updates_both_weight_blocks() {
    let wa0 = Matrix::from_vec(2, 1, vec![0.1, 0.2]);
    let wb0 = Matrix::from_vec(1, 1, vec![0.5]);
    let lr = 0.1;
    let outputs = simulate(2, move |mut comm| {
        let (wa0, wb0) = (wa0.clone(), wb0.clone());
        async move {
            let mut rng = ChaCha20Rng::seed_from_u64(400 + comm.rank() as u64);
            let encoder = FixedPointEncoder::default();
            let ciphers = sshe::exchange_keys(&mut comm, TEST_KEY_BITS, &mut rng)
                .await
                .unwrap();
            let mut layer = fixed_layer(comm.rank(), &encoder, ciphers, &wa0, &wb0, lr);
            let (x, dz) = if comm.rank() == 0 {
                (Matrix::from_vec(1, 2, vec![1.0, 2.0]), None)
            } else {
                (
                    Matrix::from_vec(1, 1, vec![3.0]),
                    Some(Matrix::from_vec(1, 1, vec![0.4])),
                )
            };
            let dh = layer
                .backward(&mut comm, &x, dz.as_ref(), &mut rng)
                .await
                .unwrap();
            let weights = layer.weights_plaintext(&mut comm).await.unwrap();
            (dh, weights)
        }
    })
    .await
    .unwrap();

    // dha = dz @ waT = [[0.04, 0.08]], dhb = dz @ wbT = [[0.2]].
    close(&outputs[0].0, &Matrix::from_vec(1, 2, vec![0.04, 0.08]), 1e-3);
    close(&outputs[1].0, &Matrix::from_vec(1, 1, vec![0.2]), 1e-3);

    // wa -= lr * xaT @ dz, wb -= lr * xbT @ dz.
    let (wa, wb) = &outputs[0].1;
    close(wa, &Matrix::from_vec(2, 1, vec![0.1 - 0.04, 0.2 - 0.08]), 1e-3);
    close(wb, &Matrix::from_vec(1, 1, vec![0.5 - 0.12]), 1e-3);
    let (wa_b, wb_b) = &outputs[1].1;
    close(wa, wa_b, 1e-9);
    close(wb, wb_b, 1e-9);
}

#[test]
fn layer_state_round_trips_through_bincode() {
    let encoder = FixedPointEncoder::default();
    let wa = Matrix::from_vec(2, 1, vec![0.25, -1.5]);
    let state = AggregatorState {
        rank_a: 0,
        rank_b: 1,
        learning_rate: 0.05,
        precision_bits: encoder.precision_bits(),
        wa: trivial_share(&encoder, Some(&wa), 2, 1),
        wb: trivial_share(&encoder, None, 1, 1),
    };
    let bytes = bincode::serialize(&state).unwrap();
    let back: AggregatorState = bincode::deserialize(&bytes).unwrap();
    assert_eq!(back.wa, state.wa);
    assert_eq!(back.wb, state.wb);
    assert_eq!(back.learning_rate, state.learning_rate);
}
