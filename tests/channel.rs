//! Channel fabric semantics: tag monotonicity, group scoping, collectives
//! and degenerate single-party sessions.

use troika::channel::{ChannelError, Communicator, ReduceOp};
use troika::session::{Party, Session};
use troika::simulate::simulate;
use troika::tensor::IntMatrix;
use troika::transport::{Instrumented, LocalTransport, LocalTransportError, Transport};

fn single_party_comm() -> Communicator<Instrumented<LocalTransport>> {
    let transport = LocalTransport::channels(1).remove(0);
    let session = Session::new(0, vec![Party::new("solo", 0)], 1).unwrap();
    Communicator::new(session, Instrumented::new(transport))
}

#[tokio::test]
async fn tags_are_strictly_increasing_from_zero() {
    let outputs = simulate(2, |mut comm| async move {
        if comm.rank() == 0 {
            for i in 0..4u64 {
                comm.send(&i, 1).await.unwrap();
            }
            comm.send_obj(&"done".to_string(), 1).await.unwrap();
        } else {
            for i in 0..4u64 {
                let v: u64 = comm.recv(0).await.unwrap();
                assert_eq!(v, i);
            }
            let _: String = comm.recv_obj(0).await.unwrap();
        }
        comm.transport().stats()
    })
    .await
    .unwrap();

    let sender = &outputs[0];
    assert_eq!(
        sender.sent_tags,
        vec![
            "mpc_tensor_0",
            "mpc_tensor_1",
            "mpc_tensor_2",
            "mpc_tensor_3",
            "mpc_obj_0"
        ]
    );
    let receiver = &outputs[1];
    assert_eq!(receiver.received_tags, sender.sent_tags);
}

#[tokio::test]
async fn sub_groups_isolate_counters() {
    let outputs = simulate(2, |mut comm| async move {
        let sub = comm.new_group(&[0, 1], "aux").unwrap();
        if comm.rank() == 0 {
            comm.send(&1u64, 1).await.unwrap();
            {
                let mut scoped = comm.scoped(sub);
                assert_eq!(scoped.active_group_name(), "aux");
                scoped.send(&2u64, 1).await.unwrap();
            }
            assert_eq!(comm.active_group_name(), "main");
            comm.send(&3u64, 1).await.unwrap();
        } else {
            assert_eq!(comm.recv::<u64>(0).await.unwrap(), 1);
            {
                let mut scoped = comm.scoped(sub);
                assert_eq!(scoped.recv::<u64>(0).await.unwrap(), 2);
            }
            assert_eq!(comm.recv::<u64>(0).await.unwrap(), 3);
        }
        comm.transport().stats()
    })
    .await
    .unwrap();

    assert_eq!(
        outputs[0].sent_tags,
        vec!["mpc_tensor_0", "mpc_tensor_aux_0", "mpc_tensor_1"]
    );
}

#[tokio::test]
async fn scoped_groups_nest_like_a_stack() {
    let outputs = simulate(3, |mut comm| async move {
        let inner = comm.new_group(&[0, 1], "inner").unwrap();
        let outer = comm.new_group(&[0, 2], "outer").unwrap();
        let mut o = comm.scoped(outer);
        assert_eq!(o.active_group_name(), "outer");
        {
            let i = o.scoped(inner);
            assert_eq!(i.active_group_name(), "inner");
        }
        o.active_group_name().to_string()
    })
    .await
    .unwrap();
    assert_eq!(outputs, vec!["outer", "outer", "outer"]);
}

#[tokio::test]
async fn degenerate_collectives_touch_no_transport() {
    let mut comm = single_party_comm();
    let gathered = comm.all_gather(7u64).await.unwrap();
    assert_eq!(gathered, vec![7]);
    let broadcast = comm.broadcast(Some(5u64), 0).await.unwrap();
    assert_eq!(broadcast, 5);
    let reduced = comm.reduce(3.5f64, 0, ReduceOp::Sum).await.unwrap();
    assert_eq!(reduced, Some(3.5));
    let all = comm.all_reduce(2.0f64, ReduceOp::Sum).await.unwrap();
    assert_eq!(all, 2.0);

    let stats = comm.transport().stats();
    assert_eq!(stats.rounds, 0);
    let counters = comm.counters();
    assert_eq!(counters.tensor_send + counters.tensor_recv, 0);
}

#[tokio::test]
async fn all_gather_is_rank_ordered() {
    let outputs = simulate(3, |mut comm| async move {
        comm.all_gather(comm.rank() as u64 * 10).await.unwrap()
    })
    .await
    .unwrap();
    for out in outputs {
        assert_eq!(out, vec![0, 10, 20]);
    }
}

#[tokio::test]
async fn reduce_sums_at_destination_only() {
    let outputs = simulate(3, |mut comm| async move {
        let m = IntMatrix::from_vec(1, 2, vec![comm.rank() as i128, 1]);
        comm.reduce(m, 1, ReduceOp::Sum).await.unwrap()
    })
    .await
    .unwrap();
    assert!(outputs[0].is_none());
    assert!(outputs[2].is_none());
    let at_dst = outputs[1].as_ref().unwrap();
    assert_eq!(at_dst.data(), &[3, 3]);
}

#[tokio::test]
async fn broadcast_reaches_all_followers() {
    let outputs = simulate(3, |mut comm| async move {
        let value = (comm.rank() == 2).then(|| "payload".to_string());
        comm.broadcast(value, 2).await.unwrap()
    })
    .await
    .unwrap();
    assert_eq!(outputs, vec!["payload", "payload", "payload"]);
}

#[tokio::test]
async fn xor_reduce_rejected_for_floats() {
    let outputs = simulate(2, |mut comm| async move {
        comm.all_reduce(1.0f64, ReduceOp::Xor).await
    })
    .await
    .unwrap();
    assert!(outputs
        .iter()
        .all(|r| matches!(r, Err(ChannelError::Unsupported { .. }))));
}

#[test]
fn scatter_and_gather_report_not_implemented() {
    let mut comm = single_party_comm();
    assert!(matches!(
        comm.scatter(vec![1u64], 0),
        Err(ChannelError::NotImplemented("scatter"))
    ));
    assert!(matches!(
        comm.gather(1u64, 0),
        Err(ChannelError::NotImplemented("gather"))
    ));
}

#[tokio::test]
async fn mismatched_kind_desynchronizes_fatally() {
    let outputs = simulate(2, |mut comm| async move {
        if comm.rank() == 0 {
            // Object send against the peer's tensor receive.
            comm.send_obj(&1u64, 1).await.map(|_| None)
        } else {
            match comm.recv::<u64>(0).await {
                Ok(_) => Ok(None),
                Err(e) => Ok(Some(e)),
            }
        }
    })
    .await
    .unwrap();
    let err = outputs[1].as_ref().unwrap().as_ref().unwrap();
    match err {
        ChannelError::Recv { reason, .. } => assert!(reason.contains("Desynchronized")),
        other => panic!("expected a receive failure, got {other:?}"),
    }
}

#[tokio::test]
async fn isend_irecv_consume_indices_eagerly() {
    let outputs = simulate(2, |mut comm| async move {
        if comm.rank() == 0 {
            let fut = comm.isend(&41u64, 1);
            fut.await.unwrap();
            comm.send(&42u64, 1).await.unwrap();
        } else {
            let first = comm.irecv::<u64>(0);
            let v = first.await.unwrap();
            assert_eq!(v, 41);
            assert_eq!(comm.recv::<u64>(0).await.unwrap(), 42);
        }
        comm.counters()
    })
    .await
    .unwrap();
    assert_eq!(outputs[0].tensor_send, 2);
    assert_eq!(outputs[1].tensor_recv, 2);
}

#[tokio::test]
async fn transport_reports_missing_route() {
    let transport = LocalTransport::channels(2).remove(0);
    let err = transport.put(5, "tag", vec![1]).await.unwrap_err();
    assert!(matches!(err, LocalTransportError::NoRoute { .. }));
}
