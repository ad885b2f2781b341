//! Property tests for the SwitchState invariants: endpoint uniqueness,
//! conflict exclusion, group accounting, and pipeline idempotence under
//! arbitrary interleavings of configuration and port churn.

use std::collections::BTreeSet;

use proptest::prelude::*;
use slicerd_core::{CircuitRequest, Endpoint, SwitchState};
use slicerd_openflow::Message;

#[derive(Debug, Clone)]
enum Op {
    CreateSlice(Vec<Endpoint>),
    Discard(Endpoint),
    PortDown(u32),
    PortUp(u32),
}

fn endpoint_strategy() -> impl Strategy<Value = Endpoint> {
    prop_oneof![
        (1u32..6).prop_map(Endpoint::Port),
        ((1u32..6), (100u16..103)).prop_map(|(p, v)| Endpoint::Tagged(p, v)),
        ((1u32..6), (100u16..103), (200u16..202))
            .prop_map(|(p, v, i)| Endpoint::DoubleTagged(p, v, i)),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => proptest::collection::vec(endpoint_strategy(), 1..5).prop_map(Op::CreateSlice),
        1 => endpoint_strategy().prop_map(Op::Discard),
        1 => (1u32..6).prop_map(Op::PortDown),
        1 => (1u32..6).prop_map(Op::PortUp),
    ]
}

fn check_invariants(sw: &SwitchState) {
    // Endpoint uniqueness and index consistency: every endpoint is in
    // exactly one target, and the index agrees.
    let mut seen = BTreeSet::new();
    for (sid, slice) in sw.slices() {
        for ep in slice.target() {
            assert!(seen.insert(*ep), "{ep} targeted by more than one slice");
            assert_eq!(sw.slice_of(ep), Some(sid), "index out of sync for {ep}");
        }
    }

    // Conflict exclusion across the whole switch.
    for a in &seen {
        for b in &seen {
            if a != b {
                assert!(!a.conflicts_with(b), "{a} and {b} conflict across slices");
            }
        }
    }

    // Group accounting: multi-endpoint slices hold exactly one group per
    // established endpoint, everything else holds none, and ids are unique.
    let mut expected_groups = 0;
    let mut ids = BTreeSet::new();
    for (_, slice) in sw.slices() {
        let multi = slice.established().len() >= 3;
        for ep in slice.established() {
            match sw.group_of(ep) {
                Some(id) => {
                    assert!(multi, "{ep} holds a group in a small slice");
                    assert!(ids.insert(id), "group id {id} allocated twice");
                    expected_groups += 1;
                }
                None => assert!(!multi, "{ep} missing its group in a multi slice"),
            }
        }
    }
    assert_eq!(sw.groups_held(), expected_groups, "leaked or lost group ids");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn invariants_hold_under_churn(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let mut sw = SwitchState::new(0x1);
        let mut out: Vec<Message> = Vec::new();
        sw.attach(1u32..6, &mut out);

        for op in ops {
            match op {
                Op::CreateSlice(endpoints) => {
                    let circuits: Vec<CircuitRequest> =
                        endpoints.into_iter().map(CircuitRequest::new).collect();
                    // Intra-request conflicts are valid rejections; state
                    // must be untouched either way.
                    let _ = sw.create_slice(&circuits);
                }
                Op::Discard(ep) => sw.discard_endpoint(&ep),
                Op::PortDown(p) => sw.port_removed(p),
                Op::PortUp(p) => sw.port_added(p),
            }
            let mut out: Vec<Message> = Vec::new();
            sw.revalidate(&mut out);
            check_invariants(&sw);

            // Pipeline idempotence: a second sweep emits nothing.
            let mut again: Vec<Message> = Vec::new();
            sw.revalidate(&mut again);
            prop_assert_eq!(again, Vec::new());
        }
    }
}
