//! Round-trip behaviour of the REST surface against a live controller.

use pretty_assertions::assert_eq;
use slicerd_controller::Controller;
use slicerd_rest::{Api, StatusCode, parse_dpid};

const DPID: u64 = 0x0000_0000_0000_00ab;

#[test]
fn dpid_segments_are_16_hex_digits() {
    assert_eq!(parse_dpid("00000000000000ab"), Some(0xab));
    assert_eq!(parse_dpid("00000000000000AB"), Some(0xab));
    assert_eq!(parse_dpid("ab"), None);
    assert_eq!(parse_dpid("00000000000000zz"), None);
    assert_eq!(parse_dpid("00000000000000ab0"), None);
}

#[tokio::test]
async fn get_of_unknown_switch_is_404() {
    let api = Api::new(Controller::new());
    let response = api.get_config(DPID).await;
    assert_eq!(response.status, StatusCode::NotFound);
}

#[tokio::test]
async fn posted_endpoints_all_reappear_in_get() {
    let api = Api::new(Controller::new());

    let response = api
        .apply(
            DPID,
            r#"{"slices": [[{"circuit": [1]}, {"circuit": [2]}, {"circuit": [3]}]]}"#,
        )
        .await;
    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.body, "[[[1],[2],[3]]]\n");

    let response = api.get_config(DPID).await;
    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.body, "[[[1],[2],[3]]]\n");
}

#[tokio::test]
async fn conflict_victims_are_absorbed_not_lost() {
    let api = Api::new(Controller::new());
    api.apply(
        DPID,
        r#"{"slices": [[{"circuit": [1]}, {"circuit": [2]}, {"circuit": [3]}]]}"#,
    )
    .await;

    // (1,100) steals port 1; the old slice keeps {2,3}; (1) is gone, which
    // is the one permitted difference from the posted partition.
    let response = api
        .apply(DPID, r#"{"slices": [[{"circuit": [1, 100]}, {"circuit": [4]}]]}"#)
        .await;
    assert_eq!(response.status, StatusCode::Ok);

    let config: Vec<Vec<Vec<u64>>> = serde_json::from_str(&response.body).unwrap();
    let all: Vec<Vec<u64>> = config.iter().flatten().cloned().collect();
    assert!(all.contains(&vec![1, 100]));
    assert!(all.contains(&vec![4]));
    assert!(all.contains(&vec![2]));
    assert!(all.contains(&vec![3]));
    assert!(!all.contains(&vec![1]));
}

#[tokio::test]
async fn bad_requests_leave_state_untouched() {
    let api = Api::new(Controller::new());
    api.apply(DPID, r#"{"slices": [[{"circuit": [1]}, {"circuit": [2]}]]}"#)
        .await;

    let response = api.apply(DPID, "{ not json").await;
    assert_eq!(response.status, StatusCode::BadRequest);

    // A conflicting set rejects atomically even alongside a valid one.
    let response = api
        .apply(
            DPID,
            r#"{"slices": [[{"circuit": [5]}, {"circuit": [6]}], [{"circuit": [7]}, {"circuit": [7, 1]}]]}"#,
        )
        .await;
    assert_eq!(response.status, StatusCode::BadRequest);

    let response = api.get_config(DPID).await;
    assert_eq!(response.body, "[[[1],[2]]]\n");
}

#[tokio::test]
async fn disused_abandons_endpoints() {
    let api = Api::new(Controller::new());
    api.apply(
        DPID,
        r#"{"slices": [[{"circuit": [1]}, {"circuit": [2]}, {"circuit": [3]}]]}"#,
    )
    .await;

    let response = api.apply(DPID, r#"{"disused": [[1]]}"#).await;
    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.body, "[[[2],[3]]]\n");
}
