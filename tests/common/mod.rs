#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use fleetguard::clock::ManualClock;
use fleetguard::coordinator::CoordinatorConfig;
use fleetguard::http::{Body, BoxError, HttpService, full_body};
use fleetguard::store::{LocalStore, SharedStore};
use fleetguard::Coordinator;
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;

pub fn manual_clock() -> ManualClock {
    ManualClock::starting_now()
}

/// A remote every replica in a test shares, standing in for Redis.
pub fn shared_remote(clock: &ManualClock) -> Arc<LocalStore> {
    Arc::new(LocalStore::new(clock.shared()))
}

/// One replica's view of the shared remote, with its own local fallback.
pub fn replica_store(remote: &Arc<LocalStore>, clock: &ManualClock) -> SharedStore {
    SharedStore::distributed(remote.clone(), LocalStore::new(clock.shared()))
}

pub fn replica(remote: &Arc<LocalStore>, clock: &ManualClock, id: &str) -> Coordinator {
    Coordinator::new(
        replica_store(remote, clock),
        clock.shared(),
        CoordinatorConfig {
            instance_id: Some(id.to_string()),
            instance_ttl: Duration::from_secs(60),
            ..Default::default()
        },
    )
}

/// Upstream that answers every request with `status`, counting calls.
pub fn upstream(status: StatusCode, calls: Arc<AtomicUsize>) -> HttpService {
    HttpService::new(tower::service_fn(move |_req: Request<Body>| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            let mut resp = Response::new(full_body("upstream"));
            *resp.status_mut() = status;
            Ok::<_, BoxError>(resp)
        }
    }))
}

pub fn request_as(user: &str) -> Request<Body> {
    Request::builder()
        .uri("/")
        .header("x-user-id", user)
        .body(fleetguard::http::empty_body())
        .unwrap()
}

/// A request with no identifying headers, as the server sees it from `peer`.
pub fn request_from(peer: &str) -> Request<Body> {
    let mut req = Request::builder()
        .uri("/")
        .body(fleetguard::http::empty_body())
        .unwrap();
    req.extensions_mut()
        .insert(fleetguard::ClientAddr(peer.parse().unwrap()));
    req
}

pub async fn json_body(resp: Response<Body>) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
