/// Dispatch Pipeline Integration Tests
///
/// These run the whole service in process, on in-memory backends:
/// - Direct intake through automatic matching
/// - Manual fallback when nobody is nearby
/// - Volunteer verification and login
/// - Manual acceptance, including contended accepts
use async_trait::async_trait;
use serde_json::{Value, json};
use sos_dispatch::config::Settings;
use sos_dispatch::event_bus::MessageHandler;
use sos_dispatch::{Backends, Service};
use sos_protocol::{
    Availability, Category, ChatSessionEstablished, Coordinates, HelpRequest, Party,
    RequestStatus, SystemNotifications, Volunteer,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const NEAR: Coordinates = Coordinates {
    lat: -1.2921,
    lng: 36.8219,
};
const FAR: Coordinates = Coordinates {
    lat: 10.0,
    lng: 10.0,
};

/// Test helper: Start the service and serve its router on an ephemeral port
async fn start() -> Result<(Service, SocketAddr), Box<dyn std::error::Error>> {
    let settings = Settings::default();
    let backends = Backends::in_memory(&settings);
    let service = Service::start(settings, backends).await?;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let router = service.router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    Ok((service, addr))
}

/// Forwards chat room announcements to the test body
struct Forward(mpsc::UnboundedSender<ChatSessionEstablished>);

#[async_trait]
impl MessageHandler<ChatSessionEstablished> for Forward {
    async fn handle(&self, payload: ChatSessionEstablished) -> anyhow::Result<()> {
        self.0.send(payload)?;
        Ok(())
    }
}

fn volunteer(code: &str, skills: Vec<Category>, at: Coordinates, verified: bool) -> Volunteer {
    Volunteer {
        volunteer_id: Uuid::new_v4(),
        name: format!("Volunteer {code}"),
        phone_number: "+254700000000".to_string(),
        skills,
        verification_code: Some(code.to_string()),
        is_verified: verified,
        status: if verified {
            Availability::Available
        } else {
            Availability::Offline
        },
        current_location: Some(at),
        last_assigned_request_id: None,
        status_updated_at: None,
    }
}

/// Test helper: Submit a direct request over HTTP and return its id
async fn submit(addr: SocketAddr, category: &str, at: Coordinates) -> Result<Uuid, Box<dyn std::error::Error>> {
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/v1/request/direct"))
        .json(&json!({
            "category": category,
            "coordinates": {"lat": at.lat, "lng": at.lng},
            "location_text": "Near the main market",
            "description": "Someone collapsed and needs first aid",
        }))
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 202);

    let body: Value = response.json().await?;
    assert_eq!(body["success"], true);
    Ok(body["request_id"].as_str().ok_or("missing request_id")?.parse()?)
}

/// Test helper: Poll the request until it reaches `status`
async fn wait_for_status(service: &Service, request_id: Uuid, status: RequestStatus) -> HelpRequest {
    for _ in 0..200 {
        if let Ok(Some(request)) = service.state().records.get_request(request_id).await {
            if request.status == status {
                return request;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("request {request_id} never reached {status}");
}

/// Test helper: Verify a code and return (volunteer_id, session token)
async fn login(addr: SocketAddr, code: &str) -> Result<(Uuid, String), Box<dyn std::error::Error>> {
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/v1/volunteer/verify"))
        .json(&json!({"verification_code": code}))
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 200);

    let body: Value = response.json().await?;
    let volunteer_id = body["volunteer_id"].as_str().ok_or("missing volunteer_id")?.parse()?;
    let token = body["session_token"].as_str().ok_or("missing token")?.to_string();
    Ok((volunteer_id, token))
}

async fn accept(addr: SocketAddr, request_id: Uuid, token: Option<&str>) -> reqwest::Result<reqwest::Response> {
    let mut builder =
        reqwest::Client::new().post(format!("http://{addr}/api/v1/requests/{request_id}/accept"));
    if let Some(token) = token {
        builder = builder.bearer_auth(token);
    }
    builder.send().await
}

#[tokio::test]
async fn test_health_check() -> TestResult {
    let (service, addr) = start().await?;

    let body: Value = reqwest::get(format!("http://{addr}/api")).await?.json().await?;
    assert_eq!(body["status"], "ok");

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_direct_request_is_matched_to_nearest_volunteer() -> TestResult {
    let (service, addr) = start().await?;
    let records = &service.state().records;

    // v1 is closest but lacks the skill, v2 is the nearest qualified volunteer
    let v1 = volunteer("LEG001", vec![Category::Legal], NEAR, true);
    let v2 = volunteer(
        "MED002",
        vec![Category::Medical],
        Coordinates::new(NEAR.lat + 0.01, NEAR.lng),
        true,
    );
    let v3 = volunteer(
        "MED003",
        vec![Category::Medical],
        Coordinates::new(NEAR.lat + 0.02, NEAR.lng),
        true,
    );
    for v in [&v1, &v2, &v3] {
        records.insert_volunteer(v).await?;
    }

    let request_id = submit(addr, "Medical", NEAR).await?;
    let request = wait_for_status(&service, request_id, RequestStatus::Assigned).await;

    assert_eq!(request.assigned_volunteer_id, Some(v2.volunteer_id));
    assert!(request.assignment_id.is_some());

    let v2 = records.get_volunteer(v2.volunteer_id).await?.ok_or("v2 vanished")?;
    assert_eq!(v2.status, Availability::Busy);
    assert_eq!(v2.last_assigned_request_id, Some(request_id));

    let v3 = records.get_volunteer(v3.volunteer_id).await?.ok_or("v3 vanished")?;
    assert_eq!(v3.status, Availability::Available);

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_request_without_candidates_falls_back_to_manual() -> TestResult {
    let (service, addr) = start().await?;
    service
        .state()
        .records
        .insert_volunteer(&volunteer("MED001", vec![Category::Medical], FAR, true))
        .await?;

    let request_id = submit(addr, "Medical", NEAR).await?;
    let request =
        wait_for_status(&service, request_id, RequestStatus::PendingManualAssignment).await;
    assert!(request.assigned_volunteer_id.is_none());

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_invalid_direct_request_is_rejected() -> TestResult {
    let (service, addr) = start().await?;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/v1/request/direct"))
        .json(&json!({
            "category": "Medical",
            "coordinates": {"lat": 95.0, "lng": 36.8},
            "description": "Someone collapsed and needs first aid",
        }))
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await?;
    assert_eq!(body["success"], false);

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/v1/request/direct"))
        .json(&json!({
            "category": "Medical",
            "coordinates": {"lat": NEAR.lat, "lng": NEAR.lng},
            "description": "help",
        }))
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 400);

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_verification_flow() -> TestResult {
    let (service, addr) = start().await?;
    let records = &service.state().records;
    let v = volunteer("MED001", vec![Category::Medical], FAR, false);
    records.insert_volunteer(&v).await?;

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/api/v1/volunteer/verify");

    // Unknown code
    let response = client
        .post(&url)
        .json(&json!({"verification_code": "NOPE99"}))
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 400);

    // First verification, code is normalized before lookup
    let response = client
        .post(&url)
        .json(&json!({"verification_code": "  med001 "}))
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await?;
    assert_eq!(body["message"], "Verification successful.");
    assert_eq!(body["volunteer_id"], v.volunteer_id.to_string());
    let first_token = body["session_token"].as_str().ok_or("missing token")?.to_string();

    let stored = records.get_volunteer(v.volunteer_id).await?.ok_or("volunteer vanished")?;
    assert!(stored.is_verified);
    assert_eq!(stored.status, Availability::Available);

    // Second verification logs in again and revokes the first token
    let response = client
        .post(&url)
        .json(&json!({"verification_code": "MED001"}))
        .send()
        .await?;
    let body: Value = response.json().await?;
    assert_eq!(body["message"], "Volunteer already verified.");
    let second_token = body["session_token"].as_str().ok_or("missing token")?;

    let logins = &service.state().logins;
    assert_eq!(logins.resolve(&first_token).await?, None);
    assert_eq!(logins.resolve(second_token).await?, Some(v.volunteer_id));

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_accept_requires_login() -> TestResult {
    let (service, addr) = start().await?;
    let request_id = submit(addr, "Medical", NEAR).await?;
    wait_for_status(&service, request_id, RequestStatus::PendingManualAssignment).await;

    let response = accept(addr, request_id, None).await?;
    assert_eq!(response.status().as_u16(), 401);
    let body: Value = response.json().await?;
    assert_eq!(body["success"], false);

    let response = accept(addr, request_id, Some("not-a-real-token")).await?;
    assert_eq!(response.status().as_u16(), 401);

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_manual_accept() -> TestResult {
    let (service, addr) = start().await?;
    let v = volunteer("MED001", vec![Category::Medical], FAR, false);
    service.state().records.insert_volunteer(&v).await?;

    let request_id = submit(addr, "Medical", NEAR).await?;
    wait_for_status(&service, request_id, RequestStatus::PendingManualAssignment).await;

    let (volunteer_id, token) = login(addr, "MED001").await?;
    assert_eq!(volunteer_id, v.volunteer_id);

    let response = accept(addr, request_id, Some(&token)).await?;
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await?;
    assert_eq!(body["success"], true);
    assert_eq!(body["volunteer_id"], v.volunteer_id.to_string());

    let request = wait_for_status(&service, request_id, RequestStatus::Assigned).await;
    assert_eq!(request.assigned_volunteer_id, Some(v.volunteer_id));
    assert_eq!(
        request.assignment_id.map(|id| id.to_string()),
        body["assignment_id"].as_str().map(str::to_string)
    );

    // A second accept of the same request is refused
    let response = accept(addr, request_id, Some(&token)).await?;
    assert_eq!(response.status().as_u16(), 409);

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_accepts_have_one_winner() -> TestResult {
    let (service, addr) = start().await?;
    let records = &service.state().records;
    records
        .insert_volunteer(&volunteer("MED001", vec![Category::Medical], FAR, true))
        .await?;
    records
        .insert_volunteer(&volunteer("MED002", vec![Category::Medical], FAR, true))
        .await?;

    let request_id = submit(addr, "Medical", NEAR).await?;
    wait_for_status(&service, request_id, RequestStatus::PendingManualAssignment).await;

    let (first_id, first) = login(addr, "MED001").await?;
    let (second_id, second) = login(addr, "MED002").await?;

    let (a, b) = tokio::join!(
        accept(addr, request_id, Some(&first)),
        accept(addr, request_id, Some(&second))
    );
    let mut codes = vec![a?.status().as_u16(), b?.status().as_u16()];
    codes.sort();
    assert_eq!(codes, vec![200, 409]);

    let request = wait_for_status(&service, request_id, RequestStatus::Assigned).await;
    let winner = request.assigned_volunteer_id.ok_or("no winner recorded")?;
    let loser = if winner == first_id { second_id } else { first_id };

    let winner = records.get_volunteer(winner).await?.ok_or("winner vanished")?;
    assert_eq!(winner.status, Availability::Busy);
    let loser = records.get_volunteer(loser).await?.ok_or("loser vanished")?;
    assert_eq!(loser.status, Availability::Available);
    assert!(loser.last_assigned_request_id.is_none());

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_assignment_opens_chat_session() -> TestResult {
    let (service, addr) = start().await?;
    let v = volunteer("MED001", vec![Category::Medical], NEAR, true);
    service.state().records.insert_volunteer(&v).await?;

    let (tx, mut notifications) = mpsc::unbounded_channel();
    service
        .state()
        .bus
        .subscribe::<SystemNotifications, _>(Arc::new(Forward(tx)))
        .await?;

    let request_id = submit(addr, "Medical", NEAR).await?;
    let request = wait_for_status(&service, request_id, RequestStatus::Assigned).await;

    let established = timeout(Duration::from_secs(5), notifications.recv())
        .await?
        .ok_or("notification channel closed")?;
    assert_eq!(Some(established.assignment_id), request.assignment_id);
    assert_eq!(established.request_id, request_id);
    assert_eq!(established.volunteer_id, v.volunteer_id);

    let chat = &service.state().chat;
    let session = chat
        .session(established.chat_room_id)
        .await?
        .ok_or("chat session not stored")?;
    assert_eq!(session.requester_token, established.requester_token);
    assert_eq!(
        chat.authorize(established.chat_room_id, &established.volunteer_token)
            .await,
        Some(Party::Volunteer)
    );
    assert_eq!(chat.authorize(established.chat_room_id, "forged").await, None);

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_map_hotspots_list_open_requests_coarsely() -> TestResult {
    let (service, addr) = start().await?;
    let v = volunteer("MED001", vec![Category::Medical], NEAR, true);
    service.state().records.insert_volunteer(&v).await?;

    // The only volunteer is taken by the first request, the second waits
    let assigned = submit(addr, "Medical", NEAR).await?;
    wait_for_status(&service, assigned, RequestStatus::Assigned).await;
    let open = submit(addr, "Medical", NEAR).await?;
    wait_for_status(&service, open, RequestStatus::PendingManualAssignment).await;

    let hotspots: Vec<Value> = reqwest::get(format!("http://{addr}/api/v1/map/hotspots"))
        .await?
        .json()
        .await?;
    assert_eq!(hotspots.len(), 1);

    let hotspot = &hotspots[0];
    assert_eq!(hotspot["id"], open.to_string());
    assert_eq!(hotspot["request_type"], "Medical");
    assert_eq!(hotspot["coordinates"]["lat"], -1.29);
    assert_eq!(hotspot["coordinates"]["lng"], 36.82);
    assert!(hotspot["timestamp"].is_string());
    assert!(hotspot.get("description").is_none());
    assert!(hotspot.get("location_text").is_none());

    let limited: Vec<Value> = reqwest::get(format!("http://{addr}/api/v1/map/hotspots?limit=0"))
        .await?
        .json()
        .await?;
    assert_eq!(limited.len(), 1);

    service.shutdown().await;
    Ok(())
}
