use rocket::http::Status;

use crate::common::{ALICE_KEY, create_conversation, create_project, open_session, test_client};

#[test]
fn test_health() {
    let client = test_client();
    let res = client.get("/health").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["name"], "agorai");
    assert!(body["version"].as_str().is_some());
    // The seeded default project is always there
    assert!(body["projects"].as_i64().unwrap() >= 1);
}

#[test]
fn test_health_counts_reflect_activity() {
    let client = test_client();
    let sid = open_session(&client, ALICE_KEY);
    let project_id = create_project(&client, ALICE_KEY, &sid, "count-check");
    create_conversation(&client, ALICE_KEY, &sid, &project_id, "first");

    let res = client.get("/health").dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert!(body["agents"].as_i64().unwrap() >= 1);
    assert!(body["projects"].as_i64().unwrap() >= 2);
    assert!(body["conversations"].as_i64().unwrap() >= 1);
    assert!(body["sessions"].as_i64().unwrap() >= 1);
}

#[test]
fn test_unknown_path_is_json_404() {
    let client = test_client();
    let res = client.get("/api/nope").dispatch();
    assert_eq!(res.status(), Status::NotFound);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["error"], "Not found");
}
