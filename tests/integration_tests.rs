//! Integration tests using wiremock to simulate the upstream API.

use chirpwire::models::Status;
use chirpwire::stream::{StreamEnd, StreamEvent, StreamLimits};
use chirpwire::transport::AttemptOutcome;
use chirpwire::{
    BearerToken, CachePolicy, Client, Error, Format, Query, RateLimitStatus, RateLimitingRule,
    RetryOn, RetryPolicy,
};
use futures::StreamExt;
use std::time::Duration;
use std::sync::Arc;
use wiremock::matchers::{body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const OUTAGE_PAGE: &str = "<html><body>Twitter is over capacity.</body></html>";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn client(server: &MockServer) -> Client {
    init_tracing();
    Client::builder()
        .base_url(format!("{}/1/", server.uri()))
        .unwrap()
        .build()
        .unwrap()
}

fn json(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "application/json")
}

#[tokio::test]
async fn test_successful_get_request() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/1/users/show.json"))
        .and(query_param("screen_name", "jack"))
        .respond_with(json(r#"{"id":12,"screen_name":"jack","followers_count":100}"#))
        .expect(1)
        .mount(&mock_server)
        .await;

    let response = client(&mock_server)
        .execute(&Query::get("users/show").param("screen_name", "jack"))
        .await
        .unwrap();

    assert!(response.is_success());
    assert!(!response.is_service_error);
    assert!(!response.is_from_cache);
    assert_eq!(response.retries, 0);
    let user = response.as_user().unwrap();
    assert_eq!(user.id, 12);
    assert_eq!(user.screen_name.as_deref(), Some("jack"));
}

#[tokio::test]
async fn test_post_sends_form_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/1/statuses/update.json"))
        .and(body_string("status=hello+world"))
        .respond_with(json(r#"{"id":99,"text":"hello world"}"#))
        .expect(1)
        .mount(&mock_server)
        .await;

    let response = client(&mock_server)
        .execute(&Query::post("statuses/update").param("status", "hello world"))
        .await
        .unwrap();

    assert_eq!(response.as_status().map(|s| s.id), Some(99));
}

#[tokio::test]
async fn test_outage_page_is_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/1/statuses/home_timeline.json"))
        .respond_with(
            ResponseTemplate::new(503).set_body_raw(OUTAGE_PAGE.as_bytes().to_vec(), "text/html"),
        )
        .expect(3)
        .mount(&mock_server)
        .await;

    let response = client(&mock_server)
        .execute(&Query::get("statuses/home_timeline").retry_on(RetryOn::OUTAGE_PAGE, 3))
        .await
        .unwrap();

    assert!(response.is_outage_page);
    assert!(response.is_service_error);
    assert!(!response.is_network_error);
    assert_eq!(response.retries, 2);
    assert!(response.as_statuses().is_none());
    assert!(response.as_error().is_none());
    assert_eq!(response.body, OUTAGE_PAGE);
}

#[tokio::test]
async fn test_outage_recovers_on_retry() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/1/statuses/home_timeline.json"))
        .respond_with(
            ResponseTemplate::new(502).set_body_raw(OUTAGE_PAGE.as_bytes().to_vec(), "text/html"),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/1/statuses/home_timeline.json"))
        .respond_with(json(r#"[{"id":1,"text":"a"},{"id":2,"text":"b"}]"#))
        .expect(1)
        .mount(&mock_server)
        .await;

    let response = client(&mock_server)
        .execute(&Query::get("statuses/home_timeline").retry_on(RetryOn::OUTAGE_PAGE_OR_NETWORK, 5))
        .await
        .unwrap();

    assert!(!response.is_outage_page);
    assert_eq!(response.retries, 1);
    assert_eq!(response.as_statuses().map(|s| s.len()), Some(2));
}

#[tokio::test]
async fn test_custom_predicate_uses_full_budget() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/1/users/show.json"))
        .respond_with(json(r#"{"id":1}"#))
        .expect(3)
        .mount(&mock_server)
        .await;

    let policy = RetryPolicy::new(RetryOn::NEVER, 3).or(|_: &AttemptOutcome| true);
    let response = client(&mock_server)
        .execute(&Query::get("users/show").retry(policy))
        .await
        .unwrap();

    assert_eq!(response.retries, 2);
    assert_eq!(response.as_user().map(|u| u.id), Some(1));
}

#[tokio::test]
async fn test_error_inside_success_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/1/users/show.json"))
        .respond_with(json(r#"{"errors":[{"message":"Rate limit exceeded","code":88}]}"#))
        .expect(1)
        .mount(&mock_server)
        .await;

    let response = client(&mock_server)
        .execute(&Query::get("users/show"))
        .await
        .unwrap();

    assert_eq!(response.status.map(|s| s.as_u16()), Some(200));
    assert!(response.is_service_error);
    assert!(!response.is_outage_page);
    assert!(!response.is_success());
    assert!(response.as_user().is_none());

    let error = response.as_error().unwrap();
    assert_eq!(error.code, Some(88));
    assert_eq!(error.message.as_deref(), Some("Rate limit exceeded"));
}

#[tokio::test]
async fn test_legacy_error_schema() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/1/direct_messages.json"))
        .respond_with(
            ResponseTemplate::new(401).set_body_raw(
                br#"{"error":"Could not authenticate you.","request":"/1/direct_messages.json"}"#
                    .to_vec(),
                "application/json",
            ),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let response = client(&mock_server)
        .execute(&Query::get("direct_messages"))
        .await
        .unwrap();

    assert!(response.is_service_error);
    assert!(response.as_direct_messages().is_none());
    let error = response.as_error().unwrap();
    assert_eq!(error.message.as_deref(), Some("Could not authenticate you."));
    assert_eq!(error.request.as_deref(), Some("/1/direct_messages.json"));
}

#[tokio::test]
async fn test_xml_error_inside_success_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/1/statuses/show/1.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            concat!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
                "<hash>\n",
                "  <request>/1/statuses/show/1.xml</request>\n",
                "  <error>No status found with that ID.</error>\n",
                "</hash>\n",
            )
            .as_bytes()
            .to_vec(),
            "application/xml",
        ))
        .expect(1)
        .mount(&mock_server)
        .await;

    let response = client(&mock_server)
        .execute(&Query::get("statuses/show/1").format(Format::Xml))
        .await
        .unwrap();

    assert!(response.is_service_error);
    assert!(!response.is_success());
    assert!(response.as_status().is_none());
    let error = response.as_error().unwrap();
    assert_eq!(error.message.as_deref(), Some("No status found with that ID."));
    assert_eq!(error.request.as_deref(), Some("/1/statuses/show/1.xml"));
}

#[tokio::test]
async fn test_xml_collection_is_decoded() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/1/statuses/user_timeline.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            concat!(
                "<statuses type=\"array\">",
                "<status><id>20</id><text>just setting up</text>",
                "<user><id>12</id><screen_name>jack</screen_name></user></status>",
                "</statuses>",
            )
            .as_bytes()
            .to_vec(),
            "application/xml",
        ))
        .mount(&mock_server)
        .await;

    let response = client(&mock_server)
        .execute(&Query::get("statuses/user_timeline").format(Format::Xml))
        .await
        .unwrap();

    assert!(response.is_success());
    let statuses = response.as_statuses().unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].text.as_deref(), Some("just setting up"));
    assert_eq!(
        statuses[0].user.as_ref().and_then(|u| u.screen_name.as_deref()),
        Some("jack")
    );
}

#[tokio::test]
async fn test_cached_responses_are_per_credential() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/1/account/verify_credentials.json"))
        .and(header("authorization", "Bearer alice"))
        .respond_with(json(r#"{"id":1,"screen_name":"alice"}"#))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/1/account/verify_credentials.json"))
        .and(header("authorization", "Bearer bob"))
        .respond_with(json(r#"{"id":2,"screen_name":"bob"}"#))
        .expect(1)
        .mount(&mock_server)
        .await;

    init_tracing();
    let client = Client::builder()
        .base_url(format!("{}/1/", mock_server.uri()))
        .unwrap()
        .response_cache(16)
        .build()
        .unwrap();

    let query = |token: &str| {
        Query::get("account/verify_credentials")
            .credentials(Arc::new(BearerToken::new(token)))
            .cache(CachePolicy::sliding(Duration::from_secs(60)))
    };

    let alice = client.execute(&query("alice")).await.unwrap();
    let bob = client.execute(&query("bob")).await.unwrap();
    let alice_again = client.execute(&query("alice")).await.unwrap();

    assert_eq!(alice.as_user().map(|u| u.id), Some(1));
    assert_eq!(bob.as_user().map(|u| u.id), Some(2));
    assert!(!bob.is_from_cache);
    assert_eq!(alice_again.as_user().map(|u| u.id), Some(1));
    assert!(alice_again.is_from_cache);
}

#[tokio::test]
async fn test_wrapped_and_bare_collections() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/1/lists.json"))
        .respond_with(json(concat!(
            r#"{"lists":[{"id":1,"name":"rustaceans"},{"id":2,"name":"friends"}],"#,
            r#""next_cursor":1234,"previous_cursor":0}"#,
        )))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/1/lists/all.json"))
        .respond_with(json(r#"[{"id":3,"name":"all"}]"#))
        .mount(&mock_server)
        .await;

    let client = client(&mock_server);

    let wrapped = client.execute(&Query::get("lists")).await.unwrap();
    let page = wrapped.as_cursored::<chirpwire::models::List>("lists").unwrap();
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.next_cursor, Some(1234));
    assert!(page.has_next());

    let bare = client.execute(&Query::get("lists/all")).await.unwrap();
    let lists = bare.as_lists().unwrap();
    assert_eq!(lists.len(), 1);
    assert_eq!(lists[0].name.as_deref(), Some("all"));
    assert_eq!(bare.next_cursor(), None);
}

#[tokio::test]
async fn test_trends_are_flattened() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/1/trends/daily.json"))
        .respond_with(json(concat!(
            r##"{"trends":{"2010-05-14 16:00":[{"name":"#rust","query":"#rust"}],"##,
            r#""2010-05-14 17:00":[{"name":"Lakers","query":"Lakers"}]},"#,
            r#""as_of":1273855566}"#,
        )))
        .mount(&mock_server)
        .await;

    let response = client(&mock_server)
        .execute(&Query::get("trends/daily"))
        .await
        .unwrap();

    let trends = response.as_trends().unwrap();
    assert_eq!(trends.trends.len(), 2);
    assert!(trends.as_of.is_some());
    assert!(trends.trends.iter().all(|t| t.timestamp.is_some()));
}

#[tokio::test]
async fn test_rate_limited_query_is_never_sent() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(json("[]"))
        .expect(0)
        .mount(&mock_server)
        .await;

    let rule = RateLimitingRule::percentage(10.0).with_status_getter(|| {
        Some(RateLimitStatus {
            remaining_hits: 10,
            hourly_limit: 150,
            reset_time_in_seconds: None,
            reset_time: None,
        })
    });

    let response = client(&mock_server)
        .execute(&Query::get("statuses/home_timeline").rate_limit(rule))
        .await
        .unwrap();

    assert!(response.is_rate_limited);
    assert!(!response.is_service_error);
    assert!(response.body.is_empty());
    assert_eq!(response.rate_limit_status.map(|s| s.remaining_hits), Some(10));
}

#[tokio::test]
async fn test_rate_limit_status_from_endpoint() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/1/account/rate_limit_status.json"))
        .respond_with(json(
            r#"{"remaining_hits":140,"hourly_limit":150,"reset_time_in_seconds":1273859166}"#,
        ))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/1/statuses/home_timeline.json"))
        .respond_with(json("[]"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let response = client(&mock_server)
        .execute(
            &Query::get("statuses/home_timeline").rate_limit(RateLimitingRule::percentage(10.0)),
        )
        .await
        .unwrap();

    assert!(!response.is_rate_limited);
    assert_eq!(response.as_statuses(), Some(Vec::new()));
}

#[tokio::test]
async fn test_timeout_is_classified_and_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/1/users/show.json"))
        .respond_with(json(r#"{"id":1}"#).set_delay(Duration::from_millis(500)))
        .expect(2)
        .mount(&mock_server)
        .await;

    let response = client(&mock_server)
        .execute(
            &Query::get("users/show")
                .timeout(Duration::from_millis(100))
                .retry_on(RetryOn::TIMEOUT, 2),
        )
        .await
        .unwrap();

    assert!(response.timed_out);
    assert!(response.is_network_error);
    assert!(response.is_service_error);
    assert_eq!(response.retries, 1);
    assert!(response.as_user().is_none());
}

#[tokio::test]
async fn test_missing_action_is_an_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(json("{}"))
        .expect(0)
        .mount(&mock_server)
        .await;

    let result = client(&mock_server).execute(&Query::new()).await;
    match result {
        Err(Error::MissingAction) => {}
        other => panic!("Expected MissingAction, got {:?}", other.map(|r| r.status)),
    }
}

#[tokio::test]
async fn test_begin_execute_delivers_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/1/statuses/show.json"))
        .respond_with(json(r#"{"id":42,"text":"background"}"#))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    let handle = client(&mock_server)
        .begin_execute(Query::get("statuses/show").param("id", 42), move |response| {
            let _ = tx.send(response);
        })
        .unwrap();

    let response = rx.await.unwrap();
    assert_eq!(response.as_status().map(|s| s.id), Some(42));
    handle.join().await;
}

#[tokio::test]
async fn test_stream_skips_control_messages() {
    let mock_server = MockServer::start().await;

    let body = concat!(
        "{\"delete\":{\"status\":{\"id\":1,\"user_id\":3}}}\r\n",
        "{\"id\":2,\"text\":\"first\"}\r\n",
        "\r\n",
        "{\"id\":3,\"text\":\"second\"}\r\n",
    );
    Mock::given(method("GET"))
        .and(path("/1/statuses/sample.json"))
        .respond_with(json(body))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client(&mock_server);
    let mut feed = client
        .stream::<Status>(&Query::get("statuses/sample").streaming(), StreamLimits::unbounded())
        .unwrap();

    let mut items = Vec::new();
    let mut summary = None;
    while let Some(event) = feed.next().await {
        match event {
            StreamEvent::Item(status) => items.push(status.id),
            StreamEvent::Finished(end) => summary = Some(end),
        }
    }

    assert_eq!(items, vec![2, 3]);
    let summary = summary.unwrap();
    assert_eq!(summary.items, 2);
    assert_eq!(summary.end, StreamEnd::Disconnected);
    assert!(!summary.response.is_from_cache);
}

#[tokio::test]
async fn test_begin_stream_stops_at_item_limit() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/1/statuses/filter.json"))
        .respond_with(json("{\"id\":1}\n{\"id\":2}\n{\"id\":3}\n"))
        .mount(&mock_server)
        .await;

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = seen.clone();

    client(&mock_server)
        .begin_stream::<Status, _, _>(
            &Query::get("statuses/filter").param("track", "rust"),
            StreamLimits::unbounded().items(2),
            move |_| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            },
            move |summary| {
                let _ = done_tx.send(summary);
            },
        )
        .unwrap();

    let summary = done_rx.await.unwrap();
    assert_eq!(summary.end, StreamEnd::ItemLimit);
    assert_eq!(summary.items, 2);
    assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 2);
}
