// tests/telegram_mock.rs
//
// TelegramNotifier against an in-process Bot API stand-in served by axum.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde_json::{json, Value};

use collectible_notifier::ingest::types::EventClass;
use collectible_notifier::notify::telegram::TelegramNotifier;
use collectible_notifier::notify::{Notification, Notifier};
use collectible_notifier::subscriptions::ChannelRef;

#[derive(Clone, Default)]
struct BotApi {
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    /// Number of 429s to answer before accepting sendMessage.
    throttle: Arc<AtomicUsize>,
}

impl BotApi {
    fn log(&self, method: &str, body: &Value) {
        self.calls.lock().unwrap().push((method.to_string(), body.clone()));
    }

    fn methods(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
    }
}

fn forbidden(body: &Value) -> bool {
    body["chat_id"] == "-403"
}

async fn send_message(State(api): State<BotApi>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    api.log("sendMessage", &body);
    if forbidden(&body) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"ok": false, "description": "Forbidden: bot was kicked"})),
        );
    }
    let left = api.throttle.load(Ordering::SeqCst);
    if left > 0 {
        api.throttle.store(left - 1, Ordering::SeqCst);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"ok": false, "description": "Too Many Requests"})),
        );
    }
    (StatusCode::OK, Json(json!({"ok": true, "result": {"message_id": 7}})))
}

async fn send_photo(State(api): State<BotApi>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    api.log("sendPhoto", &body);
    (StatusCode::OK, Json(json!({"ok": true, "result": {"message_id": 8}})))
}

async fn set_reaction(State(api): State<BotApi>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    api.log("setMessageReaction", &body);
    (StatusCode::OK, Json(json!({"ok": true, "result": true})))
}

async fn serve(api: BotApi) -> SocketAddr {
    let app = Router::new()
        .route("/botTEST/sendMessage", post(send_message))
        .route("/botTEST/sendPhoto", post(send_photo))
        .route("/botTEST/setMessageReaction", post(set_reaction))
        .with_state(api);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn notifier(addr: SocketAddr) -> TelegramNotifier {
    TelegramNotifier::new("TEST".into())
        .with_api_base(&format!("http://{addr}/"))
        .with_timeout(5)
        .with_retries(3)
        .with_reaction("👍")
}

fn msg(image: Option<&str>) -> Notification {
    Notification {
        text: "*Sold:* Plush Pepe #42".into(),
        image_url: image.map(str::to_string),
        class: EventClass::Sale,
    }
}

#[tokio::test]
async fn text_message_then_reaction_in_thread() {
    let api = BotApi::default();
    let n = notifier(serve(api.clone()).await);

    let receipt = n.deliver(&ChannelRef("-1001/12".into()), &msg(None)).await.unwrap();
    assert_eq!(receipt.message_id, 7);
    n.acknowledge(&receipt).await.unwrap();

    assert_eq!(api.methods(), vec!["sendMessage", "setMessageReaction"]);
    let calls = api.calls.lock().unwrap();
    assert_eq!(calls[0].1["chat_id"], "-1001");
    assert_eq!(calls[0].1["message_thread_id"], 12);
    assert_eq!(calls[1].1["message_id"], 7);
    assert_eq!(calls[1].1["reaction"][0]["emoji"], "👍");
}

#[tokio::test]
async fn image_goes_through_send_photo() {
    let api = BotApi::default();
    let n = notifier(serve(api.clone()).await);

    let receipt = n
        .deliver(&ChannelRef("-1001".into()), &msg(Some("https://img.test/42.png")))
        .await
        .unwrap();
    assert_eq!(receipt.message_id, 8);

    let calls = api.calls.lock().unwrap();
    assert_eq!(calls[0].0, "sendPhoto");
    assert_eq!(calls[0].1["photo"], "https://img.test/42.png");
    assert!(calls[0].1.get("message_thread_id").is_none());
}

#[tokio::test]
async fn rate_limit_is_retried() {
    let api = BotApi::default();
    api.throttle.store(1, Ordering::SeqCst);
    let n = notifier(serve(api.clone()).await);

    let receipt = n.deliver(&ChannelRef("-1001".into()), &msg(None)).await.unwrap();
    assert_eq!(receipt.message_id, 7);
    assert_eq!(api.methods(), vec!["sendMessage", "sendMessage"]);
}

#[tokio::test]
async fn forbidden_is_not_retried() {
    let api = BotApi::default();
    let n = notifier(serve(api.clone()).await);

    let err = n.deliver(&ChannelRef("-403".into()), &msg(None)).await.unwrap_err();
    assert!(err.to_string().contains("403"), "{err}");
    assert_eq!(api.methods().len(), 1);
}
