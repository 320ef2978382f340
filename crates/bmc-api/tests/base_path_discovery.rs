use axum::{routing::get, Router};
use bmc_api::{ApiClient, DEFAULT_BASE_PATH};
use tokio::task::JoinHandle;

async fn launch_console(paths_body: &'static str) -> (String, JoinHandle<()>) {
    let app = Router::new().route("/paths.json", get(move || async move { paths_body }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind console");
    let addr = listener.local_addr().expect("console addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve console");
    });
    (format!("http://{addr}"), handle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn discovery_adopts_the_advertised_mount() {
    let (server, handle) = launch_console(r#"{"api_path": "/custom/api/v2/"}"#).await;

    let mut api = ApiClient::new(&server).expect("client");
    api.discover_base_path().await;

    assert_eq!(api.base_path(), "/custom/api/v2");
    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_console_keeps_the_default_mount() {
    // nothing listens on port 1, so the fetch is refused
    let mut api = ApiClient::new("http://127.0.0.1:1").expect("client");
    api.discover_base_path().await;

    assert_eq!(api.base_path(), DEFAULT_BASE_PATH);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_discovery_document_keeps_the_default_mount() {
    let (server, handle) = launch_console("<html>not json</html>").await;

    let mut api = ApiClient::new(&server).expect("client");
    api.discover_base_path().await;

    assert_eq!(api.base_path(), DEFAULT_BASE_PATH);
    handle.abort();
}
