use std::time::Duration;

use tether_session::EchoApp;

use crate::*;

async fn echo_server(layer: &Spawned) -> Arc<EchoApp> {
    let echo = Arc::new(EchoApp::new());
    let index = layer.main.apps().attach(echo.clone());
    layer.main.listen(index, server_key()).await.unwrap();
    echo
}

#[tokio::test]
async fn echo_writes_back_and_closes_with_the_peer() {
    let layer = Spawned::new(2);
    let echo = echo_server(&layer).await;
    let client = Recorder::greeting();
    let index = layer.main.apps().attach(client.clone());

    let handle = layer.main.connect(index, client_tuple(), 1).await.unwrap();
    assert!(
        wait_for(Duration::from_secs(5), || client.received(handle) == b"hello-1").await,
        "echo never answered: {:?}",
        client.notes()
    );
    assert_eq!(echo.echoed_bytes(), 7);
    assert_eq!(echo.session_count(), 1);

    layer.main.close_session(handle).unwrap();
    assert!(wait_for(Duration::from_secs(5), || echo.session_count() == 0).await);
    assert!(
        wait_for(Duration::from_secs(5), || client
            .notes_for(handle)
            .contains(&Note::Cleanup { handle }))
        .await
    );
}

#[tokio::test]
async fn echo_keeps_clients_apart() {
    let layer = Spawned::new(2);
    let echo = echo_server(&layer).await;
    let client = Recorder::greeting();
    let index = layer.main.apps().attach(client.clone());

    let mut handles = Vec::new();
    for opaque in 10..14u64 {
        let h = layer.main.connect(index, client_tuple(), opaque).await.unwrap();
        handles.push((h, format!("hello-{opaque}")));
    }
    for (h, expected) in &handles {
        assert!(
            wait_for(Duration::from_secs(5), || client.received(*h) == expected.as_bytes()).await,
            "{h} got {:?}",
            String::from_utf8_lossy(&client.received(*h))
        );
    }
    assert_eq!(echo.session_count(), 4);
    assert_eq!(echo.echoed_bytes(), 4 * 8);
}
