use std::time::Duration;

use bytes::Bytes;
use stampede_ant::{AntOptions, Downloader, Status, WaitOutcome};
use stampede_net::{HttpClient, NetOptions};
use stampede_test_utils::{range_fixture_router, RangeFixture, TestHttpServer};
use tokio_util::sync::CancellationToken;

const CONTENT_LEN: usize = 96 * 1024;
const PIECE_SIZE: u64 = 32 * 1024;

fn test_content() -> Bytes {
    (0..CONTENT_LEN)
        .map(|i| (i.wrapping_mul(31).wrapping_add(i >> 8) & 0xff) as u8)
        .collect::<Vec<u8>>()
        .into()
}

async fn fixture_server(content: Bytes) -> TestHttpServer {
    let fixture = RangeFixture::new(content).throttled(8 * 1024, Duration::from_millis(5));
    TestHttpServer::new(range_fixture_router(fixture)).await
}

/// Slow enough that a full download cannot win a race against a test that
/// cancels after a few tens of milliseconds.
async fn slow_fixture_server(content: Bytes) -> TestHttpServer {
    let fixture = RangeFixture::new(content).throttled(4 * 1024, Duration::from_millis(100));
    TestHttpServer::new(range_fixture_router(fixture)).await
}

fn downloader(server: &TestHttpServer, path: &str, dir: &tempfile::TempDir, ants: usize) -> Downloader {
    let opts = AntOptions {
        piece_size: PIECE_SIZE,
        ants,
        watchdog_timeout: Duration::from_secs(10),
        hook: None,
    };
    Downloader::new(
        server.url(path),
        dir.path().join("segment"),
        HttpClient::new(NetOptions::default()),
        opts,
    )
    .unwrap()
}

async fn read_all(d: &Downloader) -> Vec<u8> {
    let cancel = CancellationToken::new();
    let mut buf = vec![0u8; 4 * 1024];
    let mut out = Vec::new();
    let mut off = 0u64;
    loop {
        let n = d.read_at(&cancel, &mut buf, off).await.unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
        off += n as u64;
    }
    out
}

async fn run_scenario(path: &str, ants: usize, length_known_while_downloading: bool) {
    let content = test_content();
    let server = fixture_server(content.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let d = downloader(&server, path, &dir, ants);

    assert_eq!(d.status(), (Status::NotStarted, None));
    d.start().unwrap();

    let cancel = CancellationToken::new();
    assert_eq!(
        d.wait_ready(&cancel, 0).await.unwrap(),
        WaitOutcome::Ready
    );
    let (status, total) = d.status();
    assert!(status.is_started(), "unexpected status {status:?}");
    if length_known_while_downloading {
        assert_eq!(total, Some(CONTENT_LEN as u64));
    } else {
        assert_eq!(total, None);
    }

    let (done_tx, mut done_rx) = tokio::sync::mpsc::channel(1);
    d.add_completion_listener(done_tx);

    let data = read_all(&d).await;
    assert_eq!(data, content, "downloaded bytes differ from upstream");

    tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
        .await
        .expect("completion listener should fire")
        .expect("listener channel open");

    // A listener registered after the fact fires immediately.
    let (late_tx, mut late_rx) = tokio::sync::mpsc::channel(1);
    d.add_completion_listener(late_tx);
    late_rx.try_recv().expect("late listener should fire at once");

    let (status, total) = d.status();
    assert_eq!(status, Status::Completed);
    assert_eq!(total, Some(CONTENT_LEN as u64));

    d.destroy();
    assert_eq!(d.status().0, Status::Destroyed);
    assert!(!dir.path().join("segment").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_ranged_download_with_known_length() {
    run_scenario("/ranged", 5, true).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn single_thread_fallback_when_ranges_rejected() {
    run_scenario("/plain", 5, true).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_content_length_is_backfilled_on_completion() {
    run_scenario("/no-length", 5, false).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn single_ant_skips_probing() {
    run_scenario("/ranged", 1, true).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn read_past_total_returns_eof() {
    let content = test_content();
    let server = fixture_server(content).await;
    let dir = tempfile::tempdir().unwrap();
    let d = downloader(&server, "/ranged", &dir, 5);
    d.start().unwrap();

    let cancel = CancellationToken::new();
    assert_eq!(d.wait_ready(&cancel, 0).await.unwrap(), WaitOutcome::Ready);
    assert_eq!(
        d.wait_ready(&cancel, CONTENT_LEN as u64).await.unwrap(),
        WaitOutcome::Eof
    );
    let mut buf = [0u8; 16];
    let n = d
        .read_at(&cancel, &mut buf, CONTENT_LEN as u64 + 5)
        .await
        .unwrap();
    assert_eq!(n, 0);
    d.destroy();
}

#[tokio::test(flavor = "multi_thread")]
async fn upstream_404_aborts_and_retry_rearms() {
    // A router with no routes answers 404 to everything.
    let server = TestHttpServer::new(axum::Router::new()).await;
    let dir = tempfile::tempdir().unwrap();
    let d = downloader(&server, "/gone", &dir, 5);
    d.start().unwrap();

    let cancel = CancellationToken::new();
    let err = d.wait_ready(&cancel, 0).await.unwrap_err();
    assert!(
        matches!(err, stampede_ant::AntError::Stopped),
        "unexpected error {err:?}"
    );
    assert_eq!(d.status().0, Status::Aborted);

    // Retry resets to NotStarted and deletes the partial file.
    d.retry().unwrap();
    assert_eq!(d.status(), (Status::NotStarted, None));
    assert!(!dir.path().join("segment").exists());

    // Restarting is legal again (it will abort once more against this
    // upstream, which is fine for the lifecycle under test).
    d.start().unwrap();
    let _ = d.wait_ready(&cancel, 0).await;
    d.destroy();
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_is_rejected_while_running() {
    let content = test_content();
    let server = fixture_server(content).await;
    let dir = tempfile::tempdir().unwrap();
    let d = downloader(&server, "/ranged", &dir, 5);
    d.start().unwrap();

    let cancel = CancellationToken::new();
    d.wait_ready(&cancel, 0).await.unwrap();
    assert!(matches!(
        d.retry(),
        Err(stampede_ant::AntError::BadStatus)
    ));
    d.destroy();
}

#[tokio::test(flavor = "multi_thread")]
async fn caller_cancellation_unblocks_wait_ready() {
    let content = test_content();
    let server = slow_fixture_server(content).await;
    let dir = tempfile::tempdir().unwrap();
    let d = downloader(&server, "/ranged", &dir, 5);
    d.start().unwrap();

    let cancel = CancellationToken::new();
    let waiter = {
        let d = d.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            // An offset far past what the throttled server can produce
            // quickly keeps the waiter parked.
            d.wait_ready(&cancel, (CONTENT_LEN - 1) as u64).await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, stampede_ant::AntError::Cancelled));
    d.destroy();
}

#[tokio::test(flavor = "multi_thread")]
async fn destroy_wakes_waiters_and_deletes_file() {
    let content = test_content();
    let server = slow_fixture_server(content).await;
    let dir = tempfile::tempdir().unwrap();
    let d = downloader(&server, "/ranged", &dir, 5);
    d.start().unwrap();

    let cancel = CancellationToken::new();
    d.wait_ready(&cancel, 0).await.unwrap();

    let waiter = {
        let d = d.clone();
        let cancel = cancel.clone();
        tokio::spawn(
            async move { d.wait_ready(&cancel, (CONTENT_LEN - 1) as u64).await },
        )
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    d.destroy();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(
        matches!(err, stampede_ant::AntError::Destroyed),
        "unexpected error {err:?}"
    );
    assert_eq!(d.status().0, Status::Destroyed);
    assert!(!dir.path().join("segment").exists());

    // Destroy is idempotent and terminal.
    d.destroy();
    assert_eq!(d.status().0, Status::Destroyed);
}
