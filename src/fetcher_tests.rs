//! Tests for the archive fetcher: entry filtering, tar streaming and the
//! fetch concurrency bound.

use super::*;
use crate::test_utils::{build_tar, test_config, MockGitserverClient};
use proptest::prelude::*;
use std::io::Cursor;
use std::time::Duration;

// ─── Test helpers ───────────────────────────────────────────────────

fn collect(tar: Vec<u8>, max_file_size: u64) -> Vec<ParseRequest> {
    let mut out = Vec::new();
    read_tar(Cursor::new(tar), max_file_size, &CancellationToken::new(), |req| {
        out.push(req);
        true
    })
    .unwrap();
    out
}

fn paths(requests: &[ParseRequest]) -> Vec<&str> {
    requests.iter().map(|r| r.path.as_str()).collect()
}

fn fetcher(client: Arc<MockGitserverClient>, max_concurrent_fetches: usize) -> (RepositoryFetcher, Arc<Metrics>) {
    let dir = std::env::temp_dir();
    let config = SymbolsConfig { max_concurrent_fetches, ..test_config(&dir) };
    let metrics = Arc::new(Metrics::new());
    (RepositoryFetcher::new(client, &config, metrics.clone()), metrics)
}

async fn drain(mut rx: mpsc::Receiver<Result<ParseRequest>>) -> (Vec<ParseRequest>, Option<SymbolsError>) {
    let mut requests = Vec::new();
    while let Some(item) = rx.recv().await {
        match item {
            Ok(req) => requests.push(req),
            Err(e) => return (requests, Some(e)),
        }
    }
    (requests, None)
}

// ─── Filter policy ──────────────────────────────────────────────────

#[test]
fn test_should_parse_regular_source_file() {
    assert!(should_parse(true, 100, "src/main.go", DEFAULT_MAX));
}

#[test]
fn test_should_parse_skips_json() {
    assert!(!should_parse(true, 100, "package.json", DEFAULT_MAX));
    assert!(!should_parse(true, 100, "deep/dir/data.json", DEFAULT_MAX));
    assert!(should_parse(true, 100, "json.go", DEFAULT_MAX));
}

#[test]
fn test_should_parse_skips_non_regular() {
    assert!(!should_parse(false, 0, "src", DEFAULT_MAX));
}

#[test]
fn test_should_parse_size_threshold_is_inclusive() {
    assert!(should_parse(true, DEFAULT_MAX, "big.go", DEFAULT_MAX));
    assert!(!should_parse(true, DEFAULT_MAX + 1, "big.go", DEFAULT_MAX));
}

const DEFAULT_MAX: u64 = crate::config::DEFAULT_MAX_FILE_SIZE;

proptest! {
    #[test]
    fn test_oversized_files_never_parsed(size in (DEFAULT_MAX + 1)..(DEFAULT_MAX * 8), name in "[a-z]{1,8}\\.(go|ts|cs)") {
        prop_assert!(!should_parse(true, size, &name, DEFAULT_MAX));
    }

    #[test]
    fn test_json_never_parsed(size in 0u64..DEFAULT_MAX, name in "[a-z/]{1,12}") {
        let path = format!("{}.json", name);
        prop_assert!(!should_parse(true, size, &path, DEFAULT_MAX));
    }
}

// ─── read_tar ───────────────────────────────────────────────────────

#[test]
fn test_read_tar_preserves_archive_order() {
    let tar = build_tar(&[("b.go", b"func B"), ("a.go", b"func A"), ("c/d.go", b"func D")]);
    let requests = collect(tar, DEFAULT_MAX);
    assert_eq!(paths(&requests), vec!["b.go", "a.go", "c/d.go"]);
    assert_eq!(requests[1].data, b"func A");
}

#[test]
fn test_read_tar_skips_binary_files() {
    let mut binary = b"func Hidden".to_vec();
    binary.insert(3, 0);
    let tar = build_tar(&[("bin.go", &binary), ("ok.go", b"func Ok")]);
    assert_eq!(paths(&collect(tar, DEFAULT_MAX)), vec!["ok.go"]);
}

#[test]
fn test_read_tar_nul_after_sniff_window_is_kept() {
    let mut data = vec![b'a'; 300];
    data[280] = 0;
    let tar = build_tar(&[("late_nul.go", &data)]);
    let requests = collect(tar, DEFAULT_MAX);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].data.len(), 300);
}

#[test]
fn test_read_tar_reads_full_large_file() {
    let data: Vec<u8> = (0..100_000u32).map(|i| b'a' + (i % 26) as u8).collect();
    let tar = build_tar(&[("large.go", &data)]);
    let requests = collect(tar, DEFAULT_MAX);
    assert_eq!(requests[0].data, data);
}

#[test]
fn test_read_tar_skips_oversized_json_and_empty() {
    let big = vec![b'x'; 2048];
    let tar = build_tar(&[
        ("big.go", &big),
        ("conf.json", b"{\"a\": 1}"),
        ("empty.go", b""),
        ("keep.go", b"func Keep"),
    ]);
    assert_eq!(paths(&collect(tar, 1024)), vec!["keep.go"]);
}

#[test]
fn test_read_tar_skips_directories_and_symlinks() {
    let mut builder = tar::Builder::new(Vec::new());

    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_size(0);
    dir.set_mode(0o755);
    dir.set_cksum();
    builder.append_data(&mut dir, "src/", std::io::empty()).unwrap();

    let mut link = tar::Header::new_gnu();
    link.set_entry_type(tar::EntryType::Symlink);
    link.set_size(0);
    link.set_mode(0o777);
    builder.append_link(&mut link, "src/link.go", "main.go").unwrap();

    let mut file = tar::Header::new_gnu();
    file.set_entry_type(tar::EntryType::Regular);
    file.set_size(9);
    file.set_mode(0o644);
    file.set_cksum();
    builder.append_data(&mut file, "src/main.go", &b"func Main"[..]).unwrap();

    let tar = builder.into_inner().unwrap();
    assert_eq!(paths(&collect(tar, DEFAULT_MAX)), vec!["src/main.go"]);
}

#[test]
fn test_read_tar_stops_when_consumer_gone() {
    let tar = build_tar(&[("a.go", b"func A"), ("b.go", b"func B")]);
    let mut seen = 0;
    read_tar(Cursor::new(tar), DEFAULT_MAX, &CancellationToken::new(), |_| {
        seen += 1;
        false
    })
    .unwrap();
    assert_eq!(seen, 1);
}

#[test]
fn test_read_tar_cancelled() {
    let tar = build_tar(&[("a.go", b"func A")]);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = read_tar(Cursor::new(tar), DEFAULT_MAX, &cancel, |_| true).unwrap_err();
    assert!(err.is_cancelled());
}

#[test]
fn test_read_tar_truncated_archive_is_error() {
    let mut tar = build_tar(&[("a.go", &vec![b'a'; 4096])]);
    tar.truncate(1024);
    let result = read_tar(Cursor::new(tar), DEFAULT_MAX, &CancellationToken::new(), |_| true);
    assert!(result.is_err());
}

// ─── RepositoryFetcher ──────────────────────────────────────────────

#[tokio::test]
async fn test_fetch_streams_requests() {
    let client = Arc::new(MockGitserverClient::new());
    client.add_commit("repo", "c1", &[("foo.go", "func Bar() {}\n"), ("data.json", "{}")]);
    let (fetcher, metrics) = fetcher(client.clone(), 2);

    let rx = fetcher.fetch_repository_archive(&CancellationToken::new(), "repo", "c1", Vec::new());
    let (requests, err) = drain(rx).await;

    assert!(err.is_none());
    assert_eq!(paths(&requests), vec!["foo.go"]);
    assert_eq!(metrics.fetching.get(), 0);
    assert_eq!(metrics.fetch_queue_size.get(), 0);
    assert_eq!(metrics.fetch_failed.get(), 0);
}

#[tokio::test]
async fn test_fetch_passes_path_filter() {
    let client = Arc::new(MockGitserverClient::new());
    client.add_commit("repo", "c1", &[("a.go", "func A"), ("b.go", "func B")]);
    let (fetcher, _) = fetcher(client.clone(), 2);

    let rx = fetcher.fetch_repository_archive(&CancellationToken::new(), "repo", "c1", vec!["b.go".to_string()]);
    let (requests, err) = drain(rx).await;

    assert!(err.is_none());
    assert_eq!(paths(&requests), vec!["b.go"]);
    assert_eq!(client.fetch_calls()[0].paths, vec!["b.go".to_string()]);
}

#[tokio::test]
async fn test_fetch_failure_is_terminal_and_counted() {
    let client = Arc::new(MockGitserverClient::new());
    client.fail_fetches(Some("connection refused"));
    let (fetcher, metrics) = fetcher(client, 2);

    let rx = fetcher.fetch_repository_archive(&CancellationToken::new(), "repo", "c1", Vec::new());
    let (requests, err) = drain(rx).await;

    assert!(requests.is_empty());
    let err = err.expect("terminal error");
    assert!(err.is_retryable());
    assert!(err.to_string().contains("repo@c1"));
    assert_eq!(metrics.fetch_failed.get(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_while_waiting_for_fetch_slot() {
    let client = Arc::new(MockGitserverClient::new());
    client.add_commit("repo", "c1", &[("a.go", "func A")]);
    client.set_fetch_delay(Some(Duration::from_secs(30)));
    let (fetcher, metrics) = fetcher(client.clone(), 1);

    let first_cancel = CancellationToken::new();
    let _first = fetcher.fetch_repository_archive(&first_cancel, "repo", "c1", Vec::new());
    while client.fetch_calls().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let cancel = CancellationToken::new();
    let rx = fetcher.fetch_repository_archive(&cancel, "repo", "c1", Vec::new());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(metrics.fetch_queue_size.get(), 1);
    cancel.cancel();

    let (requests, err) = tokio::time::timeout(Duration::from_secs(5), drain(rx)).await.unwrap();
    assert!(requests.is_empty());
    assert!(err.unwrap().is_cancelled());
    assert_eq!(client.fetch_calls().len(), 1, "cancelled waiter must not reach the archive source");
    assert_eq!(metrics.fetch_failed.get(), 0);

    first_cancel.cancel();
}
