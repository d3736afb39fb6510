mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use amplify_engine::{BrowserError, BrowserSessionCache};
use common::{FakeLauncher, PageScript};

fn cache() -> (Arc<FakeLauncher>, BrowserSessionCache) {
    let launcher = Arc::new(FakeLauncher::new(PageScript::default()));
    let cache = BrowserSessionCache::new(launcher.clone());
    (launcher, cache)
}

#[tokio::test]
async fn the_browser_is_launched_once_and_reused() {
    let (launcher, cache) = cache();

    let first = cache.get().await.unwrap();
    let second = cache.get().await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test]
async fn a_dead_browser_is_relaunched() {
    let (launcher, cache) = cache();
    cache.get().await.unwrap();

    launcher.kill_current();
    let browser = cache.get().await.unwrap();

    assert!(browser.is_alive().await);
    assert_eq!(launcher.launches(), 2);
}

#[tokio::test]
async fn launch_failures_are_not_cached() {
    let (launcher, cache) = cache();
    launcher.fail_launch.store(true, Ordering::SeqCst);

    let err = cache.get().await.err().unwrap();
    assert_eq!(err, BrowserError::Launch("chrome not found".to_string()));

    launcher.fail_launch.store(false, Ordering::SeqCst);
    assert!(cache.get().await.is_ok());
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test]
async fn shutdown_closes_and_forgets_the_browser() {
    let (launcher, cache) = cache();
    let browser = cache.get().await.unwrap();

    cache.shutdown().await;

    assert!(!browser.is_alive().await);
    cache.get().await.unwrap();
    assert_eq!(launcher.launches(), 2);
}
