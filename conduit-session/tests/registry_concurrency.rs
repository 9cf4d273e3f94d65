//! Registry behavior under concurrent callers and idle expiry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use conduit_session::{SessionError, SessionManager, WorkspaceError, WorkspacePolicy};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    root: String,
    manager: Arc<SessionManager>,
}

fn fixture(capacity: usize, idle_secs: u64) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let app = dir.path().join("app");
    std::fs::create_dir(&app).unwrap();
    let policy = WorkspacePolicy::new([dir.path().to_path_buf()], Duration::from_secs(2));
    Fixture {
        root: app.to_str().unwrap().to_string(),
        manager: Arc::new(SessionManager::new(
            policy,
            capacity,
            Duration::from_secs(idle_secs),
        )),
        _dir: dir,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creators_share_one_session() {
    let fx = fixture(100, 3600);

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let manager = Arc::clone(&fx.manager);
        let root = fx.root.clone();
        tasks.push(tokio::spawn(async move {
            manager.get_or_create("shared", &root).await
        }));
    }

    let mut sessions = Vec::new();
    for task in tasks {
        sessions.push(task.await.unwrap().unwrap());
    }

    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    assert_eq!(fx.manager.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_callers_see_same_created_at() {
    let fx = fixture(10, 3600);

    let (a, b) = tokio::join!(
        fx.manager.get_or_create("s1", &fx.root),
        fx.manager.get_or_create("s1", &fx.root),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.created_at(), b.created_at());
    assert_eq!(a.created_wall(), b.created_wall());
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_replaced_after_cleanup() {
    let fx = fixture(10, 60);

    let original = fx.manager.get_or_create("s1", &fx.root).await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;

    assert_eq!(fx.manager.cleanup_expired().unwrap(), 1);
    assert!(fx.manager.is_empty());

    let fresh = fx.manager.get_or_create("s1", &fx.root).await.unwrap();
    assert!(!Arc::ptr_eq(&original, &fresh));
    assert!(fresh.created_at() > original.created_at());
}

#[tokio::test(start_paused = true)]
async fn test_expiry_racing_create_yields_single_live_session() {
    let fx = fixture(10, 60);
    fx.manager.get_or_create("s1", &fx.root).await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;

    let cleaner = {
        let manager = Arc::clone(&fx.manager);
        tokio::spawn(async move { manager.cleanup_expired() })
    };
    let creators: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&fx.manager);
            let root = fx.root.clone();
            tokio::spawn(async move { manager.get_or_create("s1", &root).await })
        })
        .collect();

    cleaner.await.unwrap().unwrap();
    let mut sessions = Vec::new();
    for task in creators {
        sessions.push(task.await.unwrap().unwrap());
    }

    // Every caller holds the one session that is in the registry now.
    let current = fx.manager.get("s1").unwrap().unwrap();
    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &current)));
    assert_eq!(fx.manager.len(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_system_path_rejected_against_workspace_allow_list() {
    let policy = WorkspacePolicy::new([PathBuf::from("/workspaces")], Duration::from_secs(2));
    let manager = SessionManager::new(policy, 10, Duration::from_secs(3600));

    let err = manager.get_or_create("s1", "/etc/passwd").await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Validation(WorkspaceError::OutsideAllowList { .. })
    ));
    assert!(manager.is_empty());
    assert!(manager.get("s1").unwrap().is_none());
}

#[tokio::test]
async fn test_out_of_bounds_roots_never_create_sessions() {
    let fx = fixture(10, 3600);
    let outside = tempfile::tempdir().unwrap();

    let candidates = [
        outside.path().to_str().unwrap().to_string(),
        format!("{}/../..", fx.root),
        "/".to_string(),
        "relative/app".to_string(),
    ];
    for (i, root) in candidates.iter().enumerate() {
        let err = fx
            .manager
            .get_or_create(&format!("s{i}"), root)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)), "{root}: {err}");
    }
    assert!(fx.manager.is_empty());
}
