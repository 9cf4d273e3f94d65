//! End-to-end request augmentation through the engine.

use conduit_engine::{Config, Continuation, Engine, SessionAttachment, ToolRequest, ToolResponse};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    project: String,
    engine: Engine,
}

async fn harness(max_turns: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("app");
    std::fs::create_dir(&project).unwrap();
    std::fs::write(project.join("main.py"), "print('hello')\n").unwrap();

    let mut config = Config::default();
    config.workspace.allowed_roots = vec![dir.path().to_str().unwrap().to_string()];
    config.conversation.max_turns = max_turns;

    Harness {
        project: project.to_str().unwrap().to_string(),
        engine: Engine::from_config(&config).await.unwrap(),
        _dir: dir,
    }
}

#[tokio::test]
async fn test_plain_request_has_no_session_or_history() {
    let h = harness(50).await;
    let prepared = h.engine.prepare(ToolRequest::new("chat", "hi")).await.unwrap();

    assert!(matches!(prepared.session, SessionAttachment::None));
    assert!(matches!(prepared.continuation, Continuation::Fresh));

    let id = h
        .engine
        .record_exchange(&prepared, ToolResponse::new("hello"))
        .await
        .unwrap();
    let thread = h.engine.threads().get_thread(&id.to_string()).await.unwrap().unwrap();
    assert_eq!(thread.turns.len(), 2);
    assert_eq!(thread.tool_name.as_deref(), Some("chat"));

    h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_continuation_round_trip() {
    let h = harness(50).await;

    let first = h
        .engine
        .prepare(ToolRequest::new("review", "look at main").with_files(["main.py"]))
        .await
        .unwrap();
    let id = h
        .engine
        .record_exchange(&first, ToolResponse::new("main.py prints hello"))
        .await
        .unwrap();

    let second = h
        .engine
        .prepare(ToolRequest::new("review", "anything else?").with_continuation(id.to_string()))
        .await
        .unwrap();
    match &second.continuation {
        Continuation::Resumed {
            thread_id,
            files,
            history,
            embedded_files,
            ..
        } => {
            assert_eq!(*thread_id, id);
            assert_eq!(files.len(), 1);
            assert!(history.text.contains("look at main"));
            assert!(history.text.contains("main.py prints hello"));
            assert!(embedded_files.is_none());
        }
        other => panic!("expected Resumed, got {other:?}"),
    }

    let next = h
        .engine
        .record_exchange(&second, ToolResponse::new("no"))
        .await
        .unwrap();
    assert_eq!(next, id);
    let thread = h.engine.threads().get_thread(&id.to_string()).await.unwrap().unwrap();
    assert_eq!(thread.turns.len(), 4);
}

#[tokio::test]
async fn test_unknown_and_malformed_continuations_are_expired() {
    let h = harness(50).await;

    for continuation in [uuid_string(), "not-a-uuid".to_string()] {
        let prepared = h
            .engine
            .prepare(ToolRequest::new("chat", "hi").with_continuation(continuation.clone()))
            .await
            .unwrap();
        match &prepared.continuation {
            Continuation::Expired { continuation_id } => assert_eq!(continuation_id, &continuation),
            other => panic!("expected Expired, got {other:?}"),
        }

        let id = h
            .engine
            .record_exchange(&prepared, ToolResponse::new("fresh start"))
            .await
            .unwrap();
        assert_ne!(id.to_string(), continuation);
    }
}

#[tokio::test]
async fn test_turn_limit_continues_in_child_thread() {
    let h = harness(4).await;

    let first = h.engine.prepare(ToolRequest::new("chat", "one")).await.unwrap();
    let id = h
        .engine
        .record_exchange(&first, ToolResponse::new("two"))
        .await
        .unwrap();

    let second = h
        .engine
        .prepare(ToolRequest::new("chat", "three").with_continuation(id.to_string()))
        .await
        .unwrap();
    assert_eq!(
        h.engine.record_exchange(&second, ToolResponse::new("four")).await.unwrap(),
        id
    );

    let third = h
        .engine
        .prepare(ToolRequest::new("chat", "five").with_continuation(id.to_string()))
        .await
        .unwrap();
    let child = h
        .engine
        .record_exchange(&third, ToolResponse::new("six"))
        .await
        .unwrap();
    assert_ne!(child, id);

    let child_thread = h
        .engine
        .threads()
        .get_thread(&child.to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child_thread.parent_thread_id, Some(id));

    let resumed = h
        .engine
        .prepare(ToolRequest::new("chat", "seven").with_continuation(child.to_string()))
        .await
        .unwrap();
    match &resumed.continuation {
        Continuation::Resumed { chain, history, .. } => {
            assert_eq!(chain, &vec![id, child]);
            let one = history.text.find("one").unwrap();
            let six = history.text.find("six").unwrap();
            assert!(one < six);
        }
        other => panic!("expected Resumed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_two_turn_limit_rolls_every_exchange_into_a_child() {
    let h = harness(2).await;

    let first = h.engine.prepare(ToolRequest::new("chat", "one")).await.unwrap();
    let id = h
        .engine
        .record_exchange(&first, ToolResponse::new("two"))
        .await
        .unwrap();
    let thread = h.engine.threads().get_thread(&id.to_string()).await.unwrap().unwrap();
    assert_eq!(thread.turns.len(), 2);

    let second = h
        .engine
        .prepare(ToolRequest::new("chat", "three").with_continuation(id.to_string()))
        .await
        .unwrap();
    let child = h
        .engine
        .record_exchange(&second, ToolResponse::new("four"))
        .await
        .unwrap();
    assert_ne!(child, id);

    let child_thread = h
        .engine
        .threads()
        .get_thread(&child.to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child_thread.parent_thread_id, Some(id));
    assert_eq!(child_thread.turns.len(), 2);
    assert_eq!(h.engine.storage_name(), "memory");
}

#[tokio::test]
async fn test_session_combinations() {
    let h = harness(50).await;

    let explicit = h
        .engine
        .prepare(
            ToolRequest::new("chat", "hi")
                .with_session("s1")
                .with_project_root(h.project.clone()),
        )
        .await
        .unwrap();
    let session = explicit.session.session().unwrap().clone();
    assert_eq!(session.id(), "s1");

    let lookup = h
        .engine
        .prepare(ToolRequest::new("chat", "again").with_session("s1"))
        .await
        .unwrap();
    assert!(std::sync::Arc::ptr_eq(lookup.session.session().unwrap(), &session));

    let unknown = h
        .engine
        .prepare(ToolRequest::new("chat", "who").with_session("missing"))
        .await
        .unwrap();
    assert!(matches!(unknown.session, SessionAttachment::None));

    let generated = h
        .engine
        .prepare(ToolRequest::new("chat", "new").with_project_root(h.project.clone()))
        .await
        .unwrap();
    let generated_id = generated.session.session().unwrap().id().to_string();
    assert!(uuid::Uuid::parse_str(&generated_id).is_ok());
    assert_eq!(h.engine.sessions().len(), 2);
}

#[tokio::test]
async fn test_root_outside_allow_list_is_validation_error() {
    let h = harness(50).await;
    let err = h
        .engine
        .prepare(
            ToolRequest::new("chat", "hi")
                .with_session("s1")
                .with_project_root("/"),
        )
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), 400);
    assert!(h.engine.sessions().is_empty());
}

#[tokio::test]
async fn test_resumed_with_session_embeds_files() {
    let h = harness(50).await;
    let first = h
        .engine
        .prepare(ToolRequest::new("review", "check").with_files(["main.py", "gone.py"]))
        .await
        .unwrap();
    let id = h
        .engine
        .record_exchange(&first, ToolResponse::new("ok"))
        .await
        .unwrap();

    let resumed = h
        .engine
        .prepare(
            ToolRequest::new("review", "more")
                .with_continuation(id.to_string())
                .with_session("s1")
                .with_project_root(h.project.clone()),
        )
        .await
        .unwrap();

    match &resumed.continuation {
        Continuation::Resumed {
            embedded_files: Some(context),
            ..
        } => {
            assert_eq!(context.embedded, vec!["main.py"]);
            assert!(context.text.contains("print('hello')"));
            assert_eq!(context.skipped.len(), 1);
        }
        other => panic!("expected Resumed with files, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let mut config = Config::default();
    config.sessions.capacity = 0;
    assert!(Engine::from_config(&config).await.is_err());

    let mut config = Config::default();
    config.conversation.max_turns = 1;
    assert!(Engine::from_config(&config).await.is_err());
}

fn uuid_string() -> String {
    uuid::Uuid::new_v4().to_string()
}
