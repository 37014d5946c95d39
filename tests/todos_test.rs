// Tests for the versioned todo list

use runledger::db::repositories::TodosReplace;
use runledger::db::{Database, ThreadKey, ThreadRepository, TodosRepository};
use runledger::StoreError;
use serde_json::json;
use tempfile::TempDir;

fn setup() -> (TodosRepository, ThreadKey, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(temp_dir.path().join("test.db")).unwrap();
    (TodosRepository::new(db), ThreadKey::new("local", "t1").unwrap(), temp_dir)
}

fn replace(key: &ThreadKey, todos: serde_json::Value) -> TodosReplace {
    TodosReplace {
        key: key.clone(),
        todos,
        updated_by: Some("agent".into()),
    }
}

#[tokio::test]
async fn test_versions_increase_by_one() {
    let (todos, key, _temp) = setup();
    assert!(todos.get(&key).await.unwrap().is_none());

    let first = todos.replace_snapshot(&replace(&key, json!(["a"])), None).await.unwrap();
    assert_eq!(first.version, 1);

    let second = todos
        .replace_snapshot(&replace(&key, json!(["a", "b"])), Some(1))
        .await
        .unwrap();
    assert_eq!(second.version, 2);

    // unconditional write still bumps the version
    let third = todos.replace_snapshot(&replace(&key, json!([])), None).await.unwrap();
    assert_eq!(third.version, 3);

    let stored = todos.get(&key).await.unwrap().unwrap();
    assert_eq!(stored.version, 3);
    assert_eq!(stored.todos, json!([]));
    assert_eq!(stored.updated_by.as_deref(), Some("agent"));
}

#[tokio::test]
async fn test_stale_version_is_rejected() {
    let (todos, key, _temp) = setup();
    todos.replace_snapshot(&replace(&key, json!(["a"])), Some(0)).await.unwrap();
    todos.replace_snapshot(&replace(&key, json!(["b"])), Some(1)).await.unwrap();

    let err = todos
        .replace_snapshot(&replace(&key, json!(["stale"])), Some(1))
        .await
        .unwrap_err();
    match err {
        StoreError::VersionConflict { expected, current } => {
            assert_eq!(expected, Some(1));
            assert_eq!(current, 2);
        }
        other => panic!("expected version conflict, got {:?}", other),
    }

    let stored = todos.get(&key).await.unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.todos, json!(["b"]));
}

#[tokio::test]
async fn test_first_write_expects_version_zero() {
    let (todos, key, _temp) = setup();

    let err = todos
        .replace_snapshot(&replace(&key, json!(["a"])), Some(3))
        .await
        .unwrap_err();
    assert!(err.is_version_conflict());
    assert!(todos.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_todos_must_be_array() {
    let (todos, key, _temp) = setup();

    let err = todos
        .replace_snapshot(&replace(&key, json!({"a": 1})), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_concurrent_writers_one_wins() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(temp_dir.path().join("test.db")).unwrap();
    let key = ThreadKey::new("local", "t1").unwrap();
    ThreadRepository::new(db.clone()).create(&key, None, None).await.unwrap();
    let todos = std::sync::Arc::new(TodosRepository::new(db));
    todos.replace_snapshot(&replace(&key, json!([])), None).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..4 {
        let todos = todos.clone();
        let rec = replace(&key, json!([format!("writer {}", i)]));
        handles.push(tokio::spawn(async move { todos.replace_snapshot(&rec, Some(1)).await }));
    }

    let mut won = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(snapshot) => {
                assert_eq!(snapshot.version, 2);
                won += 1;
            }
            Err(e) => {
                assert!(e.is_version_conflict());
                conflicts += 1;
            }
        }
    }
    assert_eq!(won, 1);
    assert_eq!(conflicts, 3);
}
