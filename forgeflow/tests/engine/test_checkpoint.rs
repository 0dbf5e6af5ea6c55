//! Git checkpoint tests against real temporary repositories

use super::common::*;
use forgeflow::checkpoint::{
    cleanup_checkpoints, commits_since, create_checkpoint, list_checkpoints,
    rollback_to_checkpoint, CheckpointError, CheckpointOutcome, CheckpointRecord,
};

fn created(outcome: CheckpointOutcome) -> CheckpointRecord {
    match outcome {
        CheckpointOutcome::Created(record) => record,
        CheckpointOutcome::Skipped { reason } => panic!("checkpoint skipped: {}", reason),
    }
}

#[tokio::test]
async fn test_create_checkpoint_tags_head() {
    let repo = init_repo();
    let head = git(repo.path(), &["rev-parse", "HEAD"]);

    let outcome = create_checkpoint(repo.path(), "s1", 2, "Implementation")
        .await
        .unwrap();
    let record = created(outcome);
    assert_eq!(record.tag_name, "ff-checkpoint/s1/pre-2-implementation");
    assert_eq!(record.commit_hash, head);
    assert_eq!(record.phase_index, 2);

    let tags = git(repo.path(), &["tag", "-l"]);
    assert_eq!(tags, "ff-checkpoint/s1/pre-2-implementation");
}

#[tokio::test]
async fn test_create_checkpoint_twice_is_idempotent() {
    let repo = init_repo();

    let first = create_checkpoint(repo.path(), "s1", 0, "Design").await.unwrap();
    commit_file(repo.path(), "later.txt", "later", "later work");
    let second = create_checkpoint(repo.path(), "s1", 0, "Design").await.unwrap();

    // The existing tag wins; it is not moved to the new HEAD
    assert_eq!(first, second);
    assert_eq!(list_checkpoints(repo.path(), "s1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rollback_restores_tracked_and_removes_untracked() {
    let repo = init_repo();
    let path = repo.path();
    std::fs::create_dir_all(path.join("target")).unwrap();
    std::fs::write(path.join("target/build.log"), "cached").unwrap();

    let outcome = create_checkpoint(path, "s1", 1, "Implementation").await.unwrap();
    let tag = created(outcome).tag_name;

    // Work done by the phase: an edit, a new tracked file and an untracked file
    std::fs::write(path.join("README.md"), "# rewritten\n").unwrap();
    commit_file(path, "src.rs", "fn main() {}", "phase commit");
    std::fs::write(path.join("scratch.txt"), "untracked").unwrap();

    rollback_to_checkpoint(path, &tag).await.unwrap();

    assert_eq!(std::fs::read_to_string(path.join("README.md")).unwrap(), "# demo\n");
    assert!(!path.join("src.rs").exists());
    assert!(!path.join("scratch.txt").exists());
    assert!(path.join("target/build.log").exists(), "ignored files survive");
}

#[tokio::test]
async fn test_rollback_keeps_session_state() {
    let repo = init_repo();
    let path = repo.path();
    let outcome = create_checkpoint(path, "s1", 0, "Design").await.unwrap();
    let tag = created(outcome).tag_name;

    std::fs::create_dir_all(path.join(".forgeflow/sessions")).unwrap();
    std::fs::write(path.join(".forgeflow/sessions/s1.json"), "{}").unwrap();

    rollback_to_checkpoint(path, &tag).await.unwrap();
    assert!(path.join(".forgeflow/sessions/s1.json").exists());
}

#[tokio::test]
async fn test_rollback_to_missing_tag_fails() {
    let repo = init_repo();
    let err = rollback_to_checkpoint(repo.path(), "ff-checkpoint/s1/pre-9-missing")
        .await
        .unwrap_err();
    assert!(matches!(err, CheckpointError::MissingTag(_)));
}

#[tokio::test]
async fn test_list_and_cleanup_are_scoped_to_session() {
    let repo = init_repo();
    let path = repo.path();
    for (index, name) in ["Design", "Tests", "Implementation"].iter().enumerate() {
        create_checkpoint(path, "s1", index, name).await.unwrap();
    }
    create_checkpoint(path, "s10", 0, "Design").await.unwrap();

    let tags = list_checkpoints(path, "s1").await.unwrap();
    assert_eq!(
        tags,
        vec![
            "ff-checkpoint/s1/pre-0-design",
            "ff-checkpoint/s1/pre-1-tests",
            "ff-checkpoint/s1/pre-2-implementation",
        ]
    );

    assert_eq!(cleanup_checkpoints(path, "s1").await.unwrap(), tags);
    assert!(list_checkpoints(path, "s1").await.unwrap().is_empty());
    assert_eq!(
        list_checkpoints(path, "s10").await.unwrap(),
        vec!["ff-checkpoint/s10/pre-0-design"]
    );
    assert!(cleanup_checkpoints(path, "s1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_commits_since_lists_new_commits_oldest_first() {
    let repo = init_repo();
    let base = git(repo.path(), &["rev-parse", "HEAD"]);
    let first = commit_file(repo.path(), "a.txt", "a", "first");
    let second = commit_file(repo.path(), "b.txt", "b", "second");

    let commits = commits_since(repo.path(), &base).await.unwrap();
    assert_eq!(commits, vec![first, second]);
}

#[tokio::test]
async fn test_checkpoint_skipped_outside_git() {
    let dir = tempfile::tempdir().unwrap();

    let outcome = create_checkpoint(dir.path(), "s1", 0, "Design").await.unwrap();
    assert!(matches!(outcome, CheckpointOutcome::Skipped { .. }));
    assert!(list_checkpoints(dir.path(), "s1").await.unwrap().is_empty());

    let err = rollback_to_checkpoint(dir.path(), "ff-checkpoint/s1/pre-0-design")
        .await
        .unwrap_err();
    assert!(matches!(err, CheckpointError::NotARepository(_)));
}

#[tokio::test]
async fn test_checkpoint_skipped_without_commits() {
    let dir = tempfile::tempdir().unwrap();
    git(dir.path(), &["init", "-q"]);

    let outcome = create_checkpoint(dir.path(), "s1", 0, "Design").await.unwrap();
    assert!(matches!(outcome, CheckpointOutcome::Skipped { .. }));
}
