//! Repository adapter contract tests.
//!
//! Skipped silently when no usable `git` binary is on the path, the same
//! way the Docker-backed tests probe for a reachable daemon.

use std::time::Duration;

use laforge::repo::{GitRepository, MergeOutcome, Repository};

fn adapter() -> GitRepository {
    GitRepository::new(Duration::from_secs(30))
}

#[tokio::test]
async fn init_creates_a_root_commit() {
    if !GitRepository::git_available().await {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("source");
    let repo = adapter();

    let c0 = repo.init_repository(&root).await.expect("init");
    assert_eq!(repo.head_commit(&root).await.expect("head"), c0);
}

#[tokio::test]
async fn worktree_commit_merge_cycle() {
    if !GitRepository::git_available().await {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("source");
    let repo = adapter();
    let c0 = repo.init_repository(&root).await.expect("init");

    let worktree = dir.path().join("worktrees").join("step-S1");
    repo.create_worktree(&root, "step-S1", &worktree)
        .await
        .expect("worktree");
    assert!(!repo.has_changes(&worktree).await.expect("clean worktree"));

    std::fs::write(worktree.join("artifact.txt"), "made by agent").expect("write");
    assert!(repo.has_changes(&worktree).await.expect("dirty worktree"));

    let c1 = repo
        .commit_all(&worktree, "S1: agent changes")
        .await
        .expect("commit");
    assert_ne!(c1, c0);

    let outcome = repo
        .merge_into(&root, "step-S1", "Merge step-S1")
        .await
        .expect("merge");
    let head = match outcome {
        MergeOutcome::Merged(sha) => sha,
        MergeOutcome::Conflict => panic!("clean merge reported conflict"),
    };
    assert!(repo
        .is_ancestor(&root, &c0, &head)
        .await
        .expect("ancestry"));
    assert!(repo.is_ancestor(&root, &c1, &head).await.expect("ancestry"));

    // Cleanup order matters: the branch is busy while its worktree exists.
    repo.remove_worktree(&root, &worktree)
        .await
        .expect("remove worktree");
    repo.delete_branch(&root, "step-S1")
        .await
        .expect("delete branch");
    assert!(repo
        .list_branches(&root, "step-S")
        .await
        .expect("branches")
        .is_empty());
}

#[tokio::test]
async fn conflicting_merge_leaves_the_target_untouched() {
    if !GitRepository::git_available().await {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("source");
    let repo = adapter();
    repo.init_repository(&root).await.expect("init");

    // Two branches off the same base editing the same file.
    let wt1 = dir.path().join("wt1");
    let wt2 = dir.path().join("wt2");
    repo.create_worktree(&root, "step-S1", &wt1)
        .await
        .expect("wt1");
    repo.create_worktree(&root, "step-S2", &wt2)
        .await
        .expect("wt2");
    std::fs::write(wt1.join("shared.txt"), "version one").expect("write");
    std::fs::write(wt2.join("shared.txt"), "version two").expect("write");
    repo.commit_all(&wt1, "S1 change").await.expect("commit 1");
    repo.commit_all(&wt2, "S2 change").await.expect("commit 2");

    let merged = repo
        .merge_into(&root, "step-S1", "Merge step-S1")
        .await
        .expect("first merge");
    let head_after_first = match merged {
        MergeOutcome::Merged(sha) => sha,
        MergeOutcome::Conflict => panic!("first merge should land"),
    };

    let conflicted = repo
        .merge_into(&root, "step-S2", "Merge step-S2")
        .await
        .expect("second merge call");
    assert_eq!(conflicted, MergeOutcome::Conflict);

    // The target branch did not move and is left clean.
    assert_eq!(
        repo.head_commit(&root).await.expect("head"),
        head_after_first
    );
    assert!(!repo.has_changes(&root).await.expect("clean after abort"));
}

#[tokio::test]
async fn reset_hard_rewinds_head() {
    if !GitRepository::git_available().await {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("source");
    let repo = adapter();
    let c0 = repo.init_repository(&root).await.expect("init");

    let worktree = dir.path().join("wt");
    repo.create_worktree(&root, "step-S1", &worktree)
        .await
        .expect("worktree");
    std::fs::write(worktree.join("f.txt"), "x").expect("write");
    repo.commit_all(&worktree, "S1").await.expect("commit");
    repo.merge_into(&root, "step-S1", "Merge step-S1")
        .await
        .expect("merge");
    assert_ne!(repo.head_commit(&root).await.expect("head"), c0);

    repo.reset_hard(&root, &c0).await.expect("reset");
    assert_eq!(repo.head_commit(&root).await.expect("head"), c0);
}
