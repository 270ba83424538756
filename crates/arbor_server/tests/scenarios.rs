mod common;
use common::*;

fn commit_at(repo: &Repository, mut request: CommitRequest, ts: i64) -> CommitOutcome {
    request.timestamp_override = Some(Timestamp(ts));
    repo.commit(request).unwrap()
}

#[test]
fn test_branch_sees_state_at_its_base() {
    let (repo, _) = setup();
    let view = writer(&repo, "alice");

    let created = commit_at(&repo, repo.new_commit(view).unwrap().with_new_object(concept(1, "original")), 50);
    let o1 = created.id_mappings[&ObjectId::Temp(1)];

    let b = repo
        .create_branch(None, BranchId::MAIN, "B", Timestamp(100))
        .unwrap();
    assert_eq!(b.base, Some(BranchPoint::new(BranchId::MAIN, Timestamp(100))));

    let key = head_key(&repo, o1, BranchId::MAIN);
    let changed = commit_at(&repo, repo.new_commit(view).unwrap().with_delta(set_term(key, "changed")), 150);
    assert_eq!(changed.timestamp(), Timestamp(150));

    let on_b = repo
        .revisions()
        .resolve(o1, BranchPoint::new(b.id, Timestamp(200)))
        .unwrap()
        .unwrap();
    assert!(on_b.is_pointer());
    assert_eq!(on_b.revision().version, Version::FIRST);
    assert_eq!(term_at(&repo, o1, BranchPoint::new(b.id, Timestamp(200))).as_deref(), Some("original"));
    assert_eq!(term_at(&repo, o1, BranchPoint::new(BranchId::MAIN, Timestamp(200))).as_deref(), Some("changed"));

    // untouched objects on B follow main at min(time, base)
    for t in [100, 149, 150, 500] {
        let on_branch = term_at(&repo, o1, BranchPoint::new(b.id, Timestamp(t)));
        let on_main = term_at(&repo, o1, BranchPoint::new(BranchId::MAIN, Timestamp(t.min(100))));
        assert_eq!(on_branch, on_main, "t={}", t);
    }
}

#[test]
fn test_second_writer_on_same_base_conflicts() {
    let (repo, _) = setup();
    let setup_view = writer(&repo, "setup");
    let out = repo
        .commit(repo.new_commit(setup_view).unwrap().with_new_object(concept(1, "v1")))
        .unwrap();
    let o2 = out.id_mappings[&ObjectId::Temp(1)];
    for term in ["v2", "v3"] {
        let key = head_key(&repo, o2, BranchId::MAIN);
        repo.commit(repo.new_commit(setup_view).unwrap().with_delta(set_term(key, term)))
            .unwrap();
    }
    let v3 = head_key(&repo, o2, BranchId::MAIN);
    assert_eq!(v3.version, Version(3));

    let t1 = writer(&repo, "t1");
    let t2 = writer(&repo, "t2");
    let first = repo
        .commit(repo.new_commit(t1).unwrap().with_delta(set_term(v3, "from t1")))
        .unwrap();
    assert_eq!(first.changed, vec![RevisionKey::new(o2, BranchId::MAIN, Version(4))]);

    let err = repo
        .commit(repo.new_commit(t2).unwrap().with_delta(set_term(v3, "from t2")))
        .unwrap_err();
    assert!(
        matches!(err, ArborError::Commit(CommitError::ConcurrentModification { .. })),
        "{}",
        err
    );
    assert_eq!(head_key(&repo, o2, BranchId::MAIN).version, Version(4));
    assert_eq!(term_at(&repo, o2, main_head()).as_deref(), Some("from t1"));
    assert_eq!(repo.stats().commits.conflicts, 1);
}

#[test]
fn test_stale_base_needs_passive_updates() {
    let mut config = test_config();
    config.repository.allow_commit_with_stale_revisions = true;
    let (repo, _) = setup_with(config);
    let view = writer(&repo, "setup");
    let out = repo
        .commit(repo.new_commit(view).unwrap().with_new_object(concept(1, "v1")))
        .unwrap();
    let id = out.id_mappings[&ObjectId::Temp(1)];
    let v1 = head_key(&repo, id, BranchId::MAIN);
    repo.commit(repo.new_commit(view).unwrap().with_delta(set_term(v1, "v2")))
        .unwrap();

    let blind = repo.open_session("blind", false);
    let stale_view = repo.open_view(blind, main_head(), false).unwrap();
    let err = repo
        .commit(repo.new_commit(stale_view).unwrap().with_delta(set_term(v1, "late")))
        .unwrap_err();
    assert!(
        matches!(err, ArborError::Commit(CommitError::ConcurrentModification { .. })),
        "{}",
        err
    );
    assert_eq!(term_at(&repo, id, main_head()).as_deref(), Some("v2"));

    // once the client follows updates the delta is applied on top of head
    repo.set_passive_updates(blind, true).unwrap();
    let out = repo
        .commit(repo.new_commit(stale_view).unwrap().with_delta(set_term(v1, "late")))
        .unwrap();
    assert_eq!(out.changed, vec![RevisionKey::new(id, BranchId::MAIN, Version(3))]);
    assert_eq!(term_at(&repo, id, main_head()).as_deref(), Some("late"));
}

#[test]
fn test_detaching_referenced_object_is_rejected() {
    let (repo, _) = setup();
    let view = writer(&repo, "alice");
    let out = repo
        .commit(
            repo.new_commit(view)
                .unwrap()
                .with_new_object(concept(1, "o3"))
                .with_new_object(concept(2, "other"))
                .with_new_object(link(3, ObjectId::Temp(2), ObjectId::Temp(1))),
        )
        .unwrap();
    let o3 = out.id_mappings[&ObjectId::Temp(1)];
    let o4 = out.id_mappings[&ObjectId::Temp(3)];
    let o3_before = head_key(&repo, o3, BranchId::MAIN);
    let o4_before = head_key(&repo, o4, BranchId::MAIN);
    let last = repo.last_commit_timestamp();

    let err = repo
        .commit(repo.new_commit(view).unwrap().with_detached(o3))
        .unwrap_err();
    assert!(matches!(
        err,
        ArborError::Commit(CommitError::ReferentialIntegrityViolation(_))
    ));

    assert_eq!(head_key(&repo, o3, BranchId::MAIN), o3_before);
    assert_eq!(head_key(&repo, o4, BranchId::MAIN), o4_before);
    assert_eq!(repo.last_commit_timestamp(), last);
    assert_eq!(repo.stats().locks.locked_keys, 0);
}

#[test]
fn test_durable_lock_area_survives_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.locking.lock_area_dir = Some(dir.path().to_path_buf());
    let (repo, store) = setup_with(config.clone());

    let seed = writer(&repo, "seed");
    let out = repo
        .commit(
            repo.new_commit(seed)
                .unwrap()
                .with_new_object(concept(1, "a"))
                .with_new_object(concept(2, "b")),
        )
        .unwrap();
    let a = out.id_mappings[&ObjectId::Temp(1)];
    let b = out.id_mappings[&ObjectId::Temp(2)];

    let session = repo.open_session("reviewer", false);
    let view = repo.open_view(session, main_head(), true).unwrap();
    let area = repo.create_lock_area(view).unwrap();
    assert!(area.read_only);
    let granted = repo
        .lock(view, LockType::Read, &[a, b], &[], false, Duration::from_millis(100))
        .unwrap();
    assert!(granted.granted);
    let stored = repo.lock_area(&area.id).unwrap().unwrap();
    assert_eq!(stored.lock_count(), 2);

    // disconnect: locks stay, parked on the area
    repo.close_session(session).unwrap();
    assert_eq!(repo.stats().locks.locked_keys, 2);

    let returning = repo.open_session("reviewer", false);
    let err = repo.open_durable_view(returning, &area.id, false).unwrap_err();
    assert!(matches!(err, ArborError::Lock(LockError::ReadOnlyMismatch(_))));
    assert!(repo.views(returning).unwrap().is_empty());

    let (reattached, restored) = repo.open_durable_view(returning, &area.id, true).unwrap();
    assert_eq!(restored.locks, stored.locks);
    assert_eq!(restored.branch_point, stored.branch_point);
    let released = repo.unlock(reattached, Some(LockType::Read), &[a], false).unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(repo.lock_area(&area.id).unwrap().unwrap().lock_count(), 1);

    // the area outlives the repository instance
    repo.close_session(returning).unwrap();
    repo.shutdown();
    drop(repo);
    let reopened = Repository::open(config, Arc::new(store), model()).unwrap();
    assert_eq!(reopened.stats().locks.locked_keys, 1);
    let session = reopened.open_session("reviewer", false);
    let (_, area_again) = reopened.open_durable_view(session, &area.id, true).unwrap();
    assert_eq!(area_again.lock_count(), 1);
    assert!(area_again.locks.contains_key(&b));
}

#[test]
fn test_commit_notifies_other_sessions() {
    let (repo, _) = setup();
    let listener = repo.open_session("watcher", false);
    let (_, mut events) = repo
        .subscribe(listener, NotificationScope::ThisBranch, BranchId::MAIN)
        .unwrap();
    let author = repo.open_session("author", false);
    let (_, mut own) = repo
        .subscribe(author, NotificationScope::AnyBranch, BranchId::MAIN)
        .unwrap();
    let view = repo.open_view(author, main_head(), false).unwrap();

    let out = repo
        .commit(
            repo.new_commit(view)
                .unwrap()
                .with_new_object(concept(1, "x"))
                .with_lock_on_new_object(ObjectId::Temp(1), LockType::Write),
        )
        .unwrap();
    let id = out.id_mappings[&ObjectId::Temp(1)];

    match events.try_recv() {
        Ok(SessionEvent::Commit(c)) => {
            assert_eq!(c.new_objects, vec![(id, "Concept".to_string())]);
            assert_eq!(c.branch_point.timestamp, out.timestamp());
        }
        other => panic!("unexpected {:?}", other),
    }
    match events.try_recv() {
        Ok(SessionEvent::LockChange(l)) => assert_eq!(l.locks, vec![(id, LockType::Write)]),
        other => panic!("unexpected {:?}", other),
    }
    assert!(own.try_recv().is_err());

    repo.create_branch(Some(author), BranchId::MAIN, "side", Timestamp::UNSPECIFIED)
        .unwrap();
    assert!(events.try_recv().is_err());
}

#[test]
fn test_merge_data_between_sibling_branches() {
    let (repo, _) = setup();
    let view = writer(&repo, "alice");
    let out = repo
        .commit(
            repo.new_commit(view)
                .unwrap()
                .with_new_object(concept(1, "a"))
                .with_new_object(concept(2, "b")),
        )
        .unwrap();
    let a = out.id_mappings[&ObjectId::Temp(1)];
    let b = out.id_mappings[&ObjectId::Temp(2)];

    let left = repo
        .create_branch(None, BranchId::MAIN, "left", Timestamp::UNSPECIFIED)
        .unwrap();
    let right = repo
        .create_branch(None, BranchId::MAIN, "right", Timestamp::UNSPECIFIED)
        .unwrap();

    let session = repo.open_session("bob", false);
    let lv = repo.open_view(session, BranchPoint::head(left.id), false).unwrap();
    let rv = repo.open_view(session, BranchPoint::head(right.id), false).unwrap();
    repo.commit(repo.new_commit(lv).unwrap().with_delta(set_term(head_key(&repo, a, left.id), "left")))
        .unwrap();
    let right_commit = repo
        .commit(repo.new_commit(rv).unwrap().with_delta(set_term(head_key(&repo, b, right.id), "right")))
        .unwrap();
    assert_eq!(right_commit.changed[0].version, Version::FIRST);

    let merge = repo
        .merge_data(BranchPoint::head(left.id), BranchPoint::head(right.id))
        .unwrap();
    assert!(merge.ancestor.is_some());
    assert_eq!(merge.ids.len(), 2);
    assert!(merge.ids.contains(&a) && merge.ids.contains(&b));
    assert_eq!(term_at(&repo, b, main_head()).as_deref(), Some("b"));
}

#[tokio::test]
async fn test_instances_query_through_view() {
    let (repo, _) = setup();
    let view = writer(&repo, "alice");
    repo.commit(
        repo.new_commit(view)
            .unwrap()
            .with_new_object(concept(1, "a"))
            .with_new_object(concept(2, "b"))
            .with_new_object(link(3, ObjectId::Temp(1), ObjectId::Temp(2))),
    )
    .unwrap();

    let handle = repo.submit_query(view, Query::instances_of("Concept")).unwrap();
    let (rows, end) = handle.collect().await;
    assert!(matches!(end, QueryEnd::Completed));
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| matches!(r, QueryRow::Revision(rev) if rev.class == "Concept")));
}

#[tokio::test]
async fn test_closing_view_cancels_its_query() {
    use arbor_common::error::QueryError;
    use arbor_server::{QueryContext, QueryHandler, QuerySink};

    struct Endless;

    impl QueryHandler for Endless {
        fn execute(&self, ctx: &QueryContext<'_>, _sink: &mut QuerySink<'_>) -> Result<(), QueryError> {
            while !ctx.is_cancelled() {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }
    }

    let (repo, _) = setup();
    repo.register_query_handler("endless", Arc::new(Endless));
    let session = repo.open_session("alice", false);
    let view = repo.open_view(session, main_head(), true).unwrap();
    let handle = repo.submit_query(view, Query::new("endless")).unwrap();
    repo.close_view(view).unwrap();

    let (rows, end) = handle.collect().await;
    assert!(rows.is_empty());
    assert!(matches!(end, QueryEnd::Cancelled));
}
