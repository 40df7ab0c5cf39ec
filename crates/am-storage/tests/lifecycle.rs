use am_core::{
    Actor, AssignmentState, CandidateKey, HolidayCalendar, ManagerError, ManagerPolicy, Protocol,
    TaskState, WorkCalendar, AUDIT_ASSIGNED, AUDIT_INSERTED, DISPOSITION_COMPLETE,
};
use am_storage::{AssignmentStore, NewAssignment, NewProject, NewUser, StoreContext};
use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashSet};
use std::thread;
use tempfile::TempDir;

fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 12, hour, minute, 0)
        .single()
        .expect("valid timestamp")
}

fn context() -> StoreContext {
    let calendar = WorkCalendar::new(
        NaiveTime::from_hms_opt(6, 0, 0).expect("open"),
        NaiveTime::from_hms_opt(18, 0, 0).expect("close"),
        HolidayCalendar::us_federal(),
        FixedOffset::east_opt(0),
    )
    .expect("calendar");
    StoreContext::default().with_calendar(calendar)
}

fn admin() -> Actor {
    Actor::new("admin", ["admin", "cleave"])
}

fn user_x() -> Actor {
    Actor::new("userX", ["cleave"])
}

fn no_props() -> BTreeMap<String, String> {
    BTreeMap::new()
}

fn seed(store: &mut AssignmentStore, project: &str, keys: usize) -> i64 {
    for actor in [admin(), user_x()] {
        if store.actor(&actor.user).expect("lookup").is_none() {
            store.add_user(&NewUser::named(&actor.user)).expect("add user");
            store
                .grant_permissions(&actor.user, actor.permissions.iter().map(String::as_str))
                .expect("grant");
        }
    }
    let project = store
        .create_project(&NewProject::new(Protocol::Cleave, project), &admin(), ts(8, 0))
        .expect("create project");
    let candidates = (1..=keys)
        .map(|key| CandidateKey::new(key.to_string()))
        .collect::<Vec<_>>();
    let report = store
        .generate_tasks(project.id, &candidates, Protocol::Cleave.definition(), false, "admin", ts(8, 0))
        .expect("generate");
    assert_eq!(report.inserted, keys as i64);
    project.id
}

#[test]
fn demo_project_runs_from_creation_to_completion() {
    let mut store = AssignmentStore::open_in_memory_with(context()).expect("open db");
    let project_id = seed(&mut store, "demo", 5);

    let created = store
        .create_assignment(
            &NewAssignment::for_project("demo").named("A1").for_user("userX").with_tasks(3),
            &admin(),
            ts(9, 0),
        )
        .expect("create A1");
    assert_eq!(created.tasks, 3);
    assert_eq!(store.unassigned_count(project_id).expect("count"), 2);

    store
        .start_assignment("A1", &user_x(), &no_props(), ts(9, 5))
        .expect("start A1");
    let tasks = store.assignment_tasks(created.assignment.id).expect("tasks");
    store
        .start_task(tasks[0].id, &user_x(), None, &no_props(), ts(9, 10))
        .expect("start task 1");
    let first = store
        .complete_task(tasks[0].id, &user_x(), None, &no_props(), ts(9, 20))
        .expect("complete task 1");
    assert!(!first.assignment_completed);
    assert_eq!(
        store.assignment("A1").expect("load").expect("A1").state(),
        AssignmentState::Started
    );

    for task in &tasks[1..] {
        store
            .start_task(task.id, &user_x(), None, &no_props(), ts(9, 30))
            .expect("start");
        store
            .complete_task(task.id, &user_x(), None, &no_props(), ts(9, 45))
            .expect("complete");
    }
    let a1 = store.assignment("A1").expect("load").expect("A1");
    assert_eq!(a1.disposition.as_deref(), Some(DISPOSITION_COMPLETE));
    assert_eq!(a1.duration, Some(40 * 60));
    // Two tasks remain unassigned, so the project stays open.
    assert!(!store.project("demo").expect("load").expect("demo").is_complete());

    let created = store
        .create_assignment(&NewAssignment::for_project("demo").named("A2").with_tasks(2), &user_x(), ts(10, 0))
        .expect("create A2");
    let tasks = store.assignment_tasks(created.assignment.id).expect("tasks");
    for task in &tasks {
        store
            .start_task(task.id, &user_x(), None, &no_props(), ts(10, 5))
            .expect("start");
    }
    let mut last = None;
    for task in &tasks {
        last = Some(
            store
                .complete_task(task.id, &user_x(), None, &no_props(), ts(10, 30))
                .expect("complete"),
        );
    }
    let last = last.expect("completed a task");
    assert!(last.assignment_completed);
    assert!(last.project_completed);
    assert!(store.project("demo").expect("load").expect("demo").is_complete());
}

#[test]
fn reset_after_a_task_started_changes_nothing() {
    let mut store = AssignmentStore::open_in_memory_with(context()).expect("open db");
    seed(&mut store, "demo", 3);
    let created = store
        .create_assignment(&NewAssignment::for_project("demo").named("A1").with_tasks(3), &user_x(), ts(9, 0))
        .expect("create");
    let tasks = store.assignment_tasks(created.assignment.id).expect("tasks");
    store
        .start_task(tasks[0].id, &user_x(), None, &no_props(), ts(9, 10))
        .expect("start");
    let before = store.assignment("A1").expect("load").expect("A1");
    let audits_before = store.assignment_audit_trail(before.id).expect("trail").len();

    let err = store
        .reset_assignment("A1", &user_x(), ts(9, 20))
        .expect_err("started task blocks reset");
    assert!(matches!(err, ManagerError::Conflict(_)));
    assert_eq!(store.assignment("A1").expect("load").expect("A1"), before);
    assert_eq!(
        store.assignment_audit_trail(before.id).expect("trail").len(),
        audits_before
    );
    let err = store
        .delete_assignment("A1", &user_x(), ts(9, 21))
        .expect_err("started task blocks delete");
    assert_eq!(err.status_code(), 409);
}

#[test]
fn every_transition_leaves_one_audit_record() {
    let mut store = AssignmentStore::open_in_memory_with(context()).expect("open db");
    let project_id = seed(&mut store, "demo", 1);
    let task_id = store.project_tasks(project_id).expect("tasks")[0].id;
    store
        .create_assignment(&NewAssignment::for_project("demo").named("A1").with_tasks(1), &user_x(), ts(9, 0))
        .expect("create");
    store
        .start_task(task_id, &user_x(), None, &no_props(), ts(9, 10))
        .expect("start");
    store
        .complete_task(task_id, &user_x(), None, &no_props(), ts(9, 40))
        .expect("complete");

    let labels = store
        .task_audit_trail(task_id)
        .expect("trail")
        .into_iter()
        .map(|record| record.disposition)
        .collect::<Vec<_>>();
    assert_eq!(
        labels,
        vec![AUDIT_INSERTED, AUDIT_ASSIGNED, "In progress", DISPOSITION_COMPLETE]
    );
    assert_eq!(
        store.task(task_id).expect("load").expect("task").state(),
        TaskState::Completed
    );
}

#[test]
fn keys_stay_unique_per_project_across_generation_paths() {
    let mut store = AssignmentStore::open_in_memory_with(context()).expect("open db");
    let demo = seed(&mut store, "demo", 3);
    let other = seed(&mut store, "other", 3);
    for _ in 0..2 {
        let report = store
            .generate_tasks(
                demo,
                &[CandidateKey::new("1"), CandidateKey::new("4")],
                Protocol::Cleave.definition(),
                true,
                "admin",
                ts(9, 0),
            )
            .expect("generate");
        assert!(report.inserted <= 1);
    }
    let keys = store
        .project_tasks(demo)
        .expect("tasks")
        .into_iter()
        .map(|task| task.key_text)
        .collect::<Vec<_>>();
    let distinct = keys.iter().collect::<HashSet<_>>();
    assert_eq!(keys.len(), 4);
    assert_eq!(distinct.len(), 4);
    assert_eq!(store.project_tasks(other).expect("tasks").len(), 3);
    assert_eq!(store.search_tasks("body_id", "1").expect("search").len(), 2);
}

#[test]
fn concurrent_creates_never_claim_a_task_twice() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("assignments.db");
    let ctx = context().with_policy(ManagerPolicy {
        allow_partial_assignments: true,
        ..ManagerPolicy::default()
    });
    {
        let mut store = AssignmentStore::open_with(&path, ctx.clone()).expect("open db");
        seed(&mut store, "demo", 12);
    }

    let workers = (0..4)
        .map(|n| {
            let path = path.clone();
            let ctx = ctx.clone();
            thread::spawn(move || {
                let mut store = AssignmentStore::open_with(&path, ctx).expect("open db");
                store.create_assignment(
                    &NewAssignment::for_project("demo")
                        .named(&format!("worker-{n}"))
                        .with_tasks(5),
                    &user_x(),
                    ts(9, n),
                )
            })
        })
        .collect::<Vec<_>>();

    let mut claimed = 0;
    for worker in workers {
        match worker.join().expect("worker thread") {
            Ok(created) => claimed += created.tasks,
            Err(err) => assert!(matches!(err, ManagerError::Conflict(_)), "unexpected {err:?}"),
        }
    }
    assert_eq!(claimed, 12);

    let store = AssignmentStore::open_with(&path, ctx).expect("reopen");
    let project = store.project("demo").expect("load").expect("demo");
    let tasks = store.project_tasks(project.id).expect("tasks");
    assert!(tasks.iter().all(|task| task.assignment_id.is_some()));
    for task in &tasks {
        let assigned = store
            .task_audit_trail(task.id)
            .expect("trail")
            .into_iter()
            .filter(|record| record.disposition == AUDIT_ASSIGNED)
            .count();
        assert_eq!(assigned, 1, "task {} claimed more than once", task.id);
    }
}
