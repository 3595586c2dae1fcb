//! End-to-end exam scenarios
//!
//! Teacher and students run on threads of this process, each with its own
//! mapping of the arena and its own owner id, in a namespace private to the
//! test.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use examhall::arena::SlotView;
use examhall::logsink::{LogSink, Role};
use examhall::protocol::{self, Delivery, Registration};
use examhall::{
    AttemptChannels, Coordinator, CoordinatorConfig, NamedSemaphore, Names, SENTINEL_GRADE, Session, SharedArena,
    Step, Student, StudentConfig, StudentOutcome,
};

const POLL: Duration = Duration::from_millis(20);

fn unique_names() -> Names {
    let id = uuid::Uuid::now_v7().simple().to_string();
    Names::new(format!("it{}", &id[id.len() - 12..])).unwrap()
}

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        poll_interval: POLL,
        ack_timeout: Duration::from_secs(2),
        drain_timeout: Duration::from_secs(2),
        lock_probe: Duration::from_millis(50),
        max_students: None,
    }
}

fn teacher(names: &Names, capacity: u32, grader: impl FnMut(&SlotView) -> i32 + Send + 'static) -> Coordinator {
    Coordinator::create(
        names,
        capacity,
        LogSink::disabled(Role::Teacher, 1),
        grader,
        fast_config(),
    )
    .unwrap()
}

fn student(names: &Names, owner: u32) -> Student {
    let session = Session::new(
        SharedArena::attach(names).unwrap(),
        LogSink::disabled(Role::Student, owner),
    );
    Student::new(
        session,
        StudentConfig {
            owner,
            poll_interval: POLL,
            prep_ms: 0..=0,
            ticket_max: 100,
        },
    )
}

fn active_count(coordinator: &Coordinator) -> u32 {
    coordinator
        .session()
        .arena()
        .with_table_lock(|t| t.active_count())
        .unwrap()
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn assert_no_names_left(names: &Names) {
    assert!(SharedArena::attach(names).unwrap_err().is_not_found());
    assert!(NamedSemaphore::open(&names.table_lock()).unwrap_err().is_not_found());
    assert!(NamedSemaphore::open(&names.work_ready()).unwrap_err().is_not_found());
}

#[test]
fn test_each_student_receives_its_own_grade() {
    let names = unique_names();
    let mut coordinator = Coordinator::create(
        &names,
        4,
        LogSink::disabled(Role::Teacher, 1),
        |slot: &SlotView| slot.ticket as i32,
        fast_config().with_max_students(Some(4)),
    )
    .unwrap();

    let workers: Vec<_> = (0..4u32)
        .map(|i| {
            let student = student(&names, 100 + i);
            let ticket = 10 + i;
            thread::spawn(move || student.run_with_ticket(ticket, Duration::ZERO).unwrap())
        })
        .collect();

    let teacher_thread = thread::spawn(move || {
        let summary = coordinator.run().unwrap();
        (summary, coordinator.teardown().unwrap())
    });

    for (i, worker) in workers.into_iter().enumerate() {
        let ticket = 10 + i as u32;
        assert_eq!(
            worker.join().unwrap(),
            StudentOutcome::Graded {
                ticket,
                grade: ticket as i32
            }
        );
    }

    let (summary, teardown) = teacher_thread.join().unwrap();
    assert_eq!(summary.processed, 4);
    assert!(summary.shutdown.first_request);
    assert!(teardown.swept.is_empty());
    assert_eq!(teardown.final_active, 0);
    assert_no_names_left(&names);
}

#[test]
fn test_single_slot_rejects_second_student() {
    let names = unique_names();
    let coordinator = teacher(&names, 1, |_: &SlotView| 5);

    let (tx, rx) = mpsc::channel();
    for owner in [1u32, 2] {
        let student = student(&names, owner);
        let tx = tx.clone();
        thread::spawn(move || {
            let outcome = student.run_with_ticket(owner, Duration::ZERO).unwrap();
            tx.send(outcome).unwrap();
        });
    }

    let first = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(matches!(first, StudentOutcome::NoFreeSlot { .. }), "got {:?}", first);
    assert_eq!(active_count(&coordinator), 1);

    protocol::shutdown(coordinator.session()).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(matches!(second, StudentOutcome::Terminated { .. }), "got {:?}", second);

    let teardown = coordinator.teardown().unwrap();
    assert_eq!(teardown.final_active, 0);
    assert_no_names_left(&names);
}

#[test]
fn test_shutdown_mid_grading_resolves_every_pending_slot() {
    let names = unique_names();
    let grading = Arc::new(AtomicBool::new(false));
    let grading_flag = Arc::clone(&grading);
    let mut coordinator = teacher(&names, 3, move |_: &SlotView| {
        grading_flag.store(true, Ordering::Release);
        thread::sleep(Duration::from_millis(300));
        4
    });
    let handle = coordinator.shutdown_handle();

    // Five students race for three slots before the teacher starts grading
    let (tx, rx) = mpsc::channel();
    for owner in 0..5u32 {
        let student = student(&names, 200 + owner);
        let tx = tx.clone();
        thread::spawn(move || {
            let outcome = student.run_with_ticket(owner + 1, Duration::ZERO).unwrap();
            tx.send(outcome).unwrap();
        });
    }
    let rejected: Vec<_> = (0..2).map(|_| rx.recv_timeout(Duration::from_secs(10)).unwrap()).collect();
    assert!(rejected.iter().all(|o| matches!(o, StudentOutcome::NoFreeSlot { .. })));
    wait_for(|| active_count(&coordinator) == 3);

    let teacher_thread = thread::spawn(move || {
        let summary = coordinator.run().unwrap();
        (summary, coordinator)
    });
    wait_for(|| grading.load(Ordering::Acquire));
    handle.request();

    let (summary, coordinator) = teacher_thread.join().unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.shutdown.notified.len(), 3);

    let terminated: Vec<_> = (0..3).map(|_| rx.recv_timeout(Duration::from_secs(10)).unwrap()).collect();
    assert!(
        terminated
            .iter()
            .all(|o| matches!(o, StudentOutcome::Terminated { .. })),
        "got {:?}",
        terminated
    );
    assert_eq!(active_count(&coordinator), 0);

    let teardown = coordinator.teardown().unwrap();
    assert!(teardown.swept.is_empty());
    assert_no_names_left(&names);
}

#[test]
fn test_repeated_shutdown_notifies_once() {
    let names = unique_names();
    let mut coordinator = teacher(&names, 2, |_: &SlotView| 5);
    let student_session = Session::new(SharedArena::attach(&names).unwrap(), LogSink::disabled(Role::Student, 9));
    let channels = AttemptChannels::create(&names).unwrap();
    let Registration::Registered(claim) = protocol::register(&student_session, 9, 1, &channels).unwrap() else {
        panic!("expected a claim");
    };

    let handle = coordinator.shutdown_handle();
    handle.request();
    handle.request();
    let summary = coordinator.run().unwrap();
    let again = protocol::shutdown(coordinator.session()).unwrap();

    assert!(summary.shutdown.first_request);
    assert_eq!(summary.shutdown.notified, vec![claim.index]);
    assert!(!again.first_request);
    assert_eq!(channels.grade.value().unwrap(), 1);
    assert_eq!(student_session.arena().read_grade(claim.index).unwrap(), SENTINEL_GRADE);

    assert!(protocol::abandon(&student_session, claim).unwrap());
    drop(channels);
    drop(student_session);
    coordinator.teardown().unwrap();
    assert_no_names_left(&names);
}

#[test]
fn test_killed_student_slot_is_recovered() {
    let names = unique_names();
    let mut coordinator = teacher(&names, 2, |_: &SlotView| 5);

    let student_session = Session::new(SharedArena::attach(&names).unwrap(), LogSink::disabled(Role::Student, 7));
    let channels = AttemptChannels::create(&names).unwrap();
    assert!(matches!(
        protocol::register(&student_session, 7, 3, &channels).unwrap(),
        Registration::Registered(_)
    ));
    // The student dies: its process-owned names and mapping disappear
    drop(channels);
    drop(student_session);

    let step = coordinator.step().unwrap();
    let Step::Graded(report) = step else {
        panic!("expected a grading step, got {:?}", step);
    };
    assert_eq!(report.delivery, Delivery::PeerVanished);
    assert!(report.released);
    assert_eq!(active_count(&coordinator), 0);
    coordinator
        .session()
        .arena()
        .with_table_lock(|t| t.audit())
        .unwrap()
        .unwrap();

    coordinator.teardown().unwrap();
    assert_no_names_left(&names);
}

#[test]
fn test_teardown_leaves_no_live_names() {
    let names = unique_names();
    let coordinator = teacher(&names, 8, |_: &SlotView| 5);
    assert_eq!(coordinator.ledger().live().len(), 3);

    let report = coordinator.teardown().unwrap();
    assert_eq!(report.final_active, 0);
    assert_no_names_left(&names);
}
