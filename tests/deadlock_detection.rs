mod common;

use common::{locks, service, wait_for_blocked};
use std::sync::mpsc;
use std::thread;
use worklease::error::LockError;
use worklease::locking::{
    BuildIdentifier, DeadlockReport, ProjectPath, ThreadHandle, WorkerLeaseService,
};

fn root() -> BuildIdentifier {
    BuildIdentifier::root()
}

fn expect_deadlock(result: worklease::error::Result<()>) -> DeadlockReport {
    match result {
        Err(LockError::Deadlock(report)) => report,
        Err(other) => panic!("expected a deadlock, got {other}"),
        Ok(()) => panic!("expected a deadlock, but the locks were acquired"),
    }
}

/// Runs `first` on a thread named `waiter` and `second` on the calling thread once the
/// waiter is blocked. The waiter's result is returned after `second` cleaned up.
fn with_blocked_waiter<R: Send>(
    service: &WorkerLeaseService,
    first: impl FnOnce() -> R + Send,
    second: impl FnOnce(),
) -> R {
    thread::scope(|scope| {
        let waiter = thread::Builder::new()
            .name("waiter".to_string())
            .spawn_scoped(scope, first)
            .unwrap();
        wait_for_blocked(service, 1);
        second();
        waiter.join().unwrap()
    })
}

#[test]
fn crossed_project_locks_are_reported() {
    let service = service(4);
    let a = locks([&service.project_lock(&root(), &ProjectPath::new(":a"))]);
    let b = locks([&service.project_lock(&root(), &ProjectPath::new(":b"))]);
    service.acquire_locks(&b).unwrap();

    let waited = with_blocked_waiter(
        &service,
        || {
            service.acquire_locks(&a).unwrap();
            let result = service.acquire_locks(&b);
            service.release_locks(&a).unwrap();
            service.release_locks(&b).unwrap();
            result
        },
        || {
            let report = expect_deadlock(service.acquire_locks(&a));
            let names: Vec<String> = report
                .threads()
                .iter()
                .map(|thread| thread.name().to_string())
                .collect();
            assert_eq!(names.len(), 2);
            assert_eq!(names[0], ThreadHandle::current().name());
            assert_eq!(names[1], "waiter");
            assert!(
                report
                    .to_string()
                    .contains("Thread 'waiter' is trying to get a lock on state of project :b")
            );
            // Giving up our lock lets the waiter finish.
            service.release_locks(&b).unwrap();
        },
    );

    assert!(waited.is_ok());
    assert!(service.current_project_locks().is_empty());
    assert_eq!(service.blocked_thread_count(), 0);
}

#[test]
fn lease_pool_and_project_lock_cycle_is_reported() {
    let service = service(1);
    let app = locks([&service.project_lock(&root(), &ProjectPath::new(":app"))]);
    service.acquire_locks(&app).unwrap();

    let waited = with_blocked_waiter(
        &service,
        || {
            service
                .run_as_worker_thread(|| {
                    service.acquire_locks(&app)?;
                    service.release_locks(&app)
                })
                .and_then(|result| result)
        },
        || {
            let lease = [service.worker_lease()];
            let report = expect_deadlock(service.acquire_locks(&lease));
            let edges = report.edges();
            assert_eq!(edges.len(), 2);
            assert_eq!(edges[0].thread, ThreadHandle::current());
            assert_eq!(edges[0].lock, "worker lease");
            assert_eq!(edges[0].holders[0].name(), "waiter");
            assert_eq!(edges[1].thread.name(), "waiter");
            assert_eq!(edges[1].lock, "state of project :app in build :");
            assert_eq!(edges[1].holders, vec![ThreadHandle::current()]);
            service.release_locks(&app).unwrap();
        },
    );

    assert!(waited.is_ok());
    assert!(service.current_worker_leases().is_empty());
}

#[test]
fn exhausted_shared_resource_cycle_is_reported() {
    let service = service(4);
    service.register_shared_resource("db", 2).unwrap();
    let app = locks([&service.project_lock(&root(), &ProjectPath::new(":app"))]);
    service.acquire_locks(&app).unwrap();

    let waited = with_blocked_waiter(
        &service,
        || {
            let db = [service.shared_resource_lock("db", 2)?];
            service.with_locks(&db, || service.with_locks(&app, || ()))?
        },
        || {
            let one = [service.shared_resource_lock("db", 1).unwrap()];
            let report = expect_deadlock(service.acquire_locks(&one));
            assert_eq!(report.edges()[0].lock, "lease of shared resource db");
            service.release_locks(&app).unwrap();
        },
    );

    assert!(waited.is_ok());
    let db = service.shared_resources().resource("db").unwrap();
    assert_eq!(db.available_permits(), 2);
}

#[test]
fn waiting_on_a_running_thread_is_not_a_deadlock() {
    let service = service(1);
    let app = locks([&service.project_lock(&root(), &ProjectPath::new(":app"))]);
    service.acquire_locks(&app).unwrap();

    // The waiter holds the only lease, but we never ask for one.
    let waited = with_blocked_waiter(
        &service,
        || {
            service
                .run_as_worker_thread(|| service.with_locks(&app, || ()))
                .and_then(|result| result)
        },
        || service.release_locks(&app).unwrap(),
    );

    assert!(waited.is_ok());
}

#[test]
fn self_deadlock_on_single_worker_pool() {
    let service = service(1);
    service
        .run_as_worker_thread(|| {
            let second = [service.worker_lease()];
            let report = expect_deadlock(service.acquire_locks(&second));
            assert_eq!(report.threads(), vec![ThreadHandle::current()]);
        })
        .unwrap();
    assert_eq!(service.blocked_thread_count(), 0);
}

#[test]
fn cycle_is_found_when_a_lease_holder_blocks_last() {
    let service = service(2);
    let app = locks([&service.project_lock(&root(), &ProjectPath::new(":app"))]);
    let lease = [service.worker_lease()];
    service.acquire_locks(&lease).unwrap();
    let (held_tx, held_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();

    thread::scope(|scope| {
        let owner = thread::Builder::new()
            .name("owner".to_string())
            .spawn_scoped(scope, || {
                let go_rx = go_rx;
                service.acquire_locks(&app).unwrap();
                held_tx.send(()).unwrap();
                go_rx.recv().unwrap();
                service.run_as_worker_thread(|| ()).unwrap();
                service.release_locks(&app).unwrap();
            })
            .unwrap();
        held_rx.recv().unwrap();

        let early = thread::Builder::new()
            .name("early".to_string())
            .spawn_scoped(scope, || {
                service
                    .run_as_worker_thread(|| service.with_locks(&app, || ()))
                    .and_then(|result| result)
            })
            .unwrap();
        wait_for_blocked(&service, 1);

        // The pool is full once the owner asks for a lease, but our lease is still running.
        go_tx.send(()).unwrap();
        wait_for_blocked(&service, 2);

        let report = expect_deadlock(service.acquire_locks(&app));
        let edges = report.edges();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].thread, ThreadHandle::current());
        assert_eq!(edges[0].lock, "state of project :app in build :");
        assert_eq!(edges[0].holders[0].name(), "owner");
        assert_eq!(edges[1].lock, "worker lease");
        assert!(edges[1].holders.contains(&ThreadHandle::current()));
        assert_eq!(report.threads().len(), 3);

        service.release_locks(&lease).unwrap();
        owner.join().unwrap();
        assert!(early.join().unwrap().is_ok());
    });

    assert_eq!(service.blocked_thread_count(), 0);
    assert!(service.current_worker_leases().is_empty());
}
