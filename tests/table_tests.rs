use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use procyard::{ProcessRecord, ProcessStatus, ProcessTable, TableError, TransportKind};
use std::process;

/// Run `body` in a forked process and return its exit code
fn in_child<F: FnOnce() -> i32>(body: F) -> i32 {
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => match waitpid(child, None).unwrap() {
            WaitStatus::Exited(_, code) => code,
            other => panic!("child ended with {:?}", other),
        },
        Ok(ForkResult::Child) => process::exit(body()),
        Err(e) => panic!("fork failed: {}", e),
    }
}

fn running(pid: i32, name: &str) -> ProcessRecord {
    let mut record = ProcessRecord::new(pid, name, TransportKind::Tcp).with_metadata("port", 8080);
    record.status = ProcessStatus::Running;
    record
}

#[test]
fn test_child_write_is_visible_to_parent() {
    let table = ProcessTable::new(4).unwrap();

    let code = in_child(|| match table.put(&running(4242, "child-written")) {
        Ok(()) => 0,
        Err(_) => 1,
    });
    assert_eq!(code, 0);

    let record = table.get(4242).unwrap();
    assert_eq!(record.name, "child-written");
    assert_eq!(record.status, ProcessStatus::Running);
    assert_eq!(record.port(), Some(8080));
}

#[test]
fn test_parent_write_is_visible_to_child() {
    let table = ProcessTable::new(4).unwrap();
    table.put(&running(7, "parent-written")).unwrap();

    let code = in_child(|| match table.get(7) {
        Some(record) if record.name == "parent-written" => 0,
        _ => 1,
    });
    assert_eq!(code, 0);

    // Removal in the child is seen by the parent too
    let code = in_child(|| if table.remove(7).is_some() { 0 } else { 1 });
    assert_eq!(code, 0);
    assert!(table.is_empty());
}

#[test]
fn test_concurrent_processes_share_capacity() {
    let table = ProcessTable::new(8).unwrap();

    let children: Vec<Pid> = (0..4)
        .map(|n| match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => child,
            Ok(ForkResult::Child) => {
                let base = 1000 + n * 10;
                let ok = (0..2).all(|i| table.put(&running(base + i, "worker")).is_ok());
                process::exit(if ok { 0 } else { 1 });
            }
            Err(e) => panic!("fork failed: {}", e),
        })
        .collect();

    for child in children {
        assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
    }

    assert_eq!(table.len(), 8);
    assert!(matches!(
        table.put(&running(1, "one-too-many")),
        Err(TableError::Full { capacity: 8 })
    ));
}

#[test]
fn test_update_from_child() {
    let table = ProcessTable::new(2).unwrap();
    let mut record = ProcessRecord::new(55, "tcp-worker", TransportKind::Tcp);
    record.status = ProcessStatus::Starting;
    table.put(&record).unwrap();

    let code = in_child(|| {
        let updated = table.update(55, |r| {
            r.status = ProcessStatus::Running;
            r.metadata.insert("port".to_string(), 41235.into());
        });
        match updated {
            Ok(true) => 0,
            _ => 1,
        }
    });
    assert_eq!(code, 0);

    let record = table.get(55).unwrap();
    assert!(record.is_running());
    assert_eq!(record.port(), Some(41235));
}
